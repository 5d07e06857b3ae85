//! Streaming inference CLI
//!
//! Loads a model (and optionally groups/assignments), runs single- or
//! multi-pass inference over a row stream, and dumps the resulting state:
//!
//! ```text
//! infer --model-in model --rows-in rows --mode multi \
//!       --cat-extra-passes 4 --kind-extra-passes 16 \
//!       --ephemeral-kind-count 4 --iterations 10 --max-reject-iters 100 \
//!       --parallel 8 --model-out model.out --groups-out groups.out
//! ```
//!
//! Logging goes through `tracing`; set `RUST_LOG=crosscat=info` to see the
//! per-batch metrics records.

#![forbid(unsafe_code)]

use std::env;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing_subscriber::EnvFilter;

use crosscat::{Engine, InferConfig, TracingSink};

fn parse_flag(args: &[String], key: &str) -> Option<String> {
    let mut it = args.iter();
    while let Some(a) = it.next() {
        if a == key {
            return it.next().cloned();
        }
    }
    None
}

fn parse_path(args: &[String], key: &str) -> Option<PathBuf> {
    parse_flag(args, key).map(PathBuf::from)
}

fn parse_f64(args: &[String], key: &str, default: f64) -> Result<f64> {
    match parse_flag(args, key) {
        Some(s) => s.parse().with_context(|| format!("{} expects a number", key)),
        None => Ok(default),
    }
}

fn parse_usize(args: &[String], key: &str, default: usize) -> Result<usize> {
    match parse_flag(args, key) {
        Some(s) => s.parse().with_context(|| format!("{} expects an integer", key)),
        None => Ok(default),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();
    let model_in = parse_path(&args, "--model-in").context("--model-in is required")?;
    let rows_in = parse_path(&args, "--rows-in").context("--rows-in is required")?;
    let groups_in = parse_path(&args, "--groups-in");
    let assign_in = parse_path(&args, "--assign-in");
    let mode = parse_flag(&args, "--mode").unwrap_or_else(|| "multi".to_string());

    let empty_group_count = parse_usize(&args, "--empty-group-count", 1)?;
    let seed = parse_usize(&args, "--seed", 0)? as u64;
    let mut rng = StdRng::seed_from_u64(seed);

    let mut engine = Engine::load(
        &model_in,
        groups_in.as_deref(),
        assign_in.as_deref(),
        empty_group_count,
        Box::new(TracingSink),
    )?;

    match mode.as_str() {
        "single" => {
            let assign_out = parse_path(&args, "--assign-out");
            engine.infer_single_pass(&mut rng, &rows_in, assign_out.as_deref())?;
        }
        "multi" => {
            let config = InferConfig {
                cat_extra_passes: parse_f64(&args, "--cat-extra-passes", 1.0)?,
                kind_extra_passes: parse_f64(&args, "--kind-extra-passes", 0.0)?,
                ephemeral_kind_count: parse_usize(&args, "--ephemeral-kind-count", 1)?,
                iterations: parse_usize(&args, "--iterations", 1)?,
                max_reject_iters: parse_usize(&args, "--max-reject-iters", 1)?,
                parallel: parse_usize(&args, "--parallel", 0)?,
            };
            engine.infer_multi_pass(&mut rng, &rows_in, &config)?;
        }
        "posterior-enum" => {
            let samples_out =
                parse_path(&args, "--samples-out").context("--samples-out is required")?;
            let sample_count = parse_usize(&args, "--sample-count", 1)?;
            let sample_skip = parse_usize(&args, "--sample-skip", 1)?;
            let kind_structure = match parse_usize(&args, "--ephemeral-kind-count", 0)? {
                0 => None,
                ephemeral => Some((ephemeral, parse_usize(&args, "--iterations", 1)?)),
            };
            engine.posterior_enum(
                &mut rng,
                &rows_in,
                &samples_out,
                sample_count,
                sample_skip,
                kind_structure,
            )?;
        }
        other => bail!("unknown --mode {:?} (single | multi | posterior-enum)", other),
    }

    let model_out = parse_path(&args, "--model-out");
    let groups_out = parse_path(&args, "--groups-out");
    let dump_assign_out = parse_path(&args, "--dump-assign-out");
    engine.dump(
        model_out.as_deref(),
        groups_out.as_deref(),
        dump_assign_out.as_deref(),
    )?;
    Ok(())
}
