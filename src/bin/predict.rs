//! Query-serving CLI
//!
//! Loads a trained state (model + groups) and answers a query stream:
//!
//! ```text
//! predict --model-in model --groups-in groups \
//!         --queries-in queries --results-out results [--mode predict|score]
//! ```
//!
//! Each query is answered independently; schema violations are reported in
//! the per-query result and processing continues.

#![forbid(unsafe_code)]

use std::env;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing_subscriber::EnvFilter;

use crosscat::{Engine, TracingSink};

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

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();
    let model_in = parse_path(&args, "--model-in").context("--model-in is required")?;
    let groups_in = parse_path(&args, "--groups-in");
    let queries_in = parse_path(&args, "--queries-in").context("--queries-in is required")?;
    let results_out = parse_path(&args, "--results-out").context("--results-out is required")?;
    let mode = parse_flag(&args, "--mode").unwrap_or_else(|| "predict".to_string());
    let seed = parse_flag(&args, "--seed")
        .map(|s| s.parse::<u64>())
        .transpose()
        .context("--seed expects an integer")?
        .unwrap_or(0);

    let mut engine = Engine::load(
        &model_in,
        groups_in.as_deref(),
        None,
        1,
        Box::new(TracingSink),
    )?;

    match mode.as_str() {
        "predict" => {
            let mut rng = StdRng::seed_from_u64(seed);
            engine.predict(&mut rng, &queries_in, &results_out)?;
        }
        "score" => engine.score(&queries_in, &results_out)?,
        other => bail!("unknown --mode {:?} (predict | score)", other),
    }
    Ok(())
}
