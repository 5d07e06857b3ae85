//! Inference engine
//!
//! The orchestrator that couples the kind set, the assignment store, the
//! streaming row interval, the annealing schedule, and the kind-structure
//! kernel into the top-level loops:
//!
//! - single-pass add (terminal on EOF, optionally recording assignments),
//! - multi-pass row-only inference,
//! - multi-pass row + kind-structure inference,
//! - posterior enumeration over an in-memory row set,
//! - predict and score services over query streams.
//!
//! A duplicate row id during a streaming add halts the active loop cleanly
//! (the cyclic reader has lapped the working set, so every row is assigned).
//! Invariant violations panic with a diagnostic. The engine logs one metrics
//! record per batch boundary through the injected sink and never touches a
//! global logger.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::assignments::Assignments;
use crate::cross_cat::{CrossCat, ModelDump};
use crate::kernel::{KernelConfig, KindKernel};
use crate::metrics::{
    IterMetrics, IterSummary, KernelStatus, KindHypers, MetricsSink, ModelHypers, Timers,
};
use crate::models::{log_sum_exp, scores_to_probs};
use crate::pool::TaskAction;
use crate::rows::{
    read_records, AssignmentRecord, PosteriorKind, PosteriorSample, PredictQuery, PredictResult,
    RecordReader, RecordWriter, RowIoError, RowRecord, ScoreQuery, ScoreResult, StreamInterval,
};
use crate::schema::ProductValue;
use crate::schedule::{Action, BatchedAnnealingSchedule};

// ============================================================================
// Configuration
// ============================================================================

/// Semantic inference parameters (the CLI maps flags onto this).
#[derive(Clone, Debug)]
pub struct InferConfig {
    /// Extra annealing passes for row-only inference.
    pub cat_extra_passes: f64,
    /// Extra annealing passes for the kind-structure phase.
    pub kind_extra_passes: f64,
    /// Ephemeral kinds kept available during kind-structure sweeps.
    pub ephemeral_kind_count: usize,
    /// Feature-reassignment sweeps per batch.
    pub iterations: usize,
    /// Consecutive zero-change batches before the chain counts as stalled.
    pub max_reject_iters: usize,
    /// Kind worker threads (0 = inline sequential).
    pub parallel: usize,
}

impl Default for InferConfig {
    fn default() -> Self {
        InferConfig {
            cat_extra_passes: 1.0,
            kind_extra_passes: 0.0,
            ephemeral_kind_count: 1,
            iterations: 1,
            max_reject_iters: 1,
            parallel: 0,
        }
    }
}

/// Invalid inference parameters.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("extra passes must be finite and nonnegative")]
    NegativeExtraPasses,
    #[error("at least one of cat_extra_passes / kind_extra_passes must be positive")]
    NoPasses,
    #[error("kind-structure inference requires {0} >= 1")]
    MissingKindParameter(&'static str),
}

impl InferConfig {
    /// Check the parameter contract.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for &passes in &[self.cat_extra_passes, self.kind_extra_passes] {
            if !passes.is_finite() || passes < 0.0 {
                return Err(ConfigError::NegativeExtraPasses);
            }
        }
        if self.cat_extra_passes + self.kind_extra_passes <= 0.0 {
            return Err(ConfigError::NoPasses);
        }
        if self.kind_extra_passes > 0.0 {
            if self.ephemeral_kind_count == 0 {
                return Err(ConfigError::MissingKindParameter("ephemeral_kind_count"));
            }
            if self.iterations == 0 {
                return Err(ConfigError::MissingKindParameter("iterations"));
            }
            if self.max_reject_iters == 0 {
                return Err(ConfigError::MissingKindParameter("max_reject_iters"));
            }
        }
        Ok(())
    }
}

/// Engine-level failures.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Io(#[from] RowIoError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(
        "sample_skip must be positive when sample_count > 1: without intervening \
         sweeps every sample would be the same assignment, defeating diversity"
    )]
    ZeroDiversity,
}

// ============================================================================
// Engine
// ============================================================================

/// The streaming cross-categorization inference engine.
pub struct Engine {
    empty_group_count: usize,
    cross_cat: CrossCat,
    assignments: Assignments,
    partial_values: Vec<ProductValue>,
    scores: Vec<f64>,
    groupids_scratch: Vec<u64>,
    timers: Timers,
    sink: Box<dyn MetricsSink>,
}

impl Engine {
    /// Build an engine from an in-memory model with empty mixtures.
    pub fn from_model(
        dump: ModelDump,
        empty_group_count: usize,
        sink: Box<dyn MetricsSink>,
    ) -> Engine {
        assert!(empty_group_count > 0, "need at least one empty group");
        let cross_cat = CrossCat::from_model(dump, empty_group_count);
        let assignments = Assignments::init(cross_cat.kind_count());
        let mut engine = Engine {
            empty_group_count,
            cross_cat,
            assignments,
            partial_values: Vec::new(),
            scores: Vec::new(),
            groupids_scratch: Vec::new(),
            timers: Timers::default(),
            sink,
        };
        engine.timers.get("total").start();
        engine.validate();
        engine
    }

    /// Load an engine from persisted streams: the model (required), the
    /// groups and assignments (optional).
    pub fn load(
        model_in: &Path,
        groups_in: Option<&Path>,
        assign_in: Option<&Path>,
        empty_group_count: usize,
        sink: Box<dyn MetricsSink>,
    ) -> Result<Engine, EngineError> {
        assert!(empty_group_count > 0, "need at least one empty group");
        let mut cross_cat = CrossCat::load_model(model_in, empty_group_count)?;
        assert!(cross_cat.kind_count() > 0, "no kinds, model is empty");
        if let Some(groups_in) = groups_in {
            cross_cat.load_groups(groups_in, empty_group_count)?;
        }
        let assignments = match assign_in {
            Some(assign_in) => {
                let records: Vec<AssignmentRecord> = read_records(assign_in)?;
                let store = Assignments::from_records(cross_cat.kind_count(), &records);
                for kind in &cross_cat.kinds {
                    assert!(
                        store.row_count() <= kind.mixture.count_rows(),
                        "assignments cover more rows than the mixtures hold"
                    );
                }
                store
            }
            None => Assignments::init(cross_cat.kind_count()),
        };

        let mut engine = Engine {
            empty_group_count,
            cross_cat,
            assignments,
            partial_values: Vec::new(),
            scores: Vec::new(),
            groupids_scratch: Vec::new(),
            timers: Timers::default(),
            sink,
        };
        engine.timers.get("total").start();
        engine.validate();
        Ok(engine)
    }

    /// Persist the current state; each stream is optional.
    pub fn dump(
        &self,
        model_out: Option<&Path>,
        groups_out: Option<&Path>,
        assign_out: Option<&Path>,
    ) -> Result<(), EngineError> {
        if let Some(path) = model_out {
            self.cross_cat.dump_model(path)?;
        }
        if let Some(path) = groups_out {
            self.cross_cat.dump_groups(path)?;
        }
        if let Some(path) = assign_out {
            let remap = self.cross_cat.group_remap();
            let records = self.assignments.dump_records(&remap);
            crate::rows::write_records(path, &records)?;
        }
        Ok(())
    }

    /// The kind set.
    pub fn cross_cat(&self) -> &CrossCat {
        &self.cross_cat
    }

    /// The assignment store.
    pub fn assignments(&self) -> &Assignments {
        &self.assignments
    }

    /// Rows present in the mixtures but absent from the assignment store
    /// (single-pass adds are deliberately untracked).
    pub fn count_untracked_rows(&self) -> usize {
        assert!(!self.cross_cat.kinds.is_empty());
        let total = self.cross_cat.kinds[0].mixture.count_rows();
        let assigned = self.assignments.row_count();
        assert!(assigned <= total, "assignments exceed mixture rows");
        total - assigned
    }

    /// Structural consistency check across all components.
    pub fn validate(&self) {
        self.cross_cat.validate();
        self.assignments.validate();
        assert_eq!(self.cross_cat.kind_count(), self.assignments.kind_count());
    }

    // ------------------------------------------------------------------
    // Row operations
    // ------------------------------------------------------------------

    /// Seat a row in every kind without tracking it in the store.
    pub fn add_row_noassign(&mut self, rng: &mut StdRng, row: &RowRecord) {
        self.cross_cat.value_split(&row.value, &mut self.partial_values);
        for (kindid, kind) in self.cross_cat.kinds.iter_mut().enumerate() {
            let partial = &self.partial_values[kindid];
            let groupid = kind
                .mixture
                .score_and_sample(&kind.model, partial, &mut self.scores, rng);
            kind.mixture.add_value(&kind.model, groupid, partial);
        }
    }

    /// Seat a row in every kind and report the sampled assignment, without
    /// tracking it in the store.
    pub fn add_row(&mut self, rng: &mut StdRng, row: &RowRecord) -> AssignmentRecord {
        self.cross_cat.value_split(&row.value, &mut self.partial_values);
        let mut groupids = Vec::with_capacity(self.cross_cat.kind_count());
        for (kindid, kind) in self.cross_cat.kinds.iter_mut().enumerate() {
            let partial = &self.partial_values[kindid];
            let groupid = kind
                .mixture
                .score_and_sample(&kind.model, partial, &mut self.scores, rng);
            kind.mixture.add_value(&kind.model, groupid, partial);
            groupids.push(groupid as u32);
        }
        AssignmentRecord {
            rowid: row.id,
            groupids,
        }
    }

    /// Seat and track a row; `false` (no side effect) on a duplicate id.
    pub fn try_add_row(&mut self, rng: &mut StdRng, row: &RowRecord) -> bool {
        if self.assignments.contains(row.id) {
            return false;
        }
        self.cross_cat.value_split(&row.value, &mut self.partial_values);
        self.groupids_scratch.clear();
        let seed: u64 = rng.gen();
        for (kindid, kind) in self.cross_cat.kinds.iter_mut().enumerate() {
            let mut kind_rng = StdRng::seed_from_u64(seed.wrapping_add(kindid as u64));
            let partial = &self.partial_values[kindid];
            let groupid =
                kind.mixture
                    .score_and_sample(&kind.model, partial, &mut self.scores, &mut kind_rng);
            kind.mixture.add_value(&kind.model, groupid, partial);
            self.groupids_scratch
                .push(kind.mixture.id_tracker().packed_to_global(groupid));
        }
        let pushed = self.assignments.append_row(row.id, &self.groupids_scratch);
        debug_assert!(pushed, "duplicate slipped past the membership check");
        true
    }

    /// Evict the oldest tracked row; `row` supplies its payload so the
    /// mixtures subtract the right sufficient statistics.
    pub fn remove_row(&mut self, row: &RowRecord) {
        let (rowid, groupids) = self.assignments.pop_row();
        debug_assert_eq!(rowid, row.id, "remove cursor out of step");
        self.cross_cat.value_split(&row.value, &mut self.partial_values);
        for (kindid, kind) in self.cross_cat.kinds.iter_mut().enumerate() {
            let packed = kind.mixture.id_tracker().global_to_packed(groupids[kindid]);
            kind.mixture
                .remove_value(&kind.model, packed, &self.partial_values[kindid]);
        }
    }

    fn try_add_row_kinds(
        &mut self,
        kernel: &mut KindKernel,
        rng: &mut StdRng,
        row: &RowRecord,
    ) -> bool {
        if !self.assignments.try_push_rowid(row.id) {
            return false;
        }
        kernel.process_row(&self.cross_cat, TaskAction::Add, &row.value, rng);
        true
    }

    fn remove_row_kinds(&mut self, kernel: &mut KindKernel, rng: &mut StdRng, row: &RowRecord) {
        let rowid = self.assignments.pop_rowid();
        debug_assert_eq!(rowid, row.id, "remove cursor out of step");
        kernel.process_row(&self.cross_cat, TaskAction::Remove, &row.value, rng);
    }

    // ------------------------------------------------------------------
    // Top-level loops
    // ------------------------------------------------------------------

    /// Add every row of `rows_in` once, stopping at EOF; optionally record
    /// each sampled assignment to `assign_out`.
    pub fn infer_single_pass(
        &mut self,
        rng: &mut StdRng,
        rows_in: &Path,
        assign_out: Option<&Path>,
    ) -> Result<(), EngineError> {
        let mut reader = RecordReader::open(rows_in)?;
        match assign_out {
            Some(assign_out) => {
                let mut writer = RecordWriter::create(assign_out)?;
                while let Some(row) = reader.read_record::<RowRecord>()? {
                    let assignment = self.add_row(rng, &row);
                    writer.write_record(&assignment)?;
                }
                writer.flush()?;
            }
            None => {
                while let Some(row) = reader.read_record::<RowRecord>()? {
                    self.add_row_noassign(rng, &row);
                }
            }
        }
        Ok(())
    }

    /// Streaming multi-pass inference; runs the kind-structure phase first
    /// when `kind_extra_passes > 0`, then row-only annealing.
    pub fn infer_multi_pass(
        &mut self,
        rng: &mut StdRng,
        rows_in: &Path,
        config: &InferConfig,
    ) -> Result<(), EngineError> {
        config.validate()?;
        let mut interval = StreamInterval::open(rows_in, &self.assignments)?;
        let mut iter = 0;
        self.log_iter_metrics(iter, None);
        iter += 1;

        if config.kind_extra_passes > 0.0 {
            let mut kernel = KindKernel::prepare(
                &mut self.cross_cat,
                &mut self.assignments,
                KernelConfig {
                    ephemeral_kind_count: config.ephemeral_kind_count,
                    iterations: config.iterations,
                    max_reject_iters: config.max_reject_iters,
                    parallel: config.parallel,
                    empty_group_count: self.empty_group_count,
                },
                rng,
            );

            let extra = config.kind_extra_passes + config.cat_extra_passes;
            let mut schedule =
                BatchedAnnealingSchedule::new(extra, self.assignments.row_count());
            self.timers.get("cat").start();
            let halted = loop {
                match schedule.next_action() {
                    None => break false,
                    Some(Action::Add) => {
                        let row = interval.read_unassigned()?;
                        if !self.try_add_row_kinds(&mut kernel, rng, &row) {
                            break true;
                        }
                    }
                    Some(Action::Remove) => {
                        let row = interval.read_assigned()?;
                        self.remove_row_kinds(&mut kernel, rng, &row);
                    }
                    Some(Action::ProcessBatch) => {
                        self.timers.get("cat").stop();
                        self.timers.get("algo8").start();
                        kernel.run(&mut self.cross_cat, &self.assignments, rng);
                        let mixing = kernel.is_mixing();
                        self.timers.get("algo8").stop();
                        self.timers.get("hyper").start();
                        kernel.infer_hypers(&mut self.cross_cat, rng);
                        self.timers.get("hyper").stop();
                        self.log_iter_metrics_kernel(iter, &kernel);
                        iter += 1;
                        kernel.reset_status();
                        self.timers.get("cat").start();
                        if !mixing {
                            break false;
                        }
                    }
                }
            };
            self.timers.get("cat").stop();
            kernel.cleanup(&mut self.cross_cat, &mut self.assignments, rng);
            self.validate();
            if halted {
                return Ok(());
            }
        }

        let mut schedule =
            BatchedAnnealingSchedule::new(config.cat_extra_passes, self.assignments.row_count());
        self.timers.get("cat").start();
        loop {
            match schedule.next_action() {
                None => break,
                Some(Action::Add) => {
                    let row = interval.read_unassigned()?;
                    if !self.try_add_row(rng, &row) {
                        break;
                    }
                }
                Some(Action::Remove) => {
                    let row = interval.read_assigned()?;
                    self.remove_row(&row);
                }
                Some(Action::ProcessBatch) => {
                    self.timers.get("cat").stop();
                    self.timers.get("hyper").start();
                    self.cross_cat.infer_hypers(rng);
                    self.timers.get("hyper").stop();
                    self.log_iter_metrics(iter, None);
                    iter += 1;
                    self.timers.get("cat").start();
                }
            }
        }
        self.timers.get("cat").stop();
        self.validate();
        Ok(())
    }

    /// Load every row into memory and emit `sample_count` posterior
    /// snapshots, separated by `sample_skip` full remove/re-add sweeps;
    /// optionally with kind-structure sweeps between them.
    pub fn posterior_enum(
        &mut self,
        rng: &mut StdRng,
        rows_in: &Path,
        samples_out: &Path,
        sample_count: usize,
        sample_skip: usize,
        kind_structure: Option<(usize, usize)>,
    ) -> Result<(), EngineError> {
        assert!(sample_count >= 1, "need at least one sample");
        if sample_skip == 0 && sample_count > 1 {
            return Err(EngineError::ZeroDiversity);
        }
        let rows: Vec<RowRecord> = read_records(rows_in)?;
        assert!(!rows.is_empty(), "posterior enumeration needs rows");
        let mut writer = RecordWriter::create(samples_out)?;

        if self.assignments.row_count() == 0 {
            for row in &rows {
                let added = self.try_add_row(rng, row);
                assert!(added, "duplicate row: {}", row.id);
            }
        }

        match kind_structure {
            None => {
                for _ in 0..sample_count {
                    for _ in 0..sample_skip {
                        for row in &rows {
                            self.remove_row(row);
                            self.try_add_row(rng, row);
                        }
                    }
                    let sample = self.posterior_sample(None);
                    writer.write_record(&sample)?;
                }
            }
            Some((ephemeral_kind_count, iterations)) => {
                let mut kernel = KindKernel::prepare(
                    &mut self.cross_cat,
                    &mut self.assignments,
                    KernelConfig {
                        ephemeral_kind_count,
                        iterations,
                        max_reject_iters: 1,
                        parallel: 0,
                        empty_group_count: self.empty_group_count,
                    },
                    rng,
                );
                for _ in 0..sample_count {
                    for _ in 0..sample_skip {
                        for row in &rows {
                            self.remove_row_kinds(&mut kernel, rng, row);
                            let added = self.try_add_row_kinds(&mut kernel, rng, row);
                            debug_assert!(added);
                        }
                        kernel.run(&mut self.cross_cat, &self.assignments, rng);
                    }
                    let sample = self.posterior_sample(Some(&kernel));
                    writer.write_record(&sample)?;
                }
                kernel.cleanup(&mut self.cross_cat, &mut self.assignments, rng);
            }
        }
        writer.flush()?;
        Ok(())
    }

    /// Snapshot the current latent block structure.
    fn posterior_sample(&self, kernel: Option<&KindKernel>) -> PosteriorSample {
        let rowids: Vec<u64> = self.assignments.rowids().iter().copied().collect();
        let mut kinds = Vec::new();
        let mut score = 0.0;

        match kernel {
            None => {
                score = self.cross_cat.score_data();
                for (kindid, kind) in self.cross_cat.kinds.iter().enumerate() {
                    if kind.featureids.is_empty() {
                        continue;
                    }
                    let column = self.assignments.groupids(kindid);
                    kinds.push(snapshot_kind(
                        &kind.featureids,
                        column.iter().copied(),
                        &rowids,
                    ));
                }
            }
            Some(kernel) => {
                let feature_counts: Vec<usize> =
                    kernel.with_slots(|_, slot| slot.kind.featureids.len());
                score += self.cross_cat.feature_clustering.score_counts(&feature_counts);
                let parts = kernel.with_slots(|_, slot| {
                    let part_score = slot.kind.mixture.score_data(&slot.kind.model);
                    let snapshot = if slot.kind.featureids.is_empty() {
                        None
                    } else {
                        Some(snapshot_kind(
                            &slot.kind.featureids,
                            slot.groupids.iter().copied(),
                            &rowids,
                        ))
                    };
                    (part_score, snapshot)
                });
                for (part_score, snapshot) in parts {
                    score += part_score;
                    if let Some(kind) = snapshot {
                        kinds.push(kind);
                    }
                }
            }
        }

        PosteriorSample { kinds, score }
    }

    // ------------------------------------------------------------------
    // Query services
    // ------------------------------------------------------------------

    /// Answer one prediction query; schema violations land in the result's
    /// error field and processing continues.
    pub fn predict_row(&mut self, rng: &mut StdRng, query: &PredictQuery) -> PredictResult {
        let mut result = PredictResult {
            id: query.id,
            ..PredictResult::default()
        };
        if let Err(e) = self.cross_cat.schema.validate(&query.data) {
            result.error = Some(format!("invalid query data: {}", e));
            return result;
        }
        if let Err(e) = self.cross_cat.schema.validate_mask(&query.to_predict) {
            result.error = Some(format!("invalid to_predict mask: {}", e));
            return result;
        }
        let sample_count = query.sample_count as usize;
        if sample_count == 0 {
            return result;
        }

        self.cross_cat.value_split(&query.data, &mut self.partial_values);
        let mut templates = Vec::new();
        self.cross_cat
            .value_split_observed(&query.to_predict, &mut templates);
        let mut factors: Vec<Vec<ProductValue>> = vec![templates.clone(); sample_count];

        for (kindid, kind) in self.cross_cat.kinds.iter().enumerate() {
            let requested = templates[kindid].observed.dense.iter().any(|&bit| bit);
            if !requested {
                continue;
            }
            kind.mixture
                .score_value(&kind.model, &self.partial_values[kindid], &mut self.scores);
            scores_to_probs(&mut self.scores);
            for sample in factors.iter_mut() {
                kind.mixture
                    .sample_value(&kind.model, &self.scores, &mut sample[kindid], rng);
            }
        }

        for sample in &factors {
            let mut full = ProductValue::unobserved();
            self.cross_cat.value_join(&mut full, sample);
            result.samples.push(full);
        }
        result
    }

    /// Stream queries through [`Engine::predict_row`].
    pub fn predict(
        &mut self,
        rng: &mut StdRng,
        queries_in: &Path,
        results_out: &Path,
    ) -> Result<(), EngineError> {
        let mut queries = RecordReader::open(queries_in)?;
        let mut results = RecordWriter::create(results_out)?;
        while let Some(query) = queries.read_record::<PredictQuery>()? {
            let result = self.predict_row(rng, &query);
            results.write_record(&result)?;
            results.flush()?;
        }
        Ok(())
    }

    /// Total log-score of a row under the current mixtures.
    pub fn score_row(&mut self, query: &ScoreQuery) -> ScoreResult {
        let mut result = ScoreResult {
            id: query.id,
            ..ScoreResult::default()
        };
        if let Err(e) = self.cross_cat.schema.validate(&query.data) {
            result.error = Some(format!("invalid query data: {}", e));
            return result;
        }
        self.cross_cat.value_split(&query.data, &mut self.partial_values);
        let mut total = 0.0;
        for (kindid, kind) in self.cross_cat.kinds.iter().enumerate() {
            kind.mixture
                .score_value(&kind.model, &self.partial_values[kindid], &mut self.scores);
            total += log_sum_exp(&self.scores);
        }
        result.score = Some(total);
        result
    }

    /// Stream queries through [`Engine::score_row`].
    pub fn score(&mut self, queries_in: &Path, results_out: &Path) -> Result<(), EngineError> {
        let mut queries = RecordReader::open(queries_in)?;
        let mut results = RecordWriter::create(results_out)?;
        while let Some(query) = queries.read_record::<ScoreQuery>()? {
            let result = self.score_row(&query);
            results.write_record(&result)?;
            results.flush()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Metrics
    // ------------------------------------------------------------------

    fn log_iter_metrics(&mut self, iter: usize, kernel_status: Option<KernelStatus>) {
        let summary = IterSummary {
            kind_hypers: KindHypers {
                alphas: self
                    .cross_cat
                    .kinds
                    .iter()
                    .map(|k| k.model.clustering.alpha)
                    .collect(),
                ds: self.cross_cat.kinds.iter().map(|k| k.model.clustering.d).collect(),
            },
            model_hypers: ModelHypers {
                alpha: self.cross_cat.feature_clustering.alpha,
                d: self.cross_cat.feature_clustering.d,
            },
            category_counts: self
                .cross_cat
                .kinds
                .iter()
                .map(|k| k.mixture.group_count())
                .collect(),
            feature_counts: self.cross_cat.kinds.iter().map(|k| k.featureids.len()).collect(),
            assigned_object_count: self.assignments.row_count(),
        };
        let metrics = IterMetrics {
            iter,
            timers: self.timers.snapshot(),
            summary,
            kernel_status,
        };
        self.sink.log_iter(&metrics);
    }

    fn log_iter_metrics_kernel(&mut self, iter: usize, kernel: &KindKernel) {
        let mut alphas = Vec::new();
        let mut ds = Vec::new();
        let mut category_counts = Vec::new();
        let mut feature_counts = Vec::new();
        kernel.with_slots(|_, slot| {
            alphas.push(slot.kind.model.clustering.alpha);
            ds.push(slot.kind.model.clustering.d);
            category_counts.push(slot.kind.mixture.group_count());
            feature_counts.push(slot.kind.featureids.len());
        });
        let summary = IterSummary {
            kind_hypers: KindHypers { alphas, ds },
            model_hypers: ModelHypers {
                alpha: self.cross_cat.feature_clustering.alpha,
                d: self.cross_cat.feature_clustering.d,
            },
            category_counts,
            feature_counts,
            assigned_object_count: self.assignments.row_count(),
        };
        let metrics = IterMetrics {
            iter,
            timers: self.timers.snapshot(),
            summary,
            kernel_status: Some(KernelStatus {
                algo8: kernel.status(),
            }),
        };
        self.sink.log_iter(&metrics);
    }
}

/// Group one kind's assignment column into rowid lists keyed by global
/// group id (deterministic order).
fn snapshot_kind(
    featureids: &std::collections::BTreeSet<usize>,
    column: impl Iterator<Item = u64>,
    rowids: &[u64],
) -> PosteriorKind {
    let mut groups: BTreeMap<u64, Vec<u64>> = BTreeMap::new();
    for (i, groupid) in column.enumerate() {
        groups.entry(groupid).or_default().push(rowids[i]);
    }
    PosteriorKind {
        featureids: featureids.iter().map(|&f| f as u32).collect(),
        groups: groups.into_values().collect(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NullSink;
    use crate::rows::write_records;
    use crate::schema::{Observed, Sparsity, ValueSchema};
    use tempfile::tempdir;

    fn schema() -> ValueSchema {
        ValueSchema {
            booleans: 2,
            counts: 1,
            reals: 0,
        }
    }

    fn engine() -> Engine {
        let dump = ModelDump::with_default_hypers(schema(), &[0, 0, 1]);
        Engine::from_model(dump, 1, Box::new(NullSink))
    }

    fn row(id: u64) -> RowRecord {
        RowRecord {
            id,
            value: ProductValue {
                observed: Observed::empty(Sparsity::All),
                booleans: vec![id % 2 == 0, id % 3 == 0],
                counts: vec![(id % 5) as u32],
                reals: vec![],
            },
        }
    }

    fn rows_file(dir: &tempfile::TempDir, ids: &[u64]) -> std::path::PathBuf {
        let path = dir.path().join("rows");
        let rows: Vec<RowRecord> = ids.iter().map(|&id| row(id)).collect();
        write_records(&path, &rows).unwrap();
        path
    }

    #[test]
    fn add_then_remove_restores_mixture_state() {
        let mut engine = engine();
        let mut rng = StdRng::seed_from_u64(0);
        let before: Vec<Vec<usize>> = engine
            .cross_cat()
            .kinds
            .iter()
            .map(|k| k.mixture.counts().to_vec())
            .collect();
        let before_stats = engine.cross_cat().kinds[0].mixture.groups().to_vec();

        // Repeated add/remove cycles leave the sufficient statistics
        // bit-identical to the starting state.
        for _ in 0..3 {
            assert!(engine.try_add_row(&mut rng, &row(42)));
            assert_eq!(engine.assignments().row_count(), 1);
            assert_eq!(*engine.assignments().rowids().back().unwrap(), 42);

            engine.remove_row(&row(42));
            assert_eq!(engine.assignments().row_count(), 0);
            let after: Vec<Vec<usize>> = engine
                .cross_cat()
                .kinds
                .iter()
                .map(|k| k.mixture.counts().to_vec())
                .collect();
            assert_eq!(after, before);
            assert_eq!(engine.cross_cat().kinds[0].mixture.groups(), &before_stats[..]);
        }
    }

    #[test]
    fn duplicate_add_returns_false_and_leaves_state_alone() {
        let mut engine = engine();
        let mut rng = StdRng::seed_from_u64(1);
        assert!(engine.try_add_row(&mut rng, &row(7)));
        let counts_before: Vec<usize> =
            engine.cross_cat().kinds[0].mixture.counts().to_vec();
        assert!(!engine.try_add_row(&mut rng, &row(7)));
        assert_eq!(engine.assignments().row_count(), 1);
        assert_eq!(engine.cross_cat().kinds[0].mixture.counts(), &counts_before[..]);
    }

    #[test]
    fn duplicate_halts_streaming_inference_cleanly() {
        // Rows 1, 2, 3 then a duplicate 2: the cold-start schedule adds
        // rows until the duplicate halts the loop with three rows seated.
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows");
        write_records(&path, &[row(1), row(2), row(3), row(2)]).unwrap();

        let mut engine = engine();
        let mut rng = StdRng::seed_from_u64(2);
        let config = InferConfig {
            cat_extra_passes: 1.0,
            ..InferConfig::default()
        };
        engine.infer_multi_pass(&mut rng, &path, &config).unwrap();
        assert_eq!(engine.assignments().row_count(), 3);
        engine.validate();
    }

    #[test]
    fn warm_multi_pass_keeps_the_window_and_terminates() {
        let dir = tempdir().unwrap();
        let ids: Vec<u64> = (1..=10).collect();
        let path = rows_file(&dir, &ids);

        let mut engine = engine();
        let mut rng = StdRng::seed_from_u64(3);
        // Preload all ten rows in file order.
        for &id in &ids {
            assert!(engine.try_add_row(&mut rng, &row(id)));
        }

        let config = InferConfig {
            cat_extra_passes: 1.0,
            ..InferConfig::default()
        };
        engine.infer_multi_pass(&mut rng, &path, &config).unwrap();

        // The streaming cycle ends with the same window: every row present
        // exactly once.
        assert_eq!(engine.assignments().row_count(), 10);
        let mut seen: Vec<u64> = engine.assignments().rowids().iter().copied().collect();
        seen.sort_unstable();
        assert_eq!(seen, ids);
        assert_eq!(engine.count_untracked_rows(), 0);
        engine.validate();
    }

    #[test]
    fn multi_pass_with_kind_structure_converges_and_cleans_up() {
        let dir = tempdir().unwrap();
        let ids: Vec<u64> = (1..=8).collect();
        let path = rows_file(&dir, &ids);

        let dump = ModelDump::with_default_hypers(schema(), &[0, 0, 1]);
        let mut engine = Engine::from_model(dump, 1, Box::new(NullSink));
        let mut rng = StdRng::seed_from_u64(4);
        for &id in &ids {
            assert!(engine.try_add_row(&mut rng, &row(id)));
        }

        let config = InferConfig {
            cat_extra_passes: 1.0,
            kind_extra_passes: 2.0,
            ephemeral_kind_count: 2,
            iterations: 2,
            max_reject_iters: 3,
            parallel: 0,
        };
        engine.infer_multi_pass(&mut rng, &path, &config).unwrap();

        // No ephemeral kinds survive cleanup, and the partition is intact.
        engine.validate();
        assert!(engine.cross_cat().kinds.iter().all(|k| !k.featureids.is_empty()));
        assert_eq!(engine.assignments().row_count(), 8);
    }

    struct SharedSink(std::sync::Arc<std::sync::Mutex<Vec<IterMetrics>>>);

    impl MetricsSink for SharedSink {
        fn log_iter(&mut self, metrics: &IterMetrics) {
            self.0.lock().unwrap().push(metrics.clone());
        }
    }

    #[test]
    fn metrics_are_logged_per_batch() {
        let dir = tempdir().unwrap();
        let ids: Vec<u64> = (1..=40).collect();
        let path = rows_file(&dir, &ids);

        let logged = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let dump = ModelDump::with_default_hypers(schema(), &[0, 0, 1]);
        let mut engine = Engine::from_model(dump, 1, Box::new(SharedSink(logged.clone())));
        let mut rng = StdRng::seed_from_u64(5);
        for &id in &ids {
            assert!(engine.try_add_row(&mut rng, &row(id)));
        }
        let config = InferConfig {
            cat_extra_passes: 1.0,
            ..InferConfig::default()
        };
        engine.infer_multi_pass(&mut rng, &path, &config).unwrap();
        engine.validate();

        let logged = logged.lock().unwrap();
        // The initial snapshot plus at least one batch boundary.
        assert!(logged.len() >= 2, "logged {} iterations", logged.len());
        assert_eq!(logged[0].iter, 0);
        assert_eq!(logged[0].summary.assigned_object_count, 40);
        assert_eq!(logged[0].summary.feature_counts, vec![2, 1]);
        assert!(logged.iter().all(|m| m.kernel_status.is_none()));
        assert!(logged.last().unwrap().timers.contains_key("cat"));
    }

    #[test]
    fn posterior_enum_rejects_zero_diversity() {
        let dir = tempdir().unwrap();
        let path = rows_file(&dir, &[1, 2, 3]);
        let out = dir.path().join("samples");

        let mut engine = engine();
        let mut rng = StdRng::seed_from_u64(6);
        let err = engine
            .posterior_enum(&mut rng, &path, &out, 2, 0, None)
            .unwrap_err();
        assert!(matches!(err, EngineError::ZeroDiversity));
        assert!(err.to_string().contains("diversity"));
    }

    #[test]
    fn posterior_enum_emits_complete_samples() {
        let dir = tempdir().unwrap();
        let path = rows_file(&dir, &[1, 2, 3, 4]);
        let out = dir.path().join("samples");

        let mut engine = engine();
        let mut rng = StdRng::seed_from_u64(7);
        engine
            .posterior_enum(&mut rng, &path, &out, 3, 2, None)
            .unwrap();

        let samples: Vec<PosteriorSample> = read_records(&out).unwrap();
        assert_eq!(samples.len(), 3);
        for sample in &samples {
            assert!(sample.score.is_finite());
            assert_eq!(sample.kinds.len(), 2);
            // Every row appears exactly once per kind.
            for kind in &sample.kinds {
                let mut rowids: Vec<u64> =
                    kind.groups.iter().flatten().copied().collect();
                rowids.sort_unstable();
                assert_eq!(rowids, vec![1, 2, 3, 4]);
            }
        }
    }

    #[test]
    fn posterior_enum_with_kind_structure_restores_the_kind_set() {
        let dir = tempdir().unwrap();
        let path = rows_file(&dir, &[1, 2, 3, 4, 5]);
        let out = dir.path().join("samples");

        let mut engine = engine();
        let kind_count = engine.cross_cat().kind_count();
        let mut rng = StdRng::seed_from_u64(8);
        engine
            .posterior_enum(&mut rng, &path, &out, 2, 1, Some((2, 2)))
            .unwrap();

        engine.validate();
        // Featureful kinds only; the partition may have changed shape, but
        // no ephemeral kind survives.
        assert!(engine.cross_cat().kinds.iter().all(|k| !k.featureids.is_empty()));
        assert!(engine.cross_cat().kind_count() <= kind_count + 2);
        let samples: Vec<PosteriorSample> = read_records(&out).unwrap();
        assert_eq!(samples.len(), 2);
    }

    #[test]
    fn predict_is_deterministic_under_a_fixed_seed() {
        let mut engine = engine();
        let mut rng = StdRng::seed_from_u64(9);
        for id in 0..6 {
            assert!(engine.try_add_row(&mut rng, &row(id)));
        }

        let query = PredictQuery {
            id: 77,
            data: ProductValue {
                observed: Observed {
                    sparsity: Sparsity::Dense,
                    dense: vec![true, false, false],
                    sparse: vec![],
                },
                booleans: vec![true],
                counts: vec![],
                reals: vec![],
            },
            to_predict: Observed {
                sparsity: Sparsity::Dense,
                dense: vec![false, true, true],
                sparse: vec![],
            },
            sample_count: 5,
        };

        let mut rng_a = StdRng::seed_from_u64(1234);
        let first = engine.predict_row(&mut rng_a, &query);
        let mut rng_b = StdRng::seed_from_u64(1234);
        let second = engine.predict_row(&mut rng_b, &query);

        assert!(first.error.is_none(), "{:?}", first.error);
        assert_eq!(first.samples.len(), 5);
        for (a, b) in first.samples.iter().zip(&second.samples) {
            assert_eq!(a, b);
        }
        // Samples carry exactly the requested positions.
        for sample in &first.samples {
            assert_eq!(sample.observed.dense, vec![false, true, true]);
            assert_eq!(sample.booleans.len(), 1);
            assert_eq!(sample.counts.len(), 1);
        }
    }

    #[test]
    fn predict_reports_schema_violations_per_query() {
        let mut engine = engine();
        let mut rng = StdRng::seed_from_u64(10);
        let query = PredictQuery {
            id: 5,
            data: ProductValue {
                observed: Observed {
                    sparsity: Sparsity::Dense,
                    dense: vec![true], // wrong mask size
                    sparse: vec![],
                },
                booleans: vec![true],
                counts: vec![],
                reals: vec![],
            },
            to_predict: Observed::dense_false(3),
            sample_count: 1,
        };
        let result = engine.predict_row(&mut rng, &query);
        assert!(result.error.is_some());
        assert!(result.samples.is_empty());
    }

    #[test]
    fn score_row_totals_kind_scores() {
        let mut engine = engine();
        let mut rng = StdRng::seed_from_u64(11);
        for id in 0..4 {
            assert!(engine.try_add_row(&mut rng, &row(id)));
        }
        let result = engine.score_row(&ScoreQuery {
            id: 1,
            data: row(99).value,
        });
        assert!(result.error.is_none());
        assert!(result.score.unwrap().is_finite());
    }

    #[test]
    fn single_pass_records_assignments() {
        let dir = tempdir().unwrap();
        let path = rows_file(&dir, &[1, 2, 3]);
        let assign_out = dir.path().join("assign");

        let mut engine = engine();
        let mut rng = StdRng::seed_from_u64(12);
        engine
            .infer_single_pass(&mut rng, &path, Some(&assign_out))
            .unwrap();

        let records: Vec<AssignmentRecord> = read_records(&assign_out).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].groupids.len(), 2);
        // Single-pass rows are untracked by design.
        assert_eq!(engine.count_untracked_rows(), 3);
    }

    #[test]
    fn dump_and_load_round_trip_preserves_the_window() {
        let dir = tempdir().unwrap();
        let model_out = dir.path().join("model");
        let groups_out = dir.path().join("groups");
        let assign_out = dir.path().join("assign");

        let mut engine = engine();
        let mut rng = StdRng::seed_from_u64(13);
        for id in 0..5 {
            assert!(engine.try_add_row(&mut rng, &row(id)));
        }
        engine
            .dump(Some(&model_out), Some(&groups_out), Some(&assign_out))
            .unwrap();

        let loaded = Engine::load(
            &model_out,
            Some(&groups_out),
            Some(&assign_out),
            1,
            Box::new(NullSink),
        )
        .unwrap();
        loaded.validate();
        assert_eq!(loaded.assignments().row_count(), 5);
        assert_eq!(loaded.count_untracked_rows(), 0);
        assert_eq!(
            loaded.cross_cat().kinds[0].mixture.count_rows(),
            engine.cross_cat().kinds[0].mixture.count_rows()
        );
    }

    #[test]
    fn config_validation_enforces_the_contract() {
        let mut config = InferConfig {
            cat_extra_passes: 0.0,
            kind_extra_passes: 0.0,
            ..InferConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::NoPasses)));

        config.kind_extra_passes = 1.0;
        config.iterations = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingKindParameter("iterations"))
        ));

        config.iterations = 1;
        assert!(config.validate().is_ok());
    }
}
