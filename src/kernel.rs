//! Kind-structure sampler
//!
//! An auxiliary-variable Gibbs sampler over the feature-to-kind assignment:
//! ephemeral (featureless) kinds give features somewhere to migrate, and a
//! per-kind **full-model mirror** scores every feature against every kind's
//! current row grouping without moving data.
//!
//! Phase lifecycle:
//!
//! - [`KindKernel::prepare`]: require no untracked rows, append the ephemeral
//!   kinds, move every kind (with its assignment column) into a shared slot,
//!   build the mirrors, and size the worker pool.
//! - [`KindKernel::run`]: drain the pool, Gibbs-sweep the feature assignment
//!   (clustering terms updated live, per-(feature, kind) data terms from the
//!   mirrors held fixed for the run), move the changed features' statistics,
//!   rebuild the ephemeral kinds, re-seed the mirrors, and resize the pool.
//! - [`KindKernel::cleanup`]: drain and shut the pool, move kinds and columns
//!   home, and drop every featureless kind.
//!
//! The mirror is a plain [`Mixture`] over the *full* schema. It is re-seeded
//! from the partial mixture's group counts with all statistics unobserved
//! ("replay treating unobserved features as a distinguished value"): streamed
//! adds then insert real full values while removes subtract an all-unobserved
//! value, so per-group row counts stay in lock-step with the partial mixture
//! (the phase invariant) while feature statistics track the current batch
//! window.
//!
//! During the phase, row work flows through the slots: either fanned out to
//! the per-kind consumers of the worker pool, or inline over the same slots
//! when `parallel == 0`. All structural mutation happens between
//! `producer_wait` and the next publish, so slot locks are uncontended.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::assignments::Assignments;
use crate::cross_cat::{CrossCat, Kind};
use crate::metrics::Algo8Status;
use crate::mixture::{Mixture, ProductModel};
use crate::models::{sample_from_scores, HyperGrid, PitmanYor};
use crate::pool::{KindPool, TaskAction, TaskBuf};
use crate::schema::{FieldType, ProductValue, ValueSchema};

/// One kind's phase state: the kind itself, its full-model mirror, and its
/// assignment column (global group ids, aligned with the engine's rowids).
pub struct KindSlot {
    pub kind: Kind,
    pub mirror: Mixture,
    pub groupids: VecDeque<u64>,
}

type SharedSlot = Arc<Mutex<KindSlot>>;
type SlotTable = Arc<RwLock<Vec<SharedSlot>>>;

/// Configuration of one kind-structure phase.
#[derive(Copy, Clone, Debug)]
pub struct KernelConfig {
    pub ephemeral_kind_count: usize,
    pub iterations: usize,
    pub max_reject_iters: usize,
    pub parallel: usize,
    pub empty_group_count: usize,
}

/// The kind-structure phase state.
pub struct KindKernel {
    slots: SlotTable,
    full_model: Arc<ProductModel>,
    pool: KindPool,
    config: KernelConfig,
    reject_iters: usize,
    status: Algo8Status,
    unobserved: ProductValue,
    partials_scratch: Vec<ProductValue>,
    scores_scratch: Vec<f64>,
}

impl KindKernel {
    // ------------------------------------------------------------------
    // Prepare
    // ------------------------------------------------------------------

    /// Enter the kind-structure phase.
    ///
    /// Every row in every mixture must already be tracked by `assignments`;
    /// untracked rows are an invariant violation.
    pub fn prepare(
        cross_cat: &mut CrossCat,
        assignments: &mut Assignments,
        config: KernelConfig,
        rng: &mut StdRng,
    ) -> KindKernel {
        assert!(config.ephemeral_kind_count > 0, "need ephemeral kinds");
        assert!(config.max_reject_iters > 0, "need a reject budget");
        for (kindid, kind) in cross_cat.kinds.iter().enumerate() {
            assert_eq!(
                kind.mixture.count_rows(),
                assignments.row_count(),
                "untracked rows in kind {}",
                kindid
            );
        }

        rebuild_featureless_home(
            cross_cat,
            assignments,
            config.ephemeral_kind_count,
            config.empty_group_count,
            rng,
        );

        let full_model = Arc::new(build_full_model(cross_cat));
        let columns = assignments.detach_columns();
        let slots: Vec<SharedSlot> = cross_cat
            .kinds
            .drain(..)
            .zip(columns)
            .map(|(kind, groupids)| {
                let mirror = Mixture::init_unobserved(
                    &full_model,
                    kind.mixture.counts().to_vec(),
                    config.empty_group_count,
                );
                Arc::new(Mutex::new(KindSlot {
                    kind,
                    mirror,
                    groupids,
                }))
            })
            .collect();
        let slot_count = slots.len();

        let mut kernel = KindKernel {
            slots: Arc::new(RwLock::new(slots)),
            full_model,
            pool: KindPool::new(config.parallel),
            config,
            reject_iters: 0,
            status: Algo8Status::default(),
            unobserved: ProductValue::unobserved(),
            partials_scratch: Vec::new(),
            scores_scratch: Vec::new(),
        };
        if config.parallel > 0 {
            kernel.resize_pool(slot_count, rng);
        }
        kernel
    }

    // ------------------------------------------------------------------
    // Streaming row work
    // ------------------------------------------------------------------

    /// Number of kinds currently in the phase.
    pub fn kind_count(&self) -> usize {
        self.slots.read().expect("slot table").len()
    }

    /// Fan one row's add or remove out across every kind, through the pool
    /// when it is live and inline otherwise.
    pub fn process_row(
        &mut self,
        cross_cat: &CrossCat,
        action: TaskAction,
        value: &ProductValue,
        rng: &mut StdRng,
    ) {
        let kind_count = self.kind_count();
        if self.config.parallel > 0 {
            let envelope = self.pool.producer_alloc(|task| {
                task.action = action;
                task.full_value.clone_from(value);
                cross_cat.value_split(&task.full_value, &mut task.partial_values);
            });
            self.pool.producer_send(envelope, kind_count);
            return;
        }

        cross_cat.value_split(value, &mut self.partials_scratch);
        let seed: u64 = rng.gen();
        let slots = self.slots.read().expect("slot table");
        for (kindid, slot) in slots.iter().enumerate() {
            let mut slot = slot.lock().expect("slot lock");
            let mut kind_rng = StdRng::seed_from_u64(seed.wrapping_add(kindid as u64));
            match action {
                TaskAction::Add => work_add(
                    &mut slot,
                    &self.full_model,
                    &self.partials_scratch[kindid],
                    value,
                    &mut self.scores_scratch,
                    &mut kind_rng,
                ),
                TaskAction::Remove => work_remove(
                    &mut slot,
                    &self.full_model,
                    &self.partials_scratch[kindid],
                    &self.unobserved,
                ),
            }
        }
    }

    /// Block until every published row has been consumed by every kind.
    pub fn producer_wait(&self) {
        if self.config.parallel > 0 {
            self.pool.producer_wait();
        }
    }

    // ------------------------------------------------------------------
    // Gibbs sweeps
    // ------------------------------------------------------------------

    /// Run one batch of feature-reassignment sweeps; returns how many
    /// features moved. Tracks the mixing state and cumulative status.
    pub fn run(
        &mut self,
        cross_cat: &mut CrossCat,
        assignments: &Assignments,
        rng: &mut StdRng,
    ) -> usize {
        self.producer_wait();
        self.validate_row_counts(assignments);

        let schema = cross_cat.schema;
        let feature_count = schema.total();
        let (mut feature_counts, data_scores) = {
            let slots = self.slots.read().expect("slot table");
            let mut counts = Vec::with_capacity(slots.len());
            let mut data = Vec::with_capacity(slots.len());
            for slot in slots.iter() {
                let slot = slot.lock().expect("slot lock");
                counts.push(slot.kind.featureids.len());
                let mut per_feature = Vec::with_capacity(feature_count);
                for f in 0..feature_count {
                    let (ty, idx) = full_local(&schema, f);
                    per_feature.push(slot.mirror.score_feature(&self.full_model, ty, idx));
                }
                data.push(per_feature);
            }
            (counts, data)
        };
        let kind_count = feature_counts.len();

        let old_kindids = cross_cat.featureid_to_kindid.clone();
        let mut new_kindids = old_kindids.clone();
        let mut scores = vec![0.0; kind_count];
        for _ in 0..self.config.iterations {
            for f in 0..feature_count {
                let current = new_kindids[f];
                feature_counts[current] -= 1;
                let nonempty = feature_counts.iter().filter(|&&c| c > 0).count();
                let empties = kind_count - nonempty;
                for (k, score) in scores.iter_mut().enumerate() {
                    *score = cross_cat.feature_clustering.score_add(
                        feature_counts[k],
                        feature_count - 1,
                        nonempty,
                        empties,
                    ) + data_scores[k][f];
                }
                let next = sample_from_scores(rng, &scores);
                feature_counts[next] += 1;
                new_kindids[f] = next;
            }
        }

        let mut change_count = 0;
        for f in 0..feature_count {
            if new_kindids[f] != old_kindids[f] {
                self.move_feature(cross_cat, f, new_kindids[f]);
                change_count += 1;
            }
        }

        self.rebuild_featureless_slots(cross_cat, assignments.row_count(), rng);
        self.reseed_mirrors();
        let slot_count = self.kind_count();
        cross_cat.rebuild_splitter_for(slot_count);
        if self.config.parallel > 0 {
            self.resize_pool(slot_count, rng);
        }

        if change_count > 0 {
            self.reject_iters = 0;
        } else {
            self.reject_iters += 1;
        }
        self.status.total_count += feature_count as u64;
        self.status.change_count += change_count as u64;
        change_count
    }

    /// Whether the chain is still mixing (recent sweeps moved features).
    pub fn is_mixing(&self) -> bool {
        self.reject_iters < self.config.max_reject_iters
    }

    /// Cumulative counters since the last reset.
    pub fn status(&self) -> Algo8Status {
        self.status
    }

    /// Zero the cumulative counters (after logging a batch).
    pub fn reset_status(&mut self) {
        self.status = Algo8Status::default();
    }

    // ------------------------------------------------------------------
    // Cleanup
    // ------------------------------------------------------------------

    /// Leave the phase: drop mirrors, move kinds and columns home, and
    /// remove every featureless kind.
    pub fn cleanup(
        mut self,
        cross_cat: &mut CrossCat,
        assignments: &mut Assignments,
        rng: &mut StdRng,
    ) {
        self.producer_wait();
        self.pool.shutdown();

        let slots = Arc::try_unwrap(self.slots)
            .ok()
            .expect("slot table still shared after shutdown")
            .into_inner()
            .expect("slot table poisoned");
        let mut columns = Vec::with_capacity(slots.len());
        for slot in slots {
            let slot = Arc::try_unwrap(slot)
                .ok()
                .expect("slot still shared after shutdown")
                .into_inner()
                .expect("slot poisoned");
            cross_cat.kinds.push(slot.kind);
            columns.push(slot.groupids);
        }
        assignments.attach_columns(columns);
        cross_cat.rebuild_splitter();

        rebuild_featureless_home(cross_cat, assignments, 0, self.config.empty_group_count, rng);
        cross_cat.validate();
        assignments.validate();
    }

    // ------------------------------------------------------------------
    // Barrier-time access
    // ------------------------------------------------------------------

    /// Run `visit` over every slot while the pool is drained, for metric
    /// summaries and posterior snapshots.
    pub fn with_slots<R>(&self, mut visit: impl FnMut(usize, &KindSlot) -> R) -> Vec<R> {
        let slots = self.slots.read().expect("slot table");
        slots
            .iter()
            .enumerate()
            .map(|(kindid, slot)| {
                let slot = slot.lock().expect("slot lock");
                visit(kindid, &slot)
            })
            .collect()
    }

    /// Gibbs-sample every kind's hypers and the feature clustering prior
    /// while the kinds live in slots.
    pub fn infer_hypers(&self, cross_cat: &mut CrossCat, rng: &mut StdRng) {
        {
            let slots = self.slots.read().expect("slot table");
            for slot in slots.iter() {
                let mut slot = slot.lock().expect("slot lock");
                let kind = &mut slot.kind;
                kind.mixture
                    .infer_hypers(&mut kind.model, &cross_cat.hyper_grid, rng);
            }
        }
        let feature_counts: Vec<usize> =
            self.with_slots(|_, slot| slot.kind.featureids.len());
        if !cross_cat.hyper_grid.clustering.is_empty() {
            let scores: Vec<f64> = cross_cat
                .hyper_grid
                .clustering
                .iter()
                .map(|h| h.score_counts(&feature_counts))
                .collect();
            cross_cat.feature_clustering =
                cross_cat.hyper_grid.clustering[sample_from_scores(rng, &scores)];
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn validate_row_counts(&self, assignments: &Assignments) {
        let row_count = assignments.row_count();
        let slots = self.slots.read().expect("slot table");
        for (kindid, slot) in slots.iter().enumerate() {
            let slot = slot.lock().expect("slot lock");
            assert_eq!(
                slot.kind.mixture.count_rows(),
                row_count,
                "kind {} row count drifted",
                kindid
            );
            assert_eq!(
                slot.mirror.count_rows(),
                row_count,
                "kind {} mirror row count drifted",
                kindid
            );
            assert_eq!(slot.groupids.len(), row_count, "kind {} column drifted", kindid);
        }
    }

    fn move_feature(&self, cross_cat: &mut CrossCat, featureid: usize, new_kindid: usize) {
        let old_kindid = cross_cat.featureid_to_kindid[featureid];
        assert_ne!(old_kindid, new_kindid);
        let schema = cross_cat.schema;
        let (ty, full_idx) = full_local(&schema, featureid);

        let slots = self.slots.read().expect("slot table");
        let mut old_slot = slots[old_kindid].lock().expect("slot lock");
        let mut new_slot = slots[new_kindid].lock().expect("slot lock");

        let (_, old_idx) = old_slot.kind.local_index(featureid, &schema);
        let hyper = old_slot.kind.model.feature_hyper(ty, old_idx);
        old_slot.kind.model.remove_feature(ty, old_idx);
        old_slot.kind.mixture.remove_feature(ty, old_idx);
        old_slot.kind.featureids.remove(&featureid);

        // The destination mirror already bins this feature's streamed data
        // by the destination kind's grouping.
        let column = new_slot.mirror.feature_stats_column(ty, full_idx);
        let (_, new_idx) = new_slot.kind.local_index(featureid, &schema);
        new_slot.kind.model.insert_feature(ty, new_idx, hyper);
        new_slot.kind.mixture.insert_feature(new_idx, column);
        new_slot.kind.featureids.insert(featureid);

        cross_cat.featureid_to_kindid[featureid] = new_kindid;
    }

    fn rebuild_featureless_slots(
        &mut self,
        cross_cat: &mut CrossCat,
        row_count: usize,
        rng: &mut StdRng,
    ) {
        let mut slots = self.slots.write().expect("slot table");

        for i in (0..slots.len()).rev() {
            let empty = slots[i].lock().expect("slot lock").kind.featureids.is_empty();
            if !empty {
                continue;
            }
            slots.swap_remove(i);
            if i < slots.len() {
                let moved = slots[i].lock().expect("slot lock");
                for &f in &moved.kind.featureids {
                    cross_cat.featureid_to_kindid[f] = i;
                }
            }
        }

        let fallback = slots
            .first()
            .map(|s| s.lock().expect("slot lock").kind.model.clustering)
            .expect("no featureful kinds left");
        for _ in 0..self.config.ephemeral_kind_count {
            let (kind, groupids) = build_featureless_kind(
                &cross_cat.hyper_grid,
                fallback,
                row_count,
                self.config.empty_group_count,
                rng,
            );
            let mirror = Mixture::init_unobserved(
                &self.full_model,
                kind.mixture.counts().to_vec(),
                self.config.empty_group_count,
            );
            slots.push(Arc::new(Mutex::new(KindSlot {
                kind,
                mirror,
                groupids,
            })));
        }
    }

    fn reseed_mirrors(&self) {
        let slots = self.slots.read().expect("slot table");
        for slot in slots.iter() {
            let mut slot = slot.lock().expect("slot lock");
            slot.mirror = Mixture::init_unobserved(
                &self.full_model,
                slot.kind.mixture.counts().to_vec(),
                self.config.empty_group_count,
            );
        }
    }

    fn resize_pool(&mut self, target: usize, rng: &mut StdRng) {
        let table = self.slots.clone();
        let full_model = self.full_model.clone();
        self.pool.resize(target, |kindid| {
            let table = table.clone();
            let full_model = full_model.clone();
            let mut worker_rng = StdRng::seed_from_u64(rng.gen());
            let unobserved = ProductValue::unobserved();
            let mut scores = Vec::new();
            Box::new(move |task: &TaskBuf| {
                let slot = table.read().expect("slot table")[kindid].clone();
                let mut slot = slot.lock().expect("slot lock");
                match task.action {
                    TaskAction::Add => work_add(
                        &mut slot,
                        &full_model,
                        &task.partial_values[kindid],
                        &task.full_value,
                        &mut scores,
                        &mut worker_rng,
                    ),
                    TaskAction::Remove => work_remove(
                        &mut slot,
                        &full_model,
                        &task.partial_values[kindid],
                        &unobserved,
                    ),
                }
            })
        });
    }
}

// ============================================================================
// Per-kind row work
// ============================================================================

/// Seat a row in one kind and mirror the insertion.
fn work_add(
    slot: &mut KindSlot,
    full_model: &ProductModel,
    partial: &ProductValue,
    full: &ProductValue,
    scores: &mut Vec<f64>,
    rng: &mut StdRng,
) {
    let kind = &mut slot.kind;
    let groupid = kind.mixture.score_and_sample(&kind.model, partial, scores, rng);
    kind.mixture.add_value(&kind.model, groupid, partial);
    slot.mirror.add_value(full_model, groupid, full);
    let global = kind.mixture.id_tracker().packed_to_global(groupid);
    slot.groupids.push_back(global);
}

/// Evict a row from one kind; the mirror subtracts an all-unobserved value
/// so only its group counts move.
fn work_remove(
    slot: &mut KindSlot,
    full_model: &ProductModel,
    partial: &ProductValue,
    unobserved: &ProductValue,
) {
    let global = slot.groupids.pop_front().expect("no assigned rows in column");
    let kind = &mut slot.kind;
    let groupid = kind.mixture.id_tracker().global_to_packed(global);
    kind.mixture.remove_value(&kind.model, groupid, partial);
    slot.mirror.remove_value(full_model, groupid, unobserved);
}

// ============================================================================
// Featureless kinds and the full model
// ============================================================================

/// Within-type index of a feature in the full schema.
#[inline]
pub(crate) fn full_local(schema: &ValueSchema, featureid: usize) -> (FieldType, usize) {
    match schema.field_type(featureid) {
        FieldType::Boolean => (FieldType::Boolean, featureid),
        FieldType::Count => (FieldType::Count, featureid - schema.booleans),
        FieldType::Real => (FieldType::Real, featureid - schema.booleans - schema.counts),
    }
}

/// A product model over the full schema, gathering every feature's hyper
/// from its current kind. The mirrors score against this model.
fn build_full_model(cross_cat: &CrossCat) -> ProductModel {
    let schema = cross_cat.schema;
    let mut model = ProductModel::featureless(cross_cat.kinds[0].model.clustering);
    for f in 0..schema.total() {
        let kind = &cross_cat.kinds[cross_cat.featureid_to_kindid[f]];
        let (ty, idx) = kind.local_index(f, &schema);
        let hyper = kind.model.feature_hyper(ty, idx);
        let (_, full_idx) = full_local(&schema, f);
        model.insert_feature(ty, full_idx, hyper);
    }
    model
}

/// Build one ephemeral kind: a featureless model whose clustering prior is
/// drawn from the grid (or copied from the fallback when the grid's
/// clustering axis is empty), with a prior-sampled partition over the
/// current rows and the matching assignment column.
fn build_featureless_kind(
    grid: &HyperGrid,
    fallback: PitmanYor,
    row_count: usize,
    empty_group_count: usize,
    rng: &mut StdRng,
) -> (Kind, VecDeque<u64>) {
    let clustering = if grid.clustering.is_empty() {
        fallback
    } else {
        grid.clustering[rng.gen_range(0..grid.clustering.len())]
    };
    let model = ProductModel::featureless(clustering);

    let assignment = clustering.sample_assignments(row_count, rng);
    let group_count = assignment.iter().copied().max().map_or(0, |g| g + 1);
    let mut counts = vec![0usize; group_count + empty_group_count];
    for &g in &assignment {
        counts[g] += 1;
    }
    let mixture = Mixture::init_unobserved(&model, counts, empty_group_count);
    let groupids: VecDeque<u64> = assignment
        .iter()
        .map(|&g| mixture.id_tracker().packed_to_global(g))
        .collect();

    (
        Kind {
            featureids: BTreeSet::new(),
            model,
            mixture,
        },
        groupids,
    )
}

/// Remove every featureless kind, then append `target` fresh ephemeral
/// kinds, all while the kinds and columns live in their home structures.
pub(crate) fn rebuild_featureless_home(
    cross_cat: &mut CrossCat,
    assignments: &mut Assignments,
    target: usize,
    empty_group_count: usize,
    rng: &mut StdRng,
) {
    for i in (0..cross_cat.kinds.len()).rev() {
        if cross_cat.kinds[i].featureids.is_empty() {
            cross_cat.packed_remove_kind(i);
            assignments.packed_remove_kind(i);
        }
    }
    assert!(!cross_cat.kinds.is_empty(), "no featureful kinds left");

    let row_count = assignments.row_count();
    for _ in 0..target {
        let fallback = cross_cat.kinds[0].model.clustering;
        let (kind, groupids) = build_featureless_kind(
            &cross_cat.hyper_grid,
            fallback,
            row_count,
            empty_group_count,
            rng,
        );
        cross_cat.packed_add_kind(kind);
        *assignments.packed_add_kind() = groupids;
    }
    cross_cat.validate();
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cross_cat::ModelDump;
    use crate::schema::{Observed, Sparsity};

    fn cross_cat_with_rows(
        partition: &[usize],
        rows: usize,
        rng: &mut StdRng,
    ) -> (CrossCat, Assignments) {
        let schema = ValueSchema {
            booleans: partition.len(),
            counts: 0,
            reals: 0,
        };
        let dump = ModelDump::with_default_hypers(schema, partition);
        let mut cc = CrossCat::from_model(dump, 1);
        let mut assignments = Assignments::init(cc.kind_count());

        let mut partials = Vec::new();
        let mut scores = Vec::new();
        for rowid in 0..rows as u64 {
            let value = ProductValue {
                observed: Observed::empty(Sparsity::All),
                booleans: (0..partition.len()).map(|f| (rowid + f as u64) % 2 == 0).collect(),
                counts: vec![],
                reals: vec![],
            };
            cc.value_split(&value, &mut partials);
            let mut groupids = Vec::new();
            for (kindid, partial) in partials.iter().enumerate() {
                let kind = &mut cc.kinds[kindid];
                let g = kind.mixture.score_and_sample(&kind.model, partial, &mut scores, rng);
                kind.mixture.add_value(&kind.model, g, partial);
                groupids.push(kind.mixture.id_tracker().packed_to_global(g));
            }
            assert!(assignments.append_row(rowid, &groupids));
        }
        (cc, assignments)
    }

    fn config(parallel: usize) -> KernelConfig {
        KernelConfig {
            ephemeral_kind_count: 2,
            iterations: 3,
            max_reject_iters: 5,
            parallel,
            empty_group_count: 1,
        }
    }

    #[test]
    fn prepare_then_cleanup_restores_the_kind_set() {
        let mut rng = StdRng::seed_from_u64(1);
        let (mut cc, mut assignments) = cross_cat_with_rows(&[0, 0, 1, 1], 6, &mut rng);
        let before_kinds: Vec<Vec<usize>> = cc
            .kinds
            .iter()
            .map(|k| k.featureids.iter().copied().collect())
            .collect();

        let kernel = KindKernel::prepare(&mut cc, &mut assignments, config(0), &mut rng);
        assert_eq!(kernel.kind_count(), 4); // 2 featureful + 2 ephemeral
        kernel.cleanup(&mut cc, &mut assignments, &mut rng);

        let after_kinds: Vec<Vec<usize>> = cc
            .kinds
            .iter()
            .map(|k| k.featureids.iter().copied().collect())
            .collect();
        assert_eq!(after_kinds, before_kinds);
        assert_eq!(assignments.kind_count(), cc.kind_count());
        cc.validate();
    }

    #[test]
    fn run_counts_every_feature_and_keeps_the_partition_consistent() {
        let mut rng = StdRng::seed_from_u64(2);
        let (mut cc, mut assignments) = cross_cat_with_rows(&[0, 0, 1, 1], 8, &mut rng);

        let mut kernel = KindKernel::prepare(&mut cc, &mut assignments, config(0), &mut rng);
        let changed = kernel.run(&mut cc, &assignments, &mut rng);
        assert!(changed <= 4);
        assert_eq!(kernel.status().total_count, 4);
        assert_eq!(kernel.status().change_count, changed as u64);

        // Invariant: the feature index and the slot feature sets agree and
        // partition the schema.
        let mut owned = vec![false; cc.schema.total()];
        kernel.with_slots(|kindid, slot| {
            for &f in &slot.kind.featureids {
                assert_eq!(cc.featureid_to_kindid[f], kindid);
                assert!(!owned[f], "feature {} owned twice", f);
                owned[f] = true;
            }
        });
        assert!(owned.iter().all(|&o| o));

        kernel.cleanup(&mut cc, &mut assignments, &mut rng);
        cc.validate();
    }

    #[test]
    fn streamed_rows_keep_partial_and_mirror_counts_in_lock_step() {
        let mut rng = StdRng::seed_from_u64(3);
        let (mut cc, mut assignments) = cross_cat_with_rows(&[0, 1], 5, &mut rng);
        let mut kernel = KindKernel::prepare(&mut cc, &mut assignments, config(0), &mut rng);

        let value = ProductValue {
            observed: Observed::empty(Sparsity::All),
            booleans: vec![true, false],
            counts: vec![],
            reals: vec![],
        };
        assert!(assignments.try_push_rowid(100));
        kernel.process_row(&cc, TaskAction::Add, &value, &mut rng);
        kernel.producer_wait();

        kernel.with_slots(|_, slot| {
            assert_eq!(slot.kind.mixture.count_rows(), 6);
            assert_eq!(slot.mirror.count_rows(), 6);
            assert_eq!(slot.kind.mixture.counts(), slot.mirror.counts());
        });

        // Remove one row (the FIFO head) with its original payload.
        let head = assignments.pop_rowid();
        assert_eq!(head, 0);
        let payload = ProductValue {
            observed: Observed::empty(Sparsity::All),
            booleans: vec![true, false], // rowid 0: (0 + f) % 2 == 0 -> [true, false]
            counts: vec![],
            reals: vec![],
        };
        kernel.process_row(&cc, TaskAction::Remove, &payload, &mut rng);
        kernel.producer_wait();
        kernel.with_slots(|_, slot| {
            assert_eq!(slot.kind.mixture.count_rows(), 5);
            assert_eq!(slot.mirror.count_rows(), 5);
            assert_eq!(slot.kind.mixture.counts(), slot.mirror.counts());
        });

        kernel.cleanup(&mut cc, &mut assignments, &mut rng);
    }

    #[test]
    fn parallel_and_inline_phases_agree_on_row_counts() {
        let mut rng = StdRng::seed_from_u64(4);
        let (mut cc, mut assignments) = cross_cat_with_rows(&[0, 0, 1], 4, &mut rng);
        let mut kernel = KindKernel::prepare(&mut cc, &mut assignments, config(2), &mut rng);

        let value = ProductValue {
            observed: Observed::empty(Sparsity::All),
            booleans: vec![true, true, false],
            counts: vec![],
            reals: vec![],
        };
        for rowid in 50..60 {
            assert!(assignments.try_push_rowid(rowid));
            kernel.process_row(&cc, TaskAction::Add, &value, &mut rng);
        }
        kernel.producer_wait();
        kernel.with_slots(|_, slot| {
            assert_eq!(slot.kind.mixture.count_rows(), 14);
            assert_eq!(slot.groupids.len(), 14);
        });

        let changed = kernel.run(&mut cc, &assignments, &mut rng);
        assert!(changed <= 3);
        kernel.cleanup(&mut cc, &mut assignments, &mut rng);
        cc.validate();
        assignments.validate();
    }

    #[test]
    fn stalled_chains_stop_mixing() {
        let mut rng = StdRng::seed_from_u64(5);
        let (mut cc, mut assignments) = cross_cat_with_rows(&[0], 3, &mut rng);
        let mut cfg = config(0);
        cfg.max_reject_iters = 2;
        let mut kernel = KindKernel::prepare(&mut cc, &mut assignments, cfg, &mut rng);

        // The mixing verdict is exactly "fewer than max_reject_iters
        // consecutive zero-change runs".
        let mut consecutive_zero = 0;
        for _ in 0..30 {
            let changed = kernel.run(&mut cc, &assignments, &mut rng);
            if changed == 0 {
                consecutive_zero += 1;
            } else {
                consecutive_zero = 0;
            }
            assert_eq!(kernel.is_mixing(), consecutive_zero < 2);
            if !kernel.is_mixing() {
                break;
            }
        }
        kernel.cleanup(&mut cc, &mut assignments, &mut rng);
    }
}
