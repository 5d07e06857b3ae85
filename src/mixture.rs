//! Per-kind product mixtures
//!
//! A [`Mixture`] holds group-level sufficient statistics for one kind: a row
//! count per packed group, a [`GroupStats`] per group (one statistics slot per
//! kind-local feature), and an [`IdTracker`] translating between packed ids
//! (dense, reused via swap-with-last) and global ids (monotonic, never
//! reused).
//!
//! The mixture maintains exactly `empty_group_count` empty groups at rest:
//! scoring spreads the clustering prior's new-table mass uniformly over them,
//! adding a row to an empty group implicitly creates a fresh one, and a group
//! whose count drops to zero is removed on the spot. Packed removal swaps the
//! last group into the freed slot; the tracker updates exactly two entries.
//!
//! `remove_value` is the exact inverse of `add_value`: statistics use integer
//! or raw-sum forms, so add-then-remove restores the previous state bit for
//! bit (see `models`).

#![allow(missing_docs)]

use std::collections::HashMap;

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::models::{
    sample_from_probs, sample_from_scores, BernoulliStats, BetaBernoulli, GammaPoisson, HyperGrid,
    NormalInvChiSq, NormalStats, PitmanYor, PoissonStats,
};
use crate::schema::{Field, FieldType, ProductValue, Sparsity, ValueSchema};

// ============================================================================
// Product model
// ============================================================================

/// Hyperparameters for one kind: a clustering prior plus one hyper per
/// kind-local feature, laid out in the kind-local type order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProductModel {
    pub clustering: PitmanYor,
    pub schema: ValueSchema,
    pub booleans: Vec<BetaBernoulli>,
    pub counts: Vec<GammaPoisson>,
    pub reals: Vec<NormalInvChiSq>,
}

impl ProductModel {
    /// A featureless model with the given clustering prior.
    pub fn featureless(clustering: PitmanYor) -> Self {
        ProductModel {
            clustering,
            schema: ValueSchema::default(),
            booleans: Vec::new(),
            counts: Vec::new(),
            reals: Vec::new(),
        }
    }

    /// Insert a feature hyper at a kind-local index within its type.
    pub fn insert_feature(&mut self, ty: FieldType, idx: usize, hyper: FeatureHyper) {
        self.schema.add_field(ty);
        match (ty, hyper) {
            (FieldType::Boolean, FeatureHyper::Boolean(h)) => self.booleans.insert(idx, h),
            (FieldType::Count, FeatureHyper::Count(h)) => self.counts.insert(idx, h),
            (FieldType::Real, FeatureHyper::Real(h)) => self.reals.insert(idx, h),
            _ => panic!("feature hyper type mismatch"),
        }
    }

    /// Remove a feature hyper at a kind-local index within its type.
    pub fn remove_feature(&mut self, ty: FieldType, idx: usize) -> FeatureHyper {
        self.schema.remove_field(ty);
        match ty {
            FieldType::Boolean => FeatureHyper::Boolean(self.booleans.remove(idx)),
            FieldType::Count => FeatureHyper::Count(self.counts.remove(idx)),
            FieldType::Real => FeatureHyper::Real(self.reals.remove(idx)),
        }
    }

    /// The hyper at a kind-local index within its type.
    pub fn feature_hyper(&self, ty: FieldType, idx: usize) -> FeatureHyper {
        match ty {
            FieldType::Boolean => FeatureHyper::Boolean(self.booleans[idx]),
            FieldType::Count => FeatureHyper::Count(self.counts[idx]),
            FieldType::Real => FeatureHyper::Real(self.reals[idx]),
        }
    }
}

/// A single feature's hyperparameters, tagged by type.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub enum FeatureHyper {
    Boolean(BetaBernoulli),
    Count(GammaPoisson),
    Real(NormalInvChiSq),
}

// ============================================================================
// Group statistics
// ============================================================================

/// Sufficient statistics for one group, one slot per kind-local feature.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupStats {
    pub booleans: Vec<BernoulliStats>,
    pub counts: Vec<PoissonStats>,
    pub reals: Vec<NormalStats>,
}

impl GroupStats {
    fn for_model(model: &ProductModel) -> Self {
        GroupStats {
            booleans: vec![BernoulliStats::default(); model.booleans.len()],
            counts: vec![PoissonStats::default(); model.counts.len()],
            reals: vec![NormalStats::default(); model.reals.len()],
        }
    }

    fn add(&mut self, schema: &ValueSchema, value: &ProductValue) {
        value.for_each_observed(schema, |pos, field| {
            let (i, _) = local_index(schema, pos);
            match field {
                Field::Bool(b) => self.booleans[i].add(b),
                Field::Count(c) => self.counts[i].add(c),
                Field::Real(r) => self.reals[i].add(r),
            }
        });
    }

    fn remove(&mut self, schema: &ValueSchema, value: &ProductValue) {
        value.for_each_observed(schema, |pos, field| {
            let (i, _) = local_index(schema, pos);
            match field {
                Field::Bool(b) => self.booleans[i].remove(b),
                Field::Count(c) => self.counts[i].remove(c),
                Field::Real(r) => self.reals[i].remove(r),
            }
        });
    }
}

/// Translate a kind-local position into a within-type statistics index:
/// the offset from the position's type block start.
#[inline]
fn local_index(schema: &ValueSchema, pos: usize) -> (usize, FieldType) {
    match schema.field_type(pos) {
        FieldType::Boolean => (pos, FieldType::Boolean),
        FieldType::Count => (pos - schema.booleans, FieldType::Count),
        FieldType::Real => (pos - schema.booleans - schema.counts, FieldType::Real),
    }
}

/// One feature's statistics across all groups, used to move a feature
/// between kinds.
#[derive(Clone, Debug)]
pub enum FeatureStatsColumn {
    Booleans(Vec<BernoulliStats>),
    Counts(Vec<PoissonStats>),
    Reals(Vec<NormalStats>),
}

// ============================================================================
// Packed/global id tracker
// ============================================================================

/// Bidirectional translation between packed and global group ids.
///
/// Global ids are monotonic and never reused; packed ids are dense and are
/// recycled by swap-with-last removal, in lock-step with the mixture's own
/// group storage.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IdTracker {
    packed_to_global: Vec<u64>,
    global_to_packed: HashMap<u64, usize>,
    next_global: u64,
}

impl IdTracker {
    /// A tracker for `n` fresh groups: packed `i` maps to global `i`.
    pub fn with_groups(n: usize) -> Self {
        let packed_to_global: Vec<u64> = (0..n as u64).collect();
        let global_to_packed = packed_to_global
            .iter()
            .enumerate()
            .map(|(p, &g)| (g, p))
            .collect();
        IdTracker {
            packed_to_global,
            global_to_packed,
            next_global: n as u64,
        }
    }

    /// Number of live groups.
    #[inline]
    pub fn len(&self) -> usize {
        self.packed_to_global.len()
    }

    /// Whether no groups are tracked.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.packed_to_global.is_empty()
    }

    /// Register a new packed slot at the end; returns its global id.
    pub fn packed_add(&mut self) -> u64 {
        let global = self.next_global;
        self.next_global += 1;
        self.global_to_packed.insert(global, self.packed_to_global.len());
        self.packed_to_global.push(global);
        global
    }

    /// Remove a packed slot, swapping the last slot into its place.
    pub fn packed_remove(&mut self, packed: usize) {
        let global = self.packed_to_global.swap_remove(packed);
        self.global_to_packed.remove(&global);
        if packed < self.packed_to_global.len() {
            let moved_global = self.packed_to_global[packed];
            self.global_to_packed.insert(moved_global, packed);
        }
    }

    /// Global id of a packed slot.
    #[inline]
    pub fn packed_to_global(&self, packed: usize) -> u64 {
        self.packed_to_global[packed]
    }

    /// Packed slot of a global id; panics if the group is gone.
    #[inline]
    pub fn global_to_packed(&self, global: u64) -> usize {
        self.global_to_packed[&global]
    }
}

// ============================================================================
// Mixture
// ============================================================================

/// Group-level state of one kind's mixture.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Mixture {
    counts: Vec<usize>,
    groups: Vec<GroupStats>,
    id_tracker: IdTracker,
    empty_group_count: usize,
    row_count: usize,
}

impl Mixture {
    /// An empty mixture holding only the maintained empty groups.
    pub fn init_empty(model: &ProductModel, empty_group_count: usize) -> Self {
        assert!(empty_group_count > 0, "need at least one empty group");
        Mixture {
            counts: vec![0; empty_group_count],
            groups: vec![GroupStats::for_model(model); empty_group_count],
            id_tracker: IdTracker::with_groups(empty_group_count),
            empty_group_count,
            row_count: 0,
        }
    }

    /// A mixture with the given per-group row counts and all statistics
    /// unobserved, as if every row observed nothing.
    ///
    /// `counts` must already include the maintained empty groups.
    pub fn init_unobserved(
        model: &ProductModel,
        counts: Vec<usize>,
        empty_group_count: usize,
    ) -> Self {
        let empties = counts.iter().filter(|&&c| c == 0).count();
        assert_eq!(empties, empty_group_count, "unexpected empty-group count");
        let row_count = counts.iter().sum();
        let n = counts.len();
        Mixture {
            counts,
            groups: vec![GroupStats::for_model(model); n],
            id_tracker: IdTracker::with_groups(n),
            empty_group_count,
            row_count,
        }
    }

    /// Rebuild from loaded nonempty groups, appending fresh empty groups.
    pub fn from_groups(
        model: &ProductModel,
        loaded: Vec<(usize, GroupStats)>,
        empty_group_count: usize,
    ) -> Self {
        assert!(empty_group_count > 0, "need at least one empty group");
        let mut counts = Vec::with_capacity(loaded.len() + empty_group_count);
        let mut groups = Vec::with_capacity(loaded.len() + empty_group_count);
        for (count, stats) in loaded {
            assert!(count > 0, "loaded groups must be nonempty");
            counts.push(count);
            groups.push(stats);
        }
        for _ in 0..empty_group_count {
            counts.push(0);
            groups.push(GroupStats::for_model(model));
        }
        let row_count = counts.iter().sum();
        let n = counts.len();
        Mixture {
            counts,
            groups,
            id_tracker: IdTracker::with_groups(n),
            empty_group_count,
            row_count,
        }
    }

    /// Number of groups, including the maintained empty ones.
    #[inline]
    pub fn group_count(&self) -> usize {
        self.counts.len()
    }

    /// Total rows across all groups.
    #[inline]
    pub fn count_rows(&self) -> usize {
        self.row_count
    }

    /// Per-group row counts, packed order.
    #[inline]
    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    /// Per-group statistics, packed order.
    #[inline]
    pub fn groups(&self) -> &[GroupStats] {
        &self.groups
    }

    /// The packed/global id tracker.
    #[inline]
    pub fn id_tracker(&self) -> &IdTracker {
        &self.id_tracker
    }

    /// Number of nonempty groups.
    pub fn nonempty_count(&self) -> usize {
        self.counts.iter().filter(|&&c| c > 0).count()
    }

    /// Fill `scores` with per-group log-scores for seating `value`.
    pub fn score_value(&self, model: &ProductModel, value: &ProductValue, scores: &mut Vec<f64>) {
        let nonempty = self.nonempty_count();
        scores.clear();
        scores.reserve(self.counts.len());
        for (count, stats) in self.counts.iter().zip(&self.groups) {
            let mut score = model.clustering.score_add(
                *count,
                self.row_count,
                nonempty,
                self.empty_group_count,
            );
            value.for_each_observed(&model.schema, |pos, field| {
                let (i, _) = local_index(&model.schema, pos);
                score += match field {
                    Field::Bool(b) => model.booleans[i].score_value(&stats.booleans[i], b),
                    Field::Count(c) => model.counts[i].score_value(&stats.counts[i], c),
                    Field::Real(r) => model.reals[i].score_value(&stats.reals[i], r),
                };
            });
            scores.push(score);
        }
    }

    /// Score `value` and Gibbs-sample a packed group id for it.
    pub fn score_and_sample(
        &self,
        model: &ProductModel,
        value: &ProductValue,
        scores: &mut Vec<f64>,
        rng: &mut StdRng,
    ) -> usize {
        self.score_value(model, value, scores);
        sample_from_scores(rng, scores)
    }

    /// Insert `value` into group `groupid`, creating a replacement empty
    /// group when `groupid` was empty.
    pub fn add_value(&mut self, model: &ProductModel, groupid: usize, value: &ProductValue) {
        let was_empty = self.counts[groupid] == 0;
        self.counts[groupid] += 1;
        self.row_count += 1;
        self.groups[groupid].add(&model.schema, value);
        if was_empty {
            self.counts.push(0);
            self.groups.push(GroupStats::for_model(model));
            self.id_tracker.packed_add();
        }
    }

    /// Remove `value` from group `groupid`, dropping the group if it empties.
    pub fn remove_value(&mut self, model: &ProductModel, groupid: usize, value: &ProductValue) {
        assert!(self.counts[groupid] > 0, "remove from empty group {}", groupid);
        self.counts[groupid] -= 1;
        self.row_count -= 1;
        self.groups[groupid].remove(&model.schema, value);
        if self.counts[groupid] == 0 {
            self.counts.swap_remove(groupid);
            self.groups.swap_remove(groupid);
            self.id_tracker.packed_remove(groupid);
        }
    }

    /// Sample a group from `probs`, then fill `value`'s observed positions
    /// with posterior-predictive draws from that group.
    pub fn sample_value(
        &self,
        model: &ProductModel,
        probs: &[f64],
        value: &mut ProductValue,
        rng: &mut StdRng,
    ) {
        assert_eq!(value.observed.sparsity, Sparsity::Dense);
        assert_eq!(value.observed.dense.len(), model.schema.total());
        let groupid = sample_from_probs(rng, probs);
        let stats = &self.groups[groupid];

        value.booleans.clear();
        value.counts.clear();
        value.reals.clear();
        for pos in 0..model.schema.total() {
            if !value.observed.dense[pos] {
                continue;
            }
            let (i, ty) = local_index(&model.schema, pos);
            match ty {
                FieldType::Boolean => {
                    let x = model.booleans[i].sample_value(&stats.booleans[i], rng);
                    value.booleans.push(x);
                }
                FieldType::Count => {
                    let x = model.counts[i].sample_value(&stats.counts[i], rng);
                    value.counts.push(x);
                }
                FieldType::Real => {
                    let x = model.reals[i].sample_value(&stats.reals[i], rng);
                    value.reals.push(x);
                }
            }
        }
    }

    /// Log marginal likelihood of one feature's data under the current
    /// grouping, summed over groups.
    pub fn score_feature(&self, model: &ProductModel, ty: FieldType, idx: usize) -> f64 {
        match ty {
            FieldType::Boolean => {
                let hyper = &model.booleans[idx];
                self.groups.iter().map(|g| hyper.score_stats(&g.booleans[idx])).sum()
            }
            FieldType::Count => {
                let hyper = &model.counts[idx];
                self.groups.iter().map(|g| hyper.score_stats(&g.counts[idx])).sum()
            }
            FieldType::Real => {
                let hyper = &model.reals[idx];
                self.groups.iter().map(|g| hyper.score_stats(&g.reals[idx])).sum()
            }
        }
    }

    /// Joint log-probability of the kind's assignment and data.
    pub fn score_data(&self, model: &ProductModel) -> f64 {
        let mut score = model.clustering.score_counts(&self.counts);
        for idx in 0..model.booleans.len() {
            score += self.score_feature(model, FieldType::Boolean, idx);
        }
        for idx in 0..model.counts.len() {
            score += self.score_feature(model, FieldType::Count, idx);
        }
        for idx in 0..model.reals.len() {
            score += self.score_feature(model, FieldType::Real, idx);
        }
        score
    }

    /// Clone one feature's statistics across all groups.
    pub fn feature_stats_column(&self, ty: FieldType, idx: usize) -> FeatureStatsColumn {
        match ty {
            FieldType::Boolean => {
                FeatureStatsColumn::Booleans(self.groups.iter().map(|g| g.booleans[idx]).collect())
            }
            FieldType::Count => {
                FeatureStatsColumn::Counts(self.groups.iter().map(|g| g.counts[idx]).collect())
            }
            FieldType::Real => {
                FeatureStatsColumn::Reals(self.groups.iter().map(|g| g.reals[idx]).collect())
            }
        }
    }

    /// Install a feature's statistics column at a kind-local index.
    ///
    /// The column must be aligned with this mixture's packed group order.
    pub fn insert_feature(&mut self, idx: usize, column: FeatureStatsColumn) {
        match column {
            FeatureStatsColumn::Booleans(col) => {
                assert_eq!(col.len(), self.groups.len(), "stats column misaligned");
                for (g, s) in self.groups.iter_mut().zip(col) {
                    g.booleans.insert(idx, s);
                }
            }
            FeatureStatsColumn::Counts(col) => {
                assert_eq!(col.len(), self.groups.len(), "stats column misaligned");
                for (g, s) in self.groups.iter_mut().zip(col) {
                    g.counts.insert(idx, s);
                }
            }
            FeatureStatsColumn::Reals(col) => {
                assert_eq!(col.len(), self.groups.len(), "stats column misaligned");
                for (g, s) in self.groups.iter_mut().zip(col) {
                    g.reals.insert(idx, s);
                }
            }
        }
    }

    /// Drop a feature's statistics column at a kind-local index.
    pub fn remove_feature(&mut self, ty: FieldType, idx: usize) {
        for g in self.groups.iter_mut() {
            match ty {
                FieldType::Boolean => {
                    g.booleans.remove(idx);
                }
                FieldType::Count => {
                    g.counts.remove(idx);
                }
                FieldType::Real => {
                    g.reals.remove(idx);
                }
            }
        }
    }

    /// Gibbs-sample the model's hypers from the grid given current data.
    pub fn infer_hypers(&self, model: &mut ProductModel, grid: &HyperGrid, rng: &mut StdRng) {
        if !grid.clustering.is_empty() {
            let scores: Vec<f64> = grid
                .clustering
                .iter()
                .map(|h| h.score_counts(&self.counts))
                .collect();
            model.clustering = grid.clustering[sample_from_scores(rng, &scores)];
        }
        if !grid.booleans.is_empty() {
            for idx in 0..model.booleans.len() {
                let scores: Vec<f64> = grid
                    .booleans
                    .iter()
                    .map(|h| self.groups.iter().map(|g| h.score_stats(&g.booleans[idx])).sum())
                    .collect();
                model.booleans[idx] = grid.booleans[sample_from_scores(rng, &scores)];
            }
        }
        if !grid.counts.is_empty() {
            for idx in 0..model.counts.len() {
                let scores: Vec<f64> = grid
                    .counts
                    .iter()
                    .map(|h| self.groups.iter().map(|g| h.score_stats(&g.counts[idx])).sum())
                    .collect();
                model.counts[idx] = grid.counts[sample_from_scores(rng, &scores)];
            }
        }
        if !grid.reals.is_empty() {
            for idx in 0..model.reals.len() {
                let scores: Vec<f64> = grid
                    .reals
                    .iter()
                    .map(|h| self.groups.iter().map(|g| h.score_stats(&g.reals[idx])).sum())
                    .collect();
                model.reals[idx] = grid.reals[sample_from_scores(rng, &scores)];
            }
        }
    }

    /// Structural consistency check; panics with a diagnostic on violation.
    pub fn validate(&self, model: &ProductModel) {
        assert_eq!(self.counts.len(), self.groups.len());
        assert_eq!(self.counts.len(), self.id_tracker.len());
        assert_eq!(self.row_count, self.counts.iter().sum::<usize>());
        let empties = self.counts.iter().filter(|&&c| c == 0).count();
        assert_eq!(empties, self.empty_group_count, "empty-group invariant");
        for g in &self.groups {
            assert_eq!(g.booleans.len(), model.booleans.len());
            assert_eq!(g.counts.len(), model.counts.len());
            assert_eq!(g.reals.len(), model.reals.len());
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
