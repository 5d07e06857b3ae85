//! Kind set
//!
//! The ordered collection of kinds (disjoint feature subsets, each with a
//! product model and a mixture), the `featureid_to_kindid` index, the
//! feature-level clustering prior, and the hyperparameter grid.
//!
//! Kind removal is packed: the last kind swaps into the freed slot and the
//! moved kind's features are repointed in the index. The value splitter is
//! derived state and is rebuilt whenever the partition changes.
//!
//! Persistence splits across two streams: the model (schema, priors, grid,
//! per-kind feature sets and hypers) as a single record, and the groups (one
//! record per kind, groups in canonical sorted-global-id order). Loading the
//! groups in sorted order makes the stored ids line up with a fresh
//! tracker's packed-equals-global numbering, which is also what the
//! assignment stream's rewritten ids assume.

#![allow(missing_docs)]

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::mixture::{GroupStats, Mixture, ProductModel};
use crate::models::{sample_from_scores, HyperGrid, PitmanYor};
use crate::rows::{read_records, write_records, RowIoError};
use crate::schema::{FieldType, Observed, ProductValue, ValueSchema};
use crate::split::ValueSplitter;

// ============================================================================
// Kind
// ============================================================================

/// One kind: a feature subset, its product model, and its mixture.
#[derive(Clone, Debug)]
pub struct Kind {
    pub featureids: BTreeSet<usize>,
    pub model: ProductModel,
    pub mixture: Mixture,
}

impl Kind {
    /// Kind-local index of `featureid` within its type block, given the
    /// full schema's layout.
    pub fn local_index(&self, featureid: usize, schema: &ValueSchema) -> (FieldType, usize) {
        let ty = schema.field_type(featureid);
        let block_start = match ty {
            FieldType::Boolean => 0,
            FieldType::Count => schema.booleans,
            FieldType::Real => schema.booleans + schema.counts,
        };
        let idx = self.featureids.range(block_start..featureid).count();
        (ty, idx)
    }
}

// ============================================================================
// Persistence records
// ============================================================================

/// The model stream's single record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelDump {
    pub schema: ValueSchema,
    pub feature_clustering: PitmanYor,
    pub hyper_grid: HyperGrid,
    pub kinds: Vec<KindModelDump>,
}

/// One kind's slice of the model stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KindModelDump {
    pub featureids: Vec<u32>,
    pub model: ProductModel,
}

/// One kind's record in the groups stream, canonical sorted order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KindGroupsDump {
    pub groups: Vec<GroupRecord>,
}

/// One nonempty group's row count and statistics.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupRecord {
    pub count: u64,
    pub stats: GroupStats,
}

impl ModelDump {
    /// A model over `schema` with the given feature partition and uniform
    /// default hypers on every feature; handy for bootstrapping a fresh
    /// dataset before any hyper-inference has run.
    pub fn with_default_hypers(schema: ValueSchema, partition: &[usize]) -> Self {
        assert_eq!(partition.len(), schema.total(), "partition size mismatch");
        let kind_count = partition.iter().copied().max().map_or(0, |m| m + 1);
        assert!(kind_count > 0, "at least one kind is required");

        let clustering = PitmanYor { alpha: 1.0, d: 0.0 };
        let mut kinds: Vec<KindModelDump> = (0..kind_count)
            .map(|_| KindModelDump {
                featureids: Vec::new(),
                model: ProductModel::featureless(clustering),
            })
            .collect();
        for featureid in 0..schema.total() {
            let kind = &mut kinds[partition[featureid]];
            kind.featureids.push(featureid as u32);
            match schema.field_type(featureid) {
                FieldType::Boolean => kind
                    .model
                    .booleans
                    .push(crate::models::BetaBernoulli { alpha: 1.0, beta: 1.0 }),
                FieldType::Count => kind
                    .model
                    .counts
                    .push(crate::models::GammaPoisson { shape: 1.0, rate: 1.0 }),
                FieldType::Real => kind.model.reals.push(crate::models::NormalInvChiSq {
                    mu: 0.0,
                    kappa: 1.0,
                    nu: 2.0,
                    sigmasq: 1.0,
                }),
            }
            kind.model.schema.add_field(schema.field_type(featureid));
        }

        ModelDump {
            schema,
            feature_clustering: PitmanYor { alpha: 1.0, d: 0.0 },
            hyper_grid: HyperGrid::default_grid(),
            kinds,
        }
    }
}

// ============================================================================
// CrossCat
// ============================================================================

/// The kind set and its derived feature index and splitter.
#[derive(Clone, Debug)]
pub struct CrossCat {
    pub schema: ValueSchema,
    pub kinds: Vec<Kind>,
    pub featureid_to_kindid: Vec<usize>,
    pub feature_clustering: PitmanYor,
    pub hyper_grid: HyperGrid,
    splitter: ValueSplitter,
}

impl CrossCat {
    /// Build the kind set from a model dump with empty mixtures.
    pub fn from_model(dump: ModelDump, empty_group_count: usize) -> Self {
        let schema = dump.schema;
        let mut featureid_to_kindid = vec![usize::MAX; schema.total()];
        let mut kinds = Vec::with_capacity(dump.kinds.len());
        for (kindid, kind_dump) in dump.kinds.into_iter().enumerate() {
            let mut featureids = BTreeSet::new();
            for &f in &kind_dump.featureids {
                let f = f as usize;
                assert!(f < schema.total(), "featureid {} out of range", f);
                assert_eq!(
                    featureid_to_kindid[f],
                    usize::MAX,
                    "featureid {} claimed by two kinds",
                    f
                );
                featureid_to_kindid[f] = kindid;
                featureids.insert(f);
            }
            let mixture = Mixture::init_empty(&kind_dump.model, empty_group_count);
            kinds.push(Kind {
                featureids,
                model: kind_dump.model,
                mixture,
            });
        }
        for (f, &k) in featureid_to_kindid.iter().enumerate() {
            assert!(k != usize::MAX, "featureid {} belongs to no kind", f);
        }

        let mut cross_cat = CrossCat {
            schema,
            kinds,
            featureid_to_kindid,
            feature_clustering: dump.feature_clustering,
            hyper_grid: dump.hyper_grid,
            splitter: ValueSplitter::default(),
        };
        cross_cat.rebuild_splitter();
        cross_cat.validate();
        cross_cat
    }

    /// Load the model stream.
    pub fn load_model<P: AsRef<Path>>(
        path: P,
        empty_group_count: usize,
    ) -> Result<Self, RowIoError> {
        let mut dumps: Vec<ModelDump> = read_records(path)?;
        assert_eq!(dumps.len(), 1, "model stream must hold exactly one record");
        Ok(CrossCat::from_model(dumps.remove(0), empty_group_count))
    }

    /// Write the model stream.
    pub fn dump_model<P: AsRef<Path>>(&self, path: P) -> Result<(), RowIoError> {
        let dump = ModelDump {
            schema: self.schema,
            feature_clustering: self.feature_clustering,
            hyper_grid: self.hyper_grid.clone(),
            kinds: self
                .kinds
                .iter()
                .map(|kind| KindModelDump {
                    featureids: kind.featureids.iter().map(|&f| f as u32).collect(),
                    model: kind.model.clone(),
                })
                .collect(),
        };
        write_records(path, &[dump])
    }

    /// Reset every mixture to empty.
    pub fn mixture_init_empty(&mut self, empty_group_count: usize) {
        for kind in &mut self.kinds {
            kind.mixture = Mixture::init_empty(&kind.model, empty_group_count);
        }
    }

    /// Load the groups stream (one record per kind, sorted group order).
    pub fn load_groups<P: AsRef<Path>>(
        &mut self,
        path: P,
        empty_group_count: usize,
    ) -> Result<(), RowIoError> {
        let dumps: Vec<KindGroupsDump> = read_records(path)?;
        assert_eq!(dumps.len(), self.kinds.len(), "groups stream kind-count mismatch");
        for (kind, dump) in self.kinds.iter_mut().zip(dumps) {
            let loaded = dump
                .groups
                .into_iter()
                .map(|g| (g.count as usize, g.stats))
                .collect();
            kind.mixture = Mixture::from_groups(&kind.model, loaded, empty_group_count);
        }
        Ok(())
    }

    /// Write the groups stream in canonical sorted-global-id order.
    pub fn dump_groups<P: AsRef<Path>>(&self, path: P) -> Result<(), RowIoError> {
        let records: Vec<KindGroupsDump> = self
            .kinds
            .iter()
            .map(|kind| {
                let groups = self
                    .sorted_packed_ids(kind)
                    .into_iter()
                    .map(|packed| GroupRecord {
                        count: kind.mixture.counts()[packed] as u64,
                        stats: kind.mixture.groups()[packed].clone(),
                    })
                    .collect();
                KindGroupsDump { groups }
            })
            .collect();
        write_records(path, &records)
    }

    /// Nonempty packed ids of a kind, ordered by global id.
    fn sorted_packed_ids(&self, kind: &Kind) -> Vec<usize> {
        let tracker = kind.mixture.id_tracker();
        let mut pairs: Vec<(u64, usize)> = kind
            .mixture
            .counts()
            .iter()
            .enumerate()
            .filter(|&(_, &c)| c > 0)
            .map(|(packed, _)| (tracker.packed_to_global(packed), packed))
            .collect();
        pairs.sort_unstable();
        pairs.into_iter().map(|(_, packed)| packed).collect()
    }

    /// Per-kind maps from global group id to canonical sorted index.
    pub fn group_remap(&self) -> Vec<HashMap<u64, u32>> {
        self.kinds
            .iter()
            .map(|kind| {
                let tracker = kind.mixture.id_tracker();
                self.sorted_packed_ids(kind)
                    .into_iter()
                    .enumerate()
                    .map(|(sorted, packed)| (tracker.packed_to_global(packed), sorted as u32))
                    .collect()
            })
            .collect()
    }

    /// Number of kinds.
    #[inline]
    pub fn kind_count(&self) -> usize {
        self.kinds.len()
    }

    /// Split a full value into per-kind partials.
    #[inline]
    pub fn value_split(&self, value: &ProductValue, partials: &mut Vec<ProductValue>) {
        self.splitter.split(value, partials);
    }

    /// Split a dense observed mask into per-kind dense masks.
    #[inline]
    pub fn value_split_observed(&self, observed: &Observed, partials: &mut Vec<ProductValue>) {
        self.splitter.split_observed(observed, partials);
    }

    /// Join dense per-kind partials into a full value.
    #[inline]
    pub fn value_join(&self, full: &mut ProductValue, partials: &[ProductValue]) {
        self.splitter.join(full, partials);
    }

    /// Append a kind; returns its id.
    pub fn packed_add_kind(&mut self, kind: Kind) -> usize {
        let kindid = self.kinds.len();
        for &f in &kind.featureids {
            self.featureid_to_kindid[f] = kindid;
        }
        self.kinds.push(kind);
        self.rebuild_splitter();
        kindid
    }

    /// Remove a kind, swapping the last one into its slot and repointing
    /// the moved kind's features.
    pub fn packed_remove_kind(&mut self, kindid: usize) {
        self.kinds.swap_remove(kindid);
        if kindid < self.kinds.len() {
            for &f in &self.kinds[kindid].featureids {
                self.featureid_to_kindid[f] = kindid;
            }
        }
        self.rebuild_splitter();
    }

    /// Rebuild the splitter from the current partition.
    pub fn rebuild_splitter(&mut self) {
        self.rebuild_splitter_for(self.kinds.len());
    }

    /// Rebuild the splitter for an explicit part count (the kind-structure
    /// phase holds the kinds in its slots, so `kinds.len()` is not
    /// authoritative there).
    pub fn rebuild_splitter_for(&mut self, part_count: usize) {
        self.splitter =
            ValueSplitter::new(self.schema, self.featureid_to_kindid.clone(), part_count);
    }

    /// Gibbs-sample every kind's hypers and the feature clustering prior
    /// from the grid.
    pub fn infer_hypers(&mut self, rng: &mut StdRng) {
        for kind in &mut self.kinds {
            kind.mixture.infer_hypers(&mut kind.model, &self.hyper_grid, rng);
        }
        self.infer_feature_clustering_hypers(rng);
    }

    /// One grid sweep over the feature-level clustering prior.
    pub fn infer_feature_clustering_hypers(&mut self, rng: &mut StdRng) {
        if self.hyper_grid.clustering.is_empty() {
            return;
        }
        let feature_counts: Vec<usize> = self.kinds.iter().map(|k| k.featureids.len()).collect();
        let scores: Vec<f64> = self
            .hyper_grid
            .clustering
            .iter()
            .map(|h| h.score_counts(&feature_counts))
            .collect();
        self.feature_clustering = self.hyper_grid.clustering[sample_from_scores(rng, &scores)];
    }

    /// Joint log-probability of the current assignment and data.
    pub fn score_data(&self) -> f64 {
        let feature_counts: Vec<usize> = self.kinds.iter().map(|k| k.featureids.len()).collect();
        let mut score = self.feature_clustering.score_counts(&feature_counts);
        for kind in &self.kinds {
            score += kind.mixture.score_data(&kind.model);
        }
        score
    }

    /// Structural consistency check; panics with a diagnostic on violation.
    pub fn validate(&self) {
        assert_eq!(self.featureid_to_kindid.len(), self.schema.total());
        for (f, &k) in self.featureid_to_kindid.iter().enumerate() {
            assert!(k < self.kinds.len(), "featureid {} points at dead kind {}", f, k);
            assert!(
                self.kinds[k].featureids.contains(&f),
                "featureid {} missing from kind {}",
                f,
                k
            );
        }
        let mut seen = 0;
        for (kindid, kind) in self.kinds.iter().enumerate() {
            for &f in &kind.featureids {
                assert_eq!(
                    self.featureid_to_kindid[f], kindid,
                    "featureid {} double-owned",
                    f
                );
                seen += 1;
            }
            assert_eq!(kind.featureids.len(), kind.model.schema.total());
            kind.mixture.validate(&kind.model);
        }
        assert_eq!(seen, self.schema.total(), "partition does not cover the schema");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Sparsity;
    use rand::SeedableRng;
    use tempfile::tempdir;

    fn small_cross_cat() -> CrossCat {
        let schema = ValueSchema {
            booleans: 2,
            counts: 1,
            reals: 1,
        };
        let dump = ModelDump::with_default_hypers(schema, &[0, 0, 1, 1]);
        CrossCat::from_model(dump, 1)
    }

    fn all_value(booleans: &[bool], counts: &[u32], reals: &[f64]) -> ProductValue {
        ProductValue {
            observed: Observed::empty(Sparsity::All),
            booleans: booleans.to_vec(),
            counts: counts.to_vec(),
            reals: reals.to_vec(),
        }
    }

    #[test]
    fn partition_index_and_kinds_stay_bijective() {
        let cc = small_cross_cat();
        cc.validate();
        assert_eq!(cc.kind_count(), 2);
        assert_eq!(cc.featureid_to_kindid, vec![0, 0, 1, 1]);
        assert_eq!(cc.kinds[0].model.schema.booleans, 2);
        assert_eq!(cc.kinds[1].model.schema.counts, 1);
        assert_eq!(cc.kinds[1].model.schema.reals, 1);
    }

    #[test]
    fn packed_remove_repoints_the_moved_kind() {
        // Kind 0 is featureless; kinds 1 and 2 each own two features.
        let schema = ValueSchema {
            booleans: 2,
            counts: 1,
            reals: 1,
        };
        let dump = ModelDump::with_default_hypers(schema, &[1, 1, 2, 2]);
        let mut cc = CrossCat::from_model(dump, 1);
        assert_eq!(cc.kind_count(), 3);
        assert!(cc.kinds[0].featureids.is_empty());

        // Removing the featureless kind swaps kind 2 into slot 0 and
        // repoints its features.
        cc.packed_remove_kind(0);
        cc.validate();
        assert_eq!(cc.kind_count(), 2);
        assert_eq!(cc.featureid_to_kindid, vec![1, 1, 0, 0]);
        assert_eq!(
            cc.kinds[0].featureids.iter().copied().collect::<Vec<_>>(),
            vec![2, 3]
        );
    }

    #[test]
    fn packed_add_registers_new_features() {
        let mut cc = small_cross_cat();
        let clustering = cc.kinds[0].model.clustering;
        let model = ProductModel::featureless(clustering);
        let mixture = Mixture::init_empty(&model, 1);
        let kindid = cc.packed_add_kind(Kind {
            featureids: BTreeSet::new(),
            model,
            mixture,
        });
        assert_eq!(kindid, 2);
        cc.validate();
    }

    #[test]
    fn split_routes_fields_to_their_kinds() {
        let cc = small_cross_cat();
        let value = all_value(&[true, false], &[4], &[0.25]);
        let mut partials = Vec::new();
        cc.value_split(&value, &mut partials);
        assert_eq!(partials[0].booleans, vec![true, false]);
        assert_eq!(partials[1].counts, vec![4]);
        assert_eq!(partials[1].reals, vec![0.25]);
    }

    #[test]
    fn model_and_groups_round_trip_through_files() {
        let dir = tempdir().unwrap();
        let model_path = dir.path().join("model");
        let groups_path = dir.path().join("groups");

        let mut cc = small_cross_cat();
        let mut partials = Vec::new();
        cc.value_split(&all_value(&[true, true], &[2], &[1.0]), &mut partials);
        for (kindid, partial) in partials.iter().enumerate() {
            let kind = &mut cc.kinds[kindid];
            kind.mixture.add_value(&kind.model, 0, partial);
        }
        cc.dump_model(&model_path).unwrap();
        cc.dump_groups(&groups_path).unwrap();

        let mut loaded = CrossCat::load_model(&model_path, 1).unwrap();
        loaded.load_groups(&groups_path, 1).unwrap();
        loaded.validate();
        assert_eq!(loaded.kinds[0].mixture.count_rows(), 1);
        assert_eq!(loaded.kinds[1].mixture.count_rows(), 1);
        assert_eq!(
            loaded.kinds[0].mixture.groups()[0].booleans[0].heads,
            cc.kinds[0].mixture.groups()[0].booleans[0].heads
        );
    }

    #[test]
    fn group_remap_orders_globals_canonically() {
        let mut cc = small_cross_cat();
        let mut partials = Vec::new();
        // Two rows into different groups of kind 0.
        cc.value_split(&all_value(&[true, true], &[1], &[0.0]), &mut partials);
        let kind = &mut cc.kinds[0];
        kind.mixture.add_value(&kind.model, 0, &partials[0]);
        kind.mixture.add_value(&kind.model, 1, &partials[0]);

        let remap = cc.group_remap();
        // Globals 0 and 1 exist; canonical order is sorted by global id.
        assert_eq!(remap[0][&0], 0);
        assert_eq!(remap[0][&1], 1);
    }

    #[test]
    fn hyper_inference_stays_on_the_grid() {
        let mut cc = small_cross_cat();
        let mut partials = Vec::new();
        for i in 0..5 {
            cc.value_split(
                &all_value(&[i % 2 == 0, true], &[i], &[i as f64]),
                &mut partials,
            );
            for (kindid, partial) in partials.iter().enumerate() {
                let kind = &mut cc.kinds[kindid];
                kind.mixture.add_value(&kind.model, 0, partial);
            }
        }
        let mut rng = StdRng::seed_from_u64(5);
        cc.infer_hypers(&mut rng);
        let grid = cc.hyper_grid.clone();
        assert!(grid.clustering.contains(&cc.feature_clustering));
        assert!(grid.booleans.contains(&cc.kinds[0].model.booleans[0]));
    }
}
