//! Value splitter / joiner
//!
//! Projects a full row value onto per-kind sub-values according to the
//! feature partition `full_to_partid`, and joins dense partials back into a
//! full value for prediction output.
//!
//! Within a kind, features keep the global type order (booleans, then counts,
//! then reals, ascending feature id within each type), so a kind-local
//! sub-schema is itself a valid [`ValueSchema`]. `full_to_part` caches each
//! feature's kind-local position; sparse masks are rewritten through it.
//!
//! Splitting preserves the source sparsity tag. Joining is defined only for
//! dense partials; it walks the full schema one type block at a time with an
//! absolute position cursor per kind (continuous across blocks) and a packed
//! field cursor per kind (reset at each block boundary).
//!
//! Mismatched schemas or field counts here are programmer errors and fail
//! loudly; wire-level validation happens before values reach the splitter.

#![allow(missing_docs)]

use crate::schema::{Field, FieldType, Observed, ProductValue, Sparsity, ValueSchema};

/// Splits full values into per-kind partials and joins them back.
#[derive(Clone, Debug, Default)]
pub struct ValueSplitter {
    schema: ValueSchema,
    full_to_partid: Vec<usize>,
    full_to_part: Vec<usize>,
    part_schemas: Vec<ValueSchema>,
}

impl ValueSplitter {
    /// Build a splitter for `schema` under the feature partition
    /// `full_to_partid` (one entry per feature, values `< part_count`).
    pub fn new(schema: ValueSchema, full_to_partid: Vec<usize>, part_count: usize) -> Self {
        let feature_count = schema.total();
        assert_eq!(
            full_to_partid.len(),
            feature_count,
            "partition covers {} features, schema has {}",
            full_to_partid.len(),
            feature_count
        );
        debug_assert!(full_to_partid.iter().all(|&p| p < part_count));

        let mut part_schemas = vec![ValueSchema::default(); part_count];
        let mut full_to_part = vec![0usize; feature_count];
        for pos in 0..feature_count {
            let part = &mut part_schemas[full_to_partid[pos]];
            full_to_part[pos] = part.total();
            part.add_field(schema.field_type(pos));
        }

        ValueSplitter {
            schema,
            full_to_partid,
            full_to_part,
            part_schemas,
        }
    }

    /// Kind-local sub-schemas, indexed by part id.
    #[inline]
    pub fn part_schemas(&self) -> &[ValueSchema] {
        &self.part_schemas
    }

    /// Number of parts (kinds) in the partition.
    #[inline]
    pub fn part_count(&self) -> usize {
        self.part_schemas.len()
    }

    /// Split `full` into one sub-value per kind, reusing `partials`' buffers.
    pub fn split(&self, full: &ProductValue, partials: &mut Vec<ProductValue>) {
        let sparsity = full.observed.sparsity;
        partials.resize(self.part_count(), ProductValue::unobserved());
        for partial in partials.iter_mut() {
            partial.reset(sparsity);
        }

        let mut cursors = [0usize; 3];
        match sparsity {
            Sparsity::All => {
                for pos in 0..self.schema.total() {
                    let field = take_field(full, self.schema.field_type(pos), &mut cursors);
                    partials[self.full_to_partid[pos]].push_field(field);
                }
            }
            Sparsity::Dense => {
                debug_assert_eq!(full.observed.dense.len(), self.schema.total());
                for pos in 0..self.schema.total() {
                    let partial = &mut partials[self.full_to_partid[pos]];
                    let observed = full.observed.dense[pos];
                    partial.observed.dense.push(observed);
                    if observed {
                        let field = take_field(full, self.schema.field_type(pos), &mut cursors);
                        partial.push_field(field);
                    }
                }
            }
            Sparsity::Sparse => {
                for &pos in &full.observed.sparse {
                    let pos = pos as usize;
                    let partial = &mut partials[self.full_to_partid[pos]];
                    partial.observed.sparse.push(self.full_to_part[pos] as u32);
                    let field = take_field(full, self.schema.field_type(pos), &mut cursors);
                    partial.push_field(field);
                }
            }
            Sparsity::None => {}
        }

        debug_assert_eq!(cursors[0], full.booleans.len());
        debug_assert_eq!(cursors[1], full.counts.len());
        debug_assert_eq!(cursors[2], full.reals.len());
    }

    /// Split a dense observed mask (no fields) into per-kind dense masks.
    pub fn split_observed(&self, full_observed: &Observed, partials: &mut Vec<ProductValue>) {
        assert_eq!(full_observed.sparsity, Sparsity::Dense);
        assert_eq!(full_observed.dense.len(), self.schema.total());

        partials.resize(self.part_count(), ProductValue::unobserved());
        for partial in partials.iter_mut() {
            partial.reset(Sparsity::Dense);
        }
        for pos in 0..self.schema.total() {
            let partial = &mut partials[self.full_to_partid[pos]];
            partial.observed.dense.push(full_observed.dense[pos]);
        }
    }

    /// Join dense partials back into a full dense value.
    pub fn join(&self, full: &mut ProductValue, partials: &[ProductValue]) {
        assert_eq!(partials.len(), self.part_count());
        debug_assert!(partials
            .iter()
            .all(|p| p.observed.sparsity == Sparsity::Dense));

        full.reset(Sparsity::Dense);
        let mut absolute_pos = vec![0usize; self.part_count()];

        let blocks = [
            (0, self.schema.booleans),
            (self.schema.booleans, self.schema.counts),
            (self.schema.booleans + self.schema.counts, self.schema.reals),
        ];
        for &(start, len) in &blocks {
            let mut packed_pos = vec![0usize; self.part_count()];
            for pos in start..start + len {
                let partid = self.full_to_partid[pos];
                let partial = &partials[partid];
                let observed = partial.observed.dense[absolute_pos[partid]];
                absolute_pos[partid] += 1;
                full.observed.dense.push(observed);
                if observed {
                    let packed = packed_pos[partid];
                    packed_pos[partid] += 1;
                    let field = match self.schema.field_type(pos) {
                        FieldType::Boolean => Field::Bool(partial.booleans[packed]),
                        FieldType::Count => Field::Count(partial.counts[packed]),
                        FieldType::Real => Field::Real(partial.reals[packed]),
                    };
                    full.push_field(field);
                }
            }
        }

        debug_assert_eq!(full.observed.dense.len(), self.schema.total());
    }
}

#[inline]
fn take_field(value: &ProductValue, ty: FieldType, cursors: &mut [usize; 3]) -> Field {
    match ty {
        FieldType::Boolean => {
            let f = Field::Bool(value.booleans[cursors[0]]);
            cursors[0] += 1;
            f
        }
        FieldType::Count => {
            let f = Field::Count(value.counts[cursors[1]]);
            cursors[1] += 1;
            f
        }
        FieldType::Real => {
            let f = Field::Real(value.reals[cursors[2]]);
            cursors[2] += 1;
            f
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn dense(mask: &[bool], booleans: &[bool], counts: &[u32], reals: &[f64]) -> ProductValue {
        ProductValue {
            observed: Observed {
                sparsity: Sparsity::Dense,
                dense: mask.to_vec(),
                sparse: vec![],
            },
            booleans: booleans.to_vec(),
            counts: counts.to_vec(),
            reals: reals.to_vec(),
        }
    }

    #[test]
    fn dense_split_then_join_is_identity() {
        // schema {booleans: 2, counts: 1}, partition [0, 0, 1]
        let schema = ValueSchema {
            booleans: 2,
            counts: 1,
            reals: 0,
        };
        let splitter = ValueSplitter::new(schema, vec![0, 0, 1], 2);
        let full = dense(&[true, false, true], &[true], &[7], &[]);

        let mut partials = Vec::new();
        splitter.split(&full, &mut partials);

        assert_eq!(partials[0], dense(&[true, false], &[true], &[], &[]));
        assert_eq!(partials[1], dense(&[true], &[], &[7], &[]));

        let mut joined = ProductValue::unobserved();
        splitter.join(&mut joined, &partials);
        assert_eq!(joined, full);
    }

    #[test]
    fn join_inverts_split_across_interleaved_kinds() {
        // Features of every type alternating between two kinds.
        let schema = ValueSchema {
            booleans: 2,
            counts: 2,
            reals: 2,
        };
        let splitter = ValueSplitter::new(schema, vec![0, 1, 1, 0, 0, 1], 2);
        let full = dense(
            &[true, true, false, true, false, true],
            &[true, false],
            &[5],
            &[2.5],
        );

        let mut partials = Vec::new();
        splitter.split(&full, &mut partials);
        let mut joined = ProductValue::unobserved();
        splitter.join(&mut joined, &partials);
        assert_eq!(joined, full);
    }

    #[test]
    fn sparse_split_rewrites_positions() {
        let schema = ValueSchema {
            booleans: 2,
            counts: 2,
            reals: 0,
        };
        let splitter = ValueSplitter::new(schema, vec![0, 1, 0, 1], 2);
        let full = ProductValue {
            observed: Observed {
                sparsity: Sparsity::Sparse,
                dense: vec![],
                sparse: vec![1, 2],
            },
            booleans: vec![true],
            counts: vec![9],
            reals: vec![],
        };

        let mut partials = Vec::new();
        splitter.split(&full, &mut partials);

        // Feature 1 is kind 1's first boolean; feature 2 is kind 0's first count
        // (kind-local position 1, after kind 0's boolean feature 0).
        assert_eq!(partials[1].observed.sparse, vec![0]);
        assert_eq!(partials[1].booleans, vec![true]);
        assert_eq!(partials[0].observed.sparse, vec![1]);
        assert_eq!(partials[0].counts, vec![9]);
    }

    #[test]
    fn all_split_distributes_every_field() {
        let schema = ValueSchema {
            booleans: 1,
            counts: 1,
            reals: 1,
        };
        let splitter = ValueSplitter::new(schema, vec![0, 1, 0], 2);
        let full = ProductValue {
            observed: Observed::empty(Sparsity::All),
            booleans: vec![true],
            counts: vec![4],
            reals: vec![0.5],
        };

        let mut partials = Vec::new();
        splitter.split(&full, &mut partials);

        assert_eq!(partials[0].booleans, vec![true]);
        assert_eq!(partials[0].reals, vec![0.5]);
        assert_eq!(partials[1].counts, vec![4]);
        assert_eq!(splitter.part_schemas()[0].total(), 2);
        assert_eq!(splitter.part_schemas()[1].total(), 1);
    }

    #[test]
    fn none_split_produces_empty_subvalues() {
        let schema = ValueSchema {
            booleans: 1,
            counts: 0,
            reals: 1,
        };
        let splitter = ValueSplitter::new(schema, vec![0, 1], 2);
        let mut partials = Vec::new();
        splitter.split(&ProductValue::unobserved(), &mut partials);
        assert_eq!(partials.len(), 2);
        for p in &partials {
            assert_eq!(p.observed.sparsity, Sparsity::None);
            assert!(p.booleans.is_empty() && p.counts.is_empty() && p.reals.is_empty());
        }
    }
}
