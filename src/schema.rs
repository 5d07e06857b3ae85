//! Product values and the fixed feature schema
//!
//! A row's payload is a [`ProductValue`]: an observed mask plus three typed
//! field arrays (booleans, counts, reals). The [`ValueSchema`] fixes how many
//! features of each type exist; feature ids are laid out booleans first, then
//! counts, then reals, and never change after startup.
//!
//! The observed mask supports four sparsity encodings:
//!
//! - `All`: every feature observed, no mask stored.
//! - `Dense`: one bit per feature; a set bit consumes the next typed field.
//! - `Sparse`: ascending feature ids; each consumes the next typed field.
//! - `None`: nothing observed, all arrays empty.
//!
//! Validation distinguishes two audiences: queries arriving over the wire are
//! checked with [`ValueSchema::validate`] and rejected per-query, while values
//! produced internally (by the splitter or samplers) are trusted and checked
//! only by debug assertions.

#![allow(missing_docs)]

use serde::{Deserialize, Serialize};

/// Typed field counts of the full schema (or of a kind-local sub-schema).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueSchema {
    /// Number of boolean features.
    pub booleans: usize,
    /// Number of count features.
    pub counts: usize,
    /// Number of real features.
    pub reals: usize,
}

/// The type of a single feature position.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FieldType {
    Boolean,
    Count,
    Real,
}

impl ValueSchema {
    /// Total number of feature positions.
    #[inline]
    pub fn total(&self) -> usize {
        self.booleans + self.counts + self.reals
    }

    /// The field type at feature position `featureid`.
    ///
    /// Panics if `featureid` is out of range (programmer error).
    #[inline]
    pub fn field_type(&self, featureid: usize) -> FieldType {
        if featureid < self.booleans {
            FieldType::Boolean
        } else if featureid < self.booleans + self.counts {
            FieldType::Count
        } else {
            assert!(featureid < self.total(), "featureid {} out of range", featureid);
            FieldType::Real
        }
    }

    /// Add one feature of the given type (kind-local schema bookkeeping).
    pub fn add_field(&mut self, ty: FieldType) {
        match ty {
            FieldType::Boolean => self.booleans += 1,
            FieldType::Count => self.counts += 1,
            FieldType::Real => self.reals += 1,
        }
    }

    /// Remove one feature of the given type.
    pub fn remove_field(&mut self, ty: FieldType) {
        match ty {
            FieldType::Boolean => self.booleans -= 1,
            FieldType::Count => self.counts -= 1,
            FieldType::Real => self.reals -= 1,
        }
    }

    /// Check a value against this schema, reporting the first violation.
    pub fn validate(&self, value: &ProductValue) -> Result<(), SchemaError> {
        let observed = &value.observed;
        match observed.sparsity {
            Sparsity::All => {
                if !observed.dense.is_empty() || !observed.sparse.is_empty() {
                    return Err(SchemaError::MaskNotEmpty);
                }
                self.check_field_counts(value, self.booleans, self.counts, self.reals)
            }
            Sparsity::Dense => {
                if observed.dense.len() != self.total() {
                    return Err(SchemaError::DenseSize {
                        got: observed.dense.len(),
                        want: self.total(),
                    });
                }
                if !observed.sparse.is_empty() {
                    return Err(SchemaError::MaskNotEmpty);
                }
                let mut want = [0usize; 3];
                for (pos, &bit) in observed.dense.iter().enumerate() {
                    if bit {
                        want[type_index(self.field_type(pos))] += 1;
                    }
                }
                self.check_field_counts(value, want[0], want[1], want[2])
            }
            Sparsity::Sparse => {
                if !observed.dense.is_empty() {
                    return Err(SchemaError::MaskNotEmpty);
                }
                let mut want = [0usize; 3];
                let mut prev: Option<u32> = None;
                for &pos in &observed.sparse {
                    if pos as usize >= self.total() {
                        return Err(SchemaError::SparseOutOfRange { pos });
                    }
                    if let Some(p) = prev {
                        if pos <= p {
                            return Err(SchemaError::SparseNotAscending { pos });
                        }
                    }
                    prev = Some(pos);
                    want[type_index(self.field_type(pos as usize))] += 1;
                }
                self.check_field_counts(value, want[0], want[1], want[2])
            }
            Sparsity::None => {
                if !observed.dense.is_empty() || !observed.sparse.is_empty() {
                    return Err(SchemaError::MaskNotEmpty);
                }
                self.check_field_counts(value, 0, 0, 0)
            }
        }
    }

    fn check_field_counts(
        &self,
        value: &ProductValue,
        booleans: usize,
        counts: usize,
        reals: usize,
    ) -> Result<(), SchemaError> {
        if value.booleans.len() != booleans {
            return Err(SchemaError::FieldCount {
                ty: "booleans",
                got: value.booleans.len(),
                want: booleans,
            });
        }
        if value.counts.len() != counts {
            return Err(SchemaError::FieldCount {
                ty: "counts",
                got: value.counts.len(),
                want: counts,
            });
        }
        if value.reals.len() != reals {
            return Err(SchemaError::FieldCount {
                ty: "reals",
                got: value.reals.len(),
                want: reals,
            });
        }
        Ok(())
    }

    /// Check a dense observed mask (no fields), as used by predict queries.
    pub fn validate_mask(&self, observed: &Observed) -> Result<(), SchemaError> {
        if observed.sparsity != Sparsity::Dense {
            return Err(SchemaError::MaskNotDense);
        }
        if observed.dense.len() != self.total() {
            return Err(SchemaError::DenseSize {
                got: observed.dense.len(),
                want: self.total(),
            });
        }
        if !observed.sparse.is_empty() {
            return Err(SchemaError::MaskNotEmpty);
        }
        Ok(())
    }
}

#[inline]
fn type_index(ty: FieldType) -> usize {
    match ty {
        FieldType::Boolean => 0,
        FieldType::Count => 1,
        FieldType::Real => 2,
    }
}

/// Schema violations in externally supplied values.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("observed mask must be empty for this sparsity")]
    MaskNotEmpty,
    #[error("dense mask has {got} bits, schema has {want} features")]
    DenseSize { got: usize, want: usize },
    #[error("sparse feature id {pos} out of range")]
    SparseOutOfRange { pos: u32 },
    #[error("sparse feature ids must be strictly ascending (at {pos})")]
    SparseNotAscending { pos: u32 },
    #[error("{ty} field count is {got}, observed mask implies {want}")]
    FieldCount {
        ty: &'static str,
        got: usize,
        want: usize,
    },
    #[error("observed mask must be dense")]
    MaskNotDense,
}

/// Sparsity tag of an observed mask.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sparsity {
    All,
    Dense,
    Sparse,
    None,
}

/// Which feature positions of a value carry data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Observed {
    pub sparsity: Sparsity,
    /// One bit per feature position; only for `Sparsity::Dense`.
    pub dense: Vec<bool>,
    /// Strictly ascending feature ids; only for `Sparsity::Sparse`.
    pub sparse: Vec<u32>,
}

impl Observed {
    /// An empty mask of the given sparsity.
    pub fn empty(sparsity: Sparsity) -> Self {
        Observed {
            sparsity,
            dense: Vec::new(),
            sparse: Vec::new(),
        }
    }

    /// A dense mask covering `len` features, all unobserved.
    pub fn dense_false(len: usize) -> Self {
        Observed {
            sparsity: Sparsity::Dense,
            dense: vec![false; len],
            sparse: Vec::new(),
        }
    }
}

/// A single typed field value.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Field {
    Bool(bool),
    Count(u32),
    Real(f64),
}

/// A row payload: observed mask plus typed field arrays.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProductValue {
    pub observed: Observed,
    pub booleans: Vec<bool>,
    pub counts: Vec<u32>,
    pub reals: Vec<f64>,
}

impl ProductValue {
    /// A value observing nothing (`Sparsity::None`).
    pub fn unobserved() -> Self {
        ProductValue {
            observed: Observed::empty(Sparsity::None),
            booleans: Vec::new(),
            counts: Vec::new(),
            reals: Vec::new(),
        }
    }

    /// Clear all fields and reset the mask to the given sparsity.
    pub fn reset(&mut self, sparsity: Sparsity) {
        self.observed.sparsity = sparsity;
        self.observed.dense.clear();
        self.observed.sparse.clear();
        self.booleans.clear();
        self.counts.clear();
        self.reals.clear();
    }

    /// Append one field of the position's type.
    pub fn push_field(&mut self, field: Field) {
        match field {
            Field::Bool(b) => self.booleans.push(b),
            Field::Count(c) => self.counts.push(c),
            Field::Real(r) => self.reals.push(r),
        }
    }

    /// Visit every observed `(position, field)` pair in position order.
    ///
    /// Positions are relative to `schema` (the full schema for full values,
    /// the kind-local schema for partial values). The value is assumed valid
    /// against `schema`; malformed internal values trip debug assertions.
    pub fn for_each_observed<F>(&self, schema: &ValueSchema, mut visit: F)
    where
        F: FnMut(usize, Field),
    {
        let mut cursors = FieldCursors::default();
        match self.observed.sparsity {
            Sparsity::All => {
                for pos in 0..schema.total() {
                    let field = cursors.take(self, schema.field_type(pos));
                    visit(pos, field);
                }
            }
            Sparsity::Dense => {
                debug_assert_eq!(self.observed.dense.len(), schema.total());
                for pos in 0..schema.total() {
                    if self.observed.dense[pos] {
                        let field = cursors.take(self, schema.field_type(pos));
                        visit(pos, field);
                    }
                }
            }
            Sparsity::Sparse => {
                for &pos in &self.observed.sparse {
                    let pos = pos as usize;
                    let field = cursors.take(self, schema.field_type(pos));
                    visit(pos, field);
                }
            }
            Sparsity::None => {}
        }
        cursors.debug_assert_exhausted(self);
    }
}

/// Per-type read cursors over a value's field arrays.
#[derive(Default)]
struct FieldCursors {
    booleans: usize,
    counts: usize,
    reals: usize,
}

impl FieldCursors {
    fn take(&mut self, value: &ProductValue, ty: FieldType) -> Field {
        match ty {
            FieldType::Boolean => {
                let f = Field::Bool(value.booleans[self.booleans]);
                self.booleans += 1;
                f
            }
            FieldType::Count => {
                let f = Field::Count(value.counts[self.counts]);
                self.counts += 1;
                f
            }
            FieldType::Real => {
                let f = Field::Real(value.reals[self.reals]);
                self.reals += 1;
                f
            }
        }
    }

    fn debug_assert_exhausted(&self, value: &ProductValue) {
        debug_assert_eq!(self.booleans, value.booleans.len());
        debug_assert_eq!(self.counts, value.counts.len());
        debug_assert_eq!(self.reals, value.reals.len());
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> ValueSchema {
        ValueSchema {
            booleans: 2,
            counts: 1,
            reals: 1,
        }
    }

    #[test]
    fn field_types_follow_layout() {
        let s = schema();
        assert_eq!(s.total(), 4);
        assert_eq!(s.field_type(0), FieldType::Boolean);
        assert_eq!(s.field_type(1), FieldType::Boolean);
        assert_eq!(s.field_type(2), FieldType::Count);
        assert_eq!(s.field_type(3), FieldType::Real);
    }

    #[test]
    fn validate_dense_counts_fields_against_mask() {
        let s = schema();
        let good = ProductValue {
            observed: Observed {
                sparsity: Sparsity::Dense,
                dense: vec![true, false, true, false],
                sparse: vec![],
            },
            booleans: vec![true],
            counts: vec![7],
            reals: vec![],
        };
        assert!(s.validate(&good).is_ok());

        let mut bad = good.clone();
        bad.counts.clear();
        assert!(matches!(
            s.validate(&bad),
            Err(SchemaError::FieldCount { ty: "counts", .. })
        ));
    }

    #[test]
    fn validate_sparse_requires_ascending_ids() {
        let s = schema();
        let bad = ProductValue {
            observed: Observed {
                sparsity: Sparsity::Sparse,
                dense: vec![],
                sparse: vec![2, 1],
            },
            booleans: vec![false],
            counts: vec![1],
            reals: vec![],
        };
        assert!(matches!(
            s.validate(&bad),
            Err(SchemaError::SparseNotAscending { .. })
        ));
    }

    #[test]
    fn for_each_observed_walks_all_sparsities() {
        let s = schema();

        let all = ProductValue {
            observed: Observed::empty(Sparsity::All),
            booleans: vec![true, false],
            counts: vec![3],
            reals: vec![1.5],
        };
        let mut seen = Vec::new();
        all.for_each_observed(&s, |pos, field| seen.push((pos, field)));
        assert_eq!(
            seen,
            vec![
                (0, Field::Bool(true)),
                (1, Field::Bool(false)),
                (2, Field::Count(3)),
                (3, Field::Real(1.5)),
            ]
        );

        let sparse = ProductValue {
            observed: Observed {
                sparsity: Sparsity::Sparse,
                dense: vec![],
                sparse: vec![1, 3],
            },
            booleans: vec![true],
            counts: vec![],
            reals: vec![2.0],
        };
        let mut seen = Vec::new();
        sparse.for_each_observed(&s, |pos, field| seen.push((pos, field)));
        assert_eq!(seen, vec![(1, Field::Bool(true)), (3, Field::Real(2.0))]);

        let none = ProductValue::unobserved();
        let mut count = 0;
        none.for_each_observed(&s, |_, _| count += 1);
        assert_eq!(count, 0);
    }
}
