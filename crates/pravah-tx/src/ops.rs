//! Row-scoped operators.
//!
//! Each operator is a pure function from an owned batch to at most one
//! owned batch. Operators carry no mutable state; the executor shares one
//! chain across all workers. Schemas are resolved at compile time, so the
//! per-batch work is column-index lookups and compute kernels only.

use std::sync::Arc;

use arrow_arith::boolean::{is_not_null, is_null, or_kleene};
use arrow_array::cast::AsArray;
use arrow_array::{Array, BooleanArray, RecordBatch};
use arrow_cast::{cast_with_options, CastOptions};
use arrow_ord::cmp;
use arrow_schema::{DataType, SchemaRef};
use pravah_core::{select_rows, Batch, CmpOp, EngineError, Result};

use crate::literal::Literal;

/// A pure per-batch transform. `apply` consumes its input and returns the
/// transformed batch, or `None` when every row was filtered out.
pub trait RowOperator: Send + Sync {
    fn name(&self) -> &'static str;
    fn output_schema(&self) -> SchemaRef;
    fn apply(&self, batch: Batch) -> Result<Option<Batch>>;
}

/// Filter rows by one predicate. Null operands compare to null, which never
/// matches; `is_null` / `not_null` are the only way to select nulls.
pub struct Filter {
    pub(crate) column_index: usize,
    pub(crate) op: CmpOp,
    /// Right-hand literal for binary comparisons; the set for `in`.
    pub(crate) operands: Vec<Literal>,
    pub(crate) schema: SchemaRef,
}

impl Filter {
    fn mask(&self, batch: &RecordBatch) -> Result<BooleanArray> {
        let column = batch.column(self.column_index);
        let mask = match self.op {
            CmpOp::IsNull => is_null(column.as_ref())?,
            CmpOp::NotNull => is_not_null(column.as_ref())?,
            CmpOp::Contains => {
                let needle = match self.operands.first() {
                    Some(Literal::Str(s)) => s.as_str(),
                    _ => return Err(EngineError::internal("contains operand must be a string")),
                };
                let haystack = column.as_string::<i32>();
                haystack
                    .iter()
                    .map(|v| v.map(|s| s.contains(needle)))
                    .collect()
            }
            CmpOp::In => {
                // Null column values stay null through each eq, so the
                // Kleene fold keeps them out of the match set.
                let mut acc: Option<BooleanArray> = None;
                for lit in &self.operands {
                    let one = cmp::eq(column, &lit.to_scalar())?;
                    acc = Some(match acc {
                        Some(prev) => or_kleene(&prev, &one)?,
                        None => one,
                    });
                }
                match acc {
                    Some(mask) => mask,
                    None => BooleanArray::from(vec![false; batch.num_rows()]),
                }
            }
            CmpOp::Eq | CmpOp::Ne | CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
                let scalar = self
                    .operands
                    .first()
                    .ok_or_else(|| EngineError::internal("comparison without operand"))?
                    .to_scalar();
                match self.op {
                    CmpOp::Eq => cmp::eq(column, &scalar)?,
                    CmpOp::Ne => cmp::neq(column, &scalar)?,
                    CmpOp::Lt => cmp::lt(column, &scalar)?,
                    CmpOp::Le => cmp::lt_eq(column, &scalar)?,
                    CmpOp::Gt => cmp::gt(column, &scalar)?,
                    CmpOp::Ge => cmp::gt_eq(column, &scalar)?,
                    _ => unreachable!("binary comparison"),
                }
            }
        };
        Ok(mask)
    }
}

impl RowOperator for Filter {
    fn name(&self) -> &'static str {
        "filter"
    }

    fn output_schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn apply(&self, batch: Batch) -> Result<Option<Batch>> {
        let mask = self.mask(&batch)?;
        let out = select_rows(&batch, &mask)?;
        if out.num_rows() == 0 {
            Ok(None)
        } else {
            Ok(Some(out))
        }
    }
}

/// Keep the named columns, in the given order. Column buffers are shared.
pub struct Project {
    pub(crate) indices: Vec<usize>,
    pub(crate) schema: SchemaRef,
}

impl RowOperator for Project {
    fn name(&self) -> &'static str {
        "project"
    }

    fn output_schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn apply(&self, batch: Batch) -> Result<Option<Batch>> {
        Ok(Some(batch.project(&self.indices)?))
    }
}

/// Rename columns; data is untouched.
pub struct Rename {
    pub(crate) schema: SchemaRef,
}

impl RowOperator for Rename {
    fn name(&self) -> &'static str {
        "rename"
    }

    fn output_schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn apply(&self, batch: Batch) -> Result<Option<Batch>> {
        Ok(Some(Batch::try_new(
            self.schema.clone(),
            batch.columns().to_vec(),
        )?))
    }
}

/// Cast one column to a new type. Failures null out, or fail the run with
/// the offending row when strict.
pub struct Cast {
    pub(crate) column_index: usize,
    pub(crate) to: DataType,
    pub(crate) strict: bool,
    pub(crate) step_index: usize,
    pub(crate) schema: SchemaRef,
}

impl RowOperator for Cast {
    fn name(&self) -> &'static str {
        "cast"
    }

    fn output_schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn apply(&self, batch: Batch) -> Result<Option<Batch>> {
        let column = batch.column(self.column_index);
        let options = CastOptions {
            safe: true,
            format_options: Default::default(),
        };
        let cast = cast_with_options(column, &self.to, &options)?;
        if self.strict {
            // Safe casting nulls out failures; a fresh null marks the first
            // offending row.
            if let Some(row) =
                (0..column.len()).find(|&row| !column.is_null(row) && cast.is_null(row))
            {
                return Err(EngineError::Operator {
                    step_index: self.step_index,
                    row_offset: row as u64,
                    reason: format!("cast to {} failed", self.to),
                });
            }
        }
        let mut columns = batch.columns().to_vec();
        columns[self.column_index] = cast;
        Ok(Some(Batch::try_new(self.schema.clone(), columns)?))
    }
}

/// Apply a chain of row operators in order.
pub fn apply_chain(
    operators: &[Arc<dyn RowOperator>],
    batch: Batch,
) -> Result<Option<Batch>> {
    let mut current = batch;
    for op in operators {
        match op.apply(current)? {
            Some(next) => current = next,
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}

#[cfg(test)]
mod tests {
    use arrow_array::types::Int64Type;
    use arrow_array::{Int64Array, StringArray};
    use arrow_schema::{Field, Schema};
    use pravah_core::ValueType;

    use super::*;

    fn batch() -> Batch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("country", DataType::Utf8, true),
            Field::new("age", DataType::Int64, true),
        ]));
        Batch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec![
                    Some("USA"),
                    Some("India"),
                    None,
                    Some("India"),
                ])),
                Arc::new(Int64Array::from(vec![Some(30), Some(24), Some(29), None])),
            ],
        )
        .unwrap()
    }

    fn filter(column_index: usize, op: CmpOp, operands: Vec<Literal>) -> Filter {
        Filter {
            column_index,
            op,
            operands,
            schema: batch().schema(),
        }
    }

    #[test]
    fn eq_skips_nulls() {
        let f = filter(0, CmpOp::Eq, vec![Literal::Str("India".into())]);
        let out = f.apply(batch()).unwrap().unwrap();
        assert_eq!(out.num_rows(), 2);
    }

    #[test]
    fn ne_also_skips_nulls() {
        // Three-valued logic: null != "India" is null, not true.
        let f = filter(0, CmpOp::Ne, vec![Literal::Str("India".into())]);
        let out = f.apply(batch()).unwrap().unwrap();
        assert_eq!(out.num_rows(), 1);
        assert_eq!(
            out.column(0).as_string::<i32>().value(0),
            "USA"
        );
    }

    #[test]
    fn is_null_selects_only_nulls() {
        let f = filter(0, CmpOp::IsNull, vec![]);
        let out = f.apply(batch()).unwrap().unwrap();
        assert_eq!(out.num_rows(), 1);
        assert_eq!(out.column(1).as_primitive::<Int64Type>().value(0), 29);
    }

    #[test]
    fn in_set_and_empty_in() {
        let f = filter(
            0,
            CmpOp::In,
            vec![Literal::Str("USA".into()), Literal::Str("India".into())],
        );
        assert_eq!(f.apply(batch()).unwrap().unwrap().num_rows(), 3);

        let none = filter(0, CmpOp::In, vec![]);
        assert!(none.apply(batch()).unwrap().is_none());
    }

    #[test]
    fn contains_substring() {
        let f = filter(0, CmpOp::Contains, vec![Literal::Str("nd".into())]);
        assert_eq!(f.apply(batch()).unwrap().unwrap().num_rows(), 2);
    }

    #[test]
    fn ordering_comparison() {
        let f = filter(1, CmpOp::Ge, vec![Literal::Int(29)]);
        let out = f.apply(batch()).unwrap().unwrap();
        assert_eq!(out.num_rows(), 2);
    }

    #[test]
    fn filter_composition_commutes() {
        let a = filter(0, CmpOp::Eq, vec![Literal::Str("India".into())]);
        let b = filter(1, CmpOp::Lt, vec![Literal::Int(29)]);

        let ab = a
            .apply(batch())
            .unwrap()
            .and_then(|x| b.apply(x).transpose())
            .transpose()
            .unwrap();
        let ba = b
            .apply(batch())
            .unwrap()
            .and_then(|x| a.apply(x).transpose())
            .transpose()
            .unwrap();
        let rows = |o: &Option<Batch>| o.as_ref().map(|b| b.num_rows()).unwrap_or(0);
        assert_eq!(rows(&ab), 1);
        assert_eq!(rows(&ab), rows(&ba));
    }

    #[test]
    fn cast_nulls_failures_unless_strict() {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Utf8, true)]));
        let b = Batch::try_new(
            schema.clone(),
            vec![Arc::new(StringArray::from(vec!["30", "oops"]))],
        )
        .unwrap();
        let out_schema = Arc::new(Schema::new(vec![Field::new(
            "v",
            ValueType::Int64.to_arrow(),
            true,
        )]));

        let lenient = Cast {
            column_index: 0,
            to: DataType::Int64,
            strict: false,
            step_index: 0,
            schema: out_schema.clone(),
        };
        let out = lenient.apply(b.clone()).unwrap().unwrap();
        let col = out.column(0).as_primitive::<Int64Type>();
        assert_eq!(col.value(0), 30);
        assert!(col.is_null(1));

        let strict = Cast {
            column_index: 0,
            to: DataType::Int64,
            strict: true,
            step_index: 3,
            schema: out_schema,
        };
        let err = strict.apply(b).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Operator {
                step_index: 3,
                row_offset: 1,
                ..
            }
        ));
    }
}
