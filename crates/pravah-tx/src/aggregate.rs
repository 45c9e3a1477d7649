//! Group-by aggregation.
//!
//! One hash map from group-key tuple to accumulator state, owned by a
//! single stage. Batches are absorbed in reader order, so first-insertion
//! order of the output is determined by the input and not by worker races.

use std::collections::HashMap;
use std::sync::Arc;

use arrow_array::builder::{
    BooleanBuilder, Float64Builder, Int64Builder, StringBuilder, TimestampMicrosecondBuilder,
};
use arrow_array::cast::AsArray;
use arrow_array::types::{Float64Type, Int64Type, TimestampMicrosecondType};
use arrow_array::{Array, ArrayRef};
use arrow_schema::{DataType, SchemaRef, TimeUnit};
use pravah_core::{AggFn, Batch, EngineError, Result, ValueType};

/// Compiled shape of an aggregate step.
#[derive(Debug, Clone)]
pub struct AggregatorSpec {
    pub group_indices: Vec<usize>,
    pub aggs: Vec<AggInit>,
    pub output_schema: SchemaRef,
    pub step_index: usize,
}

/// One aggregation column: input column (or `None` for `count(*)`) and fn.
#[derive(Debug, Clone)]
pub struct AggInit {
    pub input_index: Option<usize>,
    pub input_type: Option<ValueType>,
    pub func: AggFn,
}

/// Hashable group-key component. Floats key by bit pattern; the engine
/// never produces distinct NaNs as group keys from real data without them
/// simply forming separate groups, which is acceptable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum KeyValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(u64),
    Str(String),
    Ts(i64),
}

impl KeyValue {
    fn size_estimate(&self) -> usize {
        match self {
            KeyValue::Str(s) => 24 + s.len(),
            _ => 16,
        }
    }
}

fn key_value(column: &ArrayRef, row: usize) -> Result<KeyValue> {
    if column.is_null(row) {
        return Ok(KeyValue::Null);
    }
    Ok(match column.data_type() {
        DataType::Int64 => KeyValue::Int(column.as_primitive::<Int64Type>().value(row)),
        DataType::Float64 => {
            KeyValue::Float(column.as_primitive::<Float64Type>().value(row).to_bits())
        }
        DataType::Boolean => KeyValue::Bool(column.as_boolean().value(row)),
        DataType::Utf8 => KeyValue::Str(column.as_string::<i32>().value(row).to_string()),
        DataType::Timestamp(TimeUnit::Microsecond, _) => {
            KeyValue::Ts(column.as_primitive::<TimestampMicrosecondType>().value(row))
        }
        other => {
            return Err(EngineError::internal(format!(
                "ungroupable column type {other}"
            )))
        }
    })
}

/// Accumulator state for one (group, aggregation) cell. Sum and mean skip
/// nulls; count counts non-null values, or rows for `count(*)`; min/max use
/// type-native ordering (strings by Unicode code point).
enum AccState {
    CountStar { n: i64 },
    Count { n: i64 },
    SumInt { sum: i64, seen: bool },
    SumFloat { sum: f64, seen: bool },
    Mean { sum: f64, n: i64 },
    MinMaxInt { v: Option<i64>, is_min: bool },
    MinMaxFloat { v: Option<f64>, is_min: bool },
    MinMaxBool { v: Option<bool>, is_min: bool },
    MinMaxStr { v: Option<String>, is_min: bool },
    MinMaxTs { v: Option<i64>, is_min: bool },
}

impl AccState {
    fn new(init: &AggInit) -> Result<Self> {
        Ok(match (init.func, init.input_index, init.input_type) {
            (AggFn::Count, None, _) => AccState::CountStar { n: 0 },
            (AggFn::Count, Some(_), _) => AccState::Count { n: 0 },
            (AggFn::Sum, _, Some(ValueType::Int64)) => AccState::SumInt { sum: 0, seen: false },
            (AggFn::Sum, _, Some(ValueType::Float64)) => {
                AccState::SumFloat { sum: 0.0, seen: false }
            }
            (AggFn::Mean, _, Some(_)) => AccState::Mean { sum: 0.0, n: 0 },
            (f @ (AggFn::Min | AggFn::Max), _, Some(vt)) => {
                let is_min = f == AggFn::Min;
                match vt {
                    ValueType::Int64 => AccState::MinMaxInt { v: None, is_min },
                    ValueType::Float64 => AccState::MinMaxFloat { v: None, is_min },
                    ValueType::Bool => AccState::MinMaxBool { v: None, is_min },
                    ValueType::String => AccState::MinMaxStr { v: None, is_min },
                    ValueType::Timestamp => AccState::MinMaxTs { v: None, is_min },
                }
            }
            _ => return Err(EngineError::internal("mistyped aggregation")),
        })
    }
}

/// The single blocking stage of a pipeline: absorbs batches, emits one row
/// per group on finalize.
pub struct Aggregator {
    spec: AggregatorSpec,
    groups: HashMap<Box<[KeyValue]>, usize>,
    keys: Vec<Box<[KeyValue]>>,
    states: Vec<Vec<AccState>>,
    state_bytes: usize,
    rows_absorbed: u64,
}

impl Aggregator {
    pub fn new(spec: AggregatorSpec) -> Self {
        Self {
            spec,
            groups: HashMap::new(),
            keys: Vec::new(),
            states: Vec::new(),
            state_bytes: 0,
            rows_absorbed: 0,
        }
    }

    /// Approximate heap footprint of the accumulated group state.
    pub fn state_bytes(&self) -> usize {
        self.state_bytes
    }

    pub fn absorb(&mut self, batch: &Batch) -> Result<()> {
        let key_columns: Vec<&ArrayRef> = self
            .spec
            .group_indices
            .iter()
            .map(|&i| batch.column(i))
            .collect();
        let agg_columns: Vec<Option<&ArrayRef>> = self
            .spec
            .aggs
            .iter()
            .map(|a| a.input_index.map(|i| batch.column(i)))
            .collect();

        for row in 0..batch.num_rows() {
            let key: Box<[KeyValue]> = key_columns
                .iter()
                .map(|col| key_value(col, row))
                .collect::<Result<Vec<_>>>()?
                .into_boxed_slice();
            let group = match self.groups.get(&key) {
                Some(&g) => g,
                None => {
                    let g = self.keys.len();
                    self.state_bytes += key.iter().map(KeyValue::size_estimate).sum::<usize>()
                        + self.spec.aggs.len() * 48;
                    self.groups.insert(key.clone(), g);
                    self.keys.push(key);
                    self.states.push(
                        self.spec
                            .aggs
                            .iter()
                            .map(AccState::new)
                            .collect::<Result<Vec<_>>>()?,
                    );
                    g
                }
            };
            let row_offset = self.rows_absorbed + row as u64;
            for (state, column) in self.states[group].iter_mut().zip(&agg_columns) {
                self.state_bytes = accumulate(
                    state,
                    *column,
                    row,
                    row_offset,
                    self.spec.step_index,
                    self.state_bytes,
                )?;
            }
        }
        self.rows_absorbed += batch.num_rows() as u64;
        Ok(())
    }

    /// Emit one row per group in first-insertion order, chunked into
    /// batches of at most `batch_rows`.
    pub fn finalize(self, batch_rows: usize) -> Result<Vec<Batch>> {
        let schema = self.spec.output_schema.clone();
        let n_groups = self.keys.len();
        let mut batches = Vec::new();
        let chunk = batch_rows.max(1);
        let mut start = 0;
        while start < n_groups {
            let end = (start + chunk).min(n_groups);
            let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());
            for (k, field) in schema.fields().iter().enumerate() {
                if k < self.spec.group_indices.len() {
                    columns.push(build_key_column(
                        field.data_type(),
                        self.keys[start..end].iter().map(|key| &key[k]),
                    )?);
                } else {
                    let agg = k - self.spec.group_indices.len();
                    columns.push(build_agg_column(
                        self.states[start..end].iter().map(|s| &s[agg]),
                    ));
                }
            }
            batches.push(Batch::try_new(schema.clone(), columns)?);
            start = end;
        }
        Ok(batches)
    }
}

fn accumulate(
    state: &mut AccState,
    column: Option<&ArrayRef>,
    row: usize,
    row_offset: u64,
    step_index: usize,
    mut state_bytes: usize,
) -> Result<usize> {
    match state {
        AccState::CountStar { n } => *n += 1,
        AccState::Count { n } => {
            let col = column.ok_or_else(|| EngineError::internal("count column missing"))?;
            if !col.is_null(row) {
                *n += 1;
            }
        }
        AccState::SumInt { sum, seen } => {
            let col = column.ok_or_else(|| EngineError::internal("sum column missing"))?;
            if !col.is_null(row) {
                let v = col.as_primitive::<Int64Type>().value(row);
                *sum = sum.checked_add(v).ok_or(EngineError::Operator {
                    step_index,
                    row_offset,
                    reason: "int64 sum overflow".into(),
                })?;
                *seen = true;
            }
        }
        AccState::SumFloat { sum, seen } => {
            let col = column.ok_or_else(|| EngineError::internal("sum column missing"))?;
            if !col.is_null(row) {
                *sum += col.as_primitive::<Float64Type>().value(row);
                *seen = true;
            }
        }
        AccState::Mean { sum, n } => {
            let col = column.ok_or_else(|| EngineError::internal("mean column missing"))?;
            if !col.is_null(row) {
                *sum += match col.data_type() {
                    DataType::Int64 => col.as_primitive::<Int64Type>().value(row) as f64,
                    _ => col.as_primitive::<Float64Type>().value(row),
                };
                *n += 1;
            }
        }
        AccState::MinMaxInt { v, is_min } => {
            let col = column.ok_or_else(|| EngineError::internal("minmax column missing"))?;
            if !col.is_null(row) {
                let x = col.as_primitive::<Int64Type>().value(row);
                *v = Some(v.map_or(x, |cur| if *is_min { cur.min(x) } else { cur.max(x) }));
            }
        }
        AccState::MinMaxFloat { v, is_min } => {
            let col = column.ok_or_else(|| EngineError::internal("minmax column missing"))?;
            if !col.is_null(row) {
                let x = col.as_primitive::<Float64Type>().value(row);
                *v = Some(v.map_or(x, |cur| if *is_min { cur.min(x) } else { cur.max(x) }));
            }
        }
        AccState::MinMaxBool { v, is_min } => {
            let col = column.ok_or_else(|| EngineError::internal("minmax column missing"))?;
            if !col.is_null(row) {
                let x = col.as_boolean().value(row);
                *v = Some(v.map_or(x, |cur| if *is_min { cur & x } else { cur | x }));
            }
        }
        AccState::MinMaxStr { v, is_min } => {
            let col = column.ok_or_else(|| EngineError::internal("minmax column missing"))?;
            if !col.is_null(row) {
                let x = col.as_string::<i32>().value(row);
                let replace = match v.as_deref() {
                    None => true,
                    Some(cur) => {
                        if *is_min {
                            x < cur
                        } else {
                            x > cur
                        }
                    }
                };
                if replace {
                    if let Some(old) = v.as_deref() {
                        state_bytes = state_bytes.saturating_sub(old.len());
                    }
                    state_bytes += x.len();
                    *v = Some(x.to_string());
                }
            }
        }
        AccState::MinMaxTs { v, is_min } => {
            let col = column.ok_or_else(|| EngineError::internal("minmax column missing"))?;
            if !col.is_null(row) {
                let x = col.as_primitive::<TimestampMicrosecondType>().value(row);
                *v = Some(v.map_or(x, |cur| if *is_min { cur.min(x) } else { cur.max(x) }));
            }
        }
    }
    Ok(state_bytes)
}

fn build_key_column<'a>(
    data_type: &DataType,
    keys: impl Iterator<Item = &'a KeyValue>,
) -> Result<ArrayRef> {
    Ok(match data_type {
        DataType::Int64 => {
            let mut b = Int64Builder::new();
            for k in keys {
                match k {
                    KeyValue::Int(v) => b.append_value(*v),
                    _ => b.append_null(),
                }
            }
            Arc::new(b.finish())
        }
        DataType::Float64 => {
            let mut b = Float64Builder::new();
            for k in keys {
                match k {
                    KeyValue::Float(bits) => b.append_value(f64::from_bits(*bits)),
                    _ => b.append_null(),
                }
            }
            Arc::new(b.finish())
        }
        DataType::Boolean => {
            let mut b = BooleanBuilder::new();
            for k in keys {
                match k {
                    KeyValue::Bool(v) => b.append_value(*v),
                    _ => b.append_null(),
                }
            }
            Arc::new(b.finish())
        }
        DataType::Utf8 => {
            let mut b = StringBuilder::new();
            for k in keys {
                match k {
                    KeyValue::Str(v) => b.append_value(v),
                    _ => b.append_null(),
                }
            }
            Arc::new(b.finish())
        }
        DataType::Timestamp(TimeUnit::Microsecond, _) => {
            let mut b = TimestampMicrosecondBuilder::new();
            for k in keys {
                match k {
                    KeyValue::Ts(v) => b.append_value(*v),
                    _ => b.append_null(),
                }
            }
            Arc::new(b.finish().with_timezone("UTC"))
        }
        other => {
            return Err(EngineError::internal(format!(
                "ungroupable column type {other}"
            )))
        }
    })
}

fn build_agg_column<'a>(states: impl Iterator<Item = &'a AccState>) -> ArrayRef {
    let states: Vec<&AccState> = states.collect();
    match states.first() {
        Some(AccState::CountStar { .. }) | Some(AccState::Count { .. }) => {
            let mut b = Int64Builder::new();
            for s in &states {
                match s {
                    AccState::CountStar { n } | AccState::Count { n } => b.append_value(*n),
                    _ => b.append_null(),
                }
            }
            Arc::new(b.finish())
        }
        Some(AccState::SumInt { .. }) => {
            let mut b = Int64Builder::new();
            for s in &states {
                match s {
                    AccState::SumInt { sum, seen: true } => b.append_value(*sum),
                    _ => b.append_null(),
                }
            }
            Arc::new(b.finish())
        }
        Some(AccState::SumFloat { .. }) | Some(AccState::Mean { .. }) => {
            let mut b = Float64Builder::new();
            for s in &states {
                match s {
                    AccState::SumFloat { sum, seen: true } => b.append_value(*sum),
                    AccState::Mean { sum, n } if *n > 0 => b.append_value(sum / *n as f64),
                    _ => b.append_null(),
                }
            }
            Arc::new(b.finish())
        }
        Some(AccState::MinMaxInt { .. }) => {
            let mut b = Int64Builder::new();
            for s in &states {
                match s {
                    AccState::MinMaxInt { v: Some(v), .. } => b.append_value(*v),
                    _ => b.append_null(),
                }
            }
            Arc::new(b.finish())
        }
        Some(AccState::MinMaxFloat { .. }) => {
            let mut b = Float64Builder::new();
            for s in &states {
                match s {
                    AccState::MinMaxFloat { v: Some(v), .. } => b.append_value(*v),
                    _ => b.append_null(),
                }
            }
            Arc::new(b.finish())
        }
        Some(AccState::MinMaxBool { .. }) => {
            let mut b = BooleanBuilder::new();
            for s in &states {
                match s {
                    AccState::MinMaxBool { v: Some(v), .. } => b.append_value(*v),
                    _ => b.append_null(),
                }
            }
            Arc::new(b.finish())
        }
        Some(AccState::MinMaxStr { .. }) => {
            let mut b = StringBuilder::new();
            for s in &states {
                match s {
                    AccState::MinMaxStr { v: Some(v), .. } => b.append_value(v),
                    _ => b.append_null(),
                }
            }
            Arc::new(b.finish())
        }
        Some(AccState::MinMaxTs { .. }) => {
            let mut b = TimestampMicrosecondBuilder::new();
            for s in &states {
                match s {
                    AccState::MinMaxTs { v: Some(v), .. } => b.append_value(*v),
                    _ => b.append_null(),
                }
            }
            Arc::new(b.finish().with_timezone("UTC"))
        }
        None => Arc::new(Int64Builder::new().finish()),
    }
}

#[cfg(test)]
mod tests {
    use arrow_array::types::{Float64Type, Int64Type};
    use arrow_array::{Int64Array, StringArray};
    use arrow_schema::{Field, Schema};

    use super::*;

    fn people() -> Batch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("country", DataType::Utf8, true),
            Field::new("age", DataType::Int64, true),
        ]));
        Batch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec!["USA", "India", "UK", "India"])),
                Arc::new(Int64Array::from(vec![30, 24, 35, 29])),
            ],
        )
        .unwrap()
    }

    fn mean_count_spec() -> AggregatorSpec {
        AggregatorSpec {
            group_indices: vec![0],
            aggs: vec![
                AggInit {
                    input_index: Some(1),
                    input_type: Some(ValueType::Int64),
                    func: AggFn::Mean,
                },
                AggInit {
                    input_index: None,
                    input_type: None,
                    func: AggFn::Count,
                },
            ],
            output_schema: Arc::new(Schema::new(vec![
                Field::new("country", DataType::Utf8, true),
                Field::new("mean_age", DataType::Float64, true),
                Field::new("n", DataType::Int64, true),
            ])),
            step_index: 0,
        }
    }

    #[test]
    fn groups_in_first_insertion_order() {
        let mut agg = Aggregator::new(mean_count_spec());
        agg.absorb(&people()).unwrap();
        let out = agg.finalize(1024).unwrap();
        assert_eq!(out.len(), 1);
        let batch = &out[0];
        let countries = batch.column(0).as_string::<i32>();
        let means = batch.column(1).as_primitive::<Float64Type>();
        let counts = batch.column(2).as_primitive::<Int64Type>();
        assert_eq!(
            (0..3).map(|i| countries.value(i)).collect::<Vec<_>>(),
            ["USA", "India", "UK"]
        );
        assert_eq!(means.value(0), 30.0);
        assert_eq!(means.value(1), 26.5);
        assert_eq!(means.value(2), 35.0);
        assert_eq!(
            (0..3).map(|i| counts.value(i)).collect::<Vec<_>>(),
            [1, 2, 1]
        );
    }

    #[test]
    fn count_skips_nulls_but_count_star_does_not() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Utf8, true),
            Field::new("v", DataType::Int64, true),
        ]));
        let batch = Batch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec!["a", "a", "a"])),
                Arc::new(Int64Array::from(vec![Some(1), None, Some(3)])),
            ],
        )
        .unwrap();
        let spec = AggregatorSpec {
            group_indices: vec![0],
            aggs: vec![
                AggInit {
                    input_index: Some(1),
                    input_type: Some(ValueType::Int64),
                    func: AggFn::Count,
                },
                AggInit {
                    input_index: None,
                    input_type: None,
                    func: AggFn::Count,
                },
                AggInit {
                    input_index: Some(1),
                    input_type: Some(ValueType::Int64),
                    func: AggFn::Sum,
                },
                AggInit {
                    input_index: Some(1),
                    input_type: Some(ValueType::Int64),
                    func: AggFn::Min,
                },
            ],
            output_schema: Arc::new(Schema::new(vec![
                Field::new("k", DataType::Utf8, true),
                Field::new("nv", DataType::Int64, true),
                Field::new("n", DataType::Int64, true),
                Field::new("total", DataType::Int64, true),
                Field::new("low", DataType::Int64, true),
            ])),
            step_index: 0,
        };
        let mut agg = Aggregator::new(spec);
        agg.absorb(&batch).unwrap();
        let out = agg.finalize(1024).unwrap().remove(0);
        assert_eq!(out.column(1).as_primitive::<Int64Type>().value(0), 2);
        assert_eq!(out.column(2).as_primitive::<Int64Type>().value(0), 3);
        assert_eq!(out.column(3).as_primitive::<Int64Type>().value(0), 4);
        assert_eq!(out.column(4).as_primitive::<Int64Type>().value(0), 1);
    }

    #[test]
    fn sum_overflow_fails_with_row() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Utf8, true),
            Field::new("v", DataType::Int64, true),
        ]));
        let batch = Batch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec!["a", "a"])),
                Arc::new(Int64Array::from(vec![i64::MAX, 1])),
            ],
        )
        .unwrap();
        let spec = AggregatorSpec {
            group_indices: vec![0],
            aggs: vec![AggInit {
                input_index: Some(1),
                input_type: Some(ValueType::Int64),
                func: AggFn::Sum,
            }],
            output_schema: Arc::new(Schema::new(vec![
                Field::new("k", DataType::Utf8, true),
                Field::new("total", DataType::Int64, true),
            ])),
            step_index: 2,
        };
        let mut agg = Aggregator::new(spec);
        let err = agg.absorb(&batch).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Operator {
                step_index: 2,
                row_offset: 1,
                ..
            }
        ));
    }

    #[test]
    fn finalize_chunks_by_batch_rows() {
        let schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Int64, true)]));
        let batch = Batch::try_new(
            schema,
            vec![Arc::new(Int64Array::from((0..10).collect::<Vec<i64>>()))],
        )
        .unwrap();
        let spec = AggregatorSpec {
            group_indices: vec![0],
            aggs: vec![AggInit {
                input_index: None,
                input_type: None,
                func: AggFn::Count,
            }],
            output_schema: Arc::new(Schema::new(vec![
                Field::new("k", DataType::Int64, true),
                Field::new("n", DataType::Int64, true),
            ])),
            step_index: 0,
        };
        let mut agg = Aggregator::new(spec);
        agg.absorb(&batch).unwrap();
        assert!(agg.state_bytes() > 0);
        let out = agg.finalize(4).unwrap();
        let sizes: Vec<_> = out.iter().map(|b| b.num_rows()).collect();
        assert_eq!(sizes, [4, 4, 2]);
        // Insertion order survives chunking.
        assert_eq!(out[0].column(0).as_primitive::<Int64Type>().value(0), 0);
        assert_eq!(out[2].column(0).as_primitive::<Int64Type>().value(1), 9);
    }
}
