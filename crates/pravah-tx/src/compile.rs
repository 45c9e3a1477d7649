//! Pipeline compilation.
//!
//! Walks the spec in order, deriving the schema after every step and
//! rejecting anything that cannot execute: unknown columns, type-
//! incompatible comparisons, duplicate output names, misplaced stages.
//! Compilation is pure and deterministic; identical specs and input
//! schemas produce identical compiled forms, which keeps fingerprints
//! honest.

use std::collections::HashSet;
use std::sync::Arc;

use arrow_schema::{Field, Schema, SchemaRef};
use pravah_core::spec::{
    AggregateStep, CastStep, ConvertFormatStep, FilterStep, ProjectStep, RenameStep,
};
use pravah_core::{
    AggFn, CmpOp, DataFormat, EngineError, FormatOptions, PipelineSpec, Result, Step, ValueType,
};

use crate::aggregate::{AggInit, AggregatorSpec};
use crate::literal::Literal;
use crate::ops::{Cast, Filter, Project, Rename, RowOperator};

/// A validated, schema-resolved pipeline ready for execution.
pub struct CompiledPipeline {
    /// Row-scoped prefix, shared across workers.
    pub operators: Vec<Arc<dyn RowOperator>>,
    /// Terminal blocking stage, if the spec aggregates.
    pub aggregate: Option<AggregatorSpec>,
    /// Schema of every batch reaching the writer, and of the output object.
    pub output_schema: SchemaRef,
    /// Output format override from `convert_format`; `None` keeps the input format.
    pub output_format: Option<DataFormat>,
    pub format_options: FormatOptions,
    /// True when every stage is row-scoped, permitting order-preserving
    /// parallel execution end to end.
    pub is_streaming: bool,
}

impl std::fmt::Debug for CompiledPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledPipeline")
            .field("operators", &self.operators.iter().map(|o| o.name()).collect::<Vec<_>>())
            .field("aggregate", &self.aggregate)
            .field("output_schema", &self.output_schema)
            .field("output_format", &self.output_format)
            .field("format_options", &self.format_options)
            .field("is_streaming", &self.is_streaming)
            .finish()
    }
}

fn err(step_index: usize, reason: impl Into<String>) -> EngineError {
    EngineError::Pipeline {
        step_index,
        reason: reason.into(),
    }
}

/// Structural checks that need no schema: stage placement and multiplicity.
/// Runs before any I/O so a malformed spec never touches storage.
pub fn validate_structure(spec: &PipelineSpec) -> Result<()> {
    let mut aggregate_at = None;
    let mut convert_at = None;
    for (i, step) in spec.steps.iter().enumerate() {
        match step {
            Step::Aggregate(_) => {
                if aggregate_at.is_some() {
                    return Err(err(i, "at most one aggregate step is allowed"));
                }
                if convert_at.is_some() {
                    return Err(err(i, "aggregate must precede convert_format"));
                }
                aggregate_at = Some(i);
            }
            Step::ConvertFormat(_) => {
                if convert_at.is_some() {
                    return Err(err(i, "at most one convert_format step is allowed"));
                }
                convert_at = Some(i);
            }
            _ => {
                if aggregate_at.is_some() {
                    return Err(err(i, "row-scoped steps must precede aggregate"));
                }
                if convert_at.is_some() {
                    return Err(err(i, "convert_format must be the last step"));
                }
            }
        }
    }
    if let Some(at) = convert_at {
        if at + 1 != spec.steps.len() {
            return Err(err(at, "convert_format must be the last step"));
        }
    }
    Ok(())
}

/// Compile a spec against the input schema produced by the codec.
pub fn compile(spec: &PipelineSpec, input_schema: SchemaRef) -> Result<CompiledPipeline> {
    validate_structure(spec)?;

    let mut schema = input_schema;
    let mut operators: Vec<Arc<dyn RowOperator>> = Vec::new();
    let mut aggregate = None;
    let mut output_format = None;
    let mut format_options = FormatOptions::default();

    for (i, step) in spec.steps.iter().enumerate() {
        match step {
            Step::Filter(f) => {
                let op = compile_filter(f, i, &schema)?;
                operators.push(Arc::new(op));
            }
            Step::Project(p) => {
                let op = compile_project(p, i, &schema)?;
                schema = op.output_schema();
                operators.push(Arc::new(op));
            }
            Step::Rename(r) => {
                let op = compile_rename(r, i, &schema)?;
                schema = op.output_schema();
                operators.push(Arc::new(op));
            }
            Step::Cast(c) => {
                let op = compile_cast(c, i, &schema)?;
                schema = op.output_schema();
                operators.push(Arc::new(op));
            }
            Step::Aggregate(a) => {
                let compiled = compile_aggregate(a, i, &schema)?;
                schema = compiled.output_schema.clone();
                aggregate = Some(compiled);
            }
            Step::ConvertFormat(ConvertFormatStep { to_format, options }) => {
                output_format = Some(*to_format);
                format_options = options.clone();
            }
        }
    }

    tracing::debug!(
        steps = spec.steps.len(),
        streaming = aggregate.is_none(),
        columns = schema.fields().len(),
        "compiled pipeline"
    );
    Ok(CompiledPipeline {
        operators,
        is_streaming: aggregate.is_none(),
        aggregate,
        output_schema: schema,
        output_format,
        format_options,
    })
}

fn resolve(schema: &SchemaRef, name: &str, step_index: usize) -> Result<usize> {
    schema
        .index_of(name)
        .map_err(|_| err(step_index, format!("unknown column {name:?}")))
}

fn column_type(schema: &SchemaRef, index: usize, step_index: usize) -> Result<ValueType> {
    let field = schema.field(index);
    ValueType::from_arrow(field.data_type()).ok_or_else(|| {
        err(
            step_index,
            format!(
                "column {:?} has unsupported type {}",
                field.name(),
                field.data_type()
            ),
        )
    })
}

fn coerce(
    value: &serde_json::Value,
    target: ValueType,
    column: &str,
    step_index: usize,
) -> Result<Literal> {
    Literal::coerce(value, target).ok_or_else(|| {
        err(
            step_index,
            format!("value {value} is not comparable to column {column:?} of type {target}"),
        )
    })
}

fn compile_filter(f: &FilterStep, step_index: usize, schema: &SchemaRef) -> Result<Filter> {
    let column_index = resolve(schema, &f.column, step_index)?;
    let vt = column_type(schema, column_index, step_index)?;

    let operands = match f.op {
        CmpOp::IsNull | CmpOp::NotNull => {
            if !f.value.is_null() {
                return Err(err(step_index, format!("{:?} takes no value", f.op)));
            }
            Vec::new()
        }
        CmpOp::Contains => {
            if vt != ValueType::String {
                return Err(err(
                    step_index,
                    format!("contains requires a string column, {:?} is {vt}", f.column),
                ));
            }
            vec![coerce(&f.value, vt, &f.column, step_index)?]
        }
        CmpOp::In => {
            let items = f.value.as_array().ok_or_else(|| {
                err(step_index, "the in operator takes a list of values")
            })?;
            items
                .iter()
                .map(|v| coerce(v, vt, &f.column, step_index))
                .collect::<Result<Vec<_>>>()?
        }
        op if op.is_ordering() => {
            if vt == ValueType::Bool {
                return Err(err(
                    step_index,
                    format!("ordering comparison {op:?} is not defined on bool"),
                ));
            }
            vec![coerce(&f.value, vt, &f.column, step_index)?]
        }
        _ => vec![coerce(&f.value, vt, &f.column, step_index)?],
    };

    Ok(Filter {
        column_index,
        op: f.op,
        operands,
        schema: schema.clone(),
    })
}

fn compile_project(p: &ProjectStep, step_index: usize, schema: &SchemaRef) -> Result<Project> {
    if p.columns.is_empty() {
        return Err(err(step_index, "project requires at least one column"));
    }
    let mut seen = HashSet::new();
    let mut indices = Vec::with_capacity(p.columns.len());
    let mut fields = Vec::with_capacity(p.columns.len());
    for name in &p.columns {
        if !seen.insert(name.as_str()) {
            return Err(err(step_index, format!("duplicate column {name:?} in project")));
        }
        let idx = resolve(schema, name, step_index)?;
        indices.push(idx);
        fields.push(schema.field(idx).clone());
    }
    Ok(Project {
        indices,
        schema: Arc::new(Schema::new(fields)),
    })
}

fn compile_rename(r: &RenameStep, step_index: usize, schema: &SchemaRef) -> Result<Rename> {
    for from in r.mapping.keys() {
        resolve(schema, from, step_index)?;
    }
    let fields: Vec<Field> = schema
        .fields()
        .iter()
        .map(|field| match r.mapping.get(field.name()) {
            Some(to) => field.as_ref().clone().with_name(to),
            None => field.as_ref().clone(),
        })
        .collect();
    let mut seen = HashSet::new();
    for field in &fields {
        if !seen.insert(field.name().as_str()) {
            return Err(err(
                step_index,
                format!("rename produces duplicate column {:?}", field.name()),
            ));
        }
    }
    Ok(Rename {
        schema: Arc::new(Schema::new(fields)),
    })
}

fn compile_cast(c: &CastStep, step_index: usize, schema: &SchemaRef) -> Result<Cast> {
    let column_index = resolve(schema, &c.column, step_index)?;
    let from = column_type(schema, column_index, step_index)?;
    let to = c.to_type;
    let scalar_group = |vt: ValueType| {
        matches!(vt, ValueType::Bool | ValueType::Int64 | ValueType::Float64)
    };
    let allowed = from == to
        || to == ValueType::String
        || from == ValueType::String
        || (scalar_group(from) && scalar_group(to));
    if !allowed {
        return Err(err(
            step_index,
            format!("cast from {from} to {to} is not supported"),
        ));
    }
    let fields: Vec<Field> = schema
        .fields()
        .iter()
        .enumerate()
        .map(|(idx, field)| {
            if idx == column_index {
                // Failed casts null out, so the column becomes nullable.
                Field::new(field.name(), to.to_arrow(), true)
            } else {
                field.as_ref().clone()
            }
        })
        .collect();
    Ok(Cast {
        column_index,
        to: to.to_arrow(),
        strict: c.strict,
        step_index,
        schema: Arc::new(Schema::new(fields)),
    })
}

fn compile_aggregate(
    a: &AggregateStep,
    step_index: usize,
    schema: &SchemaRef,
) -> Result<AggregatorSpec> {
    if a.aggregations.is_empty() {
        return Err(err(step_index, "aggregate requires at least one aggregation"));
    }
    let mut names = HashSet::new();
    let mut group_indices = Vec::with_capacity(a.group_by.len());
    let mut fields = Vec::new();
    for name in &a.group_by {
        if !names.insert(name.clone()) {
            return Err(err(step_index, format!("duplicate group column {name:?}")));
        }
        let idx = resolve(schema, name, step_index)?;
        column_type(schema, idx, step_index)?;
        group_indices.push(idx);
        // Group keys may be null even when the source column is not.
        fields.push(Field::new(
            schema.field(idx).name(),
            schema.field(idx).data_type().clone(),
            true,
        ));
    }

    let mut aggs = Vec::with_capacity(a.aggregations.len());
    for spec in &a.aggregations {
        if !names.insert(spec.alias.clone()) {
            return Err(err(
                step_index,
                format!("duplicate output column {:?}", spec.alias),
            ));
        }
        let (init, out_type) = if spec.column == "*" {
            if spec.func != AggFn::Count {
                return Err(err(
                    step_index,
                    format!("{:?} does not accept the * column", spec.func),
                ));
            }
            (
                AggInit {
                    input_index: None,
                    input_type: None,
                    func: AggFn::Count,
                },
                ValueType::Int64,
            )
        } else {
            let idx = resolve(schema, &spec.column, step_index)?;
            let vt = column_type(schema, idx, step_index)?;
            let out_type = match spec.func {
                AggFn::Sum | AggFn::Mean => {
                    if !vt.is_numeric() {
                        return Err(err(
                            step_index,
                            format!(
                                "{:?} requires a numeric column, {:?} is {vt}",
                                spec.func, spec.column
                            ),
                        ));
                    }
                    if spec.func == AggFn::Mean {
                        ValueType::Float64
                    } else {
                        vt
                    }
                }
                AggFn::Count => ValueType::Int64,
                AggFn::Min | AggFn::Max => vt,
            };
            (
                AggInit {
                    input_index: Some(idx),
                    input_type: Some(vt),
                    func: spec.func,
                },
                out_type,
            )
        };
        fields.push(Field::new(&spec.alias, out_type.to_arrow(), true));
        aggs.push(init);
    }

    Ok(AggregatorSpec {
        group_indices,
        aggs,
        output_schema: Arc::new(Schema::new(fields)),
        step_index,
    })
}

#[cfg(test)]
mod tests {
    use arrow_schema::DataType;

    use super::*;

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("name", DataType::Utf8, true),
            Field::new("country", DataType::Utf8, true),
            Field::new("age", DataType::Int64, true),
            Field::new("active", DataType::Boolean, true),
        ]))
    }

    fn parse(json: &str) -> PipelineSpec {
        PipelineSpec::parse(json).unwrap()
    }

    #[test]
    fn compiles_streaming_chain_and_derives_schema() {
        let spec = parse(
            r#"[
                {"type": "filter", "column": "country", "op": "eq", "value": "India"},
                {"type": "project", "columns": ["name", "age"]},
                {"type": "rename", "mapping": {"name": "person"}},
                {"type": "cast", "column": "age", "to_type": "float64"},
                {"type": "convert_format", "to_format": "parquet"}
            ]"#,
        );
        let compiled = compile(&spec, schema()).unwrap();
        assert!(compiled.is_streaming);
        assert_eq!(compiled.operators.len(), 4);
        assert_eq!(compiled.output_format, Some(DataFormat::Parquet));
        let out = compiled.output_schema;
        assert_eq!(out.field(0).name(), "person");
        assert_eq!(out.field(1).data_type(), &DataType::Float64);
    }

    #[test]
    fn aggregate_output_schema_orders_groups_then_aliases() {
        let spec = parse(
            r#"[{"type": "aggregate", "group_by": ["country"],
                 "aggregations": [
                    {"column": "age", "fn": "mean", "as": "mean_age"},
                    {"column": "*", "fn": "count", "as": "n"}
                 ]}]"#,
        );
        let compiled = compile(&spec, schema()).unwrap();
        assert!(!compiled.is_streaming);
        let out = compiled.output_schema;
        let names: Vec<_> = out.fields().iter().map(|f| f.name().clone()).collect();
        assert_eq!(names, ["country", "mean_age", "n"]);
        assert_eq!(out.field(1).data_type(), &DataType::Float64);
        assert_eq!(out.field(2).data_type(), &DataType::Int64);
    }

    #[test]
    fn rejects_unknown_column() {
        let spec = parse(r#"[{"type": "filter", "column": "ghost", "op": "eq", "value": 1}]"#);
        let e = compile(&spec, schema()).unwrap_err();
        assert!(matches!(e, EngineError::Pipeline { step_index: 0, .. }));
    }

    #[test]
    fn rejects_ordering_on_bool() {
        let spec = parse(r#"[{"type": "filter", "column": "active", "op": "gt", "value": true}]"#);
        assert!(compile(&spec, schema()).is_err());
    }

    #[test]
    fn rejects_type_mismatched_literal() {
        let spec = parse(r#"[{"type": "filter", "column": "age", "op": "eq", "value": "x"}]"#);
        assert!(compile(&spec, schema()).is_err());
    }

    #[test]
    fn rejects_duplicate_project_and_rename_collision() {
        let spec = parse(r#"[{"type": "project", "columns": ["age", "age"]}]"#);
        assert!(compile(&spec, schema()).is_err());

        let spec = parse(r#"[{"type": "rename", "mapping": {"name": "country"}}]"#);
        assert!(compile(&spec, schema()).is_err());
    }

    #[test]
    fn rejects_sum_on_string() {
        let spec = parse(
            r#"[{"type": "aggregate", "group_by": ["country"],
                 "aggregations": [{"column": "name", "fn": "sum", "as": "s"}]}]"#,
        );
        assert!(compile(&spec, schema()).is_err());
    }

    #[test]
    fn structural_rules() {
        // Two aggregates.
        let spec = parse(
            r#"[{"type": "aggregate", "group_by": [], "aggregations": [{"column": "*", "fn": "count", "as": "n"}]},
                {"type": "aggregate", "group_by": [], "aggregations": [{"column": "*", "fn": "count", "as": "m"}]}]"#,
        );
        assert!(validate_structure(&spec).is_err());

        // convert_format not last.
        let spec = parse(
            r#"[{"type": "convert_format", "to_format": "csv"},
                {"type": "project", "columns": ["age"]}]"#,
        );
        assert!(validate_structure(&spec).is_err());

        // Row-scoped step after aggregate.
        let spec = parse(
            r#"[{"type": "aggregate", "group_by": ["country"], "aggregations": [{"column": "*", "fn": "count", "as": "n"}]},
                {"type": "project", "columns": ["n"]}]"#,
        );
        assert!(validate_structure(&spec).is_err());

        // Aggregate then convert_format is fine.
        let spec = parse(
            r#"[{"type": "aggregate", "group_by": ["country"], "aggregations": [{"column": "*", "fn": "count", "as": "n"}]},
                {"type": "convert_format", "to_format": "jsonl"}]"#,
        );
        assert!(validate_structure(&spec).is_ok());
    }

    #[test]
    fn compilation_is_deterministic() {
        let spec = parse(
            r#"[{"type": "filter", "column": "age", "op": "ge", "value": 21},
                {"type": "project", "columns": ["country", "age"]}]"#,
        );
        let a = compile(&spec, schema()).unwrap();
        let b = compile(&spec, schema()).unwrap();
        assert_eq!(a.output_schema, b.output_schema);
        assert_eq!(a.operators.len(), b.operators.len());
        assert_eq!(a.is_streaming, b.is_streaming);
    }

    #[test]
    fn is_null_rejects_value() {
        let spec =
            parse(r#"[{"type": "filter", "column": "age", "op": "is_null", "value": 1}]"#);
        assert!(compile(&spec, schema()).is_err());
    }
}
