//! Pipeline specification wire format.
//!
//! The top level is a JSON list of step objects; each step carries a `type`
//! discriminator and a flat parameter object. Unknown step kinds and unknown
//! fields are rejected at parse time.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::ValueType;

/// Data formats the engine reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    Csv,
    Jsonl,
    Parquet,
}

impl DataFormat {
    /// Extension used for published output objects.
    pub fn ext(self) -> &'static str {
        match self {
            DataFormat::Csv => "csv",
            DataFormat::Jsonl => "jsonl",
            DataFormat::Parquet => "parquet",
        }
    }
}

/// Comparison operators available to `filter` steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Contains,
    IsNull,
    NotNull,
}

impl CmpOp {
    /// Operators that take no right-hand value.
    pub fn is_nullary(self) -> bool {
        matches!(self, CmpOp::IsNull | CmpOp::NotNull)
    }

    /// Operators requiring an ordered column type.
    pub fn is_ordering(self) -> bool {
        matches!(self, CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge)
    }
}

/// Aggregation functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggFn {
    Sum,
    Count,
    Min,
    Max,
    Mean,
}

/// One aggregation output: `fn(column) as alias`. `column` may be `"*"`
/// for `count`, which then counts rows instead of non-null values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggSpec {
    pub column: String,
    #[serde(rename = "fn")]
    pub func: AggFn,
    #[serde(rename = "as")]
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterStep {
    pub column: String,
    pub op: CmpOp,
    /// Literal operand; absent for `is_null` / `not_null`, a list for `in`.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectStep {
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RenameStep {
    /// `from -> to`. Ordered map so canonicalization is stable.
    pub mapping: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CastStep {
    pub column: String,
    pub to_type: ValueType,
    /// Fail the run on a cast failure instead of producing null.
    #[serde(default)]
    pub strict: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregateStep {
    pub group_by: Vec<String>,
    pub aggregations: Vec<AggSpec>,
}

/// Output-codec options for `convert_format`. These shape CSV encoding;
/// the other formats have no dialect and ignore them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FormatOptions {
    /// CSV field delimiter; defaults to `,`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delimiter: Option<char>,
    /// CSV quote character; defaults to `"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<char>,
    /// Text written for null CSV fields; defaults to an empty field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub null_literal: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConvertFormatStep {
    pub to_format: DataFormat,
    #[serde(default)]
    pub options: FormatOptions,
}

/// One pipeline step. The `type` field discriminates; each variant's
/// parameters reject unknown fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    Filter(FilterStep),
    Project(ProjectStep),
    Rename(RenameStep),
    Cast(CastStep),
    Aggregate(AggregateStep),
    ConvertFormat(ConvertFormatStep),
}

impl Step {
    pub fn kind(&self) -> &'static str {
        match self {
            Step::Filter(_) => "filter",
            Step::Project(_) => "project",
            Step::Rename(_) => "rename",
            Step::Cast(_) => "cast",
            Step::Aggregate(_) => "aggregate",
            Step::ConvertFormat(_) => "convert_format",
        }
    }

    /// Row-scoped steps map batches 1:1 (or narrower) with no cross-batch state.
    pub fn is_row_scoped(&self) -> bool {
        matches!(
            self,
            Step::Filter(_) | Step::Project(_) | Step::Rename(_) | Step::Cast(_)
        )
    }
}

/// Ordered sequence of steps; the whole user-supplied pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineSpec {
    pub steps: Vec<Step>,
}

impl PipelineSpec {
    pub fn parse(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_steps() {
        let spec = PipelineSpec::parse(
            r#"[
                {"type": "filter", "column": "country", "op": "eq", "value": "India"},
                {"type": "project", "columns": ["name", "age"]},
                {"type": "convert_format", "to_format": "parquet"}
            ]"#,
        )
        .unwrap();
        assert_eq!(spec.steps.len(), 3);
        assert!(matches!(&spec.steps[0], Step::Filter(f) if f.op == CmpOp::Eq));
        assert_eq!(spec.steps[2].kind(), "convert_format");
    }

    #[test]
    fn rejects_unknown_step_kind() {
        let err = PipelineSpec::parse(r#"[{"type": "explode", "column": "x"}]"#).unwrap_err();
        assert!(err.to_string().contains("explode"));
    }

    #[test]
    fn rejects_unknown_field() {
        assert!(PipelineSpec::parse(
            r#"[{"type": "project", "columns": ["a"], "extra": true}]"#
        )
        .is_err());
    }

    #[test]
    fn filter_value_defaults_to_null() {
        let spec =
            PipelineSpec::parse(r#"[{"type": "filter", "column": "x", "op": "is_null"}]"#).unwrap();
        match &spec.steps[0] {
            Step::Filter(f) => assert!(f.value.is_null()),
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn convert_format_options() {
        let spec = PipelineSpec::parse(
            r#"[{"type": "convert_format", "to_format": "csv",
                 "options": {"delimiter": ";", "null_literal": "NULL"}}]"#,
        )
        .unwrap();
        match &spec.steps[0] {
            Step::ConvertFormat(c) => {
                assert_eq!(c.options.delimiter, Some(';'));
                assert_eq!(c.options.null_literal.as_deref(), Some("NULL"));
            }
            other => panic!("unexpected step {other:?}"),
        }
        // Options outside the contract are rejected, not silently dropped.
        assert!(PipelineSpec::parse(
            r#"[{"type": "convert_format", "to_format": "csv", "options": {"strict": true}}]"#
        )
        .is_err());
    }

    #[test]
    fn aggregate_keyword_fields() {
        let spec = PipelineSpec::parse(
            r#"[{"type": "aggregate", "group_by": ["country"],
                 "aggregations": [{"column": "age", "fn": "mean", "as": "mean_age"}]}]"#,
        )
        .unwrap();
        match &spec.steps[0] {
            Step::Aggregate(a) => {
                assert_eq!(a.aggregations[0].func, AggFn::Mean);
                assert_eq!(a.aggregations[0].alias, "mean_age");
            }
            other => panic!("unexpected step {other:?}"),
        }
    }
}
