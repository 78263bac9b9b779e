//! Query and filter engine
//!
//! Free functions shared by every adapter so that filter, sort and aggregate
//! semantics never depend on which physical store answered a query. The
//! composite adapter relies on this: its local and remote legs must return
//! identical results for identical data.
//!
//! ## Filter semantics
//!
//! - Numbers compare numerically, strings lexicographically; values of
//!   different types never order against each other
//! - A filter on an absent field is `false`, except `!=` which is `true`
//! - `contains` is a case-insensitive substring test on strings and a
//!   membership test on arrays; `startsWith` is a case-insensitive prefix test
//! - `in` requires an array filter value

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::record::Record;

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "startsWith")]
    StartsWith,
}

impl FilterOp {
    /// Parse the wire symbol of an operator
    pub fn parse(symbol: &str) -> Option<Self> {
        Some(match symbol {
            "=" | "==" => FilterOp::Eq,
            "!=" => FilterOp::Ne,
            "<" => FilterOp::Lt,
            "<=" => FilterOp::Lte,
            ">" => FilterOp::Gt,
            ">=" => FilterOp::Gte,
            "in" => FilterOp::In,
            "contains" => FilterOp::Contains,
            "startsWith" => FilterOp::StartsWith,
            _ => return None,
        })
    }
}

/// A single field predicate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// Dotted path into the record
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// Shorthand for an equality filter
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Eq, value)
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// Field and direction to sort by
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

/// Options accepted by every adapter's `query`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<Filter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<SortSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn sort(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort = Some(SortSpec {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Aggregate function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFn {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

/// Options accepted by every adapter's `aggregate`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateOptions {
    pub function: AggregateFn,
    /// Numeric field; ignored by `count`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<Filter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<String>,
}

impl AggregateOptions {
    pub fn count() -> Self {
        Self {
            function: AggregateFn::Count,
            field: None,
            filters: Vec::new(),
            group_by: None,
        }
    }

    pub fn of(function: AggregateFn, field: impl Into<String>) -> Self {
        Self {
            function,
            field: Some(field.into()),
            filters: Vec::new(),
            group_by: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn group_by(mut self, field: impl Into<String>) -> Self {
        self.group_by = Some(field.into());
        self
    }
}

/// One group of a grouped aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateGroup {
    /// Group key (`null` for records without the field)
    pub key: Value,
    pub value: Option<f64>,
}

/// Result of an aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    /// Value over all matching records
    pub value: Option<f64>,
    /// Per-group values, ordered by key; empty unless `group_by` was set
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<AggregateGroup>,
}

/// Dotted-path lookup; absent paths yield `None`
pub fn get_nested_value<'a>(obj: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(obj);
    }
    path.split('.').try_fold(obj, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Look up a dotted path in a record
pub fn record_value<'a>(record: &'a Record, path: &str) -> Option<&'a Value> {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    let value = record.get(head)?;
    match rest {
        Some(rest) => get_nested_value(value, rest),
        None => Some(value),
    }
}

/// Evaluate a single filter against a record
pub fn matches_filter(record: &Record, filter: &Filter) -> bool {
    let Some(actual) = record_value(record, &filter.field) else {
        return filter.op == FilterOp::Ne;
    };
    let expected = &filter.value;

    match filter.op {
        FilterOp::Eq => values_equal(actual, expected),
        FilterOp::Ne => !values_equal(actual, expected),
        FilterOp::Lt => order(actual, expected) == Some(Ordering::Less),
        FilterOp::Lte => matches!(
            order(actual, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
        FilterOp::Gt => order(actual, expected) == Some(Ordering::Greater),
        FilterOp::Gte => matches!(
            order(actual, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        FilterOp::In => match expected {
            Value::Array(options) => options.iter().any(|o| values_equal(actual, o)),
            _ => false,
        },
        FilterOp::Contains => match (actual, expected) {
            (Value::String(haystack), Value::String(needle)) => haystack
                .to_lowercase()
                .contains(&needle.to_lowercase()),
            (Value::Array(items), needle) => items.iter().any(|i| values_equal(i, needle)),
            _ => false,
        },
        FilterOp::StartsWith => match (actual, expected) {
            (Value::String(s), Value::String(prefix)) => {
                s.to_lowercase().starts_with(&prefix.to_lowercase())
            }
            _ => false,
        },
    }
}

/// Keep records matching every filter (logical AND)
pub fn apply_filters(records: Vec<Record>, filters: &[Filter]) -> Vec<Record> {
    if filters.is_empty() {
        return records;
    }
    records
        .into_iter()
        .filter(|record| filters.iter().all(|f| matches_filter(record, f)))
        .collect()
}

/// Stable sort by a field; ties keep their original relative order
pub fn apply_sorting(mut records: Vec<Record>, field: &str, direction: SortDirection) -> Vec<Record> {
    records.sort_by(|a, b| {
        let ordering = compare_for_sort(record_value(a, field), record_value(b, field));
        match direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        }
    });
    records
}

/// Filter, sort, then paginate
pub fn execute_query(records: Vec<Record>, options: &QueryOptions) -> Vec<Record> {
    let mut records = apply_filters(records, &options.filters);
    if let Some(ref sort) = options.sort {
        records = apply_sorting(records, &sort.field, sort.direction);
    }
    let offset = options.offset.unwrap_or(0);
    let iter = records.into_iter().skip(offset);
    match options.limit {
        Some(limit) => iter.take(limit).collect(),
        None => iter.collect(),
    }
}

/// Compute an aggregate over records
pub fn aggregate_records(records: &[Record], options: &AggregateOptions) -> AggregateResult {
    let matching: Vec<&Record> = records
        .iter()
        .filter(|r| options.filters.iter().all(|f| matches_filter(r, f)))
        .collect();

    let value = compute(&matching, options);

    let groups = match options.group_by {
        Some(ref group_field) => {
            let mut buckets: Vec<(Value, Vec<&Record>)> = Vec::new();
            for record in &matching {
                let key = record_value(record, group_field)
                    .cloned()
                    .unwrap_or(Value::Null);
                match buckets.iter_mut().find(|(k, _)| values_equal(k, &key)) {
                    Some((_, members)) => members.push(record),
                    None => buckets.push((key, vec![record])),
                }
            }
            buckets.sort_by(|(a, _), (b, _)| compare_for_sort(Some(a), Some(b)));
            buckets
                .into_iter()
                .map(|(key, members)| AggregateGroup {
                    value: compute(&members, options),
                    key,
                })
                .collect()
        }
        None => Vec::new(),
    };

    AggregateResult { value, groups }
}

fn compute(records: &[&Record], options: &AggregateOptions) -> Option<f64> {
    if options.function == AggregateFn::Count {
        return Some(records.len() as f64);
    }

    let numbers: Vec<f64> = match options.field {
        Some(ref field) => records
            .iter()
            .filter_map(|r| record_value(r, field).and_then(Value::as_f64))
            .collect(),
        None => Vec::new(),
    };

    match options.function {
        AggregateFn::Count => Some(records.len() as f64),
        AggregateFn::Sum => Some(numbers.iter().sum()),
        AggregateFn::Avg => {
            if numbers.is_empty() {
                None
            } else {
                Some(numbers.iter().sum::<f64>() / numbers.len() as f64)
            }
        }
        AggregateFn::Min => numbers.iter().copied().reduce(f64::min),
        AggregateFn::Max => numbers.iter().copied().reduce(f64::max),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Ordering between two comparable values; `None` across types
fn order(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None => 0,
        Some(Value::Null) => 1,
        Some(Value::Bool(_)) => 2,
        Some(Value::Number(_)) => 3,
        Some(Value::String(_)) => 4,
        Some(Value::Array(_)) => 5,
        Some(Value::Object(_)) => 6,
    }
}

/// Total order used for sorting mixed values
fn compare_for_sort(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    if let (Some(x), Some(y)) = (a, b) {
        if let Some(ordering) = order(x, y) {
            return ordering;
        }
    }
    type_rank(a).cmp(&type_rank(b))
}
