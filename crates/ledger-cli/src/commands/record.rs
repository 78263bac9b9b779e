//! Record command handlers

use anyhow::{bail, Context, Result};
use serde_json::Value;

use ledger_core::query::SortDirection;
use ledger_core::{Filter, FilterOp, QueryOptions, Record, Store};

use crate::output::Output;

/// Symbolic operators, longest first so `>=` is not read as `>`
const SYMBOLS: [&str; 7] = [">=", "<=", "!=", "==", "=", "<", ">"];

/// Parse a `--where` expression
///
/// Accepts `field<op>value` for the comparison operators and
/// `field:<op>:value` for `contains`, `startsWith` and `in` (comma
/// separated). Values are read as JSON when they parse, otherwise as
/// strings.
pub fn parse_filter(expr: &str) -> Result<Filter> {
    let mut parts = expr.splitn(3, ':');
    if let (Some(field), Some(op), Some(value)) = (parts.next(), parts.next(), parts.next()) {
        if let Some(op) = FilterOp::parse(op) {
            let value = if op == FilterOp::In {
                Value::Array(value.split(',').map(|v| parse_value(v.trim())).collect())
            } else {
                parse_value(value)
            };
            return Ok(Filter::new(field.trim(), op, value));
        }
    }

    for symbol in SYMBOLS {
        if let Some((field, value)) = expr.split_once(symbol) {
            let field = field.trim();
            if field.is_empty() {
                break;
            }
            let op = FilterOp::parse(symbol).context("unknown operator")?;
            return Ok(Filter::new(field, op, parse_value(value.trim())));
        }
    }

    bail!(
        "Invalid filter '{}'. Use field=value, field>=value or field:contains:value",
        expr
    )
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_record(json: &str) -> Result<Record> {
    let value: Value = serde_json::from_str(json).context("Record must be a JSON object")?;
    Ok(Record::from_value(value)?)
}

/// Insert a record
pub async fn insert(store: &Store, collection: String, json: String, output: &Output) -> Result<()> {
    let record = parse_record(&json)?;
    let inserted = store.collection(&collection)?.insert(record).await?;
    if output.is_quiet() {
        println!("{}", inserted.id().unwrap_or_default());
    } else {
        output.print_record(&inserted);
    }
    Ok(())
}

/// Show a record
pub async fn get(store: &Store, collection: String, id: String, output: &Output) -> Result<()> {
    let record = store
        .collection(&collection)?
        .get(&id)
        .await?
        .with_context(|| format!("Record not found: {}/{}", collection, id))?;
    output.print_record(&record);
    Ok(())
}

/// Apply a partial update
pub async fn update(
    store: &Store,
    collection: String,
    id: String,
    json: String,
    output: &Output,
) -> Result<()> {
    let changes = parse_record(&json)?;
    let updated = store.collection(&collection)?.update(&id, changes).await?;
    output.print_record(&updated);
    Ok(())
}

/// Remove a record, applying relation policies
pub async fn remove(store: &Store, collection: String, id: String, output: &Output) -> Result<()> {
    store.collection(&collection)?.remove(&id).await?;
    output.success(&format!("Removed {}/{}", collection, id));
    Ok(())
}

/// Query options assembled from CLI flags
pub struct QueryArgs {
    pub filters: Vec<String>,
    pub sort: Option<String>,
    pub desc: bool,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl QueryArgs {
    fn to_options(&self) -> Result<QueryOptions> {
        let mut options = QueryOptions::new();
        for expr in &self.filters {
            options = options.filter(parse_filter(expr)?);
        }
        if let Some(ref field) = self.sort {
            let direction = if self.desc {
                SortDirection::Desc
            } else {
                SortDirection::Asc
            };
            options = options.sort(field.as_str(), direction);
        }
        if let Some(limit) = self.limit {
            options = options.limit(limit);
        }
        if let Some(offset) = self.offset {
            options = options.offset(offset);
        }
        Ok(options)
    }
}

/// Query a collection
pub async fn query(store: &Store, collection: String, args: QueryArgs, output: &Output) -> Result<()> {
    let options = args.to_options()?;
    let records = store.collection(&collection)?.query(&options).await?;
    output.print_records(&records);
    Ok(())
}

/// Count matching records
pub async fn count(
    store: &Store,
    collection: String,
    filters: Vec<String>,
    output: &Output,
) -> Result<()> {
    let filters = filters
        .iter()
        .map(|expr| parse_filter(expr))
        .collect::<Result<Vec<_>>>()?;
    let count = store.collection(&collection)?.count(filters).await?;
    if output.is_json() {
        println!("{}", serde_json::json!({"collection": collection, "count": count}));
    } else {
        println!("{}", count);
    }
    Ok(())
}
