//! Shared query vocabulary for store lookups.
//!
//! A `QuerySpec` is a list of criteria (field, operator, value), an optional
//! sort key, and offset/limit paging. Every store evaluates the same query
//! against records exposed through `Queryable`, so filters written for the
//! in-memory stores carry over unchanged to a durable backend.

use core::cmp::Ordering;
use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::QueryError;

/// A record whose fields can be addressed by name.
///
/// Dotted paths (e.g. `payload.processId`) address nested JSON values.
pub trait Queryable {
    fn field(&self, path: &str) -> Option<Value>;
}

/// Resolve a dotted path inside a JSON value.
pub fn json_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(value, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// Comparison operator of a criterion.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
    /// Right operand is a JSON array; matches if any element is equal.
    In,
    /// SQL-style pattern where `%` matches any run of characters.
    Like,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::NotEq => "!=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::In => "in",
            Operator::Like => "like",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "=" | "==" => Ok(Operator::Eq),
            "!=" | "<>" => Ok(Operator::NotEq),
            "<" => Ok(Operator::Lt),
            "<=" => Ok(Operator::Lte),
            ">" => Ok(Operator::Gt),
            ">=" => Ok(Operator::Gte),
            "in" => Ok(Operator::In),
            "like" => Ok(Operator::Like),
            other => Err(QueryError::UnknownOperator(other.to_string())),
        }
    }
}

/// Sort direction.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl FromStr for SortOrder {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(QueryError::UnknownSortOrder(other.to_string())),
        }
    }
}

/// A single `field operator value` predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    pub field: String,
    pub operator: Operator,
    pub value: Value,
}

impl Criterion {
    pub fn new(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    /// Build a criterion from an untyped operator string (e.g. from an API layer).
    pub fn parse(
        field: impl Into<String>,
        operator: &str,
        value: impl Into<Value>,
    ) -> Result<Self, QueryError> {
        Ok(Self::new(field, operator.parse()?, value))
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Operator::Eq, value)
    }

    /// Evaluate against a record. A missing field never matches.
    pub fn matches<Q: Queryable + ?Sized>(&self, record: &Q) -> bool {
        let Some(actual) = record.field(&self.field) else {
            return false;
        };

        match self.operator {
            Operator::Eq => values_equal(&actual, &self.value),
            Operator::NotEq => !values_equal(&actual, &self.value),
            Operator::Lt => compare_values(&actual, &self.value) == Some(Ordering::Less),
            Operator::Lte => matches!(
                compare_values(&actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Operator::Gt => compare_values(&actual, &self.value) == Some(Ordering::Greater),
            Operator::Gte => matches!(
                compare_values(&actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Operator::In => match &self.value {
                Value::Array(candidates) => candidates.iter().any(|c| values_equal(&actual, c)),
                _ => false,
            },
            Operator::Like => match (&actual, &self.value) {
                (Value::String(s), Value::String(pattern)) => like(s, pattern),
                _ => false,
            },
        }
    }
}

/// Predicates, ordering and paging for a store query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub filter: Vec<Criterion>,
    pub sort_field: Option<String>,
    pub sort_order: SortOrder,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl QuerySpec {
    /// Matches everything, no ordering, no paging.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn filter(mut self, criterion: Criterion) -> Self {
        self.filter.push(criterion);
        self
    }

    pub fn sort_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort_field = Some(field.into());
        self.sort_order = order;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// True when every criterion matches.
    pub fn matches<Q: Queryable + ?Sized>(&self, record: &Q) -> bool {
        self.filter.iter().all(|c| c.matches(record))
    }

    /// Order two records by the sort field. Records lacking the field sort last;
    /// values of different JSON types order by type (null, bool, number,
    /// string, array, object).
    pub fn compare<Q: Queryable + ?Sized>(&self, a: &Q, b: &Q) -> Ordering {
        let Some(field) = &self.sort_field else {
            return Ordering::Equal;
        };

        let ordering = match (a.field(field), b.field(field)) {
            (Some(x), Some(y)) => sort_values(&x, &y),
            (Some(_), None) => return Ordering::Less,
            (None, Some(_)) => return Ordering::Greater,
            (None, None) => Ordering::Equal,
        };

        match self.sort_order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    }

    /// Filter, sort (stable), then page an in-memory collection.
    pub fn apply<T, I>(&self, records: I) -> Vec<T>
    where
        T: Queryable,
        I: IntoIterator<Item = T>,
    {
        let mut matched: Vec<T> = records.into_iter().filter(|r| self.matches(r)).collect();
        if self.sort_field.is_some() {
            matched.sort_by(|a, b| self.compare(a, b));
        }

        let paged = matched.into_iter().skip(self.offset);
        match self.limit {
            Some(limit) => paged.take(limit).collect(),
            None => paged.collect(),
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values; `sort_by` panics on anything weaker.
fn sort_values(a: &Value, b: &Value) -> Ordering {
    type_rank(a).cmp(&type_rank(b)).then_with(|| {
        compare_values(a, b).unwrap_or_else(|| a.to_string().cmp(&b.to_string()))
    })
}

/// `%`-wildcard matching.
fn like(text: &str, pattern: &str) -> bool {
    let parts: Vec<&str> = pattern.split('%').collect();
    if parts.len() == 1 {
        return text == pattern;
    }

    let first = parts[0];
    let last = parts[parts.len() - 1];
    if text.len() < first.len() + last.len() || !text.starts_with(first) || !text.ends_with(last)
    {
        return false;
    }

    let mut rest = &text[first.len()..text.len() - last.len()];

    for middle in &parts[1..parts.len() - 1] {
        match rest.find(middle) {
            Some(pos) => rest = &rest[pos + middle.len()..],
            None => return false,
        }
    }
    true
}
