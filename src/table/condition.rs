use std::fmt::{self, Display};
use std::str::FromStr;

use crate::connection::Statement;
use crate::schema::{Json, Row, Schema};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    NotEq,
    Gt,
    Lt,
    GtEq,
    LtEq,
    /// `<>`, kept apart from `!=` so cache keys reflect what the caller wrote
    LtGt,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::NotEq => "!=",
            Operator::Gt => ">",
            Operator::Lt => "<",
            Operator::GtEq => ">=",
            Operator::LtEq => "<=",
            Operator::LtGt => "<>",
        }
    }

    fn is_inequality(&self) -> bool {
        matches!(self, Operator::NotEq | Operator::LtGt)
    }
}

impl Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "=" => Operator::Eq,
            "!=" => Operator::NotEq,
            ">" => Operator::Gt,
            "<" => Operator::Lt,
            ">=" => Operator::GtEq,
            "<=" => Operator::LtEq,
            "<>" => Operator::LtGt,
            other => return Err(format!("Unsupported comparison operator {other:?}")),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Null,
    Eq(Json),
    Compare(Operator, Json),
    In(Vec<Json>),
}

impl Filter {
    /// Shape of the filter as it appears in cache keys
    fn to_json(&self) -> Json {
        match self {
            Filter::Null => Json::Null,
            Filter::Eq(value) => value.clone(),
            Filter::Compare(op, value) => Json::Array(vec![Json::from(op.as_str()), value.clone()]),
            Filter::In(values) => Json::Array(values.clone()),
        }
    }
}

/// Conjunction of per-column filters, rendered as a parameterized WHERE clause
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Condition {
    filters: Vec<(String, Filter)>,
}

impl Condition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, column: impl Into<String>, filter: Filter) -> Self {
        self.filters.push((column.into(), filter));
        self
    }

    /// Equality; a null value matches `IS NULL`
    pub fn eq(self, column: impl Into<String>, value: impl Into<Json>) -> Self {
        let filter = match value.into() {
            Json::Null => Filter::Null,
            value => Filter::Eq(value),
        };
        self.filter(column, filter)
    }

    pub fn is_null(self, column: impl Into<String>) -> Self {
        self.filter(column, Filter::Null)
    }

    pub fn not_null(self, column: impl Into<String>) -> Self {
        self.filter(column, Filter::Compare(Operator::NotEq, Json::Null))
    }

    pub fn compare(self, column: impl Into<String>, op: Operator, value: impl Into<Json>) -> Self {
        self.filter(column, Filter::Compare(op, value.into()))
    }

    pub fn any_of<I, V>(self, column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Json>,
    {
        self.filter(column, Filter::In(values.into_iter().map(Into::into).collect()))
    }

    /// Equality on every key of a row
    pub fn from_row(row: &Row) -> Self {
        row.iter()
            .fold(Self::new(), |condition, (column, value)| {
                condition.eq(column.clone(), value.clone())
            })
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn constrains(&self, column: &str) -> bool {
        self.filters.iter().any(|(name, _)| name == column)
    }

    pub fn filters(&self) -> &[(String, Filter)] {
        &self.filters
    }

    /// Append the filters joined by `AND` (no `WHERE` keyword)
    pub fn push_to(&self, statement: &mut Statement) {
        statement.push_separated(&self.filters, " AND ", |s, (column, filter)| {
            push_filter(s, column, filter)
        });
    }

    /// Column-order-independent form used for cache keys: filters sorted by the
    /// column's position in the schema, repeated columns collapsed into an array.
    pub fn canonical(&self, schema: &Schema) -> Row {
        let mut sorted: Vec<&(String, Filter)> = self.filters.iter().collect();
        sorted.sort_by(|(a, _), (b, _)| {
            let a_pos = schema.position(a).unwrap_or(usize::MAX);
            let b_pos = schema.position(b).unwrap_or(usize::MAX);
            a_pos.cmp(&b_pos).then_with(|| a.cmp(b))
        });

        let mut canonical = Row::new();
        for (column, filter) in sorted {
            let value = filter.to_json();
            match canonical.get_mut(column) {
                Some(Json::Array(existing)) if is_repeated(existing) => {
                    existing.push(value);
                }
                Some(existing) => {
                    let first = existing.take();
                    *existing = Json::Array(vec![Json::from(REPEATED), first, value]);
                }
                None => {
                    canonical.insert(column.clone(), value);
                }
            }
        }
        canonical
    }
}

const REPEATED: &str = "and";

fn is_repeated(values: &[Json]) -> bool {
    values.first().and_then(Json::as_str) == Some(REPEATED)
}

fn push_filter(statement: &mut Statement, column: &str, filter: &Filter) {
    if matches!(filter, Filter::In(values) if values.is_empty()) {
        // Nothing is a member of the empty set
        statement.push("1 = 0");
        return;
    }

    statement.push_identifier(column);
    match filter {
        Filter::Null => {
            statement.push(" IS NULL");
        }
        Filter::Compare(op, Json::Null) if op.is_inequality() => {
            statement.push(" IS NOT NULL");
        }
        Filter::Compare(Operator::Eq, Json::Null) => {
            statement.push(" IS NULL");
        }
        Filter::Eq(value) => {
            statement.push(" = ").push_bind(value.clone());
        }
        Filter::Compare(op, value) => {
            statement.push(format!(" {op} ")).push_bind(value.clone());
        }
        Filter::In(values) => {
            statement.push(" IN (");
            statement.push_separated(values, ", ", |s, value| {
                s.push_bind(value.clone());
            });
            statement.push(")");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

/// Ordered list of sort columns
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderBy(Vec<(String, Direction)>);

impl OrderBy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn asc(mut self, column: impl Into<String>) -> Self {
        self.0.push((column.into(), Direction::Asc));
        self
    }

    pub fn desc(mut self, column: impl Into<String>) -> Self {
        self.0.push((column.into(), Direction::Desc));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push_to(&self, statement: &mut Statement) {
        statement.push_separated(&self.0, ", ", |s, (column, direction)| {
            s.push_identifier(column).push(" ").push(direction.as_str());
        });
    }

    pub fn to_json(&self) -> Json {
        Json::Object(
            self.0
                .iter()
                .map(|(column, direction)| {
                    (column.clone(), Json::from(direction.as_str().to_lowercase()))
                })
                .collect(),
        )
    }
}
