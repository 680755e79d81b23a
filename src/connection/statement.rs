use std::fmt::{self, Display};

use crate::schema::Json;

/// SQL text with `$n` placeholders and the parameters bound to them, built
/// incrementally in the style of `sqlx::QueryBuilder`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Json>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: vec![],
        }
    }

    pub fn push(&mut self, sql: impl AsRef<str>) -> &mut Self {
        self.sql.push_str(sql.as_ref());
        self
    }

    /// Append a double-quoted identifier
    pub fn push_identifier(&mut self, identifier: &str) -> &mut Self {
        self.sql.push('"');
        self.sql.push_str(&identifier.replace('"', "\"\""));
        self.sql.push('"');
        self
    }

    pub fn push_bind(&mut self, value: impl Into<Json>) -> &mut Self {
        self.params.push(value.into());
        self.sql.push('$');
        self.sql.push_str(&self.params.len().to_string());
        self
    }

    /// Append `items` separated by `separator`, rendering each with `push_item`
    pub fn push_separated<I, F>(&mut self, items: I, separator: &str, mut push_item: F) -> &mut Self
    where
        I: IntoIterator,
        F: FnMut(&mut Self, I::Item),
    {
        for (i, item) in items.into_iter().enumerate() {
            if i > 0 {
                self.push(separator);
            }
            push_item(self, item);
        }
        self
    }
}

impl Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)
    }
}
