//! Replicated table definitions and the dependency-ordered table catalog.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{SyncError, SyncResult};

/// Prefix reserved for bookkeeping tables.
const RESERVED_PREFIX: &str = "_mason_";

fn default_primary_key() -> Vec<String> {
    vec!["id".to_string()]
}

/// A server table mirrored into the local replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    /// Table name, both upstream and locally
    pub name: String,
    /// Primary key columns
    #[serde(default = "default_primary_key")]
    pub primary_key: Vec<String>,
    /// Tables this one references through foreign keys
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl TableSpec {
    /// Creates a table keyed by a single `id` column with no dependencies.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: default_primary_key(),
            depends_on: Vec::new(),
        }
    }

    /// Sets the primary key columns.
    pub fn with_primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the tables this table references.
    pub fn with_depends_on<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = tables.into_iter().map(Into::into).collect();
        self
    }

    /// Checks that the name and key columns are usable SQL identifiers.
    pub fn validate(&self) -> SyncResult<()> {
        if !is_identifier(&self.name) {
            return Err(self.invalid("name must be a plain SQL identifier"));
        }
        if self.name.starts_with(RESERVED_PREFIX) || self.name.starts_with("sqlite_") {
            return Err(self.invalid("name uses a reserved prefix"));
        }
        if self.primary_key.is_empty() {
            return Err(self.invalid("primary key must have at least one column"));
        }
        if let Some(column) = self.primary_key.iter().find(|c| c.is_empty()) {
            return Err(self.invalid(&format!("empty primary key column '{}'", column)));
        }
        Ok(())
    }

    /// Returns the double-quoted table name for use in SQL.
    pub fn quoted_name(&self) -> String {
        format!("\"{}\"", self.name)
    }

    /// Derives the local primary key for a row.
    ///
    /// A single-column key is the column's text value; composite keys are the
    /// JSON array of the columns' text values.
    pub fn key_for(&self, row: &Map<String, Value>) -> SyncResult<String> {
        let mut parts = Vec::with_capacity(self.primary_key.len());
        for column in &self.primary_key {
            match row.get(column) {
                Some(Value::Null) | None => {
                    return Err(SyncError::MissingPrimaryKey {
                        table: self.name.clone(),
                        column: column.clone(),
                    })
                }
                Some(Value::String(s)) => parts.push(s.clone()),
                Some(other) => parts.push(other.to_string()),
            }
        }
        Ok(self.join_key(parts))
    }

    /// Derives the local primary key from a shape message key of the form
    /// `"schema"."table"/"pk1"/"pk2"`.
    pub fn key_from_wire(&self, wire_key: &str) -> SyncResult<String> {
        let malformed = |reason: &str| {
            SyncError::Decode(format!(
                "message key {} for table '{}' {}",
                wire_key, self.name, reason
            ))
        };

        let (relation, values) =
            split_wire_key(wire_key).ok_or_else(|| malformed("is not a quoted relation key"))?;
        if relation.last().map(String::as_str) != Some(self.name.as_str()) {
            return Err(malformed("names another table"));
        }
        if values.len() != self.primary_key.len() {
            return Err(malformed(&format!(
                "has {} key values, expected {}",
                values.len(),
                self.primary_key.len()
            )));
        }
        Ok(self.join_key(values))
    }

    fn join_key(&self, mut parts: Vec<String>) -> String {
        if parts.len() == 1 {
            return parts.remove(0);
        }
        Value::Array(parts.into_iter().map(Value::String).collect()).to_string()
    }

    fn invalid(&self, reason: &str) -> SyncError {
        SyncError::InvalidTable {
            name: self.name.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Splits `"schema"."table"/"v1"/"v2"` into its relation parts and key
/// values. Embedded quotes are doubled.
fn split_wire_key(key: &str) -> Option<(Vec<String>, Vec<String>)> {
    let mut relation = Vec::new();
    let mut values = Vec::new();
    let mut in_values = false;
    let mut chars = key.chars().peekable();

    loop {
        if chars.next() != Some('"') {
            return None;
        }
        let mut part = String::new();
        loop {
            match chars.next()? {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    part.push('"');
                }
                '"' => break,
                c => part.push(c),
            }
        }
        if in_values {
            values.push(part);
        } else {
            relation.push(part);
        }

        match chars.next() {
            None => break,
            Some('.') if !in_values => {}
            Some('/') => in_values = true,
            Some(_) => return None,
        }
    }

    if relation.is_empty() || values.is_empty() {
        return None;
    }
    Some((relation, values))
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// The set of tables replicated by a session, kept in initial load order.
///
/// Every table appears after all of the tables it depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableCatalog {
    tables: Vec<TableSpec>,
}

impl TableCatalog {
    /// Validates the tables and orders them so dependencies load first.
    ///
    /// Tables without ordering constraints keep their given order.
    pub fn new(tables: Vec<TableSpec>) -> SyncResult<Self> {
        let mut names = HashSet::new();
        for table in &tables {
            table.validate()?;
            if !names.insert(table.name.as_str()) {
                return Err(SyncError::Catalog(format!(
                    "table '{}' is listed twice",
                    table.name
                )));
            }
        }
        for table in &tables {
            if let Some(missing) = table
                .depends_on
                .iter()
                .find(|dep| !names.contains(dep.as_str()))
            {
                return Err(SyncError::Catalog(format!(
                    "table '{}' depends on unknown table '{}'",
                    table.name, missing
                )));
            }
        }

        let mut remaining = tables;
        let mut ordered: Vec<TableSpec> = Vec::with_capacity(remaining.len());
        while !remaining.is_empty() {
            let ready = remaining.iter().position(|table| {
                table
                    .depends_on
                    .iter()
                    .all(|dep| ordered.iter().any(|done| &done.name == dep))
            });
            match ready {
                Some(index) => ordered.push(remaining.remove(index)),
                None => {
                    let stuck: Vec<&str> = remaining.iter().map(|t| t.name.as_str()).collect();
                    return Err(SyncError::Catalog(format!(
                        "dependency cycle between tables: {}",
                        stuck.join(", ")
                    )));
                }
            }
        }

        Ok(Self { tables: ordered })
    }

    /// The Mason client's replicated tables.
    pub fn mason() -> Self {
        Self {
            tables: vec![
                TableSpec::new("workspaces"),
                TableSpec::new("users"),
                TableSpec::new("members").with_depends_on(["workspaces", "users"]),
                TableSpec::new("projects").with_depends_on(["workspaces"]),
                TableSpec::new("tasks").with_depends_on(["workspaces", "projects"]),
                TableSpec::new("activities").with_depends_on(["projects"]),
                TableSpec::new("time_entries")
                    .with_depends_on(["workspaces", "members", "projects", "tasks"]),
            ],
        }
    }

    /// Tables in initial load order.
    pub fn tables(&self) -> &[TableSpec] {
        &self.tables
    }

    /// Looks up a table by name.
    pub fn get(&self, name: &str) -> Option<&TableSpec> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Table names in initial load order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(|t| t.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
