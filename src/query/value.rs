//! Conversion between JSON values and SQLite parameters and rows.

use serde_json::{Map, Value};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Column, Row, Sqlite, TypeInfo, ValueRef};

use crate::error::SyncResult;

/// A result row keyed by column name.
pub type JsonRow = Map<String, Value>;

/// Binds JSON parameters in order. Arrays and objects are bound as JSON text.
pub(crate) fn bind_params<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &'q [Value],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for param in params {
        query = match param {
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => query.bind(i),
                None => query.bind(n.as_f64()),
            },
            Value::String(s) => query.bind(s.as_str()),
            other => query.bind(other.to_string()),
        };
    }
    query
}

/// Converts a row using each value's storage class.
pub(crate) fn row_to_json(row: &SqliteRow) -> SyncResult<JsonRow> {
    let mut object = Map::with_capacity(row.columns().len());
    for column in row.columns() {
        let index = column.ordinal();
        let type_name = {
            let raw = row.try_get_raw(index)?;
            if raw.is_null() {
                None
            } else {
                Some(raw.type_info().name().to_string())
            }
        };

        let value = match type_name.as_deref() {
            None => Value::Null,
            Some("INTEGER") | Some("BOOLEAN") => Value::from(row.try_get::<i64, _>(index)?),
            Some("REAL") => Value::from(row.try_get::<f64, _>(index)?),
            Some("BLOB") => {
                let bytes: Vec<u8> = row.try_get(index)?;
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            }
            Some(_) => Value::String(row.try_get::<String, _>(index)?),
        };
        object.insert(column.name().to_string(), value);
    }
    Ok(object)
}
