//! Row representation shared by change events and derived tables.

use serde_json::{Map, Value};

/// A row: column name to JSON value.
pub type Row = Map<String, Value>;

/// Builds a row from `(column, value)` pairs.
///
/// ```rust
/// use serde_json::json;
/// use tidemark_flow::row::row_of;
///
/// let row = row_of([("id", json!(1)), ("amount", json!(10))]);
/// assert_eq!(row["amount"], json!(10));
/// ```
pub fn row_of<K, I>(pairs: I) -> Row
where
    K: Into<String>,
    I: IntoIterator<Item = (K, Value)>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
