//! Records flowing through the pipeline

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SchemaError;

/// Longest identifier Postgres keeps without truncation
const MAX_IDENTIFIER_LEN: usize = 63;

/// One catalog entry: which entity to fetch and where its detail lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogReference {
    pub id: i32,
    pub name: String,
    pub locator: String,
}

impl CatalogReference {
    /// Build a reference from a catalog entry, taking the id from the last
    /// path segment of its URL (`.../pokemon/25/` -> 25)
    pub fn from_entry(name: impl Into<String>, url: impl Into<String>) -> Option<Self> {
        let locator = url.into();
        let id = locator
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .and_then(|segment| segment.parse::<i32>().ok())?;

        Some(Self {
            id,
            name: name.into(),
            locator,
        })
    }
}

/// Full detail document of one entity
///
/// Only the projected fields are typed; everything else the source sends is
/// kept in `extra` so staging holds the complete payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailRecord {
    pub id: i32,
    pub name: String,
    pub height: i32,
    pub weight: i32,
    /// Null for some entries in the source
    pub base_experience: Option<i32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DetailRecord {
    pub fn new(
        id: i32,
        name: impl Into<String>,
        height: i32,
        weight: i32,
        base_experience: Option<i32>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            height,
            weight,
            base_experience,
            extra: Map::new(),
        }
    }
}

/// Projection of a detail record onto the sink columns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkRow {
    pub id: i32,
    pub name: String,
    pub height: i32,
    pub weight: i32,
    pub base_experience: Option<i32>,
}

impl From<&DetailRecord> for SinkRow {
    fn from(record: &DetailRecord) -> Self {
        Self {
            id: record.id,
            name: record.name.clone(),
            height: record.height,
            weight: record.weight,
            base_experience: record.base_experience,
        }
    }
}

/// Sink column names with their SQL definitions, in table order
pub const SINK_COLUMNS: [(&str, &str); 5] = [
    ("id", "INTEGER PRIMARY KEY"),
    ("name", "TEXT"),
    ("height", "INTEGER"),
    ("weight", "INTEGER"),
    ("base_experience", "INTEGER"),
];

/// Target database and table; names are validated identifiers so they can
/// be interpolated into DDL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkSchema {
    database: String,
    table: String,
}

impl SinkSchema {
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Result<Self, SchemaError> {
        let database = database.into();
        let table = table.into();
        validate_identifier(&database)?;
        validate_identifier(&table)?;
        Ok(Self { database, table })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn column_names() -> impl Iterator<Item = &'static str> {
        SINK_COLUMNS.iter().map(|(name, _)| *name)
    }

    /// Column list for `CREATE TABLE`
    pub fn column_definitions() -> String {
        SINK_COLUMNS
            .iter()
            .map(|(name, definition)| format!("{name} {definition}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Accept `[A-Za-z_][A-Za-z0-9_]*` up to 63 bytes
pub fn validate_identifier(name: &str) -> Result<(), SchemaError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid_start && valid_rest && name.len() <= MAX_IDENTIFIER_LEN {
        Ok(())
    } else {
        Err(SchemaError::InvalidIdentifier(name.to_string()))
    }
}
