//! Live table structure read from the storage catalog.

use crate::error::EngineError;
use crate::storage::StorageEngine;
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LiveColumn {
    pub name: String,
    /// Declared type as recorded by the engine, e.g. `VARCHAR(255)`.
    pub physical_type: String,
    pub nullable: bool,
    pub default: Option<String>,
    pub primary_key: bool,
}

/// Absence is a normal outcome of introspection, not an error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TableState {
    Absent,
    Present(Vec<LiveColumn>),
}

impl TableState {
    pub fn exists(&self) -> bool {
        matches!(self, TableState::Present(_))
    }

    pub fn columns(&self) -> &[LiveColumn] {
        match self {
            TableState::Absent => &[],
            TableState::Present(cols) => cols,
        }
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns().iter().map(|c| c.name.as_str()).collect()
    }
}

pub struct SchemaIntrospector;

impl SchemaIntrospector {
    pub async fn inspect(storage: &dyn StorageEngine, table: &str) -> Result<TableState, EngineError> {
        match storage.introspect_columns(table).await {
            Ok(Some(columns)) => Ok(TableState::Present(columns)),
            Ok(None) => Ok(TableState::Absent),
            Err(source) => Err(EngineError::SchemaIntrospection {
                table: table.to_string(),
                source,
            }),
        }
    }
}
