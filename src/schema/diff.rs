//! Live vs desired structure, compared by column name.

use crate::schema::descriptor::{ColumnSpec, EntityDescriptor, JoinTableSpec};
use crate::schema::introspect::LiveColumn;
use serde::Serialize;
use std::collections::HashSet;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SchemaDiff {
    pub to_add: Vec<ColumnSpec>,
    /// Live columns no longer described. Reported, never applied by `update`.
    pub to_drop: Vec<String>,
    /// Type or constraint changes on existing columns. Not computed yet; always empty.
    pub to_modify: Vec<String>,
    /// Join tables of many-valued relations that do not exist yet.
    pub missing_join_tables: Vec<JoinTableSpec>,
}

impl SchemaDiff {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty()
            && self.to_drop.is_empty()
            && self.to_modify.is_empty()
            && self.missing_join_tables.is_empty()
    }

    /// True when applying the diff would issue DDL.
    pub fn has_changes_to_apply(&self) -> bool {
        !self.to_add.is_empty() || !self.missing_join_tables.is_empty()
    }

    pub fn added_names(&self) -> Vec<String> {
        self.to_add.iter().map(|c| c.name.clone()).collect()
    }
}

pub struct SchemaDiffEngine;

impl SchemaDiffEngine {
    /// `existing_tables` is consulted for join tables only; pass the names already present in storage.
    pub fn diff(live: &[LiveColumn], desired: &EntityDescriptor, existing_tables: &HashSet<String>) -> SchemaDiff {
        let live_names: HashSet<&str> = live.iter().map(|c| c.name.as_str()).collect();
        let desired_names: HashSet<&str> = desired.columns.iter().map(|c| c.name.as_str()).collect();

        let to_add = desired
            .columns
            .iter()
            .filter(|c| !live_names.contains(c.name.as_str()))
            .cloned()
            .collect();
        let to_drop = live
            .iter()
            .filter(|c| !c.primary_key && !desired_names.contains(c.name.as_str()))
            .map(|c| c.name.clone())
            .collect();
        let missing_join_tables = desired
            .join_tables()
            .filter(|j| !existing_tables.contains(&j.name))
            .cloned()
            .collect();

        SchemaDiff {
            to_add,
            to_drop,
            to_modify: Vec::new(),
            missing_join_tables,
        }
    }
}
