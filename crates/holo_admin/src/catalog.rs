//! Static catalog: databases, tables, and where their partitions live.
//!
//! Loaded once at startup from a JSON file. Name lookups are exact first,
//! then case-insensitive; a case-insensitive lookup that matches more than
//! one entry is ambiguous rather than an arbitrary pick.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use holo_control::{
    NodeId, PartitionDescriptor, PartitionId, RangeLocator, ResolutionError, StatsTarget,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogFile {
    #[serde(default)]
    pub databases: Vec<DatabaseDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseDef {
    pub name: String,
    #[serde(default)]
    pub tables: Vec<TableDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableDef {
    pub name: String,
    #[serde(default)]
    pub partitions: Vec<PartitionDescriptor>,
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    file: CatalogFile,
}

fn lookup<'a, T>(
    items: &'a [T],
    name: &str,
    name_of: impl Fn(&T) -> &str,
    kind: &'static str,
) -> Result<Option<&'a T>, ResolutionError> {
    if let Some(exact) = items.iter().find(|item| name_of(item) == name) {
        return Ok(Some(exact));
    }
    let folded: Vec<&T> = items
        .iter()
        .filter(|item| name_of(item).eq_ignore_ascii_case(name))
        .collect();
    match folded.as_slice() {
        [] => Ok(None),
        [single] => Ok(Some(*single)),
        many => Err(ResolutionError::Ambiguous {
            kind,
            name: name.to_string(),
            candidates: many.iter().map(|item| name_of(item).to_string()).collect(),
        }),
    }
}

impl Catalog {
    pub fn new(file: CatalogFile) -> anyhow::Result<Self> {
        let mut seen = BTreeSet::new();
        for db in &file.databases {
            anyhow::ensure!(seen.insert(db.name.as_str()), "duplicate database {:?}", db.name);
            let mut tables = BTreeSet::new();
            for table in &db.tables {
                anyhow::ensure!(
                    tables.insert(table.name.as_str()),
                    "duplicate table {:?} in database {:?}",
                    table.name,
                    db.name
                );
                for partition in &table.partitions {
                    anyhow::ensure!(
                        !partition.replicas.is_empty(),
                        "partition {} of {}.{} has no replicas",
                        partition.partition_id,
                        db.name,
                        table.name
                    );
                }
            }
        }
        Ok(Self { file })
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let file: CatalogFile = serde_json::from_str(json).context("parse catalog json")?;
        Self::new(file)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("read catalog {}", path.display()))?;
        Self::from_json(&json)
    }

    fn database(&self, name: &str) -> Result<&DatabaseDef, ResolutionError> {
        lookup(&self.file.databases, name, |db| db.name.as_str(), "database")?
            .ok_or_else(|| ResolutionError::DatabaseNotFound(name.to_string()))
    }

    fn table<'a>(&self, db: &'a DatabaseDef, name: &str) -> Result<&'a TableDef, ResolutionError> {
        lookup(&db.tables, name, |table| table.name.as_str(), "table")?.ok_or_else(|| {
            ResolutionError::TableNotFound {
                database: db.name.clone(),
                table: name.to_string(),
            }
        })
    }

    /// Canonical database name and its table names.
    pub fn table_names(&self, database: &str) -> Result<(String, Vec<String>), ResolutionError> {
        let db = self.database(database)?;
        Ok((
            db.name.clone(),
            db.tables.iter().map(|t| t.name.clone()).collect(),
        ))
    }

    /// Partitions that list `node_id` as a replica.
    pub fn partitions_hosted_by(&self, node_id: NodeId) -> Vec<PartitionId> {
        let hosted: BTreeSet<PartitionId> = self
            .file
            .databases
            .iter()
            .flat_map(|db| db.tables.iter())
            .flat_map(|table| table.partitions.iter())
            .filter(|p| p.replicas.contains(&node_id))
            .map(|p| p.partition_id)
            .collect();
        hosted.into_iter().collect()
    }

    pub fn resolve_target(
        &self,
        target: &StatsTarget,
    ) -> Result<Vec<PartitionDescriptor>, ResolutionError> {
        let db = self.database(target.database())?;
        let tables: Vec<&TableDef> = match target {
            StatsTarget::Table { table, .. } => vec![self.table(db, table)?],
            StatsTarget::Database { .. } => db.tables.iter().collect(),
        };

        // Tables may share a partition; merge their replica sets.
        let mut merged: BTreeMap<PartitionId, BTreeSet<NodeId>> = BTreeMap::new();
        for table in tables {
            for partition in &table.partitions {
                merged
                    .entry(partition.partition_id)
                    .or_default()
                    .extend(partition.replicas.iter().copied());
            }
        }
        Ok(merged
            .into_iter()
            .map(|(partition_id, replicas)| PartitionDescriptor {
                partition_id,
                replicas: replicas.into_iter().collect(),
            })
            .collect())
    }
}

#[async_trait]
impl RangeLocator for Catalog {
    async fn resolve(
        &self,
        target: &StatsTarget,
    ) -> Result<Vec<PartitionDescriptor>, ResolutionError> {
        self.resolve_target(target)
    }
}
