// src/db/mod.rs

//! Install database
//!
//! SQLite-backed record of what is installed where, keyed by concrete-spec
//! hash. Each install row points at rows in `spec_nodes` holding the
//! canonical node documents of the installed DAG, so the registry can
//! repopulate full concrete specs without re-concretizing anything.

use crate::error::Result;
use crate::hash::SpecHash;
use crate::spec::canonical::{self, NodeDocument};
use crate::spec::ConcreteSpec;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS spec_nodes (
    hash     TEXT PRIMARY KEY,
    document TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS installs (
    hash         TEXT PRIMARY KEY,
    name         TEXT NOT NULL,
    version      TEXT NOT NULL,
    prefix       TEXT NOT NULL,
    installed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_installs_name ON installs(name);
";

/// One row of the install table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRecord {
    pub hash: SpecHash,
    pub name: String,
    pub version: String,
    pub prefix: PathBuf,
    pub installed_at: DateTime<Utc>,
}

/// Handle to the install database
pub struct InstallDb {
    conn: Connection,
}

impl InstallDb {
    /// Create or open the database at `path`, creating parent directories
    /// and the schema as needed
    pub fn init(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Open an in-memory database; used by tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Record a completed install: the DAG's node documents plus the install
    /// row, atomically
    pub fn record_install(&mut self, spec: &Arc<ConcreteSpec>, prefix: &Path) -> Result<()> {
        let documents = canonical::collect_documents(spec);
        let tx = self.conn.transaction()?;
        for (hash, doc) in &documents {
            tx.execute(
                "INSERT OR IGNORE INTO spec_nodes (hash, document) VALUES (?1, ?2)",
                params![hash.as_str(), doc.to_json()?],
            )?;
        }
        tx.execute(
            "INSERT OR REPLACE INTO installs (hash, name, version, prefix, installed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                spec.dag_hash().as_str(),
                spec.name,
                spec.version.to_string(),
                prefix.to_string_lossy(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        debug!(spec = %spec, hash = spec.dag_hash().short(), "recorded install");
        Ok(())
    }

    /// Is a spec hash present in the install table?
    pub fn is_installed(&self, hash: &SpecHash) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM installs WHERE hash = ?1",
            params![hash.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// The install prefix recorded for a spec hash, if installed
    pub fn prefix_of(&self, hash: &SpecHash) -> Result<Option<PathBuf>> {
        let mut stmt = self
            .conn
            .prepare("SELECT prefix FROM installs WHERE hash = ?1")?;
        let mut rows = stmt.query(params![hash.as_str()])?;
        match rows.next()? {
            Some(row) => {
                let prefix: String = row.get(0)?;
                Ok(Some(PathBuf::from(prefix)))
            }
            None => Ok(None),
        }
    }

    /// All install rows, ordered by name then version
    pub fn installs(&self) -> Result<Vec<InstallRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT hash, name, version, prefix, installed_at
             FROM installs ORDER BY name, version",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (hash, name, version, prefix, installed_at) = row?;
            records.push(InstallRecord {
                hash: SpecHash::new(hash)?,
                name,
                version,
                prefix: PathBuf::from(prefix),
                installed_at: installed_at
                    .parse::<DateTime<Utc>>()
                    .unwrap_or_else(|_| Utc::now()),
            });
        }
        Ok(records)
    }

    /// Every stored canonical node document, keyed by hash; the registry's
    /// repopulation source
    pub fn all_documents(&self) -> Result<BTreeMap<SpecHash, NodeDocument>> {
        let mut stmt = self
            .conn
            .prepare("SELECT hash, document FROM spec_nodes")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut documents = BTreeMap::new();
        for row in rows {
            let (hash, document) = row?;
            documents.insert(SpecHash::new(hash)?, NodeDocument::from_json(&document)?);
        }
        Ok(documents)
    }
}
