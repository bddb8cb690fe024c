//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

//! Installed-package records.
//!
//! One record per package stem in a redb database under the image
//! metadata directory. Records are written only when a plan reaches
//! its postexecute phase, so the database always describes a
//! consistent image state.

use crate::fmri::Fmri;
use miette::Diagnostic;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Key: package stem. Value: serialized [`InstalledRecord`].
pub const INSTALLED_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("installed");

#[derive(Error, Debug, Diagnostic)]
pub enum InstalledError {
    #[error("IO error: {0}")]
    #[diagnostic(code(pkg::installed_error::io))]
    IO(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    #[diagnostic(code(pkg::installed_error::json))]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    #[diagnostic(code(pkg::installed_error::database))]
    Database(String),

    #[error("FMRI error: {0}")]
    #[diagnostic(code(pkg::installed_error::fmri))]
    Fmri(#[from] crate::fmri::FmriError),

    #[error("Package not installed: {0}")]
    #[diagnostic(code(pkg::installed_error::package_not_installed))]
    PackageNotInstalled(String),
}

pub type Result<T> = std::result::Result<T, InstalledError>;

/// What the image remembers about one installed package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledRecord {
    /// The exact FMRI that was installed
    pub fmri: Fmri,

    /// The filter expressions the package was installed with, one
    /// source string each
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<String>,
}

/// The installed packages database
pub struct InstalledPackages {
    db_path: PathBuf,
}

impl InstalledPackages {
    // redb tables borrow from their transaction, and commit() moves
    // the transaction. Table handles live in block scopes so their
    // borrows end before the commit.

    pub fn new<P: AsRef<Path>>(db_path: P) -> Self {
        InstalledPackages {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    /// Create the database and its table when absent.
    pub fn init_db(&self) -> Result<()> {
        if let Some(parent) = self.db_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let db = Database::create(&self.db_path)
            .map_err(|e| InstalledError::Database(format!("Failed to create database: {}", e)))?;

        let tx = db
            .begin_write()
            .map_err(|e| InstalledError::Database(format!("Failed to begin transaction: {}", e)))?;

        tx.open_table(INSTALLED_TABLE).map_err(|e| {
            InstalledError::Database(format!("Failed to create installed table: {}", e))
        })?;

        tx.commit()
            .map_err(|e| InstalledError::Database(format!("Failed to commit transaction: {}", e)))?;

        Ok(())
    }

    fn open(&self) -> Result<Database> {
        Database::open(&self.db_path)
            .map_err(|e| InstalledError::Database(format!("Failed to open database: {}", e)))
    }

    /// Record a package as installed, replacing any previous record
    /// for the same stem.
    pub fn add_install_record(&self, fmri: &Fmri, filters: &[String]) -> Result<()> {
        let db = self.open()?;
        let tx = db
            .begin_write()
            .map_err(|e| InstalledError::Database(format!("Failed to begin transaction: {}", e)))?;

        let record = InstalledRecord {
            fmri: fmri.clone(),
            filters: filters.to_vec(),
        };
        let bytes = serde_json::to_vec(&record)?;

        {
            let mut table = tx.open_table(INSTALLED_TABLE).map_err(|e| {
                InstalledError::Database(format!("Failed to open installed table: {}", e))
            })?;
            table
                .insert(fmri.stem(), bytes.as_slice())
                .map_err(|e| {
                    InstalledError::Database(format!("Failed to insert into installed table: {}", e))
                })?;
        }

        tx.commit()
            .map_err(|e| InstalledError::Database(format!("Failed to commit transaction: {}", e)))?;

        info!(fmri = %fmri, "recorded package install");
        Ok(())
    }

    /// Drop a package's record by stem.
    pub fn remove_install_record(&self, stem: &str) -> Result<()> {
        let db = self.open()?;
        let tx = db
            .begin_write()
            .map_err(|e| InstalledError::Database(format!("Failed to begin transaction: {}", e)))?;

        {
            let mut table = tx.open_table(INSTALLED_TABLE).map_err(|e| {
                InstalledError::Database(format!("Failed to open installed table: {}", e))
            })?;

            let removed = table.remove(stem).map_err(|e| {
                InstalledError::Database(format!("Failed to remove from installed table: {}", e))
            })?;
            if removed.is_none() {
                return Err(InstalledError::PackageNotInstalled(stem.to_string()));
            }
        }

        tx.commit()
            .map_err(|e| InstalledError::Database(format!("Failed to commit transaction: {}", e)))?;

        info!(stem, "removed package install record");
        Ok(())
    }

    /// The installed record for a stem, when there is one.
    pub fn get_record(&self, stem: &str) -> Result<Option<InstalledRecord>> {
        let db = self.open()?;
        let tx = db
            .begin_read()
            .map_err(|e| InstalledError::Database(format!("Failed to begin transaction: {}", e)))?;

        let record = {
            let table = tx.open_table(INSTALLED_TABLE).map_err(|e| {
                InstalledError::Database(format!("Failed to open installed table: {}", e))
            })?;

            match table.get(stem).map_err(|e| {
                InstalledError::Database(format!("Failed to read installed table: {}", e))
            })? {
                Some(bytes) => Some(serde_json::from_slice(bytes.value())?),
                None => None,
            }
        };

        Ok(record)
    }

    /// The installed FMRI of a stem, when the package is installed.
    pub fn get_version_installed(&self, stem: &str) -> Result<Option<Fmri>> {
        Ok(self.get_record(stem)?.map(|r| r.fmri))
    }

    pub fn is_installed(&self, stem: &str) -> Result<bool> {
        Ok(self.get_record(stem)?.is_some())
    }

    /// Every installed record, in stem order.
    pub fn iter_installed(&self) -> Result<Vec<InstalledRecord>> {
        let db = self.open()?;
        let tx = db
            .begin_read()
            .map_err(|e| InstalledError::Database(format!("Failed to begin transaction: {}", e)))?;

        let records = {
            let table = tx.open_table(INSTALLED_TABLE).map_err(|e| {
                InstalledError::Database(format!("Failed to open installed table: {}", e))
            })?;

            let mut records = Vec::new();
            for entry in table.iter().map_err(|e| {
                InstalledError::Database(format!("Failed to iterate installed table: {}", e))
            })? {
                let (_, value) = entry.map_err(|e| {
                    InstalledError::Database(format!(
                        "Failed to get entry from installed table: {}",
                        e
                    ))
                })?;
                records.push(serde_json::from_slice(value.value())?);
            }
            records
        };

        Ok(records)
    }
}
