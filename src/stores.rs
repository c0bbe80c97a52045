//! Shared artifact directories exposed into every sandbox.
//!
//! The filesystem is the concurrency mechanism here: the scheduler guarantees
//! no two workers build the same port, so no two workers ever write the same
//! package file. Everything else (distfiles, ccache) is contended by the
//! build recipes themselves.

use crate::{
    config::Config,
    error::{DsynthError, Result},
    port::{Origin, Port},
    utils,
};
use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

/// The binary package repository.
///
/// Workers publish into it through the `/packages` null mount; the core only
/// ever checks for presence.
#[derive(Clone, Debug)]
pub struct PackageStore {
    root: PathBuf,
}

impl PackageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/All/<pkgname>.pkg`
    pub fn package_path(&self, port: &Port) -> PathBuf {
        self.root.join("All").join(port.pkgfile())
    }

    /// Whether the package for this port already exists in the repository.
    pub fn contains(&self, port: &Port) -> bool {
        self.package_path(port).is_file()
    }
}

/// Per-port build logs plus the campaign summary.
#[derive(Clone, Debug)]
pub struct LogStore {
    root: PathBuf,
}

impl LogStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<category>___<name>[@flavor].log`
    pub fn log_path(&self, origin: &Origin) -> PathBuf {
        self.root.join(format!("{}.log", origin.file_stem()))
    }

    /// Opens (truncating) the log file for a fresh build attempt.
    ///
    /// One writer per file: only the owning worker writes, readers open
    /// read-only.
    pub fn create_log(&self, origin: &Origin) -> Result<File> {
        let path = self.log_path(origin);
        utils::create_parent_dir_all(&path)?;
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|err| DsynthError::io(err, &path))
    }

    pub fn summary_path(&self) -> PathBuf {
        self.root.join("summary.json")
    }
}

/// Handles to the stores the core itself reads and writes. The remaining
/// shared directories (distfiles, options, ccache) are only ever mount
/// sources and stay plain paths in the config.
#[derive(Clone, Debug)]
pub struct Stores {
    pub packages: PackageStore,
    pub logs: LogStore,
}

impl Stores {
    pub fn from_config(config: &Config) -> Result<Self> {
        config.create_store_dirs()?;
        Ok(Self {
            packages: PackageStore::new(&config.packages_path),
            logs: LogStore::new(&config.logs_path),
        })
    }
}
