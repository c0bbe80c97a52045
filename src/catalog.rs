//! The on-disk catalog handed over by the ports parser.
//!
//! Recipe parsing and options resolution happen outside the build core; the
//! contract between the two halves is this versioned JSON file. Each record
//! carries everything the scheduler needs: identity, version, resolved
//! options, the three dependency lists and an optional ignore reason.

use crate::{
    error::{DsynthError, Result},
    port::{DepKind, Origin, Port},
    utils,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Catalog format version id.
///
/// Bumped whenever a field changes meaning so a stale parser and a newer core
/// cannot silently disagree.
pub const CATALOG_FORMAT_VERSION: &str = "dsynth-catalog-1";

/// A parsed and options-resolved port description.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRecord {
    pub origin: Origin,
    pub version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extract_deps: Vec<Origin>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub build_deps: Vec<Origin>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub run_deps: Vec<Origin>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_cost: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore: Option<String>,
}

impl PortRecord {
    /// The dependency list of one class.
    pub fn deps_of(&self, kind: DepKind) -> &[Origin] {
        match kind {
            DepKind::Extract => &self.extract_deps,
            DepKind::Build => &self.build_deps,
            DepKind::Run => &self.run_deps,
        }
    }

    /// All dependencies across the three classes, deduplicated.
    pub fn all_deps(&self) -> Vec<Origin> {
        let mut deps: Vec<Origin> = self
            .extract_deps
            .iter()
            .chain(self.build_deps.iter())
            .chain(self.run_deps.iter())
            .cloned()
            .collect();
        deps.sort();
        deps.dedup();
        deps
    }

    pub fn to_port(&self) -> Port {
        Port {
            origin: self.origin.clone(),
            version: self.version.clone(),
            options: self.options.clone(),
            build_cost: self.build_cost,
            ignore: self.ignore.clone(),
        }
    }
}

/// The full set of port descriptions for one campaign.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(rename = "_format")]
    pub format: String,
    pub ports: Vec<PortRecord>,
}

impl Catalog {
    pub fn new(ports: Vec<PortRecord>) -> Self {
        Self { format: CATALOG_FORMAT_VERSION.to_string(), ports }
    }

    /// Reads the catalog json file from the given path.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        trace!("reading catalog at {}", path.display());
        let catalog: Catalog = utils::read_json_file(path)?;
        if catalog.format != CATALOG_FORMAT_VERSION {
            return Err(DsynthError::msg(format!(
                "catalog \"{}\" has format \"{}\", expected \"{}\"",
                path.display(),
                catalog.format,
                CATALOG_FORMAT_VERSION
            )));
        }
        trace!("read catalog with {} ports", catalog.ports.len());
        Ok(catalog)
    }

    /// Write the catalog as json file to the given path.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        utils::create_parent_dir_all(path)?;
        utils::write_json_file(self, path)?;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }
}
