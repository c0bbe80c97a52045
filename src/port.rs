//! Port identities and build-time state.
//!
//! A port is one node of the dependency graph: a recipe identified by its
//! `category/name[@flavor]` origin that produces exactly one package file.

use crate::error::{DsynthError, Result};
use md5::{Digest, Md5};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Matches `category/name` with an optional `@flavor` suffix.
static RE_ORIGIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<category>[A-Za-z0-9_.+-]+)/(?P<name>[A-Za-z0-9_.+-]+)(?:@(?P<flavor>[A-Za-z0-9_.+-]+))?$")
        .unwrap()
});

/// Canonical port identity, `category/name[@flavor]`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Origin {
    pub category: String,
    pub name: String,
    pub flavor: Option<String>,
}

impl Origin {
    pub fn parse(s: &str) -> Result<Self> {
        let caps = RE_ORIGIN
            .captures(s)
            .ok_or_else(|| DsynthError::Dag(format!("malformed origin \"{s}\"")))?;
        Ok(Self {
            category: caps["category"].to_string(),
            name: caps["name"].to_string(),
            flavor: caps.name("flavor").map(|m| m.as_str().to_string()),
        })
    }

    /// The `category/name` path of the recipe in the ports tree, without the
    /// flavor suffix.
    pub fn path(&self) -> String {
        format!("{}/{}", self.category, self.name)
    }

    /// Origin flattened for use as a file name, `category___name@flavor`.
    pub fn file_stem(&self) -> String {
        match &self.flavor {
            Some(flavor) => format!("{}___{}@{}", self.category, self.name, flavor),
            None => format!("{}___{}", self.category, self.name),
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.flavor {
            Some(flavor) => write!(f, "{}/{}@{}", self.category, self.name, flavor),
            None => write!(f, "{}/{}", self.category, self.name),
        }
    }
}

impl TryFrom<String> for Origin {
    type Error = DsynthError;

    fn try_from(s: String) -> Result<Self> {
        Origin::parse(&s)
    }
}

impl From<Origin> for String {
    fn from(o: Origin) -> String {
        o.to_string()
    }
}

impl std::str::FromStr for Origin {
    type Err = DsynthError;

    fn from_str(s: &str) -> Result<Self> {
        Origin::parse(s)
    }
}

/// The three disjoint dependency classes of a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DepKind {
    Extract,
    Build,
    Run,
}

/// Where a port is in its lifecycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortState {
    /// Some dependency is not Done yet.
    #[default]
    Pending,
    /// All dependencies Done; queued for dispatch.
    Ready,
    /// Handed to a worker slot.
    Running,
    /// Package present in the repository.
    Done,
    /// The build attempt failed; terminal.
    Failed,
    /// A dependency failed or was skipped; never attempted; terminal.
    Skipped,
    /// The catalog marked the port unbuildable; terminal.
    Ignored,
}

impl PortState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Skipped | Self::Ignored)
    }
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Ignored => "ignored",
        };
        f.write_str(s)
    }
}

/// One node of the dependency graph.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Port {
    pub origin: Origin,
    pub version: String,
    /// Resolved build knobs, sorted. Folded into the package name so two
    /// option sets of the same port never collide in the repository.
    pub options: Vec<String>,
    /// Estimated build cost in seconds, when the catalog provides one.
    pub build_cost: Option<u64>,
    /// Reason the catalog marked the port unbuildable, if any.
    pub ignore: Option<String>,
}

impl Port {
    /// The package name this port produces, `name-version` with an options
    /// hash suffix when any knob deviates from the default set.
    pub fn pkgname(&self) -> String {
        if self.options.is_empty() {
            format!("{}-{}", self.origin.name, self.version)
        } else {
            format!("{}-{}_h{}", self.origin.name, self.version, self.options_hash())
        }
    }

    /// The package file name, `<pkgname>.pkg`.
    pub fn pkgfile(&self) -> String {
        format!("{}.pkg", self.pkgname())
    }

    fn options_hash(&self) -> String {
        let mut sorted = self.options.clone();
        sorted.sort();
        let mut hasher = Md5::new();
        for opt in &sorted {
            hasher.update(opt.as_bytes());
            hasher.update(b"\n");
        }
        let digest = hasher.finalize();
        let mut out = String::with_capacity(10);
        for byte in digest.iter().take(5) {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn port(origin: &str, version: &str, options: &[&str]) -> Port {
        Port {
            origin: Origin::parse(origin).unwrap(),
            version: version.to_string(),
            options: options.iter().map(|s| s.to_string()).collect(),
            build_cost: None,
            ignore: None,
        }
    }

    #[test]
    fn parses_origin_triples() {
        let o = Origin::parse("devel/llvm@default").unwrap();
        assert_eq!(o.category, "devel");
        assert_eq!(o.name, "llvm");
        assert_eq!(o.flavor.as_deref(), Some("default"));
        assert_eq!(o.to_string(), "devel/llvm@default");
        assert_eq!(o.path(), "devel/llvm");

        let o = Origin::parse("editors/vim").unwrap();
        assert_eq!(o.flavor, None);

        assert!(Origin::parse("no-slash").is_err());
        assert!(Origin::parse("a/b/c").is_err());
    }

    #[test]
    fn pkgname_without_options_is_plain() {
        assert_eq!(port("editors/vim", "9.0.1", &[]).pkgname(), "vim-9.0.1");
    }

    #[test]
    fn options_change_the_pkgname() {
        let plain = port("www/nginx", "1.24.0", &[]);
        let lua = port("www/nginx", "1.24.0", &["LUA"]);
        assert_ne!(plain.pkgname(), lua.pkgname());
        assert!(lua.pkgname().starts_with("nginx-1.24.0_h"));
    }

    #[test]
    fn options_hash_is_order_independent() {
        let a = port("www/nginx", "1.24.0", &["LUA", "-DEBUG"]);
        let b = port("www/nginx", "1.24.0", &["-DEBUG", "LUA"]);
        assert_eq!(a.pkgname(), b.pkgname());
    }

    #[test]
    fn flavored_origins_flatten_for_filenames() {
        let o = Origin::parse("lang/python@py39").unwrap();
        assert_eq!(o.file_stem(), "lang___python@py39");
    }
}
