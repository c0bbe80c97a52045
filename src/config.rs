//! Campaign configuration.
//!
//! All knobs live in an immutable [`Config`] value created once (usually from
//! the CLI) and shared by `Arc` between the supervisor, scheduler and worker
//! threads. Nothing in the core reads global mutable state.

use crate::{
    error::Result,
    utils,
};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

/// The hot directories that get a per-slot discrete copy.
///
/// These are small but so heavily traversed during builds that N workers
/// null-mounting the same source contend on VFS locks; each slot gets its
/// own replica instead.
pub const HOT_DIRS: &[(&str, &str)] =
    &[("bin", "$/bin"), ("lib", "$/lib"), ("libexec", "$/libexec"), ("usr.bin", "$/usr/bin")];

/// Name of the sentinel file marking the template as fully constructed.
pub const TEMPLATE_SENTINEL: &str = ".template.good";

/// Paths and limits for a build campaign.
#[derive(Clone, Debug)]
pub struct Config {
    /// Root under which the template, discrete copies and worker sandboxes live.
    pub build_base: PathBuf,
    /// Host system image that `$`-prefixed mount sources resolve against.
    pub system_path: PathBuf,
    /// The ports tree, exposed read-only at `/xports` in every sandbox.
    pub ports_path: PathBuf,
    /// Shared package repository, exposed read-write at `/packages`.
    pub packages_path: PathBuf,
    /// Shared fetch cache, exposed read-write at `/distfiles`.
    pub distfiles_path: PathBuf,
    /// Resolved port options, exposed read-write at `/options`.
    pub options_path: PathBuf,
    /// Per-port build logs and the campaign summary.
    pub logs_path: PathBuf,
    /// Compiler cache shared between sandboxes, if enabled.
    pub ccache_path: Option<PathBuf>,
    /// Expose `$/usr/src` read-only in the sandbox.
    pub use_usr_src: bool,
    /// Number of worker slots.
    pub max_workers: usize,
    /// External helper that populates the template from the system image.
    pub template_script: PathBuf,
    /// Binary used to enter the sandbox for the build child.
    pub chroot_bin: PathBuf,
    /// Binary the build child runs inside the sandbox.
    pub make_bin: PathBuf,
    /// Rounds of the full unmount sequence before the slot is given up on.
    pub unmount_retries: usize,
    /// Pause between unmount rounds; kernel refcounts on null mounts can lag
    /// child-process exit.
    pub unmount_pause: Duration,
    /// Wall-clock limit for a single build child.
    pub build_timeout: Duration,
    /// How long a signalled child may linger before SIGKILL.
    pub cancel_grace: Duration,
    /// Keep dispatching work after a port fails.
    pub keep_going: bool,
    /// Let running builds finish on SIGINT/SIGTERM instead of interrupting.
    pub finish_running: bool,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// `<BuildBase>/Template`
    pub fn template_dir(&self) -> PathBuf {
        self.build_base.join("Template")
    }

    /// `<BuildBase>/.template.good`
    pub fn sentinel_path(&self) -> PathBuf {
        self.build_base.join(TEMPLATE_SENTINEL)
    }

    /// Sandbox root for a worker slot, `<BuildBase>/SL<nn>`.
    pub fn slot_dir(&self, index: usize) -> PathBuf {
        self.build_base.join(format!("SL{index:02}"))
    }

    /// Discrete copy of a hot directory for one slot, `<BuildBase>/<dir>.<nnn>`.
    pub fn discrete_dir(&self, hot_dir: &str, index: usize) -> PathBuf {
        self.build_base.join(format!("{hot_dir}.{index:03}"))
    }

    /// Resolves a `$`-prefixed source path against the system path.
    ///
    /// A system path of `/` collapses so that `$/bin` becomes `/bin`, not
    /// `//bin`.
    pub fn resolve_system(&self, spath: &str) -> PathBuf {
        match spath.strip_prefix('$') {
            Some(rest) => {
                if self.system_path == Path::new("/") {
                    PathBuf::from(rest)
                } else {
                    let rest = rest.strip_prefix('/').unwrap_or(rest);
                    self.system_path.join(rest)
                }
            }
            None => PathBuf::from(spath),
        }
    }

    /// Creates the shared artifact directories if missing.
    pub fn create_store_dirs(&self) -> Result<()> {
        utils::mkdirs(&self.build_base)?;
        utils::mkdirs(self.packages_path.join("All"))?;
        utils::mkdirs(&self.distfiles_path)?;
        utils::mkdirs(&self.options_path)?;
        utils::mkdirs(&self.logs_path)?;
        if let Some(ccache) = &self.ccache_path {
            utils::mkdirs(ccache)?;
        }
        Ok(())
    }
}

/// Builder for [`Config`].
///
/// Only the build base is required; every other knob has the stock default.
#[derive(Clone, Debug, Default)]
pub struct ConfigBuilder {
    build_base: Option<PathBuf>,
    system_path: Option<PathBuf>,
    ports_path: Option<PathBuf>,
    packages_path: Option<PathBuf>,
    distfiles_path: Option<PathBuf>,
    options_path: Option<PathBuf>,
    logs_path: Option<PathBuf>,
    ccache_path: Option<PathBuf>,
    use_usr_src: bool,
    max_workers: Option<usize>,
    template_script: Option<PathBuf>,
    chroot_bin: Option<PathBuf>,
    make_bin: Option<PathBuf>,
    unmount_retries: Option<usize>,
    unmount_pause: Option<Duration>,
    build_timeout: Option<Duration>,
    cancel_grace: Option<Duration>,
    keep_going: Option<bool>,
    finish_running: bool,
}

impl ConfigBuilder {
    pub fn build_base(mut self, path: impl Into<PathBuf>) -> Self {
        self.build_base = Some(path.into());
        self
    }

    pub fn system_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.system_path = Some(path.into());
        self
    }

    pub fn ports_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ports_path = Some(path.into());
        self
    }

    pub fn packages_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.packages_path = Some(path.into());
        self
    }

    pub fn distfiles_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.distfiles_path = Some(path.into());
        self
    }

    pub fn options_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.options_path = Some(path.into());
        self
    }

    pub fn logs_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.logs_path = Some(path.into());
        self
    }

    pub fn ccache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ccache_path = Some(path.into());
        self
    }

    pub fn use_usr_src(mut self, yes: bool) -> Self {
        self.use_usr_src = yes;
        self
    }

    /// Number of worker slots; clamped to `1..=64`.
    pub fn max_workers(mut self, n: usize) -> Self {
        self.max_workers = Some(n.clamp(1, 64));
        self
    }

    pub fn template_script(mut self, path: impl Into<PathBuf>) -> Self {
        self.template_script = Some(path.into());
        self
    }

    pub fn chroot_bin(mut self, path: impl Into<PathBuf>) -> Self {
        self.chroot_bin = Some(path.into());
        self
    }

    pub fn make_bin(mut self, path: impl Into<PathBuf>) -> Self {
        self.make_bin = Some(path.into());
        self
    }

    pub fn unmount_retries(mut self, n: usize) -> Self {
        self.unmount_retries = Some(n);
        self
    }

    pub fn unmount_pause(mut self, pause: Duration) -> Self {
        self.unmount_pause = Some(pause);
        self
    }

    pub fn build_timeout(mut self, timeout: Duration) -> Self {
        self.build_timeout = Some(timeout);
        self
    }

    pub fn cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = Some(grace);
        self
    }

    pub fn keep_going(mut self, yes: bool) -> Self {
        self.keep_going = Some(yes);
        self
    }

    pub fn finish_running(mut self, yes: bool) -> Self {
        self.finish_running = yes;
        self
    }

    pub fn build(self) -> Result<Config> {
        let build_base = self
            .build_base
            .ok_or_else(|| crate::error::DsynthError::msg("config: build base is required"))?;
        let workers = self.max_workers.unwrap_or_else(|| num_cpus::get().clamp(1, 64));
        Ok(Config {
            system_path: self.system_path.unwrap_or_else(|| PathBuf::from("/")),
            ports_path: self.ports_path.unwrap_or_else(|| PathBuf::from("/usr/dports")),
            packages_path: self.packages_path.unwrap_or_else(|| build_base.join("packages")),
            distfiles_path: self.distfiles_path.unwrap_or_else(|| build_base.join("distfiles")),
            options_path: self.options_path.unwrap_or_else(|| build_base.join("options")),
            logs_path: self.logs_path.unwrap_or_else(|| build_base.join("logs")),
            ccache_path: self.ccache_path,
            use_usr_src: self.use_usr_src,
            max_workers: workers,
            template_script: self
                .template_script
                .unwrap_or_else(|| PathBuf::from("/usr/libexec/dsynth/mktemplate")),
            chroot_bin: self.chroot_bin.unwrap_or_else(|| PathBuf::from("/usr/sbin/chroot")),
            make_bin: self.make_bin.unwrap_or_else(|| PathBuf::from("/usr/bin/make")),
            unmount_retries: self.unmount_retries.unwrap_or(10),
            unmount_pause: self.unmount_pause.unwrap_or(Duration::from_secs(5)),
            build_timeout: self.build_timeout.unwrap_or(Duration::from_secs(24 * 3600)),
            cancel_grace: self.cancel_grace.unwrap_or(Duration::from_secs(30)),
            keep_going: self.keep_going.unwrap_or(true),
            finish_running: self.finish_running,
            build_base,
        })
    }
}
