//! The shared template root and its per-slot discrete copies.
//!
//! The template is built once per campaign by an external helper script and
//! then only ever read. A sentinel file written after an explicit sync marks
//! it usable: a crash mid-construction leaves no sentinel, so the next run
//! rebuilds instead of seeding sandboxes from a half-populated tree.

use crate::{
    config::{Config, HOT_DIRS},
    error::{DsynthError, Result},
    utils,
};
use rayon::prelude::*;
use std::{
    fs::OpenOptions,
    io,
    path::Path,
    process::Command,
    sync::Arc,
};

#[derive(Clone, Debug)]
pub struct TemplateManager {
    config: Arc<Config>,
}

impl TemplateManager {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// True when the sentinel proves a prior run completed construction.
    pub fn is_good(&self) -> bool {
        self.config.sentinel_path().is_file()
    }

    /// Builds the template and the discrete copies unless they are already
    /// marked good. Returns whether any work was performed.
    pub fn ensure(&self, mut force: bool) -> Result<bool> {
        if !force {
            force = !self.config.template_dir().is_dir() || !self.is_good();
        }
        info!("Check Template: {}", if force { "Must-Create" } else { "Good" });
        if !force {
            return Ok(false);
        }

        let sentinel = self.config.sentinel_path();
        let _ = std::fs::remove_file(&sentinel);

        self.run_template_script()?;
        self.make_discrete_copies()?;

        // The sentinel must not hit disk before the tree it vouches for.
        utils::sync_filesystems();
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&sentinel)
            .map_err(|err| DsynthError::io(err, &sentinel))?;
        info!("Template - done");
        Ok(true)
    }

    /// Removes the template tree. Best-effort; a failure is logged and the
    /// campaign carries on without the space back.
    pub fn destroy(&self) {
        let template = self.config.template_dir();
        if !template.exists() {
            return;
        }
        let _ = std::fs::remove_file(self.config.sentinel_path());
        if let Err(err) = clear_immutable(&template) {
            warn!("chflags on {} failed: {err}", template.display());
        }
        if let Err(err) = std::fs::remove_dir_all(&template) {
            warn!("cannot remove {}: {err}", template.display());
        }
    }

    /// Removes every discrete copy directory. Used by `cleanup`.
    pub fn destroy_discrete_copies(&self) {
        for (name, _) in HOT_DIRS {
            for slot in 0..self.config.max_workers {
                let dst = self.config.discrete_dir(name, slot);
                if !dst.exists() {
                    continue;
                }
                if let Err(err) = clear_immutable(&dst) {
                    warn!("chflags on {} failed: {err}", dst.display());
                }
                if let Err(err) = std::fs::remove_dir_all(&dst) {
                    warn!("cannot remove {}: {err}", dst.display());
                }
            }
        }
    }

    /// Populates `<BuildBase>/Template` from the system image via the
    /// configured helper; only the exit status is interpreted here.
    fn run_template_script(&self) -> Result<()> {
        let template = self.config.template_dir();
        utils::mkdirs(&self.config.build_base)?;
        let status = Command::new(&self.config.template_script)
            .arg(&self.config.system_path)
            .arg(&template)
            .status()
            .map_err(|err| {
                DsynthError::Template(format!(
                    "cannot run {}: {err}",
                    self.config.template_script.display()
                ))
            })?;
        debug!("template script exited with {status}");
        if !status.success() {
            return Err(DsynthError::Template(format!(
                "{} exited with {status}",
                self.config.template_script.display()
            )));
        }
        Ok(())
    }

    /// One private replica of each hot directory per slot. All-or-nothing:
    /// any copy failure fails template construction.
    fn make_discrete_copies(&self) -> Result<()> {
        let jobs: Vec<(&str, &str, usize)> = HOT_DIRS
            .iter()
            .flat_map(|&(name, src)| {
                (0..self.config.max_workers).map(move |slot| (name, src, slot))
            })
            .collect();

        jobs.into_par_iter().try_for_each(|(name, src, slot)| {
            let src = self.config.resolve_system(src);
            let dst = self.config.discrete_dir(name, slot);

            // The destination must be absent before the copy starts;
            // immutable flags inside a stale copy would make the removal
            // fail half way.
            if dst.exists() {
                clear_immutable(&dst).map_err(|err| DsynthError::io(err, &dst))?;
                std::fs::remove_dir_all(&dst).map_err(|err| DsynthError::io(err, &dst))?;
            }
            std::fs::create_dir_all(&dst).map_err(|err| DsynthError::io(err, &dst))?;

            let mut opts = fs_extra::dir::CopyOptions::new();
            opts.content_only = true;
            fs_extra::dir::copy(&src, &dst, &opts).map_err(|err| {
                DsynthError::Template(format!(
                    "copying {} to {} failed: {err}",
                    src.display(),
                    dst.display()
                ))
            })?;
            trace!("discrete copy {} ready", dst.display());
            Ok(())
        })
    }
}

/// Strips immutable flags so removal can proceed.
#[cfg(any(target_os = "dragonfly", target_os = "freebsd"))]
fn clear_immutable(path: &Path) -> io::Result<()> {
    let status = Command::new("/bin/chflags").args(["-R", "noschg"]).arg(path).status()?;
    if !status.success() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("chflags exited with {status}"),
        ));
    }
    Ok(())
}

/// No schg flags outside the BSDs.
#[cfg(not(any(target_os = "dragonfly", target_os = "freebsd")))]
fn clear_immutable(_path: &Path) -> io::Result<()> {
    Ok(())
}
