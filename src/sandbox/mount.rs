//! Sandbox filesystem topology.
//!
//! Every worker slot gets the same tree: a size-capped tmpfs root seeded from
//! the template, read-only null mounts of the host system (hot directories
//! come from per-slot discrete copies), and the shared artifact stores
//! mounted read-write. Mounting shells out to the four mount helpers;
//! unmounting calls the kernel directly and retries, because null-mount
//! reference counts can lag an exiting build child.

use crate::config::Config;
use cfg_if::cfg_if;
use std::{
    ffi::CString,
    io,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
    process::Command,
    thread,
};

const MOUNT_TMPFS_BINARY: &str = "/sbin/mount_tmpfs";
const MOUNT_NULLFS_BINARY: &str = "/sbin/mount_null";
const MOUNT_DEVFS_BINARY: &str = "/sbin/mount_devfs";
const MOUNT_PROCFS_BINARY: &str = "/sbin/mount_procfs";

/// tmpfs caps, advisory to the kernel (tmpfs allocates lazily).
const TMPFS_SMALL_SIZE: &str = "16g";
const TMPFS_BIG_SIZE: &str = "64g";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MountKind {
    /// 16 GiB tmpfs: sandbox root and other small scratch areas.
    TmpfsSmall,
    /// 64 GiB tmpfs: `/construction`, the actual build scratch.
    TmpfsBig,
    Nullfs,
    Devfs,
    Procfs,
}

/// One mount with every path already resolved for a concrete slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedMount {
    pub kind: MountKind,
    pub rw: bool,
    /// Absolute source directory; `None` for the synthetic filesystems.
    pub source: Option<PathBuf>,
    /// Target relative to the slot basedir; empty string is the root.
    pub target: &'static str,
}

/// A step of the provisioning sequence, executed strictly in order since
/// later targets live beneath earlier mounts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlanStep {
    /// Bare directory creation, no mount.
    Mkdir(&'static str),
    Mount(ResolvedMount),
}

/// The mount sequence for one worker slot.
pub fn mount_plan(config: &Config, slot: usize) -> Vec<PlanStep> {
    let sys = |p: &str| Some(config.resolve_system(p));
    let discrete = |d: &str| Some(config.discrete_dir(d, slot));
    let mut plan = vec![
        PlanStep::Mount(ResolvedMount {
            kind: MountKind::TmpfsSmall,
            rw: true,
            source: None,
            target: "",
        }),
        PlanStep::Mkdir("usr"),
        PlanStep::Mount(ResolvedMount {
            kind: MountKind::Nullfs,
            rw: false,
            source: sys("$/boot"),
            target: "boot",
        }),
        PlanStep::Mount(ResolvedMount {
            kind: MountKind::TmpfsSmall,
            rw: true,
            source: None,
            target: "boot/modules.local",
        }),
        PlanStep::Mount(ResolvedMount {
            kind: MountKind::Devfs,
            rw: true,
            source: None,
            target: "dev",
        }),
        PlanStep::Mount(ResolvedMount {
            kind: MountKind::Procfs,
            rw: false,
            source: None,
            target: "proc",
        }),
        PlanStep::Mount(ResolvedMount {
            kind: MountKind::Nullfs,
            rw: false,
            source: discrete("bin"),
            target: "bin",
        }),
        PlanStep::Mount(ResolvedMount {
            kind: MountKind::Nullfs,
            rw: false,
            source: sys("$/sbin"),
            target: "sbin",
        }),
        PlanStep::Mount(ResolvedMount {
            kind: MountKind::Nullfs,
            rw: false,
            source: discrete("lib"),
            target: "lib",
        }),
        PlanStep::Mount(ResolvedMount {
            kind: MountKind::Nullfs,
            rw: false,
            source: discrete("libexec"),
            target: "libexec",
        }),
        PlanStep::Mount(ResolvedMount {
            kind: MountKind::Nullfs,
            rw: false,
            source: discrete("usr.bin"),
            target: "usr/bin",
        }),
    ];
    for sub in ["include", "lib", "libdata", "libexec", "sbin", "share"] {
        plan.push(PlanStep::Mount(ResolvedMount {
            kind: MountKind::Nullfs,
            rw: false,
            source: Some(config.resolve_system(&format!("$/usr/{sub}"))),
            target: match sub {
                "include" => "usr/include",
                "lib" => "usr/lib",
                "libdata" => "usr/libdata",
                "libexec" => "usr/libexec",
                "sbin" => "usr/sbin",
                _ => "usr/share",
            },
        }));
    }
    plan.push(PlanStep::Mount(ResolvedMount {
        kind: MountKind::TmpfsSmall,
        rw: true,
        source: None,
        target: "usr/local",
    }));
    plan.push(PlanStep::Mount(ResolvedMount {
        kind: MountKind::Nullfs,
        rw: false,
        source: sys("$/usr/games"),
        target: "usr/games",
    }));
    if config.use_usr_src {
        plan.push(PlanStep::Mount(ResolvedMount {
            kind: MountKind::Nullfs,
            rw: false,
            source: sys("$/usr/src"),
            target: "usr/src",
        }));
    }
    plan.push(PlanStep::Mount(ResolvedMount {
        kind: MountKind::Nullfs,
        rw: false,
        source: Some(config.ports_path.clone()),
        target: "xports",
    }));
    plan.push(PlanStep::Mount(ResolvedMount {
        kind: MountKind::Nullfs,
        rw: true,
        source: Some(config.options_path.clone()),
        target: "options",
    }));
    plan.push(PlanStep::Mount(ResolvedMount {
        kind: MountKind::Nullfs,
        rw: true,
        source: Some(config.packages_path.clone()),
        target: "packages",
    }));
    plan.push(PlanStep::Mount(ResolvedMount {
        kind: MountKind::Nullfs,
        rw: true,
        source: Some(config.distfiles_path.clone()),
        target: "distfiles",
    }));
    plan.push(PlanStep::Mount(ResolvedMount {
        kind: MountKind::TmpfsBig,
        rw: true,
        source: None,
        target: "construction",
    }));
    if let Some(ccache) = &config.ccache_path {
        plan.push(PlanStep::Mount(ResolvedMount {
            kind: MountKind::Nullfs,
            rw: true,
            source: Some(ccache.clone()),
            target: "ccache",
        }));
    }
    plan
}

/// Unmount order: strict reverse of the mount plan, unconditionally including
/// the optional targets. Issuing the unmount for an absent mount is harmless
/// and guarantees cleanup even after a config change between runs.
pub fn unmount_targets() -> &'static [&'static str] {
    &[
        "proc",
        "dev",
        "usr/src",
        "usr/games",
        "boot/modules.local",
        "boot",
        "usr/local",
        "construction",
        "ccache",
        "distfiles",
        "packages",
        "options",
        "xports",
        "usr/share",
        "usr/sbin",
        "usr/libexec",
        "usr/libdata",
        "usr/lib",
        "usr/include",
        "usr/bin",
        "libexec",
        "lib",
        "sbin",
        "bin",
        "",
    ]
}

/// The seam between the sandbox lifecycle and the host kernel.
///
/// The real implementation shells out to the mount helpers and calls the
/// unmount syscall; tests substitute a recording or fault-injecting mock.
pub trait Mounter: Send + Sync {
    fn mount(&self, basedir: &Path, mount: &ResolvedMount) -> io::Result<()>;
    fn unmount(&self, target: &Path) -> io::Result<()>;
}

/// Invokes the system mount helpers.
#[derive(Clone, Debug)]
pub struct ShellMounter {
    pub tmpfs_bin: PathBuf,
    pub nullfs_bin: PathBuf,
    pub devfs_bin: PathBuf,
    pub procfs_bin: PathBuf,
}

impl Default for ShellMounter {
    fn default() -> Self {
        Self {
            tmpfs_bin: PathBuf::from(MOUNT_TMPFS_BINARY),
            nullfs_bin: PathBuf::from(MOUNT_NULLFS_BINARY),
            devfs_bin: PathBuf::from(MOUNT_DEVFS_BINARY),
            procfs_bin: PathBuf::from(MOUNT_PROCFS_BINARY),
        }
    }
}

impl Mounter for ShellMounter {
    fn mount(&self, basedir: &Path, mount: &ResolvedMount) -> io::Result<()> {
        let target = basedir.join(mount.target);
        let prog = match mount.kind {
            MountKind::TmpfsSmall | MountKind::TmpfsBig => &self.tmpfs_bin,
            MountKind::Nullfs => &self.nullfs_bin,
            MountKind::Devfs => &self.devfs_bin,
            MountKind::Procfs => &self.procfs_bin,
        };
        let mut cmd = Command::new(prog);
        match mount.kind {
            MountKind::TmpfsSmall => {
                cmd.args(["-s", TMPFS_SMALL_SIZE]);
            }
            MountKind::TmpfsBig => {
                cmd.args(["-s", TMPFS_BIG_SIZE]);
            }
            _ => {}
        }
        cmd.args(["-o", if mount.rw { "rw" } else { "ro" }]);
        // The tmpfs/devfs/procfs helpers still expect a source operand.
        match &mount.source {
            Some(src) => cmd.arg(src),
            None => cmd.arg("dummy"),
        };
        cmd.arg(&target);

        let status = cmd.status()?;
        if !status.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{} exited with {status}", prog.display()),
            ));
        }
        Ok(())
    }

    fn unmount(&self, target: &Path) -> io::Result<()> {
        let path = CString::new(target.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in mount path"))?;
        if sys_unmount(&path) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn sys_unmount(path: &CString) -> libc::c_int {
            // SAFETY: `path` is a valid NUL-terminated string.
            unsafe { libc::umount(path.as_ptr()) }
        }
    } else {
        fn sys_unmount(path: &CString) -> libc::c_int {
            // SAFETY: `path` is a valid NUL-terminated string.
            unsafe { libc::unmount(path.as_ptr(), 0) }
        }
    }
}

/// What provisioning left behind.
#[derive(Debug, Default)]
pub struct ProvisionOutcome {
    /// Mounts that failed; any nonzero count poisons the slot.
    pub mount_errors: usize,
    /// Template materialisation failure, if any.
    pub copy_error: Option<String>,
}

impl ProvisionOutcome {
    pub fn ok(&self) -> bool {
        self.mount_errors == 0 && self.copy_error.is_none()
    }
}

/// Installs the full sandbox topology for one slot and seeds the tmpfs root
/// with the template content.
///
/// Mount failures are counted rather than aborting mid-sequence so teardown
/// always starts from a known plan position.
pub fn mount_worker(
    config: &Config,
    mounter: &dyn Mounter,
    slot: usize,
    basedir: &Path,
) -> ProvisionOutcome {
    let mut outcome = ProvisionOutcome::default();
    for step in mount_plan(config, slot) {
        match step {
            PlanStep::Mkdir(rel) => {
                let dir = basedir.join(rel);
                if let Err(err) = std::fs::create_dir_all(&dir) {
                    error!("mkdir {} failed: {err}", dir.display());
                    outcome.mount_errors += 1;
                }
            }
            PlanStep::Mount(mount) => {
                let target = basedir.join(mount.target);
                if let Err(err) = std::fs::create_dir_all(&target) {
                    error!("mkdir {} failed: {err}", target.display());
                    outcome.mount_errors += 1;
                    continue;
                }
                if let Err(err) = mounter.mount(basedir, &mount) {
                    error!(
                        "slot {slot}: mounting {} failed: {err}",
                        if mount.target.is_empty() { "/" } else { mount.target }
                    );
                    outcome.mount_errors += 1;
                }
            }
        }
    }

    // Seed /etc, /root, /tmp and the other writable bits the toolchain
    // expects. Content-only so "Template" itself does not nest under the
    // root.
    let template = config.template_dir();
    let mut opts = fs_extra::dir::CopyOptions::new();
    opts.content_only = true;
    opts.overwrite = true;
    if let Err(err) = fs_extra::dir::copy(&template, basedir, &opts) {
        error!("slot {slot}: template copy failed: {err}");
        outcome.copy_error = Some(err.to_string());
    }
    outcome
}

/// Tears down a slot's mounts in LIFO order.
///
/// Errors other than "already gone" are counted and the whole sequence is
/// retried after a pause: the kernel may still hold references from a build
/// child that has not finished exiting. Returns the residual error count
/// (zero on success).
pub fn unmount_worker(config: &Config, mounter: &dyn Mounter, basedir: &Path) -> usize {
    let mut mount_error = 0;
    for round in 0..config.unmount_retries {
        mount_error = 0;
        for rel in unmount_targets() {
            let target = basedir.join(rel);
            if let Err(err) = mounter.unmount(&target) {
                if unmount_error_is_benign(&err) {
                    continue;
                }
                debug!("cannot unmount {} ({err})", target.display());
                mount_error += 1;
            }
        }
        if mount_error == 0 {
            break;
        }
        trace!(round, mount_error, "unmount round incomplete, pausing");
        thread::sleep(config.unmount_pause);
    }
    mount_error
}

/// ENOENT and EINVAL mean the mount is already gone; both are expected on
/// targets that were never mounted in this configuration.
fn unmount_error_is_benign(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::ENOENT) | Some(libc::EINVAL))
        || matches!(err.kind(), io::ErrorKind::NotFound | io::ErrorKind::InvalidInput)
}
