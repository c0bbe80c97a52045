//! Long-lived worker slots.
//!
//! Each slot owns one sandbox directory for its whole lifetime and loops:
//! pull a port from the scheduler, provision the sandbox, drive the build
//! child, collect the result, tear the sandbox down. The slot suspends in
//! exactly three places: waiting on the scheduler, waiting on the child, and
//! the unmount retry pause.

use crate::{
    config::Config,
    error::{DsynthError, Result},
    port::{Origin, Port},
    sandbox::{mount_worker, unmount_worker, Mounter},
    scheduler::{Assignment, Outcome, Scheduler},
    stores::Stores,
    utils,
};
use std::{
    fmt,
    fs::File,
    io::Write,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

/// How often the child poll loop wakes to check exit/cancel/timeout.
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WorkerState {
    #[default]
    Idle,
    Mounting,
    Building,
    Reaping,
    Unmounting,
    Failed,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Mounting => "mounting",
            Self::Building => "building",
            Self::Reaping => "reaping",
            Self::Unmounting => "unmounting",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why a build child did not produce a usable exit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExitReason {
    Exit(i32),
    Signalled(i32),
    Timeout,
    Cancelled,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exit(code) => write!(f, "exited with status {code}"),
            Self::Signalled(sig) => write!(f, "terminated by signal {sig}"),
            Self::Timeout => f.write_str("timed out"),
            Self::Cancelled => f.write_str("cancelled by shutdown"),
        }
    }
}

/// Exit of one build child.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildStatus {
    Success,
    Failure(ExitReason),
}

/// Everything a [`BuildRunner`] needs for one attempt.
pub struct BuildJob<'a> {
    pub port: &'a Port,
    pub basedir: &'a Path,
    pub log: File,
    pub timeout: Duration,
    pub cancel: &'a AtomicBool,
    pub grace: Duration,
}

/// The seam between the worker state machine and the actual build child.
///
/// The real implementation chroots into the sandbox and runs the recipe;
/// tests script outcomes instead.
pub trait BuildRunner: Send + Sync {
    fn run(&self, job: BuildJob<'_>) -> Result<BuildStatus>;
}

/// Spawns the recipe inside the sandbox via chroot.
#[derive(Clone, Debug)]
pub struct ProcessRunner {
    config: Arc<Config>,
}

impl ProcessRunner {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// The child command: chroot into the sandbox, cd to the scratch area,
    /// exec the recipe. Environment is scrubbed to exactly the variables the
    /// recipe contract names.
    pub fn build_command(&self, port: &Port, basedir: &Path) -> Command {
        let inner = format!(
            "cd /construction && exec {} -C /xports/{} package",
            self.config.make_bin.display(),
            port.origin.path()
        );
        let mut cmd = Command::new(&self.config.chroot_bin);
        cmd.arg(basedir).arg("/bin/sh").arg("-c").arg(inner);
        cmd.env_clear();
        cmd.env("PATH", "/sbin:/bin:/usr/sbin:/usr/bin:/usr/local/sbin:/usr/local/bin");
        cmd.env("TERM", "dumb");
        cmd.env("HOME", "/root");
        cmd.env("USER", "root");
        cmd.env("PORT_ORIGIN", port.origin.to_string());
        cmd.env("PKGNAME", port.pkgname());
        if let Some(flavor) = &port.origin.flavor {
            cmd.env("FLAVOR", flavor);
        }
        if !port.options.is_empty() {
            cmd.env("PORT_OPTIONS", port.options.join(" "));
        }
        cmd
    }
}

impl BuildRunner for ProcessRunner {
    fn run(&self, job: BuildJob<'_>) -> Result<BuildStatus> {
        let build_err = |reason: String| DsynthError::Build {
            origin: job.port.origin.to_string(),
            reason,
        };
        let mut cmd = self.build_command(job.port, job.basedir);
        let out = job.log.try_clone().map_err(|err| build_err(format!("log handle: {err}")))?;
        let err_log = job.log.try_clone().map_err(|err| build_err(format!("log handle: {err}")))?;
        cmd.stdin(Stdio::null()).stdout(out).stderr(err_log);

        // `Command::spawn` uses a spawn primitive that runs no user code
        // between fork and exec, so holding no locks here is enough for
        // fork safety.
        let mut child = cmd.spawn().map_err(|err| {
            build_err(format!("cannot spawn {}: {err}", self.config.chroot_bin.display()))
        })?;
        let status = supervise_child(&mut child, job.timeout, job.cancel, job.grace)
            .map_err(|err| build_err(format!("waiting for child: {err}")))?;
        Ok(status)
    }
}

/// Waits for the child, enforcing the wall-clock timeout and the cancel
/// flag. A signalled child gets SIGTERM, a bounded grace period, then
/// SIGKILL, and is always reaped before return.
pub fn supervise_child(
    child: &mut Child,
    timeout: Duration,
    cancel: &AtomicBool,
    grace: Duration,
) -> std::io::Result<BuildStatus> {
    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            if status.success() {
                return Ok(BuildStatus::Success);
            }
            let reason = match status.code() {
                Some(code) => ExitReason::Exit(code),
                None => {
                    use std::os::unix::process::ExitStatusExt;
                    ExitReason::Signalled(status.signal().unwrap_or(0))
                }
            };
            return Ok(BuildStatus::Failure(reason));
        }
        if cancel.load(Ordering::SeqCst) {
            terminate_child(child, grace)?;
            return Ok(BuildStatus::Failure(ExitReason::Cancelled));
        }
        if started.elapsed() >= timeout {
            terminate_child(child, grace)?;
            return Ok(BuildStatus::Failure(ExitReason::Timeout));
        }
        std::thread::sleep(CHILD_POLL_INTERVAL);
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL; reaps the child either way.
fn terminate_child(child: &mut Child, grace: Duration) -> std::io::Result<()> {
    // SAFETY: the pid is a live child of this process.
    unsafe { libc::kill(child.id() as libc::pid_t, libc::SIGTERM) };
    let deadline = Instant::now() + grace;
    loop {
        if child.try_wait()?.is_some() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            child.kill()?;
            child.wait()?;
            return Ok(());
        }
        std::thread::sleep(CHILD_POLL_INTERVAL.min(grace));
    }
}

/// Live view of one slot for the status surface.
#[derive(Debug)]
pub struct SlotMonitor {
    pub index: usize,
    inner: Mutex<SlotSnapshot>,
}

#[derive(Clone, Debug, Default)]
pub struct SlotSnapshot {
    pub state: WorkerState,
    pub origin: Option<Origin>,
    pub status: String,
}

impl SlotMonitor {
    pub fn new(index: usize) -> Self {
        Self { index, inner: Mutex::new(SlotSnapshot::default()) }
    }

    fn set(&self, state: WorkerState, origin: Option<&Origin>, status: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = state;
        inner.origin = origin.cloned();
        inner.status = status.into();
    }

    pub fn snapshot(&self) -> SlotSnapshot {
        self.inner.lock().unwrap().clone()
    }
}

/// How a worker thread ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerExit {
    pub slot: usize,
    /// The slot became unusable (mount/unmount retries exhausted).
    pub failed: bool,
    pub accum_error: usize,
    pub mount_error: usize,
    pub builds: usize,
}

/// One execution slot and its sandbox.
pub struct Worker {
    index: usize,
    basedir: PathBuf,
    config: Arc<Config>,
    scheduler: Arc<Scheduler>,
    stores: Stores,
    mounter: Arc<dyn Mounter>,
    runner: Arc<dyn BuildRunner>,
    monitor: Arc<SlotMonitor>,
    accum_error: usize,
    mount_error: usize,
    builds: usize,
    /// Stand-in cancel flag when running builds ride out a shutdown.
    no_cancel: AtomicBool,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: usize,
        config: Arc<Config>,
        scheduler: Arc<Scheduler>,
        stores: Stores,
        mounter: Arc<dyn Mounter>,
        runner: Arc<dyn BuildRunner>,
        monitor: Arc<SlotMonitor>,
    ) -> Self {
        let basedir = config.slot_dir(index);
        Self {
            index,
            basedir,
            config,
            scheduler,
            stores,
            mounter,
            runner,
            monitor,
            accum_error: 0,
            mount_error: 0,
            builds: 0,
            no_cancel: AtomicBool::new(false),
        }
    }

    /// The slot main loop; runs until the scheduler drains, shutdown is
    /// requested, or the slot fails.
    pub fn run(mut self) -> WorkerExit {
        loop {
            self.monitor.set(WorkerState::Idle, None, "idle");
            let Some(assignment) = self.scheduler.acquire(self.index) else {
                break;
            };
            if !self.build_one(assignment) {
                self.monitor.set(WorkerState::Failed, None, "slot failed");
                return self.exit(true);
            }
        }
        self.exit(false)
    }

    fn exit(&self, failed: bool) -> WorkerExit {
        WorkerExit {
            slot: self.index,
            failed,
            accum_error: self.accum_error,
            mount_error: self.mount_error,
            builds: self.builds,
        }
    }

    /// Drives one assignment through the slot state machine. Returns false
    /// when the slot can no longer be used.
    fn build_one(&mut self, assignment: Assignment) -> bool {
        let Assignment { node, port } = assignment;
        let origin = port.origin.clone();

        self.monitor.set(WorkerState::Mounting, Some(&origin), "mounting sandbox");
        if let Err(err) = utils::mkdirs(&self.basedir) {
            error!("slot {}: {err}", self.index);
            self.scheduler.release(node);
            self.accum_error += 1;
            return false;
        }
        let provision = mount_worker(&self.config, self.mounter.as_ref(), self.index, &self.basedir);
        if !provision.ok() {
            // The build never started; hand the port back and retire the
            // slot after cleaning up whatever did get mounted.
            self.mount_error += provision.mount_errors;
            self.accum_error += 1;
            self.scheduler.release(node);
            self.monitor.set(WorkerState::Unmounting, Some(&origin), "cleanup after mount failure");
            unmount_worker(&self.config, self.mounter.as_ref(), &self.basedir);
            return false;
        }

        self.monitor.set(WorkerState::Building, Some(&origin), port.pkgname());
        let outcome = match self.run_build(&port) {
            Ok(outcome) => outcome,
            Err(err) => Outcome::Failed(err.to_string()),
        };
        self.builds += 1;

        self.monitor.set(WorkerState::Reaping, Some(&origin), "collecting result");
        self.scheduler.complete(node, outcome);

        self.monitor.set(WorkerState::Unmounting, Some(&origin), "unmounting sandbox");
        let residual = unmount_worker(&self.config, self.mounter.as_ref(), &self.basedir);
        if residual > 0 {
            self.mount_error += residual;
            self.accum_error += 1;
            error!("slot {}: unable to unmount sandbox", self.index);
            return false;
        }
        true
    }

    fn run_build(&self, port: &Port) -> Result<Outcome> {
        let mut log = self.stores.logs.create_log(&port.origin)?;
        let _ = writeln!(log, "---- {} ({}) slot {}", port.origin, port.pkgname(), self.index);

        let cancel: &AtomicBool = if self.config.finish_running {
            &self.no_cancel
        } else {
            self.scheduler.shutdown_flag()
        };
        let job = BuildJob {
            port,
            basedir: &self.basedir,
            log,
            timeout: self.config.build_timeout,
            cancel,
            grace: self.config.cancel_grace,
        };
        let status = self.runner.run(job)?;

        Ok(match status {
            BuildStatus::Success => {
                if self.stores.packages.contains(port) {
                    Outcome::Done
                } else {
                    Outcome::Failed(format!(
                        "recipe exited 0 but {} was not produced",
                        port.pkgfile()
                    ))
                }
            }
            BuildStatus::Failure(reason) => Outcome::Failed(reason.to_string()),
        })
    }
}
