//! The top-level campaign loop.
//!
//! Starts N worker threads over one shared scheduler, watches for
//! SIGINT/SIGTERM, waits for the DAG to drain and assembles the summary.

use crate::{
    catalog::Catalog,
    config::Config,
    error::{DsynthError, Result},
    port::Origin,
    report::CampaignSummary,
    resolver::Graph,
    sandbox::{unmount_worker, Mounter, ShellMounter, TemplateManager},
    scheduler::Scheduler,
    stores::Stores,
    utils,
    worker::{BuildRunner, ProcessRunner, SlotMonitor, Worker, WorkerExit},
};
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

pub struct Supervisor {
    config: Arc<Config>,
    mounter: Arc<dyn Mounter>,
    runner: Arc<dyn BuildRunner>,
    monitors: Vec<Arc<SlotMonitor>>,
}

impl Supervisor {
    /// A supervisor wired to the real mount helpers and chroot runner.
    pub fn new(config: Arc<Config>) -> Self {
        let runner = Arc::new(ProcessRunner::new(config.clone()));
        Self::with_backends(config, Arc::new(ShellMounter::default()), runner)
    }

    /// Backend injection point; tests substitute mock mounters and scripted
    /// runners.
    pub fn with_backends(
        config: Arc<Config>,
        mounter: Arc<dyn Mounter>,
        runner: Arc<dyn BuildRunner>,
    ) -> Self {
        let monitors = (0..config.max_workers).map(|i| Arc::new(SlotMonitor::new(i))).collect();
        Self { config, mounter, runner, monitors }
    }

    /// Per-slot live status, for the status surface.
    pub fn monitors(&self) -> &[Arc<SlotMonitor>] {
        &self.monitors
    }

    /// Runs a full build campaign for `requested` (empty = whole catalog).
    ///
    /// Fatal errors (bad DAG, template construction failure) surface as
    /// `Err`; build failures and interrupted runs are reported through the
    /// summary instead.
    pub fn run(
        &self,
        catalog: &Catalog,
        requested: &[Origin],
        force_template: bool,
    ) -> Result<CampaignSummary> {
        let stores = Stores::from_config(&self.config)?;
        let graph = Graph::resolve(catalog)?;
        let scheduler = Arc::new(Scheduler::init(
            graph,
            requested,
            &stores.packages,
            self.config.keep_going,
        )?);

        if scheduler.drained() {
            // Nothing to build; no point touching the template.
            info!("all requested ports already satisfied");
            return self.finish(&scheduler, &stores, Vec::new(), false, false);
        }

        TemplateManager::new(self.config.clone()).ensure(force_template)?;

        let signalled = Arc::new(AtomicBool::new(false));
        let mut signals = Signals::new([SIGINT, SIGTERM])
            .map_err(|err| DsynthError::msg(format!("cannot install signal handler: {err}")))?;
        let signals_handle = signals.handle();
        let signal_thread = {
            let scheduler = scheduler.clone();
            let signalled = signalled.clone();
            thread::spawn(move || {
                for sig in signals.forever() {
                    warn!("received signal {sig}, shutting down");
                    signalled.store(true, Ordering::SeqCst);
                    scheduler.request_shutdown();
                }
            })
        };

        let mut handles = Vec::with_capacity(self.config.max_workers);
        for index in 0..self.config.max_workers {
            let worker = Worker::new(
                index,
                self.config.clone(),
                scheduler.clone(),
                stores.clone(),
                self.mounter.clone(),
                self.runner.clone(),
                self.monitors[index].clone(),
            );
            let handle = thread::Builder::new()
                .name(format!("worker-{index:02}"))
                .spawn(move || worker.run())
                .map_err(|err| DsynthError::msg(format!("cannot spawn worker thread: {err}")))?;
            handles.push(handle);
        }

        let mut exits: Vec<WorkerExit> = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.join() {
                Ok(exit) => exits.push(exit),
                Err(_) => error!("worker thread panicked"),
            }
        }

        signals_handle.close();
        let _ = signal_thread.join();

        let signalled = signalled.load(Ordering::SeqCst);
        let all_slots_failed = !exits.is_empty() && exits.iter().all(|e| e.failed);
        if all_slots_failed && !scheduler.drained() {
            // Leave the summary behind for the postmortem, then abort.
            let slot = exits[0].slot;
            let _ = self.finish(&scheduler, &stores, exits, true, signalled);
            return Err(DsynthError::SlotMount {
                slot,
                msg: "no usable worker slots remain".to_string(),
            });
        }
        let interrupted = !scheduler.drained() && scheduler.shutdown_requested();
        self.finish(&scheduler, &stores, exits, interrupted, signalled)
    }

    fn finish(
        &self,
        scheduler: &Scheduler,
        stores: &Stores,
        exits: Vec<WorkerExit>,
        interrupted: bool,
        signalled: bool,
    ) -> Result<CampaignSummary> {
        let summary =
            CampaignSummary::collect(scheduler, &stores.logs, &exits, interrupted, signalled);
        summary.write(&stores.logs)?;
        Ok(summary)
    }

    /// Tears down any leftover slot mounts and sandbox directories from a
    /// previous run; with `scrub_template` the template and its discrete
    /// copies go too.
    pub fn cleanup(&self, scrub_template: bool) -> Result<()> {
        for index in 0..self.config.max_workers {
            let basedir = self.config.slot_dir(index);
            if !basedir.exists() {
                continue;
            }
            let residual = unmount_worker(&self.config, self.mounter.as_ref(), &basedir);
            if residual > 0 {
                warn!("slot {index}: {residual} mounts still busy, leaving directory");
                continue;
            }
            utils::remove_dir_if_exists(&basedir)?;
        }
        if scrub_template {
            let template = TemplateManager::new(self.config.clone());
            template.destroy();
            template.destroy_discrete_copies();
        }
        Ok(())
    }

    /// Ensures the template exists, rebuilding when forced.
    pub fn prepare_system(&self, force: bool) -> Result<bool> {
        TemplateManager::new(self.config.clone()).ensure(force)
    }
}
