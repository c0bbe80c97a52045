//! End-to-end campaign scenarios over real scheduler/worker/supervisor
//! machinery with mock mount and build backends.

use dsynth::{
    catalog::{Catalog, PortRecord},
    config::Config,
    port::Origin,
    sandbox::{Mounter, ResolvedMount},
    scheduler::Scheduler,
    stores::Stores,
    supervisor::Supervisor,
    worker::{BuildJob, BuildRunner, BuildStatus, ExitReason, SlotMonitor, Worker},
};
use pretty_assertions::assert_eq;
use std::{
    collections::HashMap,
    io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

fn origin(s: &str) -> Origin {
    Origin::parse(s).unwrap()
}

fn record(origin_s: &str, deps: &[&str]) -> PortRecord {
    PortRecord {
        origin: origin(origin_s),
        version: "1.0".to_string(),
        options: vec![],
        extract_deps: vec![],
        build_deps: deps.iter().map(|d| origin(d)).collect(),
        run_deps: vec![],
        build_cost: None,
        ignore: None,
    }
}

/// A scratch build base with a fake system image and template script.
struct TestBase {
    dir: tempfile::TempDir,
}

impl TestBase {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        for sub in ["bin", "lib", "libexec", "usr/bin"] {
            std::fs::create_dir_all(dir.path().join("world").join(sub)).unwrap();
            std::fs::write(dir.path().join("world").join(sub).join("tool"), b"bin\n").unwrap();
        }
        let script = dir.path().join("mktemplate");
        std::fs::write(
            &script,
            "#!/bin/sh\nmkdir -p \"$2/etc\"\necho cookie > \"$2/etc/cookie\"\necho run >> \"$(dirname \"$0\")/template-runs\"\n",
        )
        .unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();
        Self { dir }
    }

    fn config(&self, workers: usize) -> Arc<Config> {
        Arc::new(
            Config::builder()
                .build_base(self.dir.path().join("bb"))
                .system_path(self.dir.path().join("world"))
                .template_script(self.dir.path().join("mktemplate"))
                .max_workers(workers)
                .unmount_pause(Duration::from_millis(1))
                .build_timeout(Duration::from_secs(30))
                .cancel_grace(Duration::from_millis(200))
                .build()
                .unwrap(),
        )
    }

    fn template_runs(&self) -> usize {
        std::fs::read_to_string(self.dir.path().join("template-runs"))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }
}

/// Mounter that always succeeds, counting every helper invocation.
#[derive(Default)]
struct NullMounter {
    mounts: AtomicUsize,
    unmounts: AtomicUsize,
}

impl Mounter for NullMounter {
    fn mount(&self, _basedir: &Path, _mount: &ResolvedMount) -> io::Result<()> {
        self.mounts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unmount(&self, _target: &Path) -> io::Result<()> {
        self.unmounts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Mounter that reports EBUSY a fixed number of times for one unmount target.
struct FlakyUnmounter {
    suffix: String,
    failures: AtomicUsize,
}

impl Mounter for FlakyUnmounter {
    fn mount(&self, _basedir: &Path, _mount: &ResolvedMount) -> io::Result<()> {
        Ok(())
    }

    fn unmount(&self, target: &Path) -> io::Result<()> {
        if target.to_string_lossy().ends_with(&self.suffix)
            && self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        Ok(())
    }
}

/// Mounter that refuses the very first mount attempt, poisoning whichever
/// slot makes it.
#[derive(Default)]
struct FirstMountFailMounter {
    tripped: std::sync::atomic::AtomicBool,
}

impl Mounter for FirstMountFailMounter {
    fn mount(&self, _basedir: &Path, _mount: &ResolvedMount) -> io::Result<()> {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "mount refused"));
        }
        Ok(())
    }

    fn unmount(&self, _target: &Path) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Script {
    Succeed,
    Fail,
    /// Park until the cancel flag fires (or a safety deadline passes).
    Hang,
}

/// Build runner with scripted per-origin outcomes. Successful builds write
/// the real package file, exactly like a recipe publishing through the
/// `/packages` mount.
struct ScriptedRunner {
    packages: PathBuf,
    scripts: HashMap<String, Script>,
    order: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    fn new(packages: impl Into<PathBuf>) -> Self {
        Self { packages: packages.into(), scripts: HashMap::new(), order: Mutex::new(Vec::new()) }
    }

    fn with(mut self, origin_s: &str, script: Script) -> Self {
        self.scripts.insert(origin_s.to_string(), script);
        self
    }

    fn order(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }
}

impl BuildRunner for ScriptedRunner {
    fn run(&self, job: BuildJob<'_>) -> dsynth::error::Result<BuildStatus> {
        let origin_s = job.port.origin.to_string();
        self.order.lock().unwrap().push(origin_s.clone());
        match self.scripts.get(&origin_s).copied().unwrap_or(Script::Succeed) {
            Script::Succeed => {
                let all = self.packages.join("All");
                std::fs::create_dir_all(&all).unwrap();
                std::fs::write(all.join(job.port.pkgfile()), b"pkg\n").unwrap();
                Ok(BuildStatus::Success)
            }
            Script::Fail => Ok(BuildStatus::Failure(ExitReason::Exit(1))),
            Script::Hang => {
                let deadline = Instant::now() + Duration::from_secs(10);
                while Instant::now() < deadline {
                    if job.cancel.load(Ordering::SeqCst) {
                        return Ok(BuildStatus::Failure(ExitReason::Cancelled));
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                Ok(BuildStatus::Failure(ExitReason::Timeout))
            }
        }
    }
}

fn state_of(summary: &dsynth::CampaignSummary, origin_s: &str) -> String {
    summary
        .ports
        .iter()
        .find(|p| p.origin == origin_s)
        .unwrap_or_else(|| panic!("{origin_s} missing from summary"))
        .state
        .clone()
}

#[test]
fn linear_chain_builds_every_port_in_order() {
    let base = TestBase::new();
    let config = base.config(1);
    let catalog =
        Catalog::new(vec![record("a/a", &[]), record("b/b", &["a/a"]), record("c/c", &["b/b"])]);
    let runner = Arc::new(ScriptedRunner::new(&config.packages_path));
    let supervisor =
        Supervisor::with_backends(config.clone(), Arc::new(NullMounter::default()), runner.clone());

    let summary = supervisor.run(&catalog, &[], false).unwrap();
    assert_eq!(runner.order(), vec!["a/a", "b/b", "c/c"]);
    assert_eq!(
        (summary.counts.done, summary.counts.failed, summary.counts.skipped),
        (3, 0, 0)
    );
    assert!(summary.succeeded());
    assert!(config.packages_path.join("All/c-1.0.pkg").is_file());
    // The slot parked back in Idle after its last unmount.
    assert_eq!(supervisor.monitors()[0].snapshot().state, dsynth::WorkerState::Idle);
}

#[test]
fn failure_propagates_to_all_dependents() {
    // a -> b -> d, a -> c
    let base = TestBase::new();
    let config = base.config(2);
    let catalog = Catalog::new(vec![
        record("a/a", &[]),
        record("b/b", &["a/a"]),
        record("c/c", &["a/a"]),
        record("d/d", &["b/b"]),
    ]);
    let runner = Arc::new(ScriptedRunner::new(&config.packages_path).with("a/a", Script::Fail));
    let supervisor =
        Supervisor::with_backends(config, Arc::new(NullMounter::default()), runner.clone());

    let summary = supervisor.run(&catalog, &[], false).unwrap();
    assert_eq!(runner.order(), vec!["a/a"]);
    assert_eq!(state_of(&summary, "a/a"), "failed");
    for skipped in ["b/b", "c/c", "d/d"] {
        assert_eq!(state_of(&summary, skipped), "skipped", "{skipped}");
    }
    assert!(!summary.succeeded());
}

#[test]
fn diamond_waits_for_both_edges() {
    let base = TestBase::new();
    let config = base.config(2);
    let catalog = Catalog::new(vec![
        record("a/a", &[]),
        record("b/b", &["a/a"]),
        record("c/c", &["a/a"]),
        record("d/d", &["b/b", "c/c"]),
    ]);
    let runner = Arc::new(ScriptedRunner::new(&config.packages_path));
    let supervisor =
        Supervisor::with_backends(config, Arc::new(NullMounter::default()), runner.clone());

    let summary = supervisor.run(&catalog, &[], false).unwrap();
    assert_eq!(summary.counts.done, 4);
    assert!(summary.succeeded());

    let order = runner.order();
    assert_eq!(order[0], "a/a");
    assert_eq!(order[3], "d/d");
}

#[test]
fn fan_out_decides_dispatch_order() {
    let base = TestBase::new();
    let config = base.config(1);
    let mut records = vec![record("x/x", &[]), record("y/y", &[])];
    for i in 1..=5 {
        records.push(record(&format!("d{i}/d{i}"), &["x/x"]));
    }
    let catalog = Catalog::new(records);
    let runner = Arc::new(ScriptedRunner::new(&config.packages_path));
    let supervisor =
        Supervisor::with_backends(config, Arc::new(NullMounter::default()), runner.clone());

    supervisor.run(&catalog, &[], false).unwrap();
    assert_eq!(runner.order()[0], "x/x");
}

#[test]
fn template_is_reused_across_runs() {
    let base = TestBase::new();
    let catalog = Catalog::new(vec![record("a/a", &[])]);

    // Run 1 builds the template and the package.
    {
        let config = base.config(1);
        let runner = Arc::new(ScriptedRunner::new(&config.packages_path));
        let supervisor =
            Supervisor::with_backends(config.clone(), Arc::new(NullMounter::default()), runner);
        let summary = supervisor.run(&catalog, &[], false).unwrap();
        assert!(summary.succeeded());
        assert!(config.sentinel_path().is_file());
        assert_eq!(base.template_runs(), 1);
    }

    // Run 2: the package satisfies the port; no template work, no mounts.
    {
        let config = base.config(1);
        let mounter = Arc::new(NullMounter::default());
        let runner = Arc::new(ScriptedRunner::new(&config.packages_path));
        let supervisor = Supervisor::with_backends(config, mounter.clone(), runner.clone());
        let summary = supervisor.run(&catalog, &[], false).unwrap();
        assert!(summary.succeeded());
        assert_eq!(summary.counts.prebuilt, 1);
        assert_eq!(base.template_runs(), 1);
        assert_eq!(mounter.mounts.load(Ordering::SeqCst), 0);
        assert!(runner.order().is_empty());
    }

    // Run 3 has new work but still reuses the good template.
    {
        let config = base.config(1);
        let catalog =
            Catalog::new(vec![record("a/a", &[]), record("b/b", &["a/a"])]);
        let runner = Arc::new(ScriptedRunner::new(&config.packages_path));
        let supervisor =
            Supervisor::with_backends(config, Arc::new(NullMounter::default()), runner.clone());
        let summary = supervisor.run(&catalog, &[], false).unwrap();
        assert!(summary.succeeded());
        assert_eq!(runner.order(), vec!["b/b"]);
        assert_eq!(base.template_runs(), 1);
    }
}

#[test]
fn forced_template_rebuild_runs_the_script_again() {
    let base = TestBase::new();
    let catalog = Catalog::new(vec![record("a/a", &[]), record("b/b", &[])]);

    let config = base.config(1);
    let runner = Arc::new(ScriptedRunner::new(&config.packages_path));
    let supervisor =
        Supervisor::with_backends(config.clone(), Arc::new(NullMounter::default()), runner);
    supervisor.run(&catalog, &[origin("a/a")], false).unwrap();
    assert_eq!(base.template_runs(), 1);

    let runner = Arc::new(ScriptedRunner::new(&config.packages_path));
    let supervisor =
        Supervisor::with_backends(config, Arc::new(NullMounter::default()), runner);
    supervisor.run(&catalog, &[origin("b/b")], true).unwrap();
    assert_eq!(base.template_runs(), 2);
}

#[test]
fn transient_unmount_ebusy_recovers_within_retries() {
    let base = TestBase::new();
    let config = base.config(1);
    let catalog = Catalog::new(vec![record("a/a", &[])]);
    let mounter =
        Arc::new(FlakyUnmounter { suffix: "dev".to_string(), failures: AtomicUsize::new(1) });
    let runner = Arc::new(ScriptedRunner::new(&config.packages_path));
    let supervisor = Supervisor::with_backends(config, mounter, runner);

    let summary = supervisor.run(&catalog, &[], false).unwrap();
    assert!(summary.succeeded());
    // The retry absorbed the EBUSY; nothing sticks to the slot.
    assert_eq!(summary.slots.len(), 1);
    assert!(!summary.slots[0].failed);
    assert_eq!(summary.slots[0].mount_error, 0);
}

#[test]
fn failed_slot_degrades_to_remaining_workers() {
    let base = TestBase::new();
    let config = base.config(2);
    let catalog = Catalog::new(vec![record("a/a", &[])]);
    let mounter = Arc::new(FirstMountFailMounter::default());
    let runner = Arc::new(ScriptedRunner::new(&config.packages_path));
    let supervisor = Supervisor::with_backends(config, mounter, runner.clone());

    let summary = supervisor.run(&catalog, &[], false).unwrap();
    assert!(summary.succeeded(), "{summary:?}");
    assert_eq!(state_of(&summary, "a/a"), "done");

    let failed: Vec<bool> = summary.slots.iter().map(|s| s.failed).collect();
    assert!(failed.contains(&true));
    assert!(failed.contains(&false));

    let failed_monitors = supervisor
        .monitors()
        .iter()
        .filter(|m| m.snapshot().state == dsynth::WorkerState::Failed)
        .count();
    assert_eq!(failed_monitors, 1);
}

#[test]
fn shutdown_interrupts_running_builds_and_keeps_packages() {
    let base = TestBase::new();
    let config = base.config(2);
    let catalog = Catalog::new(vec![
        record("slow/one", &[]),
        record("slow/two", &[]),
        record("later/later", &["slow/one", "slow/two"]),
    ]);
    // Workers are driven directly here, so seed the template by hand.
    std::fs::create_dir_all(config.template_dir().join("etc")).unwrap();
    std::fs::write(config.template_dir().join("etc/rc.conf"), b"# seeded\n").unwrap();

    let stores = Stores::from_config(&config).unwrap();
    let graph = dsynth::Graph::resolve(&catalog).unwrap();
    let scheduler =
        Arc::new(Scheduler::init(graph, &[], &stores.packages, true).unwrap());
    let mounter: Arc<dyn Mounter> = Arc::new(NullMounter::default());
    let runner = Arc::new(
        ScriptedRunner::new(&config.packages_path)
            .with("slow/one", Script::Hang)
            .with("slow/two", Script::Hang),
    );

    let mut handles = Vec::new();
    for index in 0..2 {
        let worker = Worker::new(
            index,
            config.clone(),
            scheduler.clone(),
            stores.clone(),
            mounter.clone(),
            runner.clone(),
            Arc::new(SlotMonitor::new(index)),
        );
        handles.push(std::thread::spawn(move || worker.run()));
    }

    // Let both workers reach Building, then pull the plug.
    let deadline = Instant::now() + Duration::from_secs(5);
    while runner.order().len() < 2 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(runner.order().len(), 2);
    scheduler.request_shutdown();

    for handle in handles {
        let exit = handle.join().unwrap();
        assert!(!exit.failed);
    }

    // Both running ports reached a terminal state; the third was never
    // dispatched.
    for slow in ["slow/one", "slow/two"] {
        let state = scheduler.port_state(&origin(slow)).unwrap();
        assert!(state.is_terminal(), "{slow} ended {state}");
    }
    assert_eq!(runner.order().len(), 2);
}

#[test]
fn empty_catalog_succeeds_without_any_work() {
    let base = TestBase::new();
    let config = base.config(2);
    let mounter = Arc::new(NullMounter::default());
    let runner = Arc::new(ScriptedRunner::new(&config.packages_path));
    let supervisor = Supervisor::with_backends(config, mounter.clone(), runner);

    let summary = supervisor.run(&Catalog::new(vec![]), &[], false).unwrap();
    assert!(summary.succeeded());
    assert_eq!(summary.counts.selected, 0);
    assert_eq!(base.template_runs(), 0);
    assert_eq!(mounter.mounts.load(Ordering::SeqCst), 0);
}

#[test]
fn single_port_campaign_builds_exactly_one_package() {
    let base = TestBase::new();
    let config = base.config(2);
    let catalog = Catalog::new(vec![record("only/one", &[])]);
    let runner = Arc::new(ScriptedRunner::new(&config.packages_path));
    let supervisor =
        Supervisor::with_backends(config.clone(), Arc::new(NullMounter::default()), runner);

    let summary = supervisor.run(&catalog, &[], false).unwrap();
    assert_eq!((summary.counts.done, summary.counts.skipped), (1, 0));
    assert!(summary.succeeded());
    assert!(config.packages_path.join("All/one-1.0.pkg").is_file());
}

#[test]
fn summary_is_persisted_as_json() {
    let base = TestBase::new();
    let config = base.config(1);
    let catalog = Catalog::new(vec![record("a/a", &[])]);
    let runner = Arc::new(ScriptedRunner::new(&config.packages_path));
    let supervisor =
        Supervisor::with_backends(config.clone(), Arc::new(NullMounter::default()), runner);

    supervisor.run(&catalog, &[], false).unwrap();
    let raw = std::fs::read_to_string(config.logs_path.join("summary.json")).unwrap();
    let parsed: dsynth::CampaignSummary = serde_json::from_str(&raw).unwrap();
    assert_eq!(parsed.counts.done, 1);
}

#[test]
fn build_logs_are_written_per_port() {
    let base = TestBase::new();
    let config = base.config(1);
    let catalog = Catalog::new(vec![record("www/nginx", &[])]);
    let runner = Arc::new(ScriptedRunner::new(&config.packages_path));
    let supervisor =
        Supervisor::with_backends(config.clone(), Arc::new(NullMounter::default()), runner);

    supervisor.run(&catalog, &[], false).unwrap();
    let log = std::fs::read_to_string(config.logs_path.join("www___nginx.log")).unwrap();
    assert!(log.contains("www/nginx"));
}

#[test]
fn cleanup_removes_slot_directories() {
    let base = TestBase::new();
    let config = base.config(1);
    let catalog = Catalog::new(vec![record("a/a", &[])]);
    let runner = Arc::new(ScriptedRunner::new(&config.packages_path));
    let supervisor =
        Supervisor::with_backends(config.clone(), Arc::new(NullMounter::default()), runner);
    supervisor.run(&catalog, &[], false).unwrap();
    assert!(config.slot_dir(0).exists());

    supervisor.cleanup(true).unwrap();
    assert!(!config.slot_dir(0).exists());
    assert!(!config.template_dir().exists());
    assert!(!config.discrete_dir("bin", 0).exists());
}

#[test]
fn requested_list_restricts_the_build() {
    let base = TestBase::new();
    let config = base.config(1);
    let catalog = Catalog::new(vec![
        record("a/a", &[]),
        record("b/b", &["a/a"]),
        record("z/z", &[]),
    ]);
    let runner = Arc::new(ScriptedRunner::new(&config.packages_path));
    let supervisor =
        Supervisor::with_backends(config, Arc::new(NullMounter::default()), runner.clone());

    let summary = supervisor.run(&catalog, &[origin("b/b")], false).unwrap();
    assert_eq!(runner.order(), vec!["a/a", "b/b"]);
    assert_eq!(summary.counts.selected, 2);
    assert!(summary.succeeded());
}

#[test]
fn missing_package_after_clean_exit_fails_the_port() {
    struct LyingRunner;
    impl BuildRunner for LyingRunner {
        fn run(&self, _job: BuildJob<'_>) -> dsynth::error::Result<BuildStatus> {
            // Exits 0 without publishing anything.
            Ok(BuildStatus::Success)
        }
    }

    let base = TestBase::new();
    let config = base.config(1);
    let catalog = Catalog::new(vec![record("a/a", &[])]);
    let supervisor =
        Supervisor::with_backends(config, Arc::new(NullMounter::default()), Arc::new(LyingRunner));

    let summary = supervisor.run(&catalog, &[], false).unwrap();
    assert_eq!(state_of(&summary, "a/a"), "failed");
    let reason = summary.ports[0].reason.clone().unwrap();
    assert!(reason.contains("not produced"), "{reason}");
}

#[test]
fn cyclic_catalog_is_rejected_before_any_work() {
    let base = TestBase::new();
    let config = base.config(1);
    let catalog = Catalog::new(vec![record("a/a", &["b/b"]), record("b/b", &["a/a"])]);
    let mounter = Arc::new(NullMounter::default());
    let runner = Arc::new(ScriptedRunner::new(&config.packages_path));
    let supervisor = Supervisor::with_backends(config, mounter.clone(), runner);

    let err = supervisor.run(&catalog, &[], false).unwrap_err();
    assert!(err.to_string().contains("cycle"), "{err}");
    assert_eq!(base.template_runs(), 0);
    assert_eq!(mounter.mounts.load(Ordering::SeqCst), 0);
}
