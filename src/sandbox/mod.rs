//! Per-worker sandbox lifecycle: the mount plan, the template the sandboxes
//! are seeded from, and the provision/teardown machinery.

pub mod mount;
pub mod template;

pub use mount::{
    mount_plan, mount_worker, unmount_targets, unmount_worker, MountKind, Mounter, PlanStep,
    ProvisionOutcome, ResolvedMount, ShellMounter,
};
pub use template::TemplateManager;
