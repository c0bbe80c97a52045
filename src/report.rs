//! Campaign results: the machine-readable summary file and the terminal
//! rendering.

use crate::{
    error::Result,
    port::PortState,
    scheduler::{Counts, Scheduler},
    stores::LogStore,
    utils,
    worker::WorkerExit,
};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use yansi::Paint;

/// Summary format version id.
pub const SUMMARY_FORMAT_VERSION: &str = "dsynth-summary-1";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryCounts {
    pub selected: usize,
    pub done: usize,
    pub prebuilt: usize,
    pub failed: usize,
    pub skipped: usize,
    pub ignored: usize,
}

impl From<Counts> for SummaryCounts {
    fn from(c: Counts) -> Self {
        Self {
            selected: c.selected,
            done: c.done,
            prebuilt: c.prebuilt,
            failed: c.failed,
            skipped: c.skipped,
            ignored: c.ignored,
        }
    }
}

/// Final disposition of one port.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortReport {
    pub origin: String,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotReport {
    pub slot: usize,
    pub failed: bool,
    pub accum_error: usize,
    pub mount_error: usize,
    pub builds: usize,
}

/// Everything a campaign leaves behind besides the packages themselves.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignSummary {
    #[serde(rename = "_format")]
    pub format: String,
    pub counts: SummaryCounts,
    pub ports: Vec<PortReport>,
    pub slots: Vec<SlotReport>,
    /// The run was cut short by a signal, a stop-on-failure policy or slot
    /// exhaustion.
    pub interrupted: bool,
    /// SIGINT/SIGTERM was the cause of the interruption.
    #[serde(default)]
    pub signalled: bool,
}

impl CampaignSummary {
    pub fn collect(
        scheduler: &Scheduler,
        logs: &LogStore,
        exits: &[WorkerExit],
        interrupted: bool,
        signalled: bool,
    ) -> Self {
        let ports = scheduler
            .snapshot()
            .into_iter()
            .map(|(origin, state, reason)| PortReport {
                log: matches!(state, PortState::Done | PortState::Failed)
                    .then(|| logs.log_path(&origin).display().to_string()),
                origin: origin.to_string(),
                state: state.to_string(),
                reason,
            })
            .collect();
        let slots = exits
            .iter()
            .map(|e| SlotReport {
                slot: e.slot,
                failed: e.failed,
                accum_error: e.accum_error,
                mount_error: e.mount_error,
                builds: e.builds,
            })
            .collect();
        Self {
            format: SUMMARY_FORMAT_VERSION.to_string(),
            counts: scheduler.counts().into(),
            ports,
            slots,
            interrupted: interrupted || signalled,
            signalled,
        }
    }

    /// Exit-status criterion: every selected port reached Done.
    pub fn succeeded(&self) -> bool {
        !self.interrupted && self.counts.done == self.counts.selected
    }

    pub fn write(&self, logs: &LogStore) -> Result<()> {
        let path = logs.summary_path();
        utils::create_parent_dir_all(&path)?;
        utils::write_json_file(self, &path)
    }

    /// Human-readable rendering for the end of the run.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let c = &self.counts;
        let _ = writeln!(
            out,
            "{} built, {} prebuilt, {} {}, {} {}, {} ignored of {} ports",
            Paint::green(c.done - c.prebuilt),
            c.prebuilt,
            Paint::red(c.failed),
            "failed",
            Paint::yellow(c.skipped),
            "skipped",
            c.ignored,
            c.selected,
        );
        for port in &self.ports {
            if port.state == "done" {
                continue;
            }
            let _ = write!(out, "  {:<9} {}", port.state, port.origin);
            if let Some(reason) = &port.reason {
                let _ = write!(out, " ({reason})");
            }
            let _ = writeln!(out);
        }
        for slot in &self.slots {
            if slot.failed {
                let _ = writeln!(
                    out,
                    "  {} slot {} failed ({} mount errors)",
                    Paint::red("!"),
                    slot.slot,
                    slot.mount_error
                );
            }
        }
        if self.interrupted {
            let _ = writeln!(out, "  {}", Paint::yellow("campaign interrupted"));
        }
        out
    }
}
