//! Error recording, the periodic rate monitor and the I/O report.

use super::{CamacDriver, DriverInner};
use crate::address::{Bcna, MAX_NORMAL_SLOT};
use crate::backend::HardwareBackend;
use crate::error::CamacError;
use crate::registry::{Branch, CrateNode, SlotNode};
use crate::stats::ErrorCategory;
use std::fmt::Write as _;
use std::sync::Weak;
use std::time::Duration;
use tracing::debug;

/// Body of the `camac-errmon` thread. Exits once the driver is gone.
pub(super) fn run_monitor<B: HardwareBackend>(driver: Weak<DriverInner<B>>, period: Duration) {
    debug!(period_ms = period.as_millis() as u64, "Error monitor started");
    loop {
        std::thread::sleep(period);
        let Some(inner) = driver.upgrade() else {
            break;
        };
        CamacDriver::from_inner(inner).update_error_rates();
    }
    debug!("Error monitor stopped");
}

/// How much of the tree [`CamacDriver::io_report`] covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReportLevel {
    /// Branch summaries only
    Branches = 0,
    /// Branch and crate summaries
    Crates = 1,
    /// Branch, crate and slot summaries
    Slots = 2,
}

impl From<u8> for ReportLevel {
    fn from(level: u8) -> Self {
        match level {
            0 => Self::Branches,
            1 => Self::Crates,
            _ => Self::Slots,
        }
    }
}

impl<B: HardwareBackend> CamacDriver<B> {
    /// Run one monitor period: fold every counter's current count into its
    /// rate and start a new period. Each branch is locked while it is updated.
    pub fn update_error_rates(&self) {
        for branch in self.branches() {
            branch.decay_errors(self.inner.policy);
        }
    }

    /// Count a failure under its category, if it has one.
    pub(crate) fn record_error(&self, bcna: Bcna, err: CamacError) {
        if let Some(category) = err.category() {
            self.record_category(bcna, category);
        }
    }

    /// Count one error. Crate and slot errors on a crate that was never
    /// created are dropped.
    pub(crate) fn record_category(&self, bcna: Bcna, category: ErrorCategory) {
        let Some(branch) = self.branch(bcna.branch) else {
            return;
        };
        match category {
            ErrorCategory::Branch(kind) => branch.errors.lock().record(kind),
            ErrorCategory::Crate(kind) => {
                if let Some(node) = branch.crate_node(bcna.crate_num) {
                    node.errors.lock().record(kind);
                }
            }
            ErrorCategory::Slot(kind) => {
                if let Some(slot) = branch
                    .crate_node(bcna.crate_num)
                    .and_then(|node| node.slot(bcna.slot))
                {
                    slot.record(kind);
                }
            }
        }
    }

    /// Render the driver report at the given level.
    pub fn io_report(&self, level: ReportLevel) -> String {
        let mut out = format!(
            "\n********** Start CAMAC I/O Report for {} Driver {} **********\n\n",
            self.inner.codec.topology(),
            self.inner.backend.name()
        );
        let crates = level >= ReportLevel::Crates;
        let slots = level >= ReportLevel::Slots;
        let lines = self.render_report(&mut out, None, crates.then_some(None), slots.then_some(None));
        if lines == 0 {
            out.push_str("No CAMAC Hardware Found\n");
        }
        out.push_str("\n**********  End CAMAC I/O Report **********\n\n");
        out
    }

    /// Render the error block of one branch, crate or slot. `None` selects
    /// every node at that level.
    pub fn error_report(&self, branch: Option<u8>, crate_num: Option<u8>, slot: Option<u8>) -> String {
        let mut out = String::new();
        self.render_report(&mut out, branch, Some(crate_num), Some(slot));
        out
    }

    // `crates`/`slots` of `None` skip the level, `Some(None)` covers all of it.
    fn render_report(
        &self,
        out: &mut String,
        branch: Option<u8>,
        crates: Option<Option<u8>>,
        slots: Option<Option<u8>>,
    ) -> usize {
        let mut lines = 0;
        let mut crate_lines_before = 0;
        for node in self.branches().filter(|b| branch.map_or(true, |n| n == b.number())) {
            if crate_lines_before > 0 {
                out.push('\n');
            }
            crate_lines_before = 0;
            lines += branch_block(out, node);

            let Some(crate_filter) = crates else {
                continue;
            };
            let mut slot_lines_before = 0;
            for crate_node in node
                .crates()
                .filter(|c| crate_filter.map_or(true, |n| n == c.number()))
            {
                if slot_lines_before > 0 {
                    out.push('\n');
                }
                slot_lines_before = 0;
                let crate_lines = crate_block(out, crate_node);

                if let Some(slot_filter) = slots {
                    for slot in crate_node.slots().filter(|s| {
                        (1..=MAX_NORMAL_SLOT).contains(&s.number())
                            && slot_filter.map_or(true, |n| n == s.number())
                    }) {
                        slot_lines_before += slot_block(out, crate_node, slot);
                    }
                }
                crate_lines_before += crate_lines + slot_lines_before;
            }
            lines += crate_lines_before;
        }
        lines
    }
}

fn branch_block<B: HardwareBackend>(out: &mut String, branch: &Branch<B>) -> usize {
    let counters = branch.errors.lock().clone();
    let _ = write!(out, "Branch {}", branch.number());
    summary_lines(out, counters.fired_count(), |out| counters.render(out), " -- No Branch Errors")
}

fn crate_block(out: &mut String, node: &CrateNode) -> usize {
    let counters = node.errors.lock().clone();
    let _ = write!(out, "Branch {}, Crate {:2}", node.branch(), node.number());
    summary_lines(out, counters.fired_count(), |out| counters.render(out), " -- No Crate Errors")
}

fn slot_block(out: &mut String, node: &CrateNode, slot: &SlotNode) -> usize {
    if slot.card_name().is_none() && !slot.has_errors() {
        return 0;
    }
    let counters = slot.errors.lock().clone();
    let _ = writeln!(
        out,
        "Branch {}, Crate {:2}, Slot {:2}:  {}",
        node.branch(),
        node.number(),
        slot.number(),
        slot.card_name().unwrap_or("Unknown Card")
    );
    counters.render(out);
    counters.fired_count() + 1
}

// Error lines follow the heading and a blank line closes the block;
// a quiet node gets its heading suffixed instead.
fn summary_lines(out: &mut String, fired: usize, render: impl FnOnce(&mut String), quiet: &str) -> usize {
    if fired > 0 {
        out.push('\n');
        render(out);
        out.push('\n');
    } else {
        out.push_str(quiet);
        out.push('\n');
    }
    fired + 1
}
