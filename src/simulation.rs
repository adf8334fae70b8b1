//! Driver on a simulated highway, built from configuration.

use crate::config::AppConfig;
use camac_core::{CamacDriver, ControlBlock, LamAddressing, ReportLevel};
use camac_driver_mock::{LamSource, MockHighway};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Wait used by [`exercise`] for each raised LAM.
const LAM_WAIT_MS: i64 = 1000;

/// Build the simulated highway described by `config`.
pub fn build_highway(config: &AppConfig) -> MockHighway {
    let sim = &config.simulation;
    let mut builder = MockHighway::builder()
        .name(sim.driver_name.clone())
        .topology(sim.topology)
        .placements(&sim.modules);
    if sim.modules.is_empty() {
        builder = builder.branch(0);
    }
    builder.build()
}

/// Start a driver on the simulated highway: initialize the library, bring up
/// every crate that holds a module and register each module as a card.
pub fn start(config: &AppConfig) -> anyhow::Result<CamacDriver<MockHighway>> {
    let driver = CamacDriver::new(build_highway(config), config.camac.clone());
    driver.library_init()?;

    let crates: BTreeSet<(u8, u8)> = config
        .simulation
        .modules
        .iter()
        .map(|m| (m.branch, m.crate_num))
        .collect();
    for (branch, crate_num) in crates {
        if let Err(err) = driver.crate_init(u32::from(branch), u32::from(crate_num)) {
            warn!(branch, crate_num, error = %err, "Crate init failed");
        }
    }

    for placement in &config.simulation.modules {
        driver.register_card(
            u32::from(placement.branch),
            u32::from(placement.crate_num),
            u32::from(placement.slot),
            &placement.module.name,
            None,
        )?;
    }
    info!(
        modules = config.simulation.modules.len(),
        branches = driver.branches().count(),
        "Simulated highway ready"
    );
    Ok(driver)
}

/// Outcome of [`exercise`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExerciseSummary {
    /// Bus operations issued
    pub actions: usize,
    /// Bus operations that failed
    pub failures: usize,
    /// LAM waits that returned because the LAM fired
    pub lams_seen: usize,
}

/// Run `cycles` passes over every configured module: read A0 with a single
/// action and every register with an address scan, then raise a LAM on A0
/// and wait for it.
pub fn exercise(
    driver: &CamacDriver<MockHighway>,
    config: &AppConfig,
    cycles: usize,
) -> anyhow::Result<ExerciseSummary> {
    let mut summary = ExerciseSummary::default();
    for cycle in 0..cycles {
        for placement in &config.simulation.modules {
            let (b, c, n) = (
                u32::from(placement.branch),
                u32::from(placement.crate_num),
                u32::from(placement.slot),
            );
            let start = driver.encode(b, c, n, 0)?;
            let end = driver.encode(b, c, n, 15)?;

            let mut word: u32 = 0;
            summary.actions += 1;
            if let Err(err) = driver.single_action(0, start, &mut word) {
                summary.failures += 1;
                debug!(cycle, card = %placement.module.name, error = %err, "Read failed");
            }

            let mut data = [0u32; 16];
            let mut cb = ControlBlock::new(data.len());
            summary.actions += 1;
            if let Err(err) = driver.address_scan(0, start, end, &mut data, &mut cb) {
                summary.failures += 1;
                debug!(cycle, card = %placement.module.name, error = %err, "Register scan failed");
            }

            let lam = driver.declare_lam(b, c, n, LamAddressing::Subaddress(0))?;
            driver.enable_lam(&lam, true)?;
            let waiter = {
                let driver = driver.clone();
                let lam = lam.clone();
                std::thread::spawn(move || driver.wait_lam(Some(&lam), LAM_WAIT_MS))
            };
            while lam.waiting() == 0 && !waiter.is_finished() {
                std::thread::yield_now();
            }
            driver.backend().raise_lam(
                placement.branch,
                placement.crate_num,
                placement.slot,
                LamSource::Subaddress(0),
            );
            match waiter.join() {
                Ok(Ok(())) => summary.lams_seen += 1,
                Ok(Err(err)) => debug!(cycle, card = %placement.module.name, error = %err, "LAM wait failed"),
                Err(_) => anyhow::bail!("LAM waiter thread panicked"),
            }
        }
    }
    Ok(summary)
}

/// Slot-level report of the driver.
pub fn report(driver: &CamacDriver<MockHighway>, level: ReportLevel) -> String {
    driver.io_report(level)
}
