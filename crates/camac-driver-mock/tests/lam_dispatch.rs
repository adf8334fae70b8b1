//! LAM registration, dispatch and waiting against the simulated highway.

use camac_core::{
    CamacConfig, CamacDriver, CamacError, ChannelAddress, ControlBlock, ControllerStatus, FunctionCode,
    LamAddressing, LamEvent, LamHandle, SlotErrorKind, WAIT_FOREVER,
};
use camac_driver_mock::{LamSource, MockHighway, MockModule};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_test::traced_test;

const SETTLE: Duration = Duration::from_secs(5);

fn config() -> CamacConfig {
    CamacConfig {
        branches: Some(vec![0]),
        monitor_period_ms: 3_600_000,
        ..CamacConfig::default()
    }
}

fn started(highway: MockHighway) -> CamacDriver<MockHighway> {
    let driver = CamacDriver::new(highway, config());
    driver.library_init().unwrap();
    driver
}

fn adc_driver() -> CamacDriver<MockHighway> {
    started(
        MockHighway::builder()
            .module(0, 1, 5, MockModule::new("ADC"))
            .build(),
    )
}

/// Poll until `cond` holds or the settle time runs out.
fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + SETTLE;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

fn lam_address(driver: &CamacDriver<MockHighway>) -> ChannelAddress {
    driver.encode(0, 1, 5, 0).unwrap()
}

fn unexpected_lams(driver: &CamacDriver<MockHighway>, slot: u8) -> u64 {
    driver
        .crate_node(0, 1)
        .and_then(|node| node.slot(slot))
        .map_or(0, |s| s.error_counter(SlotErrorKind::UnexpectedLam).total)
}

#[test]
fn test_declare_lam_deduplicates() {
    let driver = adc_driver();
    let first = driver.declare_lam(0, 1, 5, LamAddressing::Subaddress(0)).unwrap();
    let second = driver.declare_lam(0, 1, 5, LamAddressing::Subaddress(0)).unwrap();
    assert_eq!(first, second);
    assert_eq!(driver.crate_node(0, 1).unwrap().lam_count(5), 1);

    let other = driver.declare_lam(0, 1, 5, LamAddressing::Subaddress(1)).unwrap();
    assert_ne!(first, other);
    assert_eq!(driver.crate_node(0, 1).unwrap().lam_count(5), 2);

    // First declaration on the crate enabled its demands
    let status = driver.backend().controller_status(0, 1).unwrap();
    assert!(status.contains(ControllerStatus::DEMAND_ENABLE));
}

#[test]
fn test_declare_lam_rejects_bad_parameters() {
    let driver = adc_driver();
    assert_eq!(
        driver.declare_lam(0, 1, 24, LamAddressing::Subaddress(0)),
        Err(CamacError::InvalidSlot(24))
    );
    assert_eq!(
        driver.declare_lam(0, 1, 5, LamAddressing::Subaddress(16)),
        Err(CamacError::InvalidSubaddress(16))
    );
    assert_eq!(
        driver.declare_lam(0, 1, 5, LamAddressing::MaskRegister(24)),
        Err(CamacError::InvalidSubaddress(24))
    );
    assert!(driver.crate_node(0, 1).is_none());
}

#[test]
fn test_lam_control_operations() {
    let driver = adc_driver();
    let lam = driver.declare_lam(0, 1, 5, LamAddressing::Subaddress(2)).unwrap();
    let source = LamSource::Subaddress(2);

    driver.enable_lam(&lam, true).unwrap();
    assert!(driver.backend().lam_enabled(0, 1, 5, source));
    assert_ne!(driver.crate_node(0, 1).unwrap().lam_mask() & lam.slot_mask(), 0);
    assert_ne!(driver.backend().lam_mask_register(0, 1).unwrap() & (1 << 4), 0);

    // Keep the dispatcher out of it
    driver.set_crate_demand(lam_address(&driver), false).unwrap();
    assert!(!driver.test_lam(&lam).unwrap());
    assert!(!driver.backend().raise_lam(0, 1, 5, source));
    assert!(driver.backend().lam_pending(0, 1, 5, source));
    assert!(driver.test_lam(&lam).unwrap());

    driver.clear_lam(&lam).unwrap();
    assert!(!driver.backend().lam_pending(0, 1, 5, source));

    driver.enable_lam(&lam, false).unwrap();
    assert!(!driver.backend().lam_enabled(0, 1, 5, source));
}

#[test]
fn test_mask_register_lam() {
    let driver = adc_driver();
    let lam = driver.declare_lam(0, 1, 5, LamAddressing::MaskRegister(3)).unwrap();
    let source = LamSource::StatusBit(3);

    driver.enable_lam(&lam, true).unwrap();
    assert!(driver.backend().lam_enabled(0, 1, 5, source));
    driver.set_crate_demand(lam_address(&driver), false).unwrap();
    assert!(!driver.test_lam(&lam).unwrap());

    assert!(!driver.backend().raise_lam(0, 1, 5, source));
    assert!(driver.test_lam(&lam).unwrap());
    driver.clear_lam(&lam).unwrap();
    assert!(!driver.test_lam(&lam).unwrap());

    driver.enable_lam(&lam, false).unwrap();
    assert!(!driver.backend().lam_enabled(0, 1, 5, source));
}

#[test]
fn test_classic_lam_codes() {
    assert_eq!(LamAddressing::from_classic(4).unwrap(), LamAddressing::Subaddress(4));
    assert_eq!(LamAddressing::from_classic(-1).unwrap(), LamAddressing::MaskRegister(0));
    assert_eq!(LamAddressing::from_classic(-24).unwrap(), LamAddressing::MaskRegister(23));
    assert!(LamAddressing::from_classic(16).is_err());
    assert!(LamAddressing::from_classic(-25).is_err());
}

#[test]
fn test_wait_without_handle_returns() {
    let driver = adc_driver();
    assert_eq!(driver.wait_lam(None, 5), Ok(()));
    assert_eq!(driver.wait_lam(None, WAIT_FOREVER), Ok(()));
}

#[test]
fn test_wait_times_out_after_minimum() {
    let driver = adc_driver();
    let lam = driver.declare_lam(0, 1, 5, LamAddressing::Subaddress(0)).unwrap();
    let min = driver.timeout_bounds().min_timeout_ms();

    let start = Instant::now();
    assert_eq!(driver.wait_lam(Some(&lam), 1), Err(CamacError::LamTimeout));
    assert!(start.elapsed() >= Duration::from_millis(min as u64));
    assert_eq!(lam.waiting(), 0);
    assert_eq!(driver.last_error(), Some(CamacError::LamTimeout));
}

#[test]
fn test_wait_rejects_overlong_timeout() {
    let driver = adc_driver();
    let lam = driver.declare_lam(0, 1, 5, LamAddressing::Subaddress(0)).unwrap();
    let max = driver.timeout_bounds().max_timeout_ms();
    assert_eq!(
        driver.wait_lam(Some(&lam), max + 1),
        Err(CamacError::BadTimeout(max + 1))
    );
    assert_eq!(lam.waiting(), 0);
}

#[test]
fn test_lam_wakes_every_waiter() {
    let driver = adc_driver();
    let lam = driver.declare_lam(0, 1, 5, LamAddressing::Subaddress(0)).unwrap();

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let driver = driver.clone();
            let lam = lam.clone();
            std::thread::spawn(move || driver.wait_lam(Some(&lam), 0))
        })
        .collect();

    assert!(eventually(|| lam.waiting() == 3));
    assert!(driver.backend().raise_lam(0, 1, 5, LamSource::Subaddress(0)));

    for waiter in waiters {
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }
    assert_eq!(lam.waiting(), 0);
    assert!(!driver.backend().lam_pending(0, 1, 5, LamSource::Subaddress(0)));
    // A delivered LAM is not unexpected
    assert_eq!(unexpected_lams(&driver, 5), 0);
}

#[test]
fn test_lam_during_wait_is_not_lost() {
    let driver = adc_driver();
    let lam = driver.declare_lam(0, 1, 5, LamAddressing::Subaddress(0)).unwrap();

    let raiser = {
        let driver = driver.clone();
        let lam = lam.clone();
        std::thread::spawn(move || {
            assert!(eventually(|| lam.waiting() == 1));
            driver.backend().raise_lam(0, 1, 5, LamSource::Subaddress(0))
        })
    };
    assert_eq!(driver.wait_lam(Some(&lam), 2000), Ok(()));
    assert!(raiser.join().unwrap());
}

#[test]
fn test_control_block_waits_for_lam() {
    let highway = MockHighway::builder()
        .module(0, 1, 5, MockModule::new("ADC").with_register(0, 77))
        .build();
    let driver = started(highway);
    let addr = driver.encode(0, 1, 5, 0).unwrap();
    let lam = driver.declare_lam(0, 1, 5, LamAddressing::Subaddress(0)).unwrap();

    let mut data = [0u32; 1];
    let mut cb = ControlBlock::new(1).with_lam(lam.clone(), 20);
    assert_eq!(
        driver.repeat_until_no_q(0, addr, &mut data, &mut cb),
        Err(CamacError::LamTimeout)
    );
    assert_eq!(cb.tally, 0);
    assert!(!driver.branch_is_locked(0));

    let raiser = {
        let driver = driver.clone();
        let lam = lam.clone();
        std::thread::spawn(move || {
            assert!(eventually(|| lam.waiting() == 1));
            driver.backend().raise_lam(0, 1, 5, LamSource::Subaddress(0))
        })
    };
    let mut cb = ControlBlock::new(1).with_lam(lam, 2000);
    driver.repeat_until_no_q(0, addr, &mut data, &mut cb).unwrap();
    assert!(raiser.join().unwrap());
    assert_eq!(cb.tally, 1);
    assert_eq!(data, [77]);
}

#[test]
fn test_linked_callback_runs() {
    let driver = adc_driver();
    let lam = driver.declare_lam(0, 1, 5, LamAddressing::Subaddress(1)).unwrap();
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    driver
        .link_lam(&lam, Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();
    assert!(lam.has_callback());
    driver.enable_lam(&lam, true).unwrap();

    assert!(driver.backend().raise_lam(0, 1, 5, LamSource::Subaddress(1)));
    assert!(eventually(|| fired.load(Ordering::SeqCst) == 1));
    assert!(eventually(|| !driver.backend().lam_pending(0, 1, 5, LamSource::Subaddress(1))));
    // Still enabled: the callback claimed it
    assert!(driver.backend().lam_enabled(0, 1, 5, LamSource::Subaddress(1)));

    driver.link_lam(&lam, None).unwrap();
    assert!(!lam.has_callback());
}

fn counting_callback(driver: &CamacDriver<MockHighway>, lam: &LamHandle) -> Arc<AtomicUsize> {
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    driver
        .link_lam(lam, Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();
    driver.enable_lam(lam, true).unwrap();
    fired
}

#[test]
fn test_shared_slot_tests_each_descriptor() {
    let driver = adc_driver();
    let lam_a = driver.declare_lam(0, 1, 5, LamAddressing::Subaddress(0)).unwrap();
    let lam_b = driver.declare_lam(0, 1, 5, LamAddressing::Subaddress(1)).unwrap();
    let lam_c = driver.declare_lam(0, 1, 5, LamAddressing::Subaddress(2)).unwrap();
    let fired_a = counting_callback(&driver, &lam_a);
    let fired_b = counting_callback(&driver, &lam_b);
    driver.enable_lam(&lam_c, true).unwrap();

    assert!(driver.backend().raise_lam(0, 1, 5, LamSource::Subaddress(1)));
    assert!(eventually(|| fired_b.load(Ordering::SeqCst) == 1));
    assert!(eventually(|| !driver.backend().lam_pending(0, 1, 5, LamSource::Subaddress(1))));
    assert_eq!(fired_a.load(Ordering::SeqCst), 0);
    assert!(driver.backend().lam_enabled(0, 1, 5, LamSource::Subaddress(0)));
    assert!(driver.backend().lam_enabled(0, 1, 5, LamSource::Subaddress(1)));
    assert_eq!(unexpected_lams(&driver, 5), 0);

    // A2 fires with no callback and nobody waiting: disabled and counted once
    assert!(driver.backend().raise_lam(0, 1, 5, LamSource::Subaddress(2)));
    assert!(eventually(|| unexpected_lams(&driver, 5) == 1));
    assert!(eventually(|| !driver.backend().lam_enabled(0, 1, 5, LamSource::Subaddress(2))));
    assert!(!driver.backend().lam_pending(0, 1, 5, LamSource::Subaddress(2)));
    assert_eq!(fired_a.load(Ordering::SeqCst), 0);
    assert_eq!(fired_b.load(Ordering::SeqCst), 1);
    assert!(driver.backend().lam_enabled(0, 1, 5, LamSource::Subaddress(1)));
}

#[test]
fn test_slot_events_deliver_directly() {
    let highway = MockHighway::builder()
        .module(0, 1, 5, MockModule::new("ADC"))
        .slot_events(true)
        .build();
    let driver = started(highway);
    let lam = driver.declare_lam(0, 1, 5, LamAddressing::Subaddress(0)).unwrap();
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    driver
        .link_lam(&lam, Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();
    driver.enable_lam(&lam, true).unwrap();

    assert!(driver.backend().raise_lam(0, 1, 5, LamSource::Subaddress(0)));
    assert!(eventually(|| fired.load(Ordering::SeqCst) == 1));
}

#[test]
fn test_unclaimed_lam_is_disabled_and_counted() {
    let driver = adc_driver();
    let lam = driver.declare_lam(0, 1, 5, LamAddressing::Subaddress(0)).unwrap();
    driver.enable_lam(&lam, true).unwrap();

    driver.process_lam_event(LamEvent {
        branch: 0,
        crate_num: 1,
        slot: Some(5),
    });
    assert!(!driver.backend().lam_enabled(0, 1, 5, LamSource::Subaddress(0)));
    assert_eq!(unexpected_lams(&driver, 5), 1);
}

#[test]
fn test_renegade_slot_is_gated_off() {
    let highway = MockHighway::builder()
        .module(0, 1, 7, MockModule::new("Stray").with_lams_enabled())
        .build();
    let driver = started(highway);
    driver.encode(0, 1, 7, 0).unwrap();
    driver.backend().clear_calls();

    driver.process_lam_event(LamEvent {
        branch: 0,
        crate_num: 1,
        slot: Some(7),
    });
    // The standard controller closes the mask bit and leaves it closed
    assert_eq!(driver.crate_node(0, 1).unwrap().lam_mask() & (1 << 6), 0);
    assert_eq!(driver.backend().lam_mask_register(0, 1).unwrap() & (1 << 6), 0);
    assert_eq!(unexpected_lams(&driver, 7), 1);
    assert!(driver.backend().calls_with(FunctionCode::CLEAR_LAM).is_empty());

    driver.process_lam_event(LamEvent {
        branch: 0,
        crate_num: 1,
        slot: Some(7),
    });
    assert_eq!(driver.backend().lam_mask_register(0, 1).unwrap() & (1 << 6), 0);
    assert_eq!(unexpected_lams(&driver, 7), 2);
}

#[test]
#[traced_test]
fn test_renegade_without_gate_is_swept() {
    let highway = MockHighway::builder()
        .module(0, 1, 7, MockModule::new("Stray").with_lams_enabled())
        .build();
    let driver = CamacDriver::new(highway, config());
    driver
        .declare_init_routine(Arc::new(|_, funcs, _| funcs.disable_slot_lam = None), 0, 1, 0)
        .unwrap();
    driver.library_init().unwrap();
    driver.encode(0, 1, 7, 0).unwrap();
    assert!(driver.crate_node(0, 1).unwrap().functions().disable_slot_lam.is_none());

    driver.backend().raise_lam(0, 1, 7, LamSource::Subaddress(3));
    assert!(driver.backend().lam_pending(0, 1, 7, LamSource::Subaddress(3)));

    driver.process_lam_event(LamEvent {
        branch: 0,
        crate_num: 1,
        slot: Some(7),
    });

    assert!(!driver.backend().lam_pending(0, 1, 7, LamSource::Subaddress(3)));
    assert!(!driver.backend().lam_enabled(0, 1, 7, LamSource::Subaddress(3)));
    let clears = driver
        .backend()
        .calls_with(FunctionCode::CLEAR_LAM)
        .into_iter()
        .filter(|c| c.bcna.slot == 7)
        .count();
    assert_eq!(clears, 16);
    assert_eq!(unexpected_lams(&driver, 7), 1);
    assert!(logs_contain("Renegade LAM"));
}

#[test]
fn test_event_for_new_crate_only_initializes_it() {
    let driver = adc_driver();
    assert!(driver.crate_node(0, 1).is_none());
    driver.process_lam_event(LamEvent {
        branch: 0,
        crate_num: 1,
        slot: None,
    });
    assert!(driver.crate_node(0, 1).is_some());
    assert_eq!(unexpected_lams(&driver, 5), 0);
}

#[test]
#[traced_test]
fn test_full_queue_drops_events() {
    let highway = MockHighway::builder()
        .module(0, 1, 5, MockModule::new("ADC"))
        .build();
    // No library_init: the dispatcher never drains the queue
    let driver = CamacDriver::new(
        highway,
        CamacConfig {
            lam_queue_depth: 2,
            ..config()
        },
    );
    driver.init_branch(0).unwrap();

    assert!(driver.backend().post_event(0, 1, None));
    assert!(driver.backend().post_event(0, 1, None));
    assert!(!driver.backend().post_event(0, 1, None));
    assert!(!driver.backend().post_event(0, 1, Some(5)));
    assert_eq!(driver.lam_poster().dropped_count(), 2);
    assert!(logs_contain("LAM queue full"));
}
