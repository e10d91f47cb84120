use std::sync::{Arc, Mutex};

use weft_core::PipId;
use weft_resource::{
    CancelReason, MachinePerfInfo, ManageMemoryMode, PipControl, ResourceAction,
    ResourceActionKind, ResourceManager, ResourcePressure, ResourceThresholds,
};

fn sample(available_ram_mb: u64, ram_usage_percent: f64) -> MachinePerfInfo {
    MachinePerfInfo {
        available_ram_mb,
        ram_usage_percent,
        commit_used_mb: 0,
        commit_usage_percent: 10.0,
        available_disk_mb: 100_000,
    }
}

struct Running {
    pip: PipId,
    control: PipControl,
    _registration: weft_resource::ResourceRegistration,
}

fn start(manager: &ResourceManager, raw: u64, expected_ram_mb: u64) -> Running {
    let pip = PipId::from_raw(raw);
    let control = PipControl::new();
    let registration = manager.register(pip, expected_ram_mb, control.clone());
    Running {
        pip,
        control,
        _registration: registration,
    }
}

#[test]
fn low_memory_cancels_most_recent_until_projected_recovery() {
    let manager = ResourceManager::new(
        ResourceThresholds::default(),
        ManageMemoryMode::CancelMostRecent,
        2,
    );
    let a = start(&manager, 1, 1000);
    let b = start(&manager, 2, 1000);
    let c = start(&manager, 3, 1000);

    // 300 MB free at 96% usage: total is 7500 MB. Freeing C alone is enough.
    let actions = manager.observe(sample(300, 96.0));
    assert_eq!(
        actions,
        vec![ResourceAction {
            pip: c.pip,
            kind: ResourceActionKind::Cancel(CancelReason::LowMemory),
        }]
    );
    assert!(c.control.is_cancelled());
    assert_eq!(c.control.cancel_reason(), Some(CancelReason::LowMemory));
    assert!(!a.control.is_cancelled());
    assert!(!b.control.is_cancelled());
    assert_eq!(manager.pressure(), ResourcePressure::LowMemory);
}

#[test]
fn oldest_running_pip_is_never_shed() {
    let manager = ResourceManager::new(
        ResourceThresholds::default(),
        ManageMemoryMode::CancelMostRecent,
        2,
    );
    let only = start(&manager, 1, 4000);
    assert!(manager.observe(sample(10, 99.0)).is_empty());
    assert!(!only.control.is_cancelled());
}

#[test]
fn suspended_pips_resume_once_pressure_subsides() {
    let manager = ResourceManager::new(ResourceThresholds::default(), ManageMemoryMode::Suspend, 2);
    let a = start(&manager, 1, 1000);
    let b = start(&manager, 2, 1000);

    let actions = manager.observe(sample(300, 96.0));
    assert_eq!(
        actions,
        vec![ResourceAction {
            pip: b.pip,
            kind: ResourceActionKind::Suspend,
        }]
    );
    assert!(b.control.is_suspended());
    assert!(!a.control.is_suspended());
    assert_eq!(manager.report().suspended, 1);

    // Inside the hysteresis band nothing changes.
    assert!(manager.observe(sample(1200, 85.0)).is_empty());
    assert!(b.control.is_suspended());

    let actions = manager.observe(sample(6000, 20.0));
    assert_eq!(
        actions,
        vec![ResourceAction {
            pip: b.pip,
            kind: ResourceActionKind::Resume,
        }]
    );
    assert!(!b.control.is_suspended());
    assert_eq!(manager.pressure(), ResourcePressure::Normal);
}

#[test]
fn disk_exhaustion_cancels_everything() {
    let manager = ResourceManager::new(
        ResourceThresholds::default(),
        ManageMemoryMode::Suspend,
        2,
    );
    let a = start(&manager, 1, 100);
    let b = start(&manager, 2, 100);

    let mut exhausted = sample(8000, 10.0);
    exhausted.available_disk_mb = 1;
    let actions = manager.observe(exhausted);
    assert_eq!(actions.len(), 2);
    for running in [&a, &b] {
        assert_eq!(running.control.cancel_reason(), Some(CancelReason::DiskExhausted));
    }
    assert!(!manager.can_dispatch(1));
}

#[test]
fn dispatch_accounts_for_ram_promised_since_last_sample() {
    let manager = ResourceManager::new(
        ResourceThresholds::default(),
        ManageMemoryMode::CancelMostRecent,
        2,
    );
    // 4000 MB free of 8000 MB.
    manager.observe(sample(4000, 50.0));
    let _a = start(&manager, 1, 2000);
    assert!(manager.can_dispatch(1000));
    let _b = start(&manager, 2, 1000);
    // 4000 - 3000 - 1000 leaves nothing.
    assert!(!manager.can_dispatch(1000));

    manager.observe(sample(4000, 50.0));
    assert!(manager.can_dispatch(1000));
}

#[test]
fn listeners_observe_pressure_transitions() {
    let manager = ResourceManager::new(
        ResourceThresholds::default(),
        ManageMemoryMode::CancelMostRecent,
        2,
    );
    let events = Arc::new(Mutex::new(Vec::new()));
    {
        let events = events.clone();
        manager.subscribe(Arc::new(move |event| {
            events.lock().unwrap().push((event.previous, event.pressure));
        }));
    }

    manager.observe(sample(8000, 10.0));
    manager.observe(sample(100, 99.0));
    manager.observe(sample(100, 99.0));
    manager.observe(sample(8000, 10.0));

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            (ResourcePressure::Normal, ResourcePressure::LowMemory),
            (ResourcePressure::LowMemory, ResourcePressure::Normal),
        ]
    );
}
