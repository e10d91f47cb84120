use std::sync::Arc;
use std::time::Duration;

use weft_cache::InMemoryCache;
use weft_core::{PipGraph, PipId, PipOptions};
use weft_resource::{CancelReason, MachinePerfInfo, ManageMemoryMode};
use weft_scheduler::{PipFailure, PipOutcome, Scheduler, SchedulerConfig, SkipReason};

use crate::suite::harness::{config, services, wait_until, Script, ScriptedExecutor, Step, Workspace};

fn sample(available_ram_mb: u64, ram_usage_percent: f64, available_disk_mb: u64) -> MachinePerfInfo {
    MachinePerfInfo {
        available_ram_mb,
        ram_usage_percent,
        commit_used_mb: 0,
        commit_usage_percent: 10.0,
        available_disk_mb,
    }
}

fn memory_pressure() -> MachinePerfInfo {
    sample(100, 99.0, 100_000)
}

fn recovered() -> MachinePerfInfo {
    sample(8_000, 20.0, 100_000)
}

fn holding(attempts: u32) -> Script {
    Script::new(vec![Step::Hold {
        duration: Duration::from_secs(3),
        attempts,
    }])
}

fn resource_config(max_resource_retries: u32) -> SchedulerConfig {
    SchedulerConfig {
        max_parallelism: 2,
        manage_memory_mode: ManageMemoryMode::CancelMostRecent,
        max_resource_retries,
        ..config()
    }
}

/// Two independent pips that each expect a gigabyte of RAM.
fn pair(workspace: &Workspace, executor: &ScriptedExecutor) -> (Arc<PipGraph>, [PipId; 2]) {
    let mut g = workspace.graph();
    let mut ids = Vec::new();
    for name in ["left", "right"] {
        executor.script(name, holding(1));
        let pip = g.pip(name).options(PipOptions {
            expected_ram_mb: 1_000,
            ..PipOptions::default()
        });
        ids.push(g.add(pip));
    }
    (g.build(), [ids[0], ids[1]])
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn low_memory_cancels_the_newest_pip_and_retries_it() {
    let workspace = Workspace::new();
    let executor = ScriptedExecutor::new(&workspace);
    let cache = Arc::new(InMemoryCache::new());
    let (graph, ids) = pair(&workspace, &executor);

    let scheduler = Scheduler::new(graph, resource_config(1), services(&cache, &executor));
    let handle = scheduler.handle();
    let build = tokio::spawn(scheduler.run());

    wait_until(|| executor.starts().len() == 2).await;
    handle.report_perf_sample(memory_pressure());
    handle.report_perf_sample(recovered());

    let report = build.await.unwrap();
    assert!(report.success(), "{report:?}");
    assert_eq!(report.counters.resource_retries, 1);
    let starts = executor.starts();
    assert_eq!(starts.len(), 3, "{starts:?}");

    let mut retried = Vec::new();
    for (id, name) in ids.into_iter().zip(["left", "right"]) {
        match report.outcome(id) {
            Some(PipOutcome::Executed {
                attempts: 2,
                resource_retries: 1,
                ..
            }) => retried.push(name),
            Some(PipOutcome::Executed {
                attempts: 1,
                resource_retries: 0,
                ..
            }) => {}
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    // The oldest pip keeps running; only the cancelled one starts again.
    assert_eq!(retried.len(), 1);
    assert_eq!(starts[2], retried[0]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn suspended_pips_resume_without_timing_out() {
    let workspace = Workspace::new();
    let executor = ScriptedExecutor::new(&workspace);
    let cache = Arc::new(InMemoryCache::new());

    let mut g = workspace.graph();
    let mut ids = Vec::new();
    for (name, output) in [("left", "out/left.txt"), ("right", "out/right.txt")] {
        executor.script(
            name,
            Script::new(vec![
                Step::Hold {
                    duration: Duration::from_millis(300),
                    attempts: 1,
                },
                Step::Write(output),
            ]),
        );
        let pip = g.pip(name).output(g.output(output)).options(PipOptions {
            expected_ram_mb: 1_000,
            timeout: Some(Duration::from_secs(1)),
            ..PipOptions::default()
        });
        ids.push(g.add(pip));
    }
    let config = SchedulerConfig {
        manage_memory_mode: ManageMemoryMode::Suspend,
        ..resource_config(1)
    };

    let scheduler = Scheduler::new(g.build(), config, services(&cache, &executor));
    let handle = scheduler.handle();
    let build = tokio::spawn(scheduler.run());

    wait_until(|| executor.starts().len() == 2).await;
    handle.report_perf_sample(memory_pressure());
    // Suspended for longer than the timeout; only the oldest pip gets to finish meanwhile.
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    let finished = ["out/left.txt", "out/right.txt"]
        .into_iter()
        .filter(|output| workspace.exists(output))
        .count();
    assert_eq!(finished, 1);
    handle.report_perf_sample(recovered());

    let report = build.await.unwrap();
    assert!(report.success(), "{report:?}");
    for id in ids {
        assert!(
            matches!(
                report.outcome(id),
                Some(PipOutcome::Executed {
                    attempts: 1,
                    resource_retries: 0,
                    ..
                })
            ),
            "{:?}",
            report.outcome(id)
        );
    }
    assert_eq!(executor.starts().len(), 2);
    assert_eq!(report.counters.resource_retries, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exhausted_resource_retries_fail_the_pip() {
    let workspace = Workspace::new();
    let executor = ScriptedExecutor::new(&workspace);
    let cache = Arc::new(InMemoryCache::new());
    let (graph, ids) = pair(&workspace, &executor);

    let scheduler = Scheduler::new(graph, resource_config(0), services(&cache, &executor));
    let handle = scheduler.handle();
    let build = tokio::spawn(scheduler.run());

    wait_until(|| executor.starts().len() == 2).await;
    handle.report_perf_sample(memory_pressure());

    let report = build.await.unwrap();
    let failures: Vec<&PipFailure> = report.failures().collect();
    assert_eq!(failures.len(), 1, "{report:?}");
    assert!(matches!(
        failures[0],
        PipFailure::ResourceExhaustion {
            reason: CancelReason::LowMemory,
            retries: 0,
            ..
        }
    ));
    assert!(report.fatal.is_none());
    assert_eq!(
        ids.iter()
            .filter(|id| matches!(report.outcome(**id), Some(PipOutcome::Executed { .. })))
            .count(),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disk_exhaustion_fails_running_and_pending_pips() {
    let workspace = Workspace::new();
    let executor = ScriptedExecutor::new(&workspace);
    let cache = Arc::new(InMemoryCache::new());

    let mut g = workspace.graph();
    let mut independent = Vec::new();
    for name in ["left", "right", "queued"] {
        executor.script(name, holding(u32::MAX));
        let pip = g.pip(name).output(g.output(&format!("out/{name}.txt")));
        independent.push(g.add(pip));
    }
    let after = g
        .pip("after")
        .input(g.output("out/left.txt"))
        .output(g.output("out/after.txt"));
    let after = g.add(after);

    let scheduler = Scheduler::new(g.build(), resource_config(1), services(&cache, &executor));
    let handle = scheduler.handle();
    let build = tokio::spawn(scheduler.run());

    wait_until(|| executor.starts().len() == 2).await;
    handle.report_perf_sample(sample(8_000, 20.0, 10));

    let report = build.await.unwrap();
    assert!(
        matches!(
            report.fatal,
            Some(PipFailure::ResourceExhaustion {
                reason: CancelReason::DiskExhausted,
                ..
            })
        ),
        "{report:?}"
    );
    for id in independent {
        assert!(
            matches!(
                report.outcome(id),
                Some(PipOutcome::Failed(PipFailure::ResourceExhaustion {
                    reason: CancelReason::DiskExhausted,
                    ..
                }))
            ),
            "{:?}",
            report.outcome(id)
        );
    }
    assert!(matches!(
        report.outcome(after),
        Some(PipOutcome::Skipped { .. })
    ));
    assert_eq!(report.counters.executed, 0);
    assert_eq!(executor.starts().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelling_the_build_skips_everything_unfinished() {
    let workspace = Workspace::new();
    let executor = ScriptedExecutor::new(&workspace);
    let cache = Arc::new(InMemoryCache::new());
    let (graph, ids) = pair(&workspace, &executor);

    let scheduler = Scheduler::new(graph, resource_config(1), services(&cache, &executor));
    let handle = scheduler.handle();
    let build = tokio::spawn(scheduler.run());

    wait_until(|| executor.starts().len() == 2).await;
    handle.cancel();

    let report = build.await.unwrap();
    for id in ids {
        assert_eq!(
            report.outcome(id),
            Some(&PipOutcome::Skipped {
                reason: SkipReason::Cancelled
            })
        );
    }
    assert_eq!(report.counters.skipped, 2);
    assert_eq!(cache.entry_count(), 0);
}
