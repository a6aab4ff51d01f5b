
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use texsched::config::SchedulerConfig;
use texsched::events::{CompilationStage, SchedulerEvent};
use texsched::scheduler::{
    CompilationOptions, CompileScheduler, JobId, JobOutcome, SchedulerStatus,
};
use test_harness::{
    assert_eventually, collect_until_final, final_order, slow_success, wait_for_final,
    wait_for_stage, FakeCompiler, HANGS, SUCCEEDS,
};

const WAIT: Duration = Duration::from_secs(20);

fn options() -> CompilationOptions {
    CompilationOptions::default()
}

#[tokio::test]
async fn test_successful_job_emits_progress_then_completed() {
    let compiler = FakeCompiler::new(SUCCEEDS);
    let scheduler = CompileScheduler::new(compiler.config());
    let mut rx = scheduler.subscribe();

    let job_id = scheduler.submit("\\documentclass{article}", options());
    let events = collect_until_final(&mut rx, &[job_id], WAIT).await;

    let stages: Vec<CompilationStage> = events
        .iter()
        .filter_map(|e| match e {
            SchedulerEvent::Progress(p) => Some(p.stage),
            _ => None,
        })
        .collect();
    assert_eq!(
        stages,
        vec![
            CompilationStage::Queued,
            CompilationStage::Preparing,
            CompilationStage::Compiling,
            CompilationStage::Processing,
            CompilationStage::Completed,
        ]
    );

    let percents: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            SchedulerEvent::Progress(p) => Some(p.percent),
            _ => None,
        })
        .collect();
    assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{:?}", percents);
    assert_eq!(percents.last(), Some(&100));

    match events.last() {
        Some(SchedulerEvent::Completed(result)) => {
            assert_eq!(result.job_id, job_id);
            assert!(result.success);
            assert_eq!(result.passes, 1);
            assert!(result
                .artifact_bytes
                .as_deref()
                .is_some_and(|b| b.starts_with(b"%PDF")));
        }
        other => panic!("expected Completed, got {:?}", other),
    }
    assert_eq!(
        events.iter().filter(|e| e.is_final()).count(),
        1,
        "exactly one final event"
    );
    assert_eq!(scheduler.status().await, SchedulerStatus::default());
}

#[tokio::test]
async fn test_fifo_order_with_single_slot() {
    let compiler = FakeCompiler::new(&slow_success(0.1));
    let scheduler = CompileScheduler::new(compiler.config().with_max_concurrent(1));
    let mut rx = scheduler.subscribe();

    let ids: Vec<JobId> = (0..3)
        .map(|i| scheduler.submit(format!("doc {}", i), options()))
        .collect();
    let events = collect_until_final(&mut rx, &ids, WAIT).await;

    assert_eq!(final_order(&events), ids);
    assert_eq!(compiler.invocations(), 3);
}

#[tokio::test]
async fn test_higher_priority_runs_first() {
    let compiler = FakeCompiler::new(&slow_success(0.2));
    let scheduler = CompileScheduler::new(compiler.config().with_max_concurrent(1));
    let mut rx = scheduler.subscribe();

    // Occupies the only slot while the rest queue up
    let blocker = scheduler.submit("blocker", options());
    let low = scheduler.submit_with_priority("low", options(), 0);
    let high = scheduler.submit_with_priority("high", options(), 10);
    let mid = scheduler.submit_with_priority("mid", options(), 5);

    let events = collect_until_final(&mut rx, &[blocker, low, high, mid], WAIT).await;
    assert_eq!(final_order(&events), vec![blocker, high, mid, low]);
}

#[tokio::test]
async fn test_equal_priority_keeps_submission_order() {
    let compiler = FakeCompiler::new(&slow_success(0.1));
    let scheduler = CompileScheduler::new(compiler.config().with_max_concurrent(1));
    let mut rx = scheduler.subscribe();

    let blocker = scheduler.submit("blocker", options());
    let first = scheduler.submit_with_priority("first", options(), 3);
    let second = scheduler.submit_with_priority("second", options(), 3);
    let third = scheduler.submit_with_priority("third", options(), 3);

    let events = collect_until_final(&mut rx, &[blocker, first, second, third], WAIT).await;
    assert_eq!(final_order(&events), vec![blocker, first, second, third]);
}

#[tokio::test]
async fn test_concurrency_ceiling_is_never_exceeded() {
    let compiler = FakeCompiler::new(&slow_success(0.2));
    let scheduler = CompileScheduler::new(compiler.config().with_max_concurrent(2));
    let mut rx = scheduler.subscribe();

    let ids: Vec<JobId> = (0..6)
        .map(|i| scheduler.submit(format!("doc {}", i), options()))
        .collect();

    let mut running = 0usize;
    let mut peak = 0usize;
    let mut outstanding = ids.len();
    while outstanding > 0 {
        let event = tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        match &event {
            SchedulerEvent::Progress(p) if p.stage == CompilationStage::Preparing => {
                running += 1;
                peak = peak.max(running);
            }
            e if e.is_final() => {
                running -= 1;
                outstanding -= 1;
            }
            _ => {}
        }
        let status = scheduler.status().await;
        assert!(status.active <= 2, "status reported {:?}", status);
        assert_eq!(status.total, status.pending + status.active);
    }

    assert!(peak <= 2, "peak concurrency was {}", peak);
    assert_eq!(peak, 2);
    assert_eq!(compiler.invocations(), 6);
}

#[tokio::test]
async fn test_status_counts_pending_and_active() {
    let compiler = FakeCompiler::new(HANGS);
    let scheduler = CompileScheduler::new(compiler.config().with_max_concurrent(1));

    for i in 0..3 {
        scheduler.submit(format!("doc {}", i), options());
    }
    assert_eq!(
        scheduler.status().await,
        SchedulerStatus {
            pending: 2,
            active: 1,
            total: 3,
        }
    );

    scheduler.clear().await;
}

#[tokio::test]
async fn test_cancel_pending_job_never_spawns_compiler() {
    let compiler = FakeCompiler::new(&slow_success(0.5));
    let scheduler = CompileScheduler::new(compiler.config().with_max_concurrent(1));
    let mut rx = scheduler.subscribe();

    let running = scheduler.submit("running", options());
    let queued = scheduler.submit("queued", options());

    assert!(scheduler.cancel(queued).await);
    assert!(!scheduler.cancel(queued).await, "already cancelled");

    let events = collect_until_final(&mut rx, &[running, queued], WAIT).await;
    let cancelled = events.iter().find(|e| e.job_id() == queued && e.is_final());
    assert!(matches!(cancelled, Some(SchedulerEvent::Cancelled { .. })));
    assert!(!events
        .iter()
        .any(|e| e.job_id() == queued && matches!(e, SchedulerEvent::Completed(_))));

    assert_eq!(compiler.invocations(), 1);
    assert_eq!(scheduler.status().await, SchedulerStatus::default());
}

#[tokio::test]
async fn test_cancel_active_job_terminates_compiler() {
    let compiler = FakeCompiler::new(HANGS);
    let scheduler = CompileScheduler::new(compiler.config());
    let mut rx = scheduler.subscribe();

    let job_id = scheduler.submit("hangs", options());
    wait_for_stage(&mut rx, job_id, CompilationStage::Compiling, WAIT).await;

    let started = tokio::time::Instant::now();
    assert!(scheduler.cancel(job_id).await);
    // Repeat requests are acknowledged but change nothing
    assert!(scheduler.cancel(job_id).await);

    let event = wait_for_final(&mut rx, job_id, WAIT).await;
    assert!(matches!(event, SchedulerEvent::Cancelled { .. }));
    assert!(started.elapsed() < Duration::from_secs(10));

    // No completion and no second cancellation may follow
    let extra = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
    if let Ok(Ok(event)) = extra {
        assert_ne!(event.job_id(), job_id, "unexpected event {:?}", event);
    }
    assert!(!scheduler.cancel(job_id).await);
    assert_eq!(scheduler.status().await, SchedulerStatus::default());
}

#[tokio::test]
async fn test_cancel_unknown_job_returns_false() {
    let compiler = FakeCompiler::new(SUCCEEDS);
    let scheduler = CompileScheduler::new(compiler.config());
    assert!(!scheduler.cancel(JobId::new()).await);
}

#[tokio::test]
async fn test_clear_cancels_everything_and_is_idempotent() {
    let compiler = FakeCompiler::new(HANGS);
    let scheduler = CompileScheduler::new(compiler.config().with_max_concurrent(1));
    let mut rx = scheduler.subscribe();

    let ids: Vec<JobId> = (0..3)
        .map(|i| scheduler.submit(format!("doc {}", i), options()))
        .collect();
    wait_for_stage(&mut rx, ids[0], CompilationStage::Compiling, WAIT).await;

    scheduler.clear().await;
    assert_eq!(scheduler.status().await, SchedulerStatus::default());
    scheduler.clear().await;
    assert_eq!(scheduler.status().await, SchedulerStatus::default());

    let events = collect_until_final(&mut rx, &ids, WAIT).await;
    for id in &ids {
        let finals: Vec<&SchedulerEvent> = events
            .iter()
            .filter(|e| e.job_id() == *id && e.is_final())
            .collect();
        assert_eq!(finals.len(), 1);
        assert!(matches!(finals[0], SchedulerEvent::Cancelled { .. }));
    }
    assert_eq!(compiler.invocations(), 1);
}

#[tokio::test]
async fn test_clear_on_idle_scheduler() {
    let compiler = FakeCompiler::new(SUCCEEDS);
    let scheduler = CompileScheduler::new(compiler.config());
    scheduler.clear().await;
    assert_eq!(scheduler.status().await, SchedulerStatus::default());
}

#[tokio::test]
async fn test_raising_ceiling_starts_queued_jobs() {
    let compiler = FakeCompiler::new(HANGS);
    let scheduler = CompileScheduler::new(compiler.config().with_max_concurrent(1));

    for i in 0..4 {
        scheduler.submit(format!("doc {}", i), options());
    }
    scheduler.set_max_concurrent(4);

    assert_eq!(
        scheduler.status().await,
        SchedulerStatus {
            pending: 0,
            active: 4,
            total: 4,
        }
    );
    scheduler.clear().await;
}

#[tokio::test]
async fn test_zero_ceiling_is_treated_as_one() {
    let compiler = FakeCompiler::new(HANGS);
    let scheduler = CompileScheduler::new(compiler.config());
    scheduler.set_max_concurrent(0);

    scheduler.submit("a", options());
    scheduler.submit("b", options());

    let status = scheduler.status().await;
    assert_eq!(status.active, 1);
    assert_eq!(status.pending, 1);
    scheduler.clear().await;
}

#[tokio::test]
async fn test_failed_compilation_reports_diagnostics() {
    let compiler = FakeCompiler::new(
        "echo './document.tex:3: Undefined control sequence.'\necho 'l.3 \\\\foo'\nexit 1",
    );
    let scheduler = CompileScheduler::new(compiler.config());
    let mut rx = scheduler.subscribe();

    let job_id = scheduler.submit("\\foo", options());
    let events = collect_until_final(&mut rx, &[job_id], WAIT).await;

    let failed = events.iter().any(|e| {
        matches!(e, SchedulerEvent::Progress(p) if p.stage == CompilationStage::Failed && p.percent == 100)
    });
    assert!(failed, "terminal progress should be 'failed'");

    match events.last() {
        Some(SchedulerEvent::Completed(result)) => {
            assert!(!result.success);
            assert!(result.artifact_bytes.is_none());
            assert_eq!(result.errors.len(), 1);
            assert_eq!(result.errors[0].line, Some(3));
            assert!(result.combined_log.contains("Undefined control sequence"));
        }
        other => panic!("expected Completed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_every_subscriber_sees_completion() {
    let compiler = FakeCompiler::new(SUCCEEDS);
    let scheduler = CompileScheduler::new(compiler.config());
    let mut first = scheduler.subscribe();
    let mut second = scheduler.subscribe();

    let job_id = scheduler.submit("doc", options());
    let a = wait_for_final(&mut first, job_id, WAIT).await;
    let b = wait_for_final(&mut second, job_id, WAIT).await;
    assert!(matches!(a, SchedulerEvent::Completed(_)));
    assert!(matches!(b, SchedulerEvent::Completed(_)));
}

#[tokio::test]
async fn test_event_stream_delivers_events() {
    use tokio_stream::StreamExt;

    let compiler = FakeCompiler::new(SUCCEEDS);
    let scheduler = CompileScheduler::new(compiler.config());
    let mut stream = Box::pin(scheduler.event_stream());

    let job_id = scheduler.submit("doc", options());
    let final_event = tokio::time::timeout(WAIT, async {
        while let Some(event) = stream.next().await {
            if event.job_id() == job_id && event.is_final() {
                return Some(event);
            }
        }
        None
    })
    .await
    .expect("timed out");
    assert!(matches!(final_event, Some(SchedulerEvent::Completed(_))));
}

#[tokio::test]
async fn test_shutdown_cancels_running_jobs() {
    let compiler = FakeCompiler::new(HANGS);
    let scheduler = CompileScheduler::new(compiler.config().with_max_concurrent(1));
    let mut rx = scheduler.subscribe();

    let running = scheduler.submit("running", options());
    let queued = scheduler.submit("queued", options());
    wait_for_stage(&mut rx, running, CompilationStage::Compiling, WAIT).await;

    tokio::time::timeout(WAIT, scheduler.shutdown())
        .await
        .expect("shutdown timed out")
        .unwrap();

    let events = collect_until_final(&mut rx, &[running, queued], WAIT).await;
    assert!(events
        .iter()
        .filter(|e| e.is_final())
        .all(|e| matches!(e, SchedulerEvent::Cancelled { .. })));
}

#[tokio::test]
async fn test_submit_after_shutdown_is_cancelled() {
    let compiler = FakeCompiler::new(SUCCEEDS);
    let scheduler = CompileScheduler::new(compiler.config());
    let mut rx = scheduler.subscribe();
    scheduler.shutdown().await.unwrap();

    let job_id = scheduler.submit("late", options());
    let event = wait_for_final(&mut rx, job_id, WAIT).await;
    assert!(matches!(event, SchedulerEvent::Cancelled { .. }));
    assert_eq!(compiler.invocations(), 0);
    assert!(!scheduler.cancel(job_id).await);
}

#[tokio::test]
async fn test_working_directories_are_removed() {
    let compiler = FakeCompiler::new(SUCCEEDS);
    let config = compiler.config();
    let temp_root = config.temp_root.clone();
    let scheduler = CompileScheduler::new(config);
    let mut rx = scheduler.subscribe();

    let job_id = scheduler.submit("doc", options());
    wait_for_final(&mut rx, job_id, WAIT).await;

    let job_dir = temp_root.join(format!("job-{}", job_id));
    assert_eventually(
        || {
            let dir = job_dir.clone();
            async move { !dir.exists() }
        },
        Duration::from_secs(5),
        "job working directory should be removed",
    )
    .await;
}

#[tokio::test]
async fn test_contains_tracks_pending_and_active_jobs() {
    let compiler = FakeCompiler::new(HANGS);
    let scheduler = CompileScheduler::new(compiler.config().with_max_concurrent(1));
    let mut rx = scheduler.subscribe();

    let running = scheduler.submit("a", options());
    let queued = scheduler.submit("b", options());
    wait_for_stage(&mut rx, running, CompilationStage::Compiling, WAIT).await;

    assert!(scheduler.contains(running).await);
    assert!(scheduler.contains(queued).await);
    assert!(!scheduler.contains(JobId::new()).await);

    scheduler.clear().await;
    assert!(!scheduler.contains(running).await);
    assert!(!scheduler.contains(queued).await);
}

#[tokio::test]
async fn test_wait_for_jobs_collects_every_outcome() {
    let compiler = FakeCompiler::new(SUCCEEDS);
    let scheduler = CompileScheduler::new(compiler.config());
    let mut rx = scheduler.subscribe();

    let ids: Vec<JobId> = (0..4)
        .map(|i| scheduler.submit(format!("doc {}", i), options()))
        .collect();
    let outcomes = tokio::time::timeout(
        WAIT,
        scheduler.wait_for_jobs(&mut rx, &ids, &CancellationToken::new()),
    )
    .await
    .expect("every job should finish");

    assert_eq!(outcomes.len(), ids.len());
    for id in &ids {
        match &outcomes[id] {
            JobOutcome::Completed(result) => assert!(result.success),
            other => panic!("expected Completed, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_wait_for_jobs_survives_dropped_final_events() {
    let compiler = FakeCompiler::new(SUCCEEDS);
    let config = SchedulerConfig {
        event_capacity: 8,
        ..compiler.config().with_max_concurrent(4)
    };
    let scheduler = CompileScheduler::new(config);
    let mut rx = scheduler.subscribe();

    let ids: Vec<JobId> = (0..40)
        .map(|i| scheduler.submit(format!("doc {}", i), options()))
        .collect();
    let handle = &scheduler;
    assert_eventually(
        || async move { handle.status().await.total == 0 },
        Duration::from_secs(60),
        "all jobs should finish",
    )
    .await;

    // Far more than 8 events were sent without reading any of them
    let outcomes = tokio::time::timeout(
        WAIT,
        scheduler.wait_for_jobs(&mut rx, &ids, &CancellationToken::new()),
    )
    .await
    .expect("a lagged receiver must not wait forever");

    assert_eq!(outcomes.len(), ids.len());
    assert!(outcomes.values().any(|o| matches!(o, JobOutcome::Lost)));
    assert!(outcomes
        .values()
        .all(|o| matches!(o, JobOutcome::Lost | JobOutcome::Completed(_))));
}

#[tokio::test]
async fn test_wait_for_jobs_returns_after_interrupt() {
    let compiler = FakeCompiler::new(HANGS);
    let scheduler = CompileScheduler::new(compiler.config().with_max_concurrent(1));
    let mut rx = scheduler.subscribe();

    let ids: Vec<JobId> = (0..3)
        .map(|i| scheduler.submit(format!("doc {}", i), options()))
        .collect();
    let interrupt = CancellationToken::new();
    let trigger = interrupt.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let outcomes = tokio::time::timeout(WAIT, scheduler.wait_for_jobs(&mut rx, &ids, &interrupt))
        .await
        .expect("interrupt should end the wait");

    assert_eq!(outcomes.len(), ids.len());
    for id in &ids {
        assert!(
            matches!(outcomes[id], JobOutcome::Cancelled),
            "{:?}",
            outcomes[id]
        );
    }
    assert_eq!(scheduler.status().await, SchedulerStatus::default());
}
