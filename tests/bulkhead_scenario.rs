mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{test_executor, TestError};
use resilience_runtime::context::ExecutionContext;
use resilience_runtime::error::ResilienceError;
use resilience_runtime::metrics::{InMemoryMetricsRecorder, MetricEvent};
use resilience_runtime::policy::{BulkheadConfig, PolicyConfig};
use tokio::sync::{Barrier, Notify, Semaphore};

fn queued_events(recorder: &InMemoryMetricsRecorder) -> usize {
    recorder
        .events()
        .iter()
        .filter(|e| matches!(e, MetricEvent::BulkheadQueue { queued: true, .. }))
        .count()
}

#[tokio::test]
async fn two_running_one_queued_fourth_rejected() {
    let (executor, _, recorder) = test_executor();
    let executor = Arc::new(executor);
    executor
        .register_policy(
            PolicyConfig::new("reports")
                .with_bulkhead(BulkheadConfig::new(2, 1).with_queue_timeout(Duration::from_secs(60))),
        )
        .unwrap();

    let gate = Arc::new(Semaphore::new(0));
    let started = Arc::new(Barrier::new(3));
    let mut running = Vec::new();
    for _ in 0..2 {
        let (executor, gate, started) = (executor.clone(), gate.clone(), started.clone());
        running.push(tokio::spawn(async move {
            executor
                .execute(&ExecutionContext::background(), "reports", move |_| {
                    let (gate, started) = (gate.clone(), started.clone());
                    async move {
                        started.wait().await;
                        let _pass = gate.acquire().await;
                        Ok::<_, TestError>(())
                    }
                })
                .await
        }));
    }
    started.wait().await;

    let queued = {
        let executor = executor.clone();
        tokio::spawn(async move {
            executor
                .execute_with_result(&ExecutionContext::background(), "reports", |_| async {
                    Ok::<_, TestError>("ran after waiting")
                })
                .await
        })
    };
    while queued_events(&recorder) == 0 {
        tokio::task::yield_now().await;
    }

    let err = executor
        .execute(&ExecutionContext::background(), "reports", |_| async { Ok(()) })
        .await
        .unwrap_err();
    match err {
        ResilienceError::BulkheadFull(full) => {
            assert_eq!(full.max_concurrent, 2);
            assert_eq!(full.queue_size, 1);
            assert_eq!(full.current_load, 3);
        }
        other => panic!("expected bulkhead full, got {other:?}"),
    }

    gate.add_permits(2);
    for handle in running {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(queued.await.unwrap().unwrap(), "ran after waiting");

    let mut queued_flags: Vec<_> = recorder
        .executions()
        .iter()
        .filter(|m| m.success())
        .map(|m| m.bulkhead_queued())
        .collect();
    queued_flags.sort();
    assert_eq!(queued_flags, vec![Some(false), Some(false), Some(true)]);
}

#[tokio::test(start_paused = true)]
async fn queued_caller_times_out_with_bulkhead_full() {
    let (executor, _, _) = test_executor();
    let executor = Arc::new(executor);
    executor
        .register_policy(
            PolicyConfig::new("reports")
                .with_bulkhead(BulkheadConfig::new(1, 1).with_queue_timeout(Duration::from_millis(200))),
        )
        .unwrap();

    let release = Arc::new(Notify::new());
    let holder = {
        let (executor, release) = (executor.clone(), release.clone());
        tokio::spawn(async move {
            executor
                .execute(&ExecutionContext::background(), "reports", move |_| {
                    let release = release.clone();
                    async move {
                        release.notified().await;
                        Ok::<_, TestError>(())
                    }
                })
                .await
        })
    };
    tokio::task::yield_now().await;

    let err = executor
        .execute(&ExecutionContext::background(), "reports", |_| async { Ok(()) })
        .await
        .unwrap_err();
    assert!(err.is_bulkhead_full(), "{err:?}");

    release.notify_one();
    holder.await.unwrap().unwrap();
}
