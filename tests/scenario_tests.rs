//! End-to-end scheduling scenarios.
//!
//! Each test drives the scheduler through a complete workload under paused
//! tokio time, so timing assertions are exact rather than sleep-and-hope.

mod common;

use capacity_scheduler::{
    CapacityStrategy, FailRecovery, QueueSizeExceededStrategy, ReleaseRule, RetryOptions,
    Scheduler, SchedulerError, SchedulerOptions, TaskParams,
};
use common::{ms, with_max_capacity, DispatchLog};
use tokio::time::sleep;

#[tokio::test(start_paused = true)]
async fn capacity_packs_tasks_and_releases_on_completion() {
    let scheduler = Scheduler::<&'static str>::new(with_max_capacity(10.0)).unwrap();

    let a = scheduler
        .schedule_with_capacity(6.0, || async {
            sleep(ms(100)).await;
            Ok("a")
        })
        .await
        .unwrap();
    let b = scheduler
        .schedule_with_capacity(6.0, || async {
            sleep(ms(100)).await;
            Ok("b")
        })
        .await
        .unwrap();
    let c = scheduler
        .schedule_with_capacity(2.0, || async {
            sleep(ms(300)).await;
            Ok("c")
        })
        .await
        .unwrap();

    // A and C fit together; B does not and waits.
    let stats = scheduler.stats().await.unwrap();
    assert_eq!(stats.executing_tasks, 2);
    assert_eq!(stats.queued_tasks, 1);
    assert_eq!(stats.used_capacity, 8.0);

    // A's completion frees 6, which lets B in.
    assert_eq!(a.result().await.unwrap(), "a");
    let stats = scheduler.stats().await.unwrap();
    assert_eq!(stats.executing_tasks, 2);
    assert_eq!(stats.queued_tasks, 0);
    assert_eq!(stats.used_capacity, 8.0);

    assert_eq!(b.result().await.unwrap(), "b");
    assert_eq!(c.result().await.unwrap(), "c");

    let stats = scheduler.stats().await.unwrap();
    assert_eq!(stats.used_capacity, 0.0);
    assert_eq!(stats.used_concurrent, 0);
}

#[tokio::test(start_paused = true)]
async fn claim_strategy_holds_capacity_until_reset_rule_fires() {
    let options = SchedulerOptions {
        max_capacity: Some(10.0),
        capacity_strategy: Some(CapacityStrategy::Claim),
        release_rules: vec![ReleaseRule::reset_every(ms(100))],
        ..SchedulerOptions::default()
    };
    let scheduler = Scheduler::<&'static str>::new(options).unwrap();

    let t = scheduler
        .schedule_with_capacity(7.0, || async { Ok("t") })
        .await
        .unwrap();
    assert_eq!(t.result().await.unwrap(), "t");

    // Completion does not release claimed capacity.
    assert_eq!(scheduler.used_capacity().await.unwrap(), 7.0);

    let t2 = scheduler
        .schedule_with_capacity(5.0, || async { Ok("t2") })
        .await
        .unwrap();
    assert_eq!(scheduler.stats().await.unwrap().queued_tasks, 1);

    // The reset rule fires at t=100 and makes room.
    assert_eq!(t2.result().await.unwrap(), "t2");
    assert_eq!(scheduler.used_capacity().await.unwrap(), 5.0);
}

#[tokio::test(start_paused = true)]
async fn min_delay_spaces_out_dispatches() {
    let options = SchedulerOptions {
        max_capacity: Some(10.0),
        min_delay_between_tasks: Some(ms(100)),
        ..SchedulerOptions::default()
    };
    let scheduler = Scheduler::<()>::new(options).unwrap();
    let log = DispatchLog::new();

    let mut receipts = Vec::new();
    for label in ["t1", "t2", "t3"] {
        let log = log.clone();
        let receipt = scheduler
            .schedule(move || {
                log.record(label);
                async {
                    sleep(ms(500)).await;
                    Ok(())
                }
            })
            .await
            .unwrap();
        receipts.push(receipt);
    }

    for receipt in receipts {
        receipt.result().await.unwrap();
    }

    // All three overlap in execution, but their starts are 100ms apart.
    assert_eq!(log.entries(), vec![("t1", 0), ("t2", 100), ("t3", 200)]);
}

#[tokio::test(start_paused = true)]
async fn replace_by_priority_evicts_the_least_urgent_task() {
    let options = SchedulerOptions {
        max_capacity: Some(10.0),
        max_queue_size: Some(2),
        queue_size_exceeded_strategy: QueueSizeExceededStrategy::ReplaceByPriority,
        ..SchedulerOptions::default()
    };
    let scheduler = Scheduler::<()>::new(options).unwrap();
    let log = DispatchLog::new();

    let blocker = scheduler
        .schedule_with_capacity(10.0, || async {
            sleep(ms(100)).await;
            Ok(())
        })
        .await
        .unwrap();

    let schedule_logged = |label: &'static str, priority: u8| {
        let log = log.clone();
        let scheduler = scheduler.clone();
        async move {
            scheduler
                .schedule_task(TaskParams::with_capacity(2.0).priority(priority), move || {
                    log.record(label);
                    async { Ok(()) }
                })
                .await
                .unwrap()
        }
    };

    let low = schedule_logged("low", 9).await;
    let med = schedule_logged("med", 5).await;
    let high = schedule_logged("high", 1).await;

    // The queue was full; the strictly lower-priority task lost its place.
    assert!(matches!(
        low.result().await,
        Err(SchedulerError::QueueSizeExceeded)
    ));

    blocker.result().await.unwrap();
    high.result().await.unwrap();
    med.result().await.unwrap();
    assert_eq!(log.labels(), vec!["high", "med"]);
}

#[tokio::test(start_paused = true)]
async fn aged_task_jumps_ahead_of_higher_priorities() {
    let scheduler = Scheduler::<()>::new(with_max_capacity(10.0)).unwrap();
    let log = DispatchLog::new();

    let blocker = scheduler
        .schedule_with_capacity(10.0, || async {
            sleep(ms(60)).await;
            Ok(())
        })
        .await
        .unwrap();

    let aged_params = TaskParams {
        capacity: Some(5.0),
        priority: Some(9),
        queue_waiting_limit: Some(ms(50)),
        ..TaskParams::default()
    };
    let log_aged = log.clone();
    let aged = scheduler
        .schedule_task(aged_params, move || {
            log_aged.record("aged");
            async { Ok(()) }
        })
        .await
        .unwrap();

    let log_urgent = log.clone();
    let urgent = scheduler
        .schedule_task(TaskParams::with_capacity(5.0).priority(1), move || {
            log_urgent.record("urgent");
            async { Ok(()) }
        })
        .await
        .unwrap();

    blocker.result().await.unwrap();
    aged.result().await.unwrap();
    urgent.result().await.unwrap();

    // The priority-9 task's waiting limit elapsed at t=50, so at t=60 it
    // dispatches ahead of the younger priority-1 task.
    assert_eq!(log.labels(), vec!["aged", "urgent"]);
}

#[tokio::test(start_paused = true)]
async fn retry_runs_attempts_on_schedule_then_surfaces_original_error() {
    let scheduler = Scheduler::<()>::new(SchedulerOptions::default()).unwrap();
    let log = DispatchLog::new();

    let params = TaskParams {
        fail_recovery: Some(FailRecovery::Retry(RetryOptions {
            retries: 2,
            min_timeout: ms(50),
            max_timeout: None,
            factor: 1.0,
            randomize: false,
        })),
        ..TaskParams::default()
    };
    let log_cb = log.clone();
    let receipt = scheduler
        .schedule_task(params, move || {
            log_cb.record("attempt");
            async { Err("boom".into()) }
        })
        .await
        .unwrap();

    let error = receipt.result().await.unwrap_err();
    match error {
        SchedulerError::Failed(cause) => assert_eq!(cause.to_string(), "boom"),
        other => panic!("expected the original task error, got {other:?}"),
    }
    assert_eq!(
        log.entries(),
        vec![("attempt", 0), ("attempt", 50), ("attempt", 100)]
    );
}
