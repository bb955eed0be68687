use std::sync::Arc;
use std::time::Duration;

use perch_core::AppError;
use perch_core::bus::ChannelSubscriber;
use perch_core::models::RecordKind;
use perch_core::testutil::ScriptedTask;
use perch_core::traits::Subscriber;
use perch_core::watchdog::{Verdict, Watchdog};

use crate::integration::common::{TICK, bus, every, eventually, periodic};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dead_task_is_restarted_until_budget_then_watching_stops() {
    let script = ScriptedTask::failing(AppError::NetworkError("provider down".into()));
    let budget = TICK * 2;
    let watchdog = Watchdog::with_schedule(periodic(script.clone(), bus()), every(TICK), budget);

    let started = tokio::time::Instant::now();
    watchdog.start_watching().await.unwrap();

    assert!(
        eventually(Duration::from_secs(3), || watchdog.has_stopped_watching()).await,
        "watchdog should give up once the budget is spent"
    );
    assert!(started.elapsed() < budget + TICK * 2);
    assert!(watchdog.restarts() >= 1);
    assert!(script.runs() as u64 > watchdog.restarts());

    // No restarts after the deadline.
    let restarts = watchdog.restarts();
    tokio::time::sleep(TICK * 3).await;
    assert_eq!(watchdog.restarts(), restarts);
    assert_eq!(watchdog.tick().await.unwrap(), Verdict::Stopped);

    watchdog.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn healthy_task_is_left_alone_and_keeps_publishing() {
    let bus = bus();
    let (subscriber, mut rx) = ChannelSubscriber::new();
    let mut task = periodic(ScriptedTask::succeeding(), bus);
    task.subscribe(
        "results",
        RecordKind::Tweet,
        [Arc::new(subscriber) as Arc<dyn Subscriber>],
    )
    .unwrap();
    let first_task = task.id();
    let watchdog = Watchdog::with_schedule(task, every(Duration::from_millis(100)), Duration::from_secs(60));

    watchdog.start_watching().await.unwrap();
    for _ in 0..3 {
        let batch = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("batch within two seconds")
            .expect("channel open");
        assert_eq!(batch.len(RecordKind::Tweet), 1);
    }

    assert_eq!(watchdog.restarts(), 0);
    assert_eq!(watchdog.task_id().await, first_task);
    assert!(!watchdog.has_stopped_watching());
    watchdog.shutdown().await;
    assert!(watchdog.has_stopped_watching());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replacement_keeps_publishing_to_results_channel() {
    let (subscriber, mut rx) = ChannelSubscriber::new();
    let script = ScriptedTask::dying_after(1);
    let mut task = periodic(script.clone(), bus());
    task.subscribe(
        "results",
        RecordKind::Tweet,
        [Arc::new(subscriber) as Arc<dyn Subscriber>],
    )
    .unwrap();
    let first_task = task.id();
    let watchdog = Watchdog::with_schedule(task, every(Duration::from_millis(100)), Duration::from_secs(60));

    watchdog.start_watching().await.unwrap();
    let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("first instance publishes")
        .expect("channel open");
    assert!(!first.is_empty());

    assert!(eventually(Duration::from_secs(3), || watchdog.restarts() >= 1).await);
    assert_ne!(watchdog.task_id().await, first_task);

    let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("replacement publishes on the carried-over channel")
        .expect("channel open");
    assert!(!second.is_empty());
    assert!(script.replacements() >= 1);
    watchdog.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn healthy_task_recycled_by_consumer_stops_at_budget() {
    let script = ScriptedTask::succeeding();
    let budget = Duration::from_millis(200);
    let watchdog = Watchdog::with_schedule(
        periodic(script.clone(), bus()),
        every(Duration::from_millis(50)),
        budget,
    );
    let started = tokio::time::Instant::now();
    watchdog.start_watching().await.unwrap();

    // A consumer ending each run, as a full results file does.
    let deadline = started + Duration::from_secs(3);
    while !watchdog.has_stopped_watching() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
        watchdog.recycle().await;
    }

    assert!(watchdog.has_stopped_watching(), "budget must end a healthy collection");
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(watchdog.restarts() >= 1);
    assert!(script.replacements() as u64 >= watchdog.restarts());
    watchdog.shutdown().await;
}

#[tokio::test]
async fn stop_watching_twice_equals_once() {
    let watchdog = Watchdog::with_schedule(
        periodic(ScriptedTask::succeeding(), bus()),
        every(TICK),
        Duration::from_secs(60),
    );
    watchdog.start_watching().await.unwrap();

    watchdog.stop_watching();
    assert!(watchdog.has_stopped_watching());
    watchdog.stop_watching();
    assert!(watchdog.has_stopped_watching());

    assert_eq!(watchdog.tick().await.unwrap(), Verdict::Stopped);
    watchdog.shutdown().await;
}

#[tokio::test]
async fn tick_while_task_alive_is_prompt() {
    let watchdog = Watchdog::with_schedule(
        periodic(ScriptedTask::succeeding().with_delay(Duration::from_secs(10)), bus()),
        every(Duration::from_secs(3600)),
        Duration::from_secs(60),
    );
    watchdog.start_watching().await.unwrap();

    let verdict = tokio::time::timeout(Duration::from_millis(100), watchdog.tick())
        .await
        .expect("tick must not wait on the task's work")
        .unwrap();
    assert_eq!(verdict, Verdict::Alive);
    watchdog.shutdown().await;
}
