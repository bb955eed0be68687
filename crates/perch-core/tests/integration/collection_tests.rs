use std::sync::Arc;
use std::time::Duration;

use perch_core::bus::ChannelSubscriber;
use perch_core::circuit_breaker::{CircuitBreakerConfig, CircuitState};
use perch_core::keywords::KeywordSource;
use perch_core::models::RecordKind;
use perch_core::testutil::{MockProvider, raw_post};
use perch_core::traits::Subscriber;
use perch_core::watchdog::Watchdog;
use perch_core::{AppError, CollectionTask, PeriodicSearch, Settings};

use crate::integration::common::{TICK, bus, every, eventually, periodic};

fn strict_settings() -> Settings {
    let tight = CircuitBreakerConfig {
        failure_threshold: 1,
        retry_cooldown: Duration::from_secs(3600),
    };
    Settings {
        max_records: 10,
        sample_size: 1,
        search_breaker: tight.clone(),
        lookup_breaker: tight,
        ..Settings::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn collected_batch_reaches_results_subscriber() {
    let provider = MockProvider::with_pages(vec![Ok(vec![
        raw_post(1, 20, "amy_pond", "I'm 15 and\nbored @rory https://example.com/tardis"),
        raw_post(2, 20, "amy_pond", "still I'M 15 #raggedy"),
    ])])
    .with_named_author(20, "AmeliaPond", "amy_pond");

    let settings = Settings {
        max_records: 10,
        sample_size: 1,
        ..Settings::default()
    };
    let search = PeriodicSearch::new(provider.clone(), &settings);
    let task = CollectionTask::new(search, KeywordSource::new(["I'm 15"]), &settings);

    let (subscriber, mut rx) = ChannelSubscriber::new();
    let mut periodic = periodic(task, bus());
    periodic
        .subscribe("results", RecordKind::Tweet, [Arc::new(subscriber) as Arc<dyn Subscriber>])
        .unwrap();
    periodic.start().unwrap();

    let batch = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("first cycle publishes")
        .expect("channel open");
    let records = batch.get(RecordKind::Tweet);
    assert_eq!(records.len(), 2);

    let first = records
        .iter()
        .find(|r| r.message().contains("bored"))
        .expect("first post compiled");
    assert_eq!(first.author(), "amy_pond");
    assert_eq!(first.author_name(), "Amelia");
    assert_eq!(first.message(), "I'm 15 and bored @rory https://example.com/tardis");
    assert!(first.mentions().contains("rory"));
    assert!(first.urls().contains("https://example.com/tardis"));
    assert_eq!(first.hint(), "I'm 15");

    // One lookup serves both posts of the same author.
    assert_eq!(provider.lookups_for(20), 1);
    periodic.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn provider_outage_is_contained_by_breaker_and_watchdog() {
    let provider = MockProvider::with_pages(vec![Err(AppError::NetworkError(
        "connection reset".into(),
    ))]);
    let settings = strict_settings();
    let search = PeriodicSearch::new(provider.clone(), &settings);
    let breaker = search.search_breaker().clone();
    let task = CollectionTask::new(search, KeywordSource::new(["I'm 16"]), &settings);

    let budget = TICK * 2;
    let watchdog = Watchdog::with_schedule(
        periodic(task, bus()),
        every(Duration::from_millis(100)),
        budget,
    );
    watchdog.start_watching().await.unwrap();

    assert!(
        eventually(Duration::from_secs(3), || watchdog.has_stopped_watching()).await,
        "watchdog should stop once the budget is spent"
    );
    assert!(watchdog.restarts() >= 1);

    // Only the first call reached the provider; everything after was rejected.
    assert_eq!(provider.search_call_count(), 1);
    assert_eq!(breaker.status(), CircuitState::Open);
    assert!(breaker.blocked_count() >= 1);
    watchdog.shutdown().await;
}
