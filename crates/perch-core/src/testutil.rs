//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit and integration
//! tests. All mocks use `Arc<Mutex<_>>` or atomics for interior
//! mutability, allowing test assertions on recorded calls.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::AppError;
use crate::models::{AuthorProfile, ExtractedRecord, RawPost, RecordKind, ResultBatch, SearchQuery};
use crate::task::Task;
use crate::traits::{Provider, Subscriber};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A provider post with fixed timestamp and no location.
pub fn raw_post(id: u64, author_id: u64, screen_name: &str, text: &str) -> RawPost {
    RawPost {
        id,
        author_id,
        author_screen_name: screen_name.to_string(),
        text: text.to_string(),
        created_at: DateTime::<Utc>::UNIX_EPOCH,
        place: None,
        location: None,
    }
}

// ---------------------------------------------------------------------------
// MockProvider
// ---------------------------------------------------------------------------

/// Mock provider replaying scripted pages and profile lookups.
#[derive(Clone, Default)]
pub struct MockProvider {
    /// Each `search_page` call pops the first element; empty pages once drained.
    pages: Arc<Mutex<VecDeque<Result<Vec<RawPost>, AppError>>>>,
    /// Per-author lookup responses; `Ok(None)` once drained.
    profiles: Arc<Mutex<HashMap<u64, VecDeque<Result<Option<AuthorProfile>, AppError>>>>>,
    pub search_calls: Arc<Mutex<Vec<(SearchQuery, u32)>>>,
    pub lookup_calls: Arc<Mutex<Vec<u64>>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pages(pages: Vec<Result<Vec<RawPost>, AppError>>) -> Self {
        let provider = Self::default();
        *lock(&provider.pages) = pages.into();
        provider
    }

    /// Queues a lookup response for `author_id`.
    pub fn with_profile(self, author_id: u64, response: Result<Option<AuthorProfile>, AppError>) -> Self {
        lock(&self.profiles)
            .entry(author_id)
            .or_default()
            .push_back(response);
        self
    }

    /// Queues a successful lookup returning `name` and `screen_name`.
    pub fn with_named_author(self, author_id: u64, name: &str, screen_name: &str) -> Self {
        self.with_profile(
            author_id,
            Ok(Some(AuthorProfile {
                name: Some(name.to_string()),
                screen_name: Some(screen_name.to_string()),
            })),
        )
    }

    pub fn search_call_count(&self) -> usize {
        lock(&self.search_calls).len()
    }

    pub fn lookups_for(&self, author_id: u64) -> usize {
        lock(&self.lookup_calls)
            .iter()
            .filter(|id| **id == author_id)
            .count()
    }
}

impl Provider for MockProvider {
    async fn search_page(&self, query: &SearchQuery, page: u32) -> Result<Vec<RawPost>, AppError> {
        lock(&self.search_calls).push((query.clone(), page));
        lock(&self.pages).pop_front().unwrap_or(Ok(Vec::new()))
    }

    async fn lookup_author(&self, author_id: u64) -> Result<Option<AuthorProfile>, AppError> {
        lock(&self.lookup_calls).push(author_id);
        lock(&self.profiles)
            .get_mut(&author_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(None))
    }
}

// ---------------------------------------------------------------------------
// RecordingSubscriber
// ---------------------------------------------------------------------------

/// Subscriber that keeps every batch it receives.
#[derive(Clone, Default)]
pub struct RecordingSubscriber {
    received: Arc<Mutex<Vec<(String, Arc<ResultBatch>)>>>,
}

impl RecordingSubscriber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<Arc<ResultBatch>> {
        lock(&self.received)
            .iter()
            .map(|(_, batch)| Arc::clone(batch))
            .collect()
    }

    pub fn channels(&self) -> Vec<String> {
        lock(&self.received)
            .iter()
            .map(|(channel, _)| channel.clone())
            .collect()
    }
}

impl Subscriber for RecordingSubscriber {
    fn on_event(&self, channel: &str, batch: Arc<ResultBatch>) {
        lock(&self.received).push((channel.to_string(), batch));
    }
}

// ---------------------------------------------------------------------------
// ScriptedTask
// ---------------------------------------------------------------------------

/// Task with a fixed outcome that counts its runs.
///
/// Replacements share the counters, so a test can observe work done
/// across restarts.
#[derive(Clone)]
pub struct ScriptedTask {
    outcome: Result<(), AppError>,
    /// Successful runs allowed per instance before failing.
    lifespan: Option<usize>,
    instance_runs: Arc<AtomicUsize>,
    delay: Option<Duration>,
    runs: Arc<AtomicUsize>,
    completed: Arc<AtomicUsize>,
    replacements: Arc<AtomicUsize>,
}

impl ScriptedTask {
    /// Every run yields a one-record batch.
    pub fn succeeding() -> Self {
        Self::with_outcome(Ok(()))
    }

    /// Every run fails with `error`.
    pub fn failing(error: AppError) -> Self {
        Self::with_outcome(Err(error))
    }

    /// Each instance succeeds `runs` times, then fails. Replacements start
    /// with a fresh allowance.
    pub fn dying_after(runs: usize) -> Self {
        let mut task = Self::succeeding();
        task.lifespan = Some(runs);
        task
    }

    fn with_outcome(outcome: Result<(), AppError>) -> Self {
        Self {
            outcome,
            lifespan: None,
            instance_runs: Arc::new(AtomicUsize::new(0)),
            delay: None,
            runs: Arc::new(AtomicUsize::new(0)),
            completed: Arc::new(AtomicUsize::new(0)),
            replacements: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Makes each run sleep before producing its outcome.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Runs started.
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Runs that reached their outcome.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn replacements(&self) -> usize {
        self.replacements.load(Ordering::SeqCst)
    }
}

impl Task for ScriptedTask {
    async fn run(&self) -> Result<ResultBatch, AppError> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst) as u64;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.completed.fetch_add(1, Ordering::SeqCst);

        self.outcome.clone()?;
        let lived = self.instance_runs.fetch_add(1, Ordering::SeqCst);
        if self.lifespan.is_some_and(|lifespan| lived >= lifespan) {
            return Err(AppError::Generic("scripted task expired".to_string()));
        }
        let mut batch = ResultBatch::empty_tweets();
        batch.put(
            RecordKind::Tweet,
            ExtractedRecord::builder(run, run, format!("author{run}"))
                .message(format!("run {run}"))
                .build(),
        );
        Ok(batch)
    }

    fn spawn_replacement(&self) -> Self {
        self.replacements.fetch_add(1, Ordering::SeqCst);
        Self {
            instance_runs: Arc::new(AtomicUsize::new(0)),
            ..self.clone()
        }
    }
}
