//! One collection cycle against the provider, and the periodic task that
//! runs it.
//!
//! Search pages and author lookups go through two independent circuit
//! breakers. A failing page ends pagination but keeps what was already
//! collected; a failing lookup degrades that record's author name to
//! `"n/a"`. Only a search rejected before anything was retrieved fails the
//! cycle as a whole.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;

use crate::circuit_breaker::CircuitBreaker;
use crate::config::Settings;
use crate::entities::{extract_mentions, extract_urls, humanize_handle};
use crate::error::AppError;
use crate::keywords::KeywordSource;
use crate::models::{
    AuthorProfile, ExtractedRecord, NOT_AVAILABLE, RawPost, RecordKind, ResultBatch, SearchQuery,
};
use crate::task::Task;
use crate::traits::{Provider, Search};

pub use crate::keywords::DEFAULT_KEYWORDS;

/// Results requested per provider page.
pub const PAGE_SIZE: usize = 100;

/// Author name used when the provider confirms there is no profile.
pub const NO_PROFILE: &str = "none";

static LINE_BREAKS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\r\n]+").expect("valid line break regex"));

/// `"k1" OR "k2" OR (k1 AND k2)`, restricted to `lang`.
pub fn build_query(keywords: &BTreeSet<String>, lang: &str, count: usize) -> SearchQuery {
    let any_phrase = keywords
        .iter()
        .map(|k| format!("\"{k}\""))
        .collect::<Vec<_>>()
        .join(" OR ");
    let all_terms = keywords.iter().map(String::as_str).collect::<Vec<_>>().join(" AND ");

    SearchQuery {
        text: format!("{any_phrase} OR ({all_terms})"),
        lang: lang.to_string(),
        count,
    }
}

/// Keywords occurring in `text` (case-insensitive), joined by `", "`.
pub fn keyword_hint(text: &str, keywords: &BTreeSet<String>) -> String {
    let haystack = text.to_lowercase();
    keywords
        .iter()
        .filter(|k| haystack.contains(&k.to_lowercase()))
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

fn normalize_line_breaks(text: &str) -> String {
    LINE_BREAKS.replace_all(text, " ").into_owned()
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Tagged place, else free-text location, else `"n/a"`.
fn last_seen(post: &RawPost) -> String {
    non_empty(&post.place)
        .or_else(|| non_empty(&post.location))
        .unwrap_or(NOT_AVAILABLE)
        .to_string()
}

fn display_name(profile: &AuthorProfile) -> String {
    match (non_empty(&profile.name), non_empty(&profile.screen_name)) {
        (Some(name), _) => humanize_handle(name),
        (None, Some(screen_name)) => humanize_handle(screen_name),
        (None, None) => NOT_AVAILABLE.to_string(),
    }
}

/// [`Search`] over a [`Provider`], guarded by a search breaker and a
/// lookup breaker.
#[derive(Clone)]
pub struct PeriodicSearch<P> {
    provider: P,
    search_breaker: CircuitBreaker,
    lookup_breaker: CircuitBreaker,
    language: String,
    max_pages: u32,
    lookup_attempts: u32,
}

impl<P: Provider + 'static> PeriodicSearch<P> {
    pub fn new(provider: P, settings: &Settings) -> Self {
        Self {
            provider,
            search_breaker: CircuitBreaker::new("search", settings.search_breaker.clone()),
            lookup_breaker: CircuitBreaker::new("lookup", settings.lookup_breaker.clone()),
            language: settings.language.clone(),
            max_pages: settings.max_pages.max(1),
            lookup_attempts: settings.lookup_attempts.max(1),
        }
    }

    pub fn search_breaker(&self) -> &CircuitBreaker {
        &self.search_breaker
    }

    pub fn lookup_breaker(&self) -> &CircuitBreaker {
        &self.lookup_breaker
    }

    async fn fetch_page(&self, query: &SearchQuery, page: u32) -> Result<Vec<RawPost>, AppError> {
        let result = self
            .search_breaker
            .call(|| self.provider.search_page(query, page))
            .await
            .map_err(AppError::from);

        if let Err(e) = &result {
            if e.is_rejection() {
                let stats = self.search_breaker.stats();
                tracing::warn!(
                    circuit = %stats.name,
                    blocked = stats.blocked_count,
                    retry_in_secs = stats.time_until_half_open.map(|d| d.as_secs()),
                    "Search rejected by open circuit"
                );
            } else {
                tracing::warn!(page, error = %e, "Search page failed");
            }
        }
        result
    }

    /// Pages until `limit` unique posts are collected, a page is empty or
    /// adds nothing new, a page fails, or `max_pages` is reached.
    async fn collect_posts(&self, query: &SearchQuery, limit: usize) -> Result<Vec<RawPost>, AppError> {
        let mut seen: HashSet<u64> = HashSet::new();
        let mut posts: Vec<RawPost> = Vec::new();

        for page in 1..=self.max_pages {
            if posts.len() >= limit {
                break;
            }
            let fetched = match self.fetch_page(query, page).await {
                Ok(fetched) => fetched,
                Err(e) if e.is_rejection() && posts.is_empty() => return Err(e),
                Err(_) => break,
            };
            if fetched.is_empty() {
                break;
            }

            let before = posts.len();
            for post in fetched {
                if posts.len() >= limit {
                    break;
                }
                if seen.insert(post.id) {
                    posts.push(post);
                }
            }
            if posts.len() == before {
                break;
            }
        }
        Ok(posts)
    }

    /// Display name for `author_id`.
    ///
    /// Retries transient failures up to the configured attempts. An open
    /// lookup circuit or a permanent failure ends the attempts immediately.
    async fn author_name(&self, author_id: u64) -> Result<String, AppError> {
        for attempt in 1..=self.lookup_attempts {
            let result = self
                .lookup_breaker
                .call(|| self.provider.lookup_author(author_id))
                .await
                .map_err(AppError::from);

            match result {
                Ok(Some(profile)) => return Ok(display_name(&profile)),
                Ok(None) => return Ok(NO_PROFILE.to_string()),
                Err(e) if e.is_rejection() => {
                    tracing::debug!(author_id, "Lookup rejected by open circuit");
                    break;
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(author_id, attempt, error = %e, "Author lookup failed");
                }
                Err(e) => {
                    tracing::warn!(author_id, error = %e, "Author lookup failed permanently");
                    break;
                }
            }
        }
        Err(AppError::LookupUnavailable(author_id))
    }

    async fn compile(
        &self,
        post: &RawPost,
        keywords: &BTreeSet<String>,
        names: &mut HashMap<u64, String>,
    ) -> ExtractedRecord {
        let message = normalize_line_breaks(&post.text);
        let author_name = match names.get(&post.author_id) {
            Some(name) => name.clone(),
            None => {
                let name = self.author_name(post.author_id).await.unwrap_or_else(|e| {
                    tracing::debug!(error = %e, "Author name left unknown");
                    NOT_AVAILABLE.to_string()
                });
                names.insert(post.author_id, name.clone());
                name
            }
        };

        ExtractedRecord::builder(post.id, post.author_id, post.author_screen_name.as_str())
            .urls(extract_urls(&message))
            .mentions(extract_mentions(&message))
            .hint(keyword_hint(&message, keywords))
            .last_seen(last_seen(post))
            .author_name(author_name)
            .created_at(post.created_at)
            .message(message)
            .build()
    }
}

impl<P: Provider + 'static> Search for PeriodicSearch<P> {
    async fn search(&self, limit: usize, keywords: &BTreeSet<String>) -> Result<ResultBatch, AppError> {
        let mut batch = ResultBatch::empty_tweets();
        if limit == 0 || keywords.is_empty() {
            return Ok(batch);
        }

        let query = build_query(keywords, &self.language, limit.min(PAGE_SIZE));
        let posts = self.collect_posts(&query, limit).await?;

        let mut names = HashMap::new();
        for post in &posts {
            let record = self.compile(post, keywords, &mut names).await;
            batch.put(RecordKind::Tweet, record);
        }

        tracing::debug!(
            query = %query.text,
            posts = posts.len(),
            authors = names.len(),
            "Search cycle compiled"
        );
        Ok(batch)
    }
}

/// Periodic unit of work: sample keywords, search, hand back the batch.
#[derive(Clone)]
pub struct CollectionTask<S> {
    search: S,
    keywords: KeywordSource,
    sample_size: usize,
    max_records: usize,
}

impl<S: Search> CollectionTask<S> {
    pub fn new(search: S, keywords: KeywordSource, settings: &Settings) -> Self {
        Self {
            search,
            keywords,
            sample_size: settings.sample_size,
            max_records: settings.max_records,
        }
    }

    pub fn search(&self) -> &S {
        &self.search
    }
}

impl<S: Search> Task for CollectionTask<S> {
    async fn run(&self) -> Result<ResultBatch, AppError> {
        let keywords = self.keywords.sample(self.sample_size);
        tracing::debug!(?keywords, "Collection cycle starting");

        let batch = self.search.search(self.max_records, &keywords).await?;
        tracing::info!(
            records = batch.len(RecordKind::Tweet),
            "Collection cycle finished"
        );
        Ok(batch)
    }

    fn spawn_replacement(&self) -> Self {
        self.clone()
    }
}
