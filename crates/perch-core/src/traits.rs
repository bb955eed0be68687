use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use crate::error::AppError;
use crate::models::{AuthorProfile, RawPost, RecordKind, ResultBatch, SearchQuery};

/// Binding to the external, rate-limited data provider.
pub trait Provider: Send + Sync + Clone {
    /// Fetches one page (1-based) of results for `query`.
    fn search_page(
        &self,
        query: &SearchQuery,
        page: u32,
    ) -> impl Future<Output = Result<Vec<RawPost>, AppError>> + Send;

    /// Looks up the public profile of an author.
    ///
    /// `Ok(None)` means the provider confirmed there is no profile to show.
    fn lookup_author(
        &self,
        author_id: u64,
    ) -> impl Future<Output = Result<Option<AuthorProfile>, AppError>> + Send;
}

/// One collection cycle: keywords in, enriched records out.
pub trait Search: Send + Sync + Clone + 'static {
    /// Collects at most `limit` records matching `keywords`.
    ///
    /// Provider failures degrade the batch rather than failing the call;
    /// an `Err` means the search circuit rejected the cycle before
    /// anything could be retrieved.
    fn search(
        &self,
        limit: usize,
        keywords: &BTreeSet<String>,
    ) -> impl Future<Output = Result<ResultBatch, AppError>> + Send;
}

/// Consumer of published result batches.
pub trait Subscriber: Send + Sync {
    fn on_event(&self, channel: &str, batch: Arc<ResultBatch>);
}

/// Publish/subscribe hub used to hand batches to writers.
pub trait EventBus: Send + Sync {
    /// Delivers `batch` to every subscriber of `channel` whose record kind
    /// the batch carries. Returns the number of deliveries.
    fn publish(&self, channel: &str, batch: Arc<ResultBatch>) -> usize;

    fn subscribe(
        &self,
        channel: &str,
        kind: RecordKind,
        subscriber: Arc<dyn Subscriber>,
    ) -> Result<(), AppError>;
}
