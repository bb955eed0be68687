use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Placeholder for a value the provider could not supply.
pub const NOT_AVAILABLE: &str = "n/a";

/// Kind of record a [`ResultBatch`] can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Tweet,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::Tweet => write!(f, "tweet"),
        }
    }
}

/// One collected message, enriched with extracted entities.
///
/// Built exclusively through [`ExtractedRecordBuilder`]; immutable afterwards.
/// Identity is the provider's post id: two records are equal when they
/// describe the same post, whatever their content.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractedRecord {
    id: u64,
    author_id: u64,
    author: String,
    /// Best-effort display name, `"n/a"` when unknown.
    author_name: String,
    message: String,
    created_at: DateTime<Utc>,
    last_seen: String,
    urls: BTreeSet<String>,
    mentions: BTreeSet<String>,
    hint: String,
}

impl ExtractedRecord {
    pub fn builder(id: u64, author_id: u64, author: impl Into<String>) -> ExtractedRecordBuilder {
        ExtractedRecordBuilder::new(id, author_id, author)
    }

    /// Provider post id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn author_id(&self) -> u64 {
        self.author_id
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn author_name(&self) -> &str {
        &self.author_name
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_seen(&self) -> &str {
        &self.last_seen
    }

    pub fn urls(&self) -> &BTreeSet<String> {
        &self.urls
    }

    pub fn mentions(&self) -> &BTreeSet<String> {
        &self.mentions
    }

    pub fn hint(&self) -> &str {
        &self.hint
    }
}

impl PartialEq for ExtractedRecord {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ExtractedRecord {}

impl Hash for ExtractedRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for ExtractedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, {}): {}",
            self.author, self.author_name, self.last_seen, self.message
        )
    }
}

#[derive(Debug, Clone)]
pub struct ExtractedRecordBuilder {
    record: ExtractedRecord,
}

impl ExtractedRecordBuilder {
    fn new(id: u64, author_id: u64, author: impl Into<String>) -> Self {
        Self {
            record: ExtractedRecord {
                id,
                author_id,
                author: author.into(),
                author_name: NOT_AVAILABLE.to_string(),
                message: String::new(),
                created_at: Utc::now(),
                last_seen: NOT_AVAILABLE.to_string(),
                urls: BTreeSet::new(),
                mentions: BTreeSet::new(),
                hint: String::new(),
            },
        }
    }

    pub fn author_name(mut self, name: impl Into<String>) -> Self {
        self.record.author_name = name.into();
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.record.message = message.into();
        self
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.record.created_at = created_at;
        self
    }

    pub fn last_seen(mut self, location: impl Into<String>) -> Self {
        self.record.last_seen = location.into();
        self
    }

    pub fn urls<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.record.urls = urls.into_iter().map(Into::into).collect();
        self
    }

    pub fn mentions<I, S>(mut self, mentions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.record.mentions = mentions.into_iter().map(Into::into).collect();
        self
    }

    pub fn hint(mut self, hint: impl Into<String>) -> Self {
        self.record.hint = hint.into();
        self
    }

    pub fn build(self) -> ExtractedRecord {
        self.record
    }
}

/// Deduplicated, insertion-ordered records produced by one collection cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResultBatch {
    records: BTreeMap<RecordKind, Vec<ExtractedRecord>>,
}

impl ResultBatch {
    /// An empty batch seeded for `kind`.
    pub fn empty(kind: RecordKind) -> Self {
        let mut records = BTreeMap::new();
        records.insert(kind, Vec::new());
        Self { records }
    }

    pub fn empty_tweets() -> Self {
        Self::empty(RecordKind::Tweet)
    }

    /// Adds `record` unless a record for the same post is already present.
    pub fn put(&mut self, kind: RecordKind, record: ExtractedRecord) -> &mut Self {
        let entries = self.records.entry(kind).or_default();
        if !entries.contains(&record) {
            entries.push(record);
        }
        self
    }

    pub fn put_all<I>(&mut self, kind: RecordKind, records: I) -> &mut Self
    where
        I: IntoIterator<Item = ExtractedRecord>,
    {
        for record in records {
            self.put(kind, record);
        }
        self
    }

    /// Snapshot of the records stored under `kind`.
    pub fn get(&self, kind: RecordKind) -> Vec<ExtractedRecord> {
        self.records.get(&kind).cloned().unwrap_or_default()
    }

    pub fn iter(&self, kind: RecordKind) -> impl Iterator<Item = &ExtractedRecord> {
        self.records.get(&kind).into_iter().flatten()
    }

    pub fn len(&self, kind: RecordKind) -> usize {
        self.records.get(&kind).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.records.values().all(Vec::is_empty)
    }

    pub fn kinds(&self) -> impl Iterator<Item = RecordKind> + '_ {
        self.records.keys().copied()
    }
}

/// A message as returned by the provider, before enrichment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPost {
    pub id: u64,
    pub author_id: u64,
    pub author_screen_name: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    /// Name of the tagged place, if any.
    #[serde(default)]
    pub place: Option<String>,
    /// Free-text profile location, if any.
    #[serde(default)]
    pub location: Option<String>,
}

/// Public profile fields used to derive a display name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorProfile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub screen_name: Option<String>,
}

/// One provider search request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub text: String,
    pub lang: String,
    /// Results requested per page.
    pub count: usize,
}
