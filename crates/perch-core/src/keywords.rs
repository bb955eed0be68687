//! Keyword pool loaded from a file and sampled per collection tick.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use rand::Rng;

use crate::error::AppError;

/// Search terms used when no keyword file is available.
pub const DEFAULT_KEYWORDS: [&str; 5] = ["I'm 14", "I'm 15", "I'm 16", "I'm 17", "I'm 18"];

/// Pool of search terms sampled on every collection tick.
#[derive(Debug, Clone, Default)]
pub struct KeywordSource {
    keywords: Arc<Vec<String>>,
}

impl KeywordSource {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = BTreeSet::new();
        let keywords = keywords
            .into_iter()
            .map(Into::into)
            .map(|k: String| k.trim().to_string())
            .filter(|k| !k.is_empty() && seen.insert(k.clone()))
            .collect();
        Self {
            keywords: Arc::new(keywords),
        }
    }

    /// Parses one keyword per line; blank lines and `#` comments are skipped.
    pub fn parse(contents: &str) -> Self {
        Self::new(
            contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.starts_with('#')),
        )
    }

    /// Loads keywords from `path`. A missing file yields an empty source.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let source = Self::parse(&contents);
                tracing::info!(path = %path.display(), keywords = source.len(), "Keywords loaded");
                Ok(source)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "Keyword file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(AppError::IoError(format!(
                "Failed to read keyword file {}: {e}",
                path.display()
            ))),
        }
    }

    pub fn len(&self) -> usize {
        self.keywords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    /// A random subset of up to `size` keywords, or the default terms when
    /// the pool is empty.
    pub fn sample(&self, size: usize) -> BTreeSet<String> {
        if self.keywords.is_empty() {
            return DEFAULT_KEYWORDS.iter().map(|k| k.to_string()).collect();
        }
        sample_floyd(&self.keywords, size, &mut rand::rng())
            .into_iter()
            .cloned()
            .collect()
    }
}

/// Draws `m` distinct items from `items` with Floyd's algorithm.
///
/// Asking for more items than exist returns all of them.
pub fn sample_floyd<'a, T, R>(items: &'a [T], m: usize, rng: &mut R) -> Vec<&'a T>
where
    R: Rng + ?Sized,
{
    let n = items.len();
    let m = m.min(n);
    let mut chosen: BTreeSet<usize> = BTreeSet::new();

    for i in (n - m)..n {
        let pos = rng.random_range(0..=i);
        if !chosen.insert(pos) {
            chosen.insert(i);
        }
    }

    chosen.into_iter().map(|i| &items[i]).collect()
}
