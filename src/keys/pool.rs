//! Credential pool with round-robin-with-skip selection.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use super::errors::KeyPoolError;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default sliding window for the per-credential rate limit.
const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Default number of uses allowed inside the window.
const DEFAULT_MAX_USES: u32 = 100;

// ─── Rate Limit ──────────────────────────────────────────────────────────────

/// Sliding-window rate limit applied to every credential in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    /// Length of the trailing window.
    pub window: Duration,
    /// A credential with this many uses inside the window is rate-limited.
    pub max_uses: u32,
}

impl RateLimit {
    pub fn new(window: Duration, max_uses: u32) -> Self {
        Self { window, max_uses }
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            max_uses: DEFAULT_MAX_USES,
        }
    }
}

// ─── Credential ──────────────────────────────────────────────────────────────

/// One API credential and its usage record.
#[derive(Clone)]
pub struct Credential {
    name: String,
    value: String,
    /// Non-decreasing; appended on every reported usage.
    usage_timestamps: Vec<DateTime<Utc>>,
    usage_count: u64,
}

impl Credential {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            usage_timestamps: Vec::new(),
            usage_count: 0,
        }
    }

    /// The configuration name, e.g. `API_KEY_1`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The secret value.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Total number of reported usages over the process lifetime.
    pub fn usage_count(&self) -> u64 {
        self.usage_count
    }

    pub fn usage_timestamps(&self) -> &[DateTime<Utc>] {
        &self.usage_timestamps
    }

    /// Append a usage at `now`.
    ///
    /// A clock that stepped backwards is clamped to the last recorded
    /// timestamp so the list stays non-decreasing.
    fn record_usage(&mut self, now: DateTime<Utc>) {
        let at = match self.usage_timestamps.last() {
            Some(last) if *last > now => *last,
            _ => now,
        };
        self.usage_timestamps.push(at);
        self.usage_count += 1;
    }

    /// Drop usages older than `now - window`. `usage_count` is unaffected.
    fn prune_expired(&mut self, window: Duration, now: DateTime<Utc>) {
        if let Some(cutoff) = window_cutoff(window, now) {
            let first_recent = self.usage_timestamps.partition_point(|t| *t < cutoff);
            self.usage_timestamps.drain(..first_recent);
        }
    }

    /// Number of usages at or after `now - window`.
    fn recent_uses(&self, window: Duration, now: DateTime<Utc>) -> usize {
        match window_cutoff(window, now) {
            Some(cutoff) => {
                // Timestamps are sorted, so everything from the first
                // in-window entry onward counts.
                let first_recent = self.usage_timestamps.partition_point(|t| *t < cutoff);
                self.usage_timestamps.len() - first_recent
            }
            // Window reaches past the representable range: every use counts.
            None => self.usage_timestamps.len(),
        }
    }

    fn is_rate_limited(&self, limit: RateLimit, now: DateTime<Utc>) -> bool {
        self.recent_uses(limit.window, now) >= limit.max_uses as usize
    }
}

/// Start of the window ending at `now`. `None` when the window reaches past
/// the representable range.
fn window_cutoff(window: Duration, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    TimeDelta::from_std(window)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("name", &self.name)
            .field("value", &"<redacted>")
            .field("usage_count", &self.usage_count)
            .finish()
    }
}

// ─── Usage Statistics ────────────────────────────────────────────────────────

/// Which credentials to report usage for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsageSelector {
    /// Every credential, in pool order.
    All,
    /// One credential by configuration name.
    Named(String),
    /// One credential by ordinal position in pool order.
    Index(usize),
}

/// Usage counts returned by [`KeyPool::usage_statistics`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsageStatistics {
    /// `(name, usage_count)` for every credential, in pool order.
    All(Vec<(String, u64)>),
    /// Usage count of a single credential.
    Single(u64),
}

// ─── KeyPool ─────────────────────────────────────────────────────────────────

/// The set of credentials plus a rotation cursor.
///
/// Invariant: when the pool is non-empty, `cursor < credentials.len()`.
#[derive(Debug, Clone, Default)]
pub struct KeyPool {
    credentials: Vec<Credential>,
    cursor: usize,
}

impl KeyPool {
    /// Build a pool from credentials in iteration order.
    pub fn new(credentials: Vec<Credential>) -> Self {
        Self {
            credentials,
            cursor: 0,
        }
    }

    /// Build a pool from `(name, value)` pairs.
    pub fn from_pairs<I, N, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (N, V)>,
        N: Into<String>,
        V: Into<String>,
    {
        Self::new(
            pairs
                .into_iter()
                .map(|(name, value)| Credential::new(name, value))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// Current rotation cursor.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn credentials(&self) -> &[Credential] {
        &self.credentials
    }

    /// Credential names in pool order.
    pub fn key_names(&self) -> Vec<String> {
        self.credentials.iter().map(|c| c.name.clone()).collect()
    }

    /// Name of the credential under the cursor.
    pub fn current_key_name(&self) -> Option<&str> {
        self.credentials.get(self.cursor).map(|c| c.name.as_str())
    }

    /// Name of the credential holding `value`, for logging without the secret.
    pub fn name_for_value(&self, value: &str) -> Option<&str> {
        self.credentials
            .iter()
            .find(|c| c.value == value)
            .map(|c| c.name.as_str())
    }

    // ─── Selection ───────────────────────────────────────────────────────

    /// Select a usable credential value.
    ///
    /// Returns the credential under the cursor if it is within its limit.
    /// Otherwise rotates forward (wrapping), skipping limited entries, and
    /// fails with `AllKeysRateLimited` once the cursor is back where it
    /// started.
    pub fn select(&mut self, limit: RateLimit) -> Result<String, KeyPoolError> {
        self.select_at(limit, Utc::now())
    }

    /// [`select`](Self::select) evaluated at an explicit instant.
    pub fn select_at(
        &mut self,
        limit: RateLimit,
        now: DateTime<Utc>,
    ) -> Result<String, KeyPoolError> {
        if self.credentials.is_empty() {
            return Err(KeyPoolError::EmptyPool);
        }

        for credential in &mut self.credentials {
            credential.prune_expired(limit.window, now);
        }

        if !self.credentials[self.cursor].is_rate_limited(limit, now) {
            return Ok(self.credentials[self.cursor].value.clone());
        }

        let start = self.cursor;
        loop {
            self.cursor = (self.cursor + 1) % self.credentials.len();
            if self.cursor == start {
                tracing::warn!(
                    keys = self.credentials.len(),
                    window_secs = limit.window.as_secs(),
                    max_uses = limit.max_uses,
                    "all API keys rate-limited"
                );
                return Err(KeyPoolError::AllKeysRateLimited);
            }
            if !self.credentials[self.cursor].is_rate_limited(limit, now) {
                tracing::debug!(
                    from = %self.credentials[start].name,
                    to = %self.credentials[self.cursor].name,
                    "rotated past rate-limited key"
                );
                return Ok(self.credentials[self.cursor].value.clone());
            }
        }
    }

    // ─── Usage Reporting ─────────────────────────────────────────────────

    /// Record a completed request against `value` and advance the cursor.
    ///
    /// An unknown value is tolerated; the cursor still advances. Advancing
    /// unconditionally is what makes normal load round-robin.
    pub fn report_usage(&mut self, value: &str) {
        self.report_usage_at(value, Utc::now());
    }

    /// [`report_usage`](Self::report_usage) recorded at an explicit instant.
    pub fn report_usage_at(&mut self, value: &str, now: DateTime<Utc>) {
        match self.credentials.iter_mut().find(|c| c.value == value) {
            Some(credential) => credential.record_usage(now),
            None => tracing::debug!("usage reported for a key not in the pool"),
        }

        if !self.credentials.is_empty() {
            self.cursor = (self.cursor + 1) % self.credentials.len();
        }
    }

    /// Usage counts for all credentials, one name, or one ordinal position.
    pub fn usage_statistics(
        &self,
        selector: &UsageSelector,
    ) -> Result<UsageStatistics, KeyPoolError> {
        match selector {
            UsageSelector::All => Ok(UsageStatistics::All(
                self.credentials
                    .iter()
                    .map(|c| (c.name.clone(), c.usage_count))
                    .collect(),
            )),
            UsageSelector::Named(name) => self
                .credentials
                .iter()
                .find(|c| &c.name == name)
                .map(|c| UsageStatistics::Single(c.usage_count))
                .ok_or_else(|| KeyPoolError::NotFound { name: name.clone() }),
            UsageSelector::Index(index) => self
                .credentials
                .get(*index)
                .map(|c| UsageStatistics::Single(c.usage_count))
                .ok_or(KeyPoolError::IndexOutOfRange {
                    index: *index,
                    len: self.credentials.len(),
                }),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
