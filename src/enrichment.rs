//! Batched artist-genre enrichment against the external catalog.
//!
//! One logical thread drives the whole run: authenticate once, then submit
//! batches strictly in sequence through a single [`RateBudget`]. A batch that
//! keeps failing is marked failed and the run moves on; only authentication
//! problems and cancellation end the run early.

use std::collections::BTreeSet;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use governor::clock::{Clock, DefaultClock};
use governor::state::NotKeyed;
use governor::{Quota, RateLimiter};
use log::{debug, info, warn};

use crate::catalog::{CatalogApi, CatalogArtist, ClientCredentials, MAX_RETRY_AFTER};
use crate::error::{CatalogError, EnrichmentError};
use crate::event_store::UserRecord;
use crate::genre_index::{ArtifactCache, GenreIndex};

/// Artist names per search request.
pub const BATCH_SIZE: usize = 10;
const MAX_FAILED_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Where the client is in its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichmentState {
    Idle,
    Authenticating,
    BatchFetching { batch: usize, attempt: u32 },
    Retrying { batch: usize, delay: Duration },
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchStatus {
    Succeeded { artists_written: usize },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub index: usize,
    pub artists: Vec<String>,
    pub status: BatchStatus,
    /// Requests that failed with a non-rate-limit error.
    pub failed_attempts: u32,
    pub rate_limited_retries: u32,
}

impl BatchOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self.status, BatchStatus::Succeeded { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrichmentReport {
    pub unique_artists: usize,
    pub batches: Vec<BatchOutcome>,
}

impl EnrichmentReport {
    pub fn succeeded_batches(&self) -> usize {
        self.batches.iter().filter(|batch| batch.succeeded()).count()
    }

    pub fn failed_batches(&self) -> usize {
        self.batches.len() - self.succeeded_batches()
    }
}

/// Retry ceilings and delays for one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_failed_attempts: u32,
    pub initial_backoff: Duration,
    pub default_retry_after: Duration,
    /// Upper bound on 429 retries for one batch; these do not consume failed attempts.
    pub max_rate_limited_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_failed_attempts: MAX_FAILED_ATTEMPTS,
            initial_backoff: INITIAL_BACKOFF,
            default_retry_after: DEFAULT_RETRY_AFTER,
            max_rate_limited_retries: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `failed_attempt`-th failure: 2s, 4s, 8s, ...
    pub fn backoff_delay(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        self.initial_backoff
            .checked_mul(1u32 << exponent)
            .unwrap_or(Duration::MAX)
    }
}

/// Cooperative cancellation flag checked between batches and before retries.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Blocking delay used for backoff and rate-limit waits.
pub trait BackoffSleeper {
    fn sleep(&self, delay: Duration);
}

pub struct ThreadSleeper;

impl BackoffSleeper for ThreadSleeper {
    fn sleep(&self, delay: Duration) {
        std::thread::sleep(delay);
    }
}

/// The single, global request budget of an enrichment run.
///
/// Combines a client-side token bucket with the pause a server imposed via
/// `Retry-After`; every request of the run acquires from the same budget.
pub struct RateBudget {
    limiter: RateLimiter<NotKeyed, governor::state::InMemoryState, DefaultClock>,
    clock: DefaultClock,
    not_before: Option<Instant>,
}

impl RateBudget {
    pub fn per_second(requests_per_second: u32) -> Self {
        let rate = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: RateLimiter::direct(Quota::per_second(rate)),
            clock: DefaultClock::default(),
            not_before: None,
        }
    }

    /// Blocks all further requests for `delay`, capped at [`MAX_RETRY_AFTER`].
    pub fn pause_for(&mut self, delay: Duration) {
        let now = Instant::now();
        let until = now
            .checked_add(delay.min(MAX_RETRY_AFTER))
            .unwrap_or(now);
        self.not_before = Some(self.not_before.map_or(until, |current| current.max(until)));
    }

    /// Waits until one request may be sent.
    pub fn acquire(&mut self, sleeper: &dyn BackoffSleeper) {
        if let Some(deadline) = self.not_before.take() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !remaining.is_zero() {
                sleeper.sleep(remaining);
            }
        }
        while let Err(not_until) = self.limiter.check() {
            sleeper.sleep(not_until.wait_time_from(self.clock.now()));
        }
    }
}

/// Deduplicated, non-blank artist names in a stable (sorted) order.
pub fn unique_artists<'a>(names: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    names
        .into_iter()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(ToOwned::to_owned)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Writes one batch's results: a matched catalog artist contributes its
/// genres, an unmatched requested name is recorded with no genres.
fn merge_batch(batch: &[String], found: &[CatalogArtist], index: &mut GenreIndex) -> usize {
    let mut written = 0usize;
    for name in batch {
        let wanted = name.to_lowercase();
        let genres = found
            .iter()
            .find(|artist| artist.name.to_lowercase() == wanted)
            .map(|artist| artist.genres.clone())
            .unwrap_or_default();
        if index.record(name, genres) {
            written += 1;
        } else {
            debug!("Enrichment: '{name}' already present in genre index, keeping first value");
        }
    }
    written
}

pub struct EnrichmentClient<A: CatalogApi, S: BackoffSleeper> {
    api: A,
    sleeper: S,
    policy: RetryPolicy,
    cancellation: CancellationToken,
    state: EnrichmentState,
}

impl<A: CatalogApi, S: BackoffSleeper> EnrichmentClient<A, S> {
    pub fn new(api: A, sleeper: S, policy: RetryPolicy, cancellation: CancellationToken) -> Self {
        Self {
            api,
            sleeper,
            policy,
            cancellation,
            state: EnrichmentState::Idle,
        }
    }

    pub fn state(&self) -> EnrichmentState {
        self.state
    }

    #[cfg(test)]
    pub fn api(&self) -> &A {
        &self.api
    }

    #[cfg(test)]
    pub fn sleeper(&self) -> &S {
        &self.sleeper
    }

    fn transition(&mut self, next: EnrichmentState) {
        debug!("Enrichment state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Looks up every artist and writes results into `index`.
    ///
    /// Partial results stay in `index` even when the run ends with an error.
    pub fn run(
        &mut self,
        credentials: &ClientCredentials,
        artists: &[String],
        index: &mut GenreIndex,
        budget: &mut RateBudget,
    ) -> Result<EnrichmentReport, EnrichmentError> {
        let mut report = EnrichmentReport {
            unique_artists: artists.len(),
            batches: Vec::new(),
        };
        if self.cancellation.is_cancelled() {
            return Err(EnrichmentError::Cancelled {
                completed_batches: 0,
            });
        }

        self.transition(EnrichmentState::Authenticating);
        budget.acquire(&self.sleeper);
        let token = match self.api.request_token(credentials) {
            Ok(token) => token,
            Err(error) => {
                self.transition(EnrichmentState::Failed);
                return Err(EnrichmentError::AuthFailure(error.to_string()));
            }
        };
        info!(
            "Enrichment: authenticated, {} artists in {} batches",
            artists.len(),
            artists.len().div_ceil(BATCH_SIZE)
        );

        for (batch_index, batch) in artists.chunks(BATCH_SIZE).enumerate() {
            if self.cancellation.is_cancelled() {
                info!("Enrichment cancelled before batch {batch_index}");
                return Err(EnrichmentError::Cancelled {
                    completed_batches: report.batches.len(),
                });
            }
            let outcome = self.fetch_batch(batch_index, batch, &token, index, budget)?;
            report.batches.push(outcome);
        }
        self.transition(EnrichmentState::Succeeded);

        info!(
            "Enrichment finished: {} batches succeeded, {} failed",
            report.succeeded_batches(),
            report.failed_batches()
        );
        Ok(report)
    }

    fn fetch_batch(
        &mut self,
        batch_index: usize,
        batch: &[String],
        token: &str,
        index: &mut GenreIndex,
        budget: &mut RateBudget,
    ) -> Result<BatchOutcome, EnrichmentError> {
        let mut failed_attempts = 0u32;
        let mut rate_limited_retries = 0u32;
        let outcome = |status, failed_attempts, rate_limited_retries| BatchOutcome {
            index: batch_index,
            artists: batch.to_vec(),
            status,
            failed_attempts,
            rate_limited_retries,
        };

        loop {
            if self.cancellation.is_cancelled() {
                return Err(EnrichmentError::Cancelled {
                    completed_batches: batch_index,
                });
            }
            self.transition(EnrichmentState::BatchFetching {
                batch: batch_index,
                attempt: failed_attempts + rate_limited_retries + 1,
            });
            budget.acquire(&self.sleeper);

            let error = match self.api.search_artists(token, batch) {
                Ok(found) => {
                    let artists_written = merge_batch(batch, &found, index);
                    debug!(
                        "Enrichment[batch {batch_index}]: {} catalog hits, {artists_written} entries written",
                        found.len()
                    );
                    self.transition(EnrichmentState::Succeeded);
                    return Ok(outcome(
                        BatchStatus::Succeeded { artists_written },
                        failed_attempts,
                        rate_limited_retries,
                    ));
                }
                Err(error) => error,
            };

            match error {
                error if !error.is_transient() => {
                    warn!("Enrichment[batch {batch_index}]: token rejected, aborting run");
                    self.transition(EnrichmentState::Failed);
                    return Err(EnrichmentError::AuthExpired(error.to_string()));
                }
                CatalogError::RateLimited { retry_after } => {
                    rate_limited_retries += 1;
                    if rate_limited_retries > self.policy.max_rate_limited_retries {
                        warn!(
                            "Enrichment[batch {batch_index}]: still rate limited after {} retries, giving up on batch",
                            self.policy.max_rate_limited_retries
                        );
                        self.transition(EnrichmentState::Failed);
                        return Ok(outcome(
                            BatchStatus::Failed {
                                reason: "rate limit retries exhausted".to_string(),
                            },
                            failed_attempts,
                            rate_limited_retries,
                        ));
                    }
                    let delay = retry_after
                        .unwrap_or(self.policy.default_retry_after)
                        .min(MAX_RETRY_AFTER);
                    warn!("Enrichment[batch {batch_index}]: rate limited, retrying after {delay:?}");
                    self.transition(EnrichmentState::Retrying {
                        batch: batch_index,
                        delay,
                    });
                    budget.pause_for(delay);
                }
                other => {
                    failed_attempts += 1;
                    if failed_attempts >= self.policy.max_failed_attempts {
                        warn!(
                            "Enrichment[batch {batch_index}]: attempt {failed_attempts} failed ({other}), batch exhausted"
                        );
                        self.transition(EnrichmentState::Failed);
                        return Ok(outcome(
                            BatchStatus::Failed {
                                reason: other.to_string(),
                            },
                            failed_attempts,
                            rate_limited_retries,
                        ));
                    }
                    let delay = self.policy.backoff_delay(failed_attempts);
                    info!(
                        "Enrichment[batch {batch_index}]: attempt {failed_attempts} failed ({other}), retrying in {delay:?}"
                    );
                    self.transition(EnrichmentState::Retrying {
                        batch: batch_index,
                        delay,
                    });
                    self.sleeper.sleep(delay);
                }
            }
        }
    }
}

/// How a user's genre index was obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexSource {
    Cached,
    Fetched(EnrichmentReport),
    NothingToEnrich,
}

/// Fills `index` for `user`, reusing a fresh artifact when one exists.
///
/// A fetched index is persisted only when the run completes; on a run-level
/// error `index` keeps whatever was written and nothing is saved.
pub fn ensure_genre_index<A: CatalogApi, S: BackoffSleeper>(
    user: &UserRecord,
    cache: &ArtifactCache,
    client: &mut EnrichmentClient<A, S>,
    credentials: Option<&ClientCredentials>,
    budget: &mut RateBudget,
    index: &mut GenreIndex,
) -> Result<IndexSource, EnrichmentError> {
    if let Some(cached) = cache.load(&user.user)? {
        info!(
            "Genre data already exists for user {}. Skipping fetch.",
            user.user
        );
        *index = cached;
        return Ok(IndexSource::Cached);
    }

    let artists = unique_artists(user.music.iter().map(|event| event.artist_name.as_str()));
    info!("User {}: {} unique artists", user.user, artists.len());
    if artists.is_empty() {
        return Ok(IndexSource::NothingToEnrich);
    }
    let credentials = credentials.ok_or(EnrichmentError::MissingCredentials)?;

    let report = client.run(credentials, &artists, index, budget)?;
    cache.store(&user.user, index)?;
    Ok(IndexSource::Fetched(report))
}
