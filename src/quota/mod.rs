//! Quota Ledger
//!
//! Per-identity token budget over a rolling window. Every reservation is one serializable
//! sled transaction on the identity's window record: two callers racing for the last tokens
//! under the cap cannot both succeed. An expired window is treated as empty when read, so no
//! sweeper is needed.

pub mod estimate;

pub use estimate::{estimate_json_tokens, estimate_tokens};

use crate::clock::Clock;
use crate::error::{QuotaError, StorageError};
use crate::logging::{LogThrottle, ThrottleDecision};
use crate::store::{decode, encode, to_storage_io};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult, TransactionError};
use sled::{Transactional, Tree};
use std::sync::Arc;
use tracing::{debug, info, warn};

const TREE_WINDOWS: &str = "quota_windows";
const TREE_MIGRATIONS: &str = "quota_migrations";
const THROTTLE_CHANNEL: &str = "quota.exceeded";
const MAX_WINDOW_HOURS: u64 = 24 * 366 * 100;

/// Quota configuration (`[quota]` section)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Master switch; when off every reservation succeeds without touching the ledger
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Tokens allowed per identity per window
    #[serde(default = "default_daily_tokens")]
    pub daily_tokens: u64,

    #[serde(default = "default_window_hours")]
    pub window_hours: u64,

    /// Reserved for the reply of a conversational exchange before it starts
    #[serde(default = "default_estimated_response_tokens")]
    pub estimated_response_tokens: u64,
}

fn default_true() -> bool {
    true
}

fn default_daily_tokens() -> u64 {
    10_000
}

fn default_window_hours() -> u64 {
    24
}

fn default_estimated_response_tokens() -> u64 {
    500
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            daily_tokens: default_daily_tokens(),
            window_hours: default_window_hours(),
            estimated_response_tokens: default_estimated_response_tokens(),
        }
    }
}

impl QuotaConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.window_hours == 0 {
            return Err("window_hours must be greater than zero".to_string());
        }
        if self.window_hours > MAX_WINDOW_HOURS {
            return Err(format!("window_hours cannot exceed {}", MAX_WINDOW_HOURS));
        }
        if self.enabled && self.daily_tokens == 0 {
            return Err("daily_tokens must be greater than zero when quotas are enabled".to_string());
        }
        Ok(())
    }

    pub fn window(&self) -> Duration {
        Duration::hours(self.window_hours.min(MAX_WINDOW_HOURS) as i64)
    }
}

/// Stored consumption record for one identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaWindow {
    pub identity: String,
    pub tokens_used: u64,
    pub window_start: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QuotaWindow {
    pub fn is_expired(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now - self.window_start > window
    }

    /// Usage that still counts at `now`.
    pub fn effective_used(&self, now: DateTime<Utc>, window: Duration) -> u64 {
        if self.is_expired(now, window) {
            0
        } else {
            self.tokens_used
        }
    }
}

/// Result of a successful reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Granted { tokens_used: u64, remaining: u64 },
    /// Caller is exempt (subscriber)
    Bypassed,
    /// Enforcement is switched off
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    Applied,
    AlreadyApplied,
    SameIdentity,
}

/// Read-only view of an identity's budget
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub identity: String,
    pub tokens_used: u64,
    pub cap: u64,
    pub remaining: u64,
    pub window_start: Option<DateTime<Utc>>,
    pub resets_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MigrationMarker {
    anon_id: String,
    user_id: String,
    migrated_at: DateTime<Utc>,
}

#[derive(Debug)]
enum LedgerAbort {
    Exceeded { used: u64 },
    Storage(StorageError),
}

pub struct QuotaLedger {
    windows: Tree,
    migrations: Tree,
    config: QuotaConfig,
    clock: Arc<dyn Clock>,
    throttle: Arc<LogThrottle>,
}

impl QuotaLedger {
    pub fn open(
        db: &sled::Db,
        config: QuotaConfig,
        clock: Arc<dyn Clock>,
        throttle: Arc<LogThrottle>,
    ) -> Result<Self, StorageError> {
        Ok(Self {
            windows: db.open_tree(TREE_WINDOWS).map_err(to_storage_io)?,
            migrations: db.open_tree(TREE_MIGRATIONS).map_err(to_storage_io)?,
            config,
            clock,
            throttle,
        })
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    /// Reserve `tokens` for `identity`, or fail with `QuotaError::Exceeded` leaving state as it was.
    pub fn reserve(&self, identity: &str, tokens: u64) -> Result<Reservation, QuotaError> {
        self.reserve_for(identity, tokens, false)
    }

    /// As [`reserve`](Self::reserve), skipping the ledger when `bypass` is set or quotas are off.
    pub fn reserve_for(
        &self,
        identity: &str,
        tokens: u64,
        bypass: bool,
    ) -> Result<Reservation, QuotaError> {
        validate_identity(identity)?;
        if bypass {
            debug!(identity, tokens, "quota bypassed");
            return Ok(Reservation::Bypassed);
        }
        if !self.config.enabled {
            return Ok(Reservation::Disabled);
        }

        let now = self.clock.now();
        let window = self.config.window();
        let cap = self.config.daily_tokens;
        let key = identity.as_bytes();

        let outcome = self.windows.transaction(
            |tx| -> ConflictableTransactionResult<QuotaWindow, LedgerAbort> {
                let current: Option<QuotaWindow> = match tx.get(key)? {
                    Some(raw) => Some(decode(identity, &raw).map_err(|e| {
                        ConflictableTransactionError::Abort(LedgerAbort::Storage(e))
                    })?),
                    None => None,
                };
                let (used, window_start) = match &current {
                    Some(w) if !w.is_expired(now, window) => (w.tokens_used, w.window_start),
                    _ => (0, now),
                };
                let new_total = used.saturating_add(tokens);
                if new_total > cap {
                    return Err(ConflictableTransactionError::Abort(LedgerAbort::Exceeded {
                        used,
                    }));
                }
                let updated = QuotaWindow {
                    identity: identity.to_string(),
                    tokens_used: new_total,
                    window_start,
                    updated_at: now,
                };
                let encoded = encode(identity, &updated).map_err(|e| {
                    ConflictableTransactionError::Abort(LedgerAbort::Storage(e))
                })?;
                tx.insert(key, encoded)?;
                Ok(updated)
            },
        );

        match outcome {
            Ok(updated) => {
                debug!(
                    identity,
                    tokens,
                    tokens_used = updated.tokens_used,
                    cap,
                    "quota reserved"
                );
                Ok(Reservation::Granted {
                    tokens_used: updated.tokens_used,
                    remaining: cap.saturating_sub(updated.tokens_used),
                })
            }
            Err(TransactionError::Abort(LedgerAbort::Exceeded { used })) => {
                self.log_rejection(identity, used, tokens, cap);
                Err(QuotaError::Exceeded {
                    identity: identity.to_string(),
                    used,
                    requested: tokens,
                    cap,
                })
            }
            Err(TransactionError::Abort(LedgerAbort::Storage(e))) => Err(QuotaError::Store(e)),
            Err(TransactionError::Storage(e)) => Err(QuotaError::Store(to_storage_io(e))),
        }
    }

    /// Move an anonymous session onto a signed-in identity.
    ///
    /// Resets the user's window to zero and clears the anonymous usage in one transaction.
    /// A marker per (anon, user) pair makes repeated calls no-ops.
    pub fn migrate(&self, anon_id: &str, user_id: &str) -> Result<MigrationOutcome, QuotaError> {
        validate_identity(anon_id)?;
        validate_identity(user_id)?;
        if anon_id == user_id {
            return Ok(MigrationOutcome::SameIdentity);
        }

        let now = self.clock.now();
        let marker_key = format!("{anon_id}\u{1f}{user_id}");

        let outcome = (&self.windows, &self.migrations).transaction(
            |(windows, migrations)| -> ConflictableTransactionResult<bool, StorageError> {
                if migrations.get(marker_key.as_bytes())?.is_some() {
                    return Ok(false);
                }
                for identity in [user_id, anon_id] {
                    let cleared = QuotaWindow {
                        identity: identity.to_string(),
                        tokens_used: 0,
                        window_start: now,
                        updated_at: now,
                    };
                    let encoded =
                        encode(identity, &cleared).map_err(ConflictableTransactionError::Abort)?;
                    windows.insert(identity.as_bytes(), encoded)?;
                }
                let marker = MigrationMarker {
                    anon_id: anon_id.to_string(),
                    user_id: user_id.to_string(),
                    migrated_at: now,
                };
                let encoded =
                    encode(&marker_key, &marker).map_err(ConflictableTransactionError::Abort)?;
                migrations.insert(marker_key.as_bytes(), encoded)?;
                Ok(true)
            },
        );

        match outcome {
            Ok(true) => {
                info!(anon_id, user_id, "anonymous quota migrated");
                Ok(MigrationOutcome::Applied)
            }
            Ok(false) => Ok(MigrationOutcome::AlreadyApplied),
            Err(TransactionError::Abort(e)) => Err(QuotaError::Store(e)),
            Err(TransactionError::Storage(e)) => Err(QuotaError::Store(to_storage_io(e))),
        }
    }

    /// Migration for login flows that must not fail because of the ledger.
    pub fn migrate_best_effort(&self, anon_id: &str, user_id: &str) -> Option<MigrationOutcome> {
        match self.migrate(anon_id, user_id) {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                warn!(anon_id, user_id, error = %err, "failed to migrate anonymous quota");
                None
            }
        }
    }

    pub fn window(&self, identity: &str) -> Result<Option<QuotaWindow>, QuotaError> {
        validate_identity(identity)?;
        let Some(raw) = self.windows.get(identity.as_bytes()).map_err(to_storage_io)? else {
            return Ok(None);
        };
        Ok(Some(decode(identity, &raw)?))
    }

    pub fn usage(&self, identity: &str) -> Result<QuotaUsage, QuotaError> {
        let now = self.clock.now();
        let window = self.config.window();
        let cap = self.config.daily_tokens;
        let current = self
            .window(identity)?
            .filter(|w| !w.is_expired(now, window));
        let tokens_used = current.as_ref().map(|w| w.tokens_used).unwrap_or(0);
        Ok(QuotaUsage {
            identity: identity.to_string(),
            tokens_used,
            cap,
            remaining: cap.saturating_sub(tokens_used),
            window_start: current.as_ref().map(|w| w.window_start),
            resets_at: current.as_ref().map(|w| w.window_start + window),
        })
    }

    /// Tokens `identity` may still reserve in its current window.
    pub fn remaining(&self, identity: &str) -> Result<u64, QuotaError> {
        Ok(self.usage(identity)?.remaining)
    }

    fn log_rejection(&self, identity: &str, used: u64, requested: u64, cap: u64) {
        match self.throttle.check(THROTTLE_CHANNEL) {
            ThrottleDecision::Emit { suppressed } => warn!(
                identity,
                used,
                requested,
                cap,
                suppressed,
                "daily token quota exceeded"
            ),
            ThrottleDecision::Suppress => {}
        }
    }
}

fn validate_identity(identity: &str) -> Result<(), QuotaError> {
    if identity.trim().is_empty() {
        return Err(QuotaError::InvalidIdentity(
            "identity cannot be empty".to_string(),
        ));
    }
    Ok(())
}
