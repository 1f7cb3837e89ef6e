//! Single-writer operator interlock.
//!
//! At most one identity holds the lock at a time. The holder's commands refresh
//! the expiry; an abandoned lock expires passively after its TTL and the control
//! loop announces the release.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::clock::{add_duration, Clock};
use crate::error::{AppResult, RunControlError};

/// Current holder of the interlock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterlockRecord {
    /// Identity holding the lock.
    pub holder: String,
    /// Time at which the lock lapses unless refreshed.
    pub expires_at: DateTime<Utc>,
}

/// Operator interlock with passive expiry.
#[derive(Debug)]
pub struct Interlock {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    record: RwLock<Option<InterlockRecord>>,
}

impl Interlock {
    /// Creates a free interlock whose refreshes extend the lock by `ttl`.
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            record: RwLock::new(None),
        }
    }

    /// Default lifetime used when commands refresh the lock.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Takes the lock for `identity`, or refreshes it if `identity` already holds it.
    ///
    /// Fails with `LockConflict` naming the holder if someone else holds a live lock.
    pub fn acquire(&self, identity: &str, ttl: Duration) -> AppResult<InterlockRecord> {
        let now = self.clock.now();
        let mut record = self.record.write();
        if let Some(current) = record.as_ref() {
            if current.expires_at > now && current.holder != identity {
                return Err(RunControlError::LockConflict {
                    holder: current.holder.clone(),
                });
            }
        }
        let taken = InterlockRecord {
            holder: identity.to_string(),
            expires_at: add_duration(now, ttl),
        };
        if record.as_ref().map(|r| r.holder.as_str()) != Some(identity) {
            info!(holder = identity, expires_at = %taken.expires_at, "Interlock taken");
        }
        *record = Some(taken.clone());
        Ok(taken)
    }

    /// Releases the lock. Only the holder may release it.
    pub fn release(&self, identity: &str) -> AppResult<()> {
        let now = self.clock.now();
        let mut record = self.record.write();
        let holder = record
            .as_ref()
            .filter(|r| r.expires_at > now)
            .map(|r| r.holder.clone());
        if holder.as_deref() != Some(identity) {
            return Err(RunControlError::NotLockHolder {
                identity: identity.to_string(),
                holder,
            });
        }
        *record = None;
        info!(holder = identity, "Interlock released");
        Ok(())
    }

    /// Live lock record, if any.
    pub fn current(&self) -> Option<InterlockRecord> {
        let now = self.clock.now();
        self.record
            .read()
            .as_ref()
            .filter(|r| r.expires_at > now)
            .cloned()
    }

    /// Identity holding a live lock, if any.
    pub fn holder(&self) -> Option<String> {
        self.current().map(|r| r.holder)
    }

    /// Gate for commands: conflicts if another identity holds a live lock, refreshes
    /// the expiry if `identity` holds it, passes if the lock is free.
    pub fn authorize(&self, identity: &str) -> AppResult<()> {
        let now = self.clock.now();
        let mut record = self.record.write();
        match record.as_mut() {
            Some(current) if current.expires_at > now => {
                if current.holder != identity {
                    return Err(RunControlError::LockConflict {
                        holder: current.holder.clone(),
                    });
                }
                current.expires_at = add_duration(now, self.ttl);
                debug!(holder = identity, expires_at = %current.expires_at, "Interlock refreshed");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Drops an expired record, returning it so the caller can announce the release.
    pub fn expire(&self) -> Option<InterlockRecord> {
        let now = self.clock.now();
        let mut record = self.record.write();
        if !record.as_ref().is_some_and(|r| r.expires_at <= now) {
            return None;
        }
        let expired = record.take();
        if let Some(expired) = &expired {
            info!(holder = %expired.holder, "Interlock released because of TIMEOUT");
        }
        expired
    }
}
