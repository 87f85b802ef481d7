//! Time sources and identifier minting

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use super::identifier::{Identifier, Kind, Origin, Stamp, EPOCH, MAX_SEQUENCE, MAX_TIMESTAMP};

/// A source of wall-clock seconds.
pub trait Clock: Send + Sync {
    /// Current time in unix seconds.
    fn now_seconds(&self) -> i64;
}

/// Wall clock backed by chrono.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_seconds(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// A clock that only moves when told to. Used by tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    seconds: AtomicI64,
}

impl ManualClock {
    pub fn new(unix_seconds: i64) -> Self {
        Self {
            seconds: AtomicI64::new(unix_seconds),
        }
    }

    /// A clock parked `offset` seconds after the identifier epoch.
    pub fn at_epoch_offset(offset: i64) -> Self {
        Self::new(EPOCH + offset)
    }

    pub fn set(&self, unix_seconds: i64) {
        self.seconds.store(unix_seconds, Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: i64) {
        self.seconds.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_seconds(&self) -> i64 {
        self.seconds.load(Ordering::SeqCst)
    }
}

/// Mints identifiers for one origin.
///
/// `(timestamp, sequence)` strictly increases across calls, even when the
/// clock stalls, goes backwards, or more than 32767 ids are minted in a
/// second (the minter then borrows the following second).
pub struct IdMinter {
    clock: Arc<dyn Clock>,
    origin: Origin,
    last: Option<Stamp>,
}

impl IdMinter {
    pub fn new(clock: Arc<dyn Clock>, origin: Origin) -> Self {
        Self {
            clock,
            origin,
            last: None,
        }
    }

    pub fn system(origin: Origin) -> Self {
        Self::new(Arc::new(SystemClock), origin)
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn mint(&mut self, kind: Kind) -> Identifier {
        let now = epoch_seconds(self.clock.now_seconds());
        let stamp = match self.last {
            Some(last) if now <= last.timestamp => {
                if last.sequence >= MAX_SEQUENCE {
                    Stamp::new(last.timestamp.saturating_add(1).min(MAX_TIMESTAMP), 0)
                } else {
                    Stamp::new(last.timestamp, last.sequence + 1)
                }
            }
            _ => Stamp::new(now, 0),
        };
        self.last = Some(stamp);
        Identifier::from_parts(kind, stamp, self.origin)
    }
}

fn epoch_seconds(unix_seconds: i64) -> u32 {
    (unix_seconds - EPOCH).clamp(0, i64::from(MAX_TIMESTAMP)) as u32
}
