//! Session identifiers and the generator that mints them.
//!
//! A [`BrokerSessionUid`] identifies one running instance of a broker process;
//! a [`StoreSessionUid`] identifies one generation of ownership of a persistent
//! store. Both are minted by [`UidGenerator`], which produces values that are
//! unique within the process and strictly increasing, with the wall-clock
//! millisecond in the high bits so that values from different restarts of the
//! same broker also order by time.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::ClockSource;

/// Low bits reserved for the per-millisecond sequence.
const SEQUENCE_BITS: u32 = 16;

macro_rules! session_uid {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Returns the raw identifier.
            #[must_use]
            pub fn get(self) -> u64 {
                self.0
            }

            /// Milliseconds since Unix epoch at which this UID was minted.
            #[must_use]
            pub fn timestamp(self) -> u64 {
                self.0 >> SEQUENCE_BITS
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }
    };
}

session_uid!(
    /// Identifies one running instance of a broker process.
    BrokerSessionUid
);

session_uid!(
    /// Identifies one generation of exclusive ownership of a persistent store.
    StoreSessionUid
);

/// Mints process-unique, monotonically increasing identifiers.
///
/// Also used for reply correlation ids (xids) and transaction ids.
pub struct UidGenerator {
    clock: Arc<dyn ClockSource>,
    last: AtomicU64,
}

impl UidGenerator {
    #[must_use]
    pub fn new(clock: Arc<dyn ClockSource>) -> Self {
        Self {
            clock,
            last: AtomicU64::new(0),
        }
    }

    /// Returns the next identifier.
    ///
    /// The value is `max(last + 1, now << 16)`, so it never repeats or goes
    /// backwards even if the wall clock does.
    pub fn next_id(&self) -> u64 {
        let floor = self.clock.now() << SEQUENCE_BITS;
        let mut current = self.last.load(Ordering::Acquire);
        loop {
            let candidate = floor.max(current + 1);
            match self.last.compare_exchange_weak(
                current,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return candidate,
                Err(actual) => current = actual,
            }
        }
    }

    #[must_use]
    pub fn broker_session(&self) -> BrokerSessionUid {
        BrokerSessionUid(self.next_id())
    }

    #[must_use]
    pub fn store_session(&self) -> StoreSessionUid {
        StoreSessionUid(self.next_id())
    }
}

impl fmt::Debug for UidGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UidGenerator")
            .field("last", &self.last.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
