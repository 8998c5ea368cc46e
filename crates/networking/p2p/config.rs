use crate::types::PeerAddress;
use std::time::Duration;

/// Maximum tolerated advertisement age for WebSocket peers.
pub const MAX_AGE_WS: u64 = 1_800_000;
/// Maximum tolerated advertisement age for WebRTC peers.
pub const MAX_AGE_RTC: u64 = 600_000;
/// Maximum tolerated advertisement age for dumb clients.
pub const MAX_AGE_DUMB: u64 = 60_000;
/// Maximum signaling hops before an RTC address is considered a loop.
pub const MAX_DISTANCE: u8 = 4;
/// Connection failures tolerated for a WebSocket peer.
pub const MAX_FAILED_ATTEMPTS_WS: u32 = 3;
/// Connection failures tolerated for a WebRTC peer.
pub const MAX_FAILED_ATTEMPTS_RTC: u32 = 2;
/// How far into the future an advertised timestamp may lie.
pub const MAX_TIMESTAMP_DRIFT: u64 = 600_000;
/// Interval between housekeeping passes.
pub const HOUSEKEEPING_INTERVAL: Duration = Duration::from_millis(60_000);
/// Ban duration when none is given.
pub const DEFAULT_BAN_TIME: u64 = 600_000;
/// First failure-triggered ban duration; doubles per ban.
pub const INITIAL_FAILED_BACKOFF: u64 = 15_000;
/// Ceiling for the failure back-off.
pub const MAX_FAILED_BACKOFF: u64 = 600_000;
/// Default cap on addresses returned by a query.
pub const DEFAULT_MAX_QUERY_ADDRESSES: usize = 1_000;

/// Configuration of the address book.
#[derive(Debug, Clone)]
pub struct AddressBookConfig {
    /// This node's own address; admissions matching it are rejected.
    pub own_address: PeerAddress,
    /// Bootstrap addresses admitted at spawn. Seeds are never evicted.
    pub seeds: Vec<PeerAddress>,
    /// Interval between housekeeping passes.
    pub housekeeping_interval: Duration,
}

impl AddressBookConfig {
    pub fn new(own_address: PeerAddress) -> Self {
        Self {
            own_address,
            seeds: Vec::new(),
            housekeeping_interval: HOUSEKEEPING_INTERVAL,
        }
    }

    pub fn with_seeds(mut self, seeds: Vec<PeerAddress>) -> Self {
        self.seeds = seeds;
        self
    }
}
