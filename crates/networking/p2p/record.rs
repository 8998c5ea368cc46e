use crate::config::INITIAL_FAILED_BACKOFF;
use crate::types::{PeerAddress, PeerChannel};

/// Lifecycle state of a known address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressState {
    New,
    Connecting,
    Connected,
    Tried,
    Failed,
    Banned,
}

/// One path to an RTC peer: the signaling channel it was learned over, the
/// advertised hop count and the advertisement timestamp.
#[derive(Debug, Clone)]
pub struct Route {
    pub channel: PeerChannel,
    pub distance: u8,
    pub timestamp: u64,
}

impl Route {
    /// Lowest distance wins; ties go to the most recent advertisement.
    fn is_better_than(&self, other: &Route) -> bool {
        self.distance < other.distance
            || (self.distance == other.distance && self.timestamp > other.timestamp)
    }
}

/// The authoritative per-address entity tracked by the store.
#[derive(Debug, Clone)]
pub struct AddressRecord {
    pub address: PeerAddress,
    pub(crate) state: AddressState,
    /// Known paths to the peer; RTC records only, WS/DUMB hold none.
    routes: Vec<Route>,
    best_route: Option<usize>,
    pub failed_attempts: u32,
    /// Ban expiry in ms since epoch; `None` when not banned.
    pub banned_until: Option<u64>,
    /// Next failure-triggered ban duration; doubles per ban up to the cap.
    pub ban_backoff: u64,
    pub added_at: u64,
    pub last_seen: u64,
}

impl AddressRecord {
    pub fn new(address: PeerAddress, now: u64) -> Self {
        Self {
            address,
            state: AddressState::New,
            routes: Vec::new(),
            best_route: None,
            failed_attempts: 0,
            banned_until: None,
            ban_backoff: INITIAL_FAILED_BACKOFF,
            added_at: now,
            last_seen: now,
        }
    }

    pub fn state(&self) -> AddressState {
        self.state
    }

    pub fn max_failed_attempts(&self) -> u32 {
        self.address.protocol.max_failed_attempts()
    }

    pub fn best_route(&self) -> Option<&Route> {
        self.best_route.map(|i| &self.routes[i])
    }

    pub fn has_routes(&self) -> bool {
        !self.routes.is_empty()
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Adds or refreshes the route through `channel`, keeping the cached
    /// best-route index current.
    pub fn add_route(&mut self, channel: PeerChannel, distance: u8, timestamp: u64) {
        match self.routes.iter_mut().find(|r| r.channel == channel) {
            Some(route) => {
                route.distance = distance;
                route.timestamp = timestamp;
            }
            None => self.routes.push(Route {
                channel,
                distance,
                timestamp,
            }),
        }
        self.recompute_best_route();
    }

    /// Drops the route through `channel`. Returns whether one existed.
    pub fn remove_route(&mut self, channel: &PeerChannel) -> bool {
        let before = self.routes.len();
        self.routes.retain(|r| r.channel != *channel);
        let removed = self.routes.len() != before;
        if removed {
            self.recompute_best_route();
        }
        removed
    }

    /// Drops the current best route. Returns whether one existed.
    pub fn remove_best_route(&mut self) -> bool {
        let Some(i) = self.best_route else {
            return false;
        };
        self.routes.remove(i);
        self.recompute_best_route();
        true
    }

    pub fn clear_routes(&mut self) {
        self.routes.clear();
        self.best_route = None;
    }

    /// Marks the best route as freshly confirmed.
    pub fn refresh_best_route(&mut self, now: u64) {
        if let Some(i) = self.best_route {
            self.routes[i].timestamp = now;
        }
    }

    fn recompute_best_route(&mut self) {
        self.best_route = None;
        for (i, route) in self.routes.iter().enumerate() {
            match self.best_route {
                Some(best) if !route.is_better_than(&self.routes[best]) => {}
                _ => self.best_route = Some(i),
            }
        }
    }
}
