//! The peer address book: the registry and state machine behind peer
//! selection and address gossip.
//!
//! The book multiplexes three transports under one lifecycle. Addresses are
//! admitted through a guarded `add` path, move through
//! `New → Connecting → Connected → Tried/Failed` as connection attempts play
//! out, self-ban with exponential back-off when they exhaust their failure
//! budget, and are garbage collected by a periodic housekeeping pass. RTC
//! addresses additionally carry a routing table of signaling paths with
//! distance and loop-avoidance rules.
//!
//! [`Book`] is the synchronous core; it owns every rule and is driven by a
//! tagged [`Event`]. [`AddressBook`] is the actor shell: a `GenServer` that
//! serializes events, queries and the housekeeping tick on one logical task,
//! in arrival order, which is what keeps the state machine free of
//! check-then-act races.

use crate::config::{
    AddressBookConfig, DEFAULT_BAN_TIME, DEFAULT_MAX_QUERY_ADDRESSES, MAX_DISTANCE,
    MAX_FAILED_BACKOFF, MAX_TIMESTAMP_DRIFT,
};
use crate::platform::{AlwaysOnline, Clock, Connectivity, SystemClock};
use crate::record::{AddressRecord, AddressState};
use crate::store::AddressStore;
use crate::types::{PeerAddress, PeerChannel, PeerId, Protocol, ProtocolMask, Services};
use spawned_concurrency::{
    error::GenServerError,
    tasks::{CallResponse, CastResponse, GenServer, GenServerHandle, InitResult, send_interval},
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Awaits `future` and casts `message` to `handle` once it resolves.
///
/// `spawned_concurrency` 0.3.0 does not yet expose this as `tasks::send_message_on`
/// (unlike the version referenced by this module's docs), so it is reimplemented
/// locally in terms of the primitives that version does provide.
fn send_message_on<T, F>(mut handle: GenServerHandle<T>, future: F, message: T::CastMsg)
where
    T: GenServer + 'static,
    F: Future + Send + 'static,
{
    spawned_rt::tasks::spawn(async move {
        future.await;
        let _ = handle.cast(message).await;
    });
}

/// Capacity of the `added` event stream. Slow subscribers miss batches
/// rather than stalling the book.
const ADDED_EVENTS_CAPACITY: usize = 64;

/// A network event concerning one peer address.
#[derive(Debug, Clone)]
pub enum Event {
    /// An outbound connection attempt was started.
    Connecting,
    /// A connection was established over `channel`.
    Connected { channel: PeerChannel },
    /// The connection on `channel` went away. `by_remote` is the channel's
    /// closed-by-remote flag at disconnect time.
    Disconnected { channel: PeerChannel, by_remote: bool },
    /// A connection attempt or live connection failed.
    Failure,
    /// The signaling layer reported the peer unreachable via `channel`.
    Unroutable { channel: PeerChannel },
    /// Administrative ban for `duration` ms (default ban time when `None`).
    Ban { duration: Option<u64> },
}

/// Batch of addresses that just became queryable, pushed to subscribers of
/// [`AddressBook::subscribe`]. Fired once per admission batch and once per
/// housekeeping pass that lifted bans.
#[derive(Debug, Clone)]
pub struct AddedEvent {
    pub addresses: Vec<PeerAddress>,
}

#[derive(Debug, Error)]
pub enum AddressBookError {
    #[error("Internal error: {0}")]
    InternalError(#[from] GenServerError),
}

/// Synchronous core of the address book.
///
/// Owns the store and every admission, transition, housekeeping and query
/// rule. The core never raises: malformed or mismatched input is dropped,
/// logged at debug level. Callers that need the single-task ordering
/// guarantees should go through [`AddressBook`] instead of driving a `Book`
/// directly.
#[derive(Debug)]
pub struct Book {
    store: AddressStore,
    config: AddressBookConfig,
    clock: Arc<dyn Clock>,
    connectivity: Arc<dyn Connectivity>,
}

impl Book {
    /// Builds the book and admits the configured seed addresses. Seeds run
    /// through the same admission path as gossip, so the self-guard applies
    /// to them too.
    pub fn new(
        config: AddressBookConfig,
        clock: Arc<dyn Clock>,
        connectivity: Arc<dyn Connectivity>,
    ) -> Self {
        let mut book = Self {
            store: AddressStore::new(),
            config,
            clock,
            connectivity,
        };
        let seeds = book.config.seeds.clone();
        if !seeds.is_empty() {
            let admitted = book.add(None, seeds);
            info!(count = admitted.len(), "Seed addresses admitted");
        }
        book
    }

    pub fn address_count(&self) -> usize {
        self.store.len()
    }

    pub fn connecting_count(&self) -> usize {
        self.store.connecting_count()
    }

    pub fn is_connected(&self, address: &PeerAddress) -> bool {
        self.store
            .get(&address.peer_id)
            .map(|r| r.state() == AddressState::Connected)
            .unwrap_or(false)
    }

    /// Whether the peer is currently banned. Seeds report `false` even while
    /// internally banned: they stay selectable for re-bootstrap.
    pub fn is_banned(&self, address: &PeerAddress) -> bool {
        self.store
            .get(&address.peer_id)
            .map(|r| r.state() == AddressState::Banned && !r.address.is_seed())
            .unwrap_or(false)
    }

    pub fn state_of(&self, address: &PeerAddress) -> Option<AddressState> {
        self.store.get(&address.peer_id).map(|r| r.state())
    }

    /// Admits a batch of addresses learned over `channel` (`None` for the
    /// configured seed list). Returns the addresses that were genuinely new;
    /// updates to known records are merged silently.
    pub fn add(
        &mut self,
        channel: Option<&PeerChannel>,
        addresses: Vec<PeerAddress>,
    ) -> Vec<PeerAddress> {
        let mut added = Vec::new();
        for address in addresses {
            if let Some(stored) = self.admit(channel, address) {
                added.push(stored);
            }
        }
        added
    }

    /// Applies one network event to the record for `address`.
    pub fn apply(&mut self, address: &PeerAddress, event: Event) {
        match event {
            Event::Connecting => self.on_connecting(address),
            Event::Connected { channel } => self.on_connected(&channel, address),
            Event::Disconnected { channel, by_remote } => {
                self.on_disconnected(&channel, address, by_remote)
            }
            Event::Failure => self.on_failure(address),
            Event::Unroutable { channel } => self.on_unroutable(&channel, address),
            Event::Ban { duration } => self.on_ban(address, duration),
        }
    }

    /// One admission, applying the guards in order. Returns the stored
    /// address when a record was created.
    fn admit(
        &mut self,
        channel: Option<&PeerChannel>,
        mut address: PeerAddress,
    ) -> Option<PeerAddress> {
        let now = self.clock.now_ms();

        // Never admit ourselves.
        if address == self.config.own_address {
            debug!(peer = %address.peer_id, "Rejected own address");
            return None;
        }

        // Aged gossip is dropped. Seeds arrive without a channel and skip
        // this check despite their pinned zero timestamp.
        if channel.is_some() && address.exceeds_age(now) {
            debug!(peer = %address.peer_id, timestamp = address.timestamp, "Rejected aged address");
            return None;
        }

        // Timestamps from the future beyond the drift allowance are a lie.
        if address.timestamp > now + MAX_TIMESTAMP_DRIFT {
            debug!(peer = %address.peer_id, timestamp = address.timestamp, "Rejected future timestamp");
            return None;
        }

        // RTC hop accounting: one more hop to reach the peer through the
        // sender. Past the distance cap the advertisement is a routing loop;
        // cut the offending path as well.
        if address.protocol == Protocol::Rtc {
            address.distance = address.distance.saturating_add(1);
            if address.distance > MAX_DISTANCE {
                debug!(peer = %address.peer_id, distance = address.distance, "Rejected over-distance address");
                if let Some(channel) = channel {
                    let peer_id = address.peer_id;
                    let routeless = self
                        .store
                        .get_mut(&peer_id)
                        .map(|record| record.remove_route(channel) && !record.has_routes())
                        .unwrap_or(false);
                    if routeless {
                        self.remove_record(&peer_id);
                    }
                }
                return None;
            }
        }

        // Merge against the known record.
        if let Some(record) = self.store.get(&address.peer_id) {
            if record.state() == AddressState::Banned {
                debug!(peer = %address.peer_id, "Rejected update for banned peer");
                return None;
            }
            if record.address.is_seed() {
                address.timestamp = 0;
            }
            // A known net address is never erased by a less informed update.
            if address.net_address.is_none() {
                address.net_address = record.address.net_address;
            }
            if address.protocol == Protocol::Ws && record.address.timestamp >= address.timestamp {
                debug!(peer = %address.peer_id, "Rejected stale WS advertisement");
                return None;
            }
        }

        let peer_id = address.peer_id;
        if let Some(record) = self.store.get_mut(&peer_id) {
            if address.protocol == Protocol::Rtc
                && let Some(channel) = channel
            {
                record.add_route(channel.clone(), address.distance, address.timestamp);
            }
            if record.state() == AddressState::Connected {
                // A live connection is the best information we have; the
                // update may only fill in a missing net address.
                if record.address.net_address.is_none() {
                    record.address.net_address = address.net_address;
                }
                return None;
            }
            self.store.update_address(&peer_id, address);
            return None;
        }

        let mut record = AddressRecord::new(address, now);
        if record.address.protocol == Protocol::Rtc
            && let Some(channel) = channel
        {
            record.add_route(
                channel.clone(),
                record.address.distance,
                record.address.timestamp,
            );
        }
        let stored = record.address.clone();
        self.store.add(record);
        Some(stored)
    }

    fn on_connecting(&mut self, address: &PeerAddress) {
        let Some(record) = self.store.get(&address.peer_id) else {
            debug!(peer = %address.peer_id, event = "connecting", "Dropped event for unknown peer");
            return;
        };
        match record.state() {
            AddressState::New | AddressState::Tried | AddressState::Failed => {
                self.store
                    .set_state(&address.peer_id, AddressState::Connecting);
            }
            state => {
                debug!(peer = %address.peer_id, ?state, event = "connecting", "Dropped mismatched event");
            }
        }
    }

    fn on_connected(&mut self, channel: &PeerChannel, address: &PeerAddress) {
        let now = self.clock.now_ms();
        match self.store.get(&address.peer_id) {
            None => {
                // Remote-initiated connection from a peer we never heard of.
                debug!(peer = %address.peer_id, channel = ?channel.id(), "Connected to unknown peer, recording");
                let mut record = AddressRecord::new(address.clone(), now);
                record.state = AddressState::Connected;
                self.store.add(record);
            }
            Some(record) if record.state() == AddressState::Banned => {
                debug!(peer = %address.peer_id, event = "connected", "Dropped event for banned peer");
            }
            Some(_) => {
                self.store
                    .set_state(&address.peer_id, AddressState::Connected);
                if let Some(record) = self.store.get_mut(&address.peer_id) {
                    record.failed_attempts = 0;
                    record.last_seen = now;
                }
            }
        }
    }

    fn on_disconnected(&mut self, channel: &PeerChannel, address: &PeerAddress, by_remote: bool) {
        // The channel may have been relaying signaling for any number of RTC
        // peers; every route through it is gone.
        self.revoke_routes_via(channel);

        let Some(record) = self.store.get(&address.peer_id) else {
            debug!(peer = %address.peer_id, event = "disconnected", "Dropped event for unknown peer");
            return;
        };
        if record.state() != AddressState::Connected {
            debug!(peer = %address.peer_id, state = ?record.state(), event = "disconnected", "Dropped mismatched event");
            return;
        }
        let dumb = record.address.protocol == Protocol::Dumb;
        self.store.set_state(&address.peer_id, AddressState::Tried);

        // A remote hang-up while we are online means the peer chose to drop
        // us; dumb clients cannot be re-dialed at all.
        if (by_remote && self.connectivity.is_online()) || dumb {
            self.remove_record(&address.peer_id);
        }
    }

    fn on_failure(&mut self, address: &PeerAddress) {
        let now = self.clock.now_ms();
        let Some(record) = self.store.get(&address.peer_id) else {
            debug!(peer = %address.peer_id, event = "failure", "Dropped event for unknown peer");
            return;
        };
        match record.state() {
            AddressState::Connecting | AddressState::Connected => {}
            state => {
                debug!(peer = %address.peer_id, ?state, event = "failure", "Dropped mismatched event");
                return;
            }
        }
        self.store.set_state(&address.peer_id, AddressState::Failed);

        let mut banned_until = None;
        if let Some(record) = self.store.get_mut(&address.peer_id) {
            record.failed_attempts += 1;
            if record.failed_attempts >= record.max_failed_attempts() {
                let until = now + record.ban_backoff;
                record.banned_until = Some(until);
                record.ban_backoff = record.ban_backoff.saturating_mul(2).min(MAX_FAILED_BACKOFF);
                record.clear_routes();
                banned_until = Some(until);
            }
        }
        if let Some(until) = banned_until {
            self.store.set_state(&address.peer_id, AddressState::Banned);
            debug!(peer = %address.peer_id, until, "Failure budget exhausted, peer banned");
        }
    }

    fn on_unroutable(&mut self, channel: &PeerChannel, address: &PeerAddress) {
        let Some(record) = self.store.get(&address.peer_id) else {
            debug!(peer = %address.peer_id, event = "unroutable", "Dropped event for unknown peer");
            return;
        };
        // Only the currently best route may declare the peer unroutable;
        // anything else is a stale or lying relay.
        match record.best_route() {
            None => {
                warn!(peer = %address.peer_id, channel = ?channel.id(), "Unroutable signal without a best route");
                return;
            }
            Some(best) if best.channel != *channel => {
                warn!(peer = %address.peer_id, channel = ?channel.id(), "Unroutable signal on non-best channel");
                return;
            }
            Some(_) => {}
        }
        let routeless = self
            .store
            .get_mut(&address.peer_id)
            .map(|record| {
                record.remove_best_route();
                !record.has_routes()
            })
            .unwrap_or(false);
        if routeless {
            self.remove_record(&address.peer_id);
        }
    }

    fn on_ban(&mut self, address: &PeerAddress, duration: Option<u64>) {
        let now = self.clock.now_ms();
        let until = now + duration.unwrap_or(DEFAULT_BAN_TIME);
        if self.store.get(&address.peer_id).is_none() {
            self.store.add(AddressRecord::new(address.clone(), now));
        }
        self.store.set_state(&address.peer_id, AddressState::Banned);
        if let Some(record) = self.store.get_mut(&address.peer_id) {
            record.banned_until = Some(until);
            record.clear_routes();
        }
        debug!(peer = %address.peer_id, until, "Peer banned");
    }

    /// Evicts a record. Seeds are never deleted: they are banned for the
    /// current back-off instead, which keeps their identity while taking
    /// them out of selection. A record that is already banned stays so the
    /// ban is honored.
    fn remove_record(&mut self, peer_id: &PeerId) {
        let Some(record) = self.store.get(peer_id) else {
            return;
        };
        if record.address.is_seed() {
            let until = self.clock.now_ms() + record.ban_backoff;
            self.store.set_state(peer_id, AddressState::Banned);
            if let Some(record) = self.store.get_mut(peer_id) {
                record.banned_until = Some(until);
                record.clear_routes();
            }
            return;
        }
        if record.state() == AddressState::Banned {
            return;
        }
        self.store.remove(peer_id);
    }

    /// Drops every route that went through `channel`; records left with no
    /// path to them are evicted.
    fn revoke_routes_via(&mut self, channel: &PeerChannel) {
        let mut routeless = Vec::new();
        for (peer_id, record) in self.store.iter_mut() {
            if record.remove_route(channel) && !record.has_routes() {
                routeless.push(*peer_id);
            }
        }
        for peer_id in routeless {
            self.remove_record(&peer_id);
        }
    }

    /// One garbage-collection and refresh pass. Returns the addresses whose
    /// bans were lifted, for the `added` notification.
    pub fn housekeep(&mut self) -> Vec<PeerAddress> {
        let now = self.clock.now_ms();
        let mut evict = Vec::new();
        let mut unbanned = Vec::new();

        for (peer_id, record) in self.store.iter_mut() {
            match record.state() {
                AddressState::New | AddressState::Tried | AddressState::Failed => {
                    if !record.address.is_seed() && record.address.exceeds_age(now) {
                        evict.push(*peer_id);
                    }
                }
                AddressState::Banned => {
                    let expired = record.banned_until.map(|t| t <= now).unwrap_or(true);
                    if expired {
                        if record.address.is_seed()
                            || record.failed_attempts >= record.max_failed_attempts()
                        {
                            // Worth re-trying: the ban came from the failure
                            // budget, or the record is a seed.
                            record.state = AddressState::New;
                            record.failed_attempts = 0;
                            record.banned_until = None;
                            unbanned.push(record.address.clone());
                        } else {
                            evict.push(*peer_id);
                        }
                    }
                }
                AddressState::Connected => {
                    // A live peer is fresh by definition; keep it gossipable.
                    record.address.timestamp = now;
                    record.refresh_best_route(now);
                }
                AddressState::Connecting => {}
            }
        }

        for peer_id in &evict {
            self.store.remove(peer_id);
        }
        if !evict.is_empty() || !unbanned.is_empty() {
            debug!(
                evicted = evict.len(),
                unbanned = unbanned.len(),
                "Housekeeping pass complete"
            );
        }
        unbanned
    }

    /// Snapshot of up to `max_addresses` addresses eligible for dialing and
    /// gossip: not banned or failed, not seeds, matching the protocol and
    /// service masks, not over-age. Connected records with stale timestamps
    /// are refreshed before inclusion. Ordering is deterministic: fewest
    /// failed attempts, most recently seen, lowest distance.
    pub fn query(
        &mut self,
        protocols: ProtocolMask,
        services: Services,
        max_addresses: usize,
    ) -> Vec<PeerAddress> {
        let now = self.clock.now_ms();
        let mut selected: Vec<(u32, u64, u8, PeerId, PeerAddress)> = Vec::new();

        for (_, record) in self.store.iter_mut() {
            let state = record.state();
            if state == AddressState::Banned || state == AddressState::Failed {
                continue;
            }
            if record.address.is_seed() {
                continue;
            }
            if !protocols.contains(record.address.protocol) {
                continue;
            }
            if !record.address.services.contains(services) {
                continue;
            }
            if state == AddressState::Connected {
                if record.address.exceeds_age(now) {
                    record.address.timestamp = now;
                }
            } else if record.address.exceeds_age(now) {
                continue;
            }
            selected.push((
                record.failed_attempts,
                record.last_seen,
                record.address.distance,
                record.address.peer_id,
                record.address.clone(),
            ));
        }

        selected.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then(b.1.cmp(&a.1))
                .then(a.2.cmp(&b.2))
                .then(a.3.cmp(&b.3))
        });
        selected.truncate(max_addresses);
        selected.into_iter().map(|(.., address)| address).collect()
    }
}

/// Client handle for the address book actor.
///
/// All methods forward to a single `GenServer` task owning a [`Book`], so
/// events are processed to completion in arrival order.
#[derive(Debug, Clone)]
pub struct AddressBook {
    handle: GenServerHandle<AddressBookServer>,
    added_events: broadcast::Sender<AddedEvent>,
}

impl AddressBook {
    /// Spawns the book with the system clock and always-on connectivity.
    pub fn spawn(config: AddressBookConfig) -> AddressBook {
        Self::spawn_with(config, Arc::new(SystemClock), Arc::new(AlwaysOnline))
    }

    pub fn spawn_with(
        config: AddressBookConfig,
        clock: Arc<dyn Clock>,
        connectivity: Arc<dyn Connectivity>,
    ) -> AddressBook {
        let (added_events, _) = broadcast::channel(ADDED_EVENTS_CAPACITY);
        let housekeeping_interval = config.housekeeping_interval;
        let server = AddressBookServer {
            book: Book::new(config, clock, connectivity),
            added_events: added_events.clone(),
            housekeeping_interval,
        };
        AddressBook {
            handle: server.start(),
            added_events,
        }
    }

    /// Subscribes to the stream of addresses that became queryable (fresh
    /// admissions and housekeeping unbans).
    pub fn subscribe(&self) -> broadcast::Receiver<AddedEvent> {
        self.added_events.subscribe()
    }

    /// Admits addresses learned over `channel`; `None` marks the trusted
    /// local path used for the seed list.
    pub async fn add(
        &mut self,
        channel: Option<PeerChannel>,
        addresses: Vec<PeerAddress>,
    ) -> Result<(), AddressBookError> {
        self.handle
            .cast(CastMessage::Add { channel, addresses })
            .await?;
        Ok(())
    }

    pub async fn connecting(&mut self, address: PeerAddress) -> Result<(), AddressBookError> {
        self.event(address, Event::Connecting).await
    }

    pub async fn connected(
        &mut self,
        channel: PeerChannel,
        address: PeerAddress,
    ) -> Result<(), AddressBookError> {
        self.event(address, Event::Connected { channel }).await
    }

    pub async fn disconnected(
        &mut self,
        channel: PeerChannel,
        address: PeerAddress,
        closed_by_remote: bool,
    ) -> Result<(), AddressBookError> {
        self.event(
            address,
            Event::Disconnected {
                channel,
                by_remote: closed_by_remote,
            },
        )
        .await
    }

    pub async fn failure(&mut self, address: PeerAddress) -> Result<(), AddressBookError> {
        self.event(address, Event::Failure).await
    }

    pub async fn unroutable(
        &mut self,
        channel: PeerChannel,
        address: PeerAddress,
    ) -> Result<(), AddressBookError> {
        self.event(address, Event::Unroutable { channel }).await
    }

    /// Bans the peer for `duration` ms, or the default ban time.
    pub async fn ban(
        &mut self,
        address: PeerAddress,
        duration: Option<u64>,
    ) -> Result<(), AddressBookError> {
        self.event(address, Event::Ban { duration }).await
    }

    async fn event(&mut self, address: PeerAddress, event: Event) -> Result<(), AddressBookError> {
        self.handle
            .cast(CastMessage::Lifecycle { address, event })
            .await?;
        Ok(())
    }

    /// Snapshot selection of eligible addresses; see [`Book::query`].
    pub async fn query(
        &mut self,
        protocols: ProtocolMask,
        services: Services,
        max_addresses: Option<usize>,
    ) -> Result<Vec<PeerAddress>, AddressBookError> {
        match self
            .handle
            .call(CallMessage::Query {
                protocols,
                services,
                max_addresses: max_addresses.unwrap_or(DEFAULT_MAX_QUERY_ADDRESSES),
            })
            .await?
        {
            OutMessage::Addresses(addresses) => Ok(addresses),
            _ => unreachable!(),
        }
    }

    pub async fn is_connected(&mut self, address: &PeerAddress) -> Result<bool, AddressBookError> {
        match self
            .handle
            .call(CallMessage::IsConnected {
                address: address.clone(),
            })
            .await?
        {
            OutMessage::Flag(flag) => Ok(flag),
            _ => unreachable!(),
        }
    }

    /// False for seeds even while internally banned.
    pub async fn is_banned(&mut self, address: &PeerAddress) -> Result<bool, AddressBookError> {
        match self
            .handle
            .call(CallMessage::IsBanned {
                address: address.clone(),
            })
            .await?
        {
            OutMessage::Flag(flag) => Ok(flag),
            _ => unreachable!(),
        }
    }

    pub async fn state_of(
        &mut self,
        address: &PeerAddress,
    ) -> Result<Option<AddressState>, AddressBookError> {
        match self
            .handle
            .call(CallMessage::StateOf {
                address: address.clone(),
            })
            .await?
        {
            OutMessage::State(state) => Ok(state),
            _ => unreachable!(),
        }
    }

    pub async fn address_count(&mut self) -> Result<usize, AddressBookError> {
        match self.handle.call(CallMessage::AddressCount).await? {
            OutMessage::Count(count) => Ok(count),
            _ => unreachable!(),
        }
    }

    pub async fn connecting_count(&mut self) -> Result<usize, AddressBookError> {
        match self.handle.call(CallMessage::ConnectingCount).await? {
            OutMessage::Count(count) => Ok(count),
            _ => unreachable!(),
        }
    }

    pub async fn shutdown(&mut self) -> Result<(), AddressBookError> {
        self.handle.cast(CastMessage::Shutdown).await?;
        Ok(())
    }
}

#[derive(Debug)]
struct AddressBookServer {
    book: Book,
    added_events: broadcast::Sender<AddedEvent>,
    housekeeping_interval: Duration,
}

impl AddressBookServer {
    fn publish_added(&self, addresses: Vec<PeerAddress>) {
        if addresses.is_empty() {
            return;
        }
        // Send only fails when nobody is subscribed.
        let _ = self.added_events.send(AddedEvent { addresses });
    }
}

#[derive(Debug, Clone)]
enum CastMessage {
    Add {
        channel: Option<PeerChannel>,
        addresses: Vec<PeerAddress>,
    },
    Lifecycle {
        address: PeerAddress,
        event: Event,
    },
    Housekeep,
    Shutdown,
}

#[derive(Debug, Clone)]
enum CallMessage {
    Query {
        protocols: ProtocolMask,
        services: Services,
        max_addresses: usize,
    },
    IsConnected {
        address: PeerAddress,
    },
    IsBanned {
        address: PeerAddress,
    },
    StateOf {
        address: PeerAddress,
    },
    AddressCount,
    ConnectingCount,
}

#[derive(Debug)]
enum OutMessage {
    Addresses(Vec<PeerAddress>),
    Flag(bool),
    State(Option<AddressState>),
    Count(usize),
}

impl GenServer for AddressBookServer {
    type CallMsg = CallMessage;
    type CastMsg = CastMessage;
    type OutMsg = OutMessage;
    type Error = AddressBookError;

    async fn init(self, handle: &GenServerHandle<Self>) -> Result<InitResult<Self>, Self::Error> {
        send_interval(
            self.housekeeping_interval,
            handle.clone(),
            CastMessage::Housekeep,
        );
        send_message_on(
            handle.clone(),
            tokio::signal::ctrl_c(),
            CastMessage::Shutdown,
        );
        Ok(InitResult::Success(self))
    }

    async fn handle_call(
        &mut self,
        message: Self::CallMsg,
        _handle: &GenServerHandle<Self>,
    ) -> CallResponse<Self> {
        match message {
            CallMessage::Query {
                protocols,
                services,
                max_addresses,
            } => CallResponse::Reply(OutMessage::Addresses(self.book.query(
                protocols,
                services,
                max_addresses,
            ))),
            CallMessage::IsConnected { address } => {
                CallResponse::Reply(OutMessage::Flag(self.book.is_connected(&address)))
            }
            CallMessage::IsBanned { address } => {
                CallResponse::Reply(OutMessage::Flag(self.book.is_banned(&address)))
            }
            CallMessage::StateOf { address } => {
                CallResponse::Reply(OutMessage::State(self.book.state_of(&address)))
            }
            CallMessage::AddressCount => {
                CallResponse::Reply(OutMessage::Count(self.book.address_count()))
            }
            CallMessage::ConnectingCount => {
                CallResponse::Reply(OutMessage::Count(self.book.connecting_count()))
            }
        }
    }

    async fn handle_cast(
        &mut self,
        message: Self::CastMsg,
        _handle: &GenServerHandle<Self>,
    ) -> CastResponse {
        match message {
            CastMessage::Add { channel, addresses } => {
                let added = self.book.add(channel.as_ref(), addresses);
                self.publish_added(added);
            }
            CastMessage::Lifecycle { address, event } => {
                self.book.apply(&address, event);
            }
            CastMessage::Housekeep => {
                let unbanned = self.book.housekeep();
                self.publish_added(unbanned);
            }
            CastMessage::Shutdown => return CastResponse::Stop,
        }
        CastResponse::NoReply
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        INITIAL_FAILED_BACKOFF, MAX_AGE_WS, MAX_FAILED_ATTEMPTS_WS,
    };
    use crate::platform::{ManualClock, ManualConnectivity};
    use crate::types::{ChannelId, NetAddress, PeerId, SignalId};

    const START: u64 = 10_000_000;

    fn id(n: u8) -> PeerId {
        PeerId::from_bytes([n; 32])
    }

    fn sig(n: u8) -> SignalId {
        SignalId::from_bytes([n; 16])
    }

    fn ch(n: u64) -> PeerChannel {
        PeerChannel::new(ChannelId(n))
    }

    fn ws(n: u8, timestamp: u64) -> PeerAddress {
        PeerAddress::ws(id(n), None, timestamp, Services::NONE)
    }

    fn rtc(n: u8, timestamp: u64, distance: u8) -> PeerAddress {
        let mut address = PeerAddress::rtc(id(n), sig(n), timestamp, Services::NONE);
        address.distance = distance;
        address
    }

    fn dumb(n: u8, timestamp: u64) -> PeerAddress {
        PeerAddress::dumb(id(n), timestamp, Services::NONE)
    }

    fn own_address() -> PeerAddress {
        ws(255, START)
    }

    fn book() -> (Book, Arc<ManualClock>) {
        book_with(AddressBookConfig::new(own_address()))
    }

    fn book_with(config: AddressBookConfig) -> (Book, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(START));
        let book = Book::new(config, clock.clone(), Arc::new(AlwaysOnline));
        (book, clock)
    }

    fn offline_book() -> (Book, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(START));
        let book = Book::new(
            AddressBookConfig::new(own_address()),
            clock.clone(),
            Arc::new(ManualConnectivity::new(false)),
        );
        (book, clock)
    }

    /// Brings a record into the Connected state through the regular dialing
    /// sequence.
    fn connect(book: &mut Book, address: &PeerAddress, channel: &PeerChannel) {
        book.apply(address, Event::Connecting);
        book.apply(
            address,
            Event::Connected {
                channel: channel.clone(),
            },
        );
    }

    #[test]
    fn own_address_is_rejected() {
        let (mut book, _) = book();
        let added = book.add(None, vec![own_address()]);
        assert!(added.is_empty());
        assert_eq!(book.address_count(), 0);
    }

    #[test]
    fn seed_list_passes_through_the_self_guard() {
        let mut own = own_address();
        own.timestamp = 0;
        let config = AddressBookConfig::new(own_address())
            .with_seeds(vec![own, ws(1, 0)]);
        let (book, _) = book_with(config);
        // Only the foreign seed is admitted.
        assert_eq!(book.address_count(), 1);
        assert_eq!(book.state_of(&ws(1, 0)), Some(AddressState::New));
    }

    #[test]
    fn aged_gossip_is_rejected_but_seeds_are_not() {
        let (mut book, _) = book();
        let stale = ws(1, START - MAX_AGE_WS - 1);
        assert!(book.add(Some(&ch(1)), vec![stale]).is_empty());

        // The seed path carries no channel and skips the age guard.
        let seed = ws(2, 0);
        assert_eq!(book.add(None, vec![seed.clone()]).len(), 1);
        assert_eq!(book.state_of(&seed), Some(AddressState::New));
    }

    #[test]
    fn future_timestamps_are_rejected() {
        let (mut book, _) = book();
        let liar = ws(1, START + MAX_TIMESTAMP_DRIFT + 1);
        assert!(book.add(Some(&ch(1)), vec![liar]).is_empty());

        let drifted = ws(2, START + MAX_TIMESTAMP_DRIFT);
        assert_eq!(book.add(Some(&ch(1)), vec![drifted]).len(), 1);
    }

    #[test]
    fn ws_advertisements_only_move_forward() {
        let (mut book, _) = book();
        let added = book.add(None, vec![ws(1, START - 1_000)]);
        assert_eq!(added.len(), 1);

        // Older or same-age WS information is discarded.
        assert!(book.add(Some(&ch(1)), vec![ws(1, START - 2_000)]).is_empty());
        assert!(book.add(Some(&ch(1)), vec![ws(1, START - 1_000)]).is_empty());
        let stored = book.store.get(&id(1)).unwrap();
        assert_eq!(stored.address.timestamp, START - 1_000);

        // Newer information replaces the stored address without counting as
        // new.
        assert!(book.add(Some(&ch(1)), vec![ws(1, START - 500)]).is_empty());
        let stored = book.store.get(&id(1)).unwrap();
        assert_eq!(stored.address.timestamp, START - 500);
    }

    #[test]
    fn repeated_adds_do_not_stack_distance() {
        let (mut book, _) = book();
        let address = rtc(1, START - 1_000, 1);
        assert_eq!(book.add(Some(&ch(1)), vec![address.clone()]).len(), 1);
        assert!(book.add(Some(&ch(1)), vec![address.clone()]).is_empty());

        let stored = book.store.get(&id(1)).unwrap();
        assert_eq!(stored.address.distance, 2);
        assert_eq!(stored.routes().len(), 1);
        assert_eq!(stored.best_route().unwrap().distance, 2);
    }

    #[test]
    fn over_distance_rtc_is_rejected_and_the_loop_is_cut() {
        let (mut book, _) = book();
        // Establish a legitimate route through channel 1.
        assert_eq!(
            book.add(Some(&ch(1)), vec![rtc(1, START - 1_000, 1)]).len(),
            1
        );
        assert!(book.store.get(&id(1)).unwrap().has_routes());

        // The same peer advertised at the distance cap: post-increment pushes
        // it over, the advertisement is rejected and the path through the
        // offending channel is revoked. With no route left the record goes.
        assert!(
            book.add(Some(&ch(1)), vec![rtc(1, START - 900, MAX_DISTANCE)])
                .is_empty()
        );
        assert!(book.store.get(&id(1)).is_none());
    }

    #[test]
    fn over_distance_keeps_records_with_other_routes() {
        let (mut book, _) = book();
        book.add(Some(&ch(1)), vec![rtc(1, START - 1_000, 1)]);
        book.add(Some(&ch(2)), vec![rtc(1, START - 900, 2)]);
        assert_eq!(book.store.get(&id(1)).unwrap().routes().len(), 2);

        book.add(Some(&ch(2)), vec![rtc(1, START - 800, MAX_DISTANCE)]);
        let record = book.store.get(&id(1)).unwrap();
        assert_eq!(record.routes().len(), 1);
        assert_eq!(record.best_route().unwrap().channel, ch(1));
    }

    #[test]
    fn banned_records_reject_updates() {
        let (mut book, _) = book();
        book.add(None, vec![ws(1, START - 1_000)]);
        book.apply(&ws(1, 0), Event::Ban { duration: None });
        assert!(book.add(Some(&ch(1)), vec![ws(1, START)]).is_empty());
        assert_eq!(book.state_of(&ws(1, 0)), Some(AddressState::Banned));
    }

    #[test]
    fn known_net_addresses_are_never_erased() {
        let (mut book, _) = book();
        let located = PeerAddress::ws(
            id(1),
            Some(NetAddress::new("192.0.2.1".parse().unwrap())),
            START - 2_000,
            Services::NONE,
        );
        book.add(None, vec![located.clone()]);

        // A newer advertisement without a net address inherits the known one.
        book.add(Some(&ch(1)), vec![ws(1, START - 1_000)]);
        let stored = book.store.get(&id(1)).unwrap();
        assert_eq!(stored.address.timestamp, START - 1_000);
        assert_eq!(stored.address.net_address, located.net_address);
    }

    #[test]
    fn seed_timestamps_stay_pinned_to_zero() {
        let config = AddressBookConfig::new(own_address()).with_seeds(vec![ws(1, 0)]);
        let (mut book, _) = book_with(config);

        // WS updates against a seed collapse to timestamp 0 and are then
        // dropped as not newer; the seed keeps its pinned timestamp.
        assert!(book.add(Some(&ch(1)), vec![ws(1, START - 100)]).is_empty());
        let stored = book.store.get(&id(1)).unwrap();
        assert!(stored.address.is_seed());
    }

    #[test]
    fn connected_records_only_learn_missing_net_addresses() {
        let (mut book, _) = book();
        book.add(None, vec![ws(1, START - 1_000)]);
        connect(&mut book, &ws(1, 0), &ch(1));

        let mut update = PeerAddress::ws(
            id(1),
            Some(NetAddress::new("192.0.2.9".parse().unwrap())),
            START - 100,
            Services::new(0b11),
        );
        assert!(book.add(Some(&ch(2)), vec![update.clone()]).is_empty());

        // Only the missing net address was filled in; everything else is
        // locked while the connection lives.
        let stored = book.store.get(&id(1)).unwrap();
        assert_eq!(stored.address.net_address, update.net_address);
        assert_eq!(stored.address.timestamp, START - 1_000);
        assert_eq!(stored.address.services, Services::NONE);

        // With the net address known, further updates change nothing.
        update.net_address = Some(NetAddress::new("203.0.113.5".parse().unwrap()));
        book.add(Some(&ch(2)), vec![update.clone()]);
        let stored = book.store.get(&id(1)).unwrap();
        assert_ne!(stored.address.net_address, update.net_address);
    }

    #[test]
    fn connecting_is_tracked_and_counted() {
        let (mut book, _) = book();
        book.add(None, vec![ws(1, START - 1_000), ws(2, START - 1_000)]);
        assert_eq!(book.connecting_count(), 0);

        book.apply(&ws(1, 0), Event::Connecting);
        book.apply(&ws(2, 0), Event::Connecting);
        assert_eq!(book.connecting_count(), 2);

        // Connecting from Connecting is a mismatch and changes nothing.
        book.apply(&ws(1, 0), Event::Connecting);
        assert_eq!(book.connecting_count(), 2);

        book.apply(&ws(1, 0), Event::Connected { channel: ch(1) });
        assert_eq!(book.connecting_count(), 1);

        book.apply(&ws(2, 0), Event::Failure);
        assert_eq!(book.connecting_count(), 0);
    }

    #[test]
    fn connecting_count_survives_bans_and_removals() {
        let (mut book, _) = book();
        book.add(None, vec![ws(1, START - 1_000), ws(2, START - 1_000)]);
        book.apply(&ws(1, 0), Event::Connecting);
        book.apply(&ws(2, 0), Event::Connecting);

        book.apply(&ws(1, 0), Event::Ban { duration: None });
        assert_eq!(book.connecting_count(), 1);

        book.store.remove(&id(2));
        assert_eq!(book.connecting_count(), 0);

        // The counter always matches a full scan of the store.
        let scanned = book
            .store
            .values()
            .filter(|r| r.state() == AddressState::Connecting)
            .count();
        assert_eq!(book.connecting_count(), scanned);
    }

    #[test]
    fn connected_creates_records_for_unknown_peers() {
        let (mut book, _) = book();
        book.apply(&ws(1, START - 100), Event::Connected { channel: ch(1) });
        assert!(book.is_connected(&ws(1, 0)));
        assert_eq!(book.address_count(), 1);
    }

    #[test]
    fn connected_resets_the_failure_budget() {
        let (mut book, _) = book();
        book.add(None, vec![ws(1, START - 1_000)]);
        book.apply(&ws(1, 0), Event::Connecting);
        book.apply(&ws(1, 0), Event::Failure);
        assert_eq!(book.store.get(&id(1)).unwrap().failed_attempts, 1);

        book.apply(&ws(1, 0), Event::Connecting);
        book.apply(&ws(1, 0), Event::Connected { channel: ch(1) });
        assert_eq!(book.store.get(&id(1)).unwrap().failed_attempts, 0);
    }

    #[test]
    fn disconnect_is_only_meaningful_while_connected() {
        let (mut book, _) = book();
        book.add(None, vec![ws(1, START - 1_000)]);
        book.apply(
            &ws(1, 0),
            Event::Disconnected {
                channel: ch(1),
                by_remote: true,
            },
        );
        assert_eq!(book.state_of(&ws(1, 0)), Some(AddressState::New));
    }

    #[test]
    fn local_disconnect_retains_the_peer_as_tried() {
        let (mut book, _) = book();
        book.add(None, vec![ws(1, START - 1_000)]);
        connect(&mut book, &ws(1, 0), &ch(1));
        book.apply(
            &ws(1, 0),
            Event::Disconnected {
                channel: ch(1),
                by_remote: false,
            },
        );
        assert_eq!(book.state_of(&ws(1, 0)), Some(AddressState::Tried));
    }

    #[test]
    fn remote_disconnect_evicts_the_peer_while_online() {
        let (mut book, _) = book();
        book.add(None, vec![ws(1, START - 1_000)]);
        connect(&mut book, &ws(1, 0), &ch(1));
        book.apply(
            &ws(1, 0),
            Event::Disconnected {
                channel: ch(1),
                by_remote: true,
            },
        );
        assert_eq!(book.state_of(&ws(1, 0)), None);
    }

    #[test]
    fn remote_disconnect_retains_the_peer_while_offline() {
        // If we lost connectivity ourselves, the hang-up says nothing about
        // the peer.
        let (mut book, _) = offline_book();
        book.add(None, vec![ws(1, START - 1_000)]);
        connect(&mut book, &ws(1, 0), &ch(1));
        book.apply(
            &ws(1, 0),
            Event::Disconnected {
                channel: ch(1),
                by_remote: true,
            },
        );
        assert_eq!(book.state_of(&ws(1, 0)), Some(AddressState::Tried));
    }

    #[test]
    fn dumb_clients_are_evicted_on_any_disconnect() {
        let (mut book, _) = book();
        book.add(None, vec![dumb(1, START - 1_000)]);
        connect(&mut book, &dumb(1, 0), &ch(1));
        book.apply(
            &dumb(1, 0),
            Event::Disconnected {
                channel: ch(1),
                by_remote: false,
            },
        );
        assert_eq!(book.state_of(&dumb(1, 0)), None);
    }

    #[test]
    fn exhausting_the_failure_budget_bans_with_backoff() {
        let (mut book, clock) = book();
        book.add(None, vec![ws(1, START - 1_000)]);

        for _ in 0..MAX_FAILED_ATTEMPTS_WS {
            book.apply(&ws(1, 0), Event::Connecting);
            book.apply(&ws(1, 0), Event::Failure);
        }
        let record = book.store.get(&id(1)).unwrap();
        assert_eq!(record.state(), AddressState::Banned);
        assert_eq!(
            record.banned_until,
            Some(clock.now_ms() + INITIAL_FAILED_BACKOFF)
        );

        // The housekeeper lifts the expired ban and resets the budget.
        clock.advance(INITIAL_FAILED_BACKOFF + 1);
        let unbanned = book.housekeep();
        assert_eq!(unbanned.len(), 1);
        let record = book.store.get(&id(1)).unwrap();
        assert_eq!(record.state(), AddressState::New);
        assert_eq!(record.failed_attempts, 0);

        // Exhausting the budget again bans for twice as long.
        for _ in 0..MAX_FAILED_ATTEMPTS_WS {
            book.apply(&ws(1, 0), Event::Connecting);
            book.apply(&ws(1, 0), Event::Failure);
        }
        let record = book.store.get(&id(1)).unwrap();
        assert_eq!(record.state(), AddressState::Banned);
        assert_eq!(
            record.banned_until,
            Some(clock.now_ms() + 2 * INITIAL_FAILED_BACKOFF)
        );
    }

    #[test]
    fn failure_backoff_is_monotone_and_saturates() {
        let (mut book, clock) = book();
        book.add(None, vec![ws(1, START - 1_000)]);

        let mut last_gap = 0;
        for _ in 0..10 {
            for _ in 0..MAX_FAILED_ATTEMPTS_WS {
                book.apply(&ws(1, 0), Event::Connecting);
                book.apply(&ws(1, 0), Event::Failure);
            }
            let record = book.store.get(&id(1)).unwrap();
            let gap = record.banned_until.unwrap() - clock.now_ms();
            assert!(gap >= last_gap);
            assert!(gap <= MAX_FAILED_BACKOFF);
            last_gap = gap;

            clock.advance(gap + 1);
            book.housekeep();
        }
        assert_eq!(last_gap, MAX_FAILED_BACKOFF);
    }

    #[test]
    fn dumb_clients_ban_on_the_first_failure() {
        let (mut book, _) = book();
        book.add(None, vec![dumb(1, START - 1_000)]);
        book.apply(&dumb(1, 0), Event::Connecting);
        book.apply(&dumb(1, 0), Event::Failure);
        assert_eq!(book.state_of(&dumb(1, 0)), Some(AddressState::Banned));
    }

    #[test]
    fn ban_uses_the_default_duration_when_none_is_given() {
        let (mut book, clock) = book();
        book.add(None, vec![ws(1, START - 1_000)]);
        book.apply(&ws(1, 0), Event::Ban { duration: None });
        let record = book.store.get(&id(1)).unwrap();
        assert_eq!(record.banned_until, Some(clock.now_ms() + DEFAULT_BAN_TIME));

        book.apply(&ws(1, 0), Event::Ban { duration: Some(5_000) });
        let record = book.store.get(&id(1)).unwrap();
        assert_eq!(record.banned_until, Some(clock.now_ms() + 5_000));
    }

    #[test]
    fn ban_creates_records_for_unknown_peers_and_drops_routes() {
        let (mut book, _) = book();
        book.apply(&ws(1, 0), Event::Ban { duration: None });
        assert_eq!(book.state_of(&ws(1, 0)), Some(AddressState::Banned));

        book.add(Some(&ch(1)), vec![rtc(2, START - 1_000, 1)]);
        assert!(book.store.get(&id(2)).unwrap().has_routes());
        book.apply(&rtc(2, 0, 0), Event::Ban { duration: None });
        assert!(!book.store.get(&id(2)).unwrap().has_routes());
    }

    #[test]
    fn expired_administrative_bans_are_removed_outright() {
        let (mut book, clock) = book();
        book.add(None, vec![ws(1, START - 1_000)]);
        book.apply(&ws(1, 0), Event::Ban { duration: Some(1_000) });

        // Not expired yet: the record stays banned.
        book.housekeep();
        assert_eq!(book.state_of(&ws(1, 0)), Some(AddressState::Banned));

        clock.advance(1_001);
        let unbanned = book.housekeep();
        assert!(unbanned.is_empty());
        assert_eq!(book.state_of(&ws(1, 0)), None);
    }

    #[test]
    fn seeds_survive_bans_and_removal() {
        let config = AddressBookConfig::new(own_address()).with_seeds(vec![ws(1, 0)]);
        let (mut book, clock) = book_with(config);
        let seed = ws(1, 0);

        // Banned seeds are not reported as banned and come back as New.
        book.apply(&seed, Event::Ban { duration: Some(1) });
        assert_eq!(book.state_of(&seed), Some(AddressState::Banned));
        assert!(!book.is_banned(&seed));
        clock.advance(2);
        let unbanned = book.housekeep();
        assert_eq!(unbanned.len(), 1);
        assert_eq!(book.state_of(&seed), Some(AddressState::New));

        // Direct removal turns into a back-off ban instead of deletion.
        let backoff = book.store.get(&id(1)).unwrap().ban_backoff;
        book.remove_record(&id(1));
        let record = book.store.get(&id(1)).unwrap();
        assert_eq!(record.state(), AddressState::Banned);
        assert_eq!(record.banned_until, Some(clock.now_ms() + backoff));
    }

    #[test]
    fn seeds_are_evicted_by_remote_disconnects_into_a_ban() {
        let config = AddressBookConfig::new(own_address()).with_seeds(vec![ws(1, 0)]);
        let (mut book, _) = book_with(config);
        let seed = ws(1, 0);
        connect(&mut book, &seed, &ch(1));
        book.apply(
            &seed,
            Event::Disconnected {
                channel: ch(1),
                by_remote: true,
            },
        );
        // Still present, banned instead of deleted.
        assert_eq!(book.state_of(&seed), Some(AddressState::Banned));
        assert!(!book.is_banned(&seed));
    }

    #[test]
    fn unroutable_is_only_trusted_on_the_best_route() {
        let (mut book, _) = book();
        book.add(Some(&ch(1)), vec![rtc(1, START - 1_000, 0)]);
        book.add(Some(&ch(2)), vec![rtc(1, START - 900, 1)]);
        let record = book.store.get(&id(1)).unwrap();
        assert_eq!(record.best_route().unwrap().channel, ch(1));

        // A non-best relay claiming unroutability changes nothing.
        book.apply(&rtc(1, 0, 0), Event::Unroutable { channel: ch(2) });
        let record = book.store.get(&id(1)).unwrap();
        assert_eq!(record.routes().len(), 2);

        // The best relay is believed; the runner-up takes over.
        book.apply(&rtc(1, 0, 0), Event::Unroutable { channel: ch(1) });
        let record = book.store.get(&id(1)).unwrap();
        assert_eq!(record.best_route().unwrap().channel, ch(2));

        // Losing the last route removes the record.
        book.apply(&rtc(1, 0, 0), Event::Unroutable { channel: ch(2) });
        assert!(book.store.get(&id(1)).is_none());
    }

    #[test]
    fn disconnects_revoke_routes_through_the_channel() {
        let (mut book, _) = book();
        // Two RTC peers routed through the same relay channel; one has a
        // second path.
        book.add(Some(&ch(7)), vec![rtc(1, START - 1_000, 0)]);
        book.add(Some(&ch(7)), vec![rtc(2, START - 1_000, 0)]);
        book.add(Some(&ch(8)), vec![rtc(2, START - 900, 1)]);

        // The relay (a WS peer) disconnects.
        book.apply(
            &ws(3, 0),
            Event::Disconnected {
                channel: ch(7),
                by_remote: false,
            },
        );

        assert!(book.store.get(&id(1)).is_none());
        let survivor = book.store.get(&id(2)).unwrap();
        assert_eq!(survivor.routes().len(), 1);
        assert_eq!(survivor.best_route().unwrap().channel, ch(8));
    }

    #[test]
    fn housekeeping_expires_aged_records_but_never_seeds() {
        let config = AddressBookConfig::new(own_address()).with_seeds(vec![ws(9, 0)]);
        let (mut book, clock) = book_with(config);
        book.add(None, vec![ws(1, START - 1_000)]);
        book.add(None, vec![ws(2, START - 1_000)]);
        book.apply(&ws(2, 0), Event::Connecting);

        clock.advance(MAX_AGE_WS + 2_000);
        book.housekeep();

        // The aged New record is gone; Connecting is left alone; the seed
        // stays despite its pinned zero timestamp.
        assert_eq!(book.state_of(&ws(1, 0)), None);
        assert_eq!(book.state_of(&ws(2, 0)), Some(AddressState::Connecting));
        assert_eq!(book.state_of(&ws(9, 0)), Some(AddressState::New));
    }

    #[test]
    fn housekeeping_refreshes_connected_peers() {
        let (mut book, clock) = book();
        book.add(Some(&ch(1)), vec![rtc(1, START - 1_000, 0)]);
        connect(&mut book, &rtc(1, 0, 0), &ch(2));

        clock.advance(60_000);
        book.housekeep();
        let record = book.store.get(&id(1)).unwrap();
        assert_eq!(record.address.timestamp, clock.now_ms());
        assert_eq!(record.best_route().unwrap().timestamp, clock.now_ms());
    }

    #[test]
    fn query_filters_are_sound() {
        let (mut book, clock) = book();
        let config_seed = ws(9, 0);
        book.add(None, vec![config_seed]);

        book.add(None, vec![ws(1, START - 1_000)]); // eligible
        book.add(None, vec![ws(2, START - 1_000)]); // will be banned
        book.add(None, vec![ws(3, START - 1_000)]); // will fail
        book.add(None, vec![dumb(4, START - 1_000)]); // filtered by protocol mask
        book.add(
            None,
            vec![PeerAddress::ws(
                id(5),
                None,
                START - 1_000,
                Services::new(0b01),
            )],
        ); // eligible, has services
        book.add(None, vec![ws(6, START - 1_000)]); // will age out

        book.apply(&ws(2, 0), Event::Ban { duration: None });
        book.apply(&ws(3, 0), Event::Connecting);
        book.apply(&ws(3, 0), Event::Failure);

        // Age out peer 6 only: WS tolerance is generous, so re-add the rest
        // fresh before advancing.
        clock.advance(MAX_AGE_WS - 500);
        book.add(Some(&ch(1)), vec![ws(1, clock.now_ms() - 1_000)]);
        book.add(
            Some(&ch(1)),
            vec![PeerAddress::ws(
                id(5),
                None,
                clock.now_ms() - 1_000,
                Services::new(0b01),
            )],
        );

        let all = book.query(ProtocolMask::WS | ProtocolMask::RTC, Services::NONE, 100);
        let ids: Vec<PeerId> = all.iter().map(|a| a.peer_id).collect();
        assert!(ids.contains(&id(1)));
        assert!(ids.contains(&id(5)));
        assert!(!ids.contains(&id(2)), "banned peers are not queryable");
        assert!(!ids.contains(&id(3)), "failed peers are not queryable");
        assert!(!ids.contains(&id(4)), "protocol mask filters dumb");
        assert!(!ids.contains(&id(6)), "aged peers are not queryable");
        assert!(!ids.contains(&id(9)), "seeds are not gossiped");

        // Service mask filtering.
        let serving = book.query(ProtocolMask::ALL, Services::new(0b01), 100);
        assert_eq!(serving.len(), 1);
        assert_eq!(serving[0].peer_id, id(5));
    }

    #[test]
    fn query_refreshes_stale_connected_peers() {
        let (mut book, clock) = book();
        book.add(None, vec![ws(1, START - 1_000)]);
        connect(&mut book, &ws(1, 0), &ch(1));

        clock.advance(MAX_AGE_WS + 5_000);
        let result = book.query(ProtocolMask::ALL, Services::NONE, 100);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].timestamp, clock.now_ms());
    }

    #[test]
    fn query_ranks_deterministically() {
        let (mut book, clock) = book();
        // Peer 1: one failed attempt behind it.
        book.add(None, vec![ws(1, START - 1_000)]);
        book.apply(&ws(1, 0), Event::Connecting);
        book.apply(&ws(1, 0), Event::Failure);
        book.apply(&ws(1, 0), Event::Connecting);

        // Peer 2: clean record, seen earlier.
        book.add(None, vec![ws(2, START - 1_000)]);

        // Peer 3: clean record, seen later.
        clock.advance(10_000);
        book.add(None, vec![ws(3, clock.now_ms() - 1_000)]);

        // Peers 4 and 5: clean RTC records admitted together, different hop
        // counts.
        book.add(Some(&ch(1)), vec![rtc(4, clock.now_ms() - 1_000, 2)]);
        book.add(Some(&ch(1)), vec![rtc(5, clock.now_ms() - 1_000, 0)]);

        let result = book.query(ProtocolMask::ALL, Services::NONE, 100);
        let ids: Vec<PeerId> = result.iter().map(|a| a.peer_id).collect();
        // Fewest failures first, then most recently seen, then nearest.
        assert_eq!(ids, vec![id(3), id(5), id(4), id(2), id(1)]);

        // Determinism: a second query over the same snapshot agrees.
        let again = book.query(ProtocolMask::ALL, Services::NONE, 100);
        assert_eq!(
            again.iter().map(|a| a.peer_id).collect::<Vec<_>>(),
            ids
        );
    }

    #[test]
    fn query_truncates_to_max_addresses() {
        let (mut book, _) = book();
        for n in 1..=10 {
            book.add(None, vec![ws(n, START - 1_000)]);
        }
        assert_eq!(book.query(ProtocolMask::ALL, Services::NONE, 3).len(), 3);
        assert_eq!(book.query(ProtocolMask::ALL, Services::NONE, 100).len(), 10);
    }

    #[test]
    fn events_for_unknown_peers_are_dropped_silently() {
        let (mut book, _) = book();
        let ghost = ws(1, 0);
        book.apply(&ghost, Event::Connecting);
        book.apply(&ghost, Event::Failure);
        book.apply(
            &ghost,
            Event::Disconnected {
                channel: ch(1),
                by_remote: true,
            },
        );
        book.apply(&ghost, Event::Unroutable { channel: ch(1) });
        assert_eq!(book.address_count(), 0);
    }

    #[test]
    fn signal_index_stays_consistent_with_the_store() {
        let (mut book, _) = book();
        book.add(Some(&ch(1)), vec![rtc(1, START - 1_000, 0)]);
        book.add(Some(&ch(1)), vec![rtc(2, START - 1_000, 0)]);
        book.add(None, vec![ws(3, START - 1_000)]);

        book.apply(&rtc(1, 0, 0), Event::Unroutable { channel: ch(1) });

        // Every remaining RTC record is reachable through its signal id.
        for record in book.store.values() {
            if let Some(signal_id) = record.address.signal_id {
                let via_index = book.store.get_by_signal_id(&signal_id).unwrap();
                assert_eq!(via_index.address.peer_id, record.address.peer_id);
            }
        }
        assert!(book.store.get_by_signal_id(&sig(1)).is_none());
    }
}
