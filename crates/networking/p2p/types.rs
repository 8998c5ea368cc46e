use crate::config::{MAX_AGE_DUMB, MAX_AGE_RTC, MAX_AGE_WS, MAX_FAILED_ATTEMPTS_RTC, MAX_FAILED_ATTEMPTS_WS};
use serde::{Deserialize, Serialize, ser::Serializer};
use sha2::{Digest, Sha256};
use std::{
    fmt::{self, Display},
    hash::{Hash, Hasher},
    net::IpAddr,
    str::FromStr,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AddressParseError {
    #[error("Invalid format: {0}")]
    InvalidFormat(String),
    #[error("Invalid identity: {0}")]
    InvalidId(#[from] hex::FromHexError),
    #[error("Invalid host: {0}")]
    InvalidHost(#[from] std::net::AddrParseError),
    #[error("Missing field: {0}")]
    MissingField(String),
}

/// Stable peer identity: the hash of the peer's public key.
///
/// All address equality and every store index go through this key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 32]);

impl PeerId {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derives the identity key from a raw public key.
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let digest = Sha256::digest(public_key);
        Self(digest.into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

impl FromStr for PeerId {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| AddressParseError::InvalidFormat("peer id must be 32 bytes".into()))?;
        Ok(Self(bytes))
    }
}

/// Identity of an RTC peer on the signaling layer. Independent from [`PeerId`];
/// signaling relays address each other by this id.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalId([u8; 16]);

impl SignalId {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignalId({self})")
    }
}

impl FromStr for SignalId {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        let bytes: [u8; 16] = bytes
            .try_into()
            .map_err(|_| AddressParseError::InvalidFormat("signal id must be 16 bytes".into()))?;
        Ok(Self(bytes))
    }
}

/// Transport protocol a peer is reachable over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Direct TCP/WebSocket.
    Ws,
    /// WebRTC, reached through signaling channels.
    Rtc,
    /// One-way client that cannot accept inbound connections.
    Dumb,
}

impl Protocol {
    /// Maximum tolerated address age before garbage collection.
    pub const fn max_age(&self) -> u64 {
        match self {
            Protocol::Ws => MAX_AGE_WS,
            Protocol::Rtc => MAX_AGE_RTC,
            Protocol::Dumb => MAX_AGE_DUMB,
        }
    }

    /// Connection failures tolerated before the record self-bans.
    /// Dumb clients fail immediately.
    pub const fn max_failed_attempts(&self) -> u32 {
        match self {
            Protocol::Ws => MAX_FAILED_ATTEMPTS_WS,
            Protocol::Rtc => MAX_FAILED_ATTEMPTS_RTC,
            Protocol::Dumb => 0,
        }
    }

    const fn scheme(&self) -> &'static str {
        match self {
            Protocol::Ws => "ws",
            Protocol::Rtc => "rtc",
            Protocol::Dumb => "dumb",
        }
    }
}

/// Protocol selector used by [`query`](crate::address_book::AddressBook::query).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolMask(u8);

impl ProtocolMask {
    pub const NONE: ProtocolMask = ProtocolMask(0);
    pub const WS: ProtocolMask = ProtocolMask(1);
    pub const RTC: ProtocolMask = ProtocolMask(2);
    pub const DUMB: ProtocolMask = ProtocolMask(4);
    pub const ALL: ProtocolMask = ProtocolMask(1 | 2 | 4);

    pub const fn contains(&self, protocol: Protocol) -> bool {
        let bit = match protocol {
            Protocol::Ws => 1,
            Protocol::Rtc => 2,
            Protocol::Dumb => 4,
        };
        self.0 & bit != 0
    }
}

impl std::ops::BitOr for ProtocolMask {
    type Output = ProtocolMask;

    fn bitor(self, rhs: ProtocolMask) -> ProtocolMask {
        ProtocolMask(self.0 | rhs.0)
    }
}

/// Service bits a peer advertises. Opaque to the book; queries filter on a
/// required subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Services(u32);

impl Services {
    pub const NONE: Services = Services(0);
    pub const ALL: Services = Services(u32::MAX);

    pub const fn new(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// True when every bit of `required` is advertised.
    pub const fn contains(&self, required: Services) -> bool {
        self.0 & required.0 == required.0
    }
}

impl std::ops::BitOr for Services {
    type Output = Services;

    fn bitor(self, rhs: Services) -> Services {
        Services(self.0 | rhs.0)
    }
}

/// Network location of a peer, when one is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetAddress(IpAddr);

impl NetAddress {
    pub const fn new(ip: IpAddr) -> Self {
        Self(ip)
    }

    pub const fn ip(&self) -> IpAddr {
        self.0
    }
}

impl From<IpAddr> for NetAddress {
    fn from(ip: IpAddr) -> Self {
        Self(ip)
    }
}

impl Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a live connection. Channels outlive no one: the book refers
/// to connections by id only, never by owned handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u64);

/// Handle for a live peer connection, compared by identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerChannel {
    id: ChannelId,
}

impl PeerChannel {
    pub const fn new(id: ChannelId) -> Self {
        Self { id }
    }

    pub const fn id(&self) -> ChannelId {
        self.id
    }
}

/// Identity and location of a remote peer.
///
/// Two addresses are equal iff their identity keys match; every other field
/// is advertisement data that may be replaced under the admission rules of
/// the address book. A `timestamp` of `0` marks a seed: a bootstrap address
/// that is never evicted and whose timestamp stays pinned.
#[derive(Debug, Clone)]
pub struct PeerAddress {
    pub protocol: Protocol,
    pub peer_id: PeerId,
    pub net_address: Option<NetAddress>,
    /// Milliseconds since epoch; `0` marks a seed.
    pub timestamp: u64,
    pub services: Services,
    /// Relay identity, RTC only.
    pub signal_id: Option<SignalId>,
    /// Hops from this node through signaling, RTC only.
    pub distance: u8,
}

impl PeerAddress {
    pub fn ws(
        peer_id: PeerId,
        net_address: Option<NetAddress>,
        timestamp: u64,
        services: Services,
    ) -> Self {
        Self {
            protocol: Protocol::Ws,
            peer_id,
            net_address,
            timestamp,
            services,
            signal_id: None,
            distance: 0,
        }
    }

    pub fn rtc(peer_id: PeerId, signal_id: SignalId, timestamp: u64, services: Services) -> Self {
        Self {
            protocol: Protocol::Rtc,
            peer_id,
            net_address: None,
            timestamp,
            services,
            signal_id: Some(signal_id),
            distance: 0,
        }
    }

    pub fn dumb(peer_id: PeerId, timestamp: u64, services: Services) -> Self {
        Self {
            protocol: Protocol::Dumb,
            peer_id,
            net_address: None,
            timestamp,
            services,
            signal_id: None,
            distance: 0,
        }
    }

    /// Seeds are bootstrap addresses configured at startup. Their timestamp
    /// is pinned to `0` for the lifetime of the node.
    pub const fn is_seed(&self) -> bool {
        self.timestamp == 0
    }

    /// Whether the advertisement is older than the protocol tolerates.
    pub const fn exceeds_age(&self, now: u64) -> bool {
        now.saturating_sub(self.timestamp) > self.protocol.max_age()
    }
}

impl PartialEq for PeerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.peer_id == other.peer_id
    }
}

impl Eq for PeerAddress {}

impl Hash for PeerAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.peer_id.hash(state);
    }
}

impl Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol.scheme(), self.peer_id)?;
        if let Some(signal_id) = &self.signal_id {
            write!(f, "/{signal_id}")?;
        }
        if let Some(net_address) = &self.net_address {
            write!(f, "@{net_address}")?;
        }
        Ok(())
    }
}

impl FromStr for PeerAddress {
    type Err = AddressParseError;

    /// Parses the configuration form of an address:
    /// `ws://<peer id>[@<ip>]`, `rtc://<peer id>/<signal id>` or
    /// `dumb://<peer id>`. Parsed addresses are seeds (`timestamp = 0`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| AddressParseError::InvalidFormat("missing scheme".into()))?;
        match scheme {
            "ws" => {
                let (id, host) = match rest.split_once('@') {
                    Some((id, host)) => (id, Some(host)),
                    None => (rest, None),
                };
                let net_address = host
                    .map(|h| h.parse::<IpAddr>().map(NetAddress::new))
                    .transpose()?;
                Ok(PeerAddress::ws(
                    id.parse()?,
                    net_address,
                    0,
                    Services::NONE,
                ))
            }
            "rtc" => {
                let (id, signal) = rest
                    .split_once('/')
                    .ok_or_else(|| AddressParseError::MissingField("signal id".into()))?;
                Ok(PeerAddress::rtc(
                    id.parse()?,
                    signal.parse()?,
                    0,
                    Services::NONE,
                ))
            }
            "dumb" => Ok(PeerAddress::dumb(rest.parse()?, 0, Services::NONE)),
            other => Err(AddressParseError::InvalidFormat(format!(
                "unknown scheme {other:?}"
            ))),
        }
    }
}

impl Serialize for PeerAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PeerAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        PeerAddress::from_str(&<String>::deserialize(deserializer)?)
            .map_err(|e| serde::de::Error::custom(format!("{e}")))
    }
}
