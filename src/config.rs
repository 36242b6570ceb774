//! Configuration for the networking engine.
//!
//! [`Settings`] is read-only after [`P2p::start`](crate::P2p::start); every
//! component holds it behind an `Arc` and consults it directly, so there is
//! no runtime reconfiguration path.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use rand::Rng;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::{
    constants::{MAX_PAYLOAD_WITHOUT_WITNESS, MAX_PAYLOAD_WITH_WITNESS},
    protocol::{addr::AddressItem, types::Services},
    Error,
};

/// A host name (or IP address) and port, as configured for peers and seeds.
///
/// Host names are resolved at connect time, once per connection attempt.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Endpoint {
    /// The host name or literal IP address.
    pub host: String,
    /// The TCP port.
    pub port: u16,
}

impl Endpoint {
    /// Construct an endpoint from parts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }

    /// The authority projection of this endpoint.
    ///
    /// Returns `None` when the host is a DNS name rather than an IP literal.
    pub fn to_authority(&self) -> Option<Authority> {
        self.host
            .parse::<IpAddr>()
            .ok()
            .map(|ip| Authority(SocketAddr::new(ip, self.port)))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s.rsplit_once(':').ok_or(Error::AddressInvalid)?;
        let port = port.parse::<u16>().map_err(|_| Error::AddressInvalid)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(Error::AddressInvalid);
        }
        Ok(Endpoint::new(host, port))
    }
}

impl Serialize for Endpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(|_| {
            de::Error::custom("expected `host:port`, an IPv6 host in brackets")
        })
    }
}

/// The canonical `(ip, port)` identity of a remote endpoint.
///
/// Used for deduplication (one live channel per authority), block/allow
/// lists, and logging. A zero port in a configured list entry acts as a
/// wildcard matching any port on the same address.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Authority(pub SocketAddr);

impl Authority {
    /// An unspecified authority, used for disconnected sockets.
    pub fn unspecified() -> Self {
        Authority(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
    }

    /// The IP address of the authority.
    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    /// The port of the authority.
    pub fn port(&self) -> u16 {
        self.0.port()
    }

    /// True if neither address nor port is specified.
    pub fn is_unspecified(&self) -> bool {
        self.0.ip().is_unspecified() && self.0.port() == 0
    }

    /// List-entry match: same IP, and same port unless this entry's port is
    /// the zero wildcard.
    pub fn matches(&self, other: &Authority) -> bool {
        self.ip() == other.ip() && (self.port() == 0 || self.port() == other.port())
    }
}

impl From<SocketAddr> for Authority {
    fn from(addr: SocketAddr) -> Self {
        Authority(addr)
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Authority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddr>()
            .map(Authority)
            .map_err(|_| Error::AddressInvalid)
    }
}

impl Serialize for Authority {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Authority {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse()
            .map_err(|_| de::Error::custom("expected `ip:port`, an IPv6 ip in brackets"))
    }
}

fn contains(list: &[Authority], authority: &Authority) -> bool {
    list.iter().any(|entry| entry.matches(authority))
}

/// Common network configuration settings.
///
/// Field units follow the configuration surface (seconds/minutes); the
/// duration helpers convert, and randomise where reconnect stampedes are a
/// concern.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Settings {
    /// Worker threads in the shared pool (at least 1).
    pub threads: u32,
    /// Upper bound of addresses sent per `getaddr` response.
    pub address_upper: u16,
    /// Lower bound of addresses sent per `getaddr` response.
    pub address_lower: u16,
    /// The newest protocol version to negotiate.
    pub protocol_maximum: u32,
    /// The oldest protocol version to accept from a peer.
    pub protocol_minimum: u32,
    /// Services advertised in our `version` message.
    pub services_maximum: u64,
    /// Services a peer must advertise to be accepted.
    pub services_minimum: u64,
    /// Service bits that disqualify an address or peer.
    pub invalid_services: u64,
    /// Attach the address protocol after handshakes.
    pub enable_address: bool,
    /// Accept `addrv2`-era announcements.
    pub enable_address_v2: bool,
    /// Advertise witness transaction relay.
    pub enable_witness_tx: bool,
    /// Accept compact block announcements.
    pub enable_compact: bool,
    /// Attach the alert protocol after handshakes.
    pub enable_alert: bool,
    /// Attach the reject protocol after handshakes (BIP61).
    pub enable_reject: bool,
    /// Request transaction relay in our `version` message.
    pub enable_relay: bool,
    /// Accept and use IPv6 addresses.
    pub enable_ipv6: bool,
    /// Allow connections to self (disables loopback detection).
    pub enable_loopback: bool,
    /// Verify payload checksums on inbound messages.
    pub validate_checksum: bool,
    /// The network magic.
    pub identifier: u32,
    /// Maximum concurrent inbound channels (0 disables the inbound session).
    pub inbound_connections: u16,
    /// Target concurrent outbound channels (0 disables the outbound session).
    pub outbound_connections: u16,
    /// Connectors raced per outbound slot.
    pub connect_batch_size: u16,
    /// Base delay before retrying a failed outbound batch, in seconds.
    pub retry_timeout_seconds: u32,
    /// Base deadline for resolve+connect, in seconds.
    pub connect_timeout_seconds: u32,
    /// Deadline for the version handshake, in seconds.
    pub handshake_timeout_seconds: u32,
    /// Deadline for a seed channel to complete its exchange, in seconds.
    pub seeding_timeout_seconds: u32,
    /// Ping cadence, in minutes.
    pub channel_heartbeat_minutes: u32,
    /// Inbound inactivity deadline, in minutes.
    pub channel_inactivity_minutes: u32,
    /// Upper bound of the staggered channel lifetime, in minutes.
    pub channel_expiration_minutes: u32,
    /// Tolerated clock skew against peer `version` timestamps, in minutes.
    pub maximum_skew_minutes: u32,
    /// Capacity of the host pool (0 disables seeding and the pool).
    pub host_pool_capacity: u32,
    /// Minimum socket buffer size, in bytes.
    pub minimum_buffer: u32,
    /// Inbound rate limit, in bytes per second (0 disables).
    pub rate_limit: u32,
    /// The BIP14 user agent advertised in our `version` message.
    pub user_agent: String,
    /// Directory holding the hosts cache file.
    pub path: PathBuf,
    /// Manually maintained peers, connected at `run`.
    pub peers: Vec<Endpoint>,
    /// DNS seed endpoints for initial address discovery.
    pub seeds: Vec<Endpoint>,
    /// Our own advertised addresses.
    pub selfs: Vec<Authority>,
    /// Listener bind addresses.
    pub binds: Vec<Authority>,
    /// Authorities never connected to or accepted.
    pub blacklists: Vec<Authority>,
    /// If non-empty, the only authorities connected to or accepted.
    pub whitelists: Vec<Authority>,
    /// The authority projection of `peers`, set by [`Settings::initialize`].
    #[serde(skip)]
    pub friends: Vec<Authority>,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            threads: 1,
            address_upper: 10,
            address_lower: 5,
            protocol_maximum: crate::constants::MAXIMUM_PROTOCOL,
            protocol_minimum: crate::constants::MINIMUM_PROTOCOL,
            services_maximum: Services::NODE_NETWORK.bits(),
            services_minimum: Services::NODE_NETWORK.bits(),
            invalid_services: 176,
            enable_address: false,
            enable_address_v2: false,
            enable_witness_tx: false,
            enable_compact: false,
            enable_alert: false,
            enable_reject: false,
            enable_relay: false,
            enable_ipv6: false,
            enable_loopback: false,
            validate_checksum: false,
            identifier: 0,
            inbound_connections: 0,
            outbound_connections: 10,
            connect_batch_size: 5,
            retry_timeout_seconds: 1,
            connect_timeout_seconds: 5,
            handshake_timeout_seconds: 30,
            seeding_timeout_seconds: 30,
            channel_heartbeat_minutes: 5,
            channel_inactivity_minutes: 10,
            channel_expiration_minutes: 1440,
            maximum_skew_minutes: 120,
            host_pool_capacity: 0,
            minimum_buffer: 4_000_000,
            rate_limit: 1024,
            user_agent: concat!("/bitcoin-network:", env!("CARGO_PKG_VERSION"), "/").to_string(),
            path: PathBuf::new(),
            peers: Vec::new(),
            seeds: Vec::new(),
            selfs: Vec::new(),
            binds: Vec::new(),
            blacklists: Vec::new(),
            whitelists: Vec::new(),
            friends: Vec::new(),
        }
    }
}

impl Settings {
    /// Mainnet deviations from the defaults.
    pub fn mainnet() -> Settings {
        Settings {
            identifier: 3_652_501_241,
            seeds: vec![
                Endpoint::new("seed.bitcoin.sipa.be", 8333),
                Endpoint::new("dnsseed.bluematt.me", 8333),
                Endpoint::new("dnsseed.bitcoin.dashjr.org", 8333),
                Endpoint::new("seed.bitcoinstats.com", 8333),
            ],
            binds: vec![Authority(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                8333,
            ))],
            ..Settings::default()
        }
    }

    /// Testnet deviations from the defaults.
    pub fn testnet() -> Settings {
        Settings {
            identifier: 118_034_699,
            seeds: vec![
                Endpoint::new("testnet-seed.bitcoin.jonasschnelli.ch", 18333),
                Endpoint::new("seed.tbtc.petertodd.org", 18333),
                Endpoint::new("testnet-seed.bluematt.me", 18333),
            ],
            binds: vec![Authority(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                18333,
            ))],
            ..Settings::default()
        }
    }

    /// Regtest deviations from the defaults. Private network, no seeding.
    pub fn regtest() -> Settings {
        Settings {
            identifier: 3_669_344_250,
            binds: vec![Authority(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                18444,
            ))],
            ..Settings::default()
        }
    }

    /// Set `friends` from `peers`.
    ///
    /// The dynamic conversion is O(N^2) against every gossiped address, so it
    /// is projected once here. DNS-named peers have no authority projection
    /// and are skipped.
    pub fn initialize(&mut self) {
        debug_assert!(self.friends.is_empty(), "friends not empty");
        self.friends = self
            .peers
            .iter()
            .filter_map(Endpoint::to_authority)
            .collect();
    }

    /// True if our advertised services include witness data.
    pub fn witness_node(&self) -> bool {
        self.services_minimum & Services::NODE_WITNESS.bits() != 0
    }

    /// True if the inbound session has work to do.
    pub fn inbound_enabled(&self) -> bool {
        self.inbound_connections > 0 && !self.binds.is_empty()
    }

    /// True if the outbound session has work to do.
    pub fn outbound_enabled(&self) -> bool {
        self.outbound_connections > 0
            && self.host_pool_capacity > 0
            && self.connect_batch_size > 0
    }

    /// True if we advertise our own address to seeds.
    pub fn advertise_enabled(&self) -> bool {
        self.inbound_enabled() && !self.selfs.is_empty()
    }

    /// The payload ceiling, determined by our advertised witness support.
    pub fn maximum_payload(&self) -> usize {
        if self.services_maximum & Services::NODE_WITNESS.bits() != 0 {
            MAX_PAYLOAD_WITH_WITNESS
        } else {
            MAX_PAYLOAD_WITHOUT_WITNESS
        }
    }

    /// The first advertised self address, if any.
    pub fn first_self(&self) -> Option<Authority> {
        self.selfs.first().copied()
    }

    /// Randomized from 50% to maximum milliseconds (specified in seconds).
    pub fn retry_timeout(&self) -> Duration {
        randomized_seconds(self.retry_timeout_seconds)
    }

    /// Randomized from 50% to maximum milliseconds (specified in seconds).
    pub fn connect_timeout(&self) -> Duration {
        randomized_seconds(self.connect_timeout_seconds)
    }

    /// The handshake deadline.
    pub fn channel_handshake(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_seconds.into())
    }

    /// The seed-channel exchange deadline.
    pub fn channel_germination(&self) -> Duration {
        Duration::from_secs(self.seeding_timeout_seconds.into())
    }

    /// The ping cadence.
    pub fn channel_heartbeat(&self) -> Duration {
        Duration::from_secs(u64::from(self.channel_heartbeat_minutes) * 60)
    }

    /// The inbound inactivity deadline.
    pub fn channel_inactivity(&self) -> Duration {
        Duration::from_secs(u64::from(self.channel_inactivity_minutes) * 60)
    }

    /// The upper bound of the staggered channel lifetime.
    pub fn channel_expiration(&self) -> Duration {
        Duration::from_secs(u64::from(self.channel_expiration_minutes) * 60)
    }

    /// The tolerated clock skew.
    pub fn maximum_skew(&self) -> Duration {
        Duration::from_secs(u64::from(self.maximum_skew_minutes) * 60)
    }

    /// The address quorum that ends seeding early.
    pub fn minimum_address_count(&self) -> usize {
        usize::from(self.connect_batch_size) * usize::from(self.outbound_connections)
    }

    /// The hosts cache file location.
    pub fn file(&self) -> PathBuf {
        self.path.join("hosts.cache")
    }

    // Address filters.

    /// The address family is disabled by configuration.
    pub fn disabled(&self, item: &AddressItem) -> bool {
        !self.enable_ipv6 && item.is_v6()
    }

    /// The address lacks a required service bit.
    pub fn insufficient(&self, item: &AddressItem) -> bool {
        item.services & self.services_minimum != self.services_minimum
    }

    /// The address advertises a disqualifying service bit.
    pub fn unsupported(&self, item: &AddressItem) -> bool {
        item.services & self.invalid_services != 0
    }

    /// The address is blacklisted.
    pub fn blacklisted(&self, item: &AddressItem) -> bool {
        contains(&self.blacklists, &item.authority())
    }

    /// The address is whitelisted (vacuously true without a whitelist).
    pub fn whitelisted(&self, item: &AddressItem) -> bool {
        self.whitelists.is_empty() || contains(&self.whitelists, &item.authority())
    }

    /// The address duplicates a configured peer.
    pub fn peered(&self, item: &AddressItem) -> bool {
        contains(&self.friends, &item.authority())
    }

    /// The address is excluded from the host pool.
    pub fn excluded(&self, item: &AddressItem) -> bool {
        !item.is_specified()
            || self.disabled(item)
            || self.insufficient(item)
            || self.unsupported(item)
            || self.peered(item)
            || self.blacklisted(item)
            || !self.whitelisted(item)
    }

    /// Authority gate applied to incoming connections.
    pub fn blocked(&self, authority: &Authority) -> bool {
        contains(&self.blacklists, authority)
            || !(self.whitelists.is_empty() || contains(&self.whitelists, authority))
    }
}

fn randomized_seconds(seconds: u32) -> Duration {
    let to = u64::from(seconds) * 1_000;
    let from = u64::from(seconds) * 500;
    if to == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(from..=to))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(ip: &str, port: u16, services: u64) -> AddressItem {
        AddressItem {
            timestamp: 0,
            services,
            ip: ip.parse().expect("test ip should parse"),
            port,
        }
    }

    #[test]
    fn endpoint_round_trips_through_display() {
        let v4: Endpoint = "seed.example.net:8333".parse().expect("should parse");
        assert_eq!(v4, Endpoint::new("seed.example.net", 8333));
        assert_eq!(v4.to_string().parse::<Endpoint>().expect("reparse"), v4);

        let v6: Endpoint = "[2001:db8::1]:8333".parse().expect("should parse");
        assert_eq!(v6.host, "2001:db8::1");
        assert_eq!(v6.to_string(), "[2001:db8::1]:8333");

        assert!("8333".parse::<Endpoint>().is_err());
        assert!("host:notaport".parse::<Endpoint>().is_err());
    }

    #[test]
    fn authority_wildcard_port_matches() {
        let entry: Authority = "203.0.113.6:0".parse().expect("should parse");
        let peer: Authority = "203.0.113.6:8333".parse().expect("should parse");
        let other: Authority = "203.0.113.7:8333".parse().expect("should parse");
        assert!(entry.matches(&peer));
        assert!(!entry.matches(&other));
        assert!(!peer.matches(&entry));
    }

    #[test]
    fn excluded_composes_the_filters() {
        let mut settings = Settings {
            services_minimum: Services::NODE_NETWORK.bits(),
            invalid_services: 176,
            ..Settings::default()
        };
        settings.blacklists.push("203.0.113.9:0".parse().expect("authority"));
        settings.peers.push(Endpoint::new("203.0.113.10", 8333));
        settings.initialize();

        let good = item("203.0.113.6", 8333, Services::NODE_NETWORK.bits());
        assert!(!settings.excluded(&good));

        // Unspecified.
        assert!(settings.excluded(&item("0.0.0.0", 0, 1)));
        // IPv6 disabled by default.
        assert!(settings.excluded(&item("2001:db8::1", 8333, 1)));
        // Missing required services.
        assert!(settings.excluded(&item("203.0.113.6", 8333, 0)));
        // Invalid service bits.
        assert!(settings.excluded(&item("203.0.113.6", 8333, 1 | 16)));
        // Blacklisted, any port.
        assert!(settings.excluded(&item("203.0.113.9", 1234, 1)));
        // Already a configured peer.
        assert!(settings.excluded(&item("203.0.113.10", 8333, 1)));
    }

    #[test]
    fn whitelist_restricts_when_present() {
        let mut settings = Settings::default();
        let good = item("203.0.113.6", 8333, 1);
        assert!(settings.whitelisted(&good));

        settings.whitelists.push("203.0.113.7:0".parse().expect("authority"));
        assert!(!settings.whitelisted(&good));
        assert!(settings.whitelisted(&item("203.0.113.7", 8333, 1)));

        assert!(settings.blocked(&"203.0.113.6:8333".parse().expect("authority")));
        assert!(!settings.blocked(&"203.0.113.7:8333".parse().expect("authority")));
    }

    #[test]
    fn randomized_timeouts_stay_in_range() {
        let settings = Settings {
            connect_timeout_seconds: 4,
            retry_timeout_seconds: 2,
            ..Settings::default()
        };
        for _ in 0..32 {
            let connect = settings.connect_timeout();
            assert!(connect >= Duration::from_millis(2_000));
            assert!(connect <= Duration::from_millis(4_000));
            let retry = settings.retry_timeout();
            assert!(retry >= Duration::from_millis(1_000));
            assert!(retry <= Duration::from_millis(2_000));
        }
    }

    #[test]
    fn presets_set_identifier_and_binds() {
        assert_eq!(Settings::mainnet().identifier, 3_652_501_241);
        assert_eq!(Settings::testnet().identifier, 118_034_699);
        assert_eq!(Settings::regtest().identifier, 3_669_344_250);
        assert!(Settings::regtest().seeds.is_empty());
        assert_eq!(Settings::mainnet().binds[0].port(), 8333);
    }

    #[test]
    fn initialize_projects_ip_peers_only() {
        let mut settings = Settings::default();
        settings.peers.push(Endpoint::new("peer.example.net", 8333));
        settings.peers.push(Endpoint::new("203.0.113.10", 8333));
        settings.initialize();
        assert_eq!(
            settings.friends,
            vec!["203.0.113.10:8333".parse::<Authority>().expect("authority")]
        );
    }
}
