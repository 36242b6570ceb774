//! An address-with-metadata type used in Bitcoin networking.

use std::{
    io::{Read, Write},
    net::{IpAddr, Ipv6Addr, SocketAddr},
};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{config::Authority, Error};

/// An address with its advertised services and last-seen time, as carried in
/// `addr` messages and the hosts cache.
///
/// `timestamp` is seconds since the epoch; for gossiped addresses it is the
/// unverified time provided by the remote peer that sent the address.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct AddressItem {
    /// The last time the address was seen, per its source.
    pub timestamp: u32,
    /// The services advertised for the address, per its source.
    pub services: u64,
    /// The IP address.
    pub ip: IpAddr,
    /// The TCP port.
    pub port: u16,
}

impl AddressItem {
    /// Construct an item from an authority.
    pub fn from_authority(authority: Authority, services: u64, timestamp: u32) -> Self {
        AddressItem {
            timestamp,
            services,
            ip: authority.ip(),
            port: authority.port(),
        }
    }

    /// The authority identity of this address.
    pub fn authority(&self) -> Authority {
        Authority(SocketAddr::new(self.ip, self.port))
    }

    /// True for addresses that are not representable as IPv4.
    pub fn is_v6(&self) -> bool {
        match self.ip {
            IpAddr::V4(_) => false,
            IpAddr::V6(ip) => ip.to_ipv4_mapped().is_none(),
        }
    }

    /// True if both address and port are specified.
    pub fn is_specified(&self) -> bool {
        !self.ip.is_unspecified() && self.port != 0
    }

    /// Write the item, optionally including the leading timestamp.
    ///
    /// `version` message address fields omit the timestamp; `addr` items and
    /// the hosts cache include it.
    pub fn write<W: Write>(&self, writer: &mut W, with_timestamp: bool) -> Result<(), Error> {
        if with_timestamp {
            writer
                .write_u32::<LittleEndian>(self.timestamp)
                .map_err(|_| Error::BadStream)?;
        }
        writer
            .write_u64::<LittleEndian>(self.services)
            .map_err(|_| Error::BadStream)?;
        let ip = match self.ip {
            IpAddr::V4(ip) => ip.to_ipv6_mapped(),
            IpAddr::V6(ip) => ip,
        };
        writer.write_all(&ip.octets()).map_err(|_| Error::BadStream)?;
        writer
            .write_u16::<BigEndian>(self.port)
            .map_err(|_| Error::BadStream)?;
        Ok(())
    }

    /// Read an item, optionally expecting the leading timestamp.
    pub fn read<R: Read>(reader: &mut R, with_timestamp: bool) -> Result<Self, Error> {
        let timestamp = if with_timestamp {
            reader
                .read_u32::<LittleEndian>()
                .map_err(|_| Error::InvalidMessage)?
        } else {
            0
        };
        let services = reader
            .read_u64::<LittleEndian>()
            .map_err(|_| Error::InvalidMessage)?;
        let mut octets = [0u8; 16];
        reader
            .read_exact(&mut octets)
            .map_err(|_| Error::InvalidMessage)?;
        let v6 = Ipv6Addr::from(octets);
        let ip = match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        };
        let port = reader
            .read_u16::<BigEndian>()
            .map_err(|_| Error::InvalidMessage)?;
        Ok(AddressItem {
            timestamp,
            services,
            ip,
            port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(ip: &str, port: u16) -> AddressItem {
        AddressItem {
            timestamp: 1_568_000_000,
            services: 1,
            ip: ip.parse().expect("test ip should parse"),
            port,
        }
    }

    #[test]
    fn round_trip_with_timestamp() {
        for address in [item("203.0.113.6", 8333), item("2001:db8::1", 18333)] {
            let mut bytes = Vec::new();
            address.write(&mut bytes, true).expect("write");
            assert_eq!(bytes.len(), 4 + 8 + 16 + 2);
            let parsed =
                AddressItem::read(&mut bytes.as_slice(), true).expect("read");
            assert_eq!(parsed, address);
        }
    }

    #[test]
    fn round_trip_without_timestamp() {
        let address = item("203.0.113.6", 8333);
        let mut bytes = Vec::new();
        address.write(&mut bytes, false).expect("write");
        assert_eq!(bytes.len(), 8 + 16 + 2);
        let parsed = AddressItem::read(&mut bytes.as_slice(), false).expect("read");
        assert_eq!(parsed.timestamp, 0);
        assert_eq!(parsed.authority(), address.authority());
    }

    #[test]
    fn v4_mapped_addresses_read_back_as_v4() {
        let address = item("203.0.113.6", 8333);
        let mut bytes = Vec::new();
        address.write(&mut bytes, true).expect("write");
        let parsed = AddressItem::read(&mut bytes.as_slice(), true).expect("read");
        assert!(matches!(parsed.ip, IpAddr::V4(_)));
        assert!(!parsed.is_v6());
    }

    #[test]
    fn truncated_input_is_invalid() {
        let address = item("203.0.113.6", 8333);
        let mut bytes = Vec::new();
        address.write(&mut bytes, true).expect("write");
        bytes.truncate(bytes.len() - 1);
        assert_eq!(
            AddressItem::read(&mut bytes.as_slice(), true),
            Err(Error::InvalidMessage)
        );
    }

    #[test]
    fn specified_requires_ip_and_port() {
        assert!(item("203.0.113.6", 8333).is_specified());
        assert!(!item("0.0.0.0", 8333).is_specified());
        assert!(!item("203.0.113.6", 0).is_specified());
    }
}
