//! The closed message identifier enumeration and the typed payloads the
//! engine speaks.
//!
//! Every command that can appear in a heading has an [`Identifier`], so the
//! channel read loop can classify frames. Full body codecs exist only for the
//! messages the engine's own protocols exchange; block- and transaction-class
//! bodies are out of scope and their frames are discarded unless an external
//! subscriber deserializes them itself.

use std::{
    fmt,
    io::{Cursor, Read, Write},
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{
    constants::{BIP31_VERSION, MAX_ADDRESSES_PER_MESSAGE},
    protocol::{
        addr::AddressItem,
        codec::{read_var_int, read_var_string, write_var_int, write_var_string},
    },
    Error,
};

/// The closed enumeration of wire message identifiers.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Identifier {
    /// `addr`
    Address,
    /// `alert`
    Alert,
    /// `block`
    Block,
    /// `filteradd`
    BloomFilterAdd,
    /// `filterclear`
    BloomFilterClear,
    /// `filterload`
    BloomFilterLoad,
    /// `cfilter`
    ClientFilter,
    /// `cfcheckpt`
    ClientFilterCheckpoint,
    /// `cfheaders`
    ClientFilterHeaders,
    /// `cmpctblock`
    CompactBlock,
    /// `blocktxn`
    CompactTransactions,
    /// `feefilter`
    FeeFilter,
    /// `getaddr`
    GetAddress,
    /// `getblocks`
    GetBlocks,
    /// `getcfcheckpt`
    GetClientFilterCheckpoint,
    /// `getcfheaders`
    GetClientFilterHeaders,
    /// `getcfilters`
    GetClientFilters,
    /// `getblocktxn`
    GetCompactTransactions,
    /// `getdata`
    GetData,
    /// `getheaders`
    GetHeaders,
    /// `headers`
    Headers,
    /// `inv`
    Inventory,
    /// `mempool`
    MemoryPool,
    /// `merkleblock`
    MerkleBlock,
    /// `notfound`
    NotFound,
    /// `ping`
    Ping,
    /// `pong`
    Pong,
    /// `reject`
    Reject,
    /// `sendaddrv2`
    SendAddressV2,
    /// `sendcmpct`
    SendCompact,
    /// `sendheaders`
    SendHeaders,
    /// `tx`
    Transaction,
    /// `version`
    Version,
    /// `verack`
    VersionAcknowledge,
    /// `wtxidrelay`
    WitnessTxIdRelay,
}

impl Identifier {
    /// The zero-padded command field for this identifier.
    //
    // Note: because all match arms must have the same type, and the array
    // length is part of the type, having at least one of length 12 checks
    // that they are all of length 12, as they must be &[u8; 12].
    pub fn command(&self) -> &'static [u8; 12] {
        use Identifier::*;
        match self {
            Address => b"addr\0\0\0\0\0\0\0\0",
            Alert => b"alert\0\0\0\0\0\0\0",
            Block => b"block\0\0\0\0\0\0\0",
            BloomFilterAdd => b"filteradd\0\0\0",
            BloomFilterClear => b"filterclear\0",
            BloomFilterLoad => b"filterload\0\0",
            ClientFilter => b"cfilter\0\0\0\0\0",
            ClientFilterCheckpoint => b"cfcheckpt\0\0\0",
            ClientFilterHeaders => b"cfheaders\0\0\0",
            CompactBlock => b"cmpctblock\0\0",
            CompactTransactions => b"blocktxn\0\0\0\0",
            FeeFilter => b"feefilter\0\0\0",
            GetAddress => b"getaddr\0\0\0\0\0",
            GetBlocks => b"getblocks\0\0\0",
            GetClientFilterCheckpoint => b"getcfcheckpt",
            GetClientFilterHeaders => b"getcfheaders",
            GetClientFilters => b"getcfilters\0",
            GetCompactTransactions => b"getblocktxn\0",
            GetData => b"getdata\0\0\0\0\0",
            GetHeaders => b"getheaders\0\0",
            Headers => b"headers\0\0\0\0\0",
            Inventory => b"inv\0\0\0\0\0\0\0\0\0",
            MemoryPool => b"mempool\0\0\0\0\0",
            MerkleBlock => b"merkleblock\0",
            NotFound => b"notfound\0\0\0\0",
            Ping => b"ping\0\0\0\0\0\0\0\0",
            Pong => b"pong\0\0\0\0\0\0\0\0",
            Reject => b"reject\0\0\0\0\0\0",
            SendAddressV2 => b"sendaddrv2\0\0",
            SendCompact => b"sendcmpct\0\0\0",
            SendHeaders => b"sendheaders\0",
            Transaction => b"tx\0\0\0\0\0\0\0\0\0\0",
            Version => b"version\0\0\0\0\0",
            VersionAcknowledge => b"verack\0\0\0\0\0\0",
            WitnessTxIdRelay => b"wtxidrelay\0\0",
        }
    }

    /// Classify a heading command field.
    ///
    /// Returns `None` for commands outside the enumeration; the caller
    /// discards the payload and continues.
    pub fn from_command(command: &[u8; 12]) -> Option<Identifier> {
        use Identifier::*;
        Some(match command {
            b"addr\0\0\0\0\0\0\0\0" => Address,
            b"alert\0\0\0\0\0\0\0" => Alert,
            b"block\0\0\0\0\0\0\0" => Block,
            b"filteradd\0\0\0" => BloomFilterAdd,
            b"filterclear\0" => BloomFilterClear,
            b"filterload\0\0" => BloomFilterLoad,
            b"cfilter\0\0\0\0\0" => ClientFilter,
            b"cfcheckpt\0\0\0" => ClientFilterCheckpoint,
            b"cfheaders\0\0\0" => ClientFilterHeaders,
            b"cmpctblock\0\0" => CompactBlock,
            b"blocktxn\0\0\0\0" => CompactTransactions,
            b"feefilter\0\0\0" => FeeFilter,
            b"getaddr\0\0\0\0\0" => GetAddress,
            b"getblocks\0\0\0" => GetBlocks,
            b"getcfcheckpt" => GetClientFilterCheckpoint,
            b"getcfheaders" => GetClientFilterHeaders,
            b"getcfilters\0" => GetClientFilters,
            b"getblocktxn\0" => GetCompactTransactions,
            b"getdata\0\0\0\0\0" => GetData,
            b"getheaders\0\0" => GetHeaders,
            b"headers\0\0\0\0\0" => Headers,
            b"inv\0\0\0\0\0\0\0\0\0" => Inventory,
            b"mempool\0\0\0\0\0" => MemoryPool,
            b"merkleblock\0" => MerkleBlock,
            b"notfound\0\0\0\0" => NotFound,
            b"ping\0\0\0\0\0\0\0\0" => Ping,
            b"pong\0\0\0\0\0\0\0\0" => Pong,
            b"reject\0\0\0\0\0\0" => Reject,
            b"sendaddrv2\0\0" => SendAddressV2,
            b"sendcmpct\0\0\0" => SendCompact,
            b"sendheaders\0" => SendHeaders,
            b"tx\0\0\0\0\0\0\0\0\0\0" => Transaction,
            b"version\0\0\0\0\0" => Version,
            b"verack\0\0\0\0\0\0" => VersionAcknowledge,
            b"wtxidrelay\0\0" => WitnessTxIdRelay,
            _ => return None,
        })
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let command = self.command();
        let end = command.iter().position(|&b| b == 0).unwrap_or(command.len());
        f.write_str(&String::from_utf8_lossy(&command[..end]))
    }
}

/// A message body that can be carried in a frame.
///
/// `version` is the channel's negotiated protocol version; field presence is
/// version-gated where the protocol gates it (ping nonces, the version relay
/// flag).
pub trait Payload: fmt::Debug + Clone + Send + Sync + Sized + 'static {
    /// The identifier this payload is framed under.
    const IDENTIFIER: Identifier;

    /// Write the body for the given negotiated version.
    fn serialize<W: Write>(&self, version: u32, writer: &mut W) -> Result<(), Error>;

    /// Parse the body for the given negotiated version.
    fn deserialize(version: u32, bytes: &[u8]) -> Result<Self, Error>;
}

/// The `version` handshake message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Version {
    /// The sender's newest supported protocol version.
    pub version: u32,
    /// The sender's advertised services.
    pub services: u64,
    /// The sender's clock, seconds since the epoch.
    pub timestamp: i64,
    /// The receiving peer, as seen by the sender.
    pub address_receive: AddressItem,
    /// The sender's own address.
    pub address_sender: AddressItem,
    /// The sender's channel nonce, used for loopback detection.
    pub nonce: u64,
    /// The sender's BIP14 user agent.
    pub user_agent: String,
    /// The sender's best block height.
    pub start_height: u32,
    /// Whether the sender wants unsolicited transaction relay (BIP37).
    pub relay: bool,
}

impl Payload for Version {
    const IDENTIFIER: Identifier = Identifier::Version;

    fn serialize<W: Write>(&self, _version: u32, writer: &mut W) -> Result<(), Error> {
        writer
            .write_u32::<LittleEndian>(self.version)
            .and_then(|_| writer.write_u64::<LittleEndian>(self.services))
            .and_then(|_| writer.write_i64::<LittleEndian>(self.timestamp))
            .map_err(|_| Error::BadStream)?;
        self.address_receive.write(writer, false)?;
        self.address_sender.write(writer, false)?;
        writer
            .write_u64::<LittleEndian>(self.nonce)
            .map_err(|_| Error::BadStream)?;
        write_var_string(writer, &self.user_agent)?;
        writer
            .write_u32::<LittleEndian>(self.start_height)
            .map_err(|_| Error::BadStream)?;
        writer
            .write_u8(u8::from(self.relay))
            .map_err(|_| Error::BadStream)?;
        Ok(())
    }

    fn deserialize(_version: u32, bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = Cursor::new(bytes);
        let version = reader
            .read_u32::<LittleEndian>()
            .map_err(|_| Error::InvalidMessage)?;
        let services = reader
            .read_u64::<LittleEndian>()
            .map_err(|_| Error::InvalidMessage)?;
        let timestamp = reader
            .read_i64::<LittleEndian>()
            .map_err(|_| Error::InvalidMessage)?;
        let address_receive = AddressItem::read(&mut reader, false)?;
        let address_sender = AddressItem::read(&mut reader, false)?;
        let nonce = reader
            .read_u64::<LittleEndian>()
            .map_err(|_| Error::InvalidMessage)?;
        let user_agent = read_var_string(&mut reader)?;
        let start_height = reader
            .read_u32::<LittleEndian>()
            .map_err(|_| Error::InvalidMessage)?;
        // The relay flag is absent before BIP37 peers; tolerate both forms.
        let relay = matches!(reader.read_u8(), Ok(value) if value != 0);
        Ok(Version {
            version,
            services,
            timestamp,
            address_receive,
            address_sender,
            nonce,
            user_agent,
            start_height,
            relay,
        })
    }
}

/// The empty `verack` handshake acknowledgement.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct VersionAcknowledge;

impl Payload for VersionAcknowledge {
    const IDENTIFIER: Identifier = Identifier::VersionAcknowledge;

    fn serialize<W: Write>(&self, _version: u32, _writer: &mut W) -> Result<(), Error> {
        Ok(())
    }

    fn deserialize(_version: u32, _bytes: &[u8]) -> Result<Self, Error> {
        Ok(VersionAcknowledge)
    }
}

/// A `ping`. The nonce exists only at BIP31 and above; below that the
/// payload is empty and the nonce reads as zero.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Ping {
    /// The echo nonce (zero below BIP31).
    pub nonce: u64,
}

impl Payload for Ping {
    const IDENTIFIER: Identifier = Identifier::Ping;

    fn serialize<W: Write>(&self, version: u32, writer: &mut W) -> Result<(), Error> {
        if version >= BIP31_VERSION {
            writer
                .write_u64::<LittleEndian>(self.nonce)
                .map_err(|_| Error::BadStream)?;
        }
        Ok(())
    }

    fn deserialize(version: u32, bytes: &[u8]) -> Result<Self, Error> {
        if version >= BIP31_VERSION && bytes.len() >= 8 {
            let mut reader = Cursor::new(bytes);
            let nonce = reader
                .read_u64::<LittleEndian>()
                .map_err(|_| Error::InvalidMessage)?;
            Ok(Ping { nonce })
        } else {
            Ok(Ping { nonce: 0 })
        }
    }
}

/// A `pong` reply (BIP31 and above only).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Pong {
    /// The nonce echoed from the corresponding ping.
    pub nonce: u64,
}

impl Payload for Pong {
    const IDENTIFIER: Identifier = Identifier::Pong;

    fn serialize<W: Write>(&self, _version: u32, writer: &mut W) -> Result<(), Error> {
        writer
            .write_u64::<LittleEndian>(self.nonce)
            .map_err(|_| Error::BadStream)
    }

    fn deserialize(_version: u32, bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = Cursor::new(bytes);
        let nonce = reader
            .read_u64::<LittleEndian>()
            .map_err(|_| Error::InvalidMessage)?;
        Ok(Pong { nonce })
    }
}

/// An `addr` gossip message.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Address {
    /// The gossiped address items.
    pub addresses: Vec<AddressItem>,
}

impl Payload for Address {
    const IDENTIFIER: Identifier = Identifier::Address;

    fn serialize<W: Write>(&self, _version: u32, writer: &mut W) -> Result<(), Error> {
        debug_assert!(self.addresses.len() <= MAX_ADDRESSES_PER_MESSAGE);
        write_var_int(writer, self.addresses.len() as u64)?;
        for address in &self.addresses {
            address.write(writer, true)?;
        }
        Ok(())
    }

    fn deserialize(_version: u32, bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = Cursor::new(bytes);
        let count = read_var_int(&mut reader)? as usize;
        if count > MAX_ADDRESSES_PER_MESSAGE {
            return Err(Error::InvalidMessage);
        }
        let mut addresses = Vec::with_capacity(count);
        for _ in 0..count {
            addresses.push(AddressItem::read(&mut reader, true)?);
        }
        Ok(Address { addresses })
    }
}

/// The empty `getaddr` request.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct GetAddress;

impl Payload for GetAddress {
    const IDENTIFIER: Identifier = Identifier::GetAddress;

    fn serialize<W: Write>(&self, _version: u32, _writer: &mut W) -> Result<(), Error> {
        Ok(())
    }

    fn deserialize(_version: u32, _bytes: &[u8]) -> Result<Self, Error> {
        Ok(GetAddress)
    }
}

/// The machine-readable rejection category in a `reject` message (BIP61).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RejectReason {
    /// The message could not be decoded.
    Malformed,
    /// The item is invalid per consensus.
    Invalid,
    /// The version or item is obsolete.
    Obsolete,
    /// The item duplicates one already processed.
    Duplicate,
    /// The transaction is nonstandard.
    Nonstandard,
    /// The output value is dust.
    Dust,
    /// The fee is insufficient.
    InsufficientFee,
    /// The block conflicts with a checkpoint.
    Checkpoint,
    /// Any other reason.
    Other,
}

impl RejectReason {
    fn to_byte(self) -> u8 {
        use RejectReason::*;
        match self {
            Malformed => 0x01,
            Invalid => 0x10,
            Obsolete => 0x11,
            Duplicate => 0x12,
            Nonstandard => 0x40,
            Dust => 0x41,
            InsufficientFee => 0x42,
            Checkpoint => 0x43,
            Other => 0x50,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, Error> {
        use RejectReason::*;
        Ok(match byte {
            0x01 => Malformed,
            0x10 => Invalid,
            0x11 => Obsolete,
            0x12 => Duplicate,
            0x40 => Nonstandard,
            0x41 => Dust,
            0x42 => InsufficientFee,
            0x43 => Checkpoint,
            0x50 => Other,
            _ => return Err(Error::InvalidMessage),
        })
    }
}

/// A `reject` message (BIP61).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Reject {
    /// The command of the rejected message.
    pub message: String,
    /// The rejection category.
    pub code: RejectReason,
    /// The human-readable reason.
    pub reason: String,
    /// A hash identifying the rejected object, when one applies.
    pub data: Option<[u8; 32]>,
}

impl Payload for Reject {
    const IDENTIFIER: Identifier = Identifier::Reject;

    fn serialize<W: Write>(&self, _version: u32, writer: &mut W) -> Result<(), Error> {
        write_var_string(writer, &self.message)?;
        writer
            .write_u8(self.code.to_byte())
            .map_err(|_| Error::BadStream)?;
        write_var_string(writer, &self.reason)?;
        if let Some(data) = &self.data {
            writer.write_all(data).map_err(|_| Error::BadStream)?;
        }
        Ok(())
    }

    fn deserialize(_version: u32, bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = Cursor::new(bytes);
        let message = read_var_string(&mut reader)?;
        let code = RejectReason::from_byte(
            reader.read_u8().map_err(|_| Error::InvalidMessage)?,
        )?;
        let reason = read_var_string(&mut reader)?;
        // There is no length field; presence is implied by the payload size.
        let mut data = [0u8; 32];
        let data = reader.read_exact(&mut data).ok().map(|_| data);
        Ok(Reject {
            message,
            code,
            reason,
            data,
        })
    }
}

/// An `alert` message, carried opaquely for logging.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Alert {
    /// The raw signed alert payload.
    pub payload: Vec<u8>,
}

impl Payload for Alert {
    const IDENTIFIER: Identifier = Identifier::Alert;

    fn serialize<W: Write>(&self, _version: u32, writer: &mut W) -> Result<(), Error> {
        writer.write_all(&self.payload).map_err(|_| Error::BadStream)
    }

    fn deserialize(_version: u32, bytes: &[u8]) -> Result<Self, Error> {
        Ok(Alert {
            payload: bytes.to_vec(),
        })
    }
}

/// The empty `sendaddrv2` announcement (BIP155).
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SendAddressV2;

impl Payload for SendAddressV2 {
    const IDENTIFIER: Identifier = Identifier::SendAddressV2;

    fn serialize<W: Write>(&self, _version: u32, _writer: &mut W) -> Result<(), Error> {
        Ok(())
    }

    fn deserialize(_version: u32, _bytes: &[u8]) -> Result<Self, Error> {
        Ok(SendAddressV2)
    }
}

/// The empty `sendheaders` announcement (BIP130).
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SendHeaders;

impl Payload for SendHeaders {
    const IDENTIFIER: Identifier = Identifier::SendHeaders;

    fn serialize<W: Write>(&self, _version: u32, _writer: &mut W) -> Result<(), Error> {
        Ok(())
    }

    fn deserialize(_version: u32, _bytes: &[u8]) -> Result<Self, Error> {
        Ok(SendHeaders)
    }
}
