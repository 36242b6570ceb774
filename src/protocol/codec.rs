//! Framing: the message heading and the byte-level helpers shared by the
//! typed payloads.
//!
//! A frame is `[magic(4) | command(12) | payload_length(4, LE) |
//! checksum(4)] | payload`, where the checksum is the first four bytes of
//! double-SHA256 over the payload.

use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::{BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};

use crate::{
    constants::{COMMAND_SIZE, HEADING_SIZE},
    protocol::{
        message::{Identifier, Payload},
        types::Magic,
    },
    Error,
};

/// A parsed message heading.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Heading {
    /// The network magic.
    pub magic: Magic,
    /// The zero-padded command field.
    pub command: [u8; COMMAND_SIZE],
    /// The declared payload length.
    pub payload_size: u32,
    /// The declared payload checksum.
    pub checksum: [u8; 4],
}

impl Heading {
    /// Parse a heading from exactly [`HEADING_SIZE`] bytes.
    pub fn parse(bytes: &[u8]) -> Result<Heading, Error> {
        if bytes.len() != HEADING_SIZE {
            return Err(Error::InvalidHeading);
        }
        let mut reader = Cursor::new(bytes);
        let mut magic = [0u8; 4];
        reader
            .read_exact(&mut magic)
            .map_err(|_| Error::InvalidHeading)?;
        let mut command = [0u8; COMMAND_SIZE];
        reader
            .read_exact(&mut command)
            .map_err(|_| Error::InvalidHeading)?;
        let payload_size = reader
            .read_u32::<LittleEndian>()
            .map_err(|_| Error::InvalidHeading)?;
        let mut checksum = [0u8; 4];
        reader
            .read_exact(&mut checksum)
            .map_err(|_| Error::InvalidHeading)?;
        Ok(Heading {
            magic: Magic(magic),
            command,
            payload_size,
            checksum,
        })
    }

    /// Write the heading.
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<(), Error> {
        writer.write_all(&self.magic.0).map_err(|_| Error::BadStream)?;
        writer.write_all(&self.command).map_err(|_| Error::BadStream)?;
        writer
            .write_u32::<LittleEndian>(self.payload_size)
            .map_err(|_| Error::BadStream)?;
        writer.write_all(&self.checksum).map_err(|_| Error::BadStream)?;
        Ok(())
    }

    /// Classify the command field, if it names a known message.
    pub fn identifier(&self) -> Option<Identifier> {
        Identifier::from_command(&self.command)
    }
}

/// The first four bytes of double-SHA256 over `payload`.
pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let digest = Sha256::digest(Sha256::digest(payload));
    let mut checksum = [0u8; 4];
    checksum.copy_from_slice(&digest[..4]);
    checksum
}

/// Serialize a full frame (heading plus payload) for the wire.
pub fn serialize_message<M: Payload>(
    magic: Magic,
    version: u32,
    message: &M,
) -> Result<Bytes, Error> {
    let mut payload = Vec::new();
    message.serialize(version, &mut payload)?;

    let heading = Heading {
        magic,
        command: *M::IDENTIFIER.command(),
        payload_size: payload.len() as u32,
        checksum: checksum(&payload),
    };

    let mut dst = BytesMut::with_capacity(HEADING_SIZE + payload.len());
    {
        let mut writer = (&mut dst).writer();
        heading.write(&mut writer)?;
        writer.write_all(&payload).map_err(|_| Error::BadStream)?;
    }
    Ok(dst.freeze())
}

// CompactSize helpers shared by the typed payloads.

pub(crate) fn write_var_int<W: Write>(writer: &mut W, value: u64) -> Result<(), Error> {
    let result = match value {
        0..=0xfc => writer.write_u8(value as u8),
        0xfd..=0xffff => writer
            .write_u8(0xfd)
            .and_then(|_| writer.write_u16::<LittleEndian>(value as u16)),
        0x1_0000..=0xffff_ffff => writer
            .write_u8(0xfe)
            .and_then(|_| writer.write_u32::<LittleEndian>(value as u32)),
        _ => writer
            .write_u8(0xff)
            .and_then(|_| writer.write_u64::<LittleEndian>(value)),
    };
    result.map_err(|_| Error::BadStream)
}

pub(crate) fn read_var_int<R: Read>(reader: &mut R) -> Result<u64, Error> {
    let discriminant = reader.read_u8().map_err(|_| Error::InvalidMessage)?;
    let value = match discriminant {
        0xfd => reader
            .read_u16::<LittleEndian>()
            .map_err(|_| Error::InvalidMessage)?
            .into(),
        0xfe => reader
            .read_u32::<LittleEndian>()
            .map_err(|_| Error::InvalidMessage)?
            .into(),
        0xff => reader
            .read_u64::<LittleEndian>()
            .map_err(|_| Error::InvalidMessage)?,
        byte => byte.into(),
    };
    Ok(value)
}

pub(crate) fn write_var_string<W: Write>(writer: &mut W, value: &str) -> Result<(), Error> {
    write_var_int(writer, value.len() as u64)?;
    writer
        .write_all(value.as_bytes())
        .map_err(|_| Error::BadStream)
}

pub(crate) fn read_var_string<R: Read>(reader: &mut R) -> Result<String, Error> {
    let length = read_var_int(reader)? as usize;
    // User agents and reject strings are short; anything larger than a
    // heading's worth of payload here is garbage.
    if length > 0x1_0000 {
        return Err(Error::InvalidMessage);
    }
    let mut bytes = vec![0u8; length];
    reader
        .read_exact(&mut bytes)
        .map_err(|_| Error::InvalidMessage)?;
    String::from_utf8(bytes).map_err(|_| Error::InvalidMessage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        constants::MAXIMUM_PROTOCOL,
        protocol::message::{Ping, VersionAcknowledge},
    };
    use proptest::prelude::*;

    #[test]
    fn heading_round_trip() {
        let heading = Heading {
            magic: Magic::from_identifier(3_652_501_241),
            command: *Identifier::Ping.command(),
            payload_size: 8,
            checksum: [1, 2, 3, 4],
        };
        let mut bytes = Vec::new();
        heading.write(&mut bytes).expect("write");
        assert_eq!(bytes.len(), HEADING_SIZE);
        assert_eq!(Heading::parse(&bytes).expect("parse"), heading);
        assert_eq!(heading.identifier(), Some(Identifier::Ping));
    }

    #[test]
    fn short_heading_is_invalid() {
        assert_eq!(Heading::parse(&[0u8; HEADING_SIZE - 1]), Err(Error::InvalidHeading));
        assert_eq!(Heading::parse(&[0u8; HEADING_SIZE + 1]), Err(Error::InvalidHeading));
    }

    #[test]
    fn empty_payload_checksum_matches_reference() {
        // Double-SHA256 of the empty string, first four bytes.
        assert_eq!(checksum(&[]), [0x5d, 0xf6, 0xe0, 0xe2]);
    }

    #[test]
    fn serialized_frame_carries_checksum_and_length() {
        let magic = Magic::from_identifier(3_652_501_241);
        let frame =
            serialize_message(magic, MAXIMUM_PROTOCOL, &Ping { nonce: 42 }).expect("frame");
        assert_eq!(frame.len(), HEADING_SIZE + 8);

        let heading = Heading::parse(&frame[..HEADING_SIZE]).expect("heading");
        assert_eq!(heading.magic, magic);
        assert_eq!(heading.identifier(), Some(Identifier::Ping));
        assert_eq!(heading.payload_size, 8);
        assert_eq!(heading.checksum, checksum(&frame[HEADING_SIZE..]));
    }

    #[test]
    fn empty_message_frame_is_heading_only() {
        let magic = Magic::from_identifier(118_034_699);
        let frame = serialize_message(magic, MAXIMUM_PROTOCOL, &VersionAcknowledge)
            .expect("frame");
        assert_eq!(frame.len(), HEADING_SIZE);
        let heading = Heading::parse(&frame).expect("heading");
        assert_eq!(heading.payload_size, 0);
        assert_eq!(heading.checksum, checksum(&[]));
    }

    #[test]
    fn var_int_boundaries_round_trip() {
        for value in [
            0u64,
            0xfc,
            0xfd,
            0xffff,
            0x1_0000,
            0xffff_ffff,
            0x1_0000_0000,
            u64::MAX,
        ] {
            let mut bytes = Vec::new();
            write_var_int(&mut bytes, value).expect("write");
            assert_eq!(
                read_var_int(&mut Cursor::new(&bytes)).expect("read"),
                value,
                "value {value:#x}"
            );
        }
    }

    proptest! {
        #[test]
        fn heading_parse_format_round_trip(
            identifier in prop::num::u32::ANY,
            payload_size in prop::num::u32::ANY,
            checksum in prop::array::uniform4(prop::num::u8::ANY),
            command in prop::array::uniform12(prop::num::u8::ANY),
        ) {
            let heading = Heading {
                magic: Magic::from_identifier(identifier),
                command,
                payload_size,
                checksum,
            };
            let mut bytes = Vec::new();
            heading.write(&mut bytes).expect("write");
            prop_assert_eq!(Heading::parse(&bytes).expect("parse"), heading);
        }

        #[test]
        fn var_int_round_trip(value in prop::num::u64::ANY) {
            let mut bytes = Vec::new();
            write_var_int(&mut bytes, value).expect("write");
            prop_assert_eq!(read_var_int(&mut Cursor::new(&bytes)).expect("read"), value);
        }
    }
}
