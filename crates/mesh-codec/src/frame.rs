//! Z85 wire framing: a small fixed "peekable" header followed by a variable
//! body, the whole thing Z85-encoded as a single string.
//!
//! Z85 (<https://rfc.zeromq.org/spec/32/>) encodes in independent 4-byte
//! groups, five characters per group, so the first two groups of the
//! encoded string can be decoded without touching the rest — that is what
//! makes the header "peekable": a reader can learn [`PeekHeader::frame_size`]
//! from 10 characters before deciding how many more to read off the wire.

use crate::error::Error;

pub const VERSION: [u8; 2] = [1, 0];
pub const PEEK_RAW_LEN: usize = 8;
pub const PEEK_Z85_LEN: usize = 10;

/// A route-carried or channel-bound extension TLV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    pub kind: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: [u8; 2],
    pub protocol: u8,
    pub destination_type: u8,
    pub source_identifier: Vec<u8>,
    pub destination_identifier: Option<Vec<u8>>,
    pub route: Vec<u8>,
    pub extensions: Vec<Extension>,
}

impl Header {
    pub fn new(protocol: u8, destination_type: u8, source_identifier: Vec<u8>) -> Self {
        Self {
            version: VERSION,
            protocol,
            destination_type,
            source_identifier,
            destination_identifier: None,
            route: Vec::new(),
            extensions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Vec<u8>,
    pub validator: Vec<u8>,
}

/// The first 8 raw bytes of a frame, decodable from the first 10 Z85
/// characters alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeekHeader {
    pub version: [u8; 2],
    pub protocol: u8,
    pub destination_type: u8,
    /// Length, in raw bytes, of the unpadded frame (peek header + body +
    /// trailing pad-length byte). The Z85-decoded buffer is always a
    /// multiple of 4 bytes; anything past `frame_size` is alignment padding.
    pub frame_size: u32,
}

/// Decodes just the peekable header from the first [`PEEK_Z85_LEN`]
/// characters of a frame's Z85 encoding.
///
/// # Example
///
/// ```
/// use mesh_codec::frame::{decode_peek, encode, Frame, Header};
///
/// let frame = Frame { header: Header::new(0, 0, vec![1, 2, 3, 4]), payload: b"hi".to_vec(), validator: vec![0xAB; 4] };
/// let encoded = encode(&frame).unwrap();
/// let peek = decode_peek(&encoded[..10]).unwrap();
/// assert_eq!(peek.protocol, 0);
/// ```
pub fn decode_peek(z85_prefix: &str) -> Result<PeekHeader, Error> {
    if z85_prefix.len() < PEEK_Z85_LEN {
        return Err(Error::ShortRead);
    }
    let raw = z85::decode(&z85_prefix[..PEEK_Z85_LEN]).map_err(|_| Error::Z85Decode)?;
    let mut cursor = Cursor::new(&raw);
    let version = [cursor.byte()?, cursor.byte()?];
    let protocol = cursor.byte()?;
    let destination_type = cursor.byte()?;
    let frame_size = cursor.u32_le()?;
    Ok(PeekHeader {
        version,
        protocol,
        destination_type,
        frame_size,
    })
}

/// How many Z85 characters make up the whole frame, given its
/// [`PeekHeader::frame_size`]. Callers read this many characters (minus the
/// [`PEEK_Z85_LEN`] already consumed) off the wire before calling [`decode`].
pub fn z85_len_for_frame_size(frame_size: u32) -> usize {
    let padded = (frame_size as usize).div_ceil(4) * 4;
    padded / 4 * 5
}

/// Encodes a complete frame (header, payload, validator) to its Z85 wire
/// representation.
pub fn encode(frame: &Frame) -> Result<String, Error> {
    let mut body = Vec::new();
    body.push(frame.header.version[0]);
    body.push(frame.header.version[1]);
    body.push(frame.header.protocol);
    body.push(frame.header.destination_type);

    push_u8_len_bytes(&mut body, &frame.header.source_identifier)?;

    match &frame.header.destination_identifier {
        Some(id) => {
            body.push(1);
            push_u8_len_bytes(&mut body, id)?;
        }
        None => body.push(0),
    }

    body.extend_from_slice(
        &u32::try_from(frame.payload.len())
            .map_err(|_| Error::DeclaredSizeOverflow)?
            .to_le_bytes(),
    );

    push_u16_len_bytes(&mut body, &frame.header.route)?;

    let extensions_count =
        u8::try_from(frame.header.extensions.len()).map_err(|_| Error::DeclaredSizeOverflow)?;
    body.push(extensions_count);
    for extension in &frame.header.extensions {
        body.push(extension.kind);
        push_u16_len_bytes(&mut body, &extension.payload)?;
    }

    body.extend_from_slice(&frame.payload);

    push_u8_len_bytes(&mut body, &frame.validator)?;

    // peek header (8, of which `body`'s first 4 bytes already duplicate
    // version/protocol/destination_type) + the rest of body + pad-length
    // trailer byte (1).
    let unpadded_len = u32::try_from(PEEK_RAW_LEN + (body.len() - 4) + 1)
        .map_err(|_| Error::DeclaredSizeOverflow)?;

    let mut raw = Vec::with_capacity(unpadded_len as usize);
    raw.push(frame.header.version[0]);
    raw.push(frame.header.version[1]);
    raw.push(frame.header.protocol);
    raw.push(frame.header.destination_type);
    raw.extend_from_slice(&unpadded_len.to_le_bytes());
    raw.extend_from_slice(&body[4..]); // skip the version/protocol/destination_type already written

    let pad_len = (4 - (raw.len() + 1) % 4) % 4;
    raw.push(pad_len as u8);
    raw.resize(raw.len() + pad_len, 0);

    z85::encode(&raw).map_err(|_| Error::Z85PadLen)
}

/// Decodes a complete frame from its Z85 wire representation.
pub fn decode(z85_frame: &str) -> Result<Frame, Error> {
    let raw = z85::decode(z85_frame).map_err(|_| Error::Z85Decode)?;
    let mut cursor = Cursor::new(&raw);

    let version = [cursor.byte()?, cursor.byte()?];
    let protocol = cursor.byte()?;
    let destination_type = cursor.byte()?;
    let frame_size = cursor.u32_le()? as usize;

    if frame_size > raw.len() {
        return Err(Error::MalformedHeader);
    }
    let unpadded = &raw[..frame_size];
    let declared_pad = *unpadded.last().ok_or(Error::ShortRead)? as usize;
    if raw.len() - frame_size != declared_pad {
        return Err(Error::MalformedHeader);
    }

    let source_identifier = cursor.sized_u8()?;

    let destination_identifier = match cursor.byte()? {
        0 => None,
        1 => Some(cursor.sized_u8()?),
        _ => return Err(Error::MalformedHeader),
    };

    let payload_size = cursor.u32_le()? as usize;
    let route = cursor.sized_u16()?;

    let extensions_count = cursor.byte()?;
    let mut extensions = Vec::with_capacity(extensions_count as usize);
    for _ in 0..extensions_count {
        let kind = cursor.byte()?;
        let payload = cursor.sized_u16().map_err(|_| Error::MalformedExtension)?;
        extensions.push(Extension { kind, payload });
    }

    let payload = cursor.take(payload_size)?.to_vec();
    let validator = cursor.sized_u8()?;

    Ok(Frame {
        header: Header {
            version,
            protocol,
            destination_type,
            source_identifier,
            destination_identifier,
            route,
            extensions,
        },
        payload,
        validator,
    })
}

fn push_u8_len_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<(), Error> {
    buf.push(u8::try_from(bytes.len()).map_err(|_| Error::DeclaredSizeOverflow)?);
    buf.extend_from_slice(bytes);
    Ok(())
}

fn push_u16_len_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<(), Error> {
    buf.extend_from_slice(
        &u16::try_from(bytes.len())
            .map_err(|_| Error::DeclaredSizeOverflow)?
            .to_le_bytes(),
    );
    buf.extend_from_slice(bytes);
    Ok(())
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], Error> {
        let end = self.pos.checked_add(len).ok_or(Error::ShortRead)?;
        let slice = self.bytes.get(self.pos..end).ok_or(Error::ShortRead)?;
        self.pos = end;
        Ok(slice)
    }

    fn byte(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    fn u32_le(&mut self) -> Result<u32, Error> {
        let slice = self.take(4)?;
        Ok(u32::from_le_bytes(slice.try_into().unwrap()))
    }

    fn u16_le(&mut self) -> Result<u16, Error> {
        let slice = self.take(2)?;
        Ok(u16::from_le_bytes(slice.try_into().unwrap()))
    }

    fn sized_u8(&mut self) -> Result<Vec<u8>, Error> {
        let len = self.byte()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn sized_u16(&mut self) -> Result<Vec<u8>, Error> {
        let len = self.u16_le()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> Frame {
        let mut header = Header::new(3, 1, vec![0xde, 0xad, 0xbe, 0xef]);
        header.destination_identifier = Some(vec![0xca, 0xfe]);
        header.route = vec![1, 2, 3];
        header.extensions.push(Extension {
            kind: 7,
            payload: vec![9, 9],
        });
        Frame {
            header,
            payload: b"hello mesh".to_vec(),
            validator: vec![0x11; 32],
        }
    }

    #[test]
    fn round_trips() {
        let frame = sample_frame();
        let encoded = encode(&frame).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn peek_reports_frame_size_before_full_decode() {
        let frame = sample_frame();
        let encoded = encode(&frame).unwrap();
        let peek = decode_peek(&encoded[..PEEK_Z85_LEN]).unwrap();
        assert_eq!(peek.protocol, 3);
        assert_eq!(peek.destination_type, 1);

        let total_chars = z85_len_for_frame_size(peek.frame_size);
        assert_eq!(total_chars, encoded.len());
    }

    #[test]
    fn rejects_short_peek_prefix() {
        assert!(matches!(decode_peek("abc"), Err(Error::ShortRead)));
    }

    #[test]
    fn rejects_truncated_frame() {
        let frame = sample_frame();
        let encoded = encode(&frame).unwrap();
        let truncated = &encoded[..encoded.len() - 10];
        assert!(decode(truncated).is_err());
    }

    #[test]
    fn empty_payload_and_no_destination_round_trip() {
        let frame = Frame {
            header: Header::new(0, 0, vec![1]),
            payload: Vec::new(),
            validator: Vec::new(),
        };
        let encoded = encode(&frame).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }
}
