//! TFP packet framing and payload (de)serialization
//!
//! Every packet starts with an 8 byte header:
//!
//! | Byte | Content |
//! |------|---------|
//! | 0-3  | UID of the device (LE) |
//! | 4    | Total packet length, header included |
//! | 5    | Function ID |
//! | 6    | Sequence number (bits 4-7), response expected (bit 3) |
//! | 7    | Error code (bits 6-7) |
//!
//! All multi byte payload values are little endian. Bool arrays are packed LSB first.

use crate::hardware::{HardwareError, HardwareResult};

/// Length of the packet header
pub const HEADER_LEN: usize = 8;
/// Maximum length of a packet, header included
pub const MAX_PACKET_LEN: usize = 80;

/// Header of a TFP packet
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    /// Numeric UID of the target or source device. 0 is broadcast
    pub uid: u32,
    /// Total packet length
    pub length: u8,
    /// Function or callback ID
    pub function_id: u8,
    /// Sequence number, 1-15. 0 marks callbacks
    pub sequence_number: u8,
    /// Sender wants a response
    pub response_expected: bool,
    /// Error code of a response, 0 is OK
    pub error_code: u8,
}

impl PacketHeader {
    /// Serializes the header
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let uid = self.uid.to_le_bytes();
        [
            uid[0],
            uid[1],
            uid[2],
            uid[3],
            self.length,
            self.function_id,
            (self.sequence_number << 4) | ((self.response_expected as u8) << 3),
            self.error_code << 6,
        ]
    }

    /// Parses a header. Returns [None] if `buf` is shorter than a header or the
    /// length field is invalid
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let length = buf[4];
        if (length as usize) < HEADER_LEN || (length as usize) > MAX_PACKET_LEN {
            return None;
        }
        Some(Self {
            uid: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            length,
            function_id: buf[5],
            sequence_number: (buf[6] >> 4) & 0x0F,
            response_expected: buf[6] & 0x08 != 0,
            error_code: (buf[7] >> 6) & 0x03,
        })
    }

    /// Length of the payload following the header
    pub fn payload_len(&self) -> usize {
        self.length as usize - HEADER_LEN
    }
}

/// A complete TFP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet header
    pub header: PacketHeader,
    /// Payload
    pub payload: Vec<u8>,
}

impl Packet {
    /// Creates a request packet
    pub fn request(uid: u32, function_id: u8, sequence_number: u8, response_expected: bool, payload: Vec<u8>) -> Self {
        Self {
            header: PacketHeader {
                uid,
                length: (HEADER_LEN + payload.len()) as u8,
                function_id,
                sequence_number,
                response_expected,
                error_code: 0,
            },
            payload,
        }
    }

    /// Serializes header and payload
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.header.to_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Returns true if this packet is a callback rather than a response
    pub fn is_callback(&self) -> bool {
        self.header.sequence_number == 0
    }
}

/// Builds a request payload
#[derive(Debug, Clone, Default)]
pub struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    /// Creates an empty payload
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a u8
    pub fn u8(mut self, v: u8) -> Self {
        self.buf.push(v);
        self
    }

    /// Appends a bool
    pub fn bool(self, v: bool) -> Self {
        self.u8(v as u8)
    }

    /// Appends a u16
    pub fn u16(mut self, v: u16) -> Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// Appends an i16
    pub fn i16(mut self, v: i16) -> Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// Appends a u32
    pub fn u32(mut self, v: u32) -> Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// Appends a bool array, packed LSB first
    pub fn bools(mut self, values: &[bool]) -> Self {
        let mut packed = vec![0u8; values.len().div_ceil(8)];
        for (i, v) in values.iter().enumerate() {
            if *v {
                packed[i / 8] |= 1 << (i % 8);
            }
        }
        self.buf.extend_from_slice(&packed);
        self
    }

    /// Returns the payload bytes
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Reads values from a response payload in order
#[derive(Debug, Clone)]
pub struct PayloadReader<'a> {
    function_id: u8,
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    /// Creates a reader over the payload of a response to `function_id`
    pub fn new(function_id: u8, buf: &'a [u8]) -> Self {
        Self { function_id, buf, pos: 0 }
    }

    /// Fails if the payload is shorter than `len` bytes
    pub fn require(&self, len: usize) -> HardwareResult<()> {
        if self.buf.len() < len {
            Err(HardwareError::MalformedResponse {
                function_id: self.function_id,
                expected: len,
                actual: self.buf.len(),
            })
        } else {
            Ok(())
        }
    }

    /// Number of bytes not read yet
    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn take<const N: usize>(&mut self) -> HardwareResult<[u8; N]> {
        self.require(self.pos + N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    /// Reads a u8
    pub fn u8(&mut self) -> HardwareResult<u8> {
        Ok(self.take::<1>()?[0])
    }

    /// Reads a bool
    pub fn bool(&mut self) -> HardwareResult<bool> {
        Ok(self.u8()? != 0)
    }

    /// Reads a u16
    pub fn u16(&mut self) -> HardwareResult<u16> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    /// Reads an i16
    pub fn i16(&mut self) -> HardwareResult<i16> {
        Ok(i16::from_le_bytes(self.take()?))
    }

    /// Reads a u32
    pub fn u32(&mut self) -> HardwareResult<u32> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    /// Reads an i32
    pub fn i32(&mut self) -> HardwareResult<i32> {
        Ok(i32::from_le_bytes(self.take()?))
    }

    /// Reads an f32
    pub fn f32(&mut self) -> HardwareResult<f32> {
        Ok(f32::from_le_bytes(self.take()?))
    }

    /// Reads `N` packed bools
    pub fn bools<const N: usize>(&mut self) -> HardwareResult<[bool; N]> {
        let bytes = N.div_ceil(8);
        self.require(self.pos + bytes)?;
        let mut out = [false; N];
        for (i, v) in out.iter_mut().enumerate() {
            *v = self.buf[self.pos + i / 8] & (1 << (i % 8)) != 0;
        }
        self.pos += bytes;
        Ok(out)
    }

    /// Reads a fixed length, zero padded string
    pub fn string(&mut self, len: usize) -> HardwareResult<String> {
        self.require(self.pos + len)?;
        let raw = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        let end = raw.iter().position(|b| *b == 0).unwrap_or(len);
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }

    /// Reads a single character
    pub fn char(&mut self) -> HardwareResult<char> {
        Ok(self.u8()? as char)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let p = Packet::request(0x1234_5678, 3, 5, true, vec![0xAA, 0xBB]);
        let bytes = p.to_bytes();
        assert_eq!(bytes, vec![0x78, 0x56, 0x34, 0x12, 10, 3, 0x58, 0x00, 0xAA, 0xBB]);
    }

    #[test]
    fn test_parse_error_code() {
        let raw = [1, 0, 0, 0, 8, 24, 0x70, 0x80];
        let h = PacketHeader::from_bytes(&raw).unwrap();
        assert_eq!(h.uid, 1);
        assert_eq!(h.function_id, 24);
        assert_eq!(h.sequence_number, 7);
        assert!(!h.response_expected);
        assert_eq!(h.error_code, 2);
        assert_eq!(h.payload_len(), 0);
    }

    #[test]
    fn test_reject_bad_length() {
        assert!(PacketHeader::from_bytes(&[0, 0, 0, 0, 4, 1, 0, 0]).is_none());
        assert!(PacketHeader::from_bytes(&[0, 0, 0, 0, 200, 1, 0, 0]).is_none());
        assert!(PacketHeader::from_bytes(&[0, 0, 0]).is_none());
    }

    #[test]
    fn test_bool_packing() {
        let payload = PayloadWriter::new().bools(&[false, true, true, false]).finish();
        assert_eq!(payload, vec![0b0110]);
        let mut r = PayloadReader::new(2, &payload);
        assert_eq!(r.bools::<4>().unwrap(), [false, true, true, false]);
    }

    #[test]
    fn test_short_payload() {
        let payload = [0x01, 0x02];
        let mut r = PayloadReader::new(3, &payload);
        assert_eq!(r.u16().unwrap(), 0x0201);
        match r.u32() {
            Err(HardwareError::MalformedResponse { function_id, expected, actual }) => {
                assert_eq!(function_id, 3);
                assert_eq!(expected, 6);
                assert_eq!(actual, 2);
            }
            other => panic!("Unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_string_padding() {
        let payload = *b"Sii\0\0\0\0\0a";
        let mut r = PayloadReader::new(253, &payload);
        assert_eq!(r.string(8).unwrap(), "Sii");
        assert_eq!(r.char().unwrap(), 'a');
        assert_eq!(r.remaining(), 0);
    }
}
