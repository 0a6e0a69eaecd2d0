//! MSP v1 frame codec
//!
//! Byte-level state machine for `$M<` / `$M>` frames:
//!
//! ```text
//! '$' 'M' dir len code payload[len] checksum
//! checksum = len ^ code ^ payload[0] ^ ... ^ payload[len-1]
//! ```
//!
//! The decoder consumes one byte at a time and yields at most one result per
//! byte. Every failure is a value: the decoder resynchronizes and keeps going.
//! Payloads are limited to 255 bytes (the length field is a single byte).

use super::code::MspCode;
use crate::error::{LinkError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

const SYNC1: u8 = b'$';
const SYNC2: u8 = b'M';

/// Largest payload a v1 frame can carry
pub const MAX_PAYLOAD_LEN: usize = u8::MAX as usize;

/// Header (`$M` + dir + len + code) plus trailing checksum
pub const FRAME_OVERHEAD: usize = 6;

// =============================================================================
// Frame
// =============================================================================

/// Value of the direction byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// `<`: host to flight controller
    Request,
    /// `>`: flight controller to host
    Response,
    /// `!`: flight controller does not support the code
    Unsupported,
}

impl Direction {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'<' => Some(Self::Request),
            b'>' => Some(Self::Response),
            b'!' => Some(Self::Unsupported),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Self::Request => b'<',
            Self::Response => b'>',
            Self::Unsupported => b'!',
        }
    }
}

/// Which end of the link the codec sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// Accepts responses, emits requests
    #[default]
    GroundStation,
    /// Accepts requests, emits responses (simulators, test doubles)
    FlightController,
}

impl Role {
    pub fn inbound(self) -> Direction {
        match self {
            Self::GroundStation => Direction::Response,
            Self::FlightController => Direction::Request,
        }
    }

    pub fn outbound(self) -> Direction {
        match self {
            Self::GroundStation => Direction::Request,
            Self::FlightController => Direction::Response,
        }
    }
}

/// A validated frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub direction: Direction,
    pub code: MspCode,
    pub payload: Bytes,
}

/// Why a complete frame was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Received checksum differs from the computed one
    ChecksumMismatch { code: u8, expected: u8, received: u8 },
    /// Code byte is not in the code table
    UnknownCode { code: u8 },
    /// Frame travels the wrong way for this role (e.g. an echoed request)
    WrongDirection { code: MspCode, direction: Direction },
    /// Flight controller answered with `!`
    Unsupported { code: MspCode },
}

impl DecodeError {
    /// Code the failure can be attributed to, if it is a known one
    pub fn code(&self) -> Option<MspCode> {
        match *self {
            Self::ChecksumMismatch { .. } | Self::UnknownCode { .. } => None,
            Self::WrongDirection { code, .. } | Self::Unsupported { code } => Some(code),
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChecksumMismatch {
                code,
                expected,
                received,
            } => write!(
                f,
                "checksum mismatch on code {}: expected {:#04x}, got {:#04x}",
                code, expected, received
            ),
            Self::UnknownCode { code } => write!(f, "unknown code {}", code),
            Self::WrongDirection { code, direction } => {
                write!(f, "{} received with direction {:?}", code, direction)
            }
            Self::Unsupported { code } => write!(f, "{} not supported by flight controller", code),
        }
    }
}

// =============================================================================
// Decoder
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    Sync1,
    Sync2,
    Direction,
    Length,
    Code,
    Payload,
    Checksum,
}

/// MSP v1 codec
///
/// One instance per connection. Not shared across threads: the link owns it
/// behind its receive path.
#[derive(Debug)]
pub struct MspCodec {
    role: Role,
    state: ParserState,
    direction: Direction,
    expected_len: usize,
    code: u8,
    checksum: u8,
    payload: BytesMut,
    errors: u64,
}

impl MspCodec {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: ParserState::Sync1,
            direction: role.inbound(),
            expected_len: 0,
            code: 0,
            checksum: 0,
            payload: BytesMut::with_capacity(MAX_PAYLOAD_LEN),
            errors: 0,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Number of rejected frames since creation
    pub fn error_count(&self) -> u64 {
        self.errors
    }

    /// Drop any partial frame
    pub fn reset(&mut self) {
        self.state = ParserState::Sync1;
        self.payload.clear();
    }

    /// Feed one byte
    ///
    /// Returns `Some` only when the byte completes a frame.
    pub fn decode_byte(&mut self, byte: u8) -> Option<std::result::Result<Frame, DecodeError>> {
        match self.state {
            ParserState::Sync1 => {
                if byte == SYNC1 {
                    self.state = ParserState::Sync2;
                }
            }
            ParserState::Sync2 => {
                self.state = if byte == SYNC2 {
                    ParserState::Direction
                } else {
                    ParserState::Sync1
                };
            }
            ParserState::Direction => match Direction::from_byte(byte) {
                Some(direction) => {
                    self.direction = direction;
                    self.state = ParserState::Length;
                }
                None => self.state = ParserState::Sync1,
            },
            ParserState::Length => {
                self.expected_len = byte as usize;
                self.checksum = byte;
                self.payload.clear();
                self.state = ParserState::Code;
            }
            ParserState::Code => {
                self.code = byte;
                self.checksum ^= byte;
                self.state = if self.expected_len == 0 {
                    ParserState::Checksum
                } else {
                    ParserState::Payload
                };
            }
            ParserState::Payload => {
                self.payload.put_u8(byte);
                self.checksum ^= byte;
                if self.payload.len() == self.expected_len {
                    self.state = ParserState::Checksum;
                }
            }
            ParserState::Checksum => return Some(self.finish(byte)),
        }
        None
    }

    /// Feed a buffer, calling `on_result` for every completed frame
    pub fn decode(
        &mut self,
        data: &[u8],
        mut on_result: impl FnMut(std::result::Result<Frame, DecodeError>),
    ) {
        for &byte in data {
            if let Some(result) = self.decode_byte(byte) {
                on_result(result);
            }
        }
    }

    fn finish(&mut self, received: u8) -> std::result::Result<Frame, DecodeError> {
        self.state = ParserState::Sync1;
        let payload = self.payload.split().freeze();

        let result = if received != self.checksum {
            // A '$' here is most likely the start of the next frame after a
            // dropped byte
            if received == SYNC1 {
                self.state = ParserState::Sync2;
            }
            Err(DecodeError::ChecksumMismatch {
                code: self.code,
                expected: self.checksum,
                received,
            })
        } else {
            match MspCode::try_from(self.code) {
                Err(code) => Err(DecodeError::UnknownCode { code }),
                Ok(code) if self.direction == Direction::Unsupported => {
                    Err(DecodeError::Unsupported { code })
                }
                Ok(code) if self.direction != self.role.inbound() => {
                    Err(DecodeError::WrongDirection {
                        code,
                        direction: self.direction,
                    })
                }
                Ok(code) => Ok(Frame {
                    direction: self.direction,
                    code,
                    payload,
                }),
            }
        };

        if result.is_err() {
            self.errors += 1;
        }
        result
    }

    // =========================================================================
    // Encoder
    // =========================================================================

    /// Encode a frame travelling away from this role
    pub fn encode(&self, code: MspCode, payload: &[u8], output: &mut Vec<u8>) -> Result<()> {
        write_frame(self.role.outbound(), code.id(), payload, output)
    }
}

impl Default for MspCodec {
    fn default() -> Self {
        Self::new(Role::GroundStation)
    }
}

/// Checksum of a frame body
pub fn checksum(code: u8, payload: &[u8]) -> u8 {
    payload
        .iter()
        .fold((payload.len() as u8) ^ code, |acc, b| acc ^ b)
}

/// Append a complete frame to `output`
///
/// Fails when the payload does not fit the single-byte length field.
pub fn write_frame(direction: Direction, code: u8, payload: &[u8], output: &mut Vec<u8>) -> Result<()> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(LinkError::PayloadTooLarge {
            code,
            len: payload.len(),
        });
    }
    output.reserve(payload.len() + FRAME_OVERHEAD);
    output.extend_from_slice(&[SYNC1, SYNC2, direction.as_byte(), payload.len() as u8, code]);
    output.extend_from_slice(payload);
    output.push(checksum(code, payload));
    Ok(())
}

/// Encode a single host-to-device request
pub fn encode_request(code: MspCode, payload: &[u8]) -> Result<Bytes> {
    let mut out = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    write_frame(Direction::Request, code.id(), payload, &mut out)?;
    Ok(Bytes::from(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn response(code: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        write_frame(Direction::Response, code, payload, &mut out).unwrap();
        out
    }

    fn decode_all(codec: &mut MspCodec, data: &[u8]) -> Vec<std::result::Result<Frame, DecodeError>> {
        let mut results = Vec::new();
        codec.decode(data, |r| results.push(r));
        results
    }

    #[test]
    fn test_encode_ident_request() {
        let frame = encode_request(MspCode::Ident, &[]).unwrap();
        assert_eq!(&frame[..], &[b'$', b'M', b'<', 0, 100, 100]);
    }

    #[test]
    fn test_encode_with_payload() {
        let frame = encode_request(MspCode::SelectSetting, &[2]).unwrap();
        assert_eq!(&frame[..], &[b'$', b'M', b'<', 1, 210, 2, 1 ^ 210 ^ 2]);
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let payload = vec![0u8; 256];
        let err = encode_request(MspCode::SetOsdConfig, &payload).unwrap_err();
        assert!(matches!(err, LinkError::PayloadTooLarge { code: 85, len: 256 }));
    }

    #[test]
    fn test_encode_max_payload() {
        let payload = vec![7u8; 255];
        let frame = encode_request(MspCode::OsdCharWrite, &payload).unwrap();
        assert_eq!(frame.len(), 255 + FRAME_OVERHEAD);
        assert_eq!(frame[3], 255);
    }

    #[test]
    fn test_decode_ident_round_trip() {
        let mut fc = MspCodec::new(Role::FlightController);
        let frame = encode_request(MspCode::Ident, &[]).unwrap();
        let results = decode_all(&mut fc, &frame);
        assert_eq!(results.len(), 1);
        let frame = results[0].as_ref().unwrap();
        assert_eq!(frame.code, MspCode::Ident);
        assert_eq!(frame.direction, Direction::Request);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_decode_response() {
        let mut codec = MspCodec::default();
        let results = decode_all(&mut codec, &response(108, &[10, 0, 20, 0, 90, 0]));
        assert_eq!(results.len(), 1);
        let frame = results[0].as_ref().unwrap();
        assert_eq!(frame.code, MspCode::Attitude);
        assert_eq!(&frame.payload[..], &[10, 0, 20, 0, 90, 0]);
        assert_eq!(codec.error_count(), 0);
    }

    #[test]
    fn test_decode_skips_garbage() {
        let mut codec = MspCodec::default();
        let mut data = vec![0x00, 0xFF, b'M', b'$', b'X'];
        data.extend(response(101, &[0; 11]));
        let results = decode_all(&mut codec, &data);
        assert_eq!(results.len(), 1);
        assert!(results[0].is_ok());
    }

    #[test]
    fn test_decode_bad_direction_resets() {
        let mut codec = MspCodec::default();
        let mut data = vec![b'$', b'M', b'?'];
        data.extend(response(110, &[0; 7]));
        let results = decode_all(&mut codec, &data);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap().code, MspCode::Analog);
    }

    #[test]
    fn test_decode_checksum_mismatch() {
        let mut codec = MspCodec::default();
        let mut frame = response(108, &[1, 2, 3, 4, 5, 6]);
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        let results = decode_all(&mut codec, &frame);
        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0],
            Err(DecodeError::ChecksumMismatch { code: 108, .. })
        ));
        assert_eq!(codec.error_count(), 1);
    }

    #[test]
    fn test_decode_unknown_code() {
        let mut codec = MspCodec::default();
        let results = decode_all(&mut codec, &response(47, &[]));
        assert_eq!(results, vec![Err(DecodeError::UnknownCode { code: 47 })]);
        assert_eq!(codec.error_count(), 1);
    }

    #[test]
    fn test_decode_wrong_direction() {
        let mut codec = MspCodec::default();
        // Our own request echoed back by a loopback
        let frame = encode_request(MspCode::Status, &[]).unwrap();
        let results = decode_all(&mut codec, &frame);
        assert_eq!(
            results,
            vec![Err(DecodeError::WrongDirection {
                code: MspCode::Status,
                direction: Direction::Request
            })]
        );
    }

    #[test]
    fn test_decode_unsupported_direction() {
        let mut codec = MspCodec::default();
        let mut frame = Vec::new();
        write_frame(Direction::Unsupported, 88, &[], &mut frame).unwrap();
        let results = decode_all(&mut codec, &frame);
        assert_eq!(
            results,
            vec![Err(DecodeError::Unsupported {
                code: MspCode::VtxConfig
            })]
        );
        assert_eq!(
            results[0].as_ref().unwrap_err().code(),
            Some(MspCode::VtxConfig)
        );
    }

    #[test]
    fn test_dropped_checksum_byte_recovers_on_dollar() {
        let mut codec = MspCodec::default();
        let mut first = response(108, &[1, 0, 2, 0, 3, 0]);
        first.pop(); // checksum lost on the air
        let second = response(109, &[0x10, 0, 0, 0, 0, 0]);
        // The '$' of the second frame is consumed as the first frame's checksum
        assert_ne!(checksum(108, &[1, 0, 2, 0, 3, 0]), b'$');

        let mut data = first;
        data.extend(&second);
        let results = decode_all(&mut codec, &data);
        assert_eq!(results.len(), 2);
        assert!(matches!(
            results[0],
            Err(DecodeError::ChecksumMismatch { received: b'$', .. })
        ));
        assert_eq!(results[1].as_ref().unwrap().code, MspCode::Altitude);
    }

    #[test]
    fn test_partial_frames_across_buffers() {
        let mut codec = MspCodec::default();
        let frame = response(105, &[0xDC, 0x05, 0xDC, 0x05]);
        let (a, b) = frame.split_at(3);
        assert!(decode_all(&mut codec, a).is_empty());
        let results = decode_all(&mut codec, b);
        assert_eq!(results.len(), 1);
        assert_eq!(&results[0].as_ref().unwrap().payload[..], &[0xDC, 0x05, 0xDC, 0x05]);
    }

    #[test]
    fn test_reset_drops_partial_frame() {
        let mut codec = MspCodec::default();
        let frame = response(105, &[1, 2]);
        decode_all(&mut codec, &frame[..5]);
        codec.reset();
        let results = decode_all(&mut codec, &frame);
        assert_eq!(results.len(), 1);
        assert!(results[0].is_ok());
    }

    fn any_code() -> impl Strategy<Value = MspCode> {
        proptest::sample::select(MspCode::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn prop_round_trip(code in any_code(), payload in proptest::collection::vec(any::<u8>(), 0..=255)) {
            let mut fc = MspCodec::new(Role::FlightController);
            let frame = encode_request(code, &payload).unwrap();
            let mut results = Vec::new();
            for &b in frame.iter() {
                if let Some(r) = fc.decode_byte(b) {
                    results.push(r);
                }
            }
            prop_assert_eq!(results.len(), 1);
            let decoded = results.pop().unwrap().unwrap();
            prop_assert_eq!(decoded.code, code);
            prop_assert_eq!(&decoded.payload[..], &payload[..]);
        }

        #[test]
        fn prop_decoding_twice_is_independent(code in any_code(), payload in proptest::collection::vec(any::<u8>(), 0..64)) {
            let mut codec = MspCodec::default();
            let frame = response(code.id(), &payload);
            let mut data = frame.clone();
            data.extend(&frame);
            let results = decode_all(&mut codec, &data);
            prop_assert_eq!(results.len(), 2);
            for r in results {
                let decoded = r.unwrap();
                prop_assert_eq!(&decoded.payload[..], &payload[..]);
            }
        }

        #[test]
        fn prop_single_corruption_resyncs(
            code in any_code(),
            payload in proptest::collection::vec(any::<u8>(), 0..64),
            offset in any::<prop::sample::Index>(),
            mask in 1u8..=255,
        ) {
            let mut corrupted = response(code.id(), &payload);
            // Corrupt code, payload or checksum; all of them break the checksum
            let index = 4 + offset.index(corrupted.len() - 4);
            corrupted[index] ^= mask;
            // A trailing '$' would be taken as the start of the next frame
            prop_assume!(*corrupted.last().unwrap() != b'$');

            let valid = response(MspCode::Attitude.id(), &[1, 2, 3, 4, 5, 6]);
            let mut data = corrupted;
            data.extend(&valid);

            let mut codec = MspCodec::default();
            let results = decode_all(&mut codec, &data);
            prop_assert_eq!(results.len(), 2);
            let is_checksum_mismatch = matches!(results[0], Err(DecodeError::ChecksumMismatch { .. }));
            prop_assert!(is_checksum_mismatch);
            prop_assert_eq!(results[1].as_ref().unwrap().code, MspCode::Attitude);
            prop_assert_eq!(codec.error_count(), 1);
        }
    }
}
