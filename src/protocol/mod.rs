//! Byte-level framing and handshake for the Laser Falcon serial protocol.
//!
//! Every exchange is one half-duplex transaction: the host sends
//! `STX body ETX checksum`, the instrument answers with ACK/NAK followed by a
//! response frame of the same shape, and the host acknowledges the response
//! in turn. The checksum is a one-byte XOR fold covering every transmitted
//! byte except STX and the checksum itself.

use std::io::{self, Read, Write};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use log::debug;
use thiserror::Error;

pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;

/// The instrument needs a short pause after our ACK before it will take the
/// next command.
const POST_ACK_DELAY: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("no acknowledge for command, got {0:?}")]
    NotAcknowledged(Option<u8>),
    #[error("response does not start with STX, got {0:?}")]
    MissingStx(Option<u8>),
    #[error("response checksum mismatch: calculated {calculated:#04x}, received {received:?}")]
    ChecksumMismatch { calculated: u8, received: Option<u8> },
}

/// Byte channel the protocol runs over. Blocking reads bounded by the port
/// timeout; a timeout shows up as a short or empty read, not an error.
pub trait Transport: Read + Write {
    /// Read until `delimiter` is seen, inclusive. A timeout ends the read
    /// early and yields whatever arrived.
    fn read_until(&mut self, delimiter: u8) -> io::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.read(&mut byte) {
                Ok(0) => return Ok(buffer),
                Ok(_) => {
                    buffer.push(byte[0]);
                    if byte[0] == delimiter {
                        return Ok(buffer);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(buffer),
                Err(e) => return Err(e),
            }
        }
    }
}

impl<T: Read + Write> Transport for T {}

fn xor_fold(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, byte| acc ^ byte)
}

/// Build the wire frame for a command body: `STX body ETX checksum`. The
/// checksum folds the body plus ETX, STX stays outside.
pub fn encode_frame(command: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(command.len() + 3);
    frame.push(STX);
    frame.extend_from_slice(command);
    frame.push(ETX);
    frame.push(xor_fold(command) ^ ETX);
    frame
}

/// Validate a received frame (everything up to and including ETX) against its
/// trailing checksum byte and strip the framing. The fold covers every byte
/// after STX, so the ETX already present in `received` is included.
pub fn decode_frame(received: &[u8], checksum: Option<u8>) -> Result<&[u8], ProtocolError> {
    let (first, rest) = match received.split_first() {
        Some(split) => split,
        None => return Err(ProtocolError::MissingStx(None)),
    };
    if *first != STX {
        return Err(ProtocolError::MissingStx(Some(*first)));
    }

    let calculated = xor_fold(rest);
    if Some(calculated) != checksum {
        return Err(ProtocolError::ChecksumMismatch {
            calculated,
            received: checksum,
        });
    }

    Ok(&rest[..rest.len().saturating_sub(1)])
}

fn read_byte(port: &mut dyn Transport) -> io::Result<Option<u8>> {
    let mut byte = [0u8; 1];
    match port.read(&mut byte) {
        Ok(0) => Ok(None),
        Ok(_) => Ok(Some(byte[0])),
        Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(None),
        Err(e) => Err(e),
    }
}

/// Drive one full request/response transaction and return the response
/// payload with the framing stripped.
///
/// A corrupted response is answered with a single NAK before the error
/// surfaces; there is no retry at this layer. A response with broken framing
/// is surfaced without NAK, matching the instrument's documented handshake.
pub fn transact(port: &mut dyn Transport, command: &[u8]) -> Result<Vec<u8>> {
    let frame = encode_frame(command);
    debug!("send {:02x?}", frame);

    // STX, body, ETX and checksum go out as four writes, flushed together
    let etx = frame.len() - 2;
    port.write_all(&frame[..1])?;
    port.write_all(&frame[1..etx])?;
    port.write_all(&frame[etx..etx + 1])?;
    port.write_all(&frame[etx + 1..])?;
    port.flush()?;

    match read_byte(port)? {
        Some(ACK) => (),
        other => return Err(ProtocolError::NotAcknowledged(other).into()),
    }

    let response = port.read_until(ETX)?;
    let checksum = read_byte(port)?;
    debug!("recv {:02x?} checksum {:02x?}", response, checksum);

    match decode_frame(&response, checksum) {
        Ok(payload) => {
            let payload = payload.to_vec();
            port.write_all(&[ACK])?;
            port.flush()?;
            thread::sleep(POST_ACK_DELAY);
            Ok(payload)
        }
        Err(err) => {
            if let ProtocolError::ChecksumMismatch { .. } = err {
                port.write_all(&[NAK])?;
            }
            Err(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_version_query() {
        assert_eq!(encode_frame(b"ETC:VER ?;"), b"\x02ETC:VER ?;\x03\x0e");
    }

    #[test]
    fn encode_settings_query() {
        assert_eq!(encode_frame(b"CMN:ALL ?;"), b"\x02CMN:ALL ?;\x03\x1c");
    }

    #[test]
    fn encode_measurement_query() {
        assert_eq!(encode_frame(b"ETC:FWD ?;"), b"\x02ETC:FWD ?;\x03\x1a");
    }

    #[test]
    fn fold_ignores_chunking_and_order() {
        let mut state: u32 = 0x2545_f491;
        let bytes: Vec<u8> = (0..257)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state >> 24) as u8
            })
            .collect();

        let whole = xor_fold(&bytes);
        for split in [0, 1, 13, 128, 256, 257] {
            let (head, tail) = bytes.split_at(split);
            assert_eq!(xor_fold(head) ^ xor_fold(tail), whole);
        }

        let mut reversed = bytes;
        reversed.reverse();
        assert_eq!(xor_fold(&reversed), whole);
    }

    #[test]
    fn decode_roundtrip() {
        let frame = encode_frame(b"CMN:RANGE 1;UNIT ppm;");
        let (received, checksum) = frame.split_at(frame.len() - 1);
        assert_eq!(
            decode_frame(received, Some(checksum[0])).unwrap(),
            b"CMN:RANGE 1;UNIT ppm;"
        );
    }

    #[test]
    fn roundtrip_arbitrary_bodies() {
        let mut state: u32 = 0x9e37_79b9;
        for len in 1..64 {
            // printable bytes only, the wire reserves STX/ETX
            let body: Vec<u8> = (0..len)
                .map(|_| {
                    state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                    0x20 + ((state >> 24) % 0x5f) as u8
                })
                .collect();

            let frame = encode_frame(&body);
            let (received, checksum) = frame.split_at(frame.len() - 1);
            assert_eq!(decode_frame(received, Some(checksum[0])).unwrap(), body);
        }
    }

    #[test]
    fn decode_rejects_missing_stx() {
        let err = decode_frame(b"ETC:VER SA3C30A;\x03", Some(0)).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingStx(Some(b'E'))));

        let err = decode_frame(b"", Some(0)).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingStx(None)));
    }

    #[test]
    fn decode_rejects_bad_checksum() {
        let frame = encode_frame(b"ETC:VER SA3C30A;");
        let received = &frame[..frame.len() - 1];
        let err = decode_frame(received, Some(frame[frame.len() - 1] ^ 0xff)).unwrap_err();
        assert!(matches!(err, ProtocolError::ChecksumMismatch { .. }));

        // a checksum byte the port never delivered can't match either
        let err = decode_frame(received, None).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::ChecksumMismatch { received: None, .. }
        ));
    }

    struct MockPort {
        input: io::Cursor<Vec<u8>>,
        written: Vec<u8>,
    }

    impl MockPort {
        fn new(input: &[u8]) -> Self {
            MockPort {
                input: io::Cursor::new(input.to_vec()),
                written: Vec::new(),
            }
        }

        fn unread(&self) -> usize {
            self.input.get_ref().len() - self.input.position() as usize
        }
    }

    impl Read for MockPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for MockPort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    // what the instrument puts on the wire for a given response payload
    fn instrument_reply(payload: &[u8]) -> Vec<u8> {
        let mut reply = vec![ACK];
        reply.extend_from_slice(&encode_frame(payload));
        reply
    }

    #[test]
    fn transact_returns_payload() {
        let mut port = MockPort::new(&instrument_reply(b"ETC:VER SA3C30A;"));

        let payload = transact(&mut port, b"ETC:VER ?;").unwrap();

        assert_eq!(payload, b"ETC:VER SA3C30A;");
        assert_eq!(&port.written[..13], b"\x02ETC:VER ?;\x03\x0e");
        assert_eq!(&port.written[13..], [ACK]);
        assert_eq!(port.unread(), 0);
    }

    #[test]
    fn transact_fails_on_nak() {
        let mut input = vec![NAK];
        input.extend_from_slice(&instrument_reply(b"ETC:VER SA3C30A;"));
        let mut port = MockPort::new(&input);
        let pending = port.unread() - 1;

        let err = transact(&mut port, b"ETC:VER ?;")
            .unwrap_err()
            .downcast::<ProtocolError>()
            .unwrap();

        assert!(matches!(err, ProtocolError::NotAcknowledged(Some(NAK))));
        // nothing past the NAK byte may be consumed, nothing sent back
        assert_eq!(port.unread(), pending);
        assert_eq!(port.written.len(), 13);
    }

    #[test]
    fn transact_fails_on_silent_instrument() {
        let mut port = MockPort::new(&[]);

        let err = transact(&mut port, b"ETC:VER ?;")
            .unwrap_err()
            .downcast::<ProtocolError>()
            .unwrap();

        assert!(matches!(err, ProtocolError::NotAcknowledged(None)));
    }

    #[test]
    fn transact_nacks_corrupted_response() {
        let mut input = instrument_reply(b"CMN:RANGE 1;");
        let last = input.len() - 1;
        input[last] ^= 0xff;
        let mut port = MockPort::new(&input);

        let err = transact(&mut port, b"CMN:ALL ?;")
            .unwrap_err()
            .downcast::<ProtocolError>()
            .unwrap();

        assert!(matches!(err, ProtocolError::ChecksumMismatch { .. }));
        // request frame, then exactly one NAK and no ACK
        assert_eq!(&port.written[..13], b"\x02CMN:ALL ?;\x03\x1c");
        assert_eq!(&port.written[13..], [NAK]);
    }

    #[test]
    fn transact_keeps_quiet_on_framing_error() {
        let mut input = vec![ACK];
        input.extend_from_slice(b"ETC:VER SA3C30A;\x03");
        input.push(0x00);
        let mut port = MockPort::new(&input);

        let err = transact(&mut port, b"ETC:VER ?;")
            .unwrap_err()
            .downcast::<ProtocolError>()
            .unwrap();

        assert!(matches!(err, ProtocolError::MissingStx(Some(b'E'))));
        // no NAK for a frame that never started
        assert_eq!(port.written.len(), 13);
    }
}
