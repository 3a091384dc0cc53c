use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::checksum::checksum;
use crate::error::{FrameError, Result};

/// Sync marker opening every frame.
pub const SYNC: [u8; 2] = [0xDE, 0x5B];

/// Largest payload the one-byte length field can describe.
pub const MAX_PAYLOAD: usize = u8::MAX as usize;

/// Bytes added around a payload: sync (2) + length (1) + checksum (2).
pub const FRAME_OVERHEAD: usize = 5;

/// Encode `payload` into the wire format.
///
/// ```text
/// ┌────────────┬────────┬──────────────┬──────────────┐
/// │ Sync (2B)  │ Length │ Payload      │ Checksum     │
/// │ 0xDE 0x5B  │ (1B)   │ (Length B)   │ (2B BE)      │
/// └────────────┴────────┴──────────────┴──────────────┘
///                └──── checksum covers ───┘
/// ```
pub fn encode_frame(payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD,
        });
    }
    dst.reserve(FRAME_OVERHEAD + payload.len());
    dst.put_slice(&SYNC);
    let covered_start = dst.len();
    dst.put_u8(payload.len() as u8);
    dst.put_slice(payload);
    let sum = checksum(&dst[covered_start..]);
    dst.put_u16(sum);
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    Idle,
    Header,
    Size,
    Data,
    Checksum1,
    Checksum2,
}

/// Incremental frame decoder and encoder.
///
/// Decoding consumes every byte it is given and keeps partial frames in its
/// own state, so callers can feed chunks split at any position. Each decoded
/// item is a packet: the frame payload without length or checksum.
#[derive(Debug)]
pub struct FrameCodec {
    state: RxState,
    // Length byte followed by the payload, exactly as covered by the checksum.
    assembly: BytesMut,
    declared: usize,
    received: u16,
    dropped: u64,
}

impl FrameCodec {
    /// Create a codec in the idle state.
    pub fn new() -> Self {
        Self {
            state: RxState::Idle,
            assembly: BytesMut::with_capacity(MAX_PAYLOAD + 1),
            declared: 0,
            received: 0,
            dropped: 0,
        }
    }

    /// Advance the state machine by one byte.
    ///
    /// Returns a packet when `byte` completes a frame with a valid checksum.
    pub fn push(&mut self, byte: u8) -> Option<Bytes> {
        match self.state {
            RxState::Idle => {
                if byte == SYNC[0] {
                    self.state = RxState::Header;
                }
            }
            RxState::Header => {
                self.state = if byte == SYNC[1] {
                    RxState::Size
                } else {
                    RxState::Idle
                };
            }
            RxState::Size => {
                self.declared = usize::from(byte);
                self.assembly.clear();
                self.assembly.put_u8(byte);
                self.state = if self.declared == 0 {
                    RxState::Checksum1
                } else {
                    RxState::Data
                };
            }
            RxState::Data => {
                self.assembly.put_u8(byte);
                if self.assembly.len() == self.declared + 1 {
                    self.state = RxState::Checksum1;
                }
            }
            RxState::Checksum1 => {
                self.received = u16::from(byte) << 8;
                self.state = RxState::Checksum2;
            }
            RxState::Checksum2 => {
                self.received |= u16::from(byte);
                self.state = RxState::Idle;

                let computed = checksum(&self.assembly);
                if computed == self.received {
                    let mut frame = self.assembly.split();
                    frame.advance(1);
                    return Some(frame.freeze());
                }
                self.dropped += 1;
                trace!(
                    len = self.declared,
                    computed = format_args!("{computed:#06x}"),
                    received = format_args!("{:#06x}", self.received),
                    "dropping frame with bad checksum"
                );
            }
        }
        None
    }

    /// True when no partial frame is buffered.
    pub fn is_idle(&self) -> bool {
        self.state == RxState::Idle
    }

    /// Number of frames discarded for checksum mismatch.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        while src.has_remaining() {
            let byte = src.get_u8();
            if let Some(packet) = self.push(byte) {
                return Ok(Some(packet));
            }
        }
        Ok(None)
    }
}

impl<'a> Encoder<&'a [u8]> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, payload: &'a [u8], dst: &mut BytesMut) -> Result<()> {
        encode_frame(payload, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_frame(payload, &mut buf).unwrap();
        buf.to_vec()
    }

    fn decode_all(codec: &mut FrameCodec, chunks: &[&[u8]]) -> Vec<Bytes> {
        let mut out = Vec::new();
        let mut buf = BytesMut::new();
        for chunk in chunks {
            buf.extend_from_slice(chunk);
            while let Some(packet) = codec.decode(&mut buf).unwrap() {
                out.push(packet);
            }
            assert!(buf.is_empty());
        }
        out
    }

    #[test]
    fn encodes_init_ack_exactly() {
        assert_eq!(frame(&[0x91]), vec![0xDE, 0x5B, 0x01, 0x91, 0x40, 0x17]);
    }

    #[test]
    fn encodes_empty_payload() {
        let wire = frame(&[]);
        // Seed rotated once, nothing XORed in.
        assert_eq!(wire, vec![0xDE, 0x5B, 0x00, 0x20, 0x42]);
    }

    #[test]
    fn rejects_oversized_payload() {
        let mut buf = BytesMut::new();
        let err = encode_frame(&[0u8; 256], &mut buf).unwrap_err();
        assert!(matches!(
            err,
            FrameError::PayloadTooLarge {
                size: 256,
                max: 255
            }
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn accepts_max_payload() {
        let payload = vec![0xA5; MAX_PAYLOAD];
        let wire = frame(&payload);
        assert_eq!(wire.len(), MAX_PAYLOAD + FRAME_OVERHEAD);

        let mut codec = FrameCodec::new();
        let packets = decode_all(&mut codec, &[wire.as_slice()]);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].as_ref(), payload.as_slice());
    }

    #[test]
    fn decodes_device_reply() {
        let mut codec = FrameCodec::new();
        let packets = decode_all(&mut codec, &[&[0xDE, 0x5B, 0x01, 0x91, 0x40, 0x17][..]]);
        assert_eq!(packets, vec![Bytes::from_static(&[0x91])]);
        assert!(codec.is_idle());
    }

    #[test]
    fn decodes_empty_frame() {
        let mut codec = FrameCodec::new();
        let packets = decode_all(&mut codec, &[&frame(&[])[..], &frame(&[0x07])[..]]);
        assert_eq!(packets.len(), 2);
        assert!(packets[0].is_empty());
        assert_eq!(packets[1].as_ref(), &[0x07]);
    }

    #[test]
    fn drops_bad_checksum_and_recovers() {
        let mut bad = frame(&[0x93, 0x00, 0x42]);
        let last = bad.len() - 1;
        bad[last] ^= 0x01;
        let good = frame(&[0x94, 0x00]);

        let mut codec = FrameCodec::new();
        let packets = decode_all(&mut codec, &[bad.as_slice(), good.as_slice()]);
        assert_eq!(packets, vec![Bytes::from_static(&[0x94, 0x00])]);
        assert_eq!(codec.dropped_frames(), 1);
    }

    #[test]
    fn broken_header_resyncs() {
        let good = frame(&[0x94, 0x01]);
        let mut stream = vec![0xDE, 0x00, 0x5B, 0xDE];
        stream.push(0x11); // second sync byte wrong, back to idle
        stream.extend_from_slice(&good);

        let mut codec = FrameCodec::new();
        let packets = decode_all(&mut codec, &[stream.as_slice()]);
        assert_eq!(packets, vec![Bytes::from_static(&[0x94, 0x01])]);
    }

    #[test]
    fn resync_is_independent_of_chunk_boundaries() {
        let first = frame(&[0xAA]);
        let second = frame(&[0x93, 0x02, 0xFF, 0xDE, 0x5B]);
        let mut stream = vec![0x00, 0x13, 0x5B, 0xFF];
        stream.extend_from_slice(&first);
        stream.extend_from_slice(&[0x37, 0xDE, 0x01, 0x5B, 0x99]);
        stream.extend_from_slice(&second);
        stream.extend_from_slice(&[0xDE]);

        let expected = vec![
            Bytes::from_static(&[0xAA]),
            Bytes::from_static(&[0x93, 0x02, 0xFF, 0xDE, 0x5B]),
        ];

        for split in 0..=stream.len() {
            let (a, b) = stream.split_at(split);
            let mut codec = FrameCodec::new();
            assert_eq!(decode_all(&mut codec, &[a, b]), expected, "split at {split}");
        }

        for a_end in 0..=stream.len() {
            for b_end in a_end..=stream.len() {
                let mut codec = FrameCodec::new();
                let packets = decode_all(
                    &mut codec,
                    &[&stream[..a_end], &stream[a_end..b_end], &stream[b_end..]],
                );
                assert_eq!(packets, expected, "splits at {a_end}/{b_end}");
            }
        }

        let mut codec = FrameCodec::new();
        let single: Vec<&[u8]> = stream.chunks(1).collect();
        assert_eq!(decode_all(&mut codec, &single), expected);
    }

    #[test]
    fn decoder_returns_one_packet_per_call() {
        let mut wire = frame(&[0x01]);
        wire.extend_from_slice(&frame(&[0x02]));
        let mut buf = BytesMut::from(wire.as_slice());

        let mut codec = FrameCodec::new();
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.as_ref(), &[0x01]);
        assert!(!buf.is_empty());
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.as_ref(), &[0x02]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn encoder_matches_encode_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(&[0x92, 0x00, 0x05][..], &mut buf).unwrap();
        assert_eq!(buf.to_vec(), frame(&[0x92, 0x00, 0x05]));
    }
}
