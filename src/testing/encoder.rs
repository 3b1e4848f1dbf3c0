//! A reference codec for order and completeness checks
//!
//! Each frame becomes a 16-byte access unit: magic, sequence number and an
//! FNV-1a digest of the frame payload. [`reference_decode`] parses any
//! concatenation of chunks back into the sequence list, so tests can prove
//! that every accepted frame reached the sink exactly once, in order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use crate::encoder::{Drained, EncoderBackend, EncoderSettings, FrameEncoder};
use crate::errors::EncodeError;
use crate::frame::{EncodedChunk, Frame};

pub const UNIT_MAGIC: [u8; 4] = *b"RFU1";
pub const UNIT_LEN: usize = 16;

fn digest(data: &[u8]) -> u32 {
    data.iter().fold(0x811c_9dc5u32, |h, &b| (h ^ b as u32).wrapping_mul(0x0100_0193))
}

fn access_unit(frame: &Frame) -> Vec<u8> {
    let mut unit = Vec::with_capacity(UNIT_LEN);
    unit.extend_from_slice(&UNIT_MAGIC);
    unit.extend_from_slice(&frame.sequence().to_le_bytes());
    unit.extend_from_slice(&digest(frame.data()).to_le_bytes());
    unit
}

/// Decoded access unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedUnit {
    pub sequence: u64,
    pub digest: u32,
}

/// Parse a stream produced by [`ReferenceEncoder`].
///
/// Fails on a truncated unit or a bad magic.
pub fn reference_decode_units(stream: &[u8]) -> Result<Vec<DecodedUnit>, String> {
    if stream.len() % UNIT_LEN != 0 {
        return Err(format!(
            "stream of {} bytes ends mid-unit",
            stream.len()
        ));
    }
    stream
        .chunks_exact(UNIT_LEN)
        .enumerate()
        .map(|(i, unit)| {
            if unit[..4] != UNIT_MAGIC {
                return Err(format!("unit {i} has a bad magic"));
            }
            let mut seq = [0u8; 8];
            seq.copy_from_slice(&unit[4..12]);
            let mut dig = [0u8; 4];
            dig.copy_from_slice(&unit[12..16]);
            Ok(DecodedUnit {
                sequence: u64::from_le_bytes(seq),
                digest: u32::from_le_bytes(dig),
            })
        })
        .collect()
}

/// Sequence numbers of every frame in the stream, in stream order
pub fn reference_decode(stream: &[u8]) -> Result<Vec<u64>, String> {
    Ok(reference_decode_units(stream)?
        .into_iter()
        .map(|u| u.sequence)
        .collect())
}

/// Observations shared with the test
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceLog {
    pub accepted: Vec<u64>,
    pub busy_answers: u32,
    pub flushed: bool,
}

/// Lookahead encoder with scriptable faults.
///
/// With `lookahead` k, a frame's unit is emitted only once k later frames
/// have been submitted, or at flush. Fault triggers are keyed by the
/// 1-based count of `encode` calls that reached the backend.
pub struct ReferenceEncoder {
    lookahead: usize,
    aligned: bool,
    batch: bool,
    pending: VecDeque<Vec<u8>>,
    calls: u64,
    busy: HashMap<u64, u32>,
    fail_at: Option<u64>,
    fail_flush: bool,
    empty_at: HashSet<u64>,
    log: Arc<Mutex<ReferenceLog>>,
}

impl ReferenceEncoder {
    pub fn new(lookahead: usize) -> Self {
        Self {
            lookahead,
            aligned: false,
            batch: false,
            pending: VecDeque::new(),
            calls: 0,
            busy: HashMap::new(),
            fail_at: None,
            fail_flush: false,
            empty_at: HashSet::new(),
            log: Arc::new(Mutex::new(ReferenceLog::default())),
        }
    }

    /// No lookahead, one chunk per frame, like openh264
    pub fn aligned() -> Self {
        Self {
            aligned: true,
            ..Self::new(0)
        }
    }

    /// Emit everything released by one call as a single chunk
    pub fn batched(mut self) -> Self {
        self.batch = true;
        self
    }

    /// Answer `DeviceBusy` `times` times on call `call`
    pub fn busy_on(mut self, call: u64, times: u32) -> Self {
        self.busy.insert(call, times);
        self
    }

    pub fn fail_on(mut self, call: u64) -> Self {
        self.fail_at = Some(call);
        self
    }

    /// Emit the buffered tail, then report a device error from `flush`
    pub fn fail_on_flush(mut self) -> Self {
        self.fail_flush = true;
        self
    }

    /// Return a zero-length chunk on call `call`
    pub fn empty_on(mut self, call: u64) -> Self {
        self.empty_at.insert(call);
        self
    }

    /// Record into an existing log, e.g. one held by a test across sessions
    pub fn with_log(mut self, log: Arc<Mutex<ReferenceLog>>) -> Self {
        self.log = log;
        self
    }

    pub fn log(&self) -> Arc<Mutex<ReferenceLog>> {
        self.log.clone()
    }

    /// Wrap in a [`FrameEncoder`] configured by `settings`
    pub fn into_encoder(self, settings: EncoderSettings) -> FrameEncoder {
        FrameEncoder::new(settings, Box::new(self))
    }

    fn release(&mut self, keep: usize) -> Vec<EncodedChunk> {
        let ready = self.pending.len().saturating_sub(keep);
        let units: Vec<Vec<u8>> = self.pending.drain(..ready).collect();
        if self.batch && !units.is_empty() {
            vec![EncodedChunk::new(units.concat())]
        } else {
            units.into_iter().map(EncodedChunk::new).collect()
        }
    }
}

impl EncoderBackend for ReferenceEncoder {
    fn name(&self) -> &'static str {
        "reference"
    }

    fn frame_aligned(&self) -> bool {
        self.aligned
    }

    fn encode(&mut self, frame: &Frame) -> Result<Vec<EncodedChunk>, EncodeError> {
        let call = self.calls + 1;
        if let Some(left) = self.busy.get_mut(&call) {
            if *left > 0 {
                *left -= 1;
                self.log.lock().expect("lock poisoned").busy_answers += 1;
                return Err(EncodeError::DeviceBusy);
            }
        }
        self.calls = call;

        if self.fail_at == Some(call) {
            return Err(EncodeError::DeviceError(format!("scripted failure on call {call}")));
        }
        if self.empty_at.contains(&call) {
            return Ok(vec![EncodedChunk::new(Vec::new())]);
        }

        self.log.lock().expect("lock poisoned").accepted.push(frame.sequence());
        self.pending.push_back(access_unit(frame));

        let mut chunks = self.release(self.lookahead);
        if self.aligned {
            if let Some(first) = chunks.first_mut() {
                first.is_keyframe = call == 1;
            }
        }
        Ok(chunks)
    }

    fn flush(&mut self) -> Drained {
        self.log.lock().expect("lock poisoned").flushed = true;
        let tail = self.release(0);
        if self.fail_flush {
            return Drained::failed(
                tail,
                EncodeError::DeviceError("scripted failure while draining".to_string()),
            );
        }
        Drained::complete(tail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::PixelFormat;
    use crate::testing::synthetic_frame;

    fn frames(n: u64) -> Vec<Frame> {
        (1..=n).map(|s| synthetic_frame(s, 4, 4, PixelFormat::Yuv420)).collect()
    }

    #[test]
    fn test_lookahead_delays_output() {
        let mut enc = ReferenceEncoder::new(2);
        let fs = frames(3);
        assert!(enc.encode(&fs[0]).unwrap().is_empty());
        assert!(enc.encode(&fs[1]).unwrap().is_empty());
        let out = enc.encode(&fs[2]).unwrap();
        assert_eq!(reference_decode(&out[0].data).unwrap(), vec![1]);
        let tail: Vec<u8> = enc.flush().chunks.iter().flat_map(|c| c.data.to_vec()).collect();
        assert_eq!(reference_decode(&tail).unwrap(), vec![2, 3]);
    }

    #[test]
    fn test_digest_identifies_payload() {
        let fs = frames(2);
        let a = reference_decode_units(&access_unit(&fs[0])).unwrap()[0];
        assert_eq!(a.digest, digest(fs[0].data()));
        let b = reference_decode_units(&access_unit(&fs[1])).unwrap()[0];
        assert_ne!(a.digest, b.digest);
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let unit = access_unit(&frames(1)[0]);
        assert!(reference_decode(&unit[..10]).is_err());
        let mut bad = unit.clone();
        bad[0] = b'X';
        assert!(reference_decode(&bad).is_err());
    }

    #[test]
    fn test_busy_does_not_consume_call() {
        let mut enc = ReferenceEncoder::aligned().busy_on(1, 2);
        let f = &frames(1)[0];
        assert_eq!(enc.encode(f), Err(EncodeError::DeviceBusy));
        assert_eq!(enc.encode(f), Err(EncodeError::DeviceBusy));
        let out = enc.encode(f).unwrap();
        assert!(out[0].is_keyframe);
        assert_eq!(enc.log().lock().unwrap().busy_answers, 2);
    }
}
