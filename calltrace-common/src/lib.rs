//! # Shared Wire Format (Agent ↔ Host)
//!
//! Defines the byte layout shared between the in-process tracing agent and
//! the host. The agent links this crate to encode records; the host links it
//! to decode them. Everything here is `no_std` so the agent side can be built
//! into targets that carry no allocator.
//!
//! ## Channel Layout
//!
//! Every message on the agent connection is one frame:
//!
//! ```text
//! ┌──────────┬──────────┬──────────┬─────────────────────────────┐
//! │ pid: i32 │ tid: i32 │ len: u32 │ payload (len bytes)         │
//! └──────────┴──────────┴──────────┴─────────────────────────────┘
//!   tid > 0  → payload is a whole number of 6-byte function records
//!   tid < 0  → payload is the UTF-8 name of thread `-tid`
//! ```
//!
//! A function record packs the phase into the sign of the timestamp:
//!
//! ```text
//! ┌──────────────────┬──────────────────────────┐
//! │ function_id: u16 │ delta: i32               │
//! └──────────────────┴──────────────────────────┘
//!   delta > 0 → enter at  delta
//!   delta < 0 → leave at -delta
//! ```
//!
//! All integers are little-endian.
//!
//! ## Key Types
//!
//! - [`FunctionEvent`] - One decoded (or to-be-encoded) function record
//! - [`Records`] - Iterator walking a payload in fixed strides
//! - [`FrameHeader`] - The 12-byte frame prefix
//! - [`RecordBuffer`] - Fixed-capacity per-thread staging buffer for agents

#![no_std]

use core::fmt;

// ============================================================================
// Protocol Constants
// ============================================================================

/// Size of one packed function record: `u16` id + `i32` delta
pub const RECORD_SIZE: usize = 6;

/// Width of the function id space
///
/// The id field is a `u16`, so at most this many distinct functions can be
/// addressed in one session (managed and native combined).
pub const FUNCTION_ID_SPACE: usize = 1 << 16;

/// Largest timestamp a record can carry
///
/// The magnitude of the signed delta is the timestamp, so a leave must still
/// be representable as a negative `i32`.
pub const MAX_TIMESTAMP: u32 = i32::MAX as u32;

/// Size of the frame prefix: `i32` pid + `i32` tid + `u32` payload length
pub const FRAME_HEADER_SIZE: usize = 12;

/// Upper bound on a single frame payload accepted by the host
///
/// A full [`RecordBuffer`] of the default capacity is well under this.
pub const MAX_FRAME_PAYLOAD: u32 = 1 << 20;

/// Records an agent buffers per thread before flushing
pub const DEFAULT_BUFFER_RECORDS: usize = 128;

/// Symbol every agent library exports
///
/// The host resolves it in the target after the library is mapped, which
/// tells a calltrace agent apart from any other library at that path.
pub const AGENT_ENTRY_SYMBOL: &str = "calltrace_agent_init";

/// **Host → agent**: remove every interception
///
/// No new records are produced after the agent acts on this byte. Records
/// already buffered stay buffered until [`CONTROL_FLUSH`].
pub const CONTROL_DETACH: u8 = 0x01;

/// **Host → agent**: deliver every buffered record, then close the connection
///
/// Closing the connection is the acknowledgement that nothing else is coming.
pub const CONTROL_FLUSH: u8 = 0x02;

// ============================================================================
// Function Records
// ============================================================================

/// Whether a record marks entry into or exit from a function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Enter,
    Leave,
}

/// One function record
///
/// `timestamp` is always the positive magnitude; the sign only exists on the
/// wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionEvent {
    pub function_id: u16,
    pub timestamp: u32,
    pub phase: Phase,
}

impl FunctionEvent {
    #[must_use]
    pub const fn enter(function_id: u16, timestamp: u32) -> Self {
        Self { function_id, timestamp, phase: Phase::Enter }
    }

    #[must_use]
    pub const fn leave(function_id: u16, timestamp: u32) -> Self {
        Self { function_id, timestamp, phase: Phase::Leave }
    }

    #[must_use]
    pub fn is_enter(&self) -> bool {
        self.phase == Phase::Enter
    }

    /// Signed delta as it appears on the wire
    ///
    /// # Errors
    /// A zero timestamp has no sign and so cannot carry a phase; timestamps
    /// above [`MAX_TIMESTAMP`] do not fit the field.
    pub fn delta(&self) -> Result<i32, EncodeError> {
        if self.timestamp == 0 {
            return Err(EncodeError::ZeroTimestamp);
        }
        let magnitude =
            i32::try_from(self.timestamp).map_err(|_| EncodeError::TimestampOverflow(self.timestamp))?;
        Ok(match self.phase {
            Phase::Enter => magnitude,
            Phase::Leave => -magnitude,
        })
    }

    /// Pack into the 6-byte wire record
    ///
    /// # Errors
    /// See [`FunctionEvent::delta`].
    pub fn encode(&self) -> Result<[u8; RECORD_SIZE], EncodeError> {
        let delta = self.delta()?;
        let mut record = [0u8; RECORD_SIZE];
        record[..2].copy_from_slice(&self.function_id.to_le_bytes());
        record[2..].copy_from_slice(&delta.to_le_bytes());
        Ok(record)
    }

    /// Unpack a 6-byte wire record
    ///
    /// # Errors
    /// Returns [`DecodeError::ZeroDelta`] when the delta is zero, since the
    /// phase cannot be recovered from it. `offset` is reported as 0; use
    /// [`Records`] to get the position inside a payload.
    pub fn decode(record: &[u8; RECORD_SIZE]) -> Result<Self, DecodeError> {
        Self::decode_at(record, 0)
    }

    fn decode_at(record: &[u8; RECORD_SIZE], offset: usize) -> Result<Self, DecodeError> {
        let function_id = u16::from_le_bytes([record[0], record[1]]);
        let delta = i32::from_le_bytes([record[2], record[3], record[4], record[5]]);

        let phase = match delta.signum() {
            1 => Phase::Enter,
            -1 => Phase::Leave,
            _ => return Err(DecodeError::ZeroDelta { offset, function_id }),
        };

        Ok(Self { function_id, timestamp: delta.unsigned_abs(), phase })
    }
}

/// Iterator over the function records of one payload
///
/// Created by [`decode_records`], which has already checked that the payload
/// holds a whole number of records.
#[derive(Debug, Clone)]
pub struct Records<'a> {
    chunks: core::slice::ChunksExact<'a, u8>,
    offset: usize,
}

impl Iterator for Records<'_> {
    type Item = Result<FunctionEvent, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = self.chunks.next()?;
        let offset = self.offset;
        self.offset += RECORD_SIZE;

        let record: &[u8; RECORD_SIZE] = chunk.try_into().ok()?;
        Some(FunctionEvent::decode_at(record, offset))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.chunks.size_hint()
    }
}

impl ExactSizeIterator for Records<'_> {}

/// Walk a payload in fixed 6-byte strides
///
/// # Errors
/// Returns [`DecodeError::PartialRecord`] when the payload length is not a
/// multiple of [`RECORD_SIZE`]. Records never span messages, so a trailing
/// fragment means the buffer is corrupt.
pub fn decode_records(payload: &[u8]) -> Result<Records<'_>, DecodeError> {
    if payload.len() % RECORD_SIZE != 0 {
        return Err(DecodeError::PartialRecord { len: payload.len() });
    }
    Ok(Records { chunks: payload.chunks_exact(RECORD_SIZE), offset: 0 })
}

// ============================================================================
// Frames
// ============================================================================

/// Prefix of every frame on the agent connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub pid: i32,
    /// Thread id, negated when the payload is a thread name
    pub tid: i32,
    pub len: u32,
}

impl FrameHeader {
    /// Header for a payload of packed function records
    #[must_use]
    pub const fn events(pid: i32, tid: i32, len: u32) -> Self {
        Self { pid, tid, len }
    }

    /// Header for a thread-name payload
    #[must_use]
    pub const fn thread_name(pid: i32, tid: i32, len: u32) -> Self {
        Self { pid, tid: -tid, len }
    }

    #[must_use]
    pub fn is_thread_name(&self) -> bool {
        self.tid < 0
    }

    /// Thread id with the thread-name sign removed
    #[must_use]
    pub fn thread_id(&self) -> u32 {
        self.tid.unsigned_abs()
    }

    #[must_use]
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        header[0..4].copy_from_slice(&self.pid.to_le_bytes());
        header[4..8].copy_from_slice(&self.tid.to_le_bytes());
        header[8..12].copy_from_slice(&self.len.to_le_bytes());
        header
    }

    #[must_use]
    pub fn decode(header: &[u8; FRAME_HEADER_SIZE]) -> Self {
        Self {
            pid: i32::from_le_bytes([header[0], header[1], header[2], header[3]]),
            tid: i32::from_le_bytes([header[4], header[5], header[6], header[7]]),
            len: u32::from_le_bytes([header[8], header[9], header[10], header[11]]),
        }
    }
}

// ============================================================================
// Agent-Side Buffering
// ============================================================================

/// Per-thread staging buffer for encoded records
///
/// Each traced thread owns one. Records are appended in the order the thread
/// produced them, so a drained buffer is chronological for that thread.
/// When [`RecordBuffer::is_full`] turns true the agent must drain before the
/// next push.
#[derive(Debug, Clone)]
pub struct RecordBuffer<const N: usize> {
    records: [[u8; RECORD_SIZE]; N],
    len: usize,
}

impl<const N: usize> Default for RecordBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> RecordBuffer<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self { records: [[0; RECORD_SIZE]; N], len: 0 }
    }

    /// Append one record
    ///
    /// # Errors
    /// [`EncodeError::BufferFull`] if the buffer was not drained in time, or
    /// any error from [`FunctionEvent::encode`].
    pub fn push(&mut self, event: FunctionEvent) -> Result<(), EncodeError> {
        if self.len == N {
            return Err(EncodeError::BufferFull);
        }
        self.records[self.len] = event.encode()?;
        self.len += 1;
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len == N
    }

    /// Encoded payload of everything pushed so far
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.records[..self.len].as_flattened()
    }

    /// Hand the buffered payload to `send` (if any) and reset
    pub fn drain<F: FnOnce(&[u8])>(&mut self, send: F) {
        if !self.is_empty() {
            send(self.as_bytes());
        }
        self.len = 0;
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    ZeroTimestamp,
    TimestampOverflow(u32),
    BufferFull,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroTimestamp => write!(f, "timestamp 0 cannot carry a phase"),
            Self::TimestampOverflow(ts) => {
                write!(f, "timestamp {ts} exceeds the record limit of {MAX_TIMESTAMP}")
            }
            Self::BufferFull => write!(f, "record buffer is full"),
        }
    }
}

impl core::error::Error for EncodeError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    PartialRecord { len: usize },
    ZeroDelta { offset: usize, function_id: u16 },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PartialRecord { len } => {
                write!(f, "payload of {len} bytes is not a whole number of {RECORD_SIZE}-byte records")
            }
            Self::ZeroDelta { offset, function_id } => {
                write!(f, "record for function {function_id} at byte {offset} has a zero delta")
            }
        }
    }
}

impl core::error::Error for DecodeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enter_record_layout() {
        let record = FunctionEvent::enter(42, 1000).encode().unwrap();
        assert_eq!(u16::from_le_bytes([record[0], record[1]]), 42);
        assert_eq!(i32::from_le_bytes([record[2], record[3], record[4], record[5]]), 1000);

        let decoded = FunctionEvent::decode(&record).unwrap();
        assert_eq!(decoded.function_id, 42);
        assert!(decoded.is_enter());
        assert_eq!(decoded.delta(), Ok(1000));
    }

    #[test]
    fn test_leave_record_is_negative() {
        let record = FunctionEvent::leave(42, 1500).encode().unwrap();
        assert_eq!(i32::from_le_bytes([record[2], record[3], record[4], record[5]]), -1500);

        let decoded = FunctionEvent::decode(&record).unwrap();
        assert_eq!(decoded.phase, Phase::Leave);
        assert_eq!(decoded.timestamp, 1500);
    }

    #[test]
    fn test_max_function_id() {
        let record = FunctionEvent::enter(u16::MAX, 7).encode().unwrap();
        assert_eq!(FunctionEvent::decode(&record).unwrap().function_id, u16::MAX);
    }

    #[test]
    fn test_encode_rejects_unrepresentable_timestamps() {
        assert_eq!(FunctionEvent::enter(1, 0).encode(), Err(EncodeError::ZeroTimestamp));
        assert_eq!(
            FunctionEvent::leave(1, MAX_TIMESTAMP + 1).encode(),
            Err(EncodeError::TimestampOverflow(MAX_TIMESTAMP + 1))
        );
        assert!(FunctionEvent::leave(1, MAX_TIMESTAMP).encode().is_ok());
    }

    #[test]
    fn test_decode_records_rejects_partial_record() {
        let err = decode_records(&[0u8; 7]).unwrap_err();
        assert_eq!(err, DecodeError::PartialRecord { len: 7 });
    }

    #[test]
    fn test_decode_records_reports_zero_delta_offset() {
        let mut payload = [0u8; 12];
        payload[..6].copy_from_slice(&FunctionEvent::enter(3, 10).encode().unwrap());
        payload[6] = 9;
        let results: [Result<FunctionEvent, DecodeError>; 2] = {
            let mut it = decode_records(&payload).unwrap();
            [it.next().unwrap(), it.next().unwrap()]
        };
        assert!(results[0].is_ok());
        assert_eq!(results[1], Err(DecodeError::ZeroDelta { offset: 6, function_id: 9 }));
    }

    #[test]
    fn test_frame_header_thread_name_sign() {
        let header = FrameHeader::thread_name(99, 7, 6);
        assert_eq!(header.tid, -7);
        assert!(header.is_thread_name());
        assert_eq!(header.thread_id(), 7);

        let decoded = FrameHeader::decode(&header.encode());
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_record_buffer_drains_in_order() {
        let mut buffer = RecordBuffer::<2>::new();
        buffer.push(FunctionEvent::enter(1, 5)).unwrap();
        buffer.push(FunctionEvent::leave(1, 9)).unwrap();
        assert!(buffer.is_full());
        assert_eq!(buffer.push(FunctionEvent::enter(2, 10)), Err(EncodeError::BufferFull));

        let mut drained = [0u8; 2 * RECORD_SIZE];
        buffer.drain(|bytes| drained.copy_from_slice(bytes));
        assert!(buffer.is_empty());

        let mut records = decode_records(&drained).unwrap();
        assert_eq!(records.next(), Some(Ok(FunctionEvent::enter(1, 5))));
        assert_eq!(records.next(), Some(Ok(FunctionEvent::leave(1, 9))));
        assert_eq!(records.next(), None);
    }

    #[test]
    fn test_drain_skips_empty_buffer() {
        let mut buffer = RecordBuffer::<4>::new();
        let mut called = false;
        buffer.drain(|_| called = true);
        assert!(!called);
    }
}
