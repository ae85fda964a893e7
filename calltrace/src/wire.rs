//! Host-side view of agent frames
//!
//! The byte layout lives in `calltrace-common`; this module turns a decoded
//! [`FrameHeader`] and its payload into a [`WireMessage`], so the rest of the
//! host never sees the negated-tid convention.

use calltrace_common::{decode_records, DecodeError, FrameHeader};
use log::warn;

use crate::domain::{FunctionId, Pid, Tid, Timestamp, TraceError};

/// One function entry or exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireEvent {
    pub function_id: FunctionId,
    /// Microseconds since the session base timestamp
    pub timestamp: Timestamp,
    pub is_enter: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// Records of one thread, in the order the thread produced them
    ///
    /// `corrupt` holds the function ids of records whose delta was zero.
    /// Their phase is unknown, so they are left out of `events`.
    Events { pid: Pid, tid: Tid, events: Vec<WireEvent>, corrupt: Vec<FunctionId> },
    ThreadName { pid: Pid, tid: Tid, name: String },
}

impl WireMessage {
    /// Decode one frame
    ///
    /// # Errors
    /// [`TraceError::MalformedWire`] when an events payload is not a whole
    /// number of records. A zero-delta record only loses itself.
    pub fn decode(header: &FrameHeader, payload: &[u8]) -> Result<Self, TraceError> {
        let pid = Pid(header.pid.unsigned_abs());
        let tid = Tid(header.thread_id());

        if header.is_thread_name() {
            let name = String::from_utf8_lossy(payload).trim().to_string();
            return Ok(Self::ThreadName { pid, tid, name });
        }

        let records = decode_records(payload)
            .map_err(|source| TraceError::MalformedWire { pid, tid, source })?;

        let mut events = Vec::with_capacity(records.len());
        let mut corrupt = Vec::new();
        for record in records {
            match record {
                Ok(event) => events.push(WireEvent {
                    function_id: FunctionId(event.function_id),
                    timestamp: Timestamp::from(event.timestamp),
                    is_enter: event.is_enter(),
                }),
                Err(DecodeError::ZeroDelta { offset, function_id }) => {
                    warn!("{pid} {tid}: dropping record at byte {offset}, fn#{function_id} has a zero delta");
                    corrupt.push(FunctionId(function_id));
                }
                Err(source) => return Err(TraceError::MalformedWire { pid, tid, source }),
            }
        }

        Ok(Self::Events { pid, tid, events, corrupt })
    }

    #[must_use]
    pub fn pid(&self) -> Pid {
        match self {
            Self::Events { pid, .. } | Self::ThreadName { pid, .. } => *pid,
        }
    }

    #[must_use]
    pub fn tid(&self) -> Tid {
        match self {
            Self::Events { tid, .. } | Self::ThreadName { tid, .. } => *tid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calltrace_common::FunctionEvent;

    fn payload(events: &[FunctionEvent]) -> Vec<u8> {
        events.iter().flat_map(|e| e.encode().unwrap()).collect()
    }

    #[test]
    fn test_decode_events() {
        let bytes = payload(&[FunctionEvent::enter(42, 1000), FunctionEvent::leave(42, 1500)]);
        let header = FrameHeader::events(100, 7, u32::try_from(bytes.len()).unwrap());

        let message = WireMessage::decode(&header, &bytes).unwrap();
        assert_eq!(
            message,
            WireMessage::Events {
                pid: Pid(100),
                tid: Tid(7),
                events: vec![
                    WireEvent { function_id: FunctionId(42), timestamp: Timestamp(1000), is_enter: true },
                    WireEvent { function_id: FunctionId(42), timestamp: Timestamp(1500), is_enter: false },
                ],
                corrupt: Vec::new(),
            }
        );
    }

    #[test]
    fn test_decode_thread_name() {
        let name = b"RenderThread\n";
        let header = FrameHeader::thread_name(100, 7, 13);

        let message = WireMessage::decode(&header, name).unwrap();
        assert_eq!(
            message,
            WireMessage::ThreadName { pid: Pid(100), tid: Tid(7), name: "RenderThread".to_string() }
        );
        assert_eq!(message.tid(), Tid(7));
    }

    #[test]
    fn test_partial_record_is_fatal() {
        let mut bytes = payload(&[FunctionEvent::enter(1, 10)]);
        bytes.push(0);
        let header = FrameHeader::events(100, 7, 7);

        let err = WireMessage::decode(&header, &bytes).unwrap_err();
        assert!(matches!(
            err,
            TraceError::MalformedWire { source: DecodeError::PartialRecord { len: 7 }, .. }
        ));
    }

    #[test]
    fn test_zero_delta_record_is_dropped() {
        let mut bytes = payload(&[FunctionEvent::enter(1, 10)]);
        bytes.extend_from_slice(&[5, 0, 0, 0, 0, 0]);
        bytes.extend(payload(&[FunctionEvent::leave(1, 30)]));
        let header = FrameHeader::events(100, 7, 18);

        let message = WireMessage::decode(&header, &bytes).unwrap();
        let WireMessage::Events { events, corrupt, .. } = message else { panic!("expected events") };
        assert_eq!(corrupt, [FunctionId(5)]);
        let kept: Vec<_> = events.iter().map(|e| (e.function_id, e.is_enter)).collect();
        assert_eq!(kept, [(FunctionId(1), true), (FunctionId(1), false)]);
    }

    #[test]
    fn test_empty_events_payload() {
        let header = FrameHeader::events(100, 7, 0);
        let message = WireMessage::decode(&header, &[]).unwrap();
        assert_eq!(
            message,
            WireMessage::Events { pid: Pid(100), tid: Tid(7), events: Vec::new(), corrupt: Vec::new() }
        );
    }
}
