//! Per-connection message queue.
//!
//! Reassembles frames from arbitrarily fragmented or coalesced socket reads
//! and decodes their bodies through the connection's [`Codec`]. It also owns
//! the connection's [`PendingRequests`] table, since both are keyed by the
//! frame ids flowing through this queue.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use peerwire::codec::{Codec, TaggedCodec, Value};
//! use peerwire::protocol::{build_frame, FrameIdGenerator};
//! use peerwire::queue::{MessageQueue, Processed};
//!
//! let mut queue = MessageQueue::new(Arc::new(TaggedCodec));
//! let body = Codec::encode(&TaggedCodec, &Value::from("hi")).unwrap();
//! let bytes = build_frame(FrameIdGenerator::new().next_id(), false, &body);
//!
//! // First half: nothing yet.
//! assert_eq!(queue.process(&bytes[..7]).count(), 0);
//!
//! // Second half completes the frame.
//! let items: Vec<_> = queue.process(&bytes[7..]).collect();
//! assert!(matches!(&items[..], [Processed::Frame(f)] if f.data == Value::from("hi")));
//! ```

use std::sync::Arc;

use bytes::{Buf, BytesMut};

use crate::codec::{Codec, Value};
use crate::error::PeerwireError;
use crate::pending::PendingRequests;
use crate::protocol::{decode_header, Frame, DEFAULT_MAX_BODY_SIZE, HEADER_SIZE};

/// One element yielded by [`MessageQueue::process`].
#[derive(Debug)]
pub enum Processed {
    /// A complete, decoded frame.
    Frame(Frame<Value>),
    /// A frame could not be decoded; the rest of the buffer was discarded.
    ParseFailure(PeerwireError),
}

/// Stateful frame reader for one connection.
pub struct MessageQueue {
    /// Bytes of frames that are not complete yet.
    buffer: BytesMut,
    codec: Arc<dyn Codec>,
    pending: Arc<PendingRequests>,
    max_body_size: u32,
}

impl MessageQueue {
    /// Create a queue with the default maximum body size.
    pub fn new(codec: Arc<dyn Codec>) -> Self {
        Self::with_max_body(codec, DEFAULT_MAX_BODY_SIZE)
    }

    /// Create a queue with a custom maximum body size.
    pub fn with_max_body(codec: Arc<dyn Codec>, max_body_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            codec,
            pending: Arc::new(PendingRequests::new()),
            max_body_size,
        }
    }

    /// The correlation table of this connection.
    pub fn pending(&self) -> &Arc<PendingRequests> {
        &self.pending
    }

    /// Append a chunk and iterate over the frames it completes.
    ///
    /// Carried-over bytes from earlier calls are consumed first. Iteration
    /// stops at an incomplete header or body, which stays buffered so the
    /// next call resumes at the start of that frame. A body that fails to
    /// decode yields one [`Processed::ParseFailure`] and drops everything
    /// still buffered, since frame boundaries can no longer be trusted.
    ///
    /// Drain the iterator before the next call; frames left undrained stay
    /// buffered and come out first next time.
    pub fn process(&mut self, chunk: &[u8]) -> Frames<'_> {
        self.buffer.extend_from_slice(chunk);
        Frames {
            queue: self,
            done: false,
        }
    }

    /// Number of carried-over bytes.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any carried-over bytes.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    fn next_item(&mut self) -> Option<Processed> {
        let header = decode_header(&self.buffer)?;

        if header.body_length > self.max_body_size {
            self.buffer.clear();
            return Some(Processed::ParseFailure(PeerwireError::Protocol(format!(
                "Body size {} exceeds maximum {}",
                header.body_length, self.max_body_size
            ))));
        }

        if self.buffer.len() < header.frame_len() {
            return None;
        }

        let body = &self.buffer[HEADER_SIZE..header.frame_len()];
        match self.codec.decode(body) {
            Ok(data) => {
                self.buffer.advance(header.frame_len());
                Some(Processed::Frame(Frame {
                    id: header.id,
                    receptive: header.receptive,
                    data,
                }))
            }
            Err(e) => {
                self.buffer.clear();
                Some(Processed::ParseFailure(e))
            }
        }
    }
}

/// Iterator returned by [`MessageQueue::process`].
pub struct Frames<'a> {
    queue: &'a mut MessageQueue,
    done: bool,
}

impl Iterator for Frames<'_> {
    type Item = Processed;

    fn next(&mut self) -> Option<Processed> {
        if self.done {
            return None;
        }
        let item = self.queue.next_item();
        if !matches!(item, Some(Processed::Frame(_))) {
            self.done = true;
        }
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::TaggedCodec;
    use crate::protocol::{build_frame, FrameId};

    fn queue() -> MessageQueue {
        MessageQueue::new(Arc::new(TaggedCodec))
    }

    fn frame_bytes(id: u16, receptive: bool, value: &Value) -> Vec<u8> {
        let body = TaggedCodec::encode(value).unwrap();
        build_frame(FrameId::from_parts(77, id), receptive, &body)
    }

    fn frames(items: Vec<Processed>) -> Vec<Frame<Value>> {
        items
            .into_iter()
            .map(|item| match item {
                Processed::Frame(frame) => frame,
                Processed::ParseFailure(e) => panic!("unexpected parse failure: {e}"),
            })
            .collect()
    }

    #[test]
    fn test_single_complete_frame() {
        let mut queue = queue();
        let bytes = frame_bytes(1, true, &Value::from("hello"));

        let got = frames(queue.process(&bytes).collect());

        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, FrameId::from_parts(77, 1));
        assert!(got[0].receptive);
        assert_eq!(got[0].data, Value::from("hello"));
        assert_eq!(queue.buffered(), 0);
    }

    #[test]
    fn test_coalesced_frames_in_one_chunk() {
        let mut queue = queue();
        let mut combined = frame_bytes(1, false, &Value::Int(1));
        combined.extend(frame_bytes(2, true, &Value::Int(2)));
        combined.extend(frame_bytes(3, false, &Value::Int(3)));

        let got = frames(queue.process(&combined).collect());

        let ids: Vec<u16> = got.iter().map(|f| f.id.increment()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(got[1].data, Value::Int(2));
    }

    #[test]
    fn test_fragmented_header_is_carried_over() {
        let mut queue = queue();
        let bytes = frame_bytes(1, false, &Value::from("test"));

        assert_eq!(queue.process(&bytes[..5]).count(), 0);
        assert_eq!(queue.buffered(), 5);

        let got = frames(queue.process(&bytes[5..]).collect());
        assert_eq!(got.len(), 1);
        assert_eq!(queue.buffered(), 0);
    }

    #[test]
    fn test_incomplete_body_resumes_from_frame_start() {
        let mut queue = queue();
        let bytes = frame_bytes(1, false, &Value::from("a longer body that gets split"));

        let partial = HEADER_SIZE + 6;
        assert_eq!(queue.process(&bytes[..partial]).count(), 0);
        // The header stays buffered with the partial body.
        assert_eq!(queue.buffered(), partial);

        let got = frames(queue.process(&bytes[partial..]).collect());
        assert_eq!(got[0].data, Value::from("a longer body that gets split"));
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut queue = queue();
        let bytes = frame_bytes(9, true, &Value::from("hi"));

        let mut got = Vec::new();
        for byte in &bytes {
            got.extend(frames(queue.process(&[*byte]).collect()));
        }

        assert_eq!(got.len(), 1);
        assert_eq!(got[0].data, Value::from("hi"));
    }

    #[test]
    fn test_every_split_point_matches_whole_stream() {
        let mut stream = Vec::new();
        stream.extend(frame_bytes(1, true, &Value::from("first")));
        stream.extend(frame_bytes(2, false, &Value::Null));
        stream.extend(frame_bytes(3, true, &Value::Array(vec![Value::Int(1), Value::Bool(true)])));

        let expected = frames(queue().process(&stream).collect());
        assert_eq!(expected.len(), 3);

        for first in 0..=stream.len() {
            for second in first..=stream.len() {
                let mut queue = queue();
                let mut got = frames(queue.process(&stream[..first]).collect());
                got.extend(frames(queue.process(&stream[first..second]).collect()));
                got.extend(frames(queue.process(&stream[second..]).collect()));
                assert_eq!(got, expected, "split at {first}/{second}");
            }
        }
    }

    #[test]
    fn test_parse_failure_stops_and_discards_rest() {
        let mut queue = queue();
        let mut bytes = frame_bytes(1, false, &Value::from("ok"));
        bytes.extend(build_frame(FrameId::from_parts(77, 2), false, &[255]));
        bytes.extend(frame_bytes(3, false, &Value::from("lost")));

        let items: Vec<Processed> = queue.process(&bytes).collect();

        assert_eq!(items.len(), 2);
        assert!(matches!(&items[0], Processed::Frame(f) if f.data == Value::from("ok")));
        assert!(matches!(&items[1], Processed::ParseFailure(e) if e.to_string().contains("255")));
        assert_eq!(queue.buffered(), 0);

        // The queue keeps working for later reads.
        let got = frames(queue.process(&frame_bytes(4, false, &Value::from("next"))).collect());
        assert_eq!(got[0].data, Value::from("next"));
    }

    #[test]
    fn test_oversized_body_is_a_parse_failure() {
        let mut queue = MessageQueue::with_max_body(Arc::new(TaggedCodec), 16);
        let header = crate::protocol::Header::new(FrameId::ZERO, false, 1000).encode();

        let items: Vec<Processed> = queue.process(&header).collect();

        assert!(matches!(&items[..], [Processed::ParseFailure(e)] if e.to_string().contains("exceeds maximum")));
        assert_eq!(queue.buffered(), 0);
    }

    #[test]
    fn test_undrained_frames_come_out_next_time() {
        let mut queue = queue();
        let mut combined = frame_bytes(1, false, &Value::Int(1));
        combined.extend(frame_bytes(2, false, &Value::Int(2)));

        let first = queue.process(&combined).next();
        assert!(matches!(first, Some(Processed::Frame(f)) if f.data == Value::Int(1)));

        let rest = frames(queue.process(&[]).collect());
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].data, Value::Int(2));
    }

    #[test]
    fn test_empty_body_is_a_parse_failure_for_tagged_codec() {
        let mut queue = queue();
        let bytes = build_frame(FrameId::ZERO, false, &[]);
        let items: Vec<Processed> = queue.process(&bytes).collect();
        assert!(matches!(&items[..], [Processed::ParseFailure(_)]));
    }
}
