// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Buffered outbound stream data with retransmission bookkeeping
//!
//! Application writes land as reference-counted slices; the framer consumes
//! them in order and acknowledgment/loss signals flow back as byte ranges.
//! Leading slices are released as soon as every byte in them is
//! acknowledged.

use bytes::Bytes;
use std::collections::VecDeque;
use wren_quic_core::interval_set::IntervalSet;

#[derive(Debug, Default)]
pub struct SendBuffer {
    /// Buffered slices, each tagged with its starting stream offset
    slices: VecDeque<(u64, Bytes)>,
    /// The next offset to assign to newly buffered data
    stream_offset: u64,
    /// Bytes handed to the framer at least once
    stream_bytes_written: u64,
    /// Ranges acknowledged by the peer
    bytes_acked: IntervalSet<u64>,
    /// Ranges declared lost and not yet rewritten
    pending_retransmissions: IntervalSet<u64>,
    /// Bytes written and neither acked nor declared lost
    bytes_outstanding: u64,
}

impl SendBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn stream_offset(&self) -> u64 {
        self.stream_offset
    }

    #[inline]
    pub fn stream_bytes_written(&self) -> u64 {
        self.stream_bytes_written
    }

    #[inline]
    pub fn bytes_outstanding(&self) -> u64 {
        self.bytes_outstanding
    }

    /// Bytes buffered but not yet handed to the framer
    #[inline]
    pub fn bytes_pending_write(&self) -> u64 {
        self.stream_offset - self.stream_bytes_written
    }

    #[inline]
    pub fn total_bytes_buffered(&self) -> usize {
        self.slices.iter().map(|(_, slice)| slice.len()).sum()
    }

    /// Appends application data, assigning it the next stream offsets
    pub fn save_stream_data(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let offset = self.stream_offset;
        self.stream_offset += data.len() as u64;
        self.slices.push_back((offset, data));
    }

    /// The region of never-sent data starting at `stream_bytes_written`,
    /// bounded by `max_len`
    pub fn next_write(&self, max_len: usize) -> Option<(u64, Bytes)> {
        if self.bytes_pending_write() == 0 {
            return None;
        }
        let data = self.copy_out(self.stream_bytes_written, max_len)?;
        Some((self.stream_bytes_written, data))
    }

    /// Marks `len` bytes starting at the write cursor as written
    pub fn on_stream_data_written(&mut self, len: u64) {
        debug_assert!(len <= self.bytes_pending_write());
        self.stream_bytes_written += len;
        self.bytes_outstanding += len;
    }

    /// Marks an acked range; returns the number of newly acked bytes
    pub fn on_frame_acked(&mut self, offset: u64, len: u64) -> u64 {
        if len == 0 {
            return 0;
        }
        let end = offset + len - 1;

        let mut newly_acked = len;
        for interval in self.bytes_acked.intervals() {
            let overlap_start = interval.start.max(offset);
            let overlap_end = interval.end.min(end);
            if overlap_start <= overlap_end {
                newly_acked -= overlap_end - overlap_start + 1;
            }
        }

        self.bytes_acked.insert(offset..=end);
        self.pending_retransmissions.remove(offset..=end);
        self.bytes_outstanding = self.bytes_outstanding.saturating_sub(newly_acked);

        self.release_acked_slices();
        newly_acked
    }

    /// Marks a lost range for retransmission unless it was already acked
    pub fn on_frame_lost(&mut self, offset: u64, len: u64) {
        if len == 0 {
            return;
        }
        let end = offset + len - 1;

        let mut lost = IntervalSet::new();
        lost.insert(offset..=end);
        for interval in self.bytes_acked.intervals() {
            lost.remove(interval.start..=interval.end);
        }

        for interval in lost.intervals() {
            self.pending_retransmissions.insert(interval.start..=interval.end);
        }
    }

    /// The lowest pending retransmission, bounded by `max_len`
    pub fn next_retransmission(&self, max_len: usize) -> Option<(u64, Bytes)> {
        let interval = self.pending_retransmissions.intervals().next()?;
        let len = ((interval.end - interval.start + 1) as usize).min(max_len);
        let data = self.copy_out(interval.start, len)?;
        Some((interval.start, data))
    }

    /// Removes a range from the retransmission queue once rewritten
    pub fn on_retransmitted(&mut self, offset: u64, len: u64) {
        if len == 0 {
            return;
        }
        self.pending_retransmissions.remove(offset..=offset + len - 1);
    }

    #[inline]
    pub fn has_pending_retransmission(&self) -> bool {
        !self.pending_retransmissions.is_empty()
    }

    /// Returns true once every written byte has been acknowledged
    pub fn is_fully_acked(&self) -> bool {
        self.bytes_outstanding == 0 && !self.has_pending_retransmission()
    }

    /// Copies out up to `max_len` buffered bytes starting at `offset`
    fn copy_out(&self, offset: u64, max_len: usize) -> Option<Bytes> {
        let mut cursor = offset;
        let mut remaining = max_len.min((self.stream_offset - offset) as usize);
        if remaining == 0 {
            return None;
        }

        let mut out = Vec::with_capacity(remaining);
        for (slice_offset, slice) in &self.slices {
            if remaining == 0 {
                break;
            }
            let slice_end = slice_offset + slice.len() as u64;
            if slice_end <= cursor {
                continue;
            }
            if *slice_offset > cursor {
                // the requested range was already released
                return None;
            }
            let within = (cursor - slice_offset) as usize;
            let take = (slice.len() - within).min(remaining);
            out.extend_from_slice(&slice[within..within + take]);
            cursor += take as u64;
            remaining -= take;
        }

        if out.is_empty() {
            None
        } else {
            Some(Bytes::from(out))
        }
    }

    /// Frees leading slices in which every byte has been acknowledged
    fn release_acked_slices(&mut self) {
        while let Some((offset, slice)) = self.slices.front() {
            let end = offset + slice.len() as u64 - 1;
            let fully_acked = self
                .bytes_acked
                .intervals()
                .next()
                .map_or(false, |interval| {
                    interval.start <= *offset && interval.end >= end
                });
            if fully_acked {
                self.slices.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_with(data: &[&[u8]]) -> SendBuffer {
        let mut buffer = SendBuffer::new();
        for slice in data {
            buffer.save_stream_data(Bytes::copy_from_slice(slice));
        }
        buffer
    }

    #[test]
    fn writes_consume_in_offset_order() {
        let mut buffer = buffer_with(&[b"hello ", b"world"]);
        assert_eq!(buffer.stream_offset(), 11);

        let (offset, data) = buffer.next_write(8).unwrap();
        assert_eq!(offset, 0);
        assert_eq!(&data[..], b"hello wo");
        buffer.on_stream_data_written(8);

        let (offset, data) = buffer.next_write(100).unwrap();
        assert_eq!(offset, 8);
        assert_eq!(&data[..], b"rld");
        buffer.on_stream_data_written(3);

        assert!(buffer.next_write(100).is_none());
        assert_eq!(buffer.bytes_outstanding(), 11);
    }

    #[test]
    fn acks_release_leading_slices() {
        let mut buffer = buffer_with(&[b"aaaa", b"bbbb"]);
        buffer.on_stream_data_written(8);

        assert_eq!(buffer.on_frame_acked(0, 4), 4);
        assert_eq!(buffer.total_bytes_buffered(), 4);
        assert_eq!(buffer.bytes_outstanding(), 4);

        // duplicate acks count zero
        assert_eq!(buffer.on_frame_acked(0, 4), 0);

        assert_eq!(buffer.on_frame_acked(4, 4), 4);
        assert_eq!(buffer.total_bytes_buffered(), 0);
        assert!(buffer.is_fully_acked());
    }

    #[test]
    fn losses_queue_retransmissions_excluding_acked_ranges() {
        let mut buffer = buffer_with(&[b"abcdefgh"]);
        buffer.on_stream_data_written(8);

        buffer.on_frame_acked(2, 2); // "cd"
        buffer.on_frame_lost(0, 8);

        let (offset, data) = buffer.next_retransmission(100).unwrap();
        assert_eq!(offset, 0);
        assert_eq!(&data[..], b"ab");
        buffer.on_retransmitted(0, 2);

        let (offset, data) = buffer.next_retransmission(100).unwrap();
        assert_eq!(offset, 4);
        assert_eq!(&data[..], b"efgh");
        buffer.on_retransmitted(4, 4);

        assert!(!buffer.has_pending_retransmission());
    }

    #[test]
    fn ack_of_a_lost_range_cancels_the_retransmission() {
        let mut buffer = buffer_with(&[b"abcdefgh"]);
        buffer.on_stream_data_written(8);

        buffer.on_frame_lost(0, 8);
        buffer.on_frame_acked(0, 8);
        assert!(!buffer.has_pending_retransmission());
        assert!(buffer.is_fully_acked());
    }

    #[test]
    fn retransmission_respects_the_length_bound() {
        let mut buffer = buffer_with(&[b"abcdefgh"]);
        buffer.on_stream_data_written(8);
        buffer.on_frame_lost(0, 8);

        let (offset, data) = buffer.next_retransmission(3).unwrap();
        assert_eq!(offset, 0);
        assert_eq!(&data[..], b"abc");
    }
}
