// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-order delivery of stream data to the application
//!
//! The sequencer sits between the reassembly buffer and the stream: it
//! validates fin offsets, tracks the consumed-byte count that feeds flow
//! control, and decides when the stream must be notified that data or the
//! fin became readable.

use crate::stream::receive_buffer::ReceiveBuffer;
use tracing::trace;
use wren_quic_core::{transport, varint::MAX_VARINT_VALUE};

/// Notifications produced by a sequencer operation
///
/// The caller relays these to the stream; the sequencer itself never calls
/// back into it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Notify {
    pub on_data_available: bool,
    pub on_fin_read: bool,
}

impl Notify {
    const NONE: Self = Self {
        on_data_available: false,
        on_fin_read: false,
    };
}

#[derive(Debug)]
pub struct StreamSequencer {
    buffer: ReceiveBuffer,
    /// The final size of the stream, once a fin arrived
    close_offset: Option<u64>,
    /// Data below this offset is delivered even after a reliable reset
    reliable_offset: u64,
    /// One past the highest byte observed
    highest_offset: u64,
    /// Fin has been surfaced to the stream
    fin_delivered: bool,
    /// When set, every notification of new data fires; otherwise only the
    /// transition from empty to readable does
    level_triggered: bool,
    /// Reads were abandoned; buffered data is discarded while consumed-byte
    /// accounting keeps flow control moving
    ignore_read_data: bool,
}

impl StreamSequencer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: ReceiveBuffer::new(capacity),
            close_offset: None,
            reliable_offset: 0,
            highest_offset: 0,
            fin_delivered: false,
            level_triggered: false,
            ignore_read_data: false,
        }
    }

    pub fn set_level_triggered(&mut self, level_triggered: bool) {
        self.level_triggered = level_triggered;
    }

    /// Total bytes the application consumed; the input to flow-control
    /// credit
    #[inline]
    pub fn bytes_consumed(&self) -> u64 {
        self.buffer.total_bytes_read()
    }

    #[inline]
    pub fn readable_bytes(&self) -> u64 {
        if self.ignore_read_data {
            0
        } else {
            self.buffer.readable_bytes()
        }
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.fin_delivered
    }

    /// One past the highest byte observed on the stream
    #[inline]
    pub fn highest_offset(&self) -> u64 {
        self.highest_offset
    }

    /// Handles a STREAM frame for this stream
    pub fn on_stream_frame(
        &mut self,
        offset: u64,
        data: &[u8],
        fin: bool,
    ) -> Result<Notify, transport::Error> {
        let end = offset.checked_add(data.len() as u64).ok_or_else(|| {
            transport::Error::INVALID_STREAM_DATA.with_reason("stream offset overflow")
        })?;
        if end > MAX_VARINT_VALUE {
            return Err(transport::Error::INVALID_STREAM_DATA
                .with_reason("stream extends past the maximum offset"));
        }

        if data.is_empty() && !fin {
            // a pure position marker carries nothing to deliver
            return Ok(Notify::NONE);
        }

        if fin {
            self.close_at_offset(end)?;
        }

        if let Some(close_offset) = self.close_offset {
            if end > close_offset {
                return Err(transport::Error::STREAM_SEQUENCER_INVALID_STATE
                    .with_reason("data beyond the stream's final size"));
            }
        }

        self.highest_offset = self.highest_offset.max(end);

        let was_readable = self.buffer.readable_bytes() > 0;
        self.buffer.write_at(offset, data)?;

        if self.ignore_read_data {
            let flushed = self.buffer.flush_readable();
            trace!(flushed, "discarding data on a stopped stream");
            return Ok(self.check_fin_after_consume());
        }

        let now_readable = self.buffer.readable_bytes() > 0;
        let mut notify = Notify::NONE;
        let new_data = if self.level_triggered {
            now_readable
        } else {
            !was_readable && now_readable
        };
        if new_data {
            notify.on_data_available = true;
        }

        // a fin with everything already consumed is readable immediately
        if self.all_data_consumed_to_fin() && !self.fin_delivered {
            notify.on_data_available = true;
        }

        Ok(notify)
    }

    /// Registers the stream's final size
    pub fn close_at_offset(&mut self, offset: u64) -> Result<(), transport::Error> {
        match self.close_offset {
            Some(existing) if existing != offset => {
                return Err(transport::Error::STREAM_SEQUENCER_INVALID_STATE
                    .with_reason("conflicting final sizes"));
            }
            Some(_) => return Ok(()),
            None => {}
        }

        if offset < self.highest_offset {
            return Err(transport::Error::STREAM_SEQUENCER_INVALID_STATE
                .with_reason("final size below received data"));
        }

        self.close_offset = Some(offset);
        Ok(())
    }

    /// Raises the reliable-delivery watermark of a reliable reset
    pub fn set_reliable_offset(&mut self, offset: u64) -> Result<(), transport::Error> {
        if let Some(close_offset) = self.close_offset {
            if offset > close_offset {
                return Err(transport::Error::STREAM_SEQUENCER_INVALID_STATE
                    .with_reason("reliable offset beyond the final size"));
            }
        }
        self.reliable_offset = self.reliable_offset.max(offset);
        Ok(())
    }

    /// Copies readable bytes into `iovs`, consuming up to the first gap
    pub fn readv(&mut self, iovs: &mut [&mut [u8]]) -> (usize, Notify) {
        if self.ignore_read_data {
            return (0, Notify::NONE);
        }
        let copied = self.buffer.readv(iovs);
        (copied, self.check_fin_after_consume())
    }

    /// A zero-copy view of the readable span
    pub fn get_readable_regions(&self) -> Vec<&[u8]> {
        if self.ignore_read_data {
            return Vec::new();
        }
        self.buffer.get_readable_regions()
    }

    /// Consumes bytes previously exposed through `get_readable_regions`
    ///
    /// Consuming more than is readable is an application-level bug which
    /// poisons the stream.
    pub fn mark_consumed(&mut self, count: u64) -> Result<Notify, transport::Error> {
        if !self.buffer.mark_consumed(count) {
            return Err(transport::Error::ERROR_PROCESSING_STREAM
                .with_reason("consumed more bytes than were readable"));
        }
        Ok(self.check_fin_after_consume())
    }

    /// Stops delivering data; buffered and future bytes are discarded but
    /// still counted as consumed so flow control keeps moving
    pub fn stop_reading(&mut self) -> Notify {
        if self.ignore_read_data {
            return Notify::NONE;
        }
        self.ignore_read_data = true;
        let flushed = self.buffer.flush_readable();
        trace!(flushed, "stream switched to discard mode");
        self.check_fin_after_consume()
    }

    fn all_data_consumed_to_fin(&self) -> bool {
        self.close_offset
            .map_or(false, |close| self.buffer.total_bytes_read() == close)
    }

    fn check_fin_after_consume(&mut self) -> Notify {
        let mut notify = Notify::NONE;
        if self.all_data_consumed_to_fin() && !self.fin_delivered {
            self.fin_delivered = true;
            if self.ignore_read_data {
                notify.on_fin_read = true;
            } else {
                notify.on_data_available = true;
            }
        }
        notify
    }
}
