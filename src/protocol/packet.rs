//! Framed packet views
//!
//! Packet format: `[MAGIC u32] [PROTOCOL u8] [COMMAND u16] [PAYLOAD_LEN u16]
//! [FOOTPRINT_COUNT u8] [PAYLOAD] [FOOTPRINTS]`
//!
//! Two views borrow the same kind of byte range:
//!
//! - [`ReadablePacket`] is a validated read-only view with sequential
//!   [`extract`](ReadablePacket::extract) of fixed-width values.
//! - [`WritablePacket`] is a mutable view over a range whose tail is spare
//!   capacity; it writes headers in place and edits the footprint stack.
//!
//! [`FrameScanner`] walks a byte range frame by frame. A header that does not
//! validate makes it advance a single byte and retry, so a damaged stream
//! resynchronises on the next intact frame instead of tearing the
//! connection down.

use thiserror::Error;

use super::{ProtocolType, MAGIC_KEY};

/// Size of the packed frame header.
pub const HEADER_SIZE: usize = 10;

const OFFSET_MAGIC: usize = 0;
const OFFSET_PROTOCOL: usize = 4;
const OFFSET_COMMAND: usize = 5;
const OFFSET_PAYLOAD_LEN: usize = 7;
const OFFSET_FOOTPRINT_COUNT: usize = 9;

/// Frame-level parse and write failures.
///
/// `BadMagic` and `Truncated` are the recoverable stream errors: the scanner
/// responds to both with a one-byte slip. `Overflow` means a destination
/// range is too small, which drops the frame being written.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("incomplete frame header")]
    Incomplete,
    #[error("magic key mismatch")]
    BadMagic,
    #[error("frame length runs past the buffer")]
    Truncated,
    #[error("frame does not fit the destination range")]
    Overflow,
}

/// Fixed-width little-endian values the codec can carry.
pub trait WireValue: Sized {
    const SIZE: usize;
    fn read_le(buf: &[u8]) -> Self;
    fn write_le(&self, buf: &mut [u8]);
}

impl WireValue for u8 {
    const SIZE: usize = 1;
    fn read_le(buf: &[u8]) -> Self {
        buf[0]
    }
    fn write_le(&self, buf: &mut [u8]) {
        buf[0] = *self;
    }
}

impl WireValue for u16 {
    const SIZE: usize = 2;
    fn read_le(buf: &[u8]) -> Self {
        u16::from_le_bytes([buf[0], buf[1]])
    }
    fn write_le(&self, buf: &mut [u8]) {
        buf[..2].copy_from_slice(&self.to_le_bytes());
    }
}

impl WireValue for u32 {
    const SIZE: usize = 4;
    fn read_le(buf: &[u8]) -> Self {
        u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])
    }
    fn write_le(&self, buf: &mut [u8]) {
        buf[..4].copy_from_slice(&self.to_le_bytes());
    }
}

/// Validated read-only view over one frame.
#[derive(Clone, Copy, Debug)]
pub struct ReadablePacket<'a> {
    data: &'a [u8],
    cursor: usize,
}

impl<'a> ReadablePacket<'a> {
    /// Validate and borrow the frame at the start of `buf`.
    pub fn parse(buf: &'a [u8]) -> Result<Self, FrameError> {
        if buf.len() < HEADER_SIZE {
            return Err(FrameError::Incomplete);
        }
        let magic = u32::read_le(&buf[OFFSET_MAGIC..]);
        if magic != MAGIC_KEY {
            return Err(FrameError::BadMagic);
        }
        let payload_len = u16::read_le(&buf[OFFSET_PAYLOAD_LEN..]) as usize;
        let footprint_count = buf[OFFSET_FOOTPRINT_COUNT] as usize;
        let total = HEADER_SIZE + payload_len + footprint_count;
        if total > buf.len() {
            return Err(FrameError::Truncated);
        }
        Ok(ReadablePacket {
            data: &buf[..total],
            cursor: HEADER_SIZE,
        })
    }

    pub fn protocol(&self) -> Option<ProtocolType> {
        ProtocolType::from_raw(self.data[OFFSET_PROTOCOL])
    }

    pub fn command(&self) -> u16 {
        u16::read_le(&self.data[OFFSET_COMMAND..])
    }

    pub fn payload_len(&self) -> usize {
        u16::read_le(&self.data[OFFSET_PAYLOAD_LEN..]) as usize
    }

    pub fn footprint_count(&self) -> usize {
        self.data[OFFSET_FOOTPRINT_COUNT] as usize
    }

    /// Whole frame size: header, payload and footprint stack.
    pub fn total_size(&self) -> usize {
        self.data.len()
    }

    /// The whole frame, header included.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }

    /// Payload bytes, footprints excluded.
    pub fn payload(&self) -> &'a [u8] {
        &self.data[HEADER_SIZE..HEADER_SIZE + self.payload_len()]
    }

    /// Footprint stack, front first.
    pub fn footprints(&self) -> &'a [u8] {
        &self.data[HEADER_SIZE + self.payload_len()..]
    }

    pub fn footprint(&self, index: usize) -> Option<u8> {
        self.footprints().get(index).copied()
    }

    /// Sequentially extract the next fixed-width value from the payload.
    pub fn extract<T: WireValue>(&mut self) -> Option<T> {
        let payload_end = HEADER_SIZE + self.payload_len();
        if self.cursor + T::SIZE > payload_end {
            return None;
        }
        let value = T::read_le(&self.data[self.cursor..]);
        self.cursor += T::SIZE;
        Some(value)
    }
}

/// Mutable view over a byte range holding one frame plus spare capacity.
pub struct WritablePacket<'a> {
    data: &'a mut [u8],
}

impl<'a> WritablePacket<'a> {
    /// Write a fresh empty header for `protocol`/`command` at the start of
    /// `data`.
    pub fn prepare(
        data: &'a mut [u8],
        protocol: ProtocolType,
        command: u16,
    ) -> Result<Self, FrameError> {
        if data.len() < HEADER_SIZE {
            return Err(FrameError::Overflow);
        }
        MAGIC_KEY.write_le(&mut data[OFFSET_MAGIC..]);
        data[OFFSET_PROTOCOL] = protocol as u8;
        command.write_le(&mut data[OFFSET_COMMAND..]);
        0u16.write_le(&mut data[OFFSET_PAYLOAD_LEN..]);
        data[OFFSET_FOOTPRINT_COUNT] = 0;
        Ok(WritablePacket { data })
    }

    /// Take over a range that already starts with a valid frame, keeping the
    /// rest of the range as spare capacity for footprint stamping.
    pub fn from_frame(data: &'a mut [u8]) -> Result<Self, FrameError> {
        ReadablePacket::parse(data)?;
        Ok(WritablePacket { data })
    }

    /// Copy `src` (header, payload and footprints) into `dst` without
    /// re-validating it.
    pub fn copy_from(dst: &'a mut [u8], src: &ReadablePacket<'_>) -> Result<Self, FrameError> {
        let total = src.total_size();
        if dst.len() < total {
            return Err(FrameError::Overflow);
        }
        dst[..total].copy_from_slice(src.as_bytes());
        Ok(WritablePacket { data: dst })
    }

    pub fn payload_len(&self) -> usize {
        u16::read_le(&self.data[OFFSET_PAYLOAD_LEN..]) as usize
    }

    pub fn footprint_count(&self) -> usize {
        self.data[OFFSET_FOOTPRINT_COUNT] as usize
    }

    pub fn total_size(&self) -> usize {
        HEADER_SIZE + self.payload_len() + self.footprint_count()
    }

    /// The written frame, header included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.total_size()]
    }

    /// Append a fixed-width value to the payload. Footprints already stamped
    /// move back to stay behind the payload.
    pub fn push<T: WireValue>(&mut self, value: T) -> Result<(), FrameError> {
        let payload_len = self.payload_len();
        let footprint_count = self.footprint_count();
        let payload_end = HEADER_SIZE + payload_len;
        let frame_end = payload_end + footprint_count;
        if frame_end + T::SIZE > self.data.len() || payload_len + T::SIZE > u16::MAX as usize {
            return Err(FrameError::Overflow);
        }
        if footprint_count > 0 {
            self.data.copy_within(payload_end..frame_end, payload_end + T::SIZE);
        }
        value.write_le(&mut self.data[payload_end..]);
        ((payload_len + T::SIZE) as u16).write_le(&mut self.data[OFFSET_PAYLOAD_LEN..]);
        Ok(())
    }

    /// Push `id` at the front of the footprint stack, shifting existing
    /// entries down.
    pub fn push_footprint(&mut self, id: u8) -> Result<(), FrameError> {
        let footprint_count = self.footprint_count();
        let footprint_begin = HEADER_SIZE + self.payload_len();
        let frame_end = footprint_begin + footprint_count;
        if frame_end + 1 > self.data.len() || footprint_count == u8::MAX as usize {
            return Err(FrameError::Overflow);
        }
        if footprint_count > 0 {
            self.data.copy_within(footprint_begin..frame_end, footprint_begin + 1);
        }
        self.data[footprint_begin] = id;
        self.data[OFFSET_FOOTPRINT_COUNT] = (footprint_count + 1) as u8;
        Ok(())
    }

    /// Remove and return the front footprint, shifting the rest down.
    pub fn pop_front_footprint(&mut self) -> Option<u8> {
        let footprint_count = self.footprint_count();
        if footprint_count == 0 {
            return None;
        }
        let footprint_begin = HEADER_SIZE + self.payload_len();
        let frame_end = footprint_begin + footprint_count;
        let id = self.data[footprint_begin];
        self.data.copy_within(footprint_begin + 1..frame_end, footprint_begin);
        self.data[OFFSET_FOOTPRINT_COUNT] = (footprint_count - 1) as u8;
        Some(id)
    }
}

/// Frame iterator with one-byte resynchronisation on damaged input.
pub struct FrameScanner<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameScanner<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        FrameScanner { buf, pos: 0 }
    }

    /// Bytes consumed so far, including slipped junk.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Next intact frame, or `None` once fewer bytes than a header remain.
    pub fn next_frame(&mut self) -> Option<ReadablePacket<'a>> {
        while self.pos + HEADER_SIZE <= self.buf.len() {
            match ReadablePacket::parse(&self.buf[self.pos..]) {
                Ok(packet) => {
                    self.pos += packet.total_size();
                    return Some(packet);
                }
                Err(FrameError::Incomplete) => return None,
                // Resynchronise: slip a single byte and retry.
                Err(_) => self.pos += 1,
            }
        }
        None
    }
}
