#![forbid(unsafe_code)]

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Default maximum part payload size.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 2 * 1024 * 1024; // 2 MiB

/// Default maximum number of parts in one message.
pub const DEFAULT_MAX_PARTS: usize = 16;

/// Part header: one flag byte followed by a big-endian `u32` payload length.
pub const PART_HEADER_LEN: usize = 5;

/// Flag bit: another part of the same message follows.
pub const FLAG_MORE: u8 = 0x01;

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("insufficient data: need={need} have={have}")]
	InsufficientData {
		need: usize,
		have: usize,
	},

	#[error("invalid part flags: {0:#04x}")]
	InvalidFlags(u8),

	#[error("message exceeds maximum part count: max={max}")]
	TooManyParts {
		max: usize,
	},
}

/// One part of a multipart message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
	pub payload: Bytes,
	/// More parts of the same message follow this one.
	pub more: bool,
}

impl Part {
	pub fn new(payload: impl Into<Bytes>, more: bool) -> Self {
		Self {
			payload: payload.into(),
			more,
		}
	}
}

/// Encode a single part into a standalone buffer.
pub fn encode_part(payload: &[u8], more: bool, max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
	let mut buf = BytesMut::with_capacity(frame_len_from_payload_len(payload.len()));
	encode_part_into(&mut buf, payload, more, max_frame_size)?;
	Ok(buf.to_vec())
}

/// Append an encoded part into the provided buffer.
pub fn encode_part_into(buf: &mut BytesMut, payload: &[u8], more: bool, max_frame_size: usize) -> Result<(), FramingError> {
	if payload.len() > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: payload.len(),
			max: max_frame_size,
		});
	}

	buf.reserve(PART_HEADER_LEN + payload.len());
	buf.put_u8(if more { FLAG_MORE } else { 0 });
	buf.put_u32(payload.len() as u32);
	buf.put_slice(payload);
	Ok(())
}

/// Compute total part length (header + payload).
#[inline]
pub fn frame_len_from_payload_len(payload_len: usize) -> usize {
	PART_HEADER_LEN + payload_len
}

fn read_header(src: &[u8], max_frame_size: usize) -> Result<(bool, usize), FramingError> {
	let flags = src[0];
	if flags & !FLAG_MORE != 0 {
		return Err(FramingError::InvalidFlags(flags));
	}

	let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
	if len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len,
			max: max_frame_size,
		});
	}

	Ok((flags & FLAG_MORE != 0, len))
}

/// Decode a single part from the start of `src`; returns the part and the bytes consumed.
pub fn decode_part(src: &[u8], max_frame_size: usize) -> Result<(Part, usize), FramingError> {
	if src.len() < PART_HEADER_LEN {
		return Err(FramingError::InsufficientData {
			need: PART_HEADER_LEN,
			have: src.len(),
		});
	}

	let (more, len) = read_header(src, max_frame_size)?;
	let need = PART_HEADER_LEN + len;
	if src.len() < need {
		return Err(FramingError::InsufficientData { need, have: src.len() });
	}

	let payload = Bytes::copy_from_slice(&src[PART_HEADER_LEN..need]);
	Ok((Part { payload, more }, need))
}

/// Try to decode a single part from a growable buffer.
pub fn try_decode_part_from_buffer(buf: &mut BytesMut, max_frame_size: usize) -> Result<Option<Part>, FramingError> {
	if buf.len() < PART_HEADER_LEN {
		return Ok(None);
	}

	let (more, len) = read_header(buf, max_frame_size)?;
	if buf.len() < PART_HEADER_LEN + len {
		return Ok(None);
	}

	buf.advance(PART_HEADER_LEN);
	let payload = buf.split_to(len).freeze();
	Ok(Some(Part { payload, more }))
}
