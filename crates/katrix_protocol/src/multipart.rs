#![forbid(unsafe_code)]

use bytes::{Bytes, BytesMut};

use crate::framing::{DEFAULT_MAX_PARTS, FramingError, Part, encode_part_into, try_decode_part_from_buffer};

/// Encode a whole message: every frame but the last carries the MORE flag.
pub fn encode_multipart<B: AsRef<[u8]>>(frames: &[B], max_frame_size: usize) -> Result<BytesMut, FramingError> {
	let total: usize = frames.iter().map(|f| crate::framing::frame_len_from_payload_len(f.as_ref().len())).sum();
	let mut buf = BytesMut::with_capacity(total);

	let last = frames.len().saturating_sub(1);
	for (i, frame) in frames.iter().enumerate() {
		encode_part_into(&mut buf, frame.as_ref(), i != last, max_frame_size)?;
	}
	Ok(buf)
}

/// Reassembles parts read off a stream into complete messages.
///
/// A message longer than `max_parts` parts is a framing error.
#[derive(Debug)]
pub struct MultipartAssembler {
	buf: BytesMut,
	frames: Vec<Bytes>,
	max_frame_size: usize,
	max_parts: usize,
}

impl MultipartAssembler {
	pub fn new(max_frame_size: usize) -> Self {
		Self {
			buf: BytesMut::with_capacity(16 * 1024),
			frames: Vec::new(),
			max_frame_size,
			max_parts: DEFAULT_MAX_PARTS,
		}
	}

	pub fn with_max_parts(mut self, max_parts: usize) -> Self {
		self.max_parts = max_parts.max(1);
		self
	}

	/// Feed raw bytes read from the socket.
	pub fn extend(&mut self, data: &[u8]) {
		self.buf.extend_from_slice(data);
	}

	/// Pop the next complete message, if one is buffered.
	pub fn next_message(&mut self) -> Result<Option<Vec<Bytes>>, FramingError> {
		while let Some(Part { payload, more }) = try_decode_part_from_buffer(&mut self.buf, self.max_frame_size)? {
			if self.frames.len() >= self.max_parts {
				return Err(FramingError::TooManyParts { max: self.max_parts });
			}
			self.frames.push(payload);
			if !more {
				return Ok(Some(std::mem::take(&mut self.frames)));
			}
		}
		Ok(None)
	}

	/// Number of parts of an incomplete message held so far.
	pub fn pending_parts(&self) -> usize {
		self.frames.len()
	}
}
