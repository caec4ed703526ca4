#![forbid(unsafe_code)]

pub mod framing;
pub mod ipc;
pub mod multipart;

pub use framing::{
	DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_PARTS, FLAG_MORE, FramingError, PART_HEADER_LEN, Part, decode_part, encode_part, encode_part_into,
	frame_len_from_payload_len, try_decode_part_from_buffer,
};
pub use ipc::{CodecError, IpcMessage, MessageKind, URL_DELIMITER, pb, split_urls};
pub use multipart::{MultipartAssembler, encode_multipart};

