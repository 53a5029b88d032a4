//! The LZ4 frame format files travel in between clients and the asset
//! server.
//!
//! The local cache only ever holds decompressed files; frames exist on the
//! wire and, briefly, in the temporary file a download is streamed into.

pub mod error;
mod frame;

pub use crate::frame::{FRAME_MAGIC, compress, decompress, decompress_stream, is_framed};
