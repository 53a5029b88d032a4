use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use std::io::{self, Cursor, Read, Write};
use tracing::instrument;

/// LZ4 frame magic number (0x184D2204, little endian).
pub const FRAME_MAGIC: [u8; 4] = [0x04, 0x22, 0x4D, 0x18];

const BUFFER: usize = 64 * 1024;

/// Whether `bytes` start with an LZ4 frame header.
pub fn is_framed(bytes: &[u8]) -> bool {
    bytes.starts_with(&FRAME_MAGIC)
}

/// Wrap `input` in a single LZ4 frame.
#[instrument(level = "debug", skip_all, fields(input_size = input.len(), output_size))]
pub fn compress(input: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = FrameEncoder::new(Vec::with_capacity(input.len() / 2));
    encoder.write_all(input).or_raise(|| ErrorKind::Io)?;
    let output = encoder.finish().or_raise(|| ErrorKind::Io)?;
    tracing::Span::current().record("output_size", output.len());
    Ok(output)
}

/// Decode a whole frame held in memory.
#[instrument(level = "debug", skip_all, fields(input_size = input.len(), output_size))]
pub fn decompress(input: &[u8]) -> Result<Vec<u8>> {
    let mut output = Vec::with_capacity(input.len() * 2);
    let size = decompress_stream(input, &mut output)?;
    tracing::Span::current().record("output_size", size);
    Ok(output)
}

/// Decode a frame from `reader` into `writer` without holding either in
/// memory, returning the number of decompressed bytes written.
///
/// Input that does not start with a frame header is rejected before
/// anything is written.
pub fn decompress_stream<R: Read, W: Write>(mut reader: R, mut writer: W) -> Result<u64> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header) {
        Ok(()) if header == FRAME_MAGIC => {},
        Ok(()) => exn::bail!(ErrorKind::NotFramed),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => exn::bail!(ErrorKind::NotFramed),
        Err(err) => return Err(err).or_raise(|| ErrorKind::Io),
    }
    let mut decoder = FrameDecoder::new(Cursor::new(header).chain(reader));
    let mut buffer = vec![0u8; BUFFER];
    let mut written = 0u64;
    loop {
        let read = match decoder.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err).or_raise(|| ErrorKind::Corrupt),
        };
        writer.write_all(&buffer[..read]).or_raise(|| ErrorKind::Io)?;
        written += read as u64;
    }
    Ok(written)
}
