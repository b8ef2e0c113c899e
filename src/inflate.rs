//! Streaming zlib decompression for embedded XML fragments.
//!
//! MDF4 `##DZ` blocks decompress in one shot with
//! `miniz_oxide::inflate::decompress_to_vec_zlib`, because a `##DZ` block
//! declares its compressed and original lengths up front. Fragments inside
//! a `.plf` container carry no such header: a fragment's end is discovered
//! by decompressing and watching how much output comes out, so this module
//! drives `miniz_oxide`'s lower-level streaming inflator directly instead.

use miniz_oxide::inflate::TINFLStatus;
use miniz_oxide::inflate::stream::{InflateState, inflate};
use miniz_oxide::{DataFormat, MZFlush};

/// Size of one decompression segment. The source tool appears to buffer
/// decompressed fragment output in fixed 4096-byte windows: a segment that
/// fills the window exactly signals "there is more data in a following
/// segment".
pub const SEGMENT_SIZE: usize = 4096;

/// Result of decompressing one bounded window of compressed input.
pub struct Segment {
    pub data: Vec<u8>,
    /// True if the zlib stream reached its natural end inside this window.
    pub stream_ended: bool,
}

/// Decompress `data` into at most `SEGMENT_SIZE` bytes of output.
///
/// Returns `None` if the window does not begin with a valid zlib stream
/// (a malformed or coincidental `0x78 0x5E` byte pair).
pub fn decompress_segment(data: &[u8]) -> Option<Segment> {
    inflate_window(data, SEGMENT_SIZE)
}

/// Decompress `data` into at most `max_out` bytes of output, reporting
/// whether the stream produced anything and whether it completed. Used
/// both for the small probe window (pass 1's "does this look like XML?"
/// check) and for 4096-byte segment windows.
pub fn inflate_window(data: &[u8], max_out: usize) -> Option<Segment> {
    let mut state = InflateState::new_boxed(DataFormat::Zlib);
    let mut output = vec![0u8; max_out];
    let result = inflate(&mut state, data, &mut output, MZFlush::Finish);

    match result.status {
        Ok(_) | Err(TINFLStatus::NeedsMoreInput) | Err(TINFLStatus::HasMoreOutput) => {
            if result.bytes_written == 0 {
                return None;
            }
            output.truncate(result.bytes_written);
            let stream_ended = matches!(result.status, Ok(miniz_oxide::MZStatus::StreamEnd));
            Some(Segment { data: output, stream_ended })
        }
        Err(_) => None,
    }
}

/// Decompress `data` with no fixed output bound, growing the output buffer
/// until the stream ends, input is exhausted without progress, or a sane
/// maximum (64 MiB) is reached. Used for the pass-1 retry path, which
/// decompresses from a marker to the end of the buffer when the bounded
/// segment-by-segment read fails to parse as XML.
pub fn inflate_unbounded(data: &[u8]) -> Option<Vec<u8>> {
    const MAX_OUTPUT: usize = 64 * 1024 * 1024;

    let mut state = InflateState::new_boxed(DataFormat::Zlib);
    let mut output = vec![0u8; 64 * 1024];
    let mut total_written = 0usize;
    let mut consumed = 0usize;

    loop {
        let result = inflate(&mut state, &data[consumed..], &mut output[total_written..], MZFlush::None);
        consumed += result.bytes_consumed;
        total_written += result.bytes_written;

        match result.status {
            Ok(miniz_oxide::MZStatus::StreamEnd) => {
                output.truncate(total_written);
                return if total_written == 0 { None } else { Some(output) };
            }
            Ok(_) | Err(TINFLStatus::NeedsMoreInput) | Err(TINFLStatus::HasMoreOutput) => {
                if result.bytes_consumed == 0 && result.bytes_written == 0 {
                    // No progress possible: either input is exhausted or the
                    // output buffer needs to grow before more can be written.
                    if consumed >= data.len() {
                        output.truncate(total_written);
                        return if total_written == 0 { None } else { Some(output) };
                    }
                    if output.len() >= MAX_OUTPUT {
                        output.truncate(total_written);
                        return Some(output);
                    }
                    let grow_to = (output.len() * 2).min(MAX_OUTPUT);
                    output.resize(grow_to, 0);
                }
            }
            Err(_) => {
                output.truncate(total_written);
                return if total_written == 0 { None } else { Some(output) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use miniz_oxide::deflate::compress_to_vec_zlib;

    #[test]
    fn decompresses_small_payload() {
        let original = b"hello, plf world";
        let compressed = compress_to_vec_zlib(original, 6);
        let seg = decompress_segment(&compressed).expect("valid zlib stream");
        assert_eq!(seg.data, original);
        assert!(seg.stream_ended);
    }

    #[test]
    fn rejects_non_zlib_data() {
        let garbage = [0u8; 32];
        assert!(decompress_segment(&garbage).is_none());
    }

    #[test]
    fn unbounded_matches_bounded_for_small_input() {
        let original = b"a payload longer than a handful of bytes for good measure";
        let compressed = compress_to_vec_zlib(original, 6);
        let out = inflate_unbounded(&compressed).expect("decompress");
        assert_eq!(out, original);
    }

    #[test]
    fn unbounded_handles_large_payload_spanning_growth() {
        let original = vec![b'x'; 200_000];
        let compressed = compress_to_vec_zlib(&original, 6);
        let out = inflate_unbounded(&compressed).expect("decompress");
        assert_eq!(out, original);
    }
}
