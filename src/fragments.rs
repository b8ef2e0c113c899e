//! Pass 1: Compressed-Fragment Extractor.
//!
//! Locates zlib-compressed XML fragments embedded directly in the raw
//! container bytes and decompresses them, including the multi-segment case
//! where the source tool's own buffer caps a single decompression at 4096
//! bytes and the fragment continues from the next `0x78 0x5E` marker.

use tracing::{debug, warn};

use crate::bytes::read_u16_le;
use crate::inflate::{self, SEGMENT_SIZE};

/// The zlib default-compression two-byte header this pass hunts for.
const ZLIB_MARKER: [u8; 2] = [0x78, 0x5E];

/// UTF-8 byte order mark that precedes every interesting fragment's XML.
const BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];

/// Root-element local names this pass cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentTag {
    Member,
    Root,
    IdentXmlPart,
}

impl FragmentTag {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "Member" => Some(FragmentTag::Member),
            "Root" => Some(FragmentTag::Root),
            "IdentXmlPart" => Some(FragmentTag::IdentXmlPart),
            _ => None,
        }
    }
}

/// A zlib fragment that decompressed to well-formed, interesting XML.
#[derive(Debug, Clone)]
pub struct DecompressedFragment {
    /// Decompressed XML text, BOM and embedded NULs already stripped.
    pub xml: String,
    /// Tag of the fragment's document element.
    pub tag: FragmentTag,
    /// Offset of the first `0x78 0x5E` marker for this fragment.
    pub byte_offset: usize,
    /// Total compressed bytes consumed across all segments.
    pub byte_size: usize,
}

/// Scan `buf` for every zlib-compressed XML fragment and return the ones
/// that decompress to well-formed `Member`/`Root`/`IdentXmlPart` XML.
pub fn extract_fragments(buf: &[u8]) -> Vec<DecompressedFragment> {
    let mut fragments = Vec::new();
    let mut i = 0usize;

    while i + 1 < buf.len() {
        if buf[i] != ZLIB_MARKER[0] || buf[i + 1] != ZLIB_MARKER[1] {
            i += 1;
            continue;
        }
        let p = i;
        i += 1; // resume scanning right after this marker regardless of outcome

        let probe_end = (p + 250).min(buf.len());
        let Some(probe) = inflate::inflate_window(&buf[p..probe_end], 64) else {
            continue;
        };
        let Some(tag_name) = sniff_tag_name(&probe.data) else {
            continue;
        };
        let Some(tag) = FragmentTag::from_name(tag_name) else {
            continue;
        };

        match assemble_fragment(buf, p, tag) {
            Some(fragment) => {
                debug!(offset = p, tag = ?tag, "decompressed fragment");
                fragments.push(fragment);
            }
            None => {
                warn!(offset = p, "fragment failed to decompress or parse, skipping");
            }
        }
    }

    fragments
}

/// Peek at a probe's decompressed bytes for a BOM followed by `<TagName`.
fn sniff_tag_name(probe: &[u8]) -> Option<&str> {
    let rest = probe.strip_prefix(&BOM).unwrap_or(probe);
    let rest = rest.strip_prefix(b"<")?;
    let end = rest
        .iter()
        .position(|&b| !(b.is_ascii_alphanumeric() || b == b'_' || b == b':'))
        .unwrap_or(rest.len());
    if end == 0 {
        return None;
    }
    std::str::from_utf8(&rest[..end]).ok()
}

/// Read the block-size prefix, decompress the fragment (potentially across
/// multiple 4096-byte segments), and parse the concatenated result as XML.
fn assemble_fragment(buf: &[u8], first_marker: usize, tag: FragmentTag) -> Option<DecompressedFragment> {
    let mut assembled = Vec::new();
    let mut marker = first_marker;
    let mut total_consumed = 0usize;

    loop {
        let block_size = read_block_size(buf, marker)?;
        let window_end = (marker + block_size).min(buf.len());
        let window = buf.get(marker..window_end)?;
        let segment = inflate::decompress_segment(window)?;
        total_consumed += window.len();
        let finished_this_segment = segment.data.len() < SEGMENT_SIZE || segment.stream_ended;
        assembled.extend_from_slice(&segment.data);

        if finished_this_segment {
            break;
        }

        // Find the next marker strictly after this one to continue the fragment.
        match find_next_marker(buf, marker + 1) {
            Some(next) => marker = next,
            None => break,
        }
    }

    match parse_xml(&assembled, tag) {
        Ok(xml) => Some(DecompressedFragment { xml, tag, byte_offset: first_marker, byte_size: total_consumed }),
        Err(_) => {
            // Retry once, unbounded, from the original marker to the end of the buffer.
            let tail = inflate::inflate_unbounded(&buf[first_marker..])?;
            let xml = parse_xml(&tail, tag).ok()?;
            Some(DecompressedFragment { xml, tag, byte_offset: first_marker, byte_size: buf.len() - first_marker })
        }
    }
}

/// Read the 16-bit little-endian block-size prefix immediately preceding `marker`.
fn read_block_size(buf: &[u8], marker: usize) -> Option<usize> {
    if marker < 2 {
        return None;
    }
    read_u16_le(buf, marker - 2).ok().map(|n| n as usize)
}

fn find_next_marker(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(2)
        .position(|w| w == ZLIB_MARKER)
        .map(|rel| from + rel)
}

/// Strip a leading BOM and any embedded NUL bytes, then require well-formed XML.
fn parse_xml(data: &[u8], tag: FragmentTag) -> Result<String, ()> {
    let cleaned: Vec<u8> = data.iter().copied().filter(|&b| b != 0).collect();
    let text = std::str::from_utf8(&cleaned).map_err(|_| ())?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let doc = roxmltree::Document::parse(text).map_err(|_| ())?;
    let root_name = doc.root_element().tag_name().name();

    if tag == FragmentTag::IdentXmlPart && !text.contains("DBBlock") {
        return Err(());
    }
    let expected = match tag {
        FragmentTag::Member => "Member",
        FragmentTag::Root => "Root",
        FragmentTag::IdentXmlPart => "IdentXmlPart",
    };
    if root_name != expected {
        return Err(());
    }
    Ok(text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use miniz_oxide::deflate::compress_to_vec_zlib;

    fn wrap(xml: &str) -> Vec<u8> {
        let mut payload = vec![0xEFu8, 0xBB, 0xBF];
        payload.extend_from_slice(xml.as_bytes());
        let compressed = compress_to_vec_zlib(&payload, 6);
        let mut buf = Vec::new();
        buf.push(0xAA); // padding so the marker isn't at offset 0
        buf.extend_from_slice(&(compressed.len() as u16).to_le_bytes());
        buf.extend_from_slice(&compressed);
        buf
    }

    #[test]
    fn extracts_a_root_fragment() {
        let buf = wrap("<Root><Member Name=\"x\"/></Root>");
        let fragments = extract_fragments(&buf);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].tag, FragmentTag::Root);
        assert!(fragments[0].xml.contains("Member"));
    }

    #[test]
    fn rejects_uninteresting_tags() {
        let buf = wrap("<Something>else</Something>");
        assert!(extract_fragments(&buf).is_empty());
    }

    #[test]
    fn requires_dbblock_substring_for_ident_xml_part() {
        let buf = wrap("<IdentXmlPart><Other/></IdentXmlPart>");
        assert!(extract_fragments(&buf).is_empty());

        let buf = wrap("<IdentXmlPart><AufDBBlock>DBBlock</AufDBBlock></IdentXmlPart>");
        let fragments = extract_fragments(&buf);
        assert_eq!(fragments.len(), 1);
    }

    #[test]
    fn assembles_a_fragment_spanning_multiple_segments() {
        // The first segment's plaintext deliberately exceeds SEGMENT_SIZE so
        // the bounded decompress fills its output window without the stream
        // reaching its natural end, forcing `assemble_fragment` to look for
        // a continuation marker rather than stopping after one segment.
        let mut first_plaintext = vec![0xEFu8, 0xBB, 0xBF];
        first_plaintext.extend_from_slice(b"<Root>");
        first_plaintext.extend(std::iter::repeat(b'x').take(SEGMENT_SIZE + 512));
        let first_compressed = compress_to_vec_zlib(&first_plaintext, 6);

        let second_compressed = compress_to_vec_zlib(b"</Root>", 6);

        let mut buf = Vec::new();
        buf.push(0xAA); // padding so the first marker isn't at offset 0
        buf.extend_from_slice(&(first_compressed.len() as u16).to_le_bytes());
        buf.extend_from_slice(&first_compressed);
        buf.extend_from_slice(&(second_compressed.len() as u16).to_le_bytes());
        buf.extend_from_slice(&second_compressed);

        let fragments = extract_fragments(&buf);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].tag, FragmentTag::Root);
        assert!(fragments[0].xml.starts_with("<Root>"));
        assert!(fragments[0].xml.ends_with("</Root>"));
        assert!(fragments[0].xml.len() > SEGMENT_SIZE, "assembled XML should span both segments");
    }
}
