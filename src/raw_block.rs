//! Pass 3: Raw-Block Extractor.
//!
//! Finds block-header and block-name markers directly in the raw bytes,
//! classifies each into a [`BlockKind`], and separately locates `%DB`
//! address tokens and `PLUSBLOCK` records, each carrying a 16-bit reference
//! address. Every DB-kind [`RawBlock`] is then paired with the nearest
//! following [`AddressRecord`].

use std::collections::BTreeMap;

use regex::bytes::Regex;
use tracing::warn;

use crate::bytes::{ascii_slice, is_alphanumeric_ascii, read_u16_le, read_u8};
use crate::inflate;
use crate::scan::{self, ScanBudget};

/// PLC block category inferred for a raw record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Udt,
    Fb,
    Fc,
    Ob,
    Db,
    Undefined,
}

impl BlockKind {
    fn from_marker(marker: &str) -> Option<Self> {
        match marker {
            "UDT" => Some(BlockKind::Udt),
            "FB" => Some(BlockKind::Fb),
            "DB" => Some(BlockKind::Db),
            "OB" => Some(BlockKind::Ob),
            "FC" => Some(BlockKind::Fc),
            _ => None,
        }
    }

    /// Classify by substring, checking in this precedence order:
    /// UDT, then FB, then DB, then OB, then FC.
    fn from_name_substring(name: &str) -> Option<Self> {
        if name.contains("UDT") {
            Some(BlockKind::Udt)
        } else if name.contains("FB") {
            Some(BlockKind::Fb)
        } else if name.contains("DB") {
            Some(BlockKind::Db)
        } else if name.contains("OB") {
            Some(BlockKind::Ob)
        } else if name.contains("FC") {
            Some(BlockKind::Fc)
        } else {
            None
        }
    }
}

/// A 16-bit reference address record, from a `%DB` token or a `PLUSBLOCK` record.
#[derive(Debug, Clone)]
pub struct AddressRecord {
    pub name: String,
    pub token: String,
    pub reference_address: u16,
    pub byte_offset: usize,
    pub inline_blob: Option<Vec<u8>>,
}

/// A block-header or block-name record found directly in raw bytes.
#[derive(Debug, Clone)]
pub struct RawBlock {
    pub kind: BlockKind,
    pub name: String,
    pub byte_offset: usize,
    pub address_record: Option<AddressRecord>,
}

/// Result of pass 3: classified raw blocks (DB blocks paired with their
/// nearest address record) and the full, deduplicated address record list.
pub struct RawBlockScan {
    pub blocks: Vec<RawBlock>,
    pub address_records: Vec<AddressRecord>,
}

const PASS_NAME: &str = "raw_block";

/// Run pass 3 over the raw container bytes.
pub fn extract_raw_blocks(buf: &[u8], budget: ScanBudget) -> RawBlockScan {
    let mut blocks = header_scan(buf, budget);
    blocks.extend(name_scan(buf, budget));

    let mut address_records = address_scan(buf, budget);
    address_records.extend(plusblock_scan(buf, budget));
    let mut address_records = dedup_address_records(address_records);
    address_records.sort_by_key(|a| a.reference_address);

    pair_db_blocks(&mut blocks, &address_records);

    RawBlockScan { blocks, address_records }
}

/// `(UDT|FB|DB|OB|FC)!|PLUSBLOCK` header scan.
fn header_scan(buf: &[u8], budget: ScanBudget) -> Vec<RawBlock> {
    let pattern = Regex::new(r"(?-u)(UDT|FB|DB|OB|FC)!|PLUSBLOCK").expect("valid regex");
    let matches = match scan::bounded_find_iter(&pattern, buf, budget, PASS_NAME) {
        Ok(m) => m,
        Err(_) => {
            warn!(pass = PASS_NAME, "header scan timed out");
            return Vec::new();
        }
    };

    let mut blocks = Vec::new();
    for m in matches {
        if m.groups.first().and_then(|g| *g).is_none() {
            // This was the `PLUSBLOCK` alternative; handled by `plusblock_scan`.
            continue;
        }
        let marker_span = m.groups[0].unwrap();
        let marker = &buf[marker_span.0..marker_span.1];
        let marker_str = std::str::from_utf8(marker).unwrap_or("");

        let Ok(o) = read_u8(buf, m.end) else { continue };
        let o = o as usize;
        let Ok(s) = read_u8(buf, m.end + o) else { continue };
        let s = s as usize;
        let Ok(name) = ascii_slice(buf, m.end + o + 1, s, "header_scan name") else { continue };

        if !is_alphanumeric_ascii(&name) {
            continue;
        }

        let kind = BlockKind::from_marker(marker_str).or_else(|| BlockKind::from_name_substring(&name));
        let Some(kind) = kind else {
            warn!(byte_offset = m.start, "header scan could not classify block kind");
            continue;
        };

        blocks.push(RawBlock { kind, name, byte_offset: m.start, address_record: None });
    }
    blocks
}

/// `\x01\x03(DB|OB|FC|FB)` name scan.
fn name_scan(buf: &[u8], budget: ScanBudget) -> Vec<RawBlock> {
    let pattern = Regex::new(r"(?-u)\x01\x03(DB|OB|FC|FB)").expect("valid regex");
    let matches = match scan::bounded_find_iter(&pattern, buf, budget, PASS_NAME) {
        Ok(m) => m,
        Err(_) => {
            warn!(pass = PASS_NAME, "name scan timed out");
            return Vec::new();
        }
    };

    let mut blocks = Vec::new();
    for m in matches {
        let Some(marker_span) = m.groups.first().and_then(|g| *g) else { continue };
        let marker = std::str::from_utf8(&buf[marker_span.0..marker_span.1]).unwrap_or("");
        let match_end = m.end;

        let Ok(name_size) = read_u8(buf, match_end) else { continue };
        let name_size = name_size as usize;

        let name_result = if name_size == 33 {
            match read_u8(buf, match_end + 33) {
                Ok(33) => ascii_slice(buf, match_end + 1, 32, "name_scan true name"),
                _ => {
                    let Ok(offset) = read_u8(buf, match_end + 1) else { continue };
                    let offset = offset as usize;
                    let Ok(size) = read_u8(buf, match_end + 1 + offset) else { continue };
                    let size = size as usize;
                    let start = match_end + 2 + offset;
                    let len = size.saturating_sub(1);
                    ascii_slice(buf, start, len, "name_scan indirect name")
                }
            }
        } else {
            let start = match_end + 1;
            let len = name_size.saturating_sub(1);
            ascii_slice(buf, start, len, "name_scan short name")
        };

        let Ok(name) = name_result else { continue };
        let Some(kind) = BlockKind::from_marker(marker) else { continue };
        blocks.push(RawBlock { kind, name, byte_offset: m.start, address_record: None });
    }
    blocks
}

/// `%DB` address-token scan.
fn address_scan(buf: &[u8], budget: ScanBudget) -> Vec<AddressRecord> {
    let pattern = Regex::new(r"(?-u)%DB").expect("valid regex");
    let matches = match scan::bounded_find_iter(&pattern, buf, budget, PASS_NAME) {
        Ok(m) => m,
        Err(_) => {
            warn!(pass = PASS_NAME, "address scan timed out");
            return Vec::new();
        }
    };

    let mut records = Vec::new();
    for m in matches {
        let i = m.start;
        if i == 0 {
            continue;
        }
        let Ok(address_size) = read_u8(buf, i - 1) else { continue };
        if address_size == 0 {
            continue;
        }
        // The token slice length below is computed from the pre-cleaning
        // `address_size`, even though the cleaned token (used only for the
        // `^DB\d+` re-match) may be shorter. Preserved rather than re-deriving
        // the length from the cleaned token, intent here is ambiguous but
        // this keeps the digits that follow the stripped `%` intact.
        let token_len = (address_size as usize).saturating_sub(1);
        let Ok(token) = ascii_slice(buf, i, token_len, "address_scan token") else { continue };
        let cleaned: String = token.chars().filter(|c| c.is_ascii_alphanumeric() || *c == '.' || *c == '@' || *c == '-' || *c == '_').collect();

        if !looks_like_db_token(&cleaned) {
            warn!(byte_offset = i, token = %token, "address token did not clean to ^DB\\d+");
            continue;
        }
        let Some(digits) = first_digit_run(&cleaned) else { continue };
        let Ok(reference_address) = digits.parse::<u16>() else {
            warn!(byte_offset = i, token = %cleaned, "address digits overflowed u16");
            continue;
        };

        let blob_offset = i + token_len;
        let inline_blob = read_u16_le(buf, blob_offset).ok().and_then(|len| {
            let len = len as usize;
            if len == 0 || blob_offset + len > buf.len() {
                return None;
            }
            inflate::decompress_segment(&buf[blob_offset..blob_offset + len]).map(|s| s.data)
        });

        records.push(AddressRecord { name: String::new(), token: cleaned, reference_address, byte_offset: i, inline_blob });
    }
    records
}

fn looks_like_db_token(cleaned: &str) -> bool {
    cleaned.len() >= 3 && &cleaned[0..2] == "DB" && cleaned.as_bytes()[2].is_ascii_digit()
}

fn first_digit_run(s: &str) -> Option<String> {
    let digits: String = s.chars().skip_while(|c| !c.is_ascii_digit()).take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() { None } else { Some(digits) }
}

/// `PLUSBLOCK` composite-record scan.
fn plusblock_scan(buf: &[u8], budget: ScanBudget) -> Vec<AddressRecord> {
    let pattern = Regex::new(r"(?-u)PLUSBLOCK").expect("valid regex");
    let matches = match scan::bounded_find_iter(&pattern, buf, budget, PASS_NAME) {
        Ok(m) => m,
        Err(_) => {
            warn!(pass = PASS_NAME, "PLUSBLOCK scan timed out");
            return Vec::new();
        }
    };

    let mut records = Vec::new();
    for m in matches {
        if let Some(record) = parse_plusblock(buf, m.start, m.end) {
            records.push(record);
        }
    }
    records
}

fn parse_plusblock(buf: &[u8], match_index: usize, match_end: usize) -> Option<AddressRecord> {
    let data_size = read_u8(buf, match_end).ok()? as usize;
    let data_block = buf.get(match_end..match_end + data_size)?;

    let rel_m = data_block.windows(3).position(|w| w == b"%DB")?;
    let address_string_size = *data_block.get(rel_m.checked_sub(1)?)? as usize;
    let address_token_len = address_string_size.saturating_sub(1);
    let address_token: String = data_block
        .get(rel_m..rel_m + address_token_len)?
        .iter()
        .map(|&b| b as char)
        .collect();

    let reference_address = read_u16_le(buf, match_index + 53).ok()?;

    // Best-effort follow-on compressed block attached to the PLUSBLOCK record.
    let flag_offset = match_end + data_size + 1;
    if let Ok(flag) = read_u8(buf, flag_offset) {
        if flag != 0 {
            let _ = inflate::decompress_segment(buf.get(flag_offset..buf.len())?);
        }
    }

    // Chained length-prefix indirection to a human-readable block name.
    let off1 = read_u8(buf, match_end + data_size).ok()? as usize;
    let off2 = read_u8(buf, match_end + data_size + off1).ok()? as usize;
    let name_size = read_u8(buf, match_end + data_size + off1 + off2).ok()? as usize;
    let name_start = match_end + data_size + off1 + off2 + 1;
    let name = ascii_slice(buf, name_start, name_size, "plusblock name").ok().filter(|n| n.contains("DB")).unwrap_or_default();

    Some(AddressRecord {
        name,
        token: address_token,
        reference_address,
        byte_offset: match_index,
        inline_blob: None,
    })
}

/// Group address records by byte offset; within a group of more than one,
/// keep only the named ones.
fn dedup_address_records(records: Vec<AddressRecord>) -> Vec<AddressRecord> {
    let mut by_offset: BTreeMap<usize, Vec<AddressRecord>> = BTreeMap::new();
    for r in records {
        by_offset.entry(r.byte_offset).or_default().push(r);
    }

    let mut out = Vec::new();
    for (_, mut group) in by_offset {
        if group.len() > 1 {
            group.retain(|r| !r.name.is_empty());
        }
        out.append(&mut group);
    }
    out
}

/// Pair every DB-kind [`RawBlock`] with the [`AddressRecord`] at the
/// smallest positive byte distance following it.
fn pair_db_blocks(blocks: &mut [RawBlock], address_records: &[AddressRecord]) {
    let mut by_offset: Vec<&AddressRecord> = address_records.iter().collect();
    by_offset.sort_by_key(|a| a.byte_offset);

    for block in blocks.iter_mut().filter(|b| b.kind == BlockKind::Db) {
        let nearest = by_offset
            .iter()
            .filter(|a| a.byte_offset > block.byte_offset)
            .min_by_key(|a| a.byte_offset - block.byte_offset);
        block.address_record = nearest.map(|a| (*a).clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_scan_finds_named_block() {
        let mut buf = vec![0u8; 10];
        buf.extend_from_slice(b"DB!");
        buf.push(1); // offset byte: s lives one byte past the offset byte itself
        buf.push(3); // length-prefix: name is 3 bytes
        buf.extend_from_slice(b"FOO");
        let blocks = header_scan(&buf, ScanBudget::default());
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].kind, BlockKind::Db);
        assert_eq!(blocks[0].name, "FOO");
    }

    #[test]
    fn address_scan_parses_db_token() {
        let mut buf = vec![0u8; 10];
        // address_size counts the '%' itself, so the (preserved) pre-cleaning
        // slice length must span all of "%DB12" (5 bytes) for the cleaned
        // token to keep its trailing digit.
        buf.push(6);
        buf.extend_from_slice(b"%DB12");
        buf.extend_from_slice(&0u16.to_le_bytes());
        let records = address_scan(&buf, ScanBudget::default());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reference_address, 12);
    }

    #[test]
    fn db_blocks_pair_with_nearest_following_address() {
        let mut blocks = vec![RawBlock { kind: BlockKind::Db, name: "FOO".into(), byte_offset: 0, address_record: None }];
        let addrs = vec![
            AddressRecord { name: "x".into(), token: "DB7".into(), reference_address: 7, byte_offset: 64, inline_blob: None },
            AddressRecord { name: "y".into(), token: "DB9".into(), reference_address: 9, byte_offset: 128, inline_blob: None },
        ];
        pair_db_blocks(&mut blocks, &addrs);
        assert_eq!(blocks[0].address_record.as_ref().unwrap().reference_address, 7);
    }
}
