//! Pass 4: Element-Block Extractor & Linker.
//!
//! Scans for the two ASCII-prefixed element header forms — `BIVE:<name>/<guid>`
//! for root elements, `BI:<scope>:<name>/<guid>` for member elements — then
//! cross-links each resulting [`ElementBlock`] to a [`RawBlock`] (by name and
//! address), a [`ReferenceBlock`] (by ID-name and address), and, once pass 5
//! has run, an `XmlBlock` (by element id).

use std::collections::BTreeMap;

use regex::bytes::Regex;
use tracing::{debug, warn};

use crate::bytes::{read_u16_le, read_u8};
use crate::raw_block::{BlockKind, RawBlock};
use crate::reference_block::ReferenceBlock;
use crate::scan::{self, ScanBudget};

/// Which header form produced an [`ElementBlock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Root,
    Member,
}

/// One element header, classified and (eventually) fully cross-linked.
#[derive(Debug, Clone)]
pub struct ElementBlock {
    pub element_kind: ElementKind,
    /// `guid` for a root element, `scope:guid` for a member.
    pub id: String,
    /// The scope/name token captured from the header's inner regex.
    pub name: String,
    pub kind: BlockKind,
    /// Offset of the occurrence of `name` used for classification.
    pub block_byte_offset: usize,
    /// Offset of the `BIVE:`/`BI:` header match itself.
    pub data_byte_offset: usize,
    pub address: u16,
    pub raw_block_name: Option<String>,
    pub reference_block: String,
    pub xml_block_id: Option<String>,
}

const PASS_NAME: &str = "element_block";

/// Run pass 4: scan both header forms, classify, dedup, and link to raw and
/// reference blocks. The XML-block link is attached later, by
/// [`link_xml_blocks`], once pass 5 has produced its `XmlBlock`s.
pub fn extract_element_blocks(
    buf: &[u8],
    raw_blocks: &[RawBlock],
    reference_blocks: &[ReferenceBlock],
    budget: ScanBudget,
) -> Vec<ElementBlock> {
    let mut elements = scan_root_headers(buf, raw_blocks, budget);
    elements.extend(scan_member_headers(buf, raw_blocks, budget));

    let mut elements = dedup_by_id_keep_latest(elements);
    link_to_raw_blocks(&mut elements, raw_blocks);
    link_to_reference_blocks(&mut elements, reference_blocks);
    elements
}

fn inner_header_regex() -> Regex {
    Regex::new(r"(?-u)([A-Za-z0-9]+):.*?/([A-Za-z0-9\-]{36})").expect("valid regex")
}

/// `BIVE:(.*?)/` root headers.
fn scan_root_headers(buf: &[u8], raw_blocks: &[RawBlock], budget: ScanBudget) -> Vec<ElementBlock> {
    let outer = Regex::new(r"(?s-u)BIVE:(.*?)/").expect("valid regex");
    let matches = match scan::bounded_find_iter(&outer, buf, budget, PASS_NAME) {
        Ok(m) => m,
        Err(_) => {
            warn!(pass = PASS_NAME, "root header scan timed out");
            return Vec::new();
        }
    };

    let inner = inner_header_regex();
    let mut out = Vec::new();
    for m in matches {
        // `size == 95` is the escape marker byte; the real length lives one
        // byte further back in that case.
        let size = match read_u8(buf, m.start.saturating_sub(1)) {
            Ok(95) => read_u8(buf, m.start.saturating_sub(2)),
            other => other,
        };
        let Ok(size) = size else { continue };
        let size = size as usize;
        let Some(block_data) = buf.get(m.start..(m.start + size).min(buf.len())) else { continue };

        // The root element has only one namespace level, so its name is the
        // outer match's own capture (the text between `BIVE:` and the first
        // `/`), not the inner regex's first group — `block_data` still
        // starts with the literal `BIVE:` text, which would otherwise win
        // the leftmost match and get captured as the "name" itself.
        let Some(name_span) = m.groups.first().copied().flatten() else { continue };
        let Some(name_bytes) = buf.get(name_span.0..name_span.1) else { continue };
        let name = String::from_utf8_lossy(name_bytes).into_owned();

        let Some(caps) = inner.captures(block_data) else { continue };
        let Some(guid) = caps.get(2) else { continue };
        let guid = String::from_utf8_lossy(guid.as_bytes()).into_owned();

        let (kind, block_byte_offset) = classify_by_occurrences(buf, &name, raw_blocks);
        out.push(ElementBlock {
            element_kind: ElementKind::Root,
            id: guid,
            name,
            kind,
            block_byte_offset,
            data_byte_offset: m.start,
            address: 0,
            raw_block_name: None,
            reference_block: String::new(),
            xml_block_id: None,
        });
    }
    out
}

/// `BI:(.*?)/` member headers.
fn scan_member_headers(buf: &[u8], raw_blocks: &[RawBlock], budget: ScanBudget) -> Vec<ElementBlock> {
    let outer = Regex::new(r"(?s-u)BI:(.*?)/").expect("valid regex");
    let matches = match scan::bounded_find_iter(&outer, buf, budget, PASS_NAME) {
        Ok(m) => m,
        Err(_) => {
            warn!(pass = PASS_NAME, "member header scan timed out");
            return Vec::new();
        }
    };

    let inner = inner_header_regex();
    let mut out = Vec::new();
    for m in matches {
        // This 16-bit LE read starts one byte before the match, so it
        // overlaps one byte of the `BI:` prefix. A faithful port keeps the
        // overlap rather than aligning the read to the byte immediately
        // preceding the match.
        let Ok(size) = read_u16_le(buf, m.start.saturating_sub(1)) else { continue };
        let size = size as usize;
        let Some(block_data) = buf.get(m.start..(m.start + size).min(buf.len())) else { continue };

        // `block_data` starts with the literal `BI:` prefix, which would
        // itself satisfy `([A-Za-z0-9]+):` and get captured as the scope;
        // search past it so the first real colon-delimited token wins.
        const MEMBER_PREFIX_LEN: usize = 3;
        let search_region = block_data.get(MEMBER_PREFIX_LEN..).unwrap_or(&[]);
        let Some(caps) = inner.captures(search_region) else { continue };
        let Some(scope) = caps.get(1) else { continue };
        let Some(guid) = caps.get(2) else { continue };
        let mut scope = String::from_utf8_lossy(scope.as_bytes()).into_owned();
        let guid = String::from_utf8_lossy(guid.as_bytes()).into_owned();
        if scope == "Values" {
            scope.clear();
        }
        let id = format!("{scope}:{guid}");

        let (kind, block_byte_offset) = classify_by_occurrences(buf, &scope, raw_blocks);
        out.push(ElementBlock {
            element_kind: ElementKind::Member,
            id,
            name: scope,
            kind,
            block_byte_offset,
            data_byte_offset: m.start,
            address: 0,
            raw_block_name: None,
            reference_block: String::new(),
            xml_block_id: None,
        });
    }
    out
}

/// Examine every raw occurrence of `name` in `buf`; the two bytes
/// immediately preceding it are a two-letter kind prefix (`DT`, `FB`, `DB`,
/// `OB`, `FC`). A name can genuinely occur more than once in the buffer —
/// the spec classifies every occurrence and then dedups by id keeping the
/// highest offset, which is equivalent here to picking the highest-offset
/// classifiable occurrence directly, since every occurrence of one header's
/// name shares that header's id. Falls back to raw-block-name containment
/// (again keeping the highest-offset match), then `Undefined` at offset 0.
fn classify_by_occurrences(buf: &[u8], name: &str, raw_blocks: &[RawBlock]) -> (BlockKind, usize) {
    if name.is_empty() {
        return (BlockKind::Undefined, 0);
    }
    let needle = name.as_bytes();
    let mut best: Option<(BlockKind, usize)> = None;
    let mut start = 0usize;
    while start < buf.len() {
        let Some(window) = buf.get(start..) else { break };
        let Some(rel) = window.windows(needle.len()).position(|w| w == needle) else { break };
        let j = start + rel;
        if j >= 3 {
            if let Some(prefix) = buf.get(j - 3..j - 1) {
                if let Some(kind) = classify_prefix(prefix) {
                    if best.is_none_or(|(_, offset)| j > offset) {
                        best = Some((kind, j));
                    }
                }
            }
        }
        start = j + 1;
    }
    if let Some(result) = best {
        return result;
    }

    let mut fallback: Option<(BlockKind, usize)> = None;
    for raw in raw_blocks {
        if let Some(pos) = raw.name.find(name) {
            let confirm_offset = raw.byte_offset + pos;
            if confirm_offset > 0 {
                if let Ok(len_byte) = read_u8(buf, confirm_offset.saturating_sub(1)) {
                    if len_byte as usize == name.len() + 1 && fallback.is_none_or(|(_, offset)| raw.byte_offset > offset) {
                        fallback = Some((raw.kind, raw.byte_offset));
                    }
                }
            }
        }
    }

    fallback.unwrap_or((BlockKind::Undefined, 0))
}

fn classify_prefix(prefix: &[u8]) -> Option<BlockKind> {
    match prefix {
        b"DT" => Some(BlockKind::Udt),
        b"FB" => Some(BlockKind::Fb),
        b"DB" => Some(BlockKind::Db),
        b"OB" => Some(BlockKind::Ob),
        b"FC" => Some(BlockKind::Fc),
        _ => None,
    }
}

/// Sort by `data_byte_offset`, group by id, keep the latest per group, and
/// re-sort the result by `data_byte_offset` before returning — a
/// `BTreeMap<String, _>` iterates in key (id/GUID) order, which would
/// otherwise silently hand `link_to_raw_blocks`/`link_to_reference_blocks`
/// an id-lexicographic ordering instead of buffer order, breaking their
/// "first matching element" semantics whenever two elements share a name.
fn dedup_by_id_keep_latest(mut elements: Vec<ElementBlock>) -> Vec<ElementBlock> {
    elements.sort_by_key(|e| e.data_byte_offset);
    let mut by_id: BTreeMap<String, ElementBlock> = BTreeMap::new();
    for element in elements {
        by_id.insert(element.id.clone(), element);
    }
    let mut deduped: Vec<ElementBlock> = by_id.into_values().collect();
    deduped.sort_by_key(|e| e.data_byte_offset);
    deduped
}

/// For every DB [`RawBlock`], link the first [`ElementBlock`] whose `name`
/// equals the raw block's name: set its address and attach the raw name.
fn link_to_raw_blocks(elements: &mut [ElementBlock], raw_blocks: &[RawBlock]) {
    for raw in raw_blocks.iter().filter(|b| b.kind == BlockKind::Db) {
        let Some(address_record) = &raw.address_record else { continue };
        if let Some(element) = elements.iter_mut().find(|e| e.name == raw.name) {
            element.address = address_record.reference_address;
            element.raw_block_name = Some(raw.name.clone());
        }
    }
}

/// For every element, match against `ReferenceBlock` instance records by
/// id-name; on a matching address confirm the link, on a differing address
/// override with the instance's address (and log the override), otherwise
/// fall back to the element's own name.
fn link_to_reference_blocks(elements: &mut [ElementBlock], reference_blocks: &[ReferenceBlock]) {
    for element in elements.iter_mut() {
        let id_name = element.raw_block_name.clone().unwrap_or_else(|| element.name.clone());

        let candidate = reference_blocks
            .iter()
            .flat_map(|rb| rb.instances.iter().map(move |i| (rb, i)))
            .find(|(_, instance)| instance.name == id_name);

        match candidate {
            Some((reference_block, instance)) if instance.address as u32 == element.address as u32 => {
                element.reference_block = reference_block.block_name.clone();
            }
            Some((reference_block, instance)) => {
                debug!(
                    element = %element.name,
                    old_address = element.address,
                    new_address = instance.address,
                    "reference-block address overrides raw-block address"
                );
                element.address = instance.address.max(0) as u16;
                element.reference_block = reference_block.block_name.clone();
            }
            None => {
                element.reference_block = element.name.clone();
            }
        }
    }
}

/// Attach each element's XML-block link once pass 5's `XmlBlock`s exist.
/// Kept separate from `extract_element_blocks` because `XmlBlock` is only
/// produced by the pass that runs after this one.
pub fn link_xml_blocks(elements: &mut [ElementBlock], xml_block_ids: &[String]) {
    let ids: std::collections::BTreeSet<&str> = xml_block_ids.iter().map(|s| s.as_str()).collect();
    for element in elements.iter_mut() {
        if ids.contains(element.id.as_str()) {
            element.xml_block_id = Some(element.id.clone());
        } else {
            warn!(id = %element.id, "element has no matching XML block");
        }
    }
}
