//! Pass 5: XML Decoder.
//!
//! Finds every `<Root>`/`<Member>` XML tree — whether sitting raw in the
//! buffer or arriving already decompressed from pass 1 — recovers the small
//! header record that precedes it (which carries the element's id), and
//! maps the DOM into this crate's [`Root`]/[`Member`]/[`MemberItem`] types.

use std::collections::BTreeMap;

use regex::bytes::Regex;
use roxmltree::Node;
use tracing::warn;

use crate::bytes::read_u16_le;
use crate::fragments::{DecompressedFragment, FragmentTag};
use crate::scan::{self, ScanBudget};

const PASS_NAME: &str = "xml_decoder";

/// One `Offsets`/`ParamSize` pair, shared shape between `Root` and `Member`.
#[derive(Debug, Clone, Default)]
pub struct Offsets {
    pub std_size: String,
    pub opt_size: String,
    pub flags: String,
    pub crc: String,
    pub vol_size: String,
    pub param_size: Option<ParamSize>,
    pub o_values: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ParamSize {
    pub std_size: String,
    pub vol_size: String,
    pub vol_flags: String,
    pub all_flags: String,
}

#[derive(Debug, Clone)]
pub struct Usage {
    pub path: String,
    pub name: String,
    pub vol_start: String,
    pub section: String,
}

#[derive(Debug, Clone)]
pub struct ExternalType {
    pub sub_part_index: String,
    pub name: String,
    pub data_type: String,
    pub block_class: String,
    pub usages: Vec<Usage>,
}

#[derive(Debug, Clone, Default)]
pub struct Externals {
    pub multi_fb_count: String,
    pub external_types: Vec<ExternalType>,
}

#[derive(Debug, Clone)]
pub struct MemberItem {
    pub id: String,
    pub name: String,
    pub rid: String,
    pub lid: String,
    pub std_o: String,
    pub v: String,
    pub sub_part_index: String,
    pub data_type: String,
    pub children: Vec<MemberItem>,
}

#[derive(Debug, Clone)]
pub struct Root {
    pub interface_guid: String,
    pub members: Vec<MemberItem>,
    pub offsets: Offsets,
    pub extension_memory_volatile_size: String,
    pub externals: Externals,
}

#[derive(Debug, Clone)]
pub struct Member {
    pub parent_id: String,
    pub offsets: Vec<Offsets>,
    pub members: Vec<MemberItem>,
}

#[derive(Debug, Clone)]
pub enum XmlPayload {
    Root(Root),
    Member(Member),
}

#[derive(Debug, Clone)]
pub struct XmlBlock {
    pub id: String,
    pub byte_offset: usize,
    pub byte_size: usize,
    pub is_compressed: bool,
    pub payload: XmlPayload,
}

/// Run pass 5 over the raw buffer and pass 1's decompressed fragments.
pub fn extract_xml_blocks(buf: &[u8], fragments: &[DecompressedFragment], budget: ScanBudget) -> Vec<XmlBlock> {
    let mut blocks = raw_scan(buf, budget);
    for fragment in fragments.iter().filter(|f| matches!(f.tag, FragmentTag::Root | FragmentTag::Member)) {
        if let Some(block) = build_block(&fragment.xml, fragment.byte_offset, fragment.byte_size, true, buf) {
            blocks.push(block);
        }
    }
    dedup_keep_highest_offset(blocks)
}

fn raw_scan(buf: &[u8], budget: ScanBudget) -> Vec<XmlBlock> {
    let pattern = Regex::new(r"(?s-u)<(Root|Member)\b[^>]*>.*?</(Root|Member)>").expect("valid regex");
    let matches = match scan::bounded_find_iter(&pattern, buf, budget, PASS_NAME) {
        Ok(m) => m,
        Err(_) => {
            warn!(pass = PASS_NAME, "raw XML scan timed out");
            return Vec::new();
        }
    };

    let mut blocks = Vec::new();
    for m in matches {
        let raw = &buf[m.start..m.end];
        let text = String::from_utf8_lossy(raw);
        if let Some(block) = build_block(&text, m.start, m.end - m.start, false, buf) {
            blocks.push(block);
        }
    }
    blocks
}

fn build_block(xml: &str, byte_offset: usize, byte_size: usize, is_compressed: bool, buf: &[u8]) -> Option<XmlBlock> {
    let doc = match roxmltree::Document::parse(xml) {
        Ok(doc) => doc,
        Err(e) => {
            warn!(byte_offset, error = %e, "XML tree failed to parse");
            return None;
        }
    };
    let root = doc.root_element();
    let is_root = root.tag_name().name() == "Root";

    let id = recover_header_id(buf, byte_offset, byte_size, is_root).unwrap_or_else(|| {
        warn!(byte_offset, "could not recover element header id, using byte offset as fallback id");
        byte_offset.to_string()
    });

    let payload = if is_root {
        XmlPayload::Root(parse_root(root))
    } else {
        XmlPayload::Member(parse_member(root))
    };

    Some(XmlBlock { id, byte_offset, byte_size, is_compressed, payload })
}

/// Recover the element id from the small header record that precedes the
/// compressed XML. Anchored on `byte_size`; on a direct miss, follow the
/// chained length-prefix indirection using the documented `127`/`214`/`119`
/// constants and the `0xFF` encrypted-sentinel probe.
fn recover_header_id(buf: &[u8], byte_offset: usize, byte_size: usize, is_root: bool) -> Option<String> {
    if let Some(id) = recover_header_id_direct(buf, byte_size, is_root) {
        return Some(id);
    }

    const ROOT_FIRST: usize = 127;
    const ROOT_FALLBACK: usize = 214;
    const MEMBER_FIRST: usize = 119;

    let offset_data1 = *buf.get(byte_offset)? as usize;
    let offset_data2 = *buf.get(byte_offset + offset_data1)? as usize;

    if is_root {
        let sentinel_offset = byte_offset + offset_data1 + offset_data2;
        if buf.get(sentinel_offset) == Some(&0xFF) {
            if let Some(id) = recover_header_id_direct(buf, byte_offset + ROOT_FIRST, true) {
                return Some(id);
            }
            return recover_header_id_direct(buf, byte_offset + ROOT_FALLBACK, true);
        }
        recover_header_id_direct(buf, byte_offset + ROOT_FIRST, true)
    } else {
        let sentinel_offset = byte_size + byte_offset + offset_data1;
        if buf.get(sentinel_offset) == Some(&0xFF) {
            return recover_header_id_direct(buf, byte_offset + MEMBER_FIRST, false);
        }
        recover_header_id_direct(buf, byte_offset + MEMBER_FIRST, false)
    }
}

fn recover_header_id_direct(buf: &[u8], anchor: usize, is_root: bool) -> Option<String> {
    let len = read_u16_le(buf, anchor).ok()? as usize;
    let data = buf.get(anchor + 2..anchor + 2 + len)?;
    let text = String::from_utf8_lossy(data);

    let pattern = if is_root { r"(?s-u)BIVE:(.*?)/" } else { r"(?s-u)BI:(.*?)/" };
    let re = Regex::new(pattern).ok()?;
    let caps = re.captures(text.as_bytes())?;
    let id = caps.get(1)?;
    Some(String::from_utf8_lossy(id.as_bytes()).into_owned())
}

fn parse_root(node: Node) -> Root {
    let interface_guid = node.attribute("InterfaceGuid").unwrap_or_default().to_string();
    let members = node.children().filter(|c| c.is_element() && c.tag_name().name() == "Member").map(parse_member_item).collect();
    let offsets = node.children().find(|c| c.is_element() && c.tag_name().name() == "Offsets").map(parse_offsets).unwrap_or_default();
    let extension_memory_volatile_size = node
        .children()
        .find(|c| c.is_element() && c.tag_name().name() == "ExtensionMemory")
        .and_then(|n| n.attribute("VolatileSize"))
        .unwrap_or_default()
        .to_string();
    let externals = node.children().find(|c| c.is_element() && c.tag_name().name() == "Externals").map(parse_externals).unwrap_or_default();

    Root { interface_guid, members, offsets, extension_memory_volatile_size, externals }
}

fn parse_member(node: Node) -> Member {
    let parent_id = node.attribute("ParentId").unwrap_or("InternalSection").to_string();
    // Both fields walk direct children only, matching `parse_root`:
    // `parse_member_item` already recurses into its own nested `<Member>`
    // children, so scanning `descendants()` here would pick up every nested
    // member a second time, once as this member's own child and once again
    // flattened into this list.
    let offsets = node.children().filter(|c| c.is_element() && c.tag_name().name() == "Offsets").map(parse_offsets).collect();
    let members = node.children().filter(|c| c.is_element() && c.tag_name().name() == "Member").map(parse_member_item).collect();

    Member { parent_id, offsets, members }
}

fn parse_member_item(node: Node) -> MemberItem {
    let attr = |name: &str| node.attribute(name).unwrap_or_default().to_string();
    let children = node.children().filter(|c| c.is_element() && c.tag_name().name() == "Member").map(parse_member_item).collect();

    MemberItem {
        id: attr("ID"),
        name: attr("Name"),
        rid: attr("RID"),
        lid: attr("LID"),
        std_o: attr("StdO"),
        v: attr("v"),
        sub_part_index: attr("SubPartIndex"),
        data_type: attr("Type"),
        children,
    }
}

fn parse_offsets(node: Node) -> Offsets {
    let attr = |name: &str| node.attribute(name).unwrap_or_default().to_string();
    // Attach `ParamSize` to its containing `Offsets` (kept together here
    // rather than left as a dangling sibling).
    let param_size = node.children().find(|c| c.is_element() && c.tag_name().name() == "ParamSize").map(|p| {
        let pattr = |name: &str| p.attribute(name).unwrap_or_default().to_string();
        ParamSize {
            std_size: pattr("stdSize"),
            vol_size: pattr("volSize"),
            vol_flags: pattr("volFlags"),
            all_flags: pattr("allFlags"),
        }
    });
    let o_values = node.descendants().filter(|d| d.is_element() && d.tag_name().name() == "o").filter_map(|d| d.attribute("o")).map(|s| s.to_string()).collect();

    Offsets {
        std_size: attr("stdSize"),
        opt_size: attr("optSize"),
        flags: attr("Flags"),
        crc: attr("CRC"),
        vol_size: attr("volSize"),
        param_size,
        o_values,
    }
}

fn parse_externals(node: Node) -> Externals {
    let multi_fb_count = node.attribute("MultiFBCount").unwrap_or("0").to_string();
    let external_types = node
        .children()
        .filter(|c| c.is_element() && c.tag_name().name() == "ExternalType")
        .map(|et| {
            let attr = |name: &str| et.attribute(name).unwrap_or_default().to_string();
            let usages = et
                .children()
                .filter(|c| c.is_element() && c.tag_name().name().starts_with("Usage"))
                .map(|u| {
                    let uattr = |name: &str| u.attribute(name).unwrap_or_default().to_string();
                    Usage {
                        path: uattr("Path"),
                        name: uattr("Name"),
                        vol_start: uattr("volStart"),
                        section: u.attribute("Section").unwrap_or("Static").to_string(),
                    }
                })
                .collect();
            ExternalType {
                sub_part_index: attr("SubPartIndex"),
                name: attr("Name"),
                data_type: et.attribute("type").unwrap_or_default().to_string(),
                block_class: attr("BlockClass"),
                usages,
            }
        })
        .collect();

    Externals { multi_fb_count, external_types }
}

/// Per element id, keep the `XmlBlock` with the greatest `byte_offset`.
fn dedup_keep_highest_offset(blocks: Vec<XmlBlock>) -> Vec<XmlBlock> {
    let mut by_id: BTreeMap<String, XmlBlock> = BTreeMap::new();
    for block in blocks {
        by_id
            .entry(block.id.clone())
            .and_modify(|existing| {
                if block.byte_offset > existing.byte_offset {
                    *existing = block.clone();
                }
            })
            .or_insert(block);
    }
    by_id.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_root_members_and_offsets() {
        let xml = r#"<Root InterfaceGuid="g">
            <Member ID="0" Name="field" Type="Int" LID="0"/>
            <Offsets stdSize="4" optSize="0" Flags="0" CRC="0" volSize="0">
                <ParamSize stdSize="4" volSize="0" volFlags="0" allFlags="0"/>
            </Offsets>
        </Root>"#;
        let doc = roxmltree::Document::parse(xml).unwrap();
        let root = parse_root(doc.root_element());
        assert_eq!(root.members.len(), 1);
        assert_eq!(root.members[0].name, "field");
        assert!(root.offsets.param_size.is_some());
    }

    #[test]
    fn member_defaults_parent_id_when_absent() {
        let xml = r#"<Member><Member ID="1" Name="x" Type="Int"/></Member>"#;
        let doc = roxmltree::Document::parse(xml).unwrap();
        let member = parse_member(doc.root_element());
        assert_eq!(member.parent_id, "InternalSection");
        assert_eq!(member.members.len(), 1);
    }

    #[test]
    fn member_with_nested_members_is_not_duplicated() {
        let xml = r#"<Member>
            <Member ID="1" Name="outer" Type="Struct">
                <Member ID="2" Name="inner" Type="Int"/>
            </Member>
        </Member>"#;
        let doc = roxmltree::Document::parse(xml).unwrap();
        let member = parse_member(doc.root_element());

        assert_eq!(member.members.len(), 1, "inner should appear only as outer's own child, not flattened in too");
        assert_eq!(member.members[0].name, "outer");
        assert_eq!(member.members[0].children.len(), 1);
        assert_eq!(member.members[0].children[0].name, "inner");
    }

    #[test]
    fn dedup_keeps_highest_offset_block() {
        let a = XmlBlock { id: "x".into(), byte_offset: 10, byte_size: 0, is_compressed: false, payload: XmlPayload::Root(parse_root(roxmltree::Document::parse("<Root/>").unwrap().root_element())) };
        let mut b = a.clone();
        b.byte_offset = 900;
        let deduped = dedup_keep_highest_offset(vec![a, b]);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].byte_offset, 900);
    }
}
