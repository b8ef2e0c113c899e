//! Pass 2: Reference-Block Resolver.
//!
//! Scans both the raw container bytes and pass 1's decompressed fragments
//! for `IdentXmlPart` records describing `AufDBBlock`/`DepDBBlock`
//! instances, and groups them by their `TOD/TRKG` tracking key into
//! [`ReferenceBlock`] containers.

use std::collections::BTreeMap;

use regex::bytes::Regex;
use roxmltree::Node;
use tracing::warn;

use crate::error::Error;
use crate::fragments::{DecompressedFragment, FragmentTag};
use crate::scan::{self, ScanBudget};

const IDENT_NAMESPACE: &str = "http://schemas.siemens.com/Simatic/ES/14/IdentManager/IdentXmlPart.xsd";

/// Every property path copied out of an `AufDBBlock`/`DepDBBlock` instance.
/// Missing paths default to an empty string, per spec.
#[derive(Debug, Clone, Default)]
pub struct InstanceProperties {
    pub id_n: String,
    pub id_s: String,
    pub id_rid: String,
    pub id_is: String,
    pub id_cs_c: String,
    pub od_dtr: String,
    pub od_s: String,
    pub od_td_t: String,
    pub tod_n: String,
    pub tod_sm: String,
    pub tod_bt: String,
    pub tod_cid: String,
    pub tod_trkg: String,
    pub dbbd_im: String,
    pub dbbd_nr: String,
}

/// One `AufDBBlock`/`DepDBBlock` instance inside a `ReferenceBlock`.
#[derive(Debug, Clone)]
pub struct InstanceRecord {
    pub properties: InstanceProperties,
    /// Third component of `OD/TD/T` (`BlockType:BlockID:Name`).
    pub name: String,
    /// `AufDBBlock` or `DepDBBlock`.
    pub kind_label: String,
    pub byte_offset: usize,
    pub address: i32,
    pub trkg: String,
}

/// A group of instance records sharing one tracking key.
#[derive(Debug, Clone)]
pub struct ReferenceBlock {
    pub trkg: String,
    pub block_name: String,
    pub kind_label: String,
    pub instances: Vec<InstanceRecord>,
}

/// Run pass 2 over the raw buffer and pass 1's decompressed fragments.
pub fn extract_reference_blocks(buf: &[u8], fragments: &[DecompressedFragment], budget: ScanBudget) -> Vec<ReferenceBlock> {
    let mut groups: BTreeMap<String, Vec<InstanceRecord>> = BTreeMap::new();

    for (xml, offset) in raw_ident_xml_parts(buf, budget) {
        collect_instances(&xml, offset, &mut groups);
    }
    for fragment in fragments.iter().filter(|f| f.tag == FragmentTag::IdentXmlPart) {
        collect_instances(&fragment.xml, fragment.byte_offset, &mut groups);
    }

    let mut blocks: Vec<ReferenceBlock> = groups
        .into_iter()
        .map(|(trkg, mut instances)| {
            dedup_and_sort_by_address(&mut instances);
            let block_name = instances.first().map(|i| i.name.clone()).unwrap_or_default();
            let kind_label = instances.first().map(|i| i.kind_label.clone()).unwrap_or_default();
            ReferenceBlock { trkg, block_name, kind_label, instances }
        })
        .collect();

    blocks.sort_by_key(|b| b.instances.first().map(|i| i.address).unwrap_or(i32::MAX));
    blocks
}

/// Keep the last-encountered instance per address, then sort ascending.
fn dedup_and_sort_by_address(instances: &mut Vec<InstanceRecord>) {
    let mut by_address: BTreeMap<i32, InstanceRecord> = BTreeMap::new();
    for instance in instances.drain(..) {
        by_address.insert(instance.address, instance);
    }
    instances.extend(by_address.into_values());
    instances.sort_by_key(|i| i.address);
}

/// Find raw `<IdentXmlPart ...>...</IdentXmlPart>` spans containing `DBBlock`.
fn raw_ident_xml_parts(buf: &[u8], budget: ScanBudget) -> Vec<(String, usize)> {
    let pattern = Regex::new(r"(?s-u)<IdentXmlPart\b.*?</IdentXmlPart>").expect("valid regex");
    let matches = match scan::bounded_find_iter(&pattern, buf, budget, "reference_block") {
        Ok(m) => m,
        Err(Error::RegexTimeout { pass }) => {
            warn!(pass, "regex timeout scanning for IdentXmlPart records");
            return Vec::new();
        }
        Err(_) => return Vec::new(),
    };

    matches
        .into_iter()
        .filter_map(|m| {
            let raw = &buf[m.start..m.end];
            if !raw.windows(b"DBBlock".len()).any(|w| w == b"DBBlock") {
                return None;
            }
            let text = String::from_utf8_lossy(raw).into_owned();
            Some((text, m.start))
        })
        .collect()
}

/// Parse one `IdentXmlPart` document, appending every `AufDBBlock`/`DepDBBlock`
/// descendant into `groups`, keyed by its `TOD/TRKG`.
fn collect_instances(xml: &str, byte_offset: usize, groups: &mut BTreeMap<String, Vec<InstanceRecord>>) {
    let doc = match roxmltree::Document::parse(xml) {
        Ok(doc) => doc,
        Err(e) => {
            warn!(byte_offset, error = %e, "IdentXmlPart fragment failed to parse");
            return;
        }
    };

    for node in doc.descendants() {
        if !node.is_element() {
            continue;
        }
        let name = node.tag_name().name();
        let in_namespace = node.tag_name().namespace().is_none_or(|ns| ns == IDENT_NAMESPACE);
        if !in_namespace {
            continue;
        }
        if name != "AufDBBlock" && name != "DepDBBlock" {
            continue;
        }

        let kind_label = node.tag_name().name().to_string();
        let properties = InstanceProperties {
            id_n: child_text(node, "ID/N"),
            id_s: child_text(node, "ID/S"),
            id_rid: child_text(node, "ID/RID"),
            id_is: child_text(node, "ID/IS"),
            id_cs_c: child_text_alt(node, "ID/CS/C", &["NID", "UID", "AK"]),
            od_dtr: child_text(node, "OD/DTR"),
            od_s: child_text(node, "OD/S"),
            od_td_t: child_text(node, "OD/TD/T"),
            tod_n: child_text(node, "TOD/N"),
            tod_sm: child_text(node, "TOD/SM"),
            tod_bt: child_text(node, "TOD/BT"),
            tod_cid: child_text(node, "TOD/CID"),
            tod_trkg: child_text(node, "TOD/TRKG"),
            dbbd_im: child_text(node, "DBBD/IM"),
            dbbd_nr: child_text(node, "DBBD/NR"),
        };

        let Some(name) = split_block_type(&properties.od_td_t) else {
            warn!(byte_offset, "OD/TD/T is not BlockType:BlockID:Name, skipping instance");
            continue;
        };

        let address: i32 = match properties.tod_n.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(byte_offset, raw = %properties.tod_n, "TOD/N is not a decimal address, skipping instance");
                continue;
            }
        };

        let trkg = properties.tod_trkg.clone();
        let record = InstanceRecord { properties, name, kind_label, byte_offset, address, trkg: trkg.clone() };
        groups.entry(trkg).or_default().push(record);
    }
}

/// `OD/TD/T` must be exactly `BlockType:BlockID:Name`; return the `Name` token.
fn split_block_type(od_td_t: &str) -> Option<String> {
    let parts: Vec<&str> = od_td_t.split(':').collect();
    if parts.len() != 3 {
        return None;
    }
    Some(parts[2].to_string())
}

/// Descend through direct children named by each `/`-separated path segment,
/// returning the final node's text content, or `""` if any segment is absent.
fn child_text(node: Node, path: &str) -> String {
    let mut current = node;
    for segment in path.split('/') {
        match current.children().find(|c| c.is_element() && c.tag_name().name() == segment) {
            Some(next) => current = next,
            None => return String::new(),
        }
    }
    current.text().unwrap_or("").to_string()
}

/// Like [`child_text`], but the final path segment may be any of `alts`.
fn child_text_alt(node: Node, path: &str, alts: &[&str]) -> String {
    let mut current = node;
    for segment in path.split('/') {
        match current.children().find(|c| c.is_element() && c.tag_name().name() == segment) {
            Some(next) => current = next,
            None => return String::new(),
        }
    }
    for alt in alts {
        if let Some(leaf) = current.children().find(|c| c.is_element() && c.tag_name().name() == *alt) {
            return leaf.text().unwrap_or("").to_string();
        }
    }
    String::new()
}
