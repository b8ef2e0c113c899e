//! Pass 6: Address Materializer.
//!
//! Walks the fully linked element graph into a forest of [`PlcItem`] trees
//! (expanding arrays and reference links), then flattens each tree into the
//! final `(dotted_name, hex_reference_address)` stream.

use std::collections::BTreeMap;

use regex::Regex;
use tracing::warn;

use crate::element_block::{ElementBlock, ElementKind};
use crate::raw_block::BlockKind;
use crate::xml_decoder::{MemberItem, XmlBlock, XmlPayload};

/// Maximum recursion depth for reference-name expansion before giving up
/// and logging a truncation warning. Bounds runaway expansion if references
/// ever form a cycle, which well-formed input should not produce.
pub const DEFAULT_REFERENCE_EXPANSION_DEPTH: usize = 32;

/// One node in the materialized PLC item tree.
#[derive(Debug, Clone)]
pub struct PlcItem {
    pub id: String,
    pub name: String,
    pub address_fragment: String,
    pub kind: BlockKind,
    pub data_type: String,
    pub reference_name: String,
    pub children: Vec<PlcItem>,
}

/// One outer container: a named group of [`PlcBlock`]s sharing a name.
struct PlcBlock {
    name: String,
    address_decimal: i64,
    items: Vec<PlcItem>,
}

/// Final emitted address pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub name: String,
    pub reference_address: String,
}

/// Run pass 6: build `PlcItem` trees from every linked element, expand
/// arrays and references, then flatten in outer-container address order.
///
/// Output order is the depth-first traversal of the outer-container list
/// sorted by *numeric* address — sorting the already-formatted hex strings
/// lexicographically would put `8A0E14` before `8A0E3`, so the containers
/// are ordered by their raw `address_decimal` before any flattening or
/// formatting happens, and the flattened rows are emitted in that order
/// without a further re-sort.
pub fn materialize(
    elements: &[ElementBlock],
    xml_blocks: &[XmlBlock],
    depth_bound: usize,
) -> Vec<Address> {
    let xml_by_id: BTreeMap<&str, &XmlBlock> = xml_blocks.iter().map(|b| (b.id.as_str(), b)).collect();

    let mut blocks_by_name: BTreeMap<String, Vec<PlcBlock>> = BTreeMap::new();
    for element in elements {
        let xml = element
            .xml_block_id
            .as_deref()
            .and_then(|id| xml_by_id.get(id))
            .copied()
            .or_else(|| borrow_reference_xml(element, elements, &xml_by_id));

        let Some(xml) = xml else {
            warn!(element = %element.name, "element has no XML tree, skipping materialization");
            continue;
        };

        let items = build_items(xml, element.kind);
        let items = expand_arrays(items);
        let block = PlcBlock { name: element.name.clone(), address_decimal: element.address as i64, items };
        blocks_by_name.entry(element.name.clone()).or_default().push(block);
    }

    let lookup: BTreeMap<String, Vec<PlcItem>> =
        blocks_by_name.iter().map(|(name, blocks)| (name.clone(), blocks.iter().flat_map(|b| b.items.clone()).collect())).collect();

    let mut ordered_blocks: Vec<&PlcBlock> = blocks_by_name.values().flatten().collect();
    ordered_blocks.sort_by_key(|block| block.address_decimal);

    let mut addresses = Vec::new();
    for block in ordered_blocks {
        if block.address_decimal == 0 {
            continue;
        }
        let expanded_items: Vec<PlcItem> = block.items.iter().map(|item| expand_references(item, &lookup, depth_bound, 0)).collect();
        flatten(&block.name, &block.address_decimal.to_string(), &expanded_items, &mut addresses);
    }

    addresses
        .into_iter()
        .filter_map(|(name, raw_address)| format_address(&raw_address).map(|hex| Address { name, reference_address: hex }))
        .collect()
}

/// An element that received no XML of its own borrows the XML belonging to
/// the element whose name equals this element's `reference_block`.
fn borrow_reference_xml<'a>(
    element: &ElementBlock,
    elements: &[ElementBlock],
    xml_by_id: &BTreeMap<&str, &'a XmlBlock>,
) -> Option<&'a XmlBlock> {
    elements
        .iter()
        .find(|e| e.name == element.reference_block)
        .and_then(|e| e.xml_block_id.as_deref())
        .and_then(|id| xml_by_id.get(id))
        .copied()
}

fn build_items(xml: &XmlBlock, kind: BlockKind) -> Vec<PlcItem> {
    match &xml.payload {
        XmlPayload::Root(root) => {
            let mut items: Vec<PlcItem> = root.externals.external_types.iter().flat_map(|et| {
                et.usages.iter().enumerate().map(move |(index, usage)| PlcItem {
                    id: index.to_string(),
                    name: usage.name.clone(),
                    address_fragment: usage.path.clone(),
                    kind: parse_block_class(&et.block_class),
                    data_type: "UNDEFINED".to_string(),
                    reference_name: et.data_type.clone(),
                    children: Vec::new(),
                })
            }).collect();
            items.extend(root.members.iter().map(|m| member_item_to_plc(m, kind)));
            items
        }
        XmlPayload::Member(member) => member.members.iter().map(|m| member_item_to_plc(m, kind)).collect(),
    }
}

fn member_item_to_plc(item: &MemberItem, kind: BlockKind) -> PlcItem {
    PlcItem {
        id: item.id.clone(),
        name: item.name.clone(),
        address_fragment: item.lid.clone(),
        kind,
        data_type: item.data_type.clone(),
        reference_name: String::new(),
        children: item.children.iter().map(|c| member_item_to_plc(c, kind)).collect(),
    }
}

fn parse_block_class(label: &str) -> BlockKind {
    match label {
        "UDT" => BlockKind::Udt,
        "FB" => BlockKind::Fb,
        "FC" => BlockKind::Fc,
        "OB" => BlockKind::Ob,
        "DB" => BlockKind::Db,
        _ => BlockKind::Undefined,
    }
}

fn array_pattern() -> Regex {
    Regex::new(r"Array\[(\d+\.\.\d+(?:,\s*\d+\.\.\d+)*)\] of (\w+)").expect("valid regex")
}

/// Expand any item whose `data_type` is `Array[a..b(,a..b)*] of T` into one
/// child per integer in each enumerated range.
fn expand_arrays(items: Vec<PlcItem>) -> Vec<PlcItem> {
    let pattern = array_pattern();
    items
        .into_iter()
        .map(|mut item| {
            item.children = expand_arrays(item.children);
            if let Some(caps) = pattern.captures(&item.data_type) {
                let ranges = &caps[1];
                for range in ranges.split(',') {
                    let range = range.trim();
                    if let Some((a, b)) = range.split_once("..") {
                        if let (Ok(a), Ok(b)) = (a.parse::<i64>(), b.parse::<i64>()) {
                            for i in a..=b {
                                item.children.push(PlcItem {
                                    id: format!("{}[{i}]", item.id),
                                    // Bracket suffix only: array indices attach directly
                                    // to the owning item's own composed name
                                    // ("FOO.field[0]"), not as a further dotted nesting
                                    // level ("FOO.field.field[0]") — see `flatten_child`.
                                    name: format!("[{i}]"),
                                    address_fragment: i.to_string(),
                                    kind: item.kind,
                                    data_type: String::new(),
                                    reference_name: String::new(),
                                    children: Vec::new(),
                                });
                            }
                        }
                    }
                }
            }
            item
        })
        .collect()
}

/// For any item with a non-empty `reference_name`, append the referenced
/// block's items as children, recursing into the copies up to `depth_bound`.
fn expand_references(item: &PlcItem, lookup: &BTreeMap<String, Vec<PlcItem>>, depth_bound: usize, depth: usize) -> PlcItem {
    let mut expanded = item.clone();
    expanded.children = item.children.iter().map(|c| expand_references(c, lookup, depth_bound, depth)).collect();

    if !item.reference_name.is_empty() {
        if depth >= depth_bound {
            warn!(name = %item.name, depth, "reference expansion truncated at depth bound");
            return expanded;
        }
        if let Some(referenced) = lookup.get(&item.reference_name) {
            expanded.children.extend(referenced.iter().map(|c| expand_references(c, lookup, depth_bound, depth + 1)));
        }
    }
    expanded
}

/// Depth-first flatten: `(dotted_name, dot_joined_decimal_address)` pairs.
fn flatten(parent_name: &str, parent_address: &str, items: &[PlcItem], out: &mut Vec<(String, String)>) {
    out.push((parent_name.to_string(), parent_address.to_string()));
    for item in items {
        if item.address_fragment.is_empty() {
            continue;
        }
        let name = format!("{parent_name}.{}", item.name);
        let address = format!("{parent_address}.{}", item.address_fragment);
        flatten_child(&name, &address, item, out);
    }
}

fn flatten_child(name: &str, address: &str, item: &PlcItem, out: &mut Vec<(String, String)>) {
    out.push((name.to_string(), address.to_string()));
    for child in &item.children {
        if child.address_fragment.is_empty() {
            continue;
        }
        // An array-index child's name is already just "[i]"; append it
        // directly to the owning item's name instead of inserting another
        // dot, so "field"'s indices read "field[0]" rather than "field.[0]".
        let child_name = if child.name.starts_with('[') {
            format!("{name}{}", child.name)
        } else {
            format!("{name}.{}", child.name)
        };
        let child_address = format!("{address}.{}", child.address_fragment);
        flatten_child(&child_name, &child_address, child, out);
    }
}

/// Split on `.`, uppercase-hex every numeric segment (logging non-numeric
/// ones rather than failing), and prepend the `8A0E` domain tag.
fn format_address(raw: &str) -> Option<String> {
    let mut segments = Vec::new();
    for segment in raw.split('.') {
        match segment.parse::<i64>() {
            Ok(n) => segments.push(format!("{n:X}")),
            Err(_) => {
                warn!(segment, "non-numeric address segment passed through unformatted");
                segments.push(segment.to_string());
            }
        }
    }
    if segments.is_empty() {
        return None;
    }
    Some(format!("8A0E{}", segments.join(".")))
}
