//! Integration tests over the linked `ElementBlock`/`XmlBlock` graph,
//! covering the spec's scenarios 1-3 plus the uniqueness and address-format
//! invariants. Byte-level scanning for each pass already has per-module
//! `#[cfg(test)]` coverage; these tests start one step downstream, from the
//! structures those passes produce, exercising linking and flattening
//! without hand-encoding the container's binary layout byte-for-byte.

use std::collections::HashSet;

use regex::Regex;

use plf_extract::element_block::{ElementBlock, ElementKind};
use plf_extract::materializer::materialize;
use plf_extract::raw_block::BlockKind;
use plf_extract::xml_decoder::{
    Externals, ExternalType, Member, MemberItem, Offsets, Root, Usage, XmlBlock, XmlPayload,
};

fn member_item(id: &str, name: &str, lid: &str, data_type: &str) -> MemberItem {
    MemberItem {
        id: id.to_string(),
        name: name.to_string(),
        rid: String::new(),
        lid: lid.to_string(),
        std_o: String::new(),
        v: String::new(),
        sub_part_index: String::new(),
        data_type: data_type.to_string(),
        children: Vec::new(),
    }
}

fn root_xml(id: &str, members: Vec<MemberItem>) -> XmlBlock {
    XmlBlock {
        id: id.to_string(),
        byte_offset: 0,
        byte_size: 0,
        is_compressed: false,
        payload: XmlPayload::Root(Root {
            interface_guid: String::new(),
            members,
            offsets: Offsets::default(),
            extension_memory_volatile_size: String::new(),
            externals: Externals::default(),
        }),
    }
}

fn element(name: &str, address: u16, xml_id: &str) -> ElementBlock {
    ElementBlock {
        element_kind: ElementKind::Root,
        id: xml_id.to_string(),
        name: name.to_string(),
        kind: BlockKind::Db,
        block_byte_offset: 0,
        data_byte_offset: 0,
        address,
        raw_block_name: Some(name.to_string()),
        reference_block: name.to_string(),
        xml_block_id: Some(xml_id.to_string()),
    }
}

/// Scenario 1: one DB named FOO, reference address 7, one scalar member.
#[test]
fn minimal_db_produces_block_and_member_addresses() {
    let xml = root_xml("G1", vec![member_item("0", "field", "0", "Int")]);
    let elements = vec![element("FOO", 7, "G1")];

    let addresses = materialize(&elements, &[xml], 32);
    let pairs: Vec<(&str, &str)> =
        addresses.iter().map(|a| (a.name.as_str(), a.reference_address.as_str())).collect();

    assert_eq!(pairs, vec![("FOO", "8A0E7"), ("FOO.field", "8A0E7.0")]);
}

/// Scenario 2: same as scenario 1, but the member is a 3-element array.
#[test]
fn array_member_expands_one_child_per_index() {
    let xml = root_xml("G1", vec![member_item("0", "field", "0", "Array[0..2] of Int")]);
    let elements = vec![element("FOO", 7, "G1")];

    let addresses = materialize(&elements, &[xml], 32);
    let pairs: Vec<(&str, &str)> =
        addresses.iter().map(|a| (a.name.as_str(), a.reference_address.as_str())).collect();

    assert_eq!(
        pairs,
        vec![
            ("FOO", "8A0E7"),
            ("FOO.field", "8A0E7.0"),
            ("FOO.field[0]", "8A0E7.0.0"),
            ("FOO.field[1]", "8A0E7.0.1"),
            ("FOO.field[2]", "8A0E7.0.2"),
        ]
    );
}

/// Scenario 3: an element whose XML carries an `Externals` usage referencing
/// another element by name; the referenced element's items must appear as
/// children at the usage's composed address.
#[test]
fn external_reference_pulls_in_referenced_items() {
    let referenced_xml = root_xml(
        "G-REF",
        vec![member_item("0", "x", "0", "Int"), member_item("1", "y", "1", "Int")],
    );
    let referenced = element("REF", 3, "G-REF");

    let mut caller_xml = root_xml("G-MEM", Vec::new());
    if let XmlPayload::Root(root) = &mut caller_xml.payload {
        root.externals = Externals {
            multi_fb_count: "0".to_string(),
            external_types: vec![ExternalType {
                sub_part_index: "0".to_string(),
                name: "extfield".to_string(),
                data_type: "REF".to_string(),
                block_class: "DB".to_string(),
                usages: vec![Usage {
                    path: "0".to_string(),
                    name: "extfield".to_string(),
                    vol_start: "0".to_string(),
                    section: "Static".to_string(),
                }],
            }],
        };
    }
    let caller = element("MEM", 9, "G-MEM");

    let addresses = materialize(&[referenced, caller], &[referenced_xml, caller_xml], 32);
    let pairs: Vec<(&str, &str)> =
        addresses.iter().map(|a| (a.name.as_str(), a.reference_address.as_str())).collect();

    assert!(pairs.contains(&("MEM.extfield", "8A0E9.0")));
    assert!(pairs.contains(&("MEM.extfield.x", "8A0E9.0.0")));
    assert!(pairs.contains(&("MEM.extfield.y", "8A0E9.0.1")));
}

/// Outer containers whose resolved address is `0` never reach the output.
#[test]
fn zero_address_container_is_dropped() {
    let xml = root_xml("G1", vec![member_item("0", "field", "0", "Int")]);
    let elements = vec![element("FOO", 0, "G1")];

    let addresses = materialize(&elements, &[xml], 32);
    assert!(addresses.is_empty());
}

/// A `Member`-shaped XML payload (no externals) still flattens its members
/// the same way a `Root` does, per the shared `build_items`/`flatten` path.
#[test]
fn member_payload_flattens_like_root() {
    let xml = XmlBlock {
        id: "G2".to_string(),
        byte_offset: 0,
        byte_size: 0,
        is_compressed: false,
        payload: XmlPayload::Member(Member {
            parent_id: "InternalSection".to_string(),
            offsets: Vec::new(),
            members: vec![member_item("0", "counter", "4", "Int")],
        }),
    };
    let elements = vec![element("BAR", 12, "G2")];

    let addresses = materialize(&elements, &[xml], 32);
    let pairs: Vec<(&str, &str)> =
        addresses.iter().map(|a| (a.name.as_str(), a.reference_address.as_str())).collect();

    assert_eq!(pairs, vec![("BAR", "8A0EC"), ("BAR.counter", "8A0EC.4")]);
}

/// Every emitted `reference_address` matches `^8A0E([0-9A-F]+(\.[0-9A-F]+)*)$`,
/// over a handful of differently-shaped blocks (scalar, array, multi-member).
#[test]
fn reference_addresses_match_the_8a0e_hex_shape() {
    let shape = Regex::new(r"^8A0E[0-9A-F]+(\.[0-9A-F]+)*$").unwrap();

    let blocks = vec![
        (element("FOO", 7, "G1"), root_xml("G1", vec![member_item("0", "field", "0", "Int")])),
        (
            element("BAZ", 255, "G2"),
            root_xml("G2", vec![member_item("0", "arr", "0", "Array[0..3] of Int")]),
        ),
        (
            element("QUX", 4096, "G3"),
            root_xml(
                "G3",
                vec![
                    member_item("0", "a", "0", "Int"),
                    member_item("1", "b", "16", "Int"),
                    member_item("2", "c", "32", "Int"),
                ],
            ),
        ),
    ];

    let elements: Vec<ElementBlock> = blocks.iter().map(|(e, _)| e.clone()).collect();
    let xml_blocks: Vec<XmlBlock> = blocks.into_iter().map(|(_, x)| x).collect();

    let addresses = materialize(&elements, &xml_blocks, 32);
    assert!(!addresses.is_empty());
    for address in &addresses {
        assert!(shape.is_match(&address.reference_address), "{}", address.reference_address);
    }
}

/// Output order is the depth-first traversal of the outer-container list
/// sorted by *numeric* address. `7` and `20` format to `8A0E7`/`8A0E14`,
/// which sort the wrong way round as plain strings (`"8A0E14" < "8A0E7"`),
/// so this pins the numeric-by-address container ordering rather than a
/// lexicographic sort of the formatted output.
#[test]
fn outer_containers_order_numerically_not_lexicographically() {
    let low = root_xml("G-LOW", vec![member_item("0", "field", "0", "Int")]);
    let high = root_xml("G-HIGH", vec![member_item("0", "field", "0", "Int")]);
    let elements = vec![element("HIGH", 20, "G-HIGH"), element("LOW", 3, "G-LOW")];

    let addresses = materialize(&elements, &[low, high], 32);
    let names: Vec<&str> = addresses.iter().map(|a| a.name.as_str()).collect();

    let low_pos = names.iter().position(|n| *n == "LOW").unwrap();
    let low_field_pos = names.iter().position(|n| *n == "LOW.field").unwrap();
    let high_pos = names.iter().position(|n| *n == "HIGH").unwrap();
    let high_field_pos = names.iter().position(|n| *n == "HIGH.field").unwrap();

    assert!(low_pos < low_field_pos);
    assert!(high_pos < high_field_pos);
    assert!(low_field_pos < high_pos, "address-3 container's rows must precede address-20 container's rows");
}

/// Within one run, every emitted address is unique by name.
#[test]
fn addresses_are_unique_by_name() {
    let blocks = vec![
        (element("FOO", 7, "G1"), root_xml("G1", vec![member_item("0", "field", "0", "Int")])),
        (
            element("BAR", 99, "G2"),
            root_xml(
                "G2",
                vec![member_item("0", "a", "0", "Array[0..2] of Int"), member_item("1", "b", "1", "Int")],
            ),
        ),
    ];

    let elements: Vec<ElementBlock> = blocks.iter().map(|(e, _)| e.clone()).collect();
    let xml_blocks: Vec<XmlBlock> = blocks.into_iter().map(|(_, x)| x).collect();

    let addresses = materialize(&elements, &xml_blocks, 32);
    let mut seen = HashSet::new();
    for address in &addresses {
        assert!(seen.insert(address.name.clone()), "duplicate name {}", address.name);
    }
}
