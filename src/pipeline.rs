//! Driver sequencing the six passes over one immutable input buffer.
//!
//! Unlike a single forward walk, later passes here reach back into earlier
//! passes' outputs for cross-linking (element ↔ raw ↔ reference ↔ XML), so
//! the driver keeps all intermediate collections alive for the whole run
//! rather than discarding each pass's output as it goes.

use tracing::debug;

use crate::element_block::{self, ElementBlock};
use crate::fragments::{self, DecompressedFragment};
use crate::materializer::{self, Address};
use crate::raw_block::{self, AddressRecord, RawBlock};
use crate::reference_block::{self, ReferenceBlock};
use crate::scan::ScanBudget;
use crate::xml_decoder::{self, XmlBlock};

/// Tunables for the pipeline.
#[derive(Debug, Clone)]
pub struct Config {
    pub scan_budget: std::time::Duration,
    pub reference_expansion_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            scan_budget: crate::scan::DEFAULT_SCAN_BUDGET,
            reference_expansion_depth: materializer::DEFAULT_REFERENCE_EXPANSION_DEPTH,
        }
    }
}

/// All intermediate state produced while running the pipeline, kept alive
/// together so later passes can cross-link against earlier ones.
pub struct Pipeline {
    pub fragments: Vec<DecompressedFragment>,
    pub reference_blocks: Vec<ReferenceBlock>,
    pub raw_blocks: Vec<RawBlock>,
    pub address_records: Vec<AddressRecord>,
    pub elements: Vec<ElementBlock>,
    pub xml_blocks: Vec<XmlBlock>,
}

impl Pipeline {
    /// Run every pass over `buf` in order, then materialize the final
    /// address stream.
    pub fn run(buf: &[u8], config: &Config) -> (Pipeline, Vec<Address>) {
        debug!(bytes = buf.len(), "starting extraction pipeline");
        let budget = ScanBudget(config.scan_budget);

        let fragments = fragments::extract_fragments(buf);
        debug!(count = fragments.len(), "pass 1: compressed-fragment extraction complete");

        let reference_blocks = reference_block::extract_reference_blocks(buf, &fragments, budget);
        debug!(count = reference_blocks.len(), "pass 2: reference-block resolution complete");

        let raw_scan = raw_block::extract_raw_blocks(buf, budget);
        debug!(
            blocks = raw_scan.blocks.len(),
            addresses = raw_scan.address_records.len(),
            "pass 3: raw-block extraction complete"
        );

        let mut elements = element_block::extract_element_blocks(buf, &raw_scan.blocks, &reference_blocks, budget);
        debug!(count = elements.len(), "pass 4: element-block extraction complete");

        let xml_blocks = xml_decoder::extract_xml_blocks(buf, &fragments, budget);
        debug!(count = xml_blocks.len(), "pass 5: XML decoding complete");

        let xml_ids: Vec<String> = xml_blocks.iter().map(|b| b.id.clone()).collect();
        element_block::link_xml_blocks(&mut elements, &xml_ids);

        let addresses = materializer::materialize(&elements, &xml_blocks, config.reference_expansion_depth);
        debug!(count = addresses.len(), "pass 6: address materialization complete");

        let pipeline = Pipeline {
            fragments,
            reference_blocks,
            raw_blocks: raw_scan.blocks,
            address_records: raw_scan.address_records,
            elements,
            xml_blocks,
        };
        (pipeline, addresses)
    }
}
