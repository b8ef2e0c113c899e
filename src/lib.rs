#![forbid(unsafe_code)]

//! # plf-extract
//!
//! A Rust library for extracting PLC block reference addresses from Siemens
//! TIA Portal project container files (`.plf`).
//!
//! The container is an opaque, append-mostly binary log: interleaved raw
//! records describing blocks (Data Block, Function Block, Function,
//! Organization Block, User-Defined Type), zlib-compressed XML fragments
//! describing block members and types, and small structured markers tying
//! block names to numeric addresses. This crate walks those raw bytes,
//! harvests every record relevant to data-block addressability, and emits
//! for each reachable datum a fully qualified symbolic name plus a
//! hexadecimal reference address.
//!
//! ## Pipeline
//!
//! Extraction runs as six ordered passes over one immutable input buffer,
//! driven by [`pipeline::Pipeline`]:
//!
//! 1. [`fragments`] — locate and decompress embedded zlib XML fragments.
//! 2. [`reference_block`] — resolve `IdentXmlPart` identity records.
//! 3. [`raw_block`] — find block headers and `%DB`/`PLUSBLOCK` address tokens.
//! 4. [`element_block`] — find and cross-link `BIVE:`/`BI:` element headers.
//! 5. [`xml_decoder`] — decode every `<Root>`/`<Member>` XML tree.
//! 6. [`materializer`] — build the `PlcItem` tree and flatten it to addresses.
//!
//! ## Quick Start
//!
//! ```no_run
//! use plf_extract::{Config, Pipeline};
//!
//! fn main() -> std::io::Result<()> {
//!     let bytes = std::fs::read("project.plf")?;
//!     let (_pipeline, addresses) = Pipeline::run(&bytes, &Config::default());
//!     for address in &addresses {
//!         println!("{}, {}", address.name, address.reference_address);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`bytes`] | Panic-free byte-buffer readers |
//! | [`scan`] | Time-bounded `regex::bytes` scanning |
//! | [`inflate`] | Streaming zlib decompression |
//! | [`fragments`] | Pass 1: compressed-fragment extraction |
//! | [`reference_block`] | Pass 2: reference-block resolution |
//! | [`raw_block`] | Pass 3: raw-block extraction |
//! | [`element_block`] | Pass 4: element-block extraction & linking |
//! | [`xml_decoder`] | Pass 5: XML decoding |
//! | [`materializer`] | Pass 6: address materialization |
//! | [`pipeline`] | Driver sequencing all six passes |
//! | [`error`] | Error types and [`Result`] alias |
//!
//! ## Error Handling
//!
//! Per-record failures never abort a pass: they are caught, logged at
//! `tracing::warn!` with the offending byte offset, and the pass moves on to
//! its next candidate record. Only an I/O failure opening the input file
//! reaches the caller as an `Err`.

pub mod bytes;
pub mod error;
pub mod inflate;
pub mod scan;

pub mod element_block;
pub mod fragments;
pub mod materializer;
pub mod pipeline;
pub mod raw_block;
pub mod reference_block;
pub mod xml_decoder;

pub use error::{Error, Result};
pub use materializer::Address;
pub use pipeline::{Config, Pipeline};
