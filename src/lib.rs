// Author: Lukas Bower
#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]
#![deny(unsafe_op_in_unsafe_fn)]
#![deny(deprecated)]
#![warn(missing_docs)]

//! Early bring-up decoding of a device tree memory node into a fixed
//! capacity bank table.
//!
//! The crate reads the `reg` property of the blob's memory node at the
//! cell widths declared by the node's parent and reconstructs a validated
//! table of (base, size) memory banks. Every failure here is fatal to
//! boot: the caller halts and reports through its early diagnostic
//! channel rather than continue with an unknown memory map.

/// Flattened device-tree reader: header validation, structure traversal,
/// node and property lookup.
pub mod dtb;

/// Cell-width resolution from `#address-cells`/`#size-cells` metadata.
pub mod cells;

/// Memory-bank records and the pure `reg` decoder.
pub mod banks;

/// Decode-and-populate entry point for board bring-up.
pub mod board;

pub use banks::{decode, BankTable, DecodeError, MemoryBank, MAX_MEMORY_BANKS};
pub use board::{populate_memory_banks, ram_size_from_dtb, MemoryMapError, MEMORY_NODE_PATH};
pub use cells::{widths_for_children, CellWidths, WidthError};
pub use dtb::{parse_dtb, Dtb, Node, ParseError};
