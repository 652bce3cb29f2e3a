// Author: Lukas Bower

//! Decode-and-populate entry point for the board's memory bank table.
//!
//! This runs exactly once, early in single-threaded bring-up. The caller
//! owns the destination table and passes it by mutable reference, making
//! the single-writer, write-once contract explicit. On any failure the
//! destination is left untouched and the caller is expected to halt
//! initialization: a wrong memory map poisons everything downstream.

use core::fmt;

use log::{debug, info};

use crate::banks::{self, BankTable, DecodeError};
use crate::cells::{self, WidthError};
use crate::dtb::{parse_dtb, ParseError};

/// Path of the node describing physical memory.
pub const MEMORY_NODE_PATH: &str = "/memory";

const REG_PROPERTY: &str = "reg";

/// Boot-fatal failures while building the memory map from the blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryMapError {
    /// Structural failure in the blob itself.
    Parse(ParseError),
    /// The blob has no memory node.
    MissingMemoryNode,
    /// The memory node has no `reg` property.
    MissingRegProperty,
    /// Malformed `#address-cells`/`#size-cells` metadata.
    Widths(WidthError),
    /// The `reg` payload could not be decoded.
    Decode(DecodeError),
}

impl fmt::Display for MemoryMapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(err) => write!(f, "malformed device tree: {err}"),
            Self::MissingMemoryNode => {
                write!(f, "malformed description: no {MEMORY_NODE_PATH} node")
            }
            Self::MissingRegProperty => {
                write!(f, "malformed description: memory node has no reg property")
            }
            Self::Widths(err) => write!(f, "malformed description: {err}"),
            Self::Decode(err) => write!(f, "{err}"),
        }
    }
}

impl From<ParseError> for MemoryMapError {
    fn from(err: ParseError) -> Self {
        Self::Parse(err)
    }
}

impl From<WidthError> for MemoryMapError {
    fn from(err: WidthError) -> Self {
        Self::Widths(err)
    }
}

impl From<DecodeError> for MemoryMapError {
    fn from(err: DecodeError) -> Self {
        Self::Decode(err)
    }
}

/// Decodes the memory node's `reg` property and fills `table` with the
/// resulting banks.
///
/// The destination is replaced wholesale on success, so stale entries
/// from an earlier fill never survive a shorter decode. On failure the
/// destination is left exactly as it was.
pub fn populate_memory_banks(blob: &[u8], table: &mut BankTable) -> Result<(), MemoryMapError> {
    let dtb = parse_dtb(blob)?;
    let node = dtb
        .find_node(MEMORY_NODE_PATH)?
        .ok_or(MemoryMapError::MissingMemoryNode)?;
    let parent = dtb
        .find_node(parent_path(MEMORY_NODE_PATH))?
        .ok_or(MemoryMapError::MissingMemoryNode)?;

    let widths = cells::widths_for_children(&parent)?;
    let reg = node
        .property(REG_PROPERTY)?
        .ok_or(MemoryMapError::MissingRegProperty)?;
    let decoded = banks::decode(widths, reg)?;

    for (index, bank) in decoded.banks().iter().enumerate() {
        debug!(
            "memory bank {index}: base {:#x} size {:#x}",
            bank.base, bank.size
        );
    }
    info!(
        "memory map: {} bank(s), {:#x} byte(s)",
        decoded.len(),
        decoded.total_bytes()
    );

    *table = decoded;
    Ok(())
}

/// Convenience for the classic `dram_init` contract: decodes the memory
/// node and returns the first bank's size.
pub fn ram_size_from_dtb(blob: &[u8]) -> Result<u64, MemoryMapError> {
    let mut table = BankTable::new();
    populate_memory_banks(blob, &mut table)?;
    Ok(table.first_bank_size())
}

fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(at) => &path[..at],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_of_top_level_node_is_root() {
        assert_eq!(parent_path("/memory"), "/");
        assert_eq!(parent_path("/"), "/");
    }

    #[test]
    fn parent_of_nested_node_drops_last_component() {
        assert_eq!(parent_path("/soc/memory"), "/soc");
    }

    #[test]
    fn errors_convert_into_memory_map_error() {
        let err: MemoryMapError = ParseError::BadMagic.into();
        assert_eq!(err, MemoryMapError::Parse(ParseError::BadMagic));

        let err: MemoryMapError = DecodeError::MisalignedCellCount {
            len: 3,
            unit_size: 4,
        }
        .into();
        assert!(matches!(err, MemoryMapError::Decode(_)));
    }
}
