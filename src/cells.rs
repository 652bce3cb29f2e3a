// Author: Lukas Bower

//! Cell-width resolution for `reg`-style properties.
//!
//! The number of 32-bit cells composing one address or size value is
//! declared by the parent node's `#address-cells` and `#size-cells`
//! properties. When a property is absent the device tree specification
//! defaults apply: two address cells, one size cell.

use core::fmt;

use crate::dtb::{Node, ParseError, CELL_BYTES};

/// Default `#address-cells` per the device tree specification.
pub const DEFAULT_ADDRESS_CELLS: u8 = 2;
/// Default `#size-cells` per the device tree specification.
pub const DEFAULT_SIZE_CELLS: u8 = 1;

/// Number of cells encoding one address and one size value respectively.
///
/// Derived once per decode and immutable for the call's duration. Each
/// width is 1 or 2, i.e. a 32-bit or 64-bit value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellWidths {
    /// Cells per address value.
    pub address_cells: u8,
    /// Cells per size value.
    pub size_cells: u8,
}

impl CellWidths {
    /// Total cells per (address, size) unit.
    #[must_use]
    pub const fn unit_cells(&self) -> usize {
        self.address_cells as usize + self.size_cells as usize
    }
}

/// Failures while resolving cell widths from parent-node metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WidthError {
    /// Structural failure while walking the parent node.
    Parse(ParseError),
    /// Metadata property present with the wrong byte length.
    BadLength {
        /// Property name.
        name: &'static str,
        /// Observed payload length in bytes.
        len: usize,
    },
    /// Cell count outside the supported {1, 2} range.
    OutOfRange {
        /// Property name.
        name: &'static str,
        /// Observed cell count.
        value: u32,
    },
}

impl fmt::Display for WidthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(err) => write!(f, "{err}"),
            Self::BadLength { name, len } => {
                write!(f, "{name} has {len} byte(s), expected {CELL_BYTES}")
            }
            Self::OutOfRange { name, value } => {
                write!(f, "{name} is {value}, expected 1 or 2")
            }
        }
    }
}

impl From<ParseError> for WidthError {
    fn from(err: ParseError) -> Self {
        Self::Parse(err)
    }
}

/// Resolves the cell widths governing a node's children.
///
/// `parent` is the parent of the node whose `reg` property is being
/// decoded; its metadata defines the address space of every child.
pub fn widths_for_children(parent: &Node<'_>) -> Result<CellWidths, WidthError> {
    let address_cells = width_property(parent, "#address-cells", DEFAULT_ADDRESS_CELLS)?;
    let size_cells = width_property(parent, "#size-cells", DEFAULT_SIZE_CELLS)?;
    Ok(CellWidths {
        address_cells,
        size_cells,
    })
}

fn width_property(parent: &Node<'_>, name: &'static str, default: u8) -> Result<u8, WidthError> {
    let raw = match parent.property(name)? {
        Some(raw) => raw,
        None => return Ok(default),
    };
    if raw.len() != CELL_BYTES {
        return Err(WidthError::BadLength {
            name,
            len: raw.len(),
        });
    }
    match u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) {
        value @ (1 | 2) => Ok(value as u8),
        value => Err(WidthError::OutOfRange { name, value }),
    }
}
