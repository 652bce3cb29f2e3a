// Author: Lukas Bower

//! Memory-bank records and the pure `reg`-property decoder.
//!
//! The decoder is a stateless, single-pass transform: it walks the raw
//! cell sequence in (address, size) units, reassembles each value from its
//! big-endian cells, and emits a fixed-capacity table of banks preserving
//! the blob's declared order. Any failure is fatal to boot and propagates
//! to the caller; there is no partial output.

use core::fmt;

use heapless::Vec;
use static_assertions::const_assert;

use crate::cells::CellWidths;
use crate::dtb::CELL_BYTES;

/// Compile-time capacity of [`BankTable`].
pub const MAX_MEMORY_BANKS: usize = 4;

const_assert!(MAX_MEMORY_BANKS >= 1);

/// One contiguous physical-memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBank {
    /// Physical base address.
    pub base: u64,
    /// Region size in bytes. Zero-size banks are degenerate but legal;
    /// downstream consumers decide whether to skip them.
    pub size: u64,
}

/// Fixed-capacity ordered table of memory banks.
///
/// Populated exactly once per boot by the decode path and read-only
/// thereafter. Bank order mirrors the blob's declared enumeration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BankTable {
    banks: Vec<MemoryBank, MAX_MEMORY_BANKS>,
}

impl BankTable {
    /// Maximum number of banks the table can hold.
    pub const CAPACITY: usize = MAX_MEMORY_BANKS;

    /// Creates an empty table.
    #[must_use]
    pub const fn new() -> Self {
        Self { banks: Vec::new() }
    }

    /// Number of decoded banks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.banks.len()
    }

    /// Whether the table holds no banks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.banks.is_empty()
    }

    /// Returns the bank at `index`, if present.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&MemoryBank> {
        self.banks.get(index)
    }

    /// Returns the decoded banks in blob order.
    #[must_use]
    pub fn banks(&self) -> &[MemoryBank] {
        self.banks.as_slice()
    }

    /// Removes all banks.
    pub fn clear(&mut self) {
        self.banks.clear();
    }

    /// Sum of all bank sizes, saturating at `u64::MAX`.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.banks
            .iter()
            .fold(0u64, |total, bank| total.saturating_add(bank.size))
    }

    /// Size of the first bank, or zero when the table is empty.
    ///
    /// Board bring-up reports this as the usable RAM size.
    #[must_use]
    pub fn first_bank_size(&self) -> u64 {
        self.banks.first().map_or(0, |bank| bank.size)
    }
}

/// Failures while decoding a `reg` payload into a bank table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Cell count is not a whole number of (address, size) units. Silent
    /// misalignment would reinterpret size words as addresses, so this is
    /// checked before anything else.
    MisalignedCellCount {
        /// Observed cell count.
        len: usize,
        /// Cells per (address, size) unit.
        unit_size: usize,
    },
    /// More banks decoded than the fixed table can hold. Truncating would
    /// understate physical memory, so the decode fails instead.
    BankTableOverflow {
        /// Number of banks the payload describes.
        decoded: usize,
        /// Table capacity.
        capacity: usize,
    },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MisalignedCellCount { len, unit_size } => {
                write!(f, "reg holds {len} cell(s), not a multiple of {unit_size}")
            }
            Self::BankTableOverflow { decoded, capacity } => {
                write!(f, "reg describes {decoded} bank(s), table holds {capacity}")
            }
        }
    }
}

/// Decodes a `reg` property payload into a bank table.
///
/// `reg` is the raw payload as stored in the blob: a sequence of 32-bit
/// big-endian cells. Each cell is byte-swapped to host order and values
/// wider than one cell are reassembled most significant cell first, per
/// the device tree encoding.
pub fn decode(widths: CellWidths, reg: &[u8]) -> Result<BankTable, DecodeError> {
    debug_assert!(matches!(widths.address_cells, 1 | 2));
    debug_assert!(matches!(widths.size_cells, 1 | 2));

    let unit_size = widths.unit_cells();
    let len = reg.len() / CELL_BYTES;
    if reg.len() % CELL_BYTES != 0 || len % unit_size != 0 {
        return Err(DecodeError::MisalignedCellCount { len, unit_size });
    }

    let decoded = len / unit_size;
    if decoded > BankTable::CAPACITY {
        return Err(DecodeError::BankTableOverflow {
            decoded,
            capacity: BankTable::CAPACITY,
        });
    }

    let mut table = BankTable::new();
    let mut cell = 0usize;
    for _ in 0..decoded {
        let base = combine(reg, cell, widths.address_cells);
        cell += widths.address_cells as usize;
        let size = combine(reg, cell, widths.size_cells);
        cell += widths.size_cells as usize;
        // Capacity verified against the decoded unit count above.
        let _ = table.banks.push(MemoryBank { base, size });
    }
    Ok(table)
}

fn combine(reg: &[u8], cell: usize, count: u8) -> u64 {
    let mut value = 0u64;
    for offset in 0..count as usize {
        let at = (cell + offset) * CELL_BYTES;
        let word = u32::from_be_bytes([reg[at], reg[at + 1], reg[at + 2], reg[at + 3]]);
        value = (value << 32) | u64::from(word);
    }
    value
}
