// Author: Lukas Bower

//! End-to-end memory map decode over synthetic device tree blobs.

use dtb_membanks::{
    populate_memory_banks, ram_size_from_dtb, BankTable, DecodeError, MemoryBank, MemoryMapError,
    WidthError, MAX_MEMORY_BANKS,
};

const FDT_MAGIC: u32 = 0xD00D_FEED;
const FDT_HEADER_LEN: usize = 40;
const FDT_BEGIN_NODE: u32 = 1;
const FDT_END_NODE: u32 = 2;
const FDT_PROP: u32 = 3;
const FDT_END: u32 = 9;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct BlobBuilder {
    structure: Vec<u8>,
    strings: Vec<u8>,
}

impl BlobBuilder {
    fn new() -> Self {
        Self {
            structure: Vec::new(),
            strings: Vec::new(),
        }
    }

    fn push_token(&mut self, token: u32) {
        self.structure.extend_from_slice(&token.to_be_bytes());
    }

    fn pad(&mut self) {
        while self.structure.len() % 4 != 0 {
            self.structure.push(0);
        }
    }

    fn begin_node(&mut self, name: &str) -> &mut Self {
        self.push_token(FDT_BEGIN_NODE);
        self.structure.extend_from_slice(name.as_bytes());
        self.structure.push(0);
        self.pad();
        self
    }

    fn end_node(&mut self) -> &mut Self {
        self.push_token(FDT_END_NODE);
        self
    }

    fn prop(&mut self, name: &str, value: &[u8]) -> &mut Self {
        let name_offset = self.strings.len();
        self.strings.extend_from_slice(name.as_bytes());
        self.strings.push(0);

        self.push_token(FDT_PROP);
        self.push_token(u32::try_from(value.len()).unwrap());
        self.push_token(u32::try_from(name_offset).unwrap());
        self.structure.extend_from_slice(value);
        self.pad();
        self
    }

    fn prop_cells(&mut self, name: &str, cells: &[u32]) -> &mut Self {
        let bytes: Vec<u8> = cells.iter().flat_map(|cell| cell.to_be_bytes()).collect();
        self.prop(name, &bytes)
    }

    fn finish(mut self) -> Vec<u8> {
        const RSVMAP_LEN: usize = 16;
        self.push_token(FDT_END);

        let off_dt_struct = FDT_HEADER_LEN + RSVMAP_LEN;
        let off_dt_strings = off_dt_struct + self.structure.len();
        let totalsize = off_dt_strings + self.strings.len();

        let mut blob = Vec::with_capacity(totalsize);
        for word in [
            FDT_MAGIC,
            u32::try_from(totalsize).unwrap(),
            u32::try_from(off_dt_struct).unwrap(),
            u32::try_from(off_dt_strings).unwrap(),
            u32::try_from(FDT_HEADER_LEN).unwrap(),
            17, // version
            16, // last compatible version
            0,  // boot cpu
            u32::try_from(self.strings.len()).unwrap(),
            u32::try_from(self.structure.len()).unwrap(),
        ] {
            blob.extend_from_slice(&word.to_be_bytes());
        }
        blob.resize(blob.len() + RSVMAP_LEN, 0);
        blob.extend_from_slice(&self.structure);
        blob.extend_from_slice(&self.strings);
        blob
    }
}

/// Builds a blob whose root declares the given widths and whose memory
/// node carries the given `reg` cells.
fn memory_blob(widths: Option<(u32, u32)>, node_name: &str, reg_cells: &[u32]) -> Vec<u8> {
    let mut builder = BlobBuilder::new();
    builder.begin_node("");
    if let Some((address_cells, size_cells)) = widths {
        builder.prop_cells("#address-cells", &[address_cells]);
        builder.prop_cells("#size-cells", &[size_cells]);
    }
    builder.begin_node(node_name);
    builder.prop("device_type", b"memory\0");
    builder.prop_cells("reg", reg_cells);
    builder.end_node();
    builder.end_node();
    builder.finish()
}

#[test]
fn populates_two_banks_in_blob_order() {
    init_logs();
    let blob = memory_blob(
        Some((1, 1)),
        "memory",
        &[0x1000_0000, 0x0800_0000, 0x2000_0000, 0x0800_0000],
    );

    let mut table = BankTable::new();
    populate_memory_banks(&blob, &mut table).expect("blob decodes");

    assert_eq!(
        table.banks(),
        &[
            MemoryBank {
                base: 0x1000_0000,
                size: 0x0800_0000
            },
            MemoryBank {
                base: 0x2000_0000,
                size: 0x0800_0000
            },
        ]
    );
}

#[test]
fn applies_devicetree_defaults_when_metadata_absent() {
    // No #address-cells/#size-cells: the device tree defaults (2, 1)
    // govern the decode.
    let blob = memory_blob(None, "memory", &[0x0000_0000, 0x0000_0000, 0x4000_0000]);

    let mut table = BankTable::new();
    populate_memory_banks(&blob, &mut table).expect("defaults apply");

    assert_eq!(table.len(), 1);
    assert_eq!(table.get(0), Some(&MemoryBank { base: 0, size: 0x4000_0000 }));
}

#[test]
fn finds_memory_node_with_unit_address() {
    let blob = memory_blob(Some((2, 2)), "memory@80000000", &[0, 0x8000_0000, 0, 0x4000_0000]);

    let mut table = BankTable::new();
    populate_memory_banks(&blob, &mut table).expect("unit address matches");

    assert_eq!(
        table.get(0),
        Some(&MemoryBank {
            base: 0x8000_0000,
            size: 0x4000_0000
        })
    );
}

#[test]
fn stale_entries_never_survive_a_shorter_decode() {
    init_logs();
    let wide = memory_blob(
        Some((1, 1)),
        "memory",
        &[0x1000_0000, 0x0800_0000, 0x2000_0000, 0x0800_0000],
    );
    let narrow = memory_blob(Some((1, 1)), "memory", &[0x3000_0000, 0x0400_0000]);

    let mut table = BankTable::new();
    populate_memory_banks(&wide, &mut table).expect("first decode");
    assert_eq!(table.len(), 2);

    populate_memory_banks(&narrow, &mut table).expect("second decode");
    assert_eq!(table.len(), 1);
    assert_eq!(table.get(1), None);
    assert_eq!(
        table.get(0),
        Some(&MemoryBank {
            base: 0x3000_0000,
            size: 0x0400_0000
        })
    );
}

#[test]
fn failure_leaves_destination_untouched() {
    let good = memory_blob(
        Some((1, 1)),
        "memory",
        &[0x1000_0000, 0x0800_0000, 0x2000_0000, 0x0800_0000],
    );
    // Three cells at unit size two: misaligned.
    let bad = memory_blob(Some((1, 1)), "memory", &[1, 2, 3]);

    let mut table = BankTable::new();
    populate_memory_banks(&good, &mut table).expect("good blob decodes");
    let before = table.clone();

    let err = populate_memory_banks(&bad, &mut table).expect_err("misaligned blob fails");
    assert_eq!(
        err,
        MemoryMapError::Decode(DecodeError::MisalignedCellCount {
            len: 3,
            unit_size: 2
        })
    );
    assert_eq!(table, before);
}

#[test]
fn overflow_is_reported_not_truncated() {
    let cells: Vec<u32> = (0..=MAX_MEMORY_BANKS as u32)
        .flat_map(|bank| [bank * 0x1000_0000, 0x1000_0000])
        .collect();
    let blob = memory_blob(Some((1, 1)), "memory", &cells);

    let mut table = BankTable::new();
    let err = populate_memory_banks(&blob, &mut table).expect_err("too many banks");

    assert_eq!(
        err,
        MemoryMapError::Decode(DecodeError::BankTableOverflow {
            decoded: MAX_MEMORY_BANKS + 1,
            capacity: MAX_MEMORY_BANKS
        })
    );
    assert!(table.is_empty());
}

#[test]
fn missing_memory_node_is_fatal() {
    let mut builder = BlobBuilder::new();
    builder.begin_node("");
    builder.begin_node("chosen");
    builder.end_node();
    builder.end_node();
    let blob = builder.finish();

    let mut table = BankTable::new();
    assert_eq!(
        populate_memory_banks(&blob, &mut table),
        Err(MemoryMapError::MissingMemoryNode)
    );
}

#[test]
fn missing_reg_property_is_fatal() {
    let mut builder = BlobBuilder::new();
    builder.begin_node("");
    builder.begin_node("memory");
    builder.prop("device_type", b"memory\0");
    builder.end_node();
    builder.end_node();
    let blob = builder.finish();

    let mut table = BankTable::new();
    assert_eq!(
        populate_memory_banks(&blob, &mut table),
        Err(MemoryMapError::MissingRegProperty)
    );
}

#[test]
fn rejects_width_outside_supported_range() {
    let blob = memory_blob(Some((3, 1)), "memory", &[0, 0, 0x4000_0000]);

    let mut table = BankTable::new();
    assert_eq!(
        populate_memory_banks(&blob, &mut table),
        Err(MemoryMapError::Widths(WidthError::OutOfRange {
            name: "#address-cells",
            value: 3
        }))
    );
}

#[test]
fn rejects_short_width_property() {
    let mut builder = BlobBuilder::new();
    builder.begin_node("");
    builder.prop("#address-cells", &2u32.to_be_bytes());
    builder.prop("#size-cells", &[0, 1]);
    builder.begin_node("memory");
    builder.prop_cells("reg", &[0, 0, 0x4000_0000]);
    builder.end_node();
    builder.end_node();
    let blob = builder.finish();

    let mut table = BankTable::new();
    assert_eq!(
        populate_memory_banks(&blob, &mut table),
        Err(MemoryMapError::Widths(WidthError::BadLength {
            name: "#size-cells",
            len: 2
        }))
    );
}

#[test]
fn garbage_blob_is_a_parse_error() {
    let mut table = BankTable::new();
    let err = populate_memory_banks(&[0u8; 64], &mut table).expect_err("not a blob");
    assert!(matches!(err, MemoryMapError::Parse(_)));
}

#[test]
fn ram_size_reports_first_bank() {
    let blob = memory_blob(
        Some((1, 1)),
        "memory",
        &[0x1000_0000, 0x0800_0000, 0x2000_0000, 0x1000_0000],
    );
    assert_eq!(ram_size_from_dtb(&blob), Ok(0x0800_0000));
}
