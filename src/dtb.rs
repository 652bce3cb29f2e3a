// Author: Lukas Bower

//! Flattened device-tree reader used during early bring-up: header
//! validation, structure-block traversal, and node/property lookup.
//!
//! Only what the memory-map decode needs is implemented. The blob is
//! borrowed and nothing is copied; lookups walk the structure block on
//! demand.

use core::fmt;
use core::mem::size_of;
use core::ops::Range;
use core::str;

/// Size in bytes of one device-tree cell.
pub const CELL_BYTES: usize = size_of::<u32>();

const FDT_MAGIC: u32 = 0xD00D_FEED;
const FDT_HEADER_LEN: usize = 10 * size_of::<u32>();
const FDT_PROP_MAX_LEN: usize = 64 * 1024; // reg-style properties are small

const FDT_BEGIN_NODE: u32 = 0x0000_0001;
const FDT_END_NODE: u32 = 0x0000_0002;
const FDT_PROP: u32 = 0x0000_0003;
const FDT_NOP: u32 = 0x0000_0004;
const FDT_END: u32 = 0x0000_0009;

/// Errors encountered while reading the device tree blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// The blob was shorter than the minimum FDT header length.
    TooShort,
    /// The blob did not begin with the `0xd00dfeed` magic value.
    BadMagic,
    /// Reported offsets or lengths exceeded the declared blob length.
    Bounds,
    /// The structure block ended mid-token.
    Truncated,
    /// A string was missing its terminating null byte.
    UnterminatedString,
    /// A string could not be converted from UTF-8.
    BadString,
    /// A property declared an excessively large payload.
    PropertyTooLarge,
    /// An unexpected structure token was encountered.
    InvalidToken(u32),
    /// The structure block terminated while nodes were still open.
    UnexpectedEnd,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort => write!(f, "blob shorter than FDT header"),
            Self::BadMagic => write!(f, "FDT magic mismatch"),
            Self::Bounds => write!(f, "FDT section exceeds blob bounds"),
            Self::Truncated => write!(f, "FDT structure block truncated"),
            Self::UnterminatedString => write!(f, "FDT string missing terminator"),
            Self::BadString => write!(f, "FDT string invalid UTF-8"),
            Self::PropertyTooLarge => write!(f, "FDT property too large"),
            Self::InvalidToken(token) => write!(f, "FDT token 0x{token:08x} invalid"),
            Self::UnexpectedEnd => write!(f, "FDT structure ended prematurely"),
        }
    }
}

/// Validated view of a device tree blob.
pub struct Dtb<'a> {
    blob: &'a [u8],
    structure: Range<usize>,
    strings: Range<usize>,
}

impl<'a> Dtb<'a> {
    /// Total length of the blob in bytes, as declared by its header.
    #[must_use]
    pub fn totalsize(&self) -> usize {
        self.blob.len()
    }

    /// Returns the structure block slice.
    #[must_use]
    pub fn structure_block(&self) -> &'a [u8] {
        &self.blob[self.structure.clone()]
    }

    /// Returns the strings block slice.
    #[must_use]
    pub fn strings_block(&self) -> &'a [u8] {
        &self.blob[self.strings.clone()]
    }

    /// Looks up a node by absolute path, e.g. `/memory`.
    ///
    /// A path component without a unit address matches a node name with one,
    /// so `/memory` finds `memory@80000000`. Absence is reported as `None`;
    /// only structural damage is an error.
    pub fn find_node(&self, path: &str) -> Result<Option<Node<'a>>, ParseError> {
        let want = component_count(path);
        let mut cursor = self.structure_cursor();
        let mut depth = 0usize;
        let mut matched = 0usize;

        while let Some(item) = cursor.next()? {
            match item {
                StructureItem::BeginNode(name) => {
                    depth += 1;
                    if depth == 1 {
                        // Root node matches the empty path.
                        if want == 0 {
                            return Ok(Some(self.node_at(cursor.offset())));
                        }
                    } else if matched == depth - 2 {
                        let component = nth_component(path, depth - 2);
                        if component.is_some_and(|c| node_name_matches(c, name)) {
                            matched = depth - 1;
                            if matched == want {
                                return Ok(Some(self.node_at(cursor.offset())));
                            }
                        }
                    }
                }
                StructureItem::EndNode => {
                    depth -= 1;
                    matched = matched.min(depth.saturating_sub(1));
                }
                StructureItem::Property { .. } => {}
            }
        }
        Ok(None)
    }

    /// Returns a cursor over the structure block tokens.
    #[must_use]
    pub fn structure_cursor(&self) -> StructureCursor<'a> {
        StructureCursor::new(self.structure_block(), self.strings_block())
    }

    fn node_at(&self, body: usize) -> Node<'a> {
        Node {
            structure: self.structure_block(),
            strings: self.strings_block(),
            body,
        }
    }
}

/// Borrowed view of a single node inside the structure block.
pub struct Node<'a> {
    structure: &'a [u8],
    strings: &'a [u8],
    body: usize,
}

impl<'a> Node<'a> {
    /// Looks up a property by name directly on this node.
    ///
    /// Properties of child nodes are skipped. Absence is reported as `None`.
    pub fn property(&self, name: &str) -> Result<Option<&'a [u8]>, ParseError> {
        let mut cursor = StructureCursor::resume(self.structure, self.strings, self.body);
        let mut depth = 1usize;

        while let Some(item) = cursor.next()? {
            match item {
                StructureItem::BeginNode(_) => depth += 1,
                StructureItem::EndNode => {
                    if depth == 1 {
                        return Ok(None);
                    }
                    depth -= 1;
                }
                StructureItem::Property { name: found, value } => {
                    if depth == 1 && found == name {
                        return Ok(Some(value));
                    }
                }
            }
        }
        Ok(None)
    }
}

fn component_count(path: &str) -> usize {
    path.split('/').filter(|c| !c.is_empty()).count()
}

fn nth_component(path: &str, index: usize) -> Option<&str> {
    path.split('/').filter(|c| !c.is_empty()).nth(index)
}

/// Matches a path component against a node name per the usual device tree
/// rule: a component without a unit address ignores the name's `@unit`
/// suffix, a component with one must match exactly.
fn node_name_matches(component: &str, name: &str) -> bool {
    if component.contains('@') {
        return component == name;
    }
    match name.split_once('@') {
        Some((base, _)) => base == component,
        None => name == component,
    }
}

fn read_be_u32(blob: &[u8], offset: usize) -> Result<u32, ParseError> {
    let end = offset.checked_add(CELL_BYTES).ok_or(ParseError::Bounds)?;
    if end > blob.len() {
        return Err(ParseError::TooShort);
    }
    let bytes = &blob[offset..end];
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn bounded_range(len: usize, offset: u32, size: u32) -> Result<Range<usize>, ParseError> {
    let start = usize::try_from(offset).map_err(|_| ParseError::Bounds)?;
    let span = usize::try_from(size).map_err(|_| ParseError::Bounds)?;
    let end = start.checked_add(span).ok_or(ParseError::Bounds)?;
    if end > len {
        return Err(ParseError::Bounds);
    }
    Ok(start..end)
}

/// Validates the FDT header and returns a bounded view of the blob.
pub fn parse_dtb(blob: &[u8]) -> Result<Dtb<'_>, ParseError> {
    if blob.len() < FDT_HEADER_LEN {
        return Err(ParseError::TooShort);
    }
    if read_be_u32(blob, 0)? != FDT_MAGIC {
        return Err(ParseError::BadMagic);
    }

    let totalsize = read_be_u32(blob, 4)?;
    let off_dt_struct = read_be_u32(blob, 8)?;
    let off_dt_strings = read_be_u32(blob, 12)?;
    let size_dt_strings = read_be_u32(blob, 32)?;
    let size_dt_struct = read_be_u32(blob, 36)?;

    let blob_len = usize::try_from(totalsize).map_err(|_| ParseError::Bounds)?;
    if blob_len < FDT_HEADER_LEN || blob_len > blob.len() {
        return Err(ParseError::Bounds);
    }

    let structure = bounded_range(blob_len, off_dt_struct, size_dt_struct)?;
    let strings = bounded_range(blob_len, off_dt_strings, size_dt_strings)?;

    Ok(Dtb {
        blob: &blob[..blob_len],
        structure,
        strings,
    })
}

fn read_cstr<'a>(blob: &'a [u8], offset: usize) -> Result<&'a str, ParseError> {
    if offset >= blob.len() {
        return Err(ParseError::Bounds);
    }
    let tail = &blob[offset..];
    let len = tail
        .iter()
        .position(|&byte| byte == 0)
        .ok_or(ParseError::UnterminatedString)?;
    str::from_utf8(&tail[..len]).map_err(|_| ParseError::BadString)
}

/// Iterator over the structure block tokens.
pub struct StructureCursor<'a> {
    structure: &'a [u8],
    strings: &'a [u8],
    offset: usize,
    depth: usize,
    finished: bool,
}

/// Tokens yielded by [`StructureCursor`].
#[derive(Debug, PartialEq, Eq)]
pub enum StructureItem<'a> {
    /// A new node has begun with the provided name.
    BeginNode(&'a str),
    /// A node has ended.
    EndNode,
    /// A property with a resolved name and payload.
    Property {
        /// Property name from the strings block.
        name: &'a str,
        /// Raw property payload.
        value: &'a [u8],
    },
}

impl<'a> StructureCursor<'a> {
    fn new(structure: &'a [u8], strings: &'a [u8]) -> Self {
        Self {
            structure,
            strings,
            offset: 0,
            depth: 0,
            finished: false,
        }
    }

    /// Resumes traversal from inside a node body, one level deep.
    fn resume(structure: &'a [u8], strings: &'a [u8], offset: usize) -> Self {
        Self {
            structure,
            strings,
            offset,
            depth: 1,
            finished: false,
        }
    }

    /// Current byte offset within the structure block.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Returns the next structure item or `None` when the stream has ended.
    pub fn next(&mut self) -> Result<Option<StructureItem<'a>>, ParseError> {
        loop {
            if self.finished {
                return Ok(None);
            }

            match self.take_u32()? {
                FDT_NOP => continue,
                FDT_BEGIN_NODE => {
                    let name = self.take_name()?;
                    self.depth = self.depth.checked_add(1).ok_or(ParseError::Bounds)?;
                    return Ok(Some(StructureItem::BeginNode(name)));
                }
                FDT_END_NODE => {
                    if self.depth == 0 {
                        return Err(ParseError::UnexpectedEnd);
                    }
                    self.depth -= 1;
                    return Ok(Some(StructureItem::EndNode));
                }
                FDT_PROP => return self.take_property().map(Some),
                FDT_END => {
                    if self.depth != 0 {
                        return Err(ParseError::UnexpectedEnd);
                    }
                    self.finished = true;
                    return Ok(None);
                }
                other => return Err(ParseError::InvalidToken(other)),
            }
        }
    }

    fn take_u32(&mut self) -> Result<u32, ParseError> {
        let end = self.offset.checked_add(CELL_BYTES).ok_or(ParseError::Bounds)?;
        if end > self.structure.len() {
            return Err(ParseError::Truncated);
        }
        let bytes = &self.structure[self.offset..end];
        self.offset = end;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn take_name(&mut self) -> Result<&'a str, ParseError> {
        let name = read_cstr(self.structure, self.offset).map_err(|err| match err {
            ParseError::Bounds => ParseError::Truncated,
            other => other,
        })?;
        let after_null = self
            .offset
            .checked_add(name.len())
            .and_then(|end| end.checked_add(1))
            .ok_or(ParseError::Bounds)?;
        self.align_to(after_null)?;
        Ok(name)
    }

    fn take_property(&mut self) -> Result<StructureItem<'a>, ParseError> {
        let len = usize::try_from(self.take_u32()?).map_err(|_| ParseError::Bounds)?;
        let name_offset = usize::try_from(self.take_u32()?).map_err(|_| ParseError::Bounds)?;
        if len > FDT_PROP_MAX_LEN {
            return Err(ParseError::PropertyTooLarge);
        }

        let end = self.offset.checked_add(len).ok_or(ParseError::Bounds)?;
        if end > self.structure.len() {
            return Err(ParseError::Truncated);
        }
        let value = &self.structure[self.offset..end];
        let name = read_cstr(self.strings, name_offset)?;
        self.align_to(end)?;
        Ok(StructureItem::Property { name, value })
    }

    fn align_to(&mut self, value: usize) -> Result<(), ParseError> {
        let mask = CELL_BYTES - 1;
        let aligned = value.checked_add(mask).ok_or(ParseError::Bounds)? & !mask;
        if aligned > self.structure.len() {
            return Err(ParseError::Truncated);
        }
        self.offset = aligned;
        Ok(())
    }
}
