//! Single byte pattern with wildcards and an embedded address
//!
//! A pattern is a flat list of [`PatternItem`]s. Literal bytes must match
//! exactly, `Any` skips one byte, `Address` skips one byte while capturing it
//! into the decoded address, and `AnyRepeating` skips zero or more bytes until
//! the remainder of the pattern matches.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::memory::ReadMemory;

/// Maximum number of address bytes a pattern may capture
pub const MAX_ADDRESS_BYTES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternItem {
    Byte(u8),
    Any,
    Address,
    AnyRepeating,
}

impl PatternItem {
    fn is_fixed_width(self) -> bool {
        !matches!(self, PatternItem::AnyRepeating)
    }
}

/// How the captured address bytes are laid out in the instruction stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressEncoding {
    Rel32,
    Rel64,
    Abs32,
    Abs64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressKind {
    pub encoding: AddressEncoding,
    /// The decoded address points at a pointer to the next entry, not the entry itself
    #[serde(default)]
    pub indirect: bool,
    /// The thunk jumps into a not-yet-compiled method's fixup routine
    #[serde(default)]
    pub precode_fixup: bool,
}

impl AddressKind {
    pub const fn new(encoding: AddressEncoding) -> Self {
        Self {
            encoding,
            indirect: false,
            precode_fixup: false,
        }
    }

    pub const fn indirect(mut self) -> Self {
        self.indirect = true;
        self
    }

    pub const fn precode_fixup(mut self) -> Self {
        self.precode_fixup = true;
        self
    }

    pub fn is_relative(&self) -> bool {
        matches!(self.encoding, AddressEncoding::Rel32 | AddressEncoding::Rel64)
    }

    pub fn is_precode_fixup(&self) -> bool {
        self.precode_fixup
    }

    pub fn is_indirect(&self) -> bool {
        self.indirect
    }

    /// Number of address bytes this encoding expects
    pub fn byte_len(&self) -> usize {
        match self.encoding {
            AddressEncoding::Rel32 | AddressEncoding::Abs32 => 4,
            AddressEncoding::Rel64 | AddressEncoding::Abs64 => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressMeaning {
    pub kind: AddressKind,
    /// Offset from the start of the match that relative addresses are measured from
    #[serde(default)]
    pub relative_to_offset: usize,
}

impl AddressMeaning {
    pub const fn new(kind: AddressKind) -> Self {
        Self {
            kind,
            relative_to_offset: 0,
        }
    }

    pub const fn relative_to(kind: AddressKind, relative_to_offset: usize) -> Self {
        Self {
            kind,
            relative_to_offset,
        }
    }

    /// Turn a raw captured address into the address it refers to.
    ///
    /// `entry` is the start of the scanned buffer and `match_offset` the offset
    /// of the match inside it. Indirect addresses are dereferenced through `memory`.
    pub fn process_address<M: ReadMemory + ?Sized>(
        &self,
        entry: usize,
        match_offset: usize,
        raw: u64,
        memory: &M,
    ) -> Result<usize> {
        let target = match self.kind.encoding {
            AddressEncoding::Abs32 => raw as u32 as usize,
            AddressEncoding::Abs64 => raw as usize,
            AddressEncoding::Rel32 => {
                let disp = raw as u32 as i32 as isize;
                self.relative_base(entry, match_offset).wrapping_add_signed(disp)
            }
            AddressEncoding::Rel64 => {
                let disp = raw as i64 as isize;
                self.relative_base(entry, match_offset).wrapping_add_signed(disp)
            }
        };

        if self.kind.indirect {
            memory.read_pointer(target)
        } else {
            Ok(target)
        }
    }

    fn relative_base(&self, entry: usize, match_offset: usize) -> usize {
        entry
            .wrapping_add(match_offset)
            .wrapping_add(self.relative_to_offset)
    }
}

/// Outcome of matching one pattern at one position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternHit {
    pub length: usize,
    pub address: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BytePattern {
    name: String,
    items: Vec<PatternItem>,
    meaning: AddressMeaning,
    must_match_at_start: bool,
    min_length: usize,
    address_bytes: usize,
    anchor: Option<(usize, u8)>,
}

impl BytePattern {
    pub fn new(
        name: impl Into<String>,
        meaning: AddressMeaning,
        must_match_at_start: bool,
        items: Vec<PatternItem>,
    ) -> Result<Self> {
        let name = name.into();

        if items.is_empty() {
            return Err(Error::InvalidPattern(format!("pattern '{}' is empty", name)));
        }

        let address_bytes = items
            .iter()
            .filter(|item| matches!(item, PatternItem::Address))
            .count();
        if address_bytes > MAX_ADDRESS_BYTES {
            return Err(Error::InvalidPattern(format!(
                "pattern '{}' captures {} address bytes (max {})",
                name, address_bytes, MAX_ADDRESS_BYTES
            )));
        }

        let min_length = items.iter().filter(|item| item.is_fixed_width()).count();
        if min_length == 0 {
            return Err(Error::InvalidPattern(format!(
                "pattern '{}' matches no bytes",
                name
            )));
        }

        // The anchor must sit at a fixed offset, so stop at the first repeating skip.
        let anchor = items
            .iter()
            .take_while(|item| item.is_fixed_width())
            .enumerate()
            .find_map(|(offset, item)| match item {
                PatternItem::Byte(value) => Some((offset, *value)),
                _ => None,
            });

        Ok(Self {
            name,
            items,
            meaning,
            must_match_at_start,
            min_length,
            address_bytes,
            anchor,
        })
    }

    /// Parse the text form (`"E9 %% %% %% %%"`) into a pattern
    pub fn parse(
        name: impl Into<String>,
        meaning: AddressMeaning,
        must_match_at_start: bool,
        text: &str,
    ) -> Result<Self> {
        let items = super::signature::parse_pattern(text)?;
        Self::new(name, meaning, must_match_at_start, items)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn items(&self) -> &[PatternItem] {
        &self.items
    }

    pub fn address_meaning(&self) -> AddressMeaning {
        self.meaning
    }

    pub fn must_match_at_start(&self) -> bool {
        self.must_match_at_start
    }

    pub fn min_length(&self) -> usize {
        self.min_length
    }

    pub fn address_bytes(&self) -> usize {
        self.address_bytes
    }

    /// Offset and value of the first literal byte reachable at a fixed offset
    pub fn first_literal(&self) -> Option<(usize, u8)> {
        self.anchor
    }

    /// Try to match this pattern starting exactly at `data[0]`.
    pub fn try_match_at(&self, data: &[u8]) -> Option<PatternHit> {
        if data.len() < self.min_length {
            return None;
        }

        let mut address = [0u8; MAX_ADDRESS_BYTES];
        let mut address_len = 0;
        let length = match_items(&self.items, data, 0, &mut address, &mut address_len)?;

        Some(PatternHit {
            length,
            address: u64::from_le_bytes(address),
        })
    }

    /// Scan `data` for the first position this pattern matches at.
    ///
    /// Returns the offset of the match alongside the hit.
    pub fn try_find_match(&self, data: &[u8]) -> Option<(usize, PatternHit)> {
        if data.len() < self.min_length {
            return None;
        }

        if self.must_match_at_start {
            return self.try_match_at(data).map(|hit| (0, hit));
        }

        (0..=data.len() - self.min_length)
            .find_map(|offset| self.try_match_at(&data[offset..]).map(|hit| (offset, hit)))
    }
}

fn match_items(
    items: &[PatternItem],
    data: &[u8],
    pos: usize,
    address: &mut [u8; MAX_ADDRESS_BYTES],
    address_len: &mut usize,
) -> Option<usize> {
    let mut pos = pos;

    for (index, item) in items.iter().enumerate() {
        match *item {
            PatternItem::Byte(value) => {
                if *data.get(pos)? != value {
                    return None;
                }
                pos += 1;
            }
            PatternItem::Any => {
                data.get(pos)?;
                pos += 1;
            }
            PatternItem::Address => {
                address[*address_len] = *data.get(pos)?;
                *address_len += 1;
                pos += 1;
            }
            PatternItem::AnyRepeating => {
                let rest = &items[index + 1..];
                let saved_len = *address_len;
                for skip in pos..=data.len() {
                    *address_len = saved_len;
                    if let Some(end) = match_items(rest, data, skip, address, address_len) {
                        return Some(end);
                    }
                }
                return None;
            }
        }
    }

    Some(pos)
}
