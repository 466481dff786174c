//! Indexed set of byte patterns
//!
//! Patterns are grouped by the offset of their first literal byte. Each group
//! keeps a 256-entry table from that byte's value to the candidate patterns, so
//! a match attempt at one position costs a single lookup per group before any
//! full comparison. Patterns without a fixed literal anchor are kept apart and
//! only tried after the indexed scan finds nothing.

use once_cell::sync::OnceCell;

use super::byte_pattern::BytePattern;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternMatch<'a> {
    pub pattern: &'a BytePattern,
    pub offset: usize,
    pub length: usize,
    pub address: u64,
}

#[derive(Debug)]
struct AnchorGroup {
    offset: usize,
    min_length: usize,
    lut: Vec<Vec<usize>>,
}

#[derive(Debug)]
enum FirstByteSet {
    Empty,
    One(u8),
    Two(u8, u8),
    Three(u8, u8, u8),
    Table(Box<[bool; 256]>),
}

impl FirstByteSet {
    fn from_bytes(bytes: &[u8]) -> Self {
        match *bytes {
            [] => FirstByteSet::Empty,
            [a] => FirstByteSet::One(a),
            [a, b] => FirstByteSet::Two(a, b),
            [a, b, c] => FirstByteSet::Three(a, b, c),
            _ => {
                let mut table = Box::new([false; 256]);
                for &byte in bytes {
                    table[byte as usize] = true;
                }
                FirstByteSet::Table(table)
            }
        }
    }

    fn find(&self, haystack: &[u8]) -> Option<usize> {
        match self {
            FirstByteSet::Empty => None,
            FirstByteSet::One(a) => memchr::memchr(*a, haystack),
            FirstByteSet::Two(a, b) => memchr::memchr2(*a, *b, haystack),
            FirstByteSet::Three(a, b, c) => memchr::memchr3(*a, *b, *c, haystack),
            FirstByteSet::Table(table) => haystack.iter().position(|b| table[*b as usize]),
        }
    }
}

#[derive(Debug)]
pub struct BytePatternCollection {
    patterns: Vec<BytePattern>,
    groups: Vec<AnchorGroup>,
    anchorless: Vec<usize>,
    min_length: usize,
    max_min_length: usize,
    max_address_length: usize,
    first_bytes: OnceCell<FirstByteSet>,
}

impl Default for BytePatternCollection {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl BytePatternCollection {
    pub fn new(patterns: Vec<BytePattern>) -> Self {
        let mut groups: Vec<AnchorGroup> = Vec::new();
        let mut anchorless = Vec::new();

        for (index, pattern) in patterns.iter().enumerate() {
            let Some((offset, value)) = pattern.first_literal() else {
                anchorless.push(index);
                continue;
            };

            let group = match groups.iter().position(|g| g.offset == offset) {
                Some(pos) => &mut groups[pos],
                None => {
                    groups.push(AnchorGroup {
                        offset,
                        min_length: usize::MAX,
                        lut: vec![Vec::new(); 256],
                    });
                    let last = groups.len() - 1;
                    &mut groups[last]
                }
            };
            group.min_length = group.min_length.min(pattern.min_length());
            group.lut[value as usize].push(index);
        }

        groups.sort_by_key(|g| g.offset);

        let min_length = patterns.iter().map(|p| p.min_length()).min().unwrap_or(0);
        let max_min_length = patterns.iter().map(|p| p.min_length()).max().unwrap_or(0);
        let max_address_length = patterns
            .iter()
            .map(|p| p.address_bytes())
            .max()
            .unwrap_or(0);

        Self {
            patterns,
            groups,
            anchorless,
            min_length,
            max_min_length,
            max_address_length,
            first_bytes: OnceCell::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Shortest input any pattern can match
    pub fn min_length(&self) -> usize {
        self.min_length
    }

    /// Longest per-pattern minimum; reading this many bytes is enough to try every pattern
    pub fn max_min_length(&self) -> usize {
        self.max_min_length
    }

    pub fn max_address_length(&self) -> usize {
        self.max_address_length
    }

    /// Patterns in index order: anchored groups by offset, then anchorless ones
    pub fn iter(&self) -> impl Iterator<Item = &BytePattern> + '_ {
        let anchored = self.groups.iter().flat_map(move |group| {
            group
                .lut
                .iter()
                .flat_map(move |bucket| bucket.iter().map(move |&i| &self.patterns[i]))
        });
        anchored.chain(self.anchorless.iter().map(move |&i| &self.patterns[i]))
    }

    /// Try to match any pattern anchored at `data[0]`.
    pub fn try_match_at<'a>(&'a self, data: &[u8]) -> Option<PatternMatch<'a>> {
        if data.len() < self.min_length {
            return None;
        }

        for group in &self.groups {
            if data.len() <= group.offset || data.len() < group.min_length {
                continue;
            }

            for &index in &group.lut[data[group.offset] as usize] {
                let pattern = &self.patterns[index];
                if let Some(hit) = pattern.try_match_at(data) {
                    return Some(self.make_match(index, 0, hit.length, hit.address));
                }
            }
        }

        for &index in &self.anchorless {
            if let Some(hit) = self.patterns[index].try_match_at(data) {
                return Some(self.make_match(index, 0, hit.length, hit.address));
            }
        }

        None
    }

    /// Scan `data` for the first position where some pattern matches.
    pub fn try_find_match<'a>(&'a self, data: &[u8]) -> Option<PatternMatch<'a>> {
        if data.len() < self.min_length {
            return None;
        }

        let first_bytes = self.first_bytes.get_or_init(|| self.compute_first_bytes());
        let mut scan = 0;

        while scan < data.len() {
            let Some(found) = first_bytes.find(&data[scan..]) else {
                break;
            };
            let anchor_pos = scan + found;

            for group in &self.groups {
                if anchor_pos < group.offset {
                    continue;
                }
                let start = anchor_pos - group.offset;
                if data.len() - start < group.min_length {
                    continue;
                }

                for &index in &group.lut[data[anchor_pos] as usize] {
                    let pattern = &self.patterns[index];
                    if pattern.must_match_at_start() && start != 0 {
                        continue;
                    }
                    if let Some(hit) = pattern.try_match_at(&data[start..]) {
                        return Some(self.make_match(index, start, hit.length, hit.address));
                    }
                }
            }

            scan = anchor_pos + 1;
        }

        for &index in &self.anchorless {
            if let Some((offset, hit)) = self.patterns[index].try_find_match(data) {
                return Some(self.make_match(index, offset, hit.length, hit.address));
            }
        }

        None
    }

    fn make_match(&self, index: usize, offset: usize, length: usize, address: u64) -> PatternMatch<'_> {
        PatternMatch {
            pattern: &self.patterns[index],
            offset,
            length,
            address,
        }
    }

    fn compute_first_bytes(&self) -> FirstByteSet {
        let mut seen = [false; 256];
        for group in &self.groups {
            for (value, bucket) in group.lut.iter().enumerate() {
                if !bucket.is_empty() {
                    seen[value] = true;
                }
            }
        }

        let bytes: Vec<u8> = (0..=255u8).filter(|b| seen[*b as usize]).collect();
        FirstByteSet::from_bytes(&bytes)
    }
}

impl From<Vec<BytePattern>> for BytePatternCollection {
    fn from(patterns: Vec<BytePattern>) -> Self {
        Self::new(patterns)
    }
}
