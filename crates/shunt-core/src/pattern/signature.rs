use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use super::byte_pattern::{AddressMeaning, BytePattern, PatternItem};
use super::collection::BytePatternCollection;
use crate::error::{Error, Result};

/// Serializable form of a [`BytePattern`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThunkSignature {
    pub name: String,
    pub pattern: String,
    pub address: AddressMeaning,
    #[serde(default)]
    pub must_match_at_start: bool,
}

impl ThunkSignature {
    pub fn to_pattern(&self) -> Result<BytePattern> {
        BytePattern::parse(
            self.name.clone(),
            self.address,
            self.must_match_at_start,
            &self.pattern,
        )
    }
}

impl From<&BytePattern> for ThunkSignature {
    fn from(pattern: &BytePattern) -> Self {
        Self {
            name: pattern.name().to_string(),
            pattern: format_pattern(pattern.items()),
            address: pattern.address_meaning(),
            must_match_at_start: pattern.must_match_at_start(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThunkSignatureSet {
    pub architecture: String,
    pub signatures: Vec<ThunkSignature>,
}

impl ThunkSignatureSet {
    pub fn from_collection(architecture: impl Into<String>, collection: &BytePatternCollection) -> Self {
        Self {
            architecture: architecture.into(),
            signatures: collection.iter().map(ThunkSignature::from).collect(),
        }
    }

    pub fn signature(&self, name: &str) -> Option<&ThunkSignature> {
        self.signatures
            .iter()
            .find(|sig| sig.name.eq_ignore_ascii_case(name))
    }

    pub fn to_collection(&self) -> Result<BytePatternCollection> {
        let patterns = self
            .signatures
            .iter()
            .map(ThunkSignature::to_pattern)
            .collect::<Result<Vec<_>>>()?;
        Ok(BytePatternCollection::new(patterns))
    }
}

pub fn load_signatures<P: AsRef<Path>>(path: P) -> Result<ThunkSignatureSet> {
    let content = fs::read_to_string(&path)?;
    let data = serde_json::from_str(&content)?;
    Ok(data)
}

pub fn save_signatures<P: AsRef<Path>>(path: P, signatures: &ThunkSignatureSet) -> Result<()> {
    let content = serde_json::to_string_pretty(signatures)?;
    fs::write(path, content)?;
    Ok(())
}

/// Parse a pattern such as `"FF 25 %% %% %% %% * CC"`.
///
/// `??` skips a byte, `%%` captures an address byte and `*` skips any number of bytes.
pub fn parse_pattern(pattern: &str) -> Result<Vec<PatternItem>> {
    let mut items = Vec::new();
    for token in pattern.split_whitespace() {
        let item = match token {
            "??" | "?" => PatternItem::Any,
            "%%" => PatternItem::Address,
            "*" => PatternItem::AnyRepeating,
            _ => {
                let value = u8::from_str_radix(token, 16).map_err(|e| {
                    Error::InvalidPattern(format!("Invalid pattern token '{}': {}", token, e))
                })?;
                PatternItem::Byte(value)
            }
        };
        items.push(item);
    }

    if items.is_empty() {
        return Err(Error::InvalidPattern("Pattern is empty".to_string()));
    }

    Ok(items)
}

pub fn format_pattern(items: &[PatternItem]) -> String {
    items
        .iter()
        .map(|item| match item {
            PatternItem::Byte(value) => format!("{:02X}", value),
            PatternItem::Any => "??".to_string(),
            PatternItem::Address => "%%".to_string(),
            PatternItem::AnyRepeating => "*".to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
