mod byte_pattern;
mod collection;
mod signature;

pub use byte_pattern::{
    AddressEncoding, AddressKind, AddressMeaning, BytePattern, MAX_ADDRESS_BYTES, PatternHit,
    PatternItem,
};
pub use collection::{BytePatternCollection, PatternMatch};
pub use signature::{
    ThunkSignature, ThunkSignatureSet, format_pattern, load_signatures, parse_pattern,
    save_signatures,
};
