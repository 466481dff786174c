//! Hex address and byte parsing utilities.

use anyhow::{Result, bail};

/// Parse a hex address string (with or without 0x prefix).
pub fn parse_hex_address(s: &str) -> Result<usize> {
    let s = s.trim();
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    usize::from_str_radix(s, 16).map_err(|e| anyhow::anyhow!("Invalid hex address: {}", e))
}

/// Parse a sequence of hex bytes.
///
/// Bytes may be separated by whitespace or commas, or written back to back
/// (`"E9FB0F0000"`).
pub fn parse_hex_bytes(s: &str) -> Result<Vec<u8>> {
    let digits: String = s
        .split(|c: char| c.is_whitespace() || c == ',')
        .map(|token| token.trim_start_matches("0x").trim_start_matches("0X"))
        .collect();

    if digits.len() % 2 != 0 {
        bail!("Odd number of hex digits in {:?}", s);
    }

    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|e| anyhow::anyhow!("Invalid hex byte {:?}: {}", &digits[i..i + 2], e))
        })
        .collect()
}

/// Format bytes as space separated uppercase hex.
pub fn format_hex_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
