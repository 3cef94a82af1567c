//! Memory address wrapper with hex parsing, used for target-process
//! addresses which may be 64-bit even when the host is not.

use super::error::{InterfaceError, ProjectError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A virtual address inside the target process
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Address(pub u64);

impl Address {
    /// Creates a new address from a raw value
    pub const fn new(value: u64) -> Self {
        Address(value)
    }

    /// Creates a null address (0x0)
    pub const fn null() -> Self {
        Address(0)
    }

    /// Checks if the address is null
    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Adds a signed offset to the address
    pub const fn offset(&self, offset: i64) -> Self {
        Address(self.0.wrapping_add_signed(offset))
    }

    /// Returns the raw value
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl FromStr for Address {
    type Err = InterfaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        let value = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            u64::from_str_radix(hex, 16)
        } else if s.chars().any(|c| c.is_ascii_alphabetic()) {
            // Assume hex if it contains letters
            u64::from_str_radix(s, 16)
        } else {
            s.parse::<u64>().or_else(|_| u64::from_str_radix(s, 16))
        };

        value
            .map(Address::new)
            .map_err(|_| InterfaceError::Parse(format!("Invalid address literal: {s}")))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

impl fmt::LowerHex for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl From<u64> for Address {
    fn from(value: u64) -> Self {
        Address::new(value)
    }
}

impl From<Address> for u64 {
    fn from(value: Address) -> Self {
        value.0
    }
}

/// Parses struct base-address expressions used by the layout layer:
/// a plain address, `base`, `base+offset` or `base-offset`.
pub fn parse_address_expression(input: &str, image_base: u64) -> Result<u64, ProjectError> {
    let input = input.trim();
    if input == "base" {
        return Ok(image_base);
    }

    if let Some(rest) = input.strip_prefix("base") {
        let rest = rest.trim_start();
        let (negative, expr) = if let Some(e) = rest.strip_prefix('+') {
            (false, e)
        } else if let Some(e) = rest.strip_prefix('-') {
            (true, e)
        } else {
            return Err(ProjectError::Document(format!(
                "Malformed base expression: {input}"
            )));
        };

        let offset = Address::from_str(expr)
            .map_err(|e| ProjectError::Document(e.to_string()))?
            .as_u64();
        return Ok(if negative {
            image_base.wrapping_sub(offset)
        } else {
            image_base.wrapping_add(offset)
        });
    }

    Address::from_str(input)
        .map(|a| a.as_u64())
        .map_err(|e| ProjectError::Document(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_parsing() {
        assert_eq!(Address::from_str("0x1000").unwrap(), Address::new(0x1000));
        assert_eq!(Address::from_str("0X1000").unwrap(), Address::new(0x1000));
        assert_eq!(
            Address::from_str("DEADBEEF").unwrap(),
            Address::new(0xDEAD_BEEF)
        );
        assert_eq!(Address::from_str("4096").unwrap(), Address::new(4096));
        assert!(Address::from_str("not an address!").is_err());
    }

    #[test]
    fn address_offset() {
        let addr = Address::new(0x1000);
        assert_eq!(addr.offset(0x10), Address::new(0x1010));
        assert_eq!(addr.offset(-0x10), Address::new(0x0FF0));
    }

    #[test]
    fn base_expressions() {
        let base = 0x0040_0000;
        assert_eq!(parse_address_expression("base", base).unwrap(), base);
        assert_eq!(
            parse_address_expression("base + 0x10", base).unwrap(),
            base + 0x10
        );
        assert_eq!(
            parse_address_expression("base-8", base).unwrap(),
            base - 8
        );
        assert_eq!(
            parse_address_expression("0x1234", base).unwrap(),
            0x1234
        );
        assert!(parse_address_expression("base*2", base).is_err());
    }
}
