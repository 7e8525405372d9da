use ethers::types::{Address, U256};
use ethers::utils::{format_units, to_checksum};
use std::str::FromStr;

/// Scales a raw token amount down by `decimals` and returns it as an `f64`.
///
/// Goes through the decimal string so the rounding matches a plain text-to-number parse.
pub fn units_to_f64(value: U256, decimals: u8) -> Result<f64, ConversionError> {
    let text = format_units(value, decimals as u32)
        .map_err(|e| ConversionError::InvalidUnits(e.to_string()))?;
    f64::from_str(&text).map_err(|e| ConversionError::InvalidDecimal(e.to_string()))
}

// Canonical EIP-55 form, the way addresses are stored in the catalog
pub fn address_to_string(addr: Address) -> String {
    to_checksum(&addr, None)
}

pub fn string_to_address(s: &str) -> Result<Address, ConversionError> {
    Address::from_str(s.trim()).map_err(|e| ConversionError::InvalidAddress(e.to_string()))
}

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("Invalid decimal: {0}")]
    InvalidDecimal(String),
    #[error("Invalid units: {0}")]
    InvalidUnits(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}
