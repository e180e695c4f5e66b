use crate::error::{Error, Result};
use ethers::types::{Address, Bytes, H256, U256};

pub fn fmt_address(addr: Address) -> String {
    format!("0x{}", hex::encode(addr.as_bytes()))
}

pub fn fmt_h256(h: H256) -> String {
    format!("0x{}", hex::encode(h.as_bytes()))
}

/// JSON-RPC "quantity" encoding.
pub fn fmt_u256(v: U256) -> String {
    if v.is_zero() {
        "0x0".to_string()
    } else {
        format!("0x{:x}", v)
    }
}

pub fn fmt_bytes(b: &Bytes) -> String {
    format!("0x{}", hex::encode(b.as_ref()))
}

/// Minimal big-endian byte form of an integer (no leading zero bytes, but at
/// least one byte). The legacy permit domain salts with the keccak256 of this
/// form of the chain id.
pub fn minimal_be_bytes(v: U256) -> Vec<u8> {
    let mut buf = [0u8; 32];
    v.to_big_endian(&mut buf);
    let start = buf.iter().position(|b| *b != 0).unwrap_or(31);
    buf[start..].to_vec()
}

/// Parses a decimal or 0x-hex integer, rejecting anything outside 256 bits.
pub fn parse_u256(s: &str, field: &'static str) -> Result<U256> {
    let invalid = |reason: String| Error::InvalidField { field, reason };

    if let Some(hex_str) = s.strip_prefix("0x") {
        if hex_str.is_empty() {
            return Ok(U256::zero());
        }
        if hex_str.len() > 64 {
            return Err(invalid(format!("{s} exceeds 256 bits")));
        }
        return U256::from_str_radix(hex_str, 16).map_err(|e| invalid(e.to_string()));
    }

    U256::from_dec_str(s).map_err(|e| invalid(e.to_string()))
}

pub fn parse_address(s: &str, field: &'static str) -> Result<Address> {
    s.parse::<Address>().map_err(|e| Error::InvalidField {
        field,
        reason: e.to_string(),
    })
}

pub fn parse_h256(s: &str, field: &'static str) -> Result<H256> {
    let invalid = |reason: String| Error::InvalidField { field, reason };

    let hex_str = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(hex_str).map_err(|e| invalid(e.to_string()))?;
    if bytes.len() != 32 {
        return Err(invalid(format!("expected 32 bytes, got {}", bytes.len())));
    }
    Ok(H256::from_slice(&bytes))
}

pub fn parse_bytes(s: &str, field: &'static str) -> Result<Bytes> {
    let hex_str = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(hex_str).map_err(|e| Error::InvalidField {
        field,
        reason: e.to_string(),
    })?;
    Ok(Bytes::from(bytes))
}
