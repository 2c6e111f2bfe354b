use crate::types::UserOperation;
use ethers::types::{Address, Bytes, H256, U256};

pub fn fmt_address(addr: Address) -> String {
    format!("0x{}", hex::encode(addr.as_bytes()))
}

pub fn fmt_h256(h: H256) -> String {
    format!("0x{}", hex::encode(h.as_bytes()))
}

/// Canonical JSON-RPC "quantity" encoding: `0x0` for zero, otherwise `0x`
/// plus minimal lowercase hex. Every number we put on the wire goes through
/// here, so malformed encodings (leading zeros, `0x0`-prefixed artifacts)
/// cannot occur.
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

/// Wire form of a UserOperation: camelCase keys, canonical quantities.
pub fn user_op_to_json(op: &UserOperation) -> serde_json::Value {
    serde_json::json!({
        "sender": fmt_address(op.sender),
        "nonce": fmt_u256(op.nonce),
        "initCode": fmt_bytes(&op.init_code),
        "callData": fmt_bytes(&op.call_data),
        "callGasLimit": fmt_u256(op.call_gas_limit),
        "verificationGasLimit": fmt_u256(op.verification_gas_limit),
        "preVerificationGas": fmt_u256(op.pre_verification_gas),
        "maxFeePerGas": fmt_u256(op.max_fee_per_gas),
        "maxPriorityFeePerGas": fmt_u256(op.max_priority_fee_per_gas),
        "paymasterAndData": fmt_bytes(&op.paymaster_and_data),
        "signature": fmt_bytes(&op.signature),
    })
}

pub fn parse_u256_quantity(s: &str) -> anyhow::Result<U256> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.is_empty() {
        return Ok(U256::zero());
    }
    Ok(U256::from_str_radix(s, 16)?)
}

/// Liberal numeric parse for paymaster responses: hex quantity, decimal
/// integer string, or a bare JSON number.
pub fn parse_u256_value(v: &serde_json::Value) -> anyhow::Result<U256> {
    if let Some(s) = v.as_str() {
        if let Some(hex_part) = s.strip_prefix("0x") {
            if hex_part.is_empty() {
                return Ok(U256::zero());
            }
            return Ok(U256::from_str_radix(hex_part, 16)?);
        }
        return Ok(U256::from_dec_str(s)?);
    }
    if let Some(n) = v.as_u64() {
        return Ok(U256::from(n));
    }
    anyhow::bail!("expected numeric value, got {v}")
}

pub fn parse_h256(s: &str) -> anyhow::Result<H256> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(s)?;
    if bytes.len() != 32 {
        anyhow::bail!("expected 32-byte hex, got {} bytes", bytes.len());
    }
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    Ok(H256(arr))
}

pub fn parse_bytes(s: &str) -> anyhow::Result<Bytes> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    Ok(Bytes::from(hex::decode(s)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn quantity_zero_is_0x0() {
        assert_eq!(fmt_u256(U256::zero()), "0x0");
    }

    #[test]
    fn quantity_has_no_leading_zeros() {
        assert_eq!(fmt_u256(U256::from(255)), "0xff");
        assert_eq!(fmt_u256(U256::from(4096)), "0x1000");
        assert_eq!(fmt_u256(U256::from(1)), "0x1");
    }

    #[test]
    fn quantity_round_trips() {
        for n in [0u64, 1, 15, 16, 1_000_000, u64::MAX] {
            let v = U256::from(n);
            assert_eq!(parse_u256_quantity(&fmt_u256(v)).unwrap(), v);
        }
    }

    #[test]
    fn liberal_value_parse_accepts_all_shapes() {
        assert_eq!(parse_u256_value(&json!("0xff")).unwrap(), U256::from(255));
        assert_eq!(
            parse_u256_value(&json!("500000000000000000")).unwrap(),
            U256::from(500_000_000_000_000_000u64)
        );
        assert_eq!(parse_u256_value(&json!(42)).unwrap(), U256::from(42));
        assert!(parse_u256_value(&json!(null)).is_err());
        assert!(parse_u256_value(&json!("nope")).is_err());
    }

    #[test]
    fn user_op_json_uses_camel_case_and_canonical_quantities() {
        let op = UserOperation {
            sender: Address::zero(),
            nonce: U256::zero(),
            init_code: Bytes::default(),
            call_data: Bytes::default(),
            call_gas_limit: U256::from(255),
            verification_gas_limit: U256::zero(),
            pre_verification_gas: U256::zero(),
            max_fee_per_gas: U256::zero(),
            max_priority_fee_per_gas: U256::zero(),
            paymaster_and_data: Bytes::default(),
            signature: Bytes::default(),
        };
        let v = user_op_to_json(&op);
        assert_eq!(v["nonce"], "0x0");
        assert_eq!(v["callGasLimit"], "0xff");
        assert_eq!(v["paymasterAndData"], "0x");
        assert!(v.get("pre_verification_gas").is_none());
    }
}
