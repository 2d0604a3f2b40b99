use crate::types::UserOperation;
use anyhow::{anyhow, Context, Result};
use ethers::types::{Address, Bytes, H256, U256};
use serde_json::Value;

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

pub fn user_op_to_json(op: &UserOperation) -> Value {
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

/// Inverse of [`user_op_to_json`]; every field is required.
pub fn user_op_from_json(v: &Value) -> Result<UserOperation> {
    Ok(UserOperation {
        sender: str_field(v, "sender")?
            .parse::<Address>()
            .map_err(|e| anyhow!("invalid sender: {e}"))?,
        nonce: u256_field(v, "nonce")?,
        init_code: bytes_field(v, "initCode")?,
        call_data: bytes_field(v, "callData")?,
        call_gas_limit: u256_field(v, "callGasLimit")?,
        verification_gas_limit: u256_field(v, "verificationGasLimit")?,
        pre_verification_gas: u256_field(v, "preVerificationGas")?,
        max_fee_per_gas: u256_field(v, "maxFeePerGas")?,
        max_priority_fee_per_gas: u256_field(v, "maxPriorityFeePerGas")?,
        paymaster_and_data: bytes_field(v, "paymasterAndData")?,
        signature: bytes_field(v, "signature")?,
    })
}

fn str_field<'a>(v: &'a Value, key: &str) -> Result<&'a str> {
    v.get(key)
        .and_then(|x| x.as_str())
        .ok_or_else(|| anyhow!("missing or invalid field {key}"))
}

fn u256_field(v: &Value, key: &str) -> Result<U256> {
    parse_u256_quantity(str_field(v, key)?).with_context(|| format!("invalid {key}"))
}

fn bytes_field(v: &Value, key: &str) -> Result<Bytes> {
    parse_bytes(str_field(v, key)?).with_context(|| format!("invalid {key}"))
}

pub fn parse_u256_quantity(s: &str) -> Result<U256> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.is_empty() {
        return Ok(U256::zero());
    }
    Ok(U256::from_str_radix(s, 16)?)
}

/// Accepts a hex quantity string or a plain JSON number.
pub fn parse_u256_value(v: &Value) -> Result<U256> {
    match v {
        Value::String(s) => parse_u256_quantity(s),
        Value::Number(n) => n
            .as_u64()
            .map(U256::from)
            .ok_or_else(|| anyhow!("quantity {n} is not an unsigned integer")),
        other => Err(anyhow!("expected quantity, got {other}")),
    }
}

/// Decimal unless `0x`-prefixed.
pub fn parse_u256_dec_or_hex(s: &str) -> Result<U256> {
    let s = s.trim();
    match s.strip_prefix("0x") {
        Some(hex) => parse_u256_quantity(hex),
        None => U256::from_dec_str(s).map_err(|e| anyhow!("invalid integer {s:?}: {e}")),
    }
}

pub fn parse_bytes(s: &str) -> Result<Bytes> {
    let s = s.trim();
    let s = s.strip_prefix("0x").unwrap_or(s);
    Ok(Bytes::from(hex::decode(s)?))
}

pub fn parse_h256(s: &str) -> Result<H256> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(s)?;
    if bytes.len() != 32 {
        anyhow::bail!("expected 32-byte hex, got {} bytes", bytes.len());
    }
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    Ok(H256(arr))
}

/// Left-pads hex of up to 32 bytes into a salt. Odd-length hex gets a leading zero.
pub fn pad_salt(s: &str) -> Result<H256> {
    let s = s.trim();
    let s = s.strip_prefix("0x").unwrap_or(s);
    let even = if s.len() % 2 == 1 {
        format!("0{s}")
    } else {
        s.to_string()
    };
    let bytes = hex::decode(&even).with_context(|| format!("invalid salt hex {s:?}"))?;
    if bytes.len() > 32 {
        anyhow::bail!("salt is {} bytes, at most 32 allowed", bytes.len());
    }
    let mut arr = [0u8; 32];
    arr[32 - bytes.len()..].copy_from_slice(&bytes);
    Ok(H256(arr))
}

/// `eth_getCode` results: nodes report "no code" as `0x` (some as `0x0`).
pub fn has_code(code: &Bytes) -> bool {
    !code.is_empty() && !(code.len() == 1 && code[0] == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::dummy_signature;
    use serde_json::json;

    #[test]
    fn quantity_formatting() {
        assert_eq!(fmt_u256(U256::zero()), "0x0");
        assert_eq!(fmt_u256(U256::from(255u64)), "0xff");
    }

    #[test]
    fn parse_u256_value_accepts_strings_and_numbers() {
        assert_eq!(parse_u256_value(&json!("0x10")).unwrap(), U256::from(16u64));
        assert_eq!(parse_u256_value(&json!(21000)).unwrap(), U256::from(21000u64));
        assert!(parse_u256_value(&json!(true)).is_err());
    }

    #[test]
    fn dec_or_hex() {
        assert_eq!(parse_u256_dec_or_hex("172800").unwrap(), U256::from(172800u64));
        assert_eq!(parse_u256_dec_or_hex("0x2a").unwrap(), U256::from(42u64));
        assert!(parse_u256_dec_or_hex("twelve").is_err());
    }

    #[test]
    fn pad_salt_left_pads() {
        let salt = pad_salt("0x01").unwrap();
        assert_eq!(salt.as_bytes()[31], 1);
        assert!(salt.as_bytes()[..31].iter().all(|b| *b == 0));

        let odd = pad_salt("0xabc").unwrap();
        assert_eq!(&odd.as_bytes()[30..], &[0x0au8, 0xbc][..]);

        assert!(pad_salt(&format!("0x{}", "11".repeat(33))).is_err());
    }

    #[test]
    fn has_code_sentinels() {
        assert!(!has_code(&Bytes::default()));
        assert!(!has_code(&Bytes::from(vec![0u8])));
        assert!(has_code(&Bytes::from(vec![0x60, 0x80])));
    }

    #[test]
    fn user_op_json_roundtrip() {
        let op = UserOperation {
            sender: Address::repeat_byte(0x42),
            nonce: U256::from(7u64),
            init_code: Bytes::default(),
            call_data: Bytes::from(vec![1, 2, 3]),
            call_gas_limit: U256::from(1u64),
            verification_gas_limit: U256::from(2u64),
            pre_verification_gas: U256::from(3u64),
            max_fee_per_gas: U256::from(4u64),
            max_priority_fee_per_gas: U256::zero(),
            paymaster_and_data: Bytes::from(vec![0xaa; 20]),
            signature: dummy_signature(),
        };
        let back = user_op_from_json(&user_op_to_json(&op)).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn user_op_from_json_rejects_missing_field() {
        let mut v = json!({});
        assert!(user_op_from_json(&v).is_err());
        v["sender"] = json!("0x0000000000000000000000000000000000000001");
        assert!(user_op_from_json(&v).is_err());
    }
}
