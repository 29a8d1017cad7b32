//! Calldata encoding for contract writes and reads.
//!
//! Methods are addressed by their full solidity signature
//! (`approveRedemption(uint256,uint256)`); arguments are encoded from JSON
//! values by the type list embedded in the signature. Covers the vault write
//! set: uints, addresses, bools, and strings (head/tail layout for the
//! dynamic case).

use alloy::primitives::{keccak256, Address, U256};
use serde_json::Value;

use crate::error::{ChainError, ChainResult};

/// Encode a function call: 4-byte selector + ABI-encoded arguments.
pub fn encode_call(signature: &str, args: &Value) -> ChainResult<Vec<u8>> {
    let types = parse_types(signature)?;
    let args = match args {
        Value::Array(items) => items.as_slice(),
        Value::Null => &[],
        other => {
            return Err(ChainError::Decode(format!(
                "call args must be an array, got {other}"
            )))
        }
    };
    if types.len() != args.len() {
        return Err(ChainError::Decode(format!(
            "{signature}: expected {} args, got {}",
            types.len(),
            args.len()
        )));
    }

    // Head/tail layout: static args inline, dynamic args as offsets into the
    // tail section that follows all heads.
    let head_len = types.len() * 32;
    let mut heads: Vec<[u8; 32]> = Vec::with_capacity(types.len());
    let mut tail: Vec<u8> = Vec::new();

    for (ty, arg) in types.iter().zip(args) {
        if ty == "string" {
            let s = arg
                .as_str()
                .ok_or_else(|| ChainError::Decode(format!("expected string, got {arg}")))?;
            heads.push(U256::from(head_len + tail.len()).to_be_bytes());
            tail.extend_from_slice(&U256::from(s.len()).to_be_bytes::<32>());
            let mut body = s.as_bytes().to_vec();
            body.resize(s.len().div_ceil(32) * 32, 0);
            tail.extend_from_slice(&body);
        } else {
            heads.push(encode_word(ty, arg)?);
        }
    }

    let mut out = keccak256(signature.as_bytes())[..4].to_vec();
    for head in heads {
        out.extend_from_slice(&head);
    }
    out.extend_from_slice(&tail);
    Ok(out)
}

/// Split raw return data into 32-byte words as decimal strings.
///
/// Callers that expect structured output index into the resulting array.
#[must_use]
pub fn decode_words(output: &[u8]) -> Value {
    let words: Vec<Value> = output
        .chunks(32)
        .map(|chunk| {
            let mut word = [0u8; 32];
            word[32 - chunk.len()..].copy_from_slice(chunk);
            Value::String(U256::from_be_bytes(word).to_string())
        })
        .collect();
    Value::Array(words)
}

/// Extract a revert reason from `Error(string)` revert data, if present.
#[must_use]
pub fn decode_revert(data: &[u8]) -> Option<String> {
    // 0x08c379a0 = selector of Error(string)
    if data.len() < 4 + 32 + 32 || data[..4] != [0x08, 0xc3, 0x79, 0xa0] {
        return None;
    }
    let body = &data[4..];
    let offset: usize = U256::from_be_slice(body.get(..32)?).try_into().ok()?;
    let len: usize = U256::from_be_slice(body.get(offset..offset + 32)?)
        .try_into()
        .ok()?;
    let bytes = body.get(offset + 32..offset + 32 + len)?;
    String::from_utf8(bytes.to_vec()).ok()
}

fn parse_types(signature: &str) -> ChainResult<Vec<String>> {
    let open = signature
        .find('(')
        .ok_or_else(|| ChainError::Decode(format!("bad signature: {signature}")))?;
    let close = signature
        .rfind(')')
        .ok_or_else(|| ChainError::Decode(format!("bad signature: {signature}")))?;
    let inner = &signature[open + 1..close];
    if inner.is_empty() {
        return Ok(Vec::new());
    }
    Ok(inner.split(',').map(|t| t.trim().to_string()).collect())
}

fn encode_word(ty: &str, arg: &Value) -> ChainResult<[u8; 32]> {
    let err = |msg: String| ChainError::Decode(msg);
    let mut word = [0u8; 32];
    match ty {
        "uint256" | "uint128" | "uint64" | "uint32" | "uint8" => {
            let v = match arg {
                Value::String(s) => U256::from_str_radix(s, 10)
                    .map_err(|e| err(format!("bad uint {s}: {e}")))?,
                Value::Number(n) => n
                    .as_u64()
                    .map(U256::from)
                    .ok_or_else(|| err(format!("bad uint {n}")))?,
                other => return Err(err(format!("expected uint, got {other}"))),
            };
            word = v.to_be_bytes();
        }
        "address" => {
            let s = arg
                .as_str()
                .ok_or_else(|| err(format!("expected address, got {arg}")))?;
            let addr: Address = s
                .parse()
                .map_err(|_| err(format!("bad address {s}")))?;
            word[12..].copy_from_slice(addr.as_slice());
        }
        "bool" => {
            let b = arg
                .as_bool()
                .ok_or_else(|| err(format!("expected bool, got {arg}")))?;
            word[31] = u8::from(b);
        }
        other => return Err(err(format!("unsupported call argument type {other}"))),
    }
    Ok(word)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_call_selector_and_args() {
        let data = encode_call("approveRedemption(uint256)", &json!([42])).unwrap();
        assert_eq!(data.len(), 4 + 32);
        let expected = &keccak256(b"approveRedemption(uint256)")[..4];
        assert_eq!(&data[..4], expected);
        assert_eq!(data[4 + 31], 42);
    }

    #[test]
    fn test_encode_call_arity_mismatch() {
        assert!(encode_call("pause()", &json!([1])).is_err());
        assert!(encode_call("pause()", &json!([])).is_ok());
    }

    #[test]
    fn test_encode_address_and_bool() {
        let data = encode_call(
            "setEmergencyMode(bool)",
            &json!([true]),
        )
        .unwrap();
        assert_eq!(data[4 + 31], 1);

        let data = encode_call(
            "setAssetTier(address,uint8)",
            &json!(["0x00000000000000000000000000000000000000aa", 2]),
        )
        .unwrap();
        assert_eq!(data.len(), 4 + 64);
        assert_eq!(data[4 + 31], 0xaa);
        assert_eq!(data[4 + 63], 2);
    }

    #[test]
    fn test_encode_dynamic_string() {
        let data = encode_call("rejectRedemption(uint256,string)", &json!([7, "no"])).unwrap();
        // selector + two heads + length word + one padded body word
        assert_eq!(data.len(), 4 + 64 + 32 + 32);
        // The string head is the tail offset (0x40 = after both heads).
        assert_eq!(data[4 + 32 + 31], 0x40);
        assert_eq!(data[4 + 64 + 31], 2);
        assert_eq!(&data[4 + 96..4 + 98], b"no");
    }

    #[test]
    fn test_decode_words() {
        let mut output = [0u8; 64];
        output[31] = 7;
        output[63] = 9;
        let decoded = decode_words(&output);
        assert_eq!(decoded, json!(["7", "9"]));
    }

    #[test]
    fn test_decode_revert_reason() {
        // Error("nope")
        let mut data = vec![0x08, 0xc3, 0x79, 0xa0];
        let mut offset = [0u8; 32];
        offset[31] = 0x20;
        data.extend_from_slice(&offset);
        let mut len = [0u8; 32];
        len[31] = 4;
        data.extend_from_slice(&len);
        let mut body = b"nope".to_vec();
        body.resize(32, 0);
        data.extend_from_slice(&body);

        assert_eq!(decode_revert(&data), Some("nope".to_string()));
        assert_eq!(decode_revert(b"short"), None);
    }
}
