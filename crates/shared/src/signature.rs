//! Webhook 签名校验
//!
//! 支付网关与配送商回调都携带 HMAC-SHA256 签名（十六进制编码）。
//! 签名不合法的回调一律拒绝，未签名的负载不可信。

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{FlavoryError, Result};

type HmacSha256 = Hmac<Sha256>;

/// 计算负载的 HMAC-SHA256 签名，返回小写十六进制字符串
pub fn sign(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC 接受任意长度密钥");
    mac.update(payload);
    hex_encode(&mac.finalize().into_bytes())
}

/// 校验回调签名
///
/// 使用 `verify_slice` 做常量时间比较，避免时序侧信道。
pub fn verify(secret: &[u8], payload: &[u8], signature_hex: &str) -> Result<()> {
    let expected = hex_decode(signature_hex)
        .ok_or_else(|| FlavoryError::InvalidSignature("签名不是合法的十六进制".to_string()))?;

    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC 接受任意长度密钥");
    mac.update(payload);
    mac.verify_slice(&expected)
        .map_err(|_| FlavoryError::InvalidSignature("签名与负载不匹配".to_string()))
}

/// 字节转小写十六进制
fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// 十六进制转字节，非法输入返回 None
fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"whsec_test_secret";

    #[test]
    fn test_sign_then_verify() {
        let payload = br#"{"type":"payment_intent.succeeded"}"#;
        let signature = sign(SECRET, payload);
        assert!(verify(SECRET, payload, &signature).is_ok());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let signature = sign(SECRET, b"original");
        let err = verify(SECRET, b"tampered", &signature).unwrap_err();
        assert!(matches!(err, FlavoryError::InvalidSignature(_)));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let payload = b"payload";
        let signature = sign(b"another_secret", payload);
        assert!(verify(SECRET, payload, &signature).is_err());
    }

    #[test]
    fn test_malformed_hex_rejected() {
        assert!(verify(SECRET, b"payload", "zz not hex").is_err());
        // 奇数长度
        assert!(verify(SECRET, b"payload", "abc").is_err());
    }

    #[test]
    fn test_hex_round_trip() {
        let bytes = [0x00, 0x0f, 0xa5, 0xff];
        let encoded = hex_encode(&bytes);
        assert_eq!(encoded, "000fa5ff");
        assert_eq!(hex_decode(&encoded).unwrap(), bytes);
    }
}
