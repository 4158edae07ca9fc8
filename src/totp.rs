//! TOTP Generator
//!
//! RFC 6238 time-based one-time codes used as the cloud login second factor.
//! Pure and stateless: a code is recomputed from the shared secret and the
//! current time on every call, never cached.

use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::error::{Error, Result};

type HmacSha1 = Hmac<Sha1>;

/// Time step in seconds (standard authenticator window)
pub const TIME_STEP_SECS: u64 = 30;

/// Number of code digits
pub const CODE_DIGITS: u32 = 6;

/// Generate the TOTP code for the given base32 secret at `unix_time`.
///
/// The secret is decoded case-insensitively; whitespace and `=` padding are
/// tolerated since provisioning strings commonly carry both. An undecodable
/// secret is a configuration error (`InvalidSecret`), distinct from any
/// network failure.
pub fn generate(secret_b32: &str, unix_time: u64) -> Result<String> {
    let key = decode_secret(secret_b32)?;
    let counter = unix_time / TIME_STEP_SECS;
    Ok(hotp(&key, counter))
}

/// Generate a code for the current system time
pub fn generate_now(secret_b32: &str) -> Result<String> {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|e| Error::Internal(format!("System clock before epoch: {}", e)))?
        .as_secs();
    generate(secret_b32, now)
}

/// Decode a base32 shared secret
fn decode_secret(secret_b32: &str) -> Result<Vec<u8>> {
    let normalized: String = secret_b32
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .map(|c| c.to_ascii_uppercase())
        .collect();

    if normalized.is_empty() {
        return Err(Error::InvalidSecret("empty TOTP secret".to_string()));
    }

    base32::decode(base32::Alphabet::Rfc4648 { padding: false }, &normalized)
        .ok_or_else(|| Error::InvalidSecret("TOTP secret is not valid base32".to_string()))
}

/// HOTP (RFC 4226) with dynamic truncation
fn hotp(key: &[u8], counter: u64) -> String {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = ((digest[offset] as u32 & 0x7f) << 24)
        | ((digest[offset + 1] as u32) << 16)
        | ((digest[offset + 2] as u32) << 8)
        | (digest[offset + 3] as u32);

    let code = binary % 10u32.pow(CODE_DIGITS);
    format!("{:0width$}", code, width = CODE_DIGITS as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 6238 test secret: ASCII "12345678901234567890" in base32
    const RFC_SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    #[test]
    fn test_rfc6238_vectors() {
        // Last 6 digits of the RFC 6238 appendix B SHA-1 reference values
        assert_eq!(generate(RFC_SECRET, 59).unwrap(), "287082");
        assert_eq!(generate(RFC_SECRET, 1111111109).unwrap(), "081804");
        assert_eq!(generate(RFC_SECRET, 1111111111).unwrap(), "050471");
        assert_eq!(generate(RFC_SECRET, 1234567890).unwrap(), "005924");
        assert_eq!(generate(RFC_SECRET, 2000000000).unwrap(), "279037");
    }

    #[test]
    fn test_stable_within_window() {
        // Any second inside one 30s window yields the same code
        let base = 1111111110; // window [1111111110, 1111111140)
        let expected = generate(RFC_SECRET, base).unwrap();
        for offset in 0..TIME_STEP_SECS {
            assert_eq!(generate(RFC_SECRET, base + offset).unwrap(), expected);
        }
    }

    #[test]
    fn test_adjacent_window_differs() {
        let t = 1111111109; // last second of its window
        let a = generate(RFC_SECRET, t).unwrap();
        let b = generate(RFC_SECRET, t + 1).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tolerates_padding_whitespace_and_case() {
        let messy = "gezd gnbv gy3t qojq gezd gnbv gy3t qojq====";
        assert_eq!(generate(messy, 59).unwrap(), "287082");
    }

    #[test]
    fn test_invalid_secret() {
        assert!(matches!(
            generate("not!base32@", 59),
            Err(Error::InvalidSecret(_))
        ));
        assert!(matches!(generate("", 59), Err(Error::InvalidSecret(_))));
        assert!(matches!(generate("  == ", 59), Err(Error::InvalidSecret(_))));
    }

    #[test]
    fn test_code_is_six_digits() {
        let code = generate(RFC_SECRET, 0).unwrap();
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
    }
}
