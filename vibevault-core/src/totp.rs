//! TOTP engine (RFC 6238): HMAC-SHA1, 6 digits, 30-second step.

use crate::{Result, VaultError};
use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Code length.
pub const DIGITS: u32 = 6;
/// Step length in seconds.
pub const STEP: i64 = 30;

/// A generated code with its remaining validity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TotpCode {
    pub code: String,
    pub seconds_remaining: u32,
}

/// Generate the code for the given unix timestamp.
///
/// The secret is Base32 (RFC 4648); lower case, `=` padding, and
/// embedded whitespace are tolerated. Anything else fails validation.
pub fn generate(secret_base32: &str, timestamp: i64) -> Result<TotpCode> {
    let secret = decode_secret(secret_base32)?;

    let counter = (timestamp.max(0) as u64) / STEP as u64;

    let mut mac = HmacSha1::new_from_slice(&secret)
        .map_err(|_| VaultError::validation("totp secret", "unusable key material"))?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    // Dynamic truncation (RFC 4226 §5.3)
    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = ((digest[offset] as u32 & 0x7f) << 24)
        | ((digest[offset + 1] as u32) << 16)
        | ((digest[offset + 2] as u32) << 8)
        | (digest[offset + 3] as u32);

    let code = binary % 10u32.pow(DIGITS);

    Ok(TotpCode {
        code: format!("{:0width$}", code, width = DIGITS as usize),
        seconds_remaining: seconds_remaining(timestamp),
    })
}

/// Seconds until the current code rotates.
pub fn seconds_remaining(timestamp: i64) -> u32 {
    (STEP - timestamp.rem_euclid(STEP)) as u32
}

/// Normalize and decode a Base32 secret.
fn decode_secret(secret_base32: &str) -> Result<Vec<u8>> {
    let normalized: String = secret_base32
        .chars()
        .filter(|c| !c.is_ascii_whitespace() && *c != '=')
        .map(|c| c.to_ascii_uppercase())
        .collect();

    if normalized.is_empty() {
        return Err(VaultError::validation("totp secret", "must not be empty"));
    }
    if let Some(bad) = normalized.chars().find(|c| !matches!(c, 'A'..='Z' | '2'..='7')) {
        return Err(VaultError::validation(
            "totp secret",
            format!("invalid base32 character '{}'", bad),
        ));
    }

    BASE32_NOPAD
        .decode(normalized.as_bytes())
        .map_err(|_| VaultError::validation("totp secret", "malformed base32"))
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 6238 appendix B secret ("12345678901234567890")
    const RFC_SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    #[test]
    fn rfc6238_vectors_six_digits() {
        assert_eq!(generate(RFC_SECRET, 59).unwrap().code, "287082");
        assert_eq!(generate(RFC_SECRET, 1_111_111_109).unwrap().code, "081804");
        assert_eq!(generate(RFC_SECRET, 1_234_567_890).unwrap().code, "005924");
    }

    #[test]
    fn common_demo_secret_vectors() {
        // Independently computed for JBSWY3DPEHPK3PXP
        assert_eq!(generate("JBSWY3DPEHPK3PXP", 59).unwrap().code, "996554");
        assert_eq!(
            generate("JBSWY3DPEHPK3PXP", 1_234_567_890).unwrap().code,
            "742275"
        );
    }

    #[test]
    fn codes_are_zero_padded() {
        let code = generate(RFC_SECRET, 1_234_567_890).unwrap().code;
        assert_eq!(code.len(), 6);
        assert!(code.starts_with("00"));
    }

    #[test]
    fn remaining_seconds_complement_elapsed() {
        assert_eq!(seconds_remaining(59), 1);
        assert_eq!(seconds_remaining(60), 30);
        assert_eq!(seconds_remaining(0), 30);
        for t in 0..120 {
            let elapsed = (t % STEP) as u32;
            assert_eq!(seconds_remaining(t) + elapsed, 30);
        }
    }

    #[test]
    fn tolerant_decoding_yields_identical_codes() {
        let canonical = generate("JBSWY3DPEHPK3PXP", 59).unwrap().code;
        assert_eq!(generate("jbswy3dpehpk3pxp", 59).unwrap().code, canonical);
        assert_eq!(generate("JBSWY3DPEHPK3PXP===", 59).unwrap().code, canonical);
        assert_eq!(generate("JBSW Y3DP EHPK 3PXP", 59).unwrap().code, canonical);
    }

    #[test]
    fn invalid_characters_fail_validation() {
        for secret in ["JBSWY3DP1", "JBSWY3DP!", "JBSWY3DP0", "JBSWY3DP8"] {
            assert!(
                matches!(generate(secret, 59), Err(VaultError::Validation { .. })),
                "secret {:?} should be rejected",
                secret
            );
        }
    }

    #[test]
    fn empty_secret_fails_validation() {
        assert!(matches!(
            generate("   ", 59),
            Err(VaultError::Validation { .. })
        ));
        assert!(matches!(
            generate("===", 59),
            Err(VaultError::Validation { .. })
        ));
    }

    #[test]
    fn code_and_remaining_travel_together() {
        let totp = generate(RFC_SECRET, 59).unwrap();
        assert_eq!(totp.code, "287082");
        assert_eq!(totp.seconds_remaining, 1);
    }
}
