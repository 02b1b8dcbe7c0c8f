//! Shared-secret auth gate (spec §6, §10.6). Constant-time comparison so a
//! coordinator exposed to an untrusted LAN doesn't leak secret length/prefix
//! through response timing.

use subtle::ConstantTimeEq;

use crate::error::CoreError;

/// Compares `presented` against `expected` in constant time and maps a
/// mismatch to [`CoreError::Unauthorized`]. `expected` of `None` means the
/// coordinator has no secret configured and every request is admitted.
pub fn verify_shared_secret(expected: Option<&str>, presented: Option<&str>) -> Result<(), CoreError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let presented = presented.ok_or(CoreError::Unauthorized)?;

    if expected.len() != presented.len() {
        return Err(CoreError::Unauthorized);
    }
    if expected.as_bytes().ct_eq(presented.as_bytes()).into() {
        Ok(())
    } else {
        Err(CoreError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_secret_configured_admits_everything() {
        assert!(verify_shared_secret(None, None).is_ok());
        assert!(verify_shared_secret(None, Some("anything")).is_ok());
    }

    #[test]
    fn matching_secret_is_admitted() {
        assert!(verify_shared_secret(Some("s3cret"), Some("s3cret")).is_ok());
    }

    #[test]
    fn missing_or_wrong_secret_is_rejected() {
        assert!(verify_shared_secret(Some("s3cret"), None).is_err());
        assert!(verify_shared_secret(Some("s3cret"), Some("wrong")).is_err());
        assert!(verify_shared_secret(Some("s3cret"), Some("s3cre")).is_err());
    }
}
