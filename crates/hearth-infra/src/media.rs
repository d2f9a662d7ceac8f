//! Signed media URLs for chart outputs.
//!
//! `/media/<id>?exp=<unix-ts>&sig=<hex>` where the signature covers the
//! media id and expiry under `SIGNING_SECRET`. Without a configured secret
//! everything is public (dev mode).

use sha2::{Digest, Sha256};

/// Hex signature over `(secret, media_id, expires)`.
pub fn signature(secret: &str, media_id: &str, expires: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update([0]);
    hasher.update(media_id.as_bytes());
    hasher.update([0]);
    hasher.update(expires.to_le_bytes());
    format!("{:x}", hasher.finalize())
}

/// Signed path for a media id, valid for `ttl_seconds` from `now_unix`.
pub fn signed_path(media_id: &str, secret: Option<&str>, now_unix: i64, ttl_seconds: i64) -> String {
    match secret {
        Some(secret) => {
            let expires = now_unix + ttl_seconds;
            let sig = signature(secret, media_id, expires);
            format!("/media/{media_id}?exp={expires}&sig={sig}")
        }
        None => format!("/media/{media_id}"),
    }
}

/// Verify a signed request. Always true when no secret is configured.
pub fn verify(
    secret: Option<&str>,
    media_id: &str,
    expires: Option<i64>,
    sig: Option<&str>,
    now_unix: i64,
) -> bool {
    let Some(secret) = secret else { return true };
    let (Some(expires), Some(sig)) = (expires, sig) else {
        return false;
    };
    if expires < now_unix {
        return false;
    }
    signature(secret, media_id, expires) == sig
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signed_path_round_trip() {
        let path = signed_path("chart-1.png", Some("s3cret"), 1_000, 3600);
        assert!(path.starts_with("/media/chart-1.png?exp=4600&sig="));

        let sig = path.split("sig=").nth(1).unwrap();
        assert!(verify(Some("s3cret"), "chart-1.png", Some(4600), Some(sig), 2_000));
    }

    #[test]
    fn test_expired_signature_rejected() {
        let sig = signature("s3cret", "chart-1.png", 4600);
        assert!(!verify(Some("s3cret"), "chart-1.png", Some(4600), Some(&sig), 5_000));
    }

    #[test]
    fn test_tampered_id_rejected() {
        let sig = signature("s3cret", "chart-1.png", 4600);
        assert!(!verify(Some("s3cret"), "other.png", Some(4600), Some(&sig), 2_000));
    }

    #[test]
    fn test_missing_params_rejected_when_secret_set() {
        assert!(!verify(Some("s3cret"), "chart-1.png", None, None, 0));
    }

    #[test]
    fn test_everything_public_without_secret() {
        assert!(verify(None, "chart-1.png", None, None, 0));
        assert_eq!(signed_path("x.png", None, 0, 0), "/media/x.png");
    }
}
