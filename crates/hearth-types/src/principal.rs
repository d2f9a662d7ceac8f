//! Principal identity derivation.
//!
//! A principal key (an opaque stable string, e.g. a Threema ID or an email)
//! maps to a UUIDv5 in a fixed namespace so the same key always yields the
//! same `user_id` across processes and restarts. Keys that already look
//! like UUIDs pass through unchanged.

use uuid::Uuid;

/// Synthetic principal holding household-wide records.
pub const FAMILY_DEFAULT_KEY: &str = "family_default";

/// Derive the stable principal id for a key.
pub fn principal_id_for_key(key: &str) -> Uuid {
    let cleaned = key.trim();
    if let Ok(id) = Uuid::parse_str(cleaned) {
        return id;
    }
    Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("hearth:{cleaned}").as_bytes())
}

/// The id of the synthetic `family_default` principal.
pub fn family_default_id() -> Uuid {
    principal_id_for_key(FAMILY_DEFAULT_KEY)
}
