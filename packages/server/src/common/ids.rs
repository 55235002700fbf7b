use base64::Engine;
use rand::RngCore;
use uuid::Uuid;

/// Generate an opaque entity/job ID.
pub fn db_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generate a URL-safe secret token with at least 256 bits of entropy.
/// Used for workspace invite links.
pub fn secret_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
