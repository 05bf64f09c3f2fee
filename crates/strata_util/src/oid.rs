//! Object-id generation for peers and metadata blocks.

use rand::RngCore;

/// Length in hex characters of every object id in the system.
pub const OBJECT_ID_LEN: usize = 32;

/// Generate a random 32-hex-char object id.
pub fn generate_object_id() -> String {
    let mut bytes = [0u8; OBJECT_ID_LEN / 2];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut out = String::with_capacity(OBJECT_ID_LEN);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_32_hex_chars_and_distinct() {
        let a = generate_object_id();
        let b = generate_object_id();
        assert_eq!(a.len(), OBJECT_ID_LEN);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
