//! Repeating-key XOR stream transform.
//!
//! This obscures payloads; it does not provide confidentiality or
//! integrity.

/// The 64-bit secret both ends derive during key agreement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SharedSecret(pub u64);

impl SharedSecret {
    /// Key schedule: byte `i` of the little-endian representation keys
    /// every buffer position congruent to `i` modulo 8.
    #[must_use]
    pub fn key_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

/// XORs `buf` in place with the key schedule of `key`.
///
/// The transform is its own inverse. Callers pass exactly the bytes that
/// went over the wire (a short trailing chunk is transformed over its own
/// length only), and each call restarts the schedule at key byte 0.
pub fn apply(buf: &mut [u8], key: SharedSecret) {
    let schedule = key.key_bytes();
    for (byte, k) in buf.iter_mut().zip(schedule.iter().cycle()) {
        *byte ^= k;
    }
}

/// Owned variant of [`apply`].
#[must_use]
pub fn transform(mut buf: Vec<u8>, key: SharedSecret) -> Vec<u8> {
    apply(&mut buf, key);
    buf
}
