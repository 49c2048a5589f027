use serde::{Deserialize, Serialize};

/// A 32-byte BLAKE3 hash used for content-addressing and change detection.
///
/// In `shadepack`, this serves two purposes:
/// 1. It acts as a fingerprint of task inputs, so that a task whose inputs did
///    not change since its last successful run can be skipped as up to date.
/// 2. It compares the produced package against the copy already present in
///    the deployment directory.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn hash_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(blake3::Hasher::new().update_mmap(path)?.finalize().into())
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in &self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl std::fmt::Display for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex()[..12])
    }
}

/// Incremental fingerprint builder.
///
/// Every field is length-prefixed, so `("ab", "c")` and `("a", "bc")` never
/// hash to the same value.
#[derive(Default)]
pub struct Fingerprint(blake3::Hasher);

impl Fingerprint {
    pub fn new(domain: &str) -> Self {
        let mut this = Self(blake3::Hasher::new());
        this.field(domain);
        this
    }

    pub fn field(&mut self, bytes: impl AsRef<[u8]>) -> &mut Self {
        let bytes = bytes.as_ref();
        self.0.update(&(bytes.len() as u64).to_le_bytes());
        self.0.update(bytes);
        self
    }

    pub fn hash(&mut self, hash: Hash32) -> &mut Self {
        self.0.update(&hash.0);
        self
    }

    pub fn finish(&self) -> Hash32 {
        self.0.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip_length() {
        let hash = Hash32::hash(b"shadepack");
        assert_eq!(hash.to_hex().len(), 64);
        assert_eq!(hash.to_string().len(), 12);
    }

    #[test]
    fn test_fingerprint_fields_are_delimited() {
        let a = Fingerprint::new("t").field("ab").field("c").finish();
        let b = Fingerprint::new("t").field("a").field("bc").finish();
        assert_ne!(a, b);
    }

    #[test]
    fn test_fingerprint_domain_separates() {
        let a = Fingerprint::new("compile").field("x").finish();
        let b = Fingerprint::new("package").field("x").finish();
        assert_ne!(a, b);
    }
}
