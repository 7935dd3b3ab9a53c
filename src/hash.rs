use std::fmt;
use std::io::{copy, Read};

// Keep the digest engine encapsulated so a future algorithm swap stays local
pub struct Hasher(blake3::Hasher);

impl Hasher {
    pub fn new() -> Hasher {
        Hasher(blake3::Hasher::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> Digest {
        Digest(self.0.finalize())
    }
}

impl Default for Hasher {
    fn default() -> Hasher {
        Hasher::new()
    }
}

/// Content digest as recorded in archive record headers.
///
/// The header form is `blake3:<hex>` so consumers can tell which engine
/// produced the value.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Digest(blake3::Hash);

impl Digest {
    pub fn of<R: Read>(data: &mut R) -> Result<Digest, std::io::Error> {
        let mut hash = blake3::Hasher::new();
        copy(data, &mut hash)?;
        Ok(Digest(hash.finalize()))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.as_bytes())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blake3:{}", self.to_hex())
    }
}
