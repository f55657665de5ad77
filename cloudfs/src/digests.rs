use bytes::Bytes;
use data_encoding::HEXLOWER;
use thiserror::Error;

/// The BLAKE3 digest of a block's contents.
/// Blocks are content-addressed, the lowercase hex encoding of this digest is
/// part of the backend key the block bytes are stored at.
#[derive(PartialEq, Eq, Hash, Clone)]
pub struct B3Digest(Bytes);

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid digest length: {0}")]
    InvalidDigestLen(usize),
}

pub const B3_LEN: usize = 32;

impl B3Digest {
    /// Hashes the passed data.
    pub fn of(data: &[u8]) -> Self {
        blake3::hash(data).into()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0[..]
    }

    /// Lowercase hex encoding, as used in backend keys.
    pub fn to_hex(&self) -> String {
        HEXLOWER.encode(&self.0)
    }
}

impl From<B3Digest> for Bytes {
    fn from(val: B3Digest) -> Self {
        val.0
    }
}

impl From<blake3::Hash> for B3Digest {
    fn from(value: blake3::Hash) -> Self {
        Self(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl TryFrom<Bytes> for B3Digest {
    type Error = Error;

    // Returns an error if the digest has the wrong length.
    fn try_from(value: Bytes) -> Result<Self, Self::Error> {
        if value.len() != B3_LEN {
            Err(Error::InvalidDigestLen(value.len()))
        } else {
            Ok(Self(value))
        }
    }
}

impl From<&[u8; B3_LEN]> for B3Digest {
    fn from(value: &[u8; B3_LEN]) -> Self {
        Self(Bytes::copy_from_slice(value))
    }
}

impl std::fmt::Display for B3Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "b3:{}", HEXLOWER.encode(&self.0))
    }
}

impl std::fmt::Debug for B3Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "b3:{}", HEXLOWER.encode(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::B3Digest;
    use bytes::Bytes;

    #[test]
    fn wrong_length_rejected() {
        assert!(B3Digest::try_from(Bytes::from_static(b"short")).is_err());
    }

    #[test]
    fn hex_matches_blake3() {
        let digest = B3Digest::of(b"Hello World!");
        assert_eq!(blake3::hash(b"Hello World!").to_hex().as_str(), digest.to_hex());
        assert_eq!(format!("b3:{}", digest.to_hex()), digest.to_string());
    }
}
