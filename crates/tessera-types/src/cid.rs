use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Version byte of the binary CID layout.
pub const CID_VERSION: u8 = 1;

/// Multihash code identifying BLAKE3-256 digests.
pub const HASH_BLAKE3: u8 = 0x1e;

/// Length of the binary form: version, codec, hash code, then 32 digest bytes.
pub const CID_LEN: usize = 35;

/// Content identifier for a commit block.
///
/// A `Cid` is a 32-byte BLAKE3 digest of a block's canonical bytes, wrapped
/// with a codec tag naming how those bytes are encoded. Identical content
/// always produces the same `Cid`.
///
/// Ordering compares the codec tag first and then the digest, which is the
/// same order as comparing [`Cid::to_bytes`] lexicographically.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cid {
    codec: u8,
    digest: [u8; 32],
}

impl Cid {
    /// Codec tag for bincode-encoded commit blocks.
    pub const DAG_COMMIT: u8 = 0x71;

    /// Wrap a pre-computed digest with a codec tag.
    pub const fn new(codec: u8, digest: [u8; 32]) -> Self {
        Self { codec, digest }
    }

    /// The codec tag.
    pub fn codec(&self) -> u8 {
        self.codec
    }

    /// The raw 32-byte digest.
    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }

    /// Binary form: `[version][codec][hash code][digest]`.
    pub fn to_bytes(&self) -> [u8; CID_LEN] {
        let mut out = [0u8; CID_LEN];
        out[0] = CID_VERSION;
        out[1] = self.codec;
        out[2] = HASH_BLAKE3;
        out[3..].copy_from_slice(&self.digest);
        out
    }

    /// Parse the binary form produced by [`Cid::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TypeError> {
        if bytes.len() != CID_LEN {
            return Err(TypeError::InvalidLength {
                expected: CID_LEN,
                actual: bytes.len(),
            });
        }
        if bytes[0] != CID_VERSION {
            return Err(TypeError::UnsupportedCid(format!("version {}", bytes[0])));
        }
        if bytes[2] != HASH_BLAKE3 {
            return Err(TypeError::UnsupportedCid(format!(
                "hash code {:#04x}",
                bytes[2]
            )));
        }
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&bytes[3..]);
        Ok(Self {
            codec: bytes[1],
            digest,
        })
    }

    /// Hex-encoded binary form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Short hex representation of the digest (first 8 characters).
    pub fn short_hex(&self) -> String {
        hex::encode(&self.digest[..4])
    }

    /// Parse from the hex string produced by [`Cid::to_hex`].
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({})", self.short_hex())
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::str::FromStr for Cid {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn cid(byte: u8) -> Cid {
        Cid::new(Cid::DAG_COMMIT, [byte; 32])
    }

    #[test]
    fn binary_layout() {
        let bytes = cid(7).to_bytes();
        assert_eq!(bytes.len(), CID_LEN);
        assert_eq!(bytes[0], CID_VERSION);
        assert_eq!(bytes[1], Cid::DAG_COMMIT);
        assert_eq!(bytes[2], HASH_BLAKE3);
        assert!(bytes[3..].iter().all(|b| *b == 7));
    }

    #[test]
    fn hex_roundtrip() {
        let id = cid(42);
        let parsed = Cid::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, parsed);
        let parsed: Cid = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn rejects_wrong_length() {
        let err = Cid::from_bytes(&[1, 2, 3]).unwrap_err();
        assert_eq!(
            err,
            TypeError::InvalidLength {
                expected: CID_LEN,
                actual: 3
            }
        );
    }

    #[test]
    fn rejects_unknown_version_and_hash() {
        let mut bytes = cid(1).to_bytes();
        bytes[0] = 9;
        assert!(matches!(
            Cid::from_bytes(&bytes),
            Err(TypeError::UnsupportedCid(_))
        ));

        let mut bytes = cid(1).to_bytes();
        bytes[2] = 0x12;
        assert!(matches!(
            Cid::from_bytes(&bytes),
            Err(TypeError::UnsupportedCid(_))
        ));
    }

    #[test]
    fn rejects_bad_hex() {
        assert!(matches!(Cid::from_hex("zz"), Err(TypeError::InvalidHex(_))));
    }

    #[test]
    fn short_hex_is_8_chars() {
        assert_eq!(cid(3).short_hex().len(), 8);
        assert_eq!(format!("{:?}", cid(0)), "Cid(00000000)");
    }

    #[test]
    fn serde_roundtrip() {
        let id = cid(5);
        let json = serde_json::to_string(&id).unwrap();
        let parsed: Cid = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    proptest! {
        #[test]
        fn ordering_matches_binary_order(
            a in any::<[u8; 32]>(),
            b in any::<[u8; 32]>(),
            ca in any::<u8>(),
            cb in any::<u8>(),
        ) {
            let x = Cid::new(ca, a);
            let y = Cid::new(cb, b);
            prop_assert_eq!(x.cmp(&y), x.to_bytes().cmp(&y.to_bytes()));
        }
    }
}
