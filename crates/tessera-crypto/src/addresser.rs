use tessera_types::Cid;

/// Domain-separated BLAKE3 content addresser.
///
/// Each addresser carries a domain tag that is prepended to every hash
/// computation and a codec tag that is stamped on the resulting [`Cid`].
/// Two payloads with identical bytes but different domains never share an
/// address.
///
/// Addressing is a pure function: callers are responsible for producing
/// canonical bytes (identical logical content must serialize identically).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContentAddresser {
    domain: &'static str,
    codec: u8,
}

impl ContentAddresser {
    /// Addresser for commit blocks.
    pub const COMMIT: Self = Self {
        domain: "tessera-commit-v1",
        codec: Cid::DAG_COMMIT,
    };

    /// Create an addresser with a custom domain and codec tag.
    pub const fn new(domain: &'static str, codec: u8) -> Self {
        Self { domain, codec }
    }

    /// Compute the address of canonical payload bytes.
    pub fn address(&self, data: &[u8]) -> Cid {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.domain.as_bytes());
        hasher.update(b":");
        hasher.update(data);
        Cid::new(self.codec, *hasher.finalize().as_bytes())
    }

    /// Verify that data addresses to the expected CID.
    pub fn verify(&self, data: &[u8], expected: &Cid) -> bool {
        self.address(data) == *expected
    }

    /// The domain tag used by this addresser.
    pub fn domain(&self) -> &str {
        self.domain
    }

    /// The codec tag stamped on produced CIDs.
    pub fn codec(&self) -> u8 {
        self.codec
    }
}
