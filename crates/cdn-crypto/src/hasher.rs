use cdn_types::Locator;

/// Domain-separated BLAKE3 content hasher.
///
/// Each hasher carries a domain tag that is prepended to every hash
/// computation, so locators derived for items can never collide with digests
/// computed for other purposes over the same bytes.
pub struct ContentHasher {
    domain: &'static str,
}

impl ContentHasher {
    /// Hasher for item content; produces item locators.
    pub const ITEM: Self = Self {
        domain: "cdn-item-v1",
    };

    /// Create a hasher with a custom domain tag.
    pub const fn new(domain: &'static str) -> Self {
        Self { domain }
    }

    /// Hash raw bytes with domain separation.
    pub fn hash(&self, data: &[u8]) -> [u8; 32] {
        let mut hasher = self.streaming();
        hasher.update(data);
        hasher.finalize()
    }

    /// Locator for `data`: the hex-encoded domain-separated digest.
    pub fn locator(&self, data: &[u8]) -> Locator {
        Locator::from_digest(&self.hash(data))
    }

    /// Incremental hasher for content that arrives in pieces.
    pub fn streaming(&self) -> StreamingHasher {
        let mut inner = blake3::Hasher::new();
        inner.update(self.domain.as_bytes());
        inner.update(b":");
        StreamingHasher { inner, len: 0 }
    }
}

/// Incremental form of [`ContentHasher`].
pub struct StreamingHasher {
    inner: blake3::Hasher,
    len: u64,
}

impl StreamingHasher {
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.len += data.len() as u64;
    }

    /// Number of content bytes hashed so far.
    pub fn bytes(&self) -> u64 {
        self.len
    }

    pub fn finalize(&self) -> [u8; 32] {
        *self.inner.finalize().as_bytes()
    }

    pub fn finalize_locator(&self) -> Locator {
        Locator::from_digest(&self.finalize())
    }
}
