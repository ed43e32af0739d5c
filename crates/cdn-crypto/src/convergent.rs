//! Convergent encryption.
//!
//! The content key is derived with HKDF-SHA256 from a per-backend secret and
//! the item's locator (itself the content digest), so the same plaintext
//! under the same secret always produces the same ciphertext. Key derivation
//! is pure: no key service, no network round trip.
//!
//! Content is sealed in a chunked AES-256-GCM stream. Every frame is
//!
//! ```text
//! [1 byte: flag (0 = more, 1 = last)]
//! [4 bytes: ciphertext length (little-endian u32)]
//! [N bytes: ciphertext + 16-byte tag]
//! ```
//!
//! and chunk `i` uses nonce `BE64(i) || 00 00 00 || flag`. Binding the flag
//! into the nonce makes truncation at a frame boundary detectable, and the
//! counter makes reordering detectable. A key is only ever used for one
//! plaintext, so deterministic nonces are safe.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use cdn_types::Locator;
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Plaintext bytes per sealed frame.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Minimum accepted secret length in bytes.
pub const MIN_SECRET_LEN: usize = 32;

const TAG_LEN: usize = 16;
const FRAME_HEADER_LEN: usize = 5;
const FLAG_MORE: u8 = 0;
const FLAG_LAST: u8 = 1;
const KEY_SALT: &[u8] = b"cdn-convergent-v1";
const KEY_INFO: &[u8] = b"cdn-convergent-key";

/// Per-backend encryption secret.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Secret(Vec<u8>);

impl Secret {
    pub fn new(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() < MIN_SECRET_LEN {
            return Err(CryptoError::InvalidSecret(format!(
                "expected at least {MIN_SECRET_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    /// Parse a hex-encoded secret.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes =
            hex::decode(s.trim()).map_err(|e| CryptoError::InvalidSecret(e.to_string()))?;
        Self::new(bytes)
    }

    /// Generate a random 32-byte secret.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = vec![0u8; MIN_SECRET_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret([REDACTED])")
    }
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct ContentKey([u8; 32]);

/// Convergent encryption component held by each storage unit driver.
#[derive(Clone, Debug)]
pub struct ConvergentEncryption {
    secret: Secret,
}

impl ConvergentEncryption {
    pub fn new(secret: Secret) -> Self {
        Self { secret }
    }

    fn content_key(&self, locator: &Locator) -> Result<ContentKey, CryptoError> {
        let hk = Hkdf::<Sha256>::new(Some(KEY_SALT), &self.secret.0);
        let mut info = Vec::with_capacity(KEY_INFO.len() + locator.as_bytes().len());
        info.extend_from_slice(KEY_INFO);
        info.extend_from_slice(locator.as_bytes());
        let mut okm = [0u8; 32];
        hk.expand(&info, &mut okm)
            .map_err(|_| CryptoError::KeyDerivation)?;
        Ok(ContentKey(okm))
    }

    fn cipher(&self, locator: &Locator) -> Result<Aes256Gcm, CryptoError> {
        let key = self.content_key(locator)?;
        Aes256Gcm::new_from_slice(&key.0).map_err(|e| CryptoError::Encryption(e.to_string()))
    }

    /// Start sealing the content addressed by `locator`.
    pub fn sealer(&self, locator: &Locator) -> Result<Sealer, CryptoError> {
        Ok(Sealer {
            cipher: self.cipher(locator)?,
            counter: 0,
            pending: Vec::with_capacity(CHUNK_SIZE),
        })
    }

    /// Start opening the content addressed by `locator`.
    pub fn opener(&self, locator: &Locator) -> Result<Opener, CryptoError> {
        Ok(Opener {
            cipher: self.cipher(locator)?,
            counter: 0,
            pending: Vec::new(),
            finished: false,
        })
    }

    /// Seal a complete plaintext in one call.
    pub fn seal_all(&self, locator: &Locator, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut sealer = self.sealer(locator)?;
        let mut out = sealer.update(plaintext)?;
        out.extend(sealer.finish()?);
        Ok(out)
    }

    /// Open a complete ciphertext in one call.
    pub fn open_all(&self, locator: &Locator, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut opener = self.opener(locator)?;
        let out = opener.update(ciphertext)?;
        opener.finish()?;
        Ok(out)
    }
}

fn frame_nonce(counter: u64, flag: u8) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..8].copy_from_slice(&counter.to_be_bytes());
    nonce[11] = flag;
    nonce
}

/// Streaming encryptor. Frames are cut at fixed [`CHUNK_SIZE`] boundaries,
/// so the output does not depend on how the plaintext was split across
/// `update` calls.
pub struct Sealer {
    cipher: Aes256Gcm,
    counter: u64,
    pending: Vec<u8>,
}

impl Sealer {
    /// Feed plaintext; returns every frame completed by it.
    pub fn update(&mut self, mut data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut out = Vec::new();
        while !data.is_empty() {
            let take = (CHUNK_SIZE - self.pending.len()).min(data.len());
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.pending.len() == CHUNK_SIZE {
                let chunk = std::mem::take(&mut self.pending);
                self.seal_frame(&chunk, FLAG_MORE, &mut out)?;
            }
        }
        Ok(out)
    }

    /// Seal whatever is buffered as the final frame (possibly empty).
    pub fn finish(mut self) -> Result<Vec<u8>, CryptoError> {
        let mut out = Vec::with_capacity(self.pending.len() + FRAME_HEADER_LEN + TAG_LEN);
        let chunk = std::mem::take(&mut self.pending);
        self.seal_frame(&chunk, FLAG_LAST, &mut out)?;
        Ok(out)
    }

    fn seal_frame(&mut self, chunk: &[u8], flag: u8, out: &mut Vec<u8>) -> Result<(), CryptoError> {
        let nonce = frame_nonce(self.counter, flag);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), chunk)
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| CryptoError::Encryption("frame counter exhausted".into()))?;
        out.push(flag);
        out.extend_from_slice(&(sealed.len() as u32).to_le_bytes());
        out.extend_from_slice(&sealed);
        Ok(())
    }
}

/// Streaming decryptor. Accepts ciphertext split at arbitrary points.
pub struct Opener {
    cipher: Aes256Gcm,
    counter: u64,
    pending: Vec<u8>,
    finished: bool,
}

impl Opener {
    /// Feed ciphertext; returns the plaintext of every frame completed by it.
    pub fn update(&mut self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.pending.extend_from_slice(data);
        let mut out = Vec::new();
        let mut consumed = 0;
        loop {
            let rest = &self.pending[consumed..];
            if rest.is_empty() {
                break;
            }
            if self.finished {
                return Err(CryptoError::Integrity("data after final frame".into()));
            }
            if rest.len() < FRAME_HEADER_LEN {
                break;
            }
            let flag = rest[0];
            if flag != FLAG_MORE && flag != FLAG_LAST {
                return Err(CryptoError::Integrity(format!("invalid frame flag {flag}")));
            }
            let len = u32::from_le_bytes([rest[1], rest[2], rest[3], rest[4]]) as usize;
            if !(TAG_LEN..=CHUNK_SIZE + TAG_LEN).contains(&len) {
                return Err(CryptoError::Integrity(format!("invalid frame length {len}")));
            }
            if rest.len() < FRAME_HEADER_LEN + len {
                break;
            }
            let sealed = &rest[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len];
            let nonce = frame_nonce(self.counter, flag);
            let plain = self
                .cipher
                .decrypt(Nonce::from_slice(&nonce), sealed)
                .map_err(|_| {
                    CryptoError::Integrity(format!("frame {} failed authentication", self.counter))
                })?;
            out.extend_from_slice(&plain);
            self.counter += 1;
            self.finished = flag == FLAG_LAST;
            consumed += FRAME_HEADER_LEN + len;
        }
        self.pending.drain(..consumed);
        Ok(out)
    }

    /// Confirm the stream ended exactly at its final frame.
    pub fn finish(self) -> Result<(), CryptoError> {
        if !self.finished {
            return Err(CryptoError::Integrity("stream truncated before final frame".into()));
        }
        if !self.pending.is_empty() {
            return Err(CryptoError::Integrity("data after final frame".into()));
        }
        Ok(())
    }
}
