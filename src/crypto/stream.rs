//! Stream cipher support
//!
//! All supported methods are classic stream-mode ciphers with a 16-byte IV:
//! AES in CTR and CFB mode and Camellia in CFB mode. CFB state is kept
//! across updates so chunk boundaries can fall anywhere, including inside
//! a cipher block.

use aes::{Aes128, Aes192, Aes256};
use camellia::{Camellia128, Camellia192, Camellia256};
use cfb_mode::{BufDecryptor, BufEncryptor};
use cipher::{InvalidLength, KeyIvInit, StreamCipher};
use ctr::Ctr128BE;

use crate::error::{Error, Result};

// ============================================================================
// Cipher Kind
// ============================================================================

/// Supported stream cipher methods.
///
/// Method names are case-sensitive and restricted to this closed list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    Aes128Ctr,
    Aes192Ctr,
    Aes256Ctr,
    Aes128Cfb,
    Aes192Cfb,
    Aes256Cfb,
    Camellia128Cfb,
    Camellia192Cfb,
    Camellia256Cfb,
}

impl CipherKind {
    /// Parse a method name. Unknown names are a validation error.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "aes-128-ctr" => Ok(CipherKind::Aes128Ctr),
            "aes-192-ctr" => Ok(CipherKind::Aes192Ctr),
            "aes-256-ctr" => Ok(CipherKind::Aes256Ctr),
            "aes-128-cfb" => Ok(CipherKind::Aes128Cfb),
            "aes-192-cfb" => Ok(CipherKind::Aes192Cfb),
            "aes-256-cfb" => Ok(CipherKind::Aes256Cfb),
            "camellia-128-cfb" => Ok(CipherKind::Camellia128Cfb),
            "camellia-192-cfb" => Ok(CipherKind::Camellia192Cfb),
            "camellia-256-cfb" => Ok(CipherKind::Camellia256Cfb),
            other => Err(Error::PresetValidation(format!(
                "unsupported cipher method: {}",
                other
            ))),
        }
    }

    /// Method name as it appears in configuration
    pub fn name(&self) -> &'static str {
        match self {
            CipherKind::Aes128Ctr => "aes-128-ctr",
            CipherKind::Aes192Ctr => "aes-192-ctr",
            CipherKind::Aes256Ctr => "aes-256-ctr",
            CipherKind::Aes128Cfb => "aes-128-cfb",
            CipherKind::Aes192Cfb => "aes-192-cfb",
            CipherKind::Aes256Cfb => "aes-256-cfb",
            CipherKind::Camellia128Cfb => "camellia-128-cfb",
            CipherKind::Camellia192Cfb => "camellia-192-cfb",
            CipherKind::Camellia256Cfb => "camellia-256-cfb",
        }
    }

    /// Key length in bytes
    pub fn key_len(&self) -> usize {
        match self {
            CipherKind::Aes128Ctr | CipherKind::Aes128Cfb | CipherKind::Camellia128Cfb => 16,
            CipherKind::Aes192Ctr | CipherKind::Aes192Cfb | CipherKind::Camellia192Cfb => 24,
            CipherKind::Aes256Ctr | CipherKind::Aes256Cfb | CipherKind::Camellia256Cfb => 32,
        }
    }

    /// IV length in bytes (16 for every supported method)
    pub fn iv_len(&self) -> usize {
        16
    }

    /// All supported methods (used by validation messages and tests)
    pub fn all() -> &'static [CipherKind] {
        &[
            CipherKind::Aes128Ctr,
            CipherKind::Aes192Ctr,
            CipherKind::Aes256Ctr,
            CipherKind::Aes128Cfb,
            CipherKind::Aes192Cfb,
            CipherKind::Aes256Cfb,
            CipherKind::Camellia128Cfb,
            CipherKind::Camellia192Cfb,
            CipherKind::Camellia256Cfb,
        ]
    }
}

impl std::fmt::Display for CipherKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Stream Crypter
// ============================================================================

enum Inner {
    Aes128Ctr(Ctr128BE<Aes128>),
    Aes192Ctr(Ctr128BE<Aes192>),
    Aes256Ctr(Ctr128BE<Aes256>),
    Aes128CfbEnc(BufEncryptor<Aes128>),
    Aes128CfbDec(BufDecryptor<Aes128>),
    Aes192CfbEnc(BufEncryptor<Aes192>),
    Aes192CfbDec(BufDecryptor<Aes192>),
    Aes256CfbEnc(BufEncryptor<Aes256>),
    Aes256CfbDec(BufDecryptor<Aes256>),
    Camellia128CfbEnc(BufEncryptor<Camellia128>),
    Camellia128CfbDec(BufDecryptor<Camellia128>),
    Camellia192CfbEnc(BufEncryptor<Camellia192>),
    Camellia192CfbDec(BufDecryptor<Camellia192>),
    Camellia256CfbEnc(BufEncryptor<Camellia256>),
    Camellia256CfbDec(BufDecryptor<Camellia256>),
}

#[derive(Clone, Copy)]
enum Direction {
    Encrypt,
    Decrypt,
}

/// A stateful stream cipher bound to one direction of one relay.
///
/// The internal state is mutated in place on every update and is never
/// shared across relays.
pub struct StreamCrypter {
    kind: CipherKind,
    inner: Inner,
}

fn bad_len(_: InvalidLength) -> Error {
    Error::Crypto("invalid key or IV length".into())
}

impl StreamCrypter {
    /// Create the encrypting half for `(kind, key, iv)`
    pub fn encryptor(kind: CipherKind, key: &[u8], iv: &[u8]) -> Result<Self> {
        Self::build(kind, key, iv, Direction::Encrypt)
    }

    /// Create the decrypting half for `(kind, key, iv)`
    pub fn decryptor(kind: CipherKind, key: &[u8], iv: &[u8]) -> Result<Self> {
        Self::build(kind, key, iv, Direction::Decrypt)
    }

    fn build(kind: CipherKind, key: &[u8], iv: &[u8], dir: Direction) -> Result<Self> {
        use Direction::*;

        let inner = match (kind, dir) {
            // CTR is its own inverse: the same keystream is XOR-ed both ways
            (CipherKind::Aes128Ctr, _) => {
                Inner::Aes128Ctr(Ctr128BE::new_from_slices(key, iv).map_err(bad_len)?)
            }
            (CipherKind::Aes192Ctr, _) => {
                Inner::Aes192Ctr(Ctr128BE::new_from_slices(key, iv).map_err(bad_len)?)
            }
            (CipherKind::Aes256Ctr, _) => {
                Inner::Aes256Ctr(Ctr128BE::new_from_slices(key, iv).map_err(bad_len)?)
            }
            (CipherKind::Aes128Cfb, Encrypt) => {
                Inner::Aes128CfbEnc(BufEncryptor::new_from_slices(key, iv).map_err(bad_len)?)
            }
            (CipherKind::Aes128Cfb, Decrypt) => {
                Inner::Aes128CfbDec(BufDecryptor::new_from_slices(key, iv).map_err(bad_len)?)
            }
            (CipherKind::Aes192Cfb, Encrypt) => {
                Inner::Aes192CfbEnc(BufEncryptor::new_from_slices(key, iv).map_err(bad_len)?)
            }
            (CipherKind::Aes192Cfb, Decrypt) => {
                Inner::Aes192CfbDec(BufDecryptor::new_from_slices(key, iv).map_err(bad_len)?)
            }
            (CipherKind::Aes256Cfb, Encrypt) => {
                Inner::Aes256CfbEnc(BufEncryptor::new_from_slices(key, iv).map_err(bad_len)?)
            }
            (CipherKind::Aes256Cfb, Decrypt) => {
                Inner::Aes256CfbDec(BufDecryptor::new_from_slices(key, iv).map_err(bad_len)?)
            }
            (CipherKind::Camellia128Cfb, Encrypt) => Inner::Camellia128CfbEnc(
                BufEncryptor::new_from_slices(key, iv).map_err(bad_len)?,
            ),
            (CipherKind::Camellia128Cfb, Decrypt) => Inner::Camellia128CfbDec(
                BufDecryptor::new_from_slices(key, iv).map_err(bad_len)?,
            ),
            (CipherKind::Camellia192Cfb, Encrypt) => Inner::Camellia192CfbEnc(
                BufEncryptor::new_from_slices(key, iv).map_err(bad_len)?,
            ),
            (CipherKind::Camellia192Cfb, Decrypt) => Inner::Camellia192CfbDec(
                BufDecryptor::new_from_slices(key, iv).map_err(bad_len)?,
            ),
            (CipherKind::Camellia256Cfb, Encrypt) => Inner::Camellia256CfbEnc(
                BufEncryptor::new_from_slices(key, iv).map_err(bad_len)?,
            ),
            (CipherKind::Camellia256Cfb, Decrypt) => Inner::Camellia256CfbDec(
                BufDecryptor::new_from_slices(key, iv).map_err(bad_len)?,
            ),
        };

        Ok(Self { kind, inner })
    }

    /// The method this crypter was built with
    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    /// Transform `data` in place, advancing the cipher state
    pub fn update(&mut self, data: &mut [u8]) {
        match &mut self.inner {
            Inner::Aes128Ctr(c) => c.apply_keystream(data),
            Inner::Aes192Ctr(c) => c.apply_keystream(data),
            Inner::Aes256Ctr(c) => c.apply_keystream(data),
            Inner::Aes128CfbEnc(c) => c.encrypt(data),
            Inner::Aes128CfbDec(c) => c.decrypt(data),
            Inner::Aes192CfbEnc(c) => c.encrypt(data),
            Inner::Aes192CfbDec(c) => c.decrypt(data),
            Inner::Aes256CfbEnc(c) => c.encrypt(data),
            Inner::Aes256CfbDec(c) => c.decrypt(data),
            Inner::Camellia128CfbEnc(c) => c.encrypt(data),
            Inner::Camellia128CfbDec(c) => c.decrypt(data),
            Inner::Camellia192CfbEnc(c) => c.encrypt(data),
            Inner::Camellia192CfbDec(c) => c.decrypt(data),
            Inner::Camellia256CfbEnc(c) => c.encrypt(data),
            Inner::Camellia256CfbDec(c) => c.decrypt(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::evp_bytes_to_key;

    const PLAINTEXT: &[u8] = b"the quick brown fox jumps over the lazy dog, twice around the block";

    fn key_iv(kind: CipherKind) -> (Vec<u8>, Vec<u8>) {
        (evp_bytes_to_key(b"secret", kind.key_len()), vec![0x24; kind.iv_len()])
    }

    #[test]
    fn test_from_name_closed_list() {
        for kind in CipherKind::all() {
            assert_eq!(CipherKind::from_name(kind.name()).unwrap(), *kind);
        }
        assert!(CipherKind::from_name("aes-256-gcm").is_err());
        assert!(CipherKind::from_name("AES-256-CTR").is_err()); // case-sensitive
        assert!(CipherKind::from_name("").is_err());
    }

    #[test]
    fn test_roundtrip_all_methods() {
        for kind in CipherKind::all() {
            let (key, iv) = key_iv(*kind);
            let mut enc = StreamCrypter::encryptor(*kind, &key, &iv).unwrap();
            let mut dec = StreamCrypter::decryptor(*kind, &key, &iv).unwrap();

            let mut data = PLAINTEXT.to_vec();
            enc.update(&mut data);
            assert_ne!(&data[..], PLAINTEXT, "{} produced identity", kind);
            dec.update(&mut data);
            assert_eq!(&data[..], PLAINTEXT, "{} failed round trip", kind);
        }
    }

    #[test]
    fn test_chunked_updates_match_single_shot() {
        // Chunk boundaries inside a cipher block must not change the output
        for kind in CipherKind::all() {
            let (key, iv) = key_iv(*kind);

            let mut whole = PLAINTEXT.to_vec();
            StreamCrypter::encryptor(*kind, &key, &iv)
                .unwrap()
                .update(&mut whole);

            let mut chunked = PLAINTEXT.to_vec();
            let mut enc = StreamCrypter::encryptor(*kind, &key, &iv).unwrap();
            let (a, rest) = chunked.split_at_mut(7);
            let (b, c) = rest.split_at_mut(9);
            enc.update(a);
            enc.update(b);
            enc.update(c);

            assert_eq!(whole, chunked, "{} chunking changed output", kind);
        }
    }

    #[test]
    fn test_ctr_is_symmetric() {
        let kind = CipherKind::Aes256Ctr;
        let (key, iv) = key_iv(kind);
        let mut enc = StreamCrypter::encryptor(kind, &key, &iv).unwrap();
        let mut dec = StreamCrypter::decryptor(kind, &key, &iv).unwrap();

        let mut a = PLAINTEXT.to_vec();
        let mut b = PLAINTEXT.to_vec();
        enc.update(&mut a);
        dec.update(&mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_rejects_bad_key_length() {
        assert!(StreamCrypter::encryptor(CipherKind::Aes256Ctr, &[0u8; 16], &[0u8; 16]).is_err());
    }
}
