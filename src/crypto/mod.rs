//! Cryptography module for Tunium
//!
//! Provides the primitives the preset protocols compose:
//! - EVP_BytesToKey (MD5-based, openssl-compatible) key derivation
//! - HMAC-SHA1 authentication tags with constant-time comparison
//! - Stream ciphers: AES-CTR, AES-CFB, Camellia-CFB

mod stream;

pub use stream::{CipherKind, StreamCrypter};

use hmac::{Hmac, Mac};
use sha1::Sha1;
use subtle::ConstantTimeEq;

type HmacSha1 = Hmac<Sha1>;

/// IV length used by all supported stream ciphers (16 bytes)
pub const IV_SIZE: usize = 16;

/// Truncated HMAC tag length carried on the wire (16 bytes)
pub const TAG_SIZE: usize = 16;

/// Generate cryptographically secure random bytes
pub fn random_bytes(len: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Generate a random 16-byte IV
pub fn random_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    use rand::RngCore;
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

/// Derive a key from a passphrase with the historical openssl
/// EVP_BytesToKey routine (MD5, no salt, single iteration).
///
/// `D_1 = MD5(passphrase)`, `D_i = MD5(D_{i-1} || passphrase)`; the key is
/// the first `key_len` bytes of `D_1 || D_2 || ...`. Only the key is
/// derived; the IV is sampled fresh per connection.
pub fn evp_bytes_to_key(passphrase: &[u8], key_len: usize) -> Vec<u8> {
    let mut derived = Vec::with_capacity(key_len + 16);
    let mut last: Option<md5::Digest> = None;

    while derived.len() < key_len {
        let mut input = Vec::with_capacity(16 + passphrase.len());
        if let Some(digest) = &last {
            input.extend_from_slice(&digest.0);
        }
        input.extend_from_slice(passphrase);
        let digest = md5::compute(&input);
        derived.extend_from_slice(&digest.0);
        last = Some(digest);
    }

    derived.truncate(key_len);
    derived
}

/// Compute HMAC-SHA1
pub fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; 20] {
    let mut mac =
        <HmacSha1 as Mac>::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    let result = mac.finalize().into_bytes();
    let mut out = [0u8; 20];
    out.copy_from_slice(&result);
    out
}

/// Compute the truncated HMAC-SHA1 tag carried on the wire
pub fn hmac_sha1_tag(key: &[u8], data: &[u8]) -> [u8; TAG_SIZE] {
    let full = hmac_sha1(key, data);
    let mut tag = [0u8; TAG_SIZE];
    tag.copy_from_slice(&full[..TAG_SIZE]);
    tag
}

/// Constant-time equality for authentication tags
pub fn tags_equal(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}
