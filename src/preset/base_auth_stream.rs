//! `exp-base-auth-stream` preset
//!
//! Combines address delivery, authentication and stream encryption into a
//! single handshake on the first client-forward chunk:
//!
//! ```text
//! +----+-----------+------+----------+----------+--------------+
//! | IV | HMAC-SHA1 | ALEN | DST.ADDR | DST.PORT |   DATA...    |
//! | 16 |    16     |  1   | ALEN     |    2     |  Variable    |
//! +----+-----------+------+----------+----------+--------------+
//! ```
//!
//! The address header and payload are encrypted with a stream cipher keyed
//! by EVP_BytesToKey(shared secret) and the fresh IV; the tag is HMAC-SHA1
//! over the *encrypted* address header, truncated to 16 bytes
//! (encrypt-then-MAC). All later chunks in either direction are raw cipher
//! stream.
//!
//! Note: cipher and decipher are two independent objects initialized from
//! the same `(key, IV)`, so both directions draw from the same keystream
//! space. That is a property of the wire protocol and is kept as-is.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::common::Address;
use crate::crypto::{
    evp_bytes_to_key, hmac_sha1_tag, random_iv, tags_equal, CipherKind, StreamCrypter,
    IV_SIZE, TAG_SIZE,
};
use crate::error::{Error, Result};

use super::{Preset, PresetAction, PresetContext, PresetSpec, Role};

/// Smallest possible handshake frame:
/// IV(16) + tag(16) + ALEN(1) + addr(1) + port(2) + data(1)
const MIN_HANDSHAKE_LEN: usize = IV_SIZE + TAG_SIZE + 1 + 1 + 2 + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Client: handshake frame not yet sent. Server: still buffering it.
    Handshake,
    /// Server only: address parsed, destination dial in flight
    AwaitConnect,
    /// Handshake complete; both directions are pure cipher stream
    Established,
}

/// The reference address-delivery + authentication + encryption preset
pub struct BaseAuthStreamPreset {
    kind: CipherKind,
    key: Vec<u8>,
    role: Role,
    destination: Option<Address>,
    phase: Phase,
    encipher: Option<StreamCrypter>,
    decipher: Option<StreamCrypter>,
    /// Server: raw bytes accumulated until the handshake frame is complete
    staging: BytesMut,
    /// Server: decrypted payload buffered until the destination is open
    pending: BytesMut,
}

impl BaseAuthStreamPreset {
    pub fn new(spec: &PresetSpec, ctx: &PresetContext) -> Result<Self> {
        let method = spec.str_param("method")?;
        let kind = CipherKind::from_name(method)?;

        if ctx.key.is_empty() {
            return Err(Error::PresetValidation(
                "exp-base-auth-stream requires a non-empty key".into(),
            ));
        }
        if ctx.role == Role::Client && ctx.destination.is_none() {
            return Err(Error::PresetValidation(
                "exp-base-auth-stream requires a destination on the client".into(),
            ));
        }

        Ok(Self {
            kind,
            key: evp_bytes_to_key(ctx.key.as_bytes(), kind.key_len()),
            role: ctx.role,
            destination: ctx.destination.clone(),
            phase: Phase::Handshake,
            encipher: None,
            decipher: None,
            staging: BytesMut::new(),
            pending: BytesMut::new(),
        })
    }

    /// Whether the one-shot handshake has completed for this instance
    pub fn handshake_done(&self) -> bool {
        self.phase == Phase::Established
    }

    fn fail(reason: impl Into<String>) -> PresetAction {
        PresetAction::Fail {
            reason: reason.into(),
        }
    }

    fn encrypt(&mut self, chunk: &[u8]) -> Bytes {
        let mut data = chunk.to_vec();
        // invariant: encipher exists whenever this is reached
        self.encipher
            .as_mut()
            .expect("cipher initialized at handshake")
            .update(&mut data);
        Bytes::from(data)
    }

    fn decrypt(&mut self, chunk: &[u8]) -> Bytes {
        let mut data = chunk.to_vec();
        self.decipher
            .as_mut()
            .expect("decipher initialized at handshake")
            .update(&mut data);
        Bytes::from(data)
    }

    /// Build the handshake frame around the first payload chunk
    fn build_handshake(&mut self, chunk: &[u8]) -> PresetAction {
        let dest = match &self.destination {
            Some(d) => d.clone(),
            None => return Self::fail("no destination for handshake"),
        };

        let mut plaintext = BytesMut::new();
        if let Err(e) = dest.encode(&mut plaintext) {
            return Self::fail(format!("destination not encodable: {}", e));
        }
        let header_len = plaintext.len();
        plaintext.extend_from_slice(chunk);

        let iv = random_iv();
        let mut encipher = match StreamCrypter::encryptor(self.kind, &self.key, &iv) {
            Ok(c) => c,
            Err(e) => return Self::fail(e.to_string()),
        };
        let decipher = match StreamCrypter::decryptor(self.kind, &self.key, &iv) {
            Ok(c) => c,
            Err(e) => return Self::fail(e.to_string()),
        };

        let mut ciphertext = plaintext.to_vec();
        encipher.update(&mut ciphertext);

        // encrypt-then-MAC over the encrypted address header only
        let tag = hmac_sha1_tag(&self.key, &ciphertext[..header_len]);

        let mut frame = BytesMut::with_capacity(IV_SIZE + TAG_SIZE + ciphertext.len());
        frame.put_slice(&iv);
        frame.put_slice(&tag);
        frame.put_slice(&ciphertext);

        self.encipher = Some(encipher);
        self.decipher = Some(decipher);
        self.phase = Phase::Established;
        trace!(dst = %dest, method = %self.kind, "handshake frame built");

        PresetAction::Next(frame.freeze())
    }

    /// Try to parse a complete handshake frame out of the staging buffer
    fn parse_handshake(&mut self) -> PresetAction {
        if self.staging.len() < MIN_HANDSHAKE_LEN {
            return PresetAction::Swallow;
        }

        let iv = &self.staging[..IV_SIZE];
        let mut decipher = match StreamCrypter::decryptor(self.kind, &self.key, iv) {
            Ok(c) => c,
            Err(e) => return Self::fail(e.to_string()),
        };

        // Decrypt a copy of the tail; the staging buffer stays pristine so
        // the relay can still splice the raw bytes on failure.
        let mut tail = self.staging[IV_SIZE + TAG_SIZE..].to_vec();
        decipher.update(&mut tail);

        let alen = tail[0] as usize;
        if alen == 0 {
            return Self::fail("invalid address length");
        }
        // header = ALEN(1) + addr(alen) + port(2), plus at least one data byte
        if self.staging.len() <= IV_SIZE + TAG_SIZE + 3 + alen {
            return PresetAction::Swallow;
        }

        let enc_header = &self.staging[IV_SIZE + TAG_SIZE..IV_SIZE + TAG_SIZE + 3 + alen];
        let expected = hmac_sha1_tag(&self.key, enc_header);
        if !tags_equal(&expected, &self.staging[IV_SIZE..IV_SIZE + TAG_SIZE]) {
            return Self::fail("bad HMAC");
        }

        let port = u16::from_be_bytes([tail[1 + alen], tail[2 + alen]]);
        let addr = match Address::decode(&tail[1..1 + alen], port) {
            Ok(a) => a,
            Err(e) => return Self::fail(format!("bad address: {}", e)),
        };

        self.pending.extend_from_slice(&tail[3 + alen..]);
        self.encipher = match StreamCrypter::encryptor(self.kind, &self.key, iv) {
            Ok(c) => Some(c),
            Err(e) => return Self::fail(e.to_string()),
        };
        // the decipher already advanced over the consumed ciphertext
        self.decipher = Some(decipher);
        self.staging = BytesMut::new();
        self.phase = Phase::AwaitConnect;
        trace!(dst = %addr, method = %self.kind, "handshake frame accepted");

        PresetAction::ConnectToDst { addr }
    }
}

impl Preset for BaseAuthStreamPreset {
    fn name(&self) -> &'static str {
        "exp-base-auth-stream"
    }

    fn client_out(&mut self, chunk: Bytes) -> PresetAction {
        match self.phase {
            Phase::Established => PresetAction::Next(self.encrypt(&chunk)),
            _ => self.build_handshake(&chunk),
        }
    }

    fn server_in(&mut self, chunk: Bytes) -> PresetAction {
        match self.phase {
            Phase::Established => PresetAction::Next(self.decrypt(&chunk)),
            Phase::AwaitConnect => {
                // ciphertext keeps flowing while the dial is in flight
                let plain = self.decrypt(&chunk);
                self.pending.extend_from_slice(&plain);
                PresetAction::Swallow
            }
            Phase::Handshake => {
                self.staging.extend_from_slice(&chunk);
                self.parse_handshake()
            }
        }
    }

    fn server_out(&mut self, chunk: Bytes) -> PresetAction {
        if self.encipher.is_none() {
            return Self::fail("reply before handshake");
        }
        PresetAction::Next(self.encrypt(&chunk))
    }

    fn client_in(&mut self, chunk: Bytes) -> PresetAction {
        if self.decipher.is_none() {
            return Self::fail("reply before handshake");
        }
        PresetAction::Next(self.decrypt(&chunk))
    }

    fn on_connected(&mut self) -> Option<Bytes> {
        if self.role == Role::Server && self.phase == Phase::AwaitConnect {
            self.phase = Phase::Established;
            if self.pending.is_empty() {
                None
            } else {
                Some(self.pending.split().freeze())
            }
        } else {
            None
        }
    }

    fn drain(&mut self) -> Option<PresetAction> {
        if self.phase == Phase::Handshake && !self.staging.is_empty() {
            return Some(Self::fail("short handshake"));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(method: &str) -> PresetSpec {
        PresetSpec::new(
            "exp-base-auth-stream",
            serde_json::json!({ "method": method }),
        )
    }

    fn client(method: &str) -> BaseAuthStreamPreset {
        let ctx = PresetContext {
            role: Role::Client,
            key: "secret".into(),
            destination: Some(Address::from_host_port("127.0.0.1", 9)),
        };
        BaseAuthStreamPreset::new(&spec(method), &ctx).unwrap()
    }

    fn server(method: &str) -> BaseAuthStreamPreset {
        let ctx = PresetContext {
            role: Role::Server,
            key: "secret".into(),
            destination: None,
        };
        BaseAuthStreamPreset::new(&spec(method), &ctx).unwrap()
    }

    fn handshake_frame(method: &str, data: &[u8]) -> Bytes {
        match client(method).client_out(Bytes::copy_from_slice(data)) {
            PresetAction::Next(frame) => frame,
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn test_validation() {
        let ctx = PresetContext {
            role: Role::Server,
            key: "secret".into(),
            destination: None,
        };
        assert!(BaseAuthStreamPreset::new(&spec("aes-256-ctr"), &ctx).is_ok());
        assert!(BaseAuthStreamPreset::new(&spec("rc4"), &ctx).is_err());
        assert!(BaseAuthStreamPreset::new(&spec("AES-256-CTR"), &ctx).is_err());

        let no_key = PresetContext {
            role: Role::Server,
            key: String::new(),
            destination: None,
        };
        assert!(BaseAuthStreamPreset::new(&spec("aes-256-ctr"), &no_key).is_err());

        let no_dst = PresetContext {
            role: Role::Client,
            key: "secret".into(),
            destination: None,
        };
        assert!(BaseAuthStreamPreset::new(&spec("aes-256-ctr"), &no_dst).is_err());
    }

    #[test]
    fn test_handshake_roundtrip_all_methods() {
        for kind in CipherKind::all() {
            let method = kind.name();
            let mut cli = client(method);
            let mut srv = server(method);

            let frame = match cli.client_out(Bytes::from_static(b"hello")) {
                PresetAction::Next(f) => f,
                other => panic!("expected frame, got {:?}", other),
            };
            assert!(cli.handshake_done());
            assert!(frame.len() > MIN_HANDSHAKE_LEN);

            let addr = match srv.server_in(frame) {
                PresetAction::ConnectToDst { addr } => addr,
                other => panic!("{}: expected connect, got {:?}", method, other),
            };
            assert_eq!(addr, Address::from_host_port("127.0.0.1", 9));
            assert!(!srv.handshake_done());

            let released = srv.on_connected().expect("buffered payload released");
            assert_eq!(&released[..], b"hello");
            assert!(srv.handshake_done());

            // subsequent chunks both ways
            let up = match cli.client_out(Bytes::from_static(b"more data")) {
                PresetAction::Next(c) => c,
                other => panic!("{:?}", other),
            };
            match srv.server_in(up) {
                PresetAction::Next(plain) => assert_eq!(&plain[..], b"more data"),
                other => panic!("{:?}", other),
            }

            let down = match srv.server_out(Bytes::from_static(b"reply")) {
                PresetAction::Next(c) => c,
                other => panic!("{:?}", other),
            };
            match cli.client_in(down) {
                PresetAction::Next(plain) => assert_eq!(&plain[..], b"reply"),
                other => panic!("{:?}", other),
            }
        }
    }

    #[test]
    fn test_fragmented_handshake() {
        let frame = handshake_frame("aes-256-ctr", &[0x42u8; 156]);
        assert_eq!(frame.len(), 200); // 16 + 16 + 1 + 9 + 2 + 156

        let mut srv = server("aes-256-ctr");
        assert!(matches!(
            srv.server_in(frame.slice(0..20)),
            PresetAction::Swallow
        ));
        assert!(matches!(
            srv.server_in(frame.slice(20..37)),
            PresetAction::Swallow
        ));
        match srv.server_in(frame.slice(37..)) {
            PresetAction::ConnectToDst { addr } => {
                assert_eq!(addr, Address::from_host_port("127.0.0.1", 9));
            }
            other => panic!("{:?}", other),
        }
        let released = srv.on_connected().unwrap();
        assert_eq!(&released[..], &[0x42u8; 156][..]);
    }

    #[test]
    fn test_short_handshake_fails_on_drain() {
        let mut srv = server("aes-256-ctr");
        assert!(matches!(
            srv.server_in(Bytes::from(vec![0u8; 36])),
            PresetAction::Swallow
        ));
        match srv.drain() {
            Some(PresetAction::Fail { reason }) => assert_eq!(reason, "short handshake"),
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_bit_flip_rejected() {
        let mut frame = handshake_frame("aes-256-ctr", b"hello").to_vec();
        frame[32] ^= 0x01; // first byte of the encrypted address header

        let mut srv = server("aes-256-ctr");
        match srv.server_in(Bytes::from(frame)) {
            PresetAction::Fail { reason } => assert_eq!(reason, "bad HMAC"),
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_tampered_tag_rejected() {
        let mut frame = handshake_frame("aes-128-cfb", b"hello").to_vec();
        frame[16] ^= 0x80;

        let mut srv = server("aes-128-cfb");
        assert!(matches!(
            srv.server_in(Bytes::from(frame)),
            PresetAction::Fail { .. }
        ));
    }

    #[test]
    fn test_zero_alen_rejected() {
        // hand-build a frame whose decrypted ALEN is zero
        let kind = CipherKind::Aes256Ctr;
        let key = evp_bytes_to_key(b"secret", kind.key_len());
        let iv = [7u8; 16];

        let mut plaintext = vec![0u8, 0x00, 0x09]; // ALEN=0, port 9
        plaintext.extend_from_slice(b"data");
        let mut ciphertext = plaintext.clone();
        StreamCrypter::encryptor(kind, &key, &iv)
            .unwrap()
            .update(&mut ciphertext);
        let tag = hmac_sha1_tag(&key, &ciphertext[..3]);

        let mut frame = Vec::new();
        frame.extend_from_slice(&iv);
        frame.extend_from_slice(&tag);
        frame.extend_from_slice(&ciphertext);

        let mut srv = server("aes-256-ctr");
        match srv.server_in(Bytes::from(frame)) {
            PresetAction::Fail { reason } => assert_eq!(reason, "invalid address length"),
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_handshake_not_reopened() {
        let mut cli = client("aes-256-ctr");
        let mut srv = server("aes-256-ctr");

        let frame = match cli.client_out(Bytes::from_static(b"hello")) {
            PresetAction::Next(f) => f,
            other => panic!("{:?}", other),
        };
        assert!(matches!(
            srv.server_in(frame),
            PresetAction::ConnectToDst { .. }
        ));
        srv.on_connected();

        // a second IV-shaped header must decrypt as payload, never reopen
        let second = handshake_frame("aes-256-ctr", b"hello");
        let len = second.len();
        match srv.server_in(second) {
            PresetAction::Next(garbage) => assert_eq!(garbage.len(), len),
            other => panic!("expected garbage payload, got {:?}", other),
        }
    }

    #[test]
    fn test_data_while_connecting_is_buffered() {
        let mut cli = client("aes-256-ctr");
        let mut srv = server("aes-256-ctr");

        let frame = match cli.client_out(Bytes::from_static(b"first")) {
            PresetAction::Next(f) => f,
            other => panic!("{:?}", other),
        };
        assert!(matches!(
            srv.server_in(frame),
            PresetAction::ConnectToDst { .. }
        ));

        // more ciphertext lands before the dial completes
        let more = match cli.client_out(Bytes::from_static(b" second")) {
            PresetAction::Next(c) => c,
            other => panic!("{:?}", other),
        };
        assert!(matches!(srv.server_in(more), PresetAction::Swallow));

        let released = srv.on_connected().unwrap();
        assert_eq!(&released[..], b"first second");
    }

    #[test]
    fn test_client_in_before_handshake_fails() {
        let mut cli = client("aes-256-ctr");
        assert!(matches!(
            cli.client_in(Bytes::from_static(b"x")),
            PresetAction::Fail { .. }
        ));
    }
}
