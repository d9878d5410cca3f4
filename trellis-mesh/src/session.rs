/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use openssl::hash::MessageDigest;
use openssl::memcmp;
use openssl::pkey::{PKey, Private};
use openssl::sign::Signer;
use openssl::symm::{Cipher, Crypter, Mode};

use crate::codec::COMPRESSION_LEVEL_MAX;
use crate::error::InvalidParameterError;

/// Largest digest output we have to hold on the stack (SHA-512).
const DIGEST_SIZE_MAX: usize = 64;

/// Headroom a ciphertext may gain over its plaintext (block padding).
const CIPHER_OVERHEAD_MAX: usize = 32;

/// Symmetric cipher context for one direction of a peer session.
///
/// A fresh EVP crypter is initialized per packet from the negotiated key and
/// IV; stream and block modes both work, block modes pay their padding into
/// the frame's capacity headroom.
pub struct FrameCipher {
    cipher: Cipher,
    key: Vec<u8>,
    iv: Vec<u8>,
}

impl FrameCipher {
    pub fn new(cipher: Cipher, key: &[u8], iv: &[u8]) -> Result<Self, InvalidParameterError> {
        if key.len() != cipher.key_len() {
            return Err(InvalidParameterError("cipher key length mismatch"));
        }
        if cipher.iv_len().map_or(!iv.is_empty(), |l| l != iv.len()) {
            return Err(InvalidParameterError("cipher IV length mismatch"));
        }
        Ok(Self { cipher, key: key.to_vec(), iv: iv.to_vec() })
    }

    fn crypter(&self, mode: Mode) -> Option<Crypter> {
        let iv = if self.iv.is_empty() { None } else { Some(self.iv.as_slice()) };
        Crypter::new(self.cipher, mode, &self.key, iv).ok()
    }

    fn crypt(&self, mode: Mode, input: &[u8], output: &mut [u8]) -> Option<usize> {
        if input.len() + CIPHER_OVERHEAD_MAX > output.len() {
            return None;
        }
        let mut c = self.crypter(mode)?;
        let mut n = c.update(input, output).ok()?;
        n += c.finalize(&mut output[n..]).ok()?;
        Some(n)
    }

    /// Encrypt `input` into `output`, returning the ciphertext length.
    #[inline(always)]
    pub fn encrypt(&self, input: &[u8], output: &mut [u8]) -> Option<usize> {
        self.crypt(Mode::Encrypt, input, output)
    }

    /// Decrypt `input` into `output`, returning the plaintext length.
    /// Fails on malformed ciphertext (e.g. bad block padding).
    #[inline(always)]
    pub fn decrypt(&self, input: &[u8], output: &mut [u8]) -> Option<usize> {
        self.crypt(Mode::Decrypt, input, output)
    }
}

/// Message authentication context for one direction of a peer session:
/// HMAC over a negotiated digest, truncated to a negotiated tag length.
pub struct FrameDigest {
    digest: MessageDigest,
    key: PKey<Private>,
    mac_length: usize,
}

impl FrameDigest {
    pub fn new(digest: MessageDigest, key: &[u8], mac_length: usize) -> Result<Self, InvalidParameterError> {
        if mac_length == 0 || mac_length > digest.size() {
            return Err(InvalidParameterError("MAC length out of range for digest"));
        }
        let key = PKey::hmac(key).map_err(|_| InvalidParameterError("invalid HMAC key"))?;
        Ok(Self { digest, key, mac_length })
    }

    #[inline(always)]
    pub fn mac_length(&self) -> usize {
        self.mac_length
    }

    fn compute(&self, data: &[u8], out: &mut [u8; DIGEST_SIZE_MAX]) -> Option<usize> {
        let mut signer = Signer::new(self.digest, &self.key).ok()?;
        signer.update(data).ok()?;
        signer.sign(&mut out[..]).ok()
    }

    /// Compute the truncated tag over `data` into `tag_out`.
    pub fn create(&self, data: &[u8], tag_out: &mut [u8]) -> bool {
        debug_assert_eq!(tag_out.len(), self.mac_length);
        let mut full = [0_u8; DIGEST_SIZE_MAX];
        match self.compute(data, &mut full) {
            Some(n) if n >= self.mac_length => {
                tag_out.copy_from_slice(&full[..self.mac_length]);
                true
            }
            _ => false,
        }
    }

    /// Verify a truncated tag in constant time.
    pub fn verify(&self, data: &[u8], tag: &[u8]) -> bool {
        if tag.len() != self.mac_length {
            return false;
        }
        let mut full = [0_u8; DIGEST_SIZE_MAX];
        match self.compute(data, &mut full) {
            Some(n) if n >= self.mac_length => memcmp::eq(&full[..self.mac_length], tag),
            _ => false,
        }
    }
}

/// Keyed state for one direction of traffic with a peer.
///
/// Cipher and digest are independently optional: either may be negotiated
/// away, leaving the identity transform for that stage. A direction with no
/// installed `SessionState` at all cannot carry UDP traffic.
pub struct SessionState {
    cipher: Option<FrameCipher>,
    digest: Option<FrameDigest>,
    compression: u8,
}

impl SessionState {
    pub fn new(
        cipher: Option<FrameCipher>,
        digest: Option<FrameDigest>,
        compression: u8,
    ) -> Result<Self, InvalidParameterError> {
        if compression > COMPRESSION_LEVEL_MAX {
            return Err(InvalidParameterError("compression level out of range"));
        }
        Ok(Self { cipher, digest, compression })
    }

    /// A session with no cipher and no digest, e.g. for links whose
    /// protection is delegated to an outer layer.
    pub fn plaintext(compression: u8) -> Result<Self, InvalidParameterError> {
        Self::new(None, None, compression)
    }

    #[inline(always)]
    pub(crate) fn cipher(&self) -> Option<&FrameCipher> {
        self.cipher.as_ref()
    }

    #[inline(always)]
    pub(crate) fn digest(&self) -> Option<&FrameDigest> {
        self.digest.as_ref()
    }

    #[inline(always)]
    pub(crate) fn compression(&self) -> u8 {
        self.compression
    }

    #[inline(always)]
    pub fn mac_length(&self) -> usize {
        self.digest.as_ref().map_or(0, |d| d.mac_length())
    }

    /// Verify the trailing MAC of a complete wire image (sequence field,
    /// ciphertext, tag). Trivially true when no digest is negotiated.
    pub(crate) fn verify_wire(&self, wire: &[u8]) -> bool {
        match self.digest.as_ref() {
            Some(d) => {
                let mac_len = d.mac_length();
                if wire.len() < crate::frame::SEQNO_SIZE + mac_len {
                    return false;
                }
                let (body, tag) = wire.split_at(wire.len() - mac_len);
                d.verify(body, tag)
            }
            None => true,
        }
    }
}
