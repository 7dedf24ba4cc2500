//! Pluggable chapter payload decoders.
//!
//! Most sources return chapter markup as-is ([PlainHtml]). Some return it
//! encrypted ([AesFragments]): base64 text, AES-256-CBC with the raw shared secret
//! as key and the first 16 bytes of the *encoded* text as IV, a 16-byte junk
//! prefix on the plaintext, optionally gzip, and finally a JSON array of markup
//! fragments. The scheme is the source's and is reproduced exactly.

use crate::getter::DecodeError;
use aes::Aes256;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, KeyIvInit};
use flate2::read::GzDecoder;
use std::io::Read;

type Aes256CbcDec = cbc::Decryptor<Aes256>;

const IV_SHIFT: usize = 16;

/// Turns a raw chapter payload into a markup fragment.
pub trait ChapterDecoder: Send + Sync {
    fn decode(&self, payload: &[u8]) -> Result<String, DecodeError>;
}

/// Payload is UTF-8 markup.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainHtml;

impl ChapterDecoder for PlainHtml {
    fn decode(&self, payload: &[u8]) -> Result<String, DecodeError> {
        Ok(String::from_utf8(payload.to_vec())?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
}

/// Encrypted array of markup fragments.
#[derive(Debug, Clone)]
pub struct AesFragments {
    secret: String,
    compression: Compression,
    /// Payload arrives as raw cipher bytes and is base64-encoded before decryption.
    binary: bool,
}

impl AesFragments {
    /// Payload is base64 text, plaintext is not compressed.
    pub fn text(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            compression: Compression::None,
            binary: false,
        }
    }

    /// Payload is raw cipher bytes, plaintext is gzip.
    pub fn binary_gzip(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            compression: Compression::Gzip,
            binary: true,
        }
    }

    /// Decrypt one base64 payload and drop the junk first block.
    pub fn decrypt(&self, encoded: &str) -> Result<Vec<u8>, DecodeError> {
        let iv = encoded
            .as_bytes()
            .get(..IV_SHIFT)
            .ok_or(DecodeError::TooShort(IV_SHIFT))?;
        let cipher = STANDARD.decode(encoded.as_bytes())?;
        let plain = Aes256CbcDec::new_from_slices(self.secret.as_bytes(), iv)
            .map_err(|_| DecodeError::KeyLength)?
            .decrypt_padded_vec_mut::<Pkcs7>(&cipher)
            .map_err(|_| DecodeError::Padding)?;
        plain
            .get(IV_SHIFT..)
            .map(<[u8]>::to_vec)
            .ok_or(DecodeError::TooShort(IV_SHIFT))
    }
}

impl ChapterDecoder for AesFragments {
    fn decode(&self, payload: &[u8]) -> Result<String, DecodeError> {
        let encoded = if self.binary {
            STANDARD.encode(payload)
        } else {
            String::from_utf8(payload.to_vec())?.trim().to_string()
        };
        let plain = self.decrypt(&encoded)?;
        let plain = match self.compression {
            Compression::None => plain,
            Compression::Gzip => gunzip(&plain)?,
        };
        join_fragments(&String::from_utf8(plain)?)
    }
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(DecodeError::Gzip)?;
    Ok(out)
}

/// Concatenate a JSON array of markup strings into one fragment.
pub fn join_fragments(json: &str) -> Result<String, DecodeError> {
    let rows: Vec<String> = serde_json::from_str(json).map_err(DecodeError::Fragments)?;
    Ok(rows.concat())
}
