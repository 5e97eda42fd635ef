//! # Pluggable Payload Codecs
//!
//! Compression and encryption are strategy objects injected into the cache
//! store at construction, applied before storage and reversed on read. When
//! a strategy is disabled the store simply skips it, so `NoopCodec` exists
//! mostly for explicit wiring. Real codecs can be substituted without
//! touching cache logic.

use aes::Aes256;
use cbc::{Decryptor, Encryptor};
use cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use rand::RngCore;
use std::io::{Read, Write};

use crate::core::error::{EngineError, Result};

/// A reversible byte-level transformation applied to cached payloads.
pub trait PayloadCodec: Send + Sync {
    fn encode(&self, bytes: &[u8]) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>>;
}

/// Identity codec.
pub struct NoopCodec;

impl PayloadCodec for NoopCodec {
    fn encode(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// zlib (DEFLATE) compression.
pub struct DeflateCodec;

impl PayloadCodec for DeflateCodec {
    fn encode(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(bytes)
            .map_err(|e| EngineError::CodecFailed(format!("zlib compress: {}", e)))?;
        encoder
            .finish()
            .map_err(|e| EngineError::CodecFailed(format!("zlib compress: {}", e)))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = ZlibDecoder::new(bytes);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| EngineError::CodecFailed(format!("zlib decompress: {}", e)))?;
        Ok(out)
    }
}

/// AES-256-CBC with PKCS7 padding.
///
/// The key is supplied hex-encoded (32 bytes / 256 bits). A fresh random IV
/// is generated per `encode` and prefixed to the ciphertext; `decode` splits
/// it back off. A wrong key or truncated ciphertext surfaces as
/// `CodecFailed`, which the store maps to a cache miss plus an error event.
pub struct AesCbcCodec {
    key: [u8; 32],
}

impl AesCbcCodec {
    /// Builds the codec from a hex-encoded 256-bit key.
    pub fn from_hex(key_hex: &str) -> Result<Self> {
        let key_vec = hex::decode(key_hex.trim())
            .map_err(|e| EngineError::CodecFailed(format!("Invalid key hex: {}", e)))?;
        if key_vec.len() != 32 {
            return Err(EngineError::CodecFailed(format!(
                "Key must be 32 bytes (256 bits), found {}",
                key_vec.len()
            )));
        }
        let key: [u8; 32] = key_vec.try_into().expect("Length checked above");
        Ok(Self { key })
    }
}

impl PayloadCodec for AesCbcCodec {
    fn encode(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        let mut iv = [0u8; 16];
        rand::rng().fill_bytes(&mut iv);

        let ciphertext = Encryptor::<Aes256>::new(&self.key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(bytes);

        // IV travels in front of the ciphertext.
        let mut out = iv.to_vec();
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        if bytes.len() < 16 {
            return Err(EngineError::CodecFailed(format!(
                "Ciphertext too short to carry an IV: {} bytes",
                bytes.len()
            )));
        }
        let (iv, ciphertext) = bytes.split_at(16);
        let iv_arr: [u8; 16] = iv.try_into().expect("Length checked above");

        Decryptor::<Aes256>::new(&self.key.into(), &iv_arr.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|e| {
                EngineError::CodecFailed(format!(
                    "Decryption failed (UnpadError): {:?}. Check if the key is correct.",
                    e
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_roundtrip() {
        let codec = NoopCodec;
        let data = b"widget payload".to_vec();
        assert_eq!(codec.decode(&codec.encode(&data).unwrap()).unwrap(), data);
    }

    #[test]
    fn deflate_roundtrip_shrinks_repetitive_data() {
        let codec = DeflateCodec;
        let data = vec![b'a'; 4096];
        let encoded = codec.encode(&data).unwrap();
        assert!(encoded.len() < data.len());
        assert_eq!(codec.decode(&encoded).unwrap(), data);
    }

    #[test]
    fn aes_roundtrip_and_fresh_iv() {
        let key_hex = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";
        let codec = AesCbcCodec::from_hex(key_hex).unwrap();
        let data = b"{\"value\":42}".to_vec();
        let first = codec.encode(&data).unwrap();
        let second = codec.encode(&data).unwrap();
        // Random IV per encode: same plaintext, different ciphertext.
        assert_ne!(first, second);
        assert_eq!(codec.decode(&first).unwrap(), data);
        assert_eq!(codec.decode(&second).unwrap(), data);
    }

    #[test]
    fn aes_wrong_key_fails_decode() {
        let a = AesCbcCodec::from_hex(&"00".repeat(32)).unwrap();
        let b = AesCbcCodec::from_hex(&"11".repeat(32)).unwrap();
        let encoded = a.encode(b"secret").unwrap();
        assert!(b.decode(&encoded).is_err());
    }

    #[test]
    fn aes_rejects_bad_keys() {
        assert!(AesCbcCodec::from_hex("deadbeef").is_err());
        assert!(AesCbcCodec::from_hex("not hex at all").is_err());
    }
}
