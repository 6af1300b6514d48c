//! Streaming authenticated encryption for local-driver bytes at rest
//! (§4.C5).
//!
//! Ciphertext framing is self-describing: a one-byte version tag, a
//! seven-byte nonce prefix, then a sequence of STREAM-encrypted chunks
//! (`aead::stream`), each carrying its own 16-byte authentication tag.
//! The last chunk is flagged distinctly from interior chunks so
//! truncation is detected rather than silently accepted.

use aead::{
    generic_array::GenericArray,
    stream::{DecryptorBE32, EncryptorBE32},
    KeyInit,
};
use aes_gcm::Aes256Gcm;
use base64::Engine as _;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{AppError, AppResult};

/// Current framing version. Bump if the chunk size or AEAD algorithm
/// ever changes so old ciphertext remains decodable.
const VERSION: u8 = 1;

/// `aead::stream`'s BE32 counter construction reserves 5 bytes of the
/// underlying AEAD's 12-byte nonce (4 for the counter, 1 for the
/// last-block flag); the remaining 7 bytes are a random per-file prefix.
const NONCE_PREFIX_LEN: usize = 7;

/// Plaintext chunk size. Each chunk grows by 16 bytes (the GCM tag) in
/// the ciphertext stream.
const CHUNK_SIZE: usize = 64 * 1024;

/// A 256-bit data key plus the machinery to encrypt/decrypt streams with
/// it. One process-level instance is constructed at startup from
/// `StorageConfig::encryption_key`.
#[derive(Clone)]
pub struct DataKey {
    key_bytes: [u8; 32],
}

impl DataKey {
    /// Parse a base64-encoded 256-bit key (as stored in configuration).
    pub fn from_base64(encoded: &str) -> AppResult<Self> {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| AppError::Internal(format!("invalid encryption key encoding: {e}")))?;
        let key_bytes: [u8; 32] = decoded
            .try_into()
            .map_err(|_| AppError::Internal("encryption key must be 32 bytes".to_string()))?;
        Ok(Self { key_bytes })
    }

    /// Encrypt `plain` into `cipher`, writing the full self-describing
    /// frame (version + nonce prefix + chunked ciphertext).
    pub async fn encrypt_stream<R, W>(&self, mut plain: R, mut cipher: W) -> AppResult<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut nonce_prefix = [0u8; NONCE_PREFIX_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_prefix);

        cipher
            .write_all(&[VERSION])
            .await
            .map_err(AppError::from)?;
        cipher
            .write_all(&nonce_prefix)
            .await
            .map_err(AppError::from)?;

        let aead = Aes256Gcm::new(GenericArray::from_slice(&self.key_bytes));
        let mut encryptor =
            EncryptorBE32::from_aead(aead, GenericArray::from_slice(&nonce_prefix));

        let mut current = vec![0u8; CHUNK_SIZE];
        let mut current_len = read_full(&mut plain, &mut current).await?;

        loop {
            let mut lookahead = vec![0u8; CHUNK_SIZE];
            let lookahead_len = read_full(&mut plain, &mut lookahead).await?;

            if lookahead_len == 0 {
                let ciphertext = encryptor
                    .encrypt_last(&current[..current_len])
                    .map_err(|_| {
                        AppError::Internal("stream encryption failed on final chunk".to_string())
                    })?;
                cipher.write_all(&ciphertext).await.map_err(AppError::from)?;
                break;
            }

            let ciphertext = encryptor.encrypt_next(&current[..current_len]).map_err(|_| {
                AppError::Internal("stream encryption failed on interior chunk".to_string())
            })?;
            cipher.write_all(&ciphertext).await.map_err(AppError::from)?;

            current = lookahead;
            current_len = lookahead_len;
        }

        cipher.flush().await.map_err(AppError::from)?;
        Ok(())
    }

    /// Decrypt `cipher` (a full frame produced by [`Self::encrypt_stream`])
    /// into `plain`.
    pub async fn decrypt_stream<R, W>(&self, mut cipher: R, mut plain: W) -> AppResult<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut header = [0u8; 1 + NONCE_PREFIX_LEN];
        cipher.read_exact(&mut header).await.map_err(AppError::from)?;
        if header[0] != VERSION {
            return Err(AppError::IntegrityError(format!(
                "unsupported encryption frame version {}",
                header[0]
            )));
        }
        let nonce_prefix = &header[1..];

        let aead = Aes256Gcm::new(GenericArray::from_slice(&self.key_bytes));
        let mut decryptor =
            DecryptorBE32::from_aead(aead, GenericArray::from_slice(nonce_prefix));

        const CIPHER_CHUNK: usize = CHUNK_SIZE + 16;
        let mut current = vec![0u8; CIPHER_CHUNK];
        let mut current_len = read_full(&mut cipher, &mut current).await?;
        if current_len == 0 {
            return Err(AppError::IntegrityError(
                "truncated ciphertext: no chunks present".to_string(),
            ));
        }

        loop {
            let mut lookahead = vec![0u8; CIPHER_CHUNK];
            let lookahead_len = read_full(&mut cipher, &mut lookahead).await?;

            if lookahead_len == 0 {
                let plaintext = decryptor.decrypt_last(&current[..current_len]).map_err(|_| {
                    AppError::IntegrityError("authentication failed on final chunk".to_string())
                })?;
                plain.write_all(&plaintext).await.map_err(AppError::from)?;
                break;
            }

            let plaintext = decryptor.decrypt_next(&current[..current_len]).map_err(|_| {
                AppError::IntegrityError("authentication failed on interior chunk".to_string())
            })?;
            plain.write_all(&plaintext).await.map_err(AppError::from)?;

            current = lookahead;
            current_len = lookahead_len;
        }

        plain.flush().await.map_err(AppError::from)?;
        Ok(())
    }

    /// Re-encrypt ciphertext from one local-driver key to another without
    /// ever materialising plaintext on disk — used by copy when the
    /// source is already encrypted (§4.C6 Copy).
    pub async fn copy_encrypted<R, W>(&self, cipher_in: R, cipher_out: W) -> AppResult<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (plain_reader, plain_writer) = tokio::io::duplex(CHUNK_SIZE * 2);
        let source_key = self.clone();
        let dest_key = self.clone();

        let decrypt_task =
            tokio::spawn(async move { source_key.decrypt_stream(cipher_in, plain_writer).await });
        dest_key.encrypt_stream(plain_reader, cipher_out).await?;

        decrypt_task
            .await
            .map_err(|e| AppError::Internal(format!("decrypt task panicked: {e}")))??;
        Ok(())
    }
}

/// Reads up to `buf.len()` bytes, looping until the buffer is full or EOF
/// is reached. Returns the number of bytes actually read (0 means EOF).
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> AppResult<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = reader.read(&mut buf[total..]).await.map_err(AppError::from)?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

/// True iff the given stored `path` denotes a local-driver storage key
/// (relative path, not a custom-drive absolute path) — such paths are
/// the only ones subject to this module's at-rest encryption (§4.C4,
/// §4.C5).
#[must_use]
pub fn is_encrypted_path(path: &str) -> bool {
    !path.starts_with('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> DataKey {
        let bytes = [7u8; 32];
        DataKey {
            key_bytes: bytes,
        }
    }

    #[tokio::test]
    async fn round_trip_small_payload() {
        let key = test_key();
        let plaintext = b"hello nimbus".to_vec();

        let mut ciphertext = Vec::new();
        key.encrypt_stream(&plaintext[..], &mut ciphertext)
            .await
            .unwrap();

        let mut decrypted = Vec::new();
        key.decrypt_stream(&ciphertext[..], &mut decrypted)
            .await
            .unwrap();

        assert_eq!(decrypted, plaintext);
    }

    #[tokio::test]
    async fn round_trip_multi_chunk_payload() {
        let key = test_key();
        let plaintext = vec![42u8; CHUNK_SIZE * 3 + 17];

        let mut ciphertext = Vec::new();
        key.encrypt_stream(&plaintext[..], &mut ciphertext)
            .await
            .unwrap();
        assert!(ciphertext.len() > plaintext.len());

        let mut decrypted = Vec::new();
        key.decrypt_stream(&ciphertext[..], &mut decrypted)
            .await
            .unwrap();

        assert_eq!(decrypted, plaintext);
    }

    #[tokio::test]
    async fn round_trip_empty_payload() {
        let key = test_key();
        let plaintext: Vec<u8> = Vec::new();

        let mut ciphertext = Vec::new();
        key.encrypt_stream(&plaintext[..], &mut ciphertext)
            .await
            .unwrap();

        let mut decrypted = Vec::new();
        key.decrypt_stream(&ciphertext[..], &mut decrypted)
            .await
            .unwrap();

        assert_eq!(decrypted, plaintext);
    }

    #[tokio::test]
    async fn tampered_ciphertext_fails_authentication() {
        let key = test_key();
        let plaintext = vec![1u8; CHUNK_SIZE + 100];

        let mut ciphertext = Vec::new();
        key.encrypt_stream(&plaintext[..], &mut ciphertext)
            .await
            .unwrap();

        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xFF;

        let mut decrypted = Vec::new();
        let result = key.decrypt_stream(&ciphertext[..], &mut decrypted).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn copy_encrypted_round_trips_via_different_framing() {
        let key = test_key();
        let plaintext = vec![9u8; CHUNK_SIZE + 5];

        let mut source_ciphertext = Vec::new();
        key.encrypt_stream(&plaintext[..], &mut source_ciphertext)
            .await
            .unwrap();

        let mut dest_ciphertext = Vec::new();
        key.copy_encrypted(&source_ciphertext[..], &mut dest_ciphertext)
            .await
            .unwrap();

        let mut decrypted = Vec::new();
        key.decrypt_stream(&dest_ciphertext[..], &mut decrypted)
            .await
            .unwrap();

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn classifies_paths() {
        assert!(is_encrypted_path("ab/cd/file123.bin"));
        assert!(!is_encrypted_path("/home/user/docs/file.txt"));
    }
}
