//! Streaming encryption and verifying decryption of the backup container.
//!
//! The write path encrypts and authenticates as bytes flow through, so
//! the archive never exists in memory as a whole. The read path does not
//! know the container length in advance; it keeps a sliding tail of the
//! most recent 72 bytes so the trailer (length + tag) is never fed to the
//! cipher or the MAC, and verifies both at end of stream.

use std::io::{self, Read, Write};

use aes::Aes256;
use anyhow::{anyhow, bail, Context, Result};
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use hmac::{Hmac, Mac};
use sha2::Sha512;

use crate::constants::COPY_BUFFER_SIZE;
use crate::crypto::key::{generate_iv, AES_KEY_SIZE, HMAC_KEY_SIZE, IV_SIZE};

type Aes256Ctr = Ctr128BE<Aes256>;
type HmacSha512 = Hmac<Sha512>;

/// Magic bytes identifying an encrypted backup container.
pub const MAGIC: &[u8; 4] = b"S3BE";

/// Container header size: magic + IV.
pub const HEADER_SIZE: usize = MAGIC.len() + IV_SIZE;

/// Size of the authentication tag (HMAC-SHA-512 output).
pub const TAG_SIZE: usize = 64;

/// Container trailer size: 8-byte big-endian length + tag.
pub const TRAILER_SIZE: usize = 8 + TAG_SIZE;

/// Factory for encrypting writers and verifying readers sharing one key
/// pair.
pub struct StreamEncryptor {
    aes_key: Vec<u8>,
    hmac_key: Vec<u8>,
}

impl StreamEncryptor {
    /// Construction fails unless the keys have exactly the required sizes.
    pub fn new(aes_key: &[u8], hmac_key: &[u8]) -> Result<Self> {
        if aes_key.len() != AES_KEY_SIZE {
            bail!(
                "invalid AES key size: expected {}, got {}",
                AES_KEY_SIZE,
                aes_key.len()
            );
        }
        if hmac_key.len() != HMAC_KEY_SIZE {
            bail!(
                "invalid HMAC key size: expected {}, got {}",
                HMAC_KEY_SIZE,
                hmac_key.len()
            );
        }

        Ok(Self {
            aes_key: aes_key.to_vec(),
            hmac_key: hmac_key.to_vec(),
        })
    }

    /// Wrap a sink so that everything written to it is emitted as an
    /// encrypted container. The magic and a fresh random IV are written
    /// immediately; [`EncryptWriter::finish`] emits the trailer.
    pub fn wrap_writer<W: Write>(&self, sink: W) -> Result<EncryptWriter<W>> {
        self.wrap_writer_with_iv(sink, generate_iv())
    }

    /// Like [`wrap_writer`](Self::wrap_writer) with a caller-chosen IV.
    pub fn wrap_writer_with_iv<W: Write>(
        &self,
        mut sink: W,
        iv: [u8; IV_SIZE],
    ) -> Result<EncryptWriter<W>> {
        let cipher = Aes256Ctr::new_from_slices(&self.aes_key, &iv)
            .map_err(|_| anyhow!("failed to initialize AES-CTR cipher"))?;
        let mac = HmacSha512::new_from_slice(&self.hmac_key)
            .map_err(|_| anyhow!("failed to initialize HMAC"))?;

        sink.write_all(MAGIC).context("failed to write magic")?;
        sink.write_all(&iv).context("failed to write IV")?;

        Ok(EncryptWriter {
            sink,
            cipher,
            mac,
            written: 0,
        })
    }

    /// Wrap a source yielding an encrypted container. The header is read
    /// and checked here; the returned reader yields plaintext and verifies
    /// length and tag once the source reaches end of stream.
    pub fn wrap_reader<R: Read>(&self, mut source: R) -> Result<DecryptReader<R>> {
        let mut header = [0u8; HEADER_SIZE];
        source
            .read_exact(&mut header)
            .context("failed to read container header")?;

        if &header[..MAGIC.len()] != MAGIC {
            bail!("invalid magic: not an encrypted backup container");
        }
        let iv = &header[MAGIC.len()..];

        let cipher = Aes256Ctr::new_from_slices(&self.aes_key, iv)
            .map_err(|_| anyhow!("failed to initialize AES-CTR cipher"))?;
        let mac = HmacSha512::new_from_slice(&self.hmac_key)
            .map_err(|_| anyhow!("failed to initialize HMAC"))?;

        Ok(DecryptReader {
            source,
            cipher,
            mac: Some(mac),
            tail: Vec::with_capacity(TRAILER_SIZE),
            pending: Vec::new(),
            pending_pos: 0,
            consumed: 0,
            done: false,
            scratch: vec![0u8; COPY_BUFFER_SIZE],
        })
    }
}

/// Sink wrapper emitting the encrypted container.
pub struct EncryptWriter<W: Write> {
    sink: W,
    cipher: Aes256Ctr,
    mac: HmacSha512,
    written: u64,
}

impl<W: Write> EncryptWriter<W> {
    /// Plaintext bytes written so far (equal to ciphertext bytes emitted).
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Seal the container: write the 8-byte big-endian plaintext length
    /// and the authentication tag, flush, and hand back the sink.
    ///
    /// Consuming `self` makes writes after sealing impossible. Dropping
    /// the writer without calling `finish` leaves the container without a
    /// trailer, which a verifying reader rejects.
    pub fn finish(mut self) -> Result<W> {
        self.sink
            .write_all(&self.written.to_be_bytes())
            .context("failed to write data length")?;

        let tag = self.mac.finalize().into_bytes();
        self.sink
            .write_all(&tag)
            .context("failed to write HMAC tag")?;
        self.sink.flush().context("failed to flush sink")?;

        Ok(self.sink)
    }
}

impl<W: Write> Write for EncryptWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut ciphertext = buf.to_vec();
        self.cipher.apply_keystream(&mut ciphertext);
        self.mac.update(&ciphertext);
        self.sink.write_all(&ciphertext)?;
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}

/// Source wrapper yielding verified plaintext from an encrypted container.
///
/// Bytes only leave the sliding tail once at least [`TRAILER_SIZE`] newer
/// bytes exist behind them, which guarantees the trailer is carved off the
/// stream intact even though the total length is unknown up front.
pub struct DecryptReader<R: Read> {
    source: R,
    cipher: Aes256Ctr,
    mac: Option<HmacSha512>,
    /// The most recent raw bytes, at most TRAILER_SIZE of them.
    tail: Vec<u8>,
    /// Decrypted plaintext not yet handed to the caller.
    pending: Vec<u8>,
    pending_pos: usize,
    /// Ciphertext bytes decrypted so far.
    consumed: u64,
    done: bool,
    scratch: Vec<u8>,
}

impl<R: Read> std::fmt::Debug for DecryptReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptReader")
            .field("pending_pos", &self.pending_pos)
            .field("consumed", &self.consumed)
            .field("done", &self.done)
            .finish()
    }
}

impl<R: Read> DecryptReader<R> {
    /// Fold `n` freshly read bytes into the tail, decrypting whatever the
    /// tail pushes out.
    fn absorb(&mut self, n: usize) {
        let total = self.tail.len() + n;
        if total <= TRAILER_SIZE {
            self.tail.extend_from_slice(&self.scratch[..n]);
            return;
        }

        let excess = total - TRAILER_SIZE;
        let from_tail = excess.min(self.tail.len());

        let mut ciphertext = Vec::with_capacity(excess);
        ciphertext.extend_from_slice(&self.tail[..from_tail]);
        ciphertext.extend_from_slice(&self.scratch[..excess - from_tail]);

        let mut new_tail = Vec::with_capacity(TRAILER_SIZE);
        new_tail.extend_from_slice(&self.tail[from_tail..]);
        new_tail.extend_from_slice(&self.scratch[excess - from_tail..n]);
        self.tail = new_tail;

        if let Some(mac) = &mut self.mac {
            mac.update(&ciphertext);
        }
        self.consumed += ciphertext.len() as u64;
        self.cipher.apply_keystream(&mut ciphertext);
        self.pending = ciphertext;
        self.pending_pos = 0;
    }

    /// At end of stream the tail must hold exactly the trailer: check the
    /// recorded length against what was decrypted and verify the tag in
    /// constant time.
    fn verify_trailer(&mut self) -> io::Result<()> {
        if self.tail.len() < TRAILER_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated container: missing trailer",
            ));
        }

        let mut length_bytes = [0u8; 8];
        length_bytes.copy_from_slice(&self.tail[..8]);
        let recorded = u64::from_be_bytes(length_bytes);
        if recorded != self.consumed {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "authentication failed: trailer records {} ciphertext bytes, stream carried {}",
                    recorded, self.consumed
                ),
            ));
        }

        let mac = match self.mac.take() {
            Some(mac) => mac,
            None => return Ok(()),
        };
        mac.verify_slice(&self.tail[8..]).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                "authentication failed: HMAC tag mismatch",
            )
        })
    }
}

impl<R: Read> Read for DecryptReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }

        loop {
            if self.pending_pos < self.pending.len() {
                let n = out.len().min(self.pending.len() - self.pending_pos);
                out[..n].copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + n]);
                self.pending_pos += n;
                return Ok(n);
            }

            if self.done {
                return Ok(0);
            }

            let n = self.source.read(&mut self.scratch)?;
            if n == 0 {
                self.verify_trailer()?;
                self.done = true;
                return Ok(0);
            }
            self.absorb(n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_encryptor() -> StreamEncryptor {
        StreamEncryptor::new(&[0x11; AES_KEY_SIZE], &[0x22; HMAC_KEY_SIZE]).unwrap()
    }

    fn encrypt(enc: &StreamEncryptor, plaintext: &[u8]) -> Vec<u8> {
        let writer = enc.wrap_writer(Vec::new()).unwrap();
        let mut writer = writer;
        writer.write_all(plaintext).unwrap();
        writer.finish().unwrap()
    }

    fn decrypt(enc: &StreamEncryptor, container: &[u8]) -> io::Result<Vec<u8>> {
        let mut reader = enc.wrap_reader(container).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn test_key_size_validation() {
        assert!(StreamEncryptor::new(&[0u8; 31], &[0u8; 64]).is_err());
        assert!(StreamEncryptor::new(&[0u8; 32], &[0u8; 63]).is_err());
        assert!(StreamEncryptor::new(&[0u8; 32], &[0u8; 64]).is_ok());
    }

    #[test]
    fn test_container_layout() {
        let enc = test_encryptor();
        let plaintext = b"hello container";
        let container = encrypt(&enc, plaintext);

        assert_eq!(&container[..4], MAGIC);
        assert_eq!(container.len(), HEADER_SIZE + plaintext.len() + TRAILER_SIZE);

        // The length field records the ciphertext length in big-endian.
        let length_offset = HEADER_SIZE + plaintext.len();
        let mut length_bytes = [0u8; 8];
        length_bytes.copy_from_slice(&container[length_offset..length_offset + 8]);
        assert_eq!(u64::from_be_bytes(length_bytes), plaintext.len() as u64);
    }

    #[test]
    fn test_round_trip() {
        let enc = test_encryptor();
        let plaintext: Vec<u8> = (0..100_000).map(|i| (i % 251) as u8).collect();
        let container = encrypt(&enc, &plaintext);
        assert_eq!(decrypt(&enc, &container).unwrap(), plaintext);
    }

    #[test]
    fn test_round_trip_empty_plaintext() {
        let enc = test_encryptor();
        let container = encrypt(&enc, b"");
        assert_eq!(container.len(), HEADER_SIZE + TRAILER_SIZE);
        assert_eq!(decrypt(&enc, &container).unwrap(), b"");
    }

    #[test]
    fn test_injected_iv_appears_in_header() {
        let enc = test_encryptor();
        let iv = [0xAB; IV_SIZE];
        let mut writer = enc.wrap_writer_with_iv(Vec::new(), iv).unwrap();
        writer.write_all(b"x").unwrap();
        let container = writer.finish().unwrap();
        assert_eq!(&container[4..HEADER_SIZE], &iv);
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let enc = test_encryptor();
        let mut container = encrypt(&enc, b"sensitive data here");
        container[HEADER_SIZE + 3] ^= 0x01;

        let err = decrypt(&enc, &container).unwrap_err();
        assert!(err.to_string().contains("authentication failed"));
    }

    #[test]
    fn test_tampered_length_rejected() {
        let enc = test_encryptor();
        let mut container = encrypt(&enc, b"sensitive data here");
        let length_offset = container.len() - TRAILER_SIZE;
        container[length_offset + 7] ^= 0x01;

        let err = decrypt(&enc, &container).unwrap_err();
        assert!(err.to_string().contains("authentication failed"));
    }

    #[test]
    fn test_tampered_tag_rejected() {
        let enc = test_encryptor();
        let mut container = encrypt(&enc, b"sensitive data here");
        let last = container.len() - 1;
        container[last] ^= 0x01;

        let err = decrypt(&enc, &container).unwrap_err();
        assert!(err.to_string().contains("authentication failed"));
    }

    #[test]
    fn test_wrong_magic_rejected() {
        let enc = test_encryptor();
        let mut container = encrypt(&enc, b"data");
        container[0] = b'X';

        let err = enc.wrap_reader(&container[..]).unwrap_err();
        assert!(err.to_string().contains("invalid magic"));
    }

    #[test]
    fn test_short_header_rejected() {
        let enc = test_encryptor();
        assert!(enc.wrap_reader(&b"S3B"[..]).is_err());
    }

    #[test]
    fn test_truncated_trailer_rejected() {
        let enc = test_encryptor();
        let container = encrypt(&enc, b"data");
        let truncated = &container[..container.len() - 1];

        let err = decrypt(&enc, truncated).unwrap_err();
        assert!(err.to_string().contains("authentication failed"));
    }

    #[test]
    fn test_decrypt_with_wrong_key_rejected() {
        let enc = test_encryptor();
        let container = encrypt(&enc, b"data");

        let other = StreamEncryptor::new(&[0x33; AES_KEY_SIZE], &[0x44; HMAC_KEY_SIZE]).unwrap();
        assert!(decrypt(&other, &container).is_err());
    }

    #[test]
    fn test_small_reads_cross_trailer_boundary() {
        // Read the source one byte at a time so the tail logic sees every
        // possible split between ciphertext and trailer.
        struct OneByte<R: Read>(R);
        impl<R: Read> Read for OneByte<R> {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                if buf.is_empty() {
                    return Ok(0);
                }
                self.0.read(&mut buf[..1])
            }
        }

        let enc = test_encryptor();
        let plaintext = b"short but longer than the trailer would suggest".to_vec();
        let container = encrypt(&enc, &plaintext);

        let mut reader = enc.wrap_reader(OneByte(&container[..])).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, plaintext);
    }
}
