//! Segmented AES-256-GCM stream cipher.
//!
//! Stream format (binary):
//! ```text
//! [1 byte: version = 1][7 bytes: random nonce prefix]
//! [segment 0: ciphertext (64 KiB) + 16-byte tag]
//! ...
//! [segment n: ciphertext (0..=64 KiB) + 16-byte tag]
//! ```
//!
//! Segment `i` is sealed with nonce `prefix || be32(i) || last_flag` and the
//! 8-byte header as AAD. The last flag is set on the final segment only, so
//! truncating the stream at a segment boundary, reordering segments, or
//! appending data all fail authentication. Empty input still produces one
//! (empty) final segment.

use std::io::{ErrorKind, Read, Write};

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;

use crate::error::CryptoError;
use crate::keys::FileKey;
use crate::{NONCE_SIZE, TAG_SIZE};

/// Plaintext bytes per segment
pub const SEGMENT_SIZE: usize = 64 * 1024;

/// Stream header: version byte plus nonce prefix
pub const HEADER_SIZE: usize = 8;

pub const STREAM_VERSION: u8 = 1;

const SEALED_SEGMENT_SIZE: usize = SEGMENT_SIZE + TAG_SIZE;

/// Size of the stream produced for `plain` bytes of input.
pub fn encrypted_size(plain: u64) -> u64 {
    let segments = plain.div_ceil(SEGMENT_SIZE as u64).max(1);
    HEADER_SIZE as u64 + plain + TAG_SIZE as u64 * segments
}

fn segment_nonce(header: &[u8; HEADER_SIZE], index: u32, last: bool) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..7].copy_from_slice(&header[1..]);
    nonce[7..11].copy_from_slice(&index.to_be_bytes());
    nonce[11] = u8::from(last);
    nonce
}

/// Push-style encryptor. Ciphertext is released one segment at a time, so
/// memory use stays at one segment regardless of input size.
pub struct SegmentEncryptor {
    cipher: Aes256Gcm,
    header: [u8; HEADER_SIZE],
    header_sent: bool,
    index: u32,
    pending: Vec<u8>,
}

impl SegmentEncryptor {
    pub fn new(key: &FileKey) -> Self {
        let mut header = [0u8; HEADER_SIZE];
        header[0] = STREAM_VERSION;
        rand::thread_rng().fill_bytes(&mut header[1..]);

        Self {
            cipher: Aes256Gcm::new(key.as_bytes().into()),
            header,
            header_sent: false,
            index: 0,
            pending: Vec::with_capacity(SEGMENT_SIZE),
        }
    }

    /// Feed plaintext, appending any ciphertext that became final to `out`.
    pub fn update(&mut self, mut data: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        self.emit_header(out);
        while !data.is_empty() {
            // A full buffer followed by more input cannot be the last segment
            if self.pending.len() == SEGMENT_SIZE {
                self.seal_pending(false, out)?;
            }
            let take = (SEGMENT_SIZE - self.pending.len()).min(data.len());
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];
        }
        Ok(())
    }

    /// Seal the buffered remainder as the final segment.
    pub fn finish(mut self, out: &mut Vec<u8>) -> Result<(), CryptoError> {
        self.emit_header(out);
        self.seal_pending(true, out)
    }

    fn emit_header(&mut self, out: &mut Vec<u8>) {
        if !self.header_sent {
            out.extend_from_slice(&self.header);
            self.header_sent = true;
        }
    }

    fn seal_pending(&mut self, last: bool, out: &mut Vec<u8>) -> Result<(), CryptoError> {
        let nonce = segment_nonce(&self.header, self.index, last);
        let sealed = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &self.pending,
                    aad: &self.header,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)?;
        out.extend_from_slice(&sealed);
        self.pending.clear();

        if !last {
            self.index = self.index.checked_add(1).ok_or(CryptoError::StreamTooLong)?;
        }
        Ok(())
    }
}

/// Push-style decryptor, the inverse of [`SegmentEncryptor`].
///
/// Plaintext of a segment is released only after its tag verified, but a
/// later segment may still fail: callers that need all-or-nothing semantics
/// must discard earlier output on error (see [`decrypt_to_vec`]).
pub struct SegmentDecryptor {
    cipher: Aes256Gcm,
    header: Option<[u8; HEADER_SIZE]>,
    index: u32,
    pending: Vec<u8>,
}

impl SegmentDecryptor {
    pub fn new(key: &FileKey) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.as_bytes().into()),
            header: None,
            index: 0,
            pending: Vec::with_capacity(SEALED_SEGMENT_SIZE),
        }
    }

    pub fn update(&mut self, mut data: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        let header = match self.header {
            Some(header) => header,
            None => {
                let take = (HEADER_SIZE - self.pending.len()).min(data.len());
                self.pending.extend_from_slice(&data[..take]);
                data = &data[take..];
                if self.pending.len() < HEADER_SIZE {
                    return Ok(());
                }
                let header = parse_header(&self.pending)?;
                self.header = Some(header);
                self.pending.clear();
                header
            }
        };

        while !data.is_empty() {
            if self.pending.len() == SEALED_SEGMENT_SIZE {
                self.open_pending(&header, false, out)?;
            }
            let take = (SEALED_SEGMENT_SIZE - self.pending.len()).min(data.len());
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];
        }
        Ok(())
    }

    /// Open the buffered remainder as the final segment.
    pub fn finish(mut self, out: &mut Vec<u8>) -> Result<(), CryptoError> {
        let header = self.header.ok_or(CryptoError::Truncated)?;
        if self.pending.len() < TAG_SIZE {
            return Err(CryptoError::Truncated);
        }
        self.open_pending(&header, true, out)
    }

    fn open_pending(
        &mut self,
        header: &[u8; HEADER_SIZE],
        last: bool,
        out: &mut Vec<u8>,
    ) -> Result<(), CryptoError> {
        let plain = open_segment(&self.cipher, header, self.index, last, &self.pending)?;
        out.extend_from_slice(&plain);
        self.pending.clear();

        if !last {
            self.index = self
                .index
                .checked_add(1)
                .ok_or(CryptoError::DecryptionFailed)?;
        }
        Ok(())
    }
}

fn parse_header(bytes: &[u8]) -> Result<[u8; HEADER_SIZE], CryptoError> {
    let header: [u8; HEADER_SIZE] = bytes
        .get(..HEADER_SIZE)
        .and_then(|b| b.try_into().ok())
        .ok_or(CryptoError::Truncated)?;
    if header[0] != STREAM_VERSION {
        return Err(CryptoError::UnsupportedVersion(header[0]));
    }
    Ok(header)
}

fn open_segment(
    cipher: &Aes256Gcm,
    header: &[u8; HEADER_SIZE],
    index: u32,
    last: bool,
    sealed: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let nonce = segment_nonce(header, index, last);
    cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: sealed,
                aad: header,
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Read until `buf` is full or the reader is exhausted.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Encrypt everything from `reader` into `writer`. Returns the number of
/// ciphertext bytes written.
pub fn encrypt<R: Read, W: Write>(
    key: &FileKey,
    mut reader: R,
    mut writer: W,
) -> Result<u64, CryptoError> {
    let mut enc = SegmentEncryptor::new(key);
    let mut buf = vec![0u8; SEGMENT_SIZE];
    let mut out = Vec::with_capacity(HEADER_SIZE + SEALED_SEGMENT_SIZE);
    let mut written = 0u64;

    loop {
        let n = read_full(&mut reader, &mut buf)?;
        if n == 0 {
            break;
        }
        enc.update(&buf[..n], &mut out)?;
        writer.write_all(&out)?;
        written += out.len() as u64;
        out.clear();
    }

    enc.finish(&mut out)?;
    writer.write_all(&out)?;
    writer.flush()?;
    Ok(written + out.len() as u64)
}

/// Decrypt a stream from `reader` into `writer`. Returns the number of
/// plaintext bytes written.
///
/// Verified segments are written as they arrive; on error the writer may hold
/// a prefix of the plaintext, which the caller must discard.
pub fn decrypt<R: Read, W: Write>(
    key: &FileKey,
    mut reader: R,
    mut writer: W,
) -> Result<u64, CryptoError> {
    let mut dec = SegmentDecryptor::new(key);
    let mut buf = vec![0u8; SEALED_SEGMENT_SIZE];
    let mut out = Vec::with_capacity(SEGMENT_SIZE);
    let mut written = 0u64;

    loop {
        let n = read_full(&mut reader, &mut buf)?;
        if n == 0 {
            break;
        }
        dec.update(&buf[..n], &mut out)?;
        writer.write_all(&out)?;
        written += out.len() as u64;
        out.clear();
    }

    dec.finish(&mut out)?;
    writer.write_all(&out)?;
    writer.flush()?;
    Ok(written + out.len() as u64)
}

pub fn encrypt_to_vec(key: &FileKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut out = Vec::with_capacity(encrypted_size(plaintext.len() as u64) as usize);
    let mut enc = SegmentEncryptor::new(key);
    enc.update(plaintext, &mut out)?;
    enc.finish(&mut out)?;
    Ok(out)
}

/// Decrypt a complete stream held in memory. Returns no plaintext at all
/// unless every segment authenticates.
pub fn decrypt_to_vec(key: &FileKey, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut out = Vec::with_capacity(ciphertext.len());
    let mut dec = SegmentDecryptor::new(key);
    dec.update(ciphertext, &mut out)?;
    dec.finish(&mut out)?;
    Ok(out)
}

/// Check `key` against a stream by opening only its first segment.
pub fn is_correct_key<R: Read>(key: &FileKey, mut reader: R) -> Result<bool, CryptoError> {
    let mut header = [0u8; HEADER_SIZE];
    if read_full(&mut reader, &mut header)? < HEADER_SIZE {
        return Err(CryptoError::Truncated);
    }
    let header = parse_header(&header)?;

    // One byte past a full segment tells whether more segments follow
    let mut first = vec![0u8; SEALED_SEGMENT_SIZE + 1];
    let n = read_full(&mut reader, &mut first)?;
    let (sealed, last) = if n > SEALED_SEGMENT_SIZE {
        (&first[..SEALED_SEGMENT_SIZE], false)
    } else if n >= TAG_SIZE {
        (&first[..n], true)
    } else {
        return Err(CryptoError::Truncated);
    };

    let cipher = Aes256Gcm::new(key.as_bytes().into());
    Ok(open_segment(&cipher, &header, 0, last, sealed).is_ok())
}

/// `Write` adapter that encrypts everything written through it.
///
/// [`EncryptWriter::finish`] must be called to emit the final segment.
pub struct EncryptWriter<W: Write> {
    inner: W,
    enc: SegmentEncryptor,
    out: Vec<u8>,
}

impl<W: Write> EncryptWriter<W> {
    pub fn new(key: &FileKey, inner: W) -> Self {
        Self {
            inner,
            enc: SegmentEncryptor::new(key),
            out: Vec::with_capacity(HEADER_SIZE + SEALED_SEGMENT_SIZE),
        }
    }

    /// Emit the final segment and hand back the inner writer.
    pub fn finish(self) -> std::io::Result<W> {
        let EncryptWriter {
            mut inner,
            enc,
            mut out,
        } = self;
        enc.finish(&mut out).map_err(std::io::Error::other)?;
        inner.write_all(&out)?;
        inner.flush()?;
        Ok(inner)
    }
}

impl<W: Write> Write for EncryptWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.enc
            .update(buf, &mut self.out)
            .map_err(std::io::Error::other)?;
        self.inner.write_all(&self.out)?;
        self.out.clear();
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
