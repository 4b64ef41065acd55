//! Authenticated session framing.
//!
//! Wraps a byte stream into a buffered duplex channel with a running
//! HMAC-SHA-256 hash. The *same* hash instance covers both directions:
//! every hashed write and read feeds it, [`Session::send_sig`] seals the
//! outgoing direction and [`Session::check_sig`] verifies the incoming
//! one, each mixing in the *opposite* side's 32-byte challenge so a
//! signature can never be replayed across directions.
//!
//! All I/O respects a whole-session deadline fixed at creation time
//! (10 minutes by default); an expired deadline surfaces as a timed-out
//! I/O error and tears the session down.

use std::io;

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::time::Instant;

use crate::{KEY_SIZE, SESSION_DEADLINE};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum SessionError {
    /// `set_key` was given a key of the wrong length.
    #[error("invalid key size")]
    KeySize,
    /// The peer's signature did not verify.
    #[error("signature mismatch")]
    Sig,
    /// Malformed exchange: bad greeting, unexpected byte, missing key.
    #[error("protocol error")]
    Proto,
    /// An encoded frame exceeded the size limit.
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One side of an authenticated connection.
pub struct Session<S> {
    stream: BufStream<S>,
    mac: Option<HmacSha256>,
    /// Challenge we generated and sent to the peer.
    chal_them: [u8; KEY_SIZE],
    /// Challenge the peer sent to us.
    chal_us: [u8; KEY_SIZE],
    deadline: Instant,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    /// Wraps `stream` with the default 10-minute session deadline.
    pub fn new(stream: S) -> Self {
        Self::with_deadline(stream, SESSION_DEADLINE)
    }

    pub fn with_deadline(stream: S, deadline: std::time::Duration) -> Self {
        Session {
            stream: BufStream::new(stream),
            mac: None,
            chal_them: [0; KEY_SIZE],
            chal_us: [0; KEY_SIZE],
            deadline: Instant::now() + deadline,
        }
    }

    /// Installs the HMAC key. Must be exactly [`KEY_SIZE`] bytes.
    pub fn set_key(&mut self, key: &[u8]) -> Result<(), SessionError> {
        if key.len() != KEY_SIZE {
            return Err(SessionError::KeySize);
        }
        self.mac = Some(HmacSha256::new_from_slice(key).map_err(|_| SessionError::KeySize)?);
        Ok(())
    }

    /// Resets the running hash.
    pub fn reset(&mut self) {
        if let Some(mac) = &mut self.mac {
            let _ = mac.finalize_reset();
        }
    }

    /// Feeds bytes into the hash without any I/O.
    pub fn absorb(&mut self, buf: &[u8]) {
        if let Some(mac) = &mut self.mac {
            mac.update(buf);
        }
    }

    /// Writes `buf`, feeding it into the hash first.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), SessionError> {
        self.absorb(buf);
        let deadline = self.deadline;
        io_at(deadline, self.stream.write_all(buf)).await?;
        Ok(())
    }

    /// Reads exactly `buf.len()` bytes, feeding them into the hash.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), SessionError> {
        let deadline = self.deadline;
        io_at(deadline, self.stream.read_exact(buf)).await?;
        self.absorb(buf);
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), SessionError> {
        let deadline = self.deadline;
        io_at(deadline, self.stream.flush()).await?;
        Ok(())
    }

    /// Appends `buf` and the peer's challenge to the hash, then appends
    /// the resulting digest to `buf` and resets the hash.
    pub fn sign(&mut self, buf: &mut Vec<u8>) -> Result<(), SessionError> {
        let mac = self.mac.as_mut().ok_or(SessionError::Proto)?;
        mac.update(buf);
        mac.update(&self.chal_us);
        buf.extend_from_slice(&mac.finalize_reset().into_bytes());
        Ok(())
    }

    /// Seals the outgoing direction: sends the digest over everything
    /// hashed so far plus the peer's challenge, then resets the hash.
    /// The signature bytes themselves are not hashed.
    pub async fn send_sig(&mut self) -> Result<(), SessionError> {
        let mac = self.mac.as_mut().ok_or(SessionError::Proto)?;
        mac.update(&self.chal_us);
        let sig = mac.finalize_reset().into_bytes();
        let deadline = self.deadline;
        io_at(deadline, self.stream.write_all(&sig)).await?;
        io_at(deadline, self.stream.flush()).await?;
        Ok(())
    }

    /// Verifies the incoming direction: reads the peer's 32-byte
    /// signature (not hashed), mixes our own challenge into the hash,
    /// compares, and resets the hash.
    pub async fn check_sig(&mut self) -> Result<(), SessionError> {
        let mut received = [0u8; KEY_SIZE];
        let deadline = self.deadline;
        io_at(deadline, self.stream.read_exact(&mut received)).await?;
        let mac = self.mac.as_mut().ok_or(SessionError::Proto)?;
        mac.update(&self.chal_them);
        let computed = mac.finalize_reset().into_bytes();
        if computed.as_slice() != received.as_slice() {
            return Err(SessionError::Sig);
        }
        Ok(())
    }

    /// Generates a fresh random challenge and sends `prefix` followed by
    /// it. Neither is fed into the hash.
    pub async fn send_challenge(&mut self, prefix: &[u8]) -> Result<(), SessionError> {
        OsRng.fill_bytes(&mut self.chal_them);
        let deadline = self.deadline;
        io_at(deadline, self.stream.write_all(prefix)).await?;
        let chal = self.chal_them;
        io_at(deadline, self.stream.write_all(&chal)).await?;
        io_at(deadline, self.stream.flush()).await?;
        Ok(())
    }

    /// Reads the peer's 32-byte challenge. Not fed into the hash.
    pub async fn receive_challenge(&mut self) -> Result<(), SessionError> {
        let deadline = self.deadline;
        let mut chal = [0u8; KEY_SIZE];
        io_at(deadline, self.stream.read_exact(&mut chal)).await?;
        self.chal_us = chal;
        Ok(())
    }
}

async fn io_at<T>(
    deadline: Instant,
    fut: impl std::future::Future<Output = io::Result<T>>,
) -> io::Result<T> {
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(res) => res,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "session deadline exceeded",
        )),
    }
}
