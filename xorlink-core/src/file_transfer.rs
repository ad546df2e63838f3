//! File upload sub-protocol: a [`FileHeader`] followed by the body in
//! independently encrypted [`CHUNK_SIZE`] chunks.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::cipher::{self, SharedSecret};
use crate::error::SessionError;
use crate::protocol::{CHUNK_SIZE, FILE_HEADER_LEN, FileHeader};
use crate::transport::{Connection, ConnectionExt};

/// Result of receiving one file body.
#[derive(Debug)]
pub struct TransferOutcome {
    /// Size announced in the header.
    pub declared: u64,
    /// Body bytes actually read from the connection.
    pub received: u64,
    /// First error hit while writing to the destination. Reading carries
    /// on after it so the stream stays in sync.
    pub write_error: Option<io::Error>,
    /// Set when the peer went away (or the transport failed) before the
    /// declared size arrived. The session cannot continue after this.
    pub disconnect: Option<SessionError>,
}

impl TransferOutcome {
    /// `true` when every declared byte arrived and was written.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.received == self.declared && self.write_error.is_none() && self.disconnect.is_none()
    }
}

/// Reads and decodes the header that opens an upload.
///
/// # Errors
///
/// Fails if the connection breaks before all header bytes arrive.
pub async fn read_header<C: Connection>(conn: &mut C) -> Result<FileHeader, SessionError> {
    let mut raw = [0u8; FILE_HEADER_LEN];
    conn.read_full(&mut raw).await?;
    Ok(FileHeader::decode(&raw))
}

/// Sends `header` and then exactly `header.size` bytes drawn from `reader`,
/// one encrypted chunk at a time. Returns the number of body bytes sent.
///
/// If `reader` fails or ends before `header.size` bytes, the write half is
/// shut down so the receiver sees a short body instead of waiting for the
/// rest.
///
/// # Errors
///
/// Returns [`SessionError::UploadAborted`] when `reader` cannot supply the
/// declared size, or a transport error if the connection breaks.
pub async fn send_file<C, R>(
    conn: &mut C,
    secret: SharedSecret,
    reader: &mut R,
    header: &FileHeader,
) -> Result<u64, SessionError>
where
    C: Connection,
    R: AsyncRead + Unpin + Send,
{
    conn.send_all(&header.to_bytes()).await?;

    let mut chunk = vec![0u8; CHUNK_SIZE];
    let mut sent = 0u64;
    while sent < header.size {
        let want = chunk_len(header.size - sent);
        let n = match fill(reader, &mut chunk[..want]).await {
            Ok(0) => {
                let reason = "source ended early".to_string();
                return Err(abort_upload(conn, sent, header.size, reason).await);
            }
            Ok(n) => n,
            Err(e) => return Err(abort_upload(conn, sent, header.size, e.to_string()).await),
        };
        cipher::apply(&mut chunk[..n], secret);
        conn.send_all(&chunk[..n]).await?;
        sent += n as u64;
    }
    debug!(sent, "File body sent");
    Ok(sent)
}

async fn abort_upload<C: Connection>(
    conn: &mut C,
    sent: u64,
    declared: u64,
    reason: String,
) -> SessionError {
    warn!(sent, declared, reason = %reason, "Upload aborted, closing connection");
    if let Err(e) = conn.shutdown().await {
        debug!(error = %e, "Shutdown after aborted upload failed");
    }
    SessionError::UploadAborted {
        sent,
        declared,
        reason,
    }
}

/// Receives `size` body bytes, decrypting each chunk before writing it to
/// `writer`.
///
/// A peer disconnect is reported in the outcome rather than as an error so
/// the caller can still answer with a failure confirmation. Partial output
/// is left in place.
pub async fn receive_file<C, W>(
    conn: &mut C,
    secret: SharedSecret,
    writer: &mut W,
    size: u64,
) -> TransferOutcome
where
    C: Connection,
    W: AsyncWrite + Unpin + Send,
{
    let mut outcome = TransferOutcome {
        declared: size,
        received: 0,
        write_error: None,
        disconnect: None,
    };
    let mut chunk = vec![0u8; CHUNK_SIZE];

    while outcome.received < size {
        let want = chunk_len(size - outcome.received);
        let got = match conn.read_full(&mut chunk[..want]).await {
            Ok(()) => want,
            Err(SessionError::ConnectionClosed { received, .. }) => {
                outcome.disconnect = Some(SessionError::ConnectionClosed {
                    expected: want,
                    received,
                });
                received
            }
            Err(e) => {
                outcome.disconnect = Some(e);
                0
            }
        };

        cipher::apply(&mut chunk[..got], secret);
        outcome.received += got as u64;
        if outcome.write_error.is_none() {
            if let Err(e) = writer.write_all(&chunk[..got]).await {
                warn!(error = %e, "Failed to write upload chunk, draining the rest");
                outcome.write_error = Some(e);
            }
        }

        if outcome.disconnect.is_some() {
            break;
        }
    }

    if outcome.write_error.is_none() {
        if let Err(e) = writer.flush().await {
            outcome.write_error = Some(e);
        }
    }
    debug!(
        received = outcome.received,
        declared = outcome.declared,
        "File body received"
    );
    outcome
}

/// Builds the destination name for an upload: `upload-<unix millis>.<ext>`.
#[must_use]
pub fn output_file_name(extension: &str) -> String {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("upload-{ts}.{}", sanitize_extension(extension))
}

/// Keeps ASCII alphanumerics only, so a hostile extension cannot escape
/// the receive directory. Falls back to `bin`.
#[must_use]
pub fn sanitize_extension(extension: &str) -> String {
    let clean: String = extension
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect();
    if clean.is_empty() { "bin".into() } else { clean }
}

/// Creates `name` inside `dir`, renaming to `stem (n).ext` on collision.
///
/// # Errors
///
/// Fails if the directory is missing or not writable.
pub async fn create_unique(dir: &Path, name: &str) -> io::Result<(PathBuf, File)> {
    let (stem, ext) = match name.rsplit_once('.') {
        Some((s, e)) => (s, Some(e)),
        None => (name, None),
    };
    for n in 0u32.. {
        let candidate = match (n, ext) {
            (0, _) => name.to_string(),
            (n, Some(ext)) => format!("{stem} ({n}).{ext}"),
            (n, None) => format!("{stem} ({n})"),
        };
        let path = dir.join(&candidate);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::other("exhausted collision suffixes"))
}

fn chunk_len(remaining: u64) -> usize {
    usize::try_from(remaining).map_or(CHUNK_SIZE, |r| r.min(CHUNK_SIZE))
}

/// Reads until `buf` is full or the reader is exhausted.
async fn fill<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use tokio::io::ReadBuf;

    use super::*;
    use crate::memory::MemoryConnection;

    const KEY: SharedSecret = SharedSecret(0x1234_5678_9ABC_DEF0);

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    async fn round_trip(len: usize) -> (TransferOutcome, Vec<u8>) {
        let (mut sender, mut receiver) = MemoryConnection::pair(4096);
        let body = sample(len);
        let header = FileHeader {
            size: len as u64,
            extension: "dat".into(),
        };

        let send = async {
            let mut reader = &body[..];
            send_file(&mut sender, KEY, &mut reader, &header).await
        };
        let recv = async {
            let header = read_header(&mut receiver).await.unwrap();
            assert_eq!(header.extension, "dat");
            let mut out = Vec::new();
            let outcome = receive_file(&mut receiver, KEY, &mut out, header.size).await;
            (outcome, out)
        };
        let (sent, (outcome, out)) = tokio::join!(send, recv);
        assert_eq!(sent.unwrap(), len as u64);
        (outcome, out)
    }

    #[tokio::test]
    async fn given_chunk_boundary_sizes_when_round_tripped_then_content_identical() {
        for len in [0, 1, 1023, 1024, 2500] {
            let (outcome, out) = round_trip(len).await;
            assert!(outcome.is_complete(), "len {len}: {outcome:?}");
            assert_eq!(out, sample(len), "len {len}");
        }
    }

    #[tokio::test]
    async fn given_body_on_wire_when_inspected_then_each_chunk_is_encrypted_from_key_byte_zero() {
        let (mut sender, mut receiver) = MemoryConnection::pair(8192);
        let body = vec![0u8; 1030];
        let header = FileHeader {
            size: 1030,
            extension: "bin".into(),
        };
        let mut reader = &body[..];
        send_file(&mut sender, KEY, &mut reader, &header).await.unwrap();

        let mut raw = vec![0u8; FILE_HEADER_LEN + 1030];
        receiver.read_full(&mut raw).await.unwrap();
        let body_on_wire = &raw[FILE_HEADER_LEN..];
        let key = KEY.key_bytes();
        // Last chunk (6 bytes) restarts the schedule.
        assert_eq!(&body_on_wire[1024..], &key[..6]);
        assert_eq!(&body_on_wire[..8], &key);
    }

    #[tokio::test]
    async fn given_peer_disconnects_mid_body_when_receiving_then_outcome_is_incomplete() {
        let (mut sender, mut receiver) = MemoryConnection::pair(8192);
        let partial = sample(1500);
        let mut encrypted = partial.clone();
        cipher::apply(&mut encrypted[..1024], KEY);
        cipher::apply(&mut encrypted[1024..], KEY);
        sender.write_all(&encrypted).await.unwrap();
        drop(sender);

        let mut out = Vec::new();
        let outcome = receive_file(&mut receiver, KEY, &mut out, 2500).await;
        assert!(!outcome.is_complete());
        assert_eq!(outcome.received, 1500);
        assert!(outcome.disconnect.is_some());
        assert_eq!(out, partial);
    }

    #[tokio::test]
    async fn given_reader_shorter_than_header_when_sending_then_aborts_and_closes_write_half() {
        let (mut sender, mut receiver) = MemoryConnection::pair(8192);
        let header = FileHeader {
            size: 100,
            extension: "txt".into(),
        };
        let mut reader = &b"only ten b"[..];
        let err = send_file(&mut sender, KEY, &mut reader, &header)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::UploadAborted {
                sent: 10,
                declared: 100,
                ..
            }
        ));

        // The receiver sees the short body end instead of blocking.
        let header = read_header(&mut receiver).await.unwrap();
        let mut out = Vec::new();
        let outcome = receive_file(&mut receiver, KEY, &mut out, header.size).await;
        assert_eq!(outcome.received, 10);
        assert!(outcome.disconnect.is_some());
        assert_eq!(out, b"only ten b");
    }

    struct BrokenReader;

    impl AsyncRead for BrokenReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::other("disk gone")))
        }
    }

    #[tokio::test]
    async fn given_reader_fails_mid_body_when_sending_then_aborts_with_reason() {
        let (mut sender, mut receiver) = MemoryConnection::pair(8192);
        let header = FileHeader {
            size: 2048,
            extension: "bin".into(),
        };
        let mut reader = (&[1u8; 1024][..]).chain(BrokenReader);
        let err = send_file(&mut sender, KEY, &mut reader, &header)
            .await
            .unwrap_err();
        let SessionError::UploadAborted { sent, reason, .. } = err else {
            panic!("expected UploadAborted, got {err:?}");
        };
        assert_eq!(sent, 1024);
        assert!(reason.contains("disk gone"));

        let header = read_header(&mut receiver).await.unwrap();
        let mut out = Vec::new();
        let outcome = receive_file(&mut receiver, KEY, &mut out, header.size).await;
        assert_eq!(outcome.received, 1024);
        assert!(!outcome.is_complete());
    }

    #[test]
    fn given_hostile_extension_when_sanitized_then_path_characters_removed() {
        assert_eq!(sanitize_extension("../../etc"), "etc");
        assert_eq!(sanitize_extension("tar.gz"), "targz");
        assert_eq!(sanitize_extension(""), "bin");
        assert_eq!(sanitize_extension("/\\"), "bin");
    }

    #[test]
    fn when_building_output_name_expect_prefix_and_extension() {
        let name = output_file_name("png");
        assert!(name.starts_with("upload-"));
        assert!(name.ends_with(".png"));
    }

    #[tokio::test]
    async fn given_existing_file_when_creating_unique_then_suffix_added() {
        let dir = tempfile::tempdir().unwrap();
        let (first, _) = create_unique(dir.path(), "a.txt").await.unwrap();
        let (second, _) = create_unique(dir.path(), "a.txt").await.unwrap();
        let (third, _) = create_unique(dir.path(), "a.txt").await.unwrap();
        assert_eq!(first, dir.path().join("a.txt"));
        assert_eq!(second, dir.path().join("a (1).txt"));
        assert_eq!(third, dir.path().join("a (2).txt"));
    }

    #[tokio::test]
    async fn given_missing_directory_when_creating_unique_then_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(create_unique(&missing, "a.txt").await.is_err());
    }
}
