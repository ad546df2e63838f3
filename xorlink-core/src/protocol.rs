use bytes::{Buf, BufMut, BytesMut};

/// Size of a command token on the wire.
pub const TOKEN_LEN: usize = 8;
/// Size of every acknowledgement / confirmation text.
pub const ACK_LEN: usize = 32;
/// Default size of an encrypted chat payload.
pub const CHAT_PAYLOAD_LEN: usize = 1024 * 1024;
/// Size of one file body chunk.
pub const CHUNK_SIZE: usize = 1024;
/// Size of the NUL-padded extension field in a [`FileHeader`].
pub const EXTENSION_LEN: usize = 16;
/// Total encoded size of a [`FileHeader`].
pub const FILE_HEADER_LEN: usize = 8 + EXTENSION_LEN;

/// Sent after every token read, whatever the token was. The spelling is
/// part of the wire format.
pub const TOKEN_ACK: &str = "Recieved message confirmation";
/// Sent after a chat payload has been received.
pub const CHAT_CONFIRMATION: &str = "Recieved message confirmation";
/// Sent when an upload's received byte count matches its header.
pub const FILE_SUCCESS: &str = "Received file confirmation";
/// Sent when an upload ended short of its declared size.
pub const FILE_FAILURE: &str = "File transfer failed";
/// A confirmation slot holding this text means the peer is leaving and no
/// reply should be expected.
pub const DISCONNECT_NOTICE: &str = "STOP";

/// A command token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Chat,
    Send,
    Stop,
    /// Anything else. The server acknowledges it and keeps waiting.
    Unknown([u8; TOKEN_LEN]),
}

impl Command {
    /// Interprets a raw token.
    ///
    /// `CHAT` is a prefix match on the first four bytes; `SEND` and `STOP`
    /// must match exactly up to the first NUL.
    #[must_use]
    pub fn parse(token: &[u8; TOKEN_LEN]) -> Self {
        if token.starts_with(b"CHAT") {
            return Self::Chat;
        }
        match trim_nul(token) {
            b"SEND" => Self::Send,
            b"STOP" => Self::Stop,
            _ => Self::Unknown(*token),
        }
    }

    /// Returns the NUL-padded token for this command.
    #[must_use]
    pub fn token(&self) -> [u8; TOKEN_LEN] {
        match self {
            Self::Chat => pad(b"CHAT"),
            Self::Send => pad(b"SEND"),
            Self::Stop => pad(b"STOP"),
            Self::Unknown(raw) => *raw,
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Chat => f.write_str("CHAT"),
            Self::Send => f.write_str("SEND"),
            Self::Stop => f.write_str("STOP"),
            Self::Unknown(raw) => write!(f, "{:?}", String::from_utf8_lossy(trim_nul(raw))),
        }
    }
}

/// Copies `src` into a zeroed fixed-size array, truncating if needed.
#[must_use]
pub fn pad<const N: usize>(src: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    let n = src.len().min(N);
    out[..n].copy_from_slice(&src[..n]);
    out
}

/// Returns the prefix of `buf` up to (not including) the first NUL.
#[must_use]
pub fn trim_nul(buf: &[u8]) -> &[u8] {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    &buf[..end]
}

/// Encodes a 32-byte acknowledgement text.
#[must_use]
pub fn encode_ack(text: &str) -> [u8; ACK_LEN] {
    pad(text.as_bytes())
}

/// Decodes a 32-byte acknowledgement into its text.
#[must_use]
pub fn decode_ack(buf: &[u8; ACK_LEN]) -> String {
    String::from_utf8_lossy(trim_nul(buf)).into_owned()
}

/// Header that precedes every file body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// Declared body size in bytes.
    pub size: u64,
    /// File extension without the leading dot. At most 15 bytes survive
    /// encoding so the field stays NUL-terminated.
    pub extension: String,
}

impl FileHeader {
    /// Encodes the header: native-endian size then the padded extension.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(FILE_HEADER_LEN);
        buf.put_u64_ne(self.size);
        let ext = self.extension.as_bytes();
        let keep = ext.len().min(EXTENSION_LEN - 1);
        let field: [u8; EXTENSION_LEN] = pad(&ext[..keep]);
        buf.put_slice(&field);
    }

    /// Convenience wrapper returning the encoded bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; FILE_HEADER_LEN] {
        let mut buf = BytesMut::with_capacity(FILE_HEADER_LEN);
        self.encode(&mut buf);
        pad(&buf)
    }

    /// Decodes a complete header.
    #[must_use]
    pub fn decode(raw: &[u8; FILE_HEADER_LEN]) -> Self {
        let mut buf = &raw[..];
        let size = buf.get_u64_ne();
        let extension = String::from_utf8_lossy(trim_nul(buf)).into_owned();
        Self { size, extension }
    }
}
