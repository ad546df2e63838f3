use std::path::Path;

use rand::Rng;
use tokio::fs::File;
use tokio::io::AsyncRead;
use tracing::{debug, info};

use xorlink_core::cipher::{self, SharedSecret};
use xorlink_core::error::SessionError;
use xorlink_core::file_transfer::send_file;
use xorlink_core::key_agreement::client_handshake;
use xorlink_core::protocol::{
    ACK_LEN, CHAT_PAYLOAD_LEN, Command, DISCONNECT_NOTICE, FILE_SUCCESS, FileHeader, TOKEN_LEN,
    decode_ack,
};
use xorlink_core::transport::{Connection, ConnectionExt};

/// What the server answered to a chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatReply {
    /// The confirmation text.
    Confirmed(String),
    /// The server announced it is going away.
    Disconnected,
}

/// What the server answered to a file upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReply {
    /// `true` when the server confirmed the full body.
    pub ok: bool,
    /// The confirmation text as received.
    pub message: String,
    /// Body bytes actually sent.
    pub sent: u64,
}

/// Client end of a session.
pub struct Client<C> {
    conn: C,
    secret: SharedSecret,
    chat_payload_len: usize,
}

impl<C: Connection> Client<C> {
    /// Runs the client side of the key agreement over `conn`.
    ///
    /// # Errors
    ///
    /// Fails if the server sends an unusable modulus or the connection
    /// breaks.
    pub async fn connect<R: Rng + ?Sized>(mut conn: C, rng: &mut R) -> Result<Self, SessionError> {
        let secret = client_handshake(&mut conn, rng).await?;
        info!(peer = %conn.peer(), "Connected");
        Ok(Self {
            conn,
            secret,
            chat_payload_len: CHAT_PAYLOAD_LEN,
        })
    }

    /// Overrides the chat payload size. Must match the server's setting.
    #[must_use]
    pub fn with_chat_payload_len(mut self, len: usize) -> Self {
        self.chat_payload_len = len;
        self
    }

    #[must_use]
    pub fn secret(&self) -> SharedSecret {
        self.secret
    }

    /// Gives back the underlying connection.
    pub fn into_inner(self) -> C {
        self.conn
    }

    /// Sends a raw token and returns the server's acknowledgement.
    ///
    /// # Errors
    ///
    /// Fails if the connection breaks.
    pub async fn send_token(&mut self, token: [u8; TOKEN_LEN]) -> Result<String, SessionError> {
        self.conn.send_all(&token).await?;
        self.read_ack().await
    }

    /// Sends one chat message. Text longer than the payload is truncated on
    /// a character boundary.
    ///
    /// # Errors
    ///
    /// Fails if the connection breaks.
    pub async fn chat(&mut self, text: &str) -> Result<ChatReply, SessionError> {
        self.send_token(Command::Chat.token()).await?;

        let mut payload = vec![0u8; self.chat_payload_len];
        // Keep at least one NUL so the server finds the end of the text.
        let mut keep = text.len().min(self.chat_payload_len.saturating_sub(1));
        while !text.is_char_boundary(keep) {
            keep -= 1;
        }
        payload[..keep].copy_from_slice(&text.as_bytes()[..keep]);
        cipher::apply(&mut payload, self.secret);
        self.conn.send_all(&payload).await?;

        let reply = self.read_ack().await?;
        debug!(reply = %reply, "Chat reply");
        if reply == DISCONNECT_NOTICE {
            return Ok(ChatReply::Disconnected);
        }
        Ok(ChatReply::Confirmed(reply))
    }

    /// Uploads the file at `path`, announcing its extension to the server.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or the connection breaks.
    pub async fn send_file(&mut self, path: &Path) -> Result<TransferReply, SessionError> {
        let mut file = File::open(path).await.map_err(SessionError::File)?;
        let size = file.metadata().await.map_err(SessionError::File)?.len();
        let header = FileHeader {
            size,
            extension: path
                .extension()
                .map(|e| e.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        info!(path = %path.display(), size, "Uploading file");
        self.upload(&mut file, &header).await
    }

    /// Uploads `header.size` bytes drawn from `reader`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::UploadAborted`] if `reader` fails or runs dry
    /// before `header.size` bytes. The connection is half-closed by then and
    /// the client must not be used further. Also fails if the connection
    /// breaks.
    pub async fn upload<R>(
        &mut self,
        reader: &mut R,
        header: &FileHeader,
    ) -> Result<TransferReply, SessionError>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.send_token(Command::Send.token()).await?;
        let sent = match send_file(&mut self.conn, self.secret, reader, header).await {
            Ok(sent) => sent,
            Err(e @ SessionError::UploadAborted { .. }) => {
                // The server answers a short body with a failure before closing.
                match self.read_ack().await {
                    Ok(reply) => debug!(reply = %reply, "Server reply to aborted upload"),
                    Err(err) => debug!(error = %err, "No reply to aborted upload"),
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        let message = self.read_ack().await?;
        Ok(TransferReply {
            ok: message == FILE_SUCCESS,
            message,
            sent,
        })
    }

    /// Ends the session and returns the connection, which the server
    /// closes from its side.
    ///
    /// # Errors
    ///
    /// Fails if the connection breaks before the stop is acknowledged.
    pub async fn stop(mut self) -> Result<C, SessionError> {
        self.send_token(Command::Stop.token()).await?;
        info!(peer = %self.conn.peer(), "Session stopped");
        Ok(self.conn)
    }

    async fn read_ack(&mut self) -> Result<String, SessionError> {
        let mut buf = [0u8; ACK_LEN];
        self.conn.read_full(&mut buf).await?;
        Ok(decode_ack(&buf))
    }
}
