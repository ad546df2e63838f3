use std::path::PathBuf;

use tokio::io::BufReader;

use xorlink_core::error::SessionError;
use xorlink_core::protocol::{Command, TOKEN_LEN, pad};
use xorlink_core::transport::Connection;
use xorlink_engine::client::{ChatReply, Client};

use crate::ui::{format_size, print_client_help, read_line};

/// What the prompt loop should do after a command.
pub enum ClientAction {
    Continue,
    Stop,
    ServerGone,
    /// An upload failed partway; the connection is no longer usable.
    Aborted,
}

/// Runs one line typed at the client prompt.
///
/// `CHAT` and `SEND` ask for their argument on the next line; `STOP` ends
/// the session. Any other word of up to eight bytes is sent as a raw token,
/// which the server acknowledges and ignores.
pub async fn run_client_command<C: Connection>(
    line: &str,
    client: &mut Client<C>,
    stdin: &mut BufReader<tokio::io::Stdin>,
) -> Result<ClientAction, SessionError> {
    if matches!(line, "help" | "?") {
        print_client_help();
        return Ok(ClientAction::Continue);
    }

    let token: [u8; TOKEN_LEN] = pad(line.as_bytes());
    match Command::parse(&token) {
        Command::Chat => {
            println!("  Enter your message for the server:");
            let Some(text) = read_line(stdin).await else {
                return Ok(ClientAction::Stop);
            };
            match client.chat(&text).await? {
                ChatReply::Confirmed(reply) => println!("  Server: {reply}"),
                ChatReply::Disconnected => return Ok(ClientAction::ServerGone),
            }
        }
        Command::Send => {
            println!("  Enter the file path:");
            let Some(path) = read_line(stdin).await else {
                return Ok(ClientAction::Stop);
            };
            let path = PathBuf::from(path);
            match client.send_file(&path).await {
                Ok(reply) if reply.ok => {
                    println!("  ✅ Sent {} ({})", path.display(), format_size(reply.sent));
                    println!("  Server: {}", reply.message);
                }
                Ok(reply) => println!("  ❌ Server: {}", reply.message),
                // Opening the file fails before anything is sent.
                Err(SessionError::File(e)) => {
                    println!("  ❌ Cannot read {}: {e}", path.display());
                }
                // The header is out but the body is short; the connection is
                // half-closed and cannot carry another command.
                Err(e @ SessionError::UploadAborted { .. }) => {
                    println!("  ❌ Sending {} failed: {e}", path.display());
                    return Ok(ClientAction::Aborted);
                }
                Err(e) => return Err(e),
            }
        }
        Command::Stop => return Ok(ClientAction::Stop),
        Command::Unknown(raw) => {
            if line.len() > TOKEN_LEN {
                println!(
                    "  ⚠ Tokens are at most {TOKEN_LEN} bytes; sending {}",
                    Command::Unknown(raw)
                );
            }
            let ack = client.send_token(raw).await?;
            println!("  Server: {ack}");
        }
    }
    Ok(ClientAction::Continue)
}
