use tokio::sync::broadcast;

use xorlink_engine::engine::EngineEvent;
use xorlink_engine::session::SessionEvent;

use crate::ui::{format_size, print_prompt};

/// Spawns a task that listens for engine events and prints them.
pub fn spawn_event_printer(mut events_rx: broadcast::Receiver<EngineEvent>) {
    tokio::spawn(async move {
        loop {
            match events_rx.recv().await {
                Ok(EngineEvent::Accepting { addr }) => {
                    println!("\n  ✔ Listening on {addr}");
                    print_prompt();
                }
                Ok(EngineEvent::AcceptingStopped) => {
                    println!("\n  ⏹ Stopped accepting connections");
                    print_prompt();
                }
                Ok(EngineEvent::SessionCreated { session_id, peer }) => {
                    println!("\n  📡 Session #{session_id}: client {peer} connected");
                    print_prompt();
                }
                Ok(EngineEvent::SessionEvent { session_id, event }) => {
                    print_session_event(session_id, event);
                }
                Ok(EngineEvent::Error { message }) => {
                    println!("\n  ❌ Engine error: {message}");
                    print_prompt();
                }
                Ok(EngineEvent::Stopped) | Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    println!("\n  ⚠ Missed {n} events");
                    print_prompt();
                }
            }
        }
    });
}

fn print_session_event(session_id: u64, event: SessionEvent) {
    match event {
        SessionEvent::Connected => {
            println!("\n  🤝 Session #{session_id}: key agreement complete");
        }
        SessionEvent::ChatReceived { text } => {
            println!("\n  💬 #{session_id}: {text}");
        }
        SessionEvent::FileReceived { path, size_bytes } => {
            println!(
                "\n  🎉 Session #{session_id}: received {} ({})",
                path.display(),
                format_size(size_bytes)
            );
        }
        SessionEvent::FileFailed {
            path,
            received,
            declared,
            reason,
        } => {
            let kept = path.map_or_else(
                || "nothing saved".to_string(),
                |p| format!("partial file kept at {}", p.display()),
            );
            println!(
                "\n  ❌ Session #{session_id}: upload failed after {} of {} ({reason}); {kept}",
                format_size(received),
                format_size(declared),
            );
        }
        SessionEvent::UnknownCommand { token } => {
            println!("\n  ❓ Session #{session_id}: ignored token {token}");
        }
        SessionEvent::Error { message } => {
            println!("\n  ❌ Session #{session_id}: error: {message}");
        }
        SessionEvent::Finished => {
            println!("\n  👋 Session #{session_id}: session finished");
        }
    }
    print_prompt();
}
