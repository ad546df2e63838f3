mod command;
mod event;
mod ui;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::io::BufReader;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, fmt};

use xorlink_core::protocol::CHAT_PAYLOAD_LEN;
use xorlink_core::transport::Connector;
use xorlink_engine::client::Client;
use xorlink_engine::engine::{Engine, EngineCmd, EngineConfig, EngineEvent};
use xorlink_engine::pool::default_worker_count;
use xorlink_engine::session::SessionConfig;
use xorlink_engine::tcp::{TcpConnector, TcpListenerFactory};

use crate::command::{ClientAction, run_client_command};
use crate::event::spawn_event_printer;
use crate::ui::{print_client_help, print_prompt, print_server_banner, print_server_help, read_line};

/// xorlink: obscured chat and file drop over TCP.
///
/// `serve` accepts clients and prints what they send; `connect` opens an
/// interactive session to a server.
#[derive(Parser, Debug)]
#[command(name = "xorlink", version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Accept connections and receive chat messages and files.
    Serve(ServeArgs),
    /// Connect to a server and send chat messages and files.
    Connect(ConnectArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to listen on.
    #[arg(short, long, default_value = "127.0.0.1:55555")]
    listen: String,

    /// Maximum number of clients served at once. Defaults to the number of
    /// hardware threads.
    #[arg(short, long)]
    workers: Option<usize>,

    /// Directory where received files are stored.
    #[arg(short, long, default_value = "/tmp/xorlink")]
    receive_dir: PathBuf,

    /// Seconds a session may sit idle before it is dropped. 0 disables.
    #[arg(long, default_value_t = 300)]
    io_timeout: u64,
}

#[derive(Args, Debug)]
struct ConnectArgs {
    /// Server address.
    #[arg(short, long, default_value = "127.0.0.1:55555")]
    addr: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Tracing goes to stderr so it doesn't mix with the interactive
    // prompt on stdout.  Default to "warn" for library crates so
    // only the CLI's own output is visible.
    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("xorlink_cli=info,warn")),
        )
        .init();

    let result = match cli.mode {
        Mode::Serve(args) => serve(args).await,
        Mode::Connect(args) => connect(args).await,
    };

    if let Err(e) = result {
        eprintln!("xorlink: {e:#}");
        std::process::exit(1);
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    std::fs::create_dir_all(&args.receive_dir).with_context(|| {
        format!(
            "failed to create receive directory {}",
            args.receive_dir.display()
        )
    })?;

    let workers = args.workers.unwrap_or_else(default_worker_count);
    let config = EngineConfig {
        workers,
        session: SessionConfig {
            receive_dir: args.receive_dir.clone(),
            io_timeout: (args.io_timeout > 0).then(|| Duration::from_secs(args.io_timeout)),
            chat_payload_len: CHAT_PAYLOAD_LEN,
        },
        rng_seed: None,
    };

    info!(
        listen = %args.listen,
        workers,
        receive_dir = %args.receive_dir.display(),
        "Starting server"
    );
    let engine = Engine;
    let handle = engine.start(TcpListenerFactory, config);

    // Subscribe before the first command so no event is missed.
    let mut stopped_rx = handle.events_tx.subscribe();
    spawn_event_printer(handle.events_tx.subscribe());

    let cmd_tx = handle.cmd_tx.clone();
    cmd_tx
        .send(EngineCmd::StartAccepting {
            addr: args.listen.clone(),
        })
        .await
        .context("engine is not running")?;

    // Small delay so the "Listening on ..." event prints before
    // the banner.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // ── Banner ──────────────────────────────────────────────────
    print_server_banner(&args.listen, workers, &args.receive_dir);
    print_server_help();
    print_prompt();

    // ── Interactive prompt loop ─────────────────────────────────
    let mut stdin = BufReader::new(tokio::io::stdin());

    while let Some(line) = read_line(&mut stdin).await {
        match line.as_str() {
            "" => {}
            "start" => {
                let _ = cmd_tx
                    .send(EngineCmd::StartAccepting {
                        addr: args.listen.clone(),
                    })
                    .await;
            }
            "pause" => {
                let _ = cmd_tx.send(EngineCmd::StopAccepting).await;
            }
            "help" | "?" => print_server_help(),
            "quit" | "exit" | "q" => break,
            other => {
                println!("  ❓ Unknown command: \"{other}\".  Type 'help' for usage.");
            }
        }
        print_prompt();
    }

    println!("\n  Shutting down...");
    let _ = cmd_tx.send(EngineCmd::ShutDown).await;
    // Wait until every session has been cancelled and drained.
    loop {
        match stopped_rx.recv().await {
            Ok(EngineEvent::Stopped) | Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                break;
            }
            _ => {}
        }
    }
    println!("  Bye! 👋");
    Ok(())
}

async fn connect(args: ConnectArgs) -> anyhow::Result<()> {
    info!(addr = %args.addr, "Connecting");
    let conn = TcpConnector.connect(&args.addr).await?;
    let mut rng = StdRng::from_entropy();
    let mut client = Client::connect(conn, &mut rng)
        .await
        .with_context(|| format!("handshake with {} failed", args.addr))?;

    println!("\n  🤝 Connected to {}", args.addr);
    print_client_help();
    print_prompt();

    let mut stdin = BufReader::new(tokio::io::stdin());

    while let Some(line) = read_line(&mut stdin).await {
        if line.is_empty() {
            print_prompt();
            continue;
        }
        match run_client_command(&line, &mut client, &mut stdin).await {
            Ok(ClientAction::Continue) => print_prompt(),
            Ok(ClientAction::Stop) => {
                client.stop().await?;
                println!("  Ending conversation with server. Bye! 👋");
                return Ok(());
            }
            Ok(ClientAction::ServerGone) => {
                println!("  Server disconnected.");
                return Ok(());
            }
            Ok(ClientAction::Aborted) => {
                println!("  Session ended after the failed upload.");
                return Ok(());
            }
            Err(e) if e.is_disconnect() => {
                println!("  Server closed the connection.");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
    }

    debug!("stdin closed, stopping session");
    client.stop().await?;
    Ok(())
}
