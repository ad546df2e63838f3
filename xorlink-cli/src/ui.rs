use std::io::Write;
use std::path::Path;

/// Formats a byte count into a human-readable string (B, KiB, MiB, GiB).
#[allow(clippy::cast_precision_loss)]
pub fn format_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    const GIB: u64 = 1024 * MIB;

    if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Prints the interactive prompt marker (`> `) and flushes stdout.
pub fn print_prompt() {
    print!("\n> ");
    let _ = std::io::stdout().flush();
}

/// Prints the server startup banner.
pub fn print_server_banner(listen_addr: &str, workers: usize, receive_dir: &Path) {
    println!();
    println!("╔══════════════════════════════════════════════════════╗");
    println!("║                  🔐  xorlink server                  ║");
    println!("╠══════════════════════════════════════════════════════╣");
    println!("║  Listen  : {listen_addr:<41} ║");
    println!("║  Workers : {workers:<41} ║");
    println!("║  Save to : {:<41} ║", receive_dir.display().to_string());
    println!("╚══════════════════════════════════════════════════════╝");
    println!();
}

/// Prints the server prompt commands.
pub fn print_server_help() {
    println!();
    println!("  Commands:");
    println!("    pause     Stop accepting new clients");
    println!("    start     Accept clients again");
    println!("    help      Show this help");
    println!("    quit      Disconnect everyone and exit");
}

/// Prints the client prompt commands.
pub fn print_client_help() {
    println!();
    println!("  Commands:");
    println!("    CHAT      Send a message (you will be asked for the text)");
    println!("    SEND      Upload a file (you will be asked for the path)");
    println!("    STOP      End the session");
    println!("    help      Show this help");
    println!();
    println!("  Anything else is sent to the server as a raw token.");
}

/// Reads one trimmed line from the given buffered stdin reader.
/// Returns `None` on EOF or read error.
pub async fn read_line(reader: &mut tokio::io::BufReader<tokio::io::Stdin>) -> Option<String> {
    use tokio::io::AsyncBufReadExt;

    let mut line = String::new();
    match reader.read_line(&mut line).await {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim().to_string()),
    }
}
