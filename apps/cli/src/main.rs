//! Firefly CLI
//!
//! Command-line bootstrap (§11 "Daemon/CLI bootstrap"): parses flags with
//! `clap`, loads `Settings`, initializes logging, and either runs the
//! daemon in the foreground or sends one control request to an already
//! running daemon over its Unix domain socket.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::info;

use firefly_daemon::{default_socket_path, ControlRequest, ControlResponse};
use firefly_settings::Settings;

/// Firefly - client-side censorship circumvention proxy
#[derive(Parser)]
#[command(name = "firefly")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to settings.json (defaults to the platform config dir)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Control socket path for talking to a running daemon
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon in the foreground: SOCKS5/HTTP/meek listeners plus
    /// the control socket. Blocks until Ctrl+C or a `shutdown` request.
    Run,

    /// Query a running daemon's listener addresses and matcher data paths.
    Status,

    /// Ask a running daemon to reload the hosts/blacklist data and publish
    /// a fresh matcher snapshot.
    ReloadMatcher {
        /// Hosts file to load instead of the configured default
        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// Ask a running daemon to stop its listeners and exit.
    Shutdown,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        firefly_logging::init_with_default_filter("debug,firefly=trace");
    } else {
        firefly_logging::init();
    }

    let socket_path = cli.socket.clone().unwrap_or_else(default_socket_path);

    match cli.command {
        Commands::Run => run_daemon(cli.config, socket_path).await,
        Commands::Status => {
            let response = send_request(&socket_path, ControlRequest::Status).await?;
            print_response(&response);
            Ok(())
        }
        Commands::ReloadMatcher { path } => {
            let response =
                send_request(&socket_path, ControlRequest::ReloadMatcher { path }).await?;
            print_response(&response);
            Ok(())
        }
        Commands::Shutdown => {
            let response = send_request(&socket_path, ControlRequest::Shutdown).await?;
            print_response(&response);
            Ok(())
        }
    }
}

async fn run_daemon(config: Option<PathBuf>, socket_path: PathBuf) -> Result<()> {
    let settings = match config {
        Some(path) => Settings::load_from(&path).context("failed to load settings")?,
        None => Settings::load_or_default().context("failed to load settings")?,
    };

    info!(socket = ?socket_path, "starting firefly daemon");
    firefly_daemon::run(settings, socket_path)
        .await
        .context("daemon exited with an error")?;
    info!("firefly daemon stopped");
    Ok(())
}

/// Sends one control request over `socket_path` and reads back one
/// response line.
async fn send_request(socket_path: &PathBuf, request: ControlRequest) -> Result<ControlResponse> {
    let stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("failed to connect to {socket_path:?} (is the daemon running?)"))?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let request_line = serde_json::to_string(&request)?;
    write_half.write_all(request_line.as_bytes()).await?;
    write_half.write_all(b"\n").await?;
    write_half.flush().await?;

    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let response: ControlResponse = serde_json::from_str(&line)
        .with_context(|| format!("malformed response from daemon: {line}"))?;
    Ok(response)
}

fn print_response(response: &ControlResponse) {
    match response {
        ControlResponse::Status {
            socks5_addr,
            http_addr,
            meek_addr,
            meek_client_addr,
            hosts_path,
            blacklist_path,
        } => {
            println!("Firefly daemon status");
            println!("======================");
            println!(
                "SOCKS5:      {}",
                socks5_addr.as_deref().unwrap_or("(not running)")
            );
            println!("HTTP:        {}", http_addr.as_deref().unwrap_or("(disabled)"));
            println!("Meek server: {}", meek_addr.as_deref().unwrap_or("(disabled)"));
            println!(
                "Meek client: {}",
                meek_client_addr.as_deref().unwrap_or("(disabled)")
            );
            println!(
                "Hosts:     {}",
                hosts_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(none)".to_string())
            );
            println!(
                "Blacklist: {}",
                blacklist_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(none)".to_string())
            );
        }
        ControlResponse::MatcherReloaded => println!("matcher reloaded"),
        ControlResponse::ShuttingDown => println!("daemon shutting down"),
        ControlResponse::Error { message } => eprintln!("error: {message}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_subcommand_parses() {
        let cmd = Cli::command();
        let matches = cmd.try_get_matches_from(vec!["firefly", "run"]);
        assert!(matches.is_ok());
    }

    #[test]
    fn test_reload_matcher_with_path_parses() {
        let cmd = Cli::command();
        let matches =
            cmd.try_get_matches_from(vec!["firefly", "reload-matcher", "--path", "/tmp/hosts"]);
        assert!(matches.is_ok());
    }

    #[test]
    fn test_status_with_custom_socket_parses() {
        let cmd = Cli::command();
        let matches =
            cmd.try_get_matches_from(vec!["firefly", "--socket", "/tmp/x.sock", "status"]);
        assert!(matches.is_ok());
    }
}
