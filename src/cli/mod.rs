//! Thin CLI entrypoint.
//!
//! `run` starts the daemon in the foreground; `ping`, `status`, and `stop`
//! are socket-client conveniences. The full operator CLI lives outside the
//! daemon; everything here speaks the same RPC surface it would.

use crate::config::{self, DataPaths};
use crate::daemon::Daemon;
use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

/// Client-side request timeout; the server enforces none.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

const EXIT_GENERIC: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_UNAUTHORIZED: i32 = 3;
const EXIT_UNREACHABLE: i32 = 4;

#[derive(Parser)]
#[command(name = "hiboss")]
#[command(about = "Envelope-routing daemon for AI agents")]
#[command(version = crate::VERSION)]
struct Cli {
    /// Override the data directory (default $HIBOSS_DIR or ~/hiboss)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground
    Run,
    /// Check that the daemon answers
    Ping,
    /// Show daemon status
    Status,
    /// Ask the daemon to shut down
    Stop,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let paths = match &cli.dir {
        Some(dir) => DataPaths::from_root(dir.clone()),
        None => match DataPaths::resolve() {
            Ok(paths) => paths,
            Err(e) => {
                eprintln!("error: {}", e);
                std::process::exit(EXIT_GENERIC);
            }
        },
    };

    match cli.command {
        Commands::Run => {
            let daemon = match Daemon::build(
                paths,
                std::sync::Arc::new(crate::providers::cli::CliProviderFactory),
            ) {
                Ok(daemon) => daemon,
                Err(e) => {
                    eprintln!("error: {}", e);
                    std::process::exit(EXIT_GENERIC);
                }
            };
            daemon.run().await?;
            Ok(())
        }
        Commands::Ping => client_call(&paths, "daemon.ping").await,
        Commands::Status => client_call(&paths, "daemon.status").await,
        Commands::Stop => client_call(&paths, "daemon.stop").await,
    }
}

async fn client_call(paths: &DataPaths, method: &str) -> Result<()> {
    let Some(token) = config::token_from_env() else {
        eprintln!("error: set {} to call the daemon", config::ENV_TOKEN);
        std::process::exit(EXIT_USAGE);
    };

    let request = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": method,
        "params": {"token": token},
    });

    let response = match tokio::time::timeout(CLIENT_TIMEOUT, send_request(paths, &request)).await
    {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            eprintln!("error: daemon unreachable: {}", e);
            std::process::exit(EXIT_UNREACHABLE);
        }
        Err(_) => {
            eprintln!("error: request timed out");
            std::process::exit(EXIT_UNREACHABLE);
        }
    };

    if let Some(error) = response.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
        eprintln!(
            "error: {}",
            error.get("message").and_then(Value::as_str).unwrap_or("?")
        );
        let exit = if code == crate::rpc::UNAUTHORIZED {
            EXIT_UNAUTHORIZED
        } else {
            EXIT_GENERIC
        };
        std::process::exit(exit);
    }

    println!(
        "{}",
        serde_json::to_string_pretty(response.get("result").unwrap_or(&Value::Null))?
    );
    Ok(())
}

async fn send_request(paths: &DataPaths, request: &Value) -> Result<Value> {
    let mut stream = UnixStream::connect(&paths.socket_path).await?;
    let mut frame = request.to_string();
    frame.push('\n');
    stream.write_all(frame.as_bytes()).await?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    Ok(serde_json::from_str(&line)?)
}
