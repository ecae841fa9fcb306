#![deny(dead_code)]
use anyhow::{anyhow, Result};
use clap::Parser;
use log::{error, info, warn, LevelFilter};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

mod credentials;
mod utils;

use crate::credentials::{load_credentials, save_credentials, set_config_dir_override, Credentials};
use chatsync::transport::{EventChannel, HttpChatApi, SocketChannel};
use chatsync::{ChatSession, SessionConfig, SessionUpdate};

/// Command line arguments for chatsync
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "chatsync: a command-line client for one real-time chat conversation.",
    long_about = "chatsync opens a conversation with one peer, shows the message history, \
    live messages, read receipts and the peer's online status.\n\n\
    Connection settings are read from CHATSYNC_API_URL, CHATSYNC_SOCKET_URL, \
    CHATSYNC_USER_ID and CHATSYNC_TOKEN, then from the cached credentials, then prompted for."
)]
struct Args {
    /// Id of the user to chat with
    #[arg(long)]
    peer: String,

    /// Directory for the credential cache and the log file
    #[arg(long, value_name = "PATH")]
    config_dir: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Distance from the bottom of the conversation that still counts as seen
    #[arg(long, default_value_t = 50.0)]
    near_bottom_threshold: f64,
}

const HELP: &str = "Type a message and press Enter. Commands: /image <path>, /retry <id>, /read, /away, /back, /quit";

/// Prompts for connection settings not provided through the environment
fn prompt_credentials() -> Result<Credentials> {
    let api_url = env::var("CHATSYNC_API_URL").or_else(|_| {
        eprintln!("Enter API base URL (e.g., https://api.example.com):");
        utils::read_line()
    })?;

    let socket_url = env::var("CHATSYNC_SOCKET_URL").or_else(|_| {
        eprintln!("Enter socket URL (e.g., https://api.example.com):");
        utils::read_line()
    })?;

    let user_id = env::var("CHATSYNC_USER_ID").or_else(|_| {
        eprintln!("Enter your user id:");
        utils::read_line()
    })?;

    let token = env::var("CHATSYNC_TOKEN").or_else(|_| {
        eprintln!("Enter session token:");
        utils::read_line()
    })?;

    Ok(Credentials::new(&api_url, &socket_url, &user_id, &token))
}

/// Environment first, then the cache, then the prompt. The flag tells
/// whether the settings came from the environment.
fn resolve_credentials() -> Result<(Credentials, bool)> {
    if let (Ok(api_url), Ok(socket_url), Ok(user_id), Ok(token)) = (
        env::var("CHATSYNC_API_URL"),
        env::var("CHATSYNC_SOCKET_URL"),
        env::var("CHATSYNC_USER_ID"),
        env::var("CHATSYNC_TOKEN"),
    ) {
        return Ok((Credentials::new(&api_url, &socket_url, &user_id, &token), true));
    }

    if let Some(creds) = load_credentials()? {
        info!("Using cached credentials for {}", creds.user_id);
        if creds.get_token().is_some() {
            return Ok((creds, false));
        }
        eprintln!("Enter session token for {}:", creds.user_id);
        let token = utils::read_line()?;
        return Ok((
            Credentials::new(&creds.api_url, &creds.socket_url, &creds.user_id, &token),
            false,
        ));
    }

    Ok((prompt_credentials()?, false))
}

fn print_timeline(session: &ChatSession) {
    println!("{}", utils::format_header(session.peer(), session.presence()));
    for msg in session.store().iter() {
        println!("  {}", utils::format_message(msg, session.local_user_id()));
    }
}

/// Returns false when the user asked to leave
async fn handle_input(session: &mut ChatSession, input: &str) -> Result<bool> {
    if input.is_empty() {
        return Ok(true);
    }

    match input {
        "/quit" => return Ok(false),
        "/read" => {
            let acked = session.acknowledge_visible();
            println!("Marked {} messages as read", acked.len());
        }
        "/away" => session.set_active(false),
        "/back" => {
            session.set_active(true);
            session.acknowledge_visible();
            print_timeline(session);
        }
        _ if input.starts_with("/retry ") => {
            let temp_id = input["/retry ".len()..].trim();
            if let Err(e) = session.retry_send(temp_id).await {
                println!("Retry failed: {}", e);
            }
            print_timeline(session);
        }
        _ if input.starts_with("/image ") => {
            let path = Path::new(input["/image ".len()..].trim());
            let file_name = path
                .file_name()
                .and_then(|name| name.to_str())
                .ok_or_else(|| anyhow!("Not a file path: {}", path.display()))?
                .to_string();
            let bytes = match tokio::fs::read(path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    println!("Cannot read {}: {}", path.display(), e);
                    return Ok(true);
                }
            };
            let temp_id = session.stage_image(&file_name, bytes, utils::image_mime(&file_name));
            print_timeline(session);
            if let Err(e) = session.deliver(&temp_id).await {
                println!("Image not sent: {}", e);
            }
            print_timeline(session);
        }
        text => {
            let temp_id = session.stage_text(text)?;
            print_timeline(session);
            if let Err(e) = session.deliver(&temp_id).await {
                println!("Message not sent: {}", e);
            }
            print_timeline(session);
        }
    }

    Ok(true)
}

async fn run_session(session: &mut ChatSession) -> Result<()> {
    print_timeline(session);
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line? {
                    Some(line) => line,
                    None => break,
                };
                if !handle_input(session, line.trim()).await? {
                    break;
                }
            }
            update = session.next_update() => {
                match update {
                    Ok(SessionUpdate::Timeline) => print_timeline(session),
                    Ok(SessionUpdate::Presence(status)) => {
                        println!("{}", utils::format_header(session.peer(), status));
                    }
                    Ok(SessionUpdate::Ignored) => {}
                    Err(e) => {
                        error!("Event stream ended: {}", e);
                        println!("Connection lost.");
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_file_path = match &args.config_dir {
        Some(dir) => {
            if let Err(e) = std::fs::create_dir_all(dir) {
                eprintln!("Warning: Failed to create {}: {}. Logging to the working directory.", dir.display(), e);
                PathBuf::from("chatsync.log")
            } else {
                dir.join("chatsync.log")
            }
        }
        None => PathBuf::from("chatsync.log"),
    };
    let level = LevelFilter::from_str(&args.log_level).unwrap_or(LevelFilter::Info);
    utils::setup_logging(log_file_path.to_str(), level)?;
    info!("Logging to file: {}", log_file_path.display());

    if let Some(dir) = &args.config_dir {
        set_config_dir_override(dir.clone());
    }

    let (credentials, credentials_from_env) = resolve_credentials()?;
    let token = credentials
        .get_token()
        .ok_or_else(|| anyhow!("No session token available"))?;

    println!("Connecting to {}... please wait...", credentials.socket_url);
    let api = Arc::new(HttpChatApi::new(credentials.api_url.as_str(), token));
    let channel = Arc::new(SocketChannel::connect(&credentials.socket_url).await?);

    let config = SessionConfig {
        near_bottom_threshold: args.near_bottom_threshold,
        ..SessionConfig::default()
    };
    let mut session = match ChatSession::open(api, channel.clone(), &credentials.user_id, &args.peer, config).await {
        Ok(session) => session,
        Err(e) => {
            error!("Failed to open chat with {}: {}", args.peer, e);
            eprintln!("{}", e);
            if let Err(e) = channel.disconnect().await {
                warn!("Failed to disconnect event channel: {}", e);
            }
            return Err(e.into());
        }
    };

    if !credentials_from_env {
        if let Err(e) = save_credentials(&credentials) {
            eprintln!("Warning: Failed to save credentials: {}", e);
        }
    }

    let result = run_session(&mut session).await;

    session.close();
    if let Err(e) = channel.disconnect().await {
        warn!("Failed to disconnect event channel: {}", e);
    }
    info!("chatsync shut down");
    result
}
