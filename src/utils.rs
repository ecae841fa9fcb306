use anyhow::Result;
use chrono::{DateTime, Local};
use log::{LevelFilter, Record};
use std::fs::OpenOptions;
use std::io::Write;

use chatsync::{DeliveryStatus, Message, PeerProfile, PresenceStatus};

pub struct SimpleLogger {
    log_file: Option<std::fs::File>,
}

impl SimpleLogger {
    pub fn new(log_file_path: Option<&str>) -> Result<Self> {
        let log_file = if let Some(path) = log_file_path {
            Some(OpenOptions::new().create(true).append(true).open(path)?)
        } else {
            None
        };

        Ok(SimpleLogger { log_file })
    }
}

impl log::Log for SimpleLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let now: DateTime<Local> = Local::now();
            let log_message = format!(
                "[{}] {} [{}:{}] {}\n",
                now.format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            );

            if let Some(file) = &self.log_file {
                if let Ok(mut file) = file.try_clone() {
                    let _ = file.write_all(log_message.as_bytes());
                }
            } else {
                // Only print to stdout if no log file is specified
                print!("{}", log_message);
            }
        }
    }

    fn flush(&self) {
        if let Some(file) = &self.log_file {
            if let Ok(mut file) = file.try_clone() {
                let _ = file.flush();
            }
        } else {
            let _ = std::io::stdout().flush();
        }
    }
}

/// Read a line of input from stdin, trimming whitespace
pub fn read_line() -> Result<String> {
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

pub fn setup_logging(log_file: Option<&str>, level: LevelFilter) -> Result<()> {
    let logger = SimpleLogger::new(log_file)?;
    log::set_boxed_logger(Box::new(logger)).map(|()| log::set_max_level(level))?;

    log::info!("Logging initialized at level: {}", level);
    log::info!("App version: {} ({})", env!("CARGO_PKG_VERSION"), env!("CARGO_PKG_NAME"));

    Ok(())
}

/// Guess a mime type from a file extension for image uploads
pub fn image_mime(file_name: &str) -> &'static str {
    let ext = file_name.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        _ => "image/jpeg",
    }
}

pub fn format_header(peer: &PeerProfile, presence: PresenceStatus) -> String {
    format!("[{}] {} ({})", peer.initial(), peer.name, presence)
}

/// One timeline line: time, direction, body and the delivery/read marker
pub fn format_message(msg: &Message, local_user_id: &str) -> String {
    let time = msg.sent_at.with_timezone(&Local).format("%H:%M");
    let body = match &msg.attachment_url {
        Some(url) => format!("[image] {}", url),
        None => msg.body.clone(),
    };

    if msg.sender_id == local_user_id {
        let marker = match msg.delivery {
            DeliveryStatus::Sending => "…",
            DeliveryStatus::Failed => "✗ (failed, /retry to resend)",
            DeliveryStatus::Sent if msg.is_read => "✔✔",
            DeliveryStatus::Sent => "✔",
        };
        format!("{} > {} {}  [{}]", time, body, marker, msg.id)
    } else {
        format!("{} < {}", time, body)
    }
}
