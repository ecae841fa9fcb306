use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::info;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Read;
use std::path::PathBuf;

/// Backend endpoints and the signed-in user's session token
#[derive(Serialize, Deserialize, Clone)]
pub struct Credentials {
    pub api_url: String,
    pub socket_url: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Credentials {
    pub fn new(api_url: &str, socket_url: &str, user_id: &str, token: &str) -> Self {
        Credentials {
            api_url: api_url.to_string(),
            socket_url: socket_url.to_string(),
            user_id: user_id.to_string(),
            token: Some(BASE64.encode(token)),
        }
    }

    pub fn get_token(&self) -> Option<String> {
        self.token.as_ref().and_then(|encoded| {
            BASE64
                .decode(encoded)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        })
    }
}

static CONFIG_DIR_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

pub fn set_config_dir_override(dir: PathBuf) {
    let _ = CONFIG_DIR_OVERRIDE.set(dir);
}

pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = match CONFIG_DIR_OVERRIDE.get() {
        Some(dir) => dir.clone(),
        None => dirs::config_dir()
            .ok_or_else(|| anyhow!("Could not determine config directory"))?
            .join("chatsync"),
    };

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

fn get_config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("credentials.json"))
}

pub fn save_credentials(credentials: &Credentials) -> Result<()> {
    let config_path = get_config_path()?;
    let file = File::create(config_path)?;
    serde_json::to_writer_pretty(file, credentials)?;

    info!("Credentials saved for {}", credentials.user_id);
    Ok(())
}

pub fn load_credentials() -> Result<Option<Credentials>> {
    let config_path = get_config_path()?;

    if !config_path.exists() {
        return Ok(None);
    }

    let config_path_str = config_path.display().to_string();

    let mut file = File::open(config_path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;

    let credentials: Credentials = serde_json::from_str(&contents)?;
    info!("Loaded credentials for {} from {}", credentials.user_id, config_path_str);

    Ok(Some(credentials))
}
