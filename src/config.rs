use crate::error::GatewayError;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub api: ApiConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Optional bearer for the local consumer surface (ws/status); the vendor
    /// callback endpoints authenticate via signature instead.
    pub api_token: Option<String>,
}

/// Credentials for the WeCom customer-service account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Shared token used to compute callback signatures.
    pub token: Option<String>,
    /// 43-char base64 key used to decrypt callback payloads.
    pub encoding_aes_key: Option<String>,
    pub corp_id: Option<String>,
    pub corp_secret: Option<String>,
    pub kf_open_id: Option<String>,
    pub kf_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    pub timeout_seconds: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://qyapi.weixin.qq.com/cgi-bin".to_string(),
            timeout_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub sqlite_path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            sqlite_path: "~/.wxkf-gateway/state.sqlite".to_string(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token: None,
            encoding_aes_key: None,
            corp_id: None,
            corp_secret: None,
            kf_open_id: None,
            kf_name: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
                api_token: None,
            },
            auth: AuthConfig::default(),
            api: ApiConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl AuthConfig {
    /// Missing credentials are fatal before the sync loop ever starts.
    pub fn validate(&self) -> Result<(), GatewayError> {
        for (key, value) in [
            ("token", &self.token),
            ("encoding_aes_key", &self.encoding_aes_key),
            ("corp_id", &self.corp_id),
            ("corp_secret", &self.corp_secret),
        ] {
            if value.as_deref().map(str::trim).unwrap_or_default().is_empty() {
                return Err(GatewayError::Auth(format!("cannot auth, {key} is missing")));
            }
        }
        let has_kf_id = !self.kf_open_id.as_deref().unwrap_or_default().trim().is_empty();
        let has_kf_name = !self.kf_name.as_deref().unwrap_or_default().trim().is_empty();
        if !has_kf_id && !has_kf_name {
            return Err(GatewayError::Auth(
                "cannot auth, one of kf_open_id or kf_name is required".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn resolve_config_path() -> PathBuf {
    env::var("WXKF_GATEWAY_CONFIG")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| expand_tilde("~/.wxkf-gateway/config.json"))
}

pub fn load_config() -> Config {
    let config_path = resolve_config_path();

    let mut cfg = Config::default();

    if config_path.exists() {
        if let Ok(raw) = fs::read_to_string(&config_path) {
            if let Ok(file_cfg) = serde_json::from_str::<Config>(&raw) {
                cfg = file_cfg;
            }
        }
    }

    // Override from environment; the credential names match the vendor docs.
    if let Ok(token) = env::var("WECOM_APP_TOKEN") {
        if !token.trim().is_empty() {
            cfg.auth.token = Some(token);
        }
    }

    if let Ok(key) = env::var("WECOM_APP_AES_KEY") {
        if !key.trim().is_empty() {
            cfg.auth.encoding_aes_key = Some(key);
        }
    }

    if let Ok(corp_id) = env::var("WECOM_CORP_ID") {
        if !corp_id.trim().is_empty() {
            cfg.auth.corp_id = Some(corp_id);
        }
    }

    if let Ok(secret) = env::var("WECOM_CORP_SECRET") {
        if !secret.trim().is_empty() {
            cfg.auth.corp_secret = Some(secret);
        }
    }

    if let Ok(kf_open_id) = env::var("WECOM_KF_OPEN_ID") {
        if !kf_open_id.trim().is_empty() {
            cfg.auth.kf_open_id = Some(kf_open_id);
        }
    }

    if let Ok(kf_name) = env::var("WECOM_KF_NAME") {
        if !kf_name.trim().is_empty() {
            cfg.auth.kf_name = Some(kf_name);
        }
    }

    if let Ok(port) = env::var("WXKF_CALLBACK_PORT") {
        if let Ok(port) = port.trim().parse::<u16>() {
            cfg.server.port = port;
        }
    }

    if let Ok(url) = env::var("WXKF_GATEWAY_DATABASE_URL") {
        if !url.trim().is_empty() {
            cfg.database.url = Some(url);
        }
    }

    if let Ok(path) = env::var("WXKF_GATEWAY_SQLITE_PATH") {
        if !path.trim().is_empty() {
            cfg.database.sqlite_path = path;
        }
    }

    if let Ok(token) = env::var("WXKF_GATEWAY_API_TOKEN") {
        if !token.trim().is_empty() {
            cfg.server.api_token = Some(token);
        }
    }

    cfg
}

pub fn resolve_database_url(cfg: &Config) -> String {
    if let Some(url) = cfg.database.url.as_ref() {
        return url.to_string();
    }

    let path = expand_tilde(&cfg.database.sqlite_path);
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    format!("sqlite://{}", path.to_string_lossy())
}
