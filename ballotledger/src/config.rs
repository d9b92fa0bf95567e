use crate::*;
use std::path::PathBuf;

pub const ENV_KEK_HEX: &str = "BALLOTLEDGER_KEK_HEX";
pub const ENV_DATA_KEY_ID: &str = "BALLOTLEDGER_DATA_KEY_ID";
pub const ENV_WRAPPED_KEY_PATH: &str = "BALLOTLEDGER_WRAPPED_KEY_PATH";
pub const ENV_SIGNING_KEY_PATH: &str = "BALLOTLEDGER_SIGNING_KEY_PATH";
pub const ENV_EXPORT_DIR: &str = "BALLOTLEDGER_EXPORT_DIR";
pub const ENV_BACKUP_DIR: &str = "BALLOTLEDGER_BACKUP_DIR";
pub const ENV_TOKEN_TTL_SECS: &str = "BALLOTLEDGER_TOKEN_TTL_SECS";

pub const DEFAULT_DATA_KEY_ID: &str = "default-key";
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 900;

/// Process configuration
///
/// Everything is validated in `from_env`, so a process that starts has usable key
/// material. There is no fallback for a missing KEK.
#[derive(Debug, Clone)]
pub struct Config {
    pub kek: Kek,
    pub data_key_id: String,
    pub wrapped_key_path: PathBuf,
    pub signing_key_path: PathBuf,
    pub export_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub token_ttl: chrono::Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Config::from_vars(|name| std::env::var(name).ok())
    }

    /// Build a config from an arbitrary variable lookup
    pub fn from_vars<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let kek = match var(ENV_KEK_HEX) {
            Some(val) if !val.trim().is_empty() => Kek::from_hex(&val).map_err(|e| {
                Error::Configuration(format!("{}: {}", ENV_KEK_HEX, config_detail(e)))
            })?,
            _ => {
                return Err(Error::Configuration(format!(
                    "{} environment variable must be set",
                    ENV_KEK_HEX
                )))
            }
        };

        let data_key_id = var(ENV_DATA_KEY_ID)
            .map(|v| v.trim().to_owned())
            .unwrap_or_else(|| DEFAULT_DATA_KEY_ID.to_owned());
        if data_key_id.is_empty() {
            return Err(Error::Configuration(format!(
                "{} must not be empty",
                ENV_DATA_KEY_ID
            )));
        }

        let path = |name: &str, default: &str| -> PathBuf {
            match var(name) {
                Some(val) if !val.trim().is_empty() => PathBuf::from(val.trim()),
                _ => PathBuf::from(default),
            }
        };

        let token_ttl = match var(ENV_TOKEN_TTL_SECS) {
            Some(val) => {
                let secs: i64 = val.trim().parse().map_err(|_| {
                    Error::Configuration(format!("{} must be an integer", ENV_TOKEN_TTL_SECS))
                })?;
                if secs <= 0 {
                    return Err(Error::Configuration(format!(
                        "{} must be positive",
                        ENV_TOKEN_TTL_SECS
                    )));
                }
                secs
            }
            None => DEFAULT_TOKEN_TTL_SECS,
        };

        Ok(Config {
            kek,
            data_key_id,
            wrapped_key_path: path(ENV_WRAPPED_KEY_PATH, "./ballotledger.dek"),
            signing_key_path: path(ENV_SIGNING_KEY_PATH, "./ballotledger-signing.key"),
            export_dir: path(ENV_EXPORT_DIR, "./exports"),
            backup_dir: path(ENV_BACKUP_DIR, "./backup"),
            token_ttl: chrono::Duration::seconds(token_ttl),
        })
    }
}

fn config_detail(e: Error) -> String {
    match e {
        Error::Configuration(detail) => detail,
        other => other.to_string(),
    }
}
