use crate::errors::ApiError;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration, read once from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub addr: String,
    /// Local state (SQLite ledger, engine key) lives here.
    pub data_dir: PathBuf,
    pub database_url: String,
    pub db_max_connections: u32,
    pub api_key: String,
    /// Contract identity every ciphertext and proof is bound to.
    pub contract_address: String,
    pub call_timeout: Option<Duration>,
    /// Upper bound on concurrently held member sessions.
    pub max_sessions: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, ApiError> {
        let data_dir = PathBuf::from(env_or("DATA_DIR", "data"));

        let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!("sqlite:{}", data_dir.join("ledger.sqlite").to_string_lossy())
        });

        let db_max_connections = env_or("DB_MAX_CONNECTIONS", "5")
            .parse()
            .map_err(|_| ApiError::Config("DB_MAX_CONNECTIONS must be a positive integer".to_string()))?;

        let call_timeout = match std::env::var("CALL_TIMEOUT_SECS") {
            Ok(secs) => Some(Duration::from_secs(secs.parse().map_err(|_| {
                ApiError::Config("CALL_TIMEOUT_SECS must be an integer".to_string())
            })?)),
            Err(_) => None,
        };

        let max_sessions = env_or("MAX_SESSIONS", "1024")
            .parse::<usize>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| ApiError::Config("MAX_SESSIONS must be a positive integer".to_string()))?;

        Ok(Self {
            addr: env_or("BACKEND_ADDR", "127.0.0.1:8080"),
            data_dir,
            database_url,
            db_max_connections,
            // In production, this should be a strong secret from environment.
            api_key: env_or("API_KEY", "dev-secret-key"),
            contract_address: env_or("CLUB_CONTRACT_ADDRESS", "0x00000000000000000000000000000000000c1ab0"),
            call_timeout,
            max_sessions,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
