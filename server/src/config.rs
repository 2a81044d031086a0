use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub server: ServerSettings,
    pub game: GameSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Port for both the game transport and the HTTP control surface
    /// (transport on `port`, HTTP on `port + 1`).
    pub port: u16,
    pub data_dir: String,
    /// "local" or "production"; production tightens logging to warn
    /// unless overridden.
    pub deployment_mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameSettings {
    pub min_players_to_start: u32,
    pub countdown_seconds: u32,
    /// Auto-respawn cars that stop making progress. Off by default.
    pub stuck_respawn_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                port: 3000,
                data_dir: "./data".to_string(),
                deployment_mode: "local".to_string(),
            },
            game: GameSettings {
                min_players_to_start: 1,
                countdown_seconds: 3,
                stuck_respawn_enabled: false,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl ServerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let mut config = Self::load(path).unwrap_or_else(|e| {
            eprintln!("Failed to load config: {}, using defaults", e);
            Self::default()
        });
        config.apply_env_overrides();
        config
    }

    /// `PORT` and `DATA_DIR` from the environment win over the file, per
    /// the deployment contract.
    fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(data_dir) = std::env::var("DATA_DIR") {
            self.server.data_dir = data_dir;
        }
    }
}
