// Configuration loading and parsing (fantagts.toml).

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },
}

// ---------------------------------------------------------------------------
// Config structs
// ---------------------------------------------------------------------------

/// Assembled server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub ws_port: u16,
    pub db_path: String,
    pub game: GameConfig,
}

/// Game-level knobs for the auction itself.
#[derive(Debug, Clone, Deserialize)]
pub struct GameConfig {
    /// Credits every participant starts with (and is restored to on reset).
    #[serde(default = "default_initial_credits")]
    pub initial_credits: i64,
    /// Pause between a resolved sub-auction and the next one opening, in
    /// seconds, so clients can render the results screen.
    #[serde(default = "default_sub_auction_pause_secs")]
    pub sub_auction_pause_secs: u64,
}

fn default_initial_credits() -> i64 {
    2000
}

fn default_sub_auction_pause_secs() -> u64 {
    3
}

impl Default for GameConfig {
    fn default() -> Self {
        GameConfig {
            initial_credits: default_initial_credits(),
            sub_auction_pause_secs: default_sub_auction_pause_secs(),
        }
    }
}

/// Raw deserialization target for the fantagts.toml file.
#[derive(Debug, Clone, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    server: ServerSection,
    #[serde(default)]
    game: GameConfig,
}

#[derive(Debug, Clone, Deserialize)]
struct ServerSection {
    #[serde(default = "default_ws_port")]
    port: u16,
    #[serde(default = "default_db_path")]
    db_path: String,
}

fn default_ws_port() -> u16 {
    3000
}

fn default_db_path() -> String {
    "data/fantagts.db".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        ServerSection {
            port: default_ws_port(),
            db_path: default_db_path(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load configuration from `fantagts.toml` in the current directory.
/// A missing file is not an error: defaults apply.
pub fn load_config() -> Result<Config, ConfigError> {
    load_from_path(Path::new("fantagts.toml"))
}

/// Load configuration from an explicit path, falling back to defaults when
/// the file does not exist.
pub fn load_from_path(path: &Path) -> Result<Config, ConfigError> {
    let file = if path.exists() {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str::<ConfigFile>(&contents).map_err(|source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        })?
    } else {
        ConfigFile {
            server: ServerSection::default(),
            game: GameConfig::default(),
        }
    };

    let config = Config {
        ws_port: file.server.port,
        db_path: file.server.db_path,
        game: file.game,
    };
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.ws_port == 0 {
        return Err(ConfigError::ValidationError {
            field: "server.port".to_string(),
            message: "port must be non-zero".to_string(),
        });
    }
    if config.game.initial_credits <= 0 {
        return Err(ConfigError::ValidationError {
            field: "game.initial_credits".to_string(),
            message: "initial credits must be positive".to_string(),
        });
    }
    if config.db_path.is_empty() {
        return Err(ConfigError::ValidationError {
            field: "server.db_path".to_string(),
            message: "database path must not be empty".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(contents: &str) -> Result<Config, ConfigError> {
        let file: ConfigFile =
            toml::from_str(contents).map_err(|source| ConfigError::ParseError {
                path: PathBuf::from("test.toml"),
                source,
            })?;
        let config = Config {
            ws_port: file.server.port,
            db_path: file.server.db_path,
            game: file.game,
        };
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.ws_port, 3000);
        assert_eq!(config.db_path, "data/fantagts.db");
        assert_eq!(config.game.initial_credits, 2000);
        assert_eq!(config.game.sub_auction_pause_secs, 3);
    }

    #[test]
    fn explicit_values_override_defaults() {
        let config = parse(
            r#"
            [server]
            port = 4100
            db_path = "/tmp/test.db"

            [game]
            initial_credits = 1500
            sub_auction_pause_secs = 1
            "#,
        )
        .unwrap();
        assert_eq!(config.ws_port, 4100);
        assert_eq!(config.db_path, "/tmp/test.db");
        assert_eq!(config.game.initial_credits, 1500);
        assert_eq!(config.game.sub_auction_pause_secs, 1);
    }

    #[test]
    fn partial_sections_fill_remaining_defaults() {
        let config = parse(
            r#"
            [server]
            port = 9000
            "#,
        )
        .unwrap();
        assert_eq!(config.ws_port, 9000);
        assert_eq!(config.db_path, "data/fantagts.db");
        assert_eq!(config.game.initial_credits, 2000);
    }

    #[test]
    fn zero_port_rejected() {
        let err = parse("[server]\nport = 0\n").unwrap_err();
        assert!(
            matches!(err, ConfigError::ValidationError { ref field, .. } if field == "server.port")
        );
    }

    #[test]
    fn non_positive_credits_rejected() {
        let err = parse("[game]\ninitial_credits = 0\n").unwrap_err();
        assert!(
            matches!(err, ConfigError::ValidationError { ref field, .. } if field == "game.initial_credits")
        );
    }

    #[test]
    fn missing_file_loads_defaults() {
        let config = load_from_path(Path::new("/nonexistent/fantagts.toml")).unwrap();
        assert_eq!(config.ws_port, 3000);
        assert_eq!(config.game.initial_credits, 2000);
    }
}
