// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Service configuration.
//!
//! Every field has a default, so an empty file (or no file) is valid:
//!
//! ```toml
//! [database]
//! path = "library.db"      # omitted: in-memory database
//! lock_timeout_ms = 5000  # 1..=2147483647
//!
//! [auth]
//! bcrypt_cost = 12         # 4..=31
//!
//! [reading]
//! page_size = 1500
//!
//! [log]
//! filter = "info"
//! ```

use crate::credential::{MAX_BCRYPT_COST, MIN_BCRYPT_COST};
use crate::store::{DEFAULT_LOCK_TIMEOUT, MAX_LOCK_TIMEOUT};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Characters per page when reading.
pub const DEFAULT_PAGE_SIZE: usize = 1500;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config syntax: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    pub path: Option<PathBuf>,
    pub lock_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    pub bcrypt_cost: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            bcrypt_cost: bcrypt::DEFAULT_COST,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReadingConfig {
    pub page_size: usize,
}

impl Default for ReadingConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directives. `RUST_LOG` takes precedence.
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub reading: ReadingConfig,
    pub log: LogConfig,
}

impl Config {
    /// Reads, parses and validates a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parses and validates TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.lock_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "database.lock_timeout_ms must be positive".to_owned(),
            ));
        }
        if self.lock_timeout() > MAX_LOCK_TIMEOUT {
            return Err(ConfigError::Invalid(format!(
                "database.lock_timeout_ms must be at most {}, got {}",
                MAX_LOCK_TIMEOUT.as_millis(),
                self.database.lock_timeout_ms
            )));
        }
        if !(MIN_BCRYPT_COST..=MAX_BCRYPT_COST).contains(&self.auth.bcrypt_cost) {
            return Err(ConfigError::Invalid(format!(
                "auth.bcrypt_cost must be between {MIN_BCRYPT_COST} and {MAX_BCRYPT_COST}, got {}",
                self.auth.bcrypt_cost
            )));
        }
        if self.reading.page_size == 0 {
            return Err(ConfigError::Invalid(
                "reading.page_size must be positive".to_owned(),
            ));
        }
        if let Err(err) = tracing_subscriber::EnvFilter::try_new(&self.log.filter) {
            return Err(ConfigError::Invalid(format!("log.filter: {err}")));
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.database.lock_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.database.path, None);
        assert_eq!(config.lock_timeout(), DEFAULT_LOCK_TIMEOUT);
        assert_eq!(config.reading.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(config.log.filter, "info");
    }

    #[test]
    fn sections_override_defaults() {
        let config = Config::from_toml_str(
            r#"
            [database]
            path = "data/library.db"
            lock_timeout_ms = 250

            [auth]
            bcrypt_cost = 4

            [reading]
            page_size = 80
            "#,
        )
        .unwrap();

        assert_eq!(config.database.path, Some(PathBuf::from("data/library.db")));
        assert_eq!(config.lock_timeout(), Duration::from_millis(250));
        assert_eq!(config.auth.bcrypt_cost, 4);
        assert_eq!(config.reading.page_size, 80);
        assert_eq!(config.log, LogConfig::default());
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        for text in [
            "[auth]\nbcrypt_cost = 3",
            "[auth]\nbcrypt_cost = 32",
            "[reading]\npage_size = 0",
            "[database]\nlock_timeout_ms = 0",
            "[database]\nlock_timeout_ms = 2147483648",
            "[database]\nlock_timeout_ms = 3000000000",
        ] {
            let result = Config::from_toml_str(text);
            assert!(matches!(result, Err(ConfigError::Invalid(_))), "{text}");
        }
    }

    #[test]
    fn longest_lock_timeout_is_accepted() {
        let config = Config::from_toml_str("[database]\nlock_timeout_ms = 2147483647").unwrap();
        assert_eq!(config.lock_timeout(), MAX_LOCK_TIMEOUT);
    }

    #[test]
    fn unknown_keys_are_syntax_errors() {
        let result = Config::from_toml_str("[database]\nurl = \"x\"");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let result = Config::load(Path::new("/nonexistent/circulation.toml"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
