//! Key/value configuration persisted under the user's home directory.
//!
//! The file is a flat JSON object of strings. Loading fills in whatever
//! defaults are missing (or blanked out) and rewrites the file, so a first
//! run leaves a complete, editable document behind.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::{fmt, fs, io};

/// File name under the home directory.
pub const CONFIG_FILE: &str = ".burrow.conf";

/// Errors raised while loading or rewriting the config file.
#[derive(Debug)]
pub enum ConfigError {
    /// The current user has no resolvable home directory.
    NoHomeDir,
    /// Reading or writing the file failed.
    Io(io::Error),
    /// The file exists but is not a JSON object of strings.
    Parse(serde_json::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoHomeDir => write!(f, "cannot resolve the current user's home directory"),
            Self::Io(e) => write!(f, "config file I/O: {e}"),
            Self::Parse(e) => write!(f, "config file is not a JSON object of strings: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Loaded configuration document.
pub struct Config {
    values: BTreeMap<String, String>,
    path: PathBuf,
}

impl Config {
    /// Load from `~/.burrow.conf`, creating/completing it from `defaults`.
    pub fn load(defaults: &[(&str, &str)]) -> Result<Self, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
        Self::load_from(home.join(CONFIG_FILE), defaults)
    }

    /// Load from an explicit path (tests use a scratch file).
    pub fn load_from(path: PathBuf, defaults: &[(&str, &str)]) -> Result<Self, ConfigError> {
        let mut values: BTreeMap<String, String> = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(ConfigError::Parse)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        let mut changed = false;
        for &(key, value) in defaults {
            let missing = values.get(key).map_or(true, |v| v.is_empty());
            if missing {
                values.insert(key.to_string(), value.to_string());
                changed = true;
            }
        }

        let config = Self { values, path };
        if changed {
            config.save()?;
        }
        Ok(config)
    }

    /// Look up a key. Keys named in the defaults are always present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Where the document lives.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> Result<(), ConfigError> {
        let mut doc = serde_json::to_string_pretty(&self.values).map_err(ConfigError::Parse)?;
        doc.push('\n');
        fs::write(&self.path, doc)?;
        Ok(())
    }
}
