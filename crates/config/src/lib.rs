//! Configuration files for the mail sync core
//!
//! Settings live as JSON documents inside a single application config
//! directory (~/.config/mailsync/ by default). Hosts that manage their own
//! storage layout can root a [`ConfigDir`] anywhere.

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

/// Directory name under the platform config directory
const APP_DIR: &str = "mailsync";

/// A directory holding JSON configuration documents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDir {
    root: PathBuf,
}

impl ConfigDir {
    /// Use an explicit directory as the config root
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The platform default location (~/.config/mailsync/ on Linux)
    pub fn default_location() -> Option<Self> {
        dirs::config_dir().map(|p| Self::new(p.join(APP_DIR)))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a document within this directory
    pub fn path(&self, filename: &str) -> PathBuf {
        self.root.join(filename)
    }

    /// Check whether a document exists
    pub fn exists(&self, filename: &str) -> bool {
        self.path(filename).is_file()
    }

    /// Create the directory if needed
    pub fn ensure(&self) -> Result<&Path> {
        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("Failed to create config directory: {}", self.root.display()))?;
        Ok(&self.root)
    }

    /// Load and parse a JSON document
    pub fn load_json<T: DeserializeOwned>(&self, filename: &str) -> Result<T> {
        load_json_file(&self.path(filename))
    }

    /// Load a JSON document, or fall back to `T::default()` when it is absent.
    ///
    /// A document that exists but fails to parse is still an error; silently
    /// replacing a broken file with defaults would hide user mistakes.
    pub fn load_or_default<T: DeserializeOwned + Default>(&self, filename: &str) -> Result<T> {
        if self.exists(filename) {
            self.load_json(filename)
        } else {
            Ok(T::default())
        }
    }

    /// Serialize a value as pretty JSON.
    ///
    /// The document is written to a sibling temp file first and then renamed
    /// over the target, so readers never observe a half-written file.
    pub fn save_json<T: Serialize>(&self, filename: &str, value: &T) -> Result<()> {
        self.ensure()?;
        let path = self.path(filename);
        let tmp = self.path(&format!(".{filename}.tmp"));
        let content = serde_json::to_string_pretty(value)?;
        std::fs::write(&tmp, content)
            .with_context(|| format!("Failed to write config file: {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace config file: {}", path.display()))?;
        Ok(())
    }

    /// Delete a document; missing documents are not an error
    pub fn remove(&self, filename: &str) -> Result<()> {
        let path = self.path(filename);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }
}

/// Load and parse a JSON file from an arbitrary path
pub fn load_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        retries: u32,
    }

    #[test]
    fn test_default_location() {
        let dir = ConfigDir::default_location();
        assert!(dir.is_some());
        assert!(dir.unwrap().root().ends_with("mailsync"));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ConfigDir::new(tmp.path().join("nested"));

        let value = Sample { name: "inbox".to_string(), retries: 3 };
        dir.save_json("sample.json", &value).unwrap();

        assert!(dir.exists("sample.json"));
        assert!(!dir.exists(".sample.json.tmp"));
        let loaded: Sample = dir.load_json("sample.json").unwrap();
        assert_eq!(loaded, value);
    }

    #[test]
    fn test_load_or_default_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ConfigDir::new(tmp.path());
        let loaded: Sample = dir.load_or_default("absent.json").unwrap();
        assert_eq!(loaded, Sample::default());
    }

    #[test]
    fn test_load_or_default_rejects_broken_file() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ConfigDir::new(tmp.path());
        std::fs::write(dir.path("broken.json"), "{ not json").unwrap();
        assert!(dir.load_or_default::<Sample>("broken.json").is_err());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ConfigDir::new(tmp.path());
        dir.save_json("gone.json", &Sample::default()).unwrap();
        dir.remove("gone.json").unwrap();
        dir.remove("gone.json").unwrap();
        assert!(!dir.exists("gone.json"));
    }
}
