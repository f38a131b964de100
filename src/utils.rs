//! Utility functions shared across the ranci crate.
//!
//! This module provides file loading helpers for the TOML/YAML configuration
//! files, output normalization for command results, shell quoting and
//! all-or-nothing file copies.

use anyhow::{Context, Result};
use log::error;
use serde::de::DeserializeOwned;
use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};

/// Normalizes captured command output.
///
/// `\r\n` and lone `\r` line endings become `\n`, and trailing whitespace
/// (including the final newline most commands print) is removed.
pub fn normalize_output(raw: &str) -> String {
    raw.replace("\r\n", "\n")
        .replace('\r', "\n")
        .trim_end()
        .to_string()
}

/// Quotes a string for use as a single word in a POSIX shell command.
///
/// Strings made only of characters the shell never interprets are returned
/// unchanged, everything else is wrapped in single quotes.
pub fn shell_quote(value: &str) -> String {
    let is_plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:@%+,=".contains(c));
    if is_plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// Expands a leading `~` or `~/` to the current user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Returns the temporary path a file is staged under before being renamed
/// into place.
pub fn partial_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    target.with_file_name(name)
}

/// Writes `target` through a `.part` sibling that is renamed into place only
/// once `write` returns successfully.
///
/// Missing parent directories are created. On failure the partial file is
/// removed and `target` is left untouched.
pub fn write_atomically<F>(target: &Path, write: F) -> Result<u64>
where
    F: FnOnce(&mut File) -> Result<u64>,
{
    if let Some(parent) = target.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("cannot create directory {}", parent.display()))?;
        }
    }
    let partial = partial_path(target);
    let written = File::create(&partial)
        .with_context(|| format!("cannot create {}", partial.display()))
        .and_then(|mut file| {
            let written = write(&mut file)?;
            file.flush()?;
            file.sync_all()?;
            Ok(written)
        });
    match written {
        Ok(written) => {
            fs::rename(&partial, target).with_context(|| {
                format!("cannot move {} to {}", partial.display(), target.display())
            })?;
            Ok(written)
        }
        Err(e) => {
            let _ = fs::remove_file(&partial);
            Err(e)
        }
    }
}

/// Copies a local file to `target`, all or nothing.
pub fn copy_file_atomically(source: &Path, target: &Path) -> Result<()> {
    let mut input =
        File::open(source).with_context(|| format!("cannot open {}", source.display()))?;
    write_atomically(target, |output| {
        std::io::copy(&mut input, output)
            .with_context(|| format!("cannot copy {}", source.display()))
    })?;
    Ok(())
}

/// Reads a TOML file into an arbitrary struct.
///
/// # Parameters
///
/// - `path`: The path of the TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsing fails.
pub fn read_toml_from_file<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    match toml::de::from_str(&content) {
        Ok(config) => Ok(config),
        Err(e) => {
            error!("Failed to parse TOML file {}: {e}", path.display());
            Err(e).with_context(|| format!("Failed to parse {}", path.display()))
        }
    }
}

/// Reads a YAML file into an arbitrary struct.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsing fails.
pub fn read_yaml_from_file<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    match serde_yaml::from_str(&content) {
        Ok(value) => Ok(value),
        Err(e) => {
            error!("Failed to parse YAML file {}: {e}", path.display());
            Err(e).with_context(|| format!("Failed to parse {}", path.display()))
        }
    }
}
