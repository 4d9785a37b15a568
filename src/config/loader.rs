//! Configuration loading from disk and environment.
//!
//! Layers, later wins:
//! 1. built-in defaults
//! 2. the base TOML file
//! 3. `<stem>.<environment>.toml` next to the base file, if present
//! 4. `LIFELINE__SECTION__KEY=value` environment variables

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use toml::{Table, Value};

use crate::config::schema::ServiceConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Prefix of environment overrides. `__` separates path segments.
pub const ENV_PREFIX: &str = "LIFELINE__";

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from a TOML file plus process environment.
pub fn load_config(path: &Path) -> Result<ServiceConfig, ConfigError> {
    load_layered(path, std::env::vars())
}

/// Load and validate configuration with an explicit set of environment variables.
pub fn load_layered<I>(path: &Path, vars: I) -> Result<ServiceConfig, ConfigError>
where
    I: IntoIterator<Item = (String, String)>,
{
    let overrides = collect_overrides(vars);

    let mut merged = Value::try_from(ServiceConfig::default())?;
    merge(&mut merged, Value::Table(read_table(path)?));
    apply_overrides(&mut merged, &overrides);

    let environment = merged
        .get("app")
        .and_then(|app| app.get("environment"))
        .and_then(Value::as_str)
        .map(str::to_owned);

    if let Some(overlay) = environment.and_then(|env| overlay_path(path, &env)) {
        if overlay.exists() {
            tracing::info!(path = %overlay.display(), "Loading environment overlay");
            merge(&mut merged, Value::Table(read_table(&overlay)?));
            apply_overrides(&mut merged, &overrides);
        } else {
            tracing::debug!(path = %overlay.display(), "No environment overlay");
        }
    }

    finish(merged)
}

/// Defaults plus environment overrides, for running without a config file.
pub fn load_from_env<I>(vars: I) -> Result<ServiceConfig, ConfigError>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut merged = Value::try_from(ServiceConfig::default())?;
    apply_overrides(&mut merged, &collect_overrides(vars));
    finish(merged)
}

fn collect_overrides<I>(vars: I) -> Vec<(Vec<String>, Value)>
where
    I: IntoIterator<Item = (String, String)>,
{
    vars.into_iter()
        .filter_map(|(key, raw)| parse_override(&key, &raw))
        .collect()
}

fn finish(merged: Value) -> Result<ServiceConfig, ConfigError> {
    let config: ServiceConfig = merged.try_into()?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

fn read_table(path: &Path) -> Result<Table, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(content.parse::<Table>()?)
}

fn overlay_path(base: &Path, environment: &str) -> Option<PathBuf> {
    let stem = base.file_stem()?.to_str()?;
    let name = match base.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{stem}.{environment}.{ext}"),
        None => format!("{stem}.{environment}"),
    };
    Some(base.with_file_name(name))
}

/// Recursively merge `overlay` into `base`; tables merge, everything else replaces.
fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base), Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn parse_override(key: &str, raw: &str) -> Option<(Vec<String>, Value)> {
    let path = key.strip_prefix(ENV_PREFIX)?;
    let segments: Vec<String> = path
        .split("__")
        .filter(|s| !s.is_empty())
        .map(str::to_ascii_lowercase)
        .collect();
    if segments.is_empty() {
        return None;
    }

    // Values are TOML literals when they parse as one, plain strings otherwise.
    let value = format!("v = {raw}")
        .parse::<Table>()
        .ok()
        .and_then(|mut t| t.remove("v"))
        .unwrap_or_else(|| Value::String(raw.to_string()));

    Some((segments, value))
}

fn apply_overrides(root: &mut Value, overrides: &[(Vec<String>, Value)]) {
    'next: for (segments, value) in overrides {
        let Some((last, parents)) = segments.split_last() else {
            continue;
        };
        let mut cursor = &mut *root;
        for segment in parents {
            match cursor {
                Value::Table(table) => {
                    cursor = table
                        .entry(segment.clone())
                        .or_insert_with(|| Value::Table(Table::new()));
                }
                _ => continue 'next,
            }
        }
        if let Value::Table(table) = cursor {
            table.insert(last.clone(), value.clone());
        }
    }
}
