// Configuration loading for the gnodemesh CLI
//
// The routing configuration is a JSON document stored in:
// - macOS: ~/Library/Application Support/gnodemesh/config.json
// - Linux: ~/.config/gnodemesh/config.json
// - Windows: %APPDATA%\gnodemesh\config.json
//
// A path given with --config takes precedence. Options missing from the file
// take their defaults; the result is always validated.

use anyhow::{Context, Result};
use gnodemesh_core::RoutingConfig;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Where the effective configuration came from
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    File(PathBuf),
    Defaults,
}

/// Get the config directory path (cross-platform)
pub fn config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .context("Failed to determine config directory")?
        .join("gnodemesh");
    Ok(config_dir)
}

/// Get the default config file path
pub fn config_file() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.json"))
}

/// Load the effective configuration
///
/// An explicit path must exist. Without one, the default file is used when
/// present and the built-in defaults otherwise.
pub fn load(explicit: Option<&Path>) -> Result<(RoutingConfig, Source)> {
    if let Some(path) = explicit {
        let config = load_file(path)?;
        return Ok((config, Source::File(path.to_path_buf())));
    }

    let default_file = config_file()?;
    if default_file.exists() {
        let config = load_file(&default_file)?;
        Ok((config, Source::File(default_file)))
    } else {
        debug!("No config file at {}, using defaults", default_file.display());
        Ok((RoutingConfig::default(), Source::Defaults))
    }
}

/// Read and validate one JSON file
pub fn load_file(path: &Path) -> Result<RoutingConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config = RoutingConfig::from_json(&contents)
        .with_context(|| format!("Invalid config file {}", path.display()))?;
    debug!("Loaded config from {}", path.display());
    Ok(config)
}

/// Save config to file, creating its directory
pub fn save(config: &RoutingConfig, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).context("Failed to create config directory")?;
    }
    let contents = config.to_json().context("Failed to serialize config")?;
    std::fs::write(path, contents).context("Failed to write config file")?;
    Ok(())
}

/// Get one option; nested options use dotted keys such as `weights.rtt`
pub fn get(config: &RoutingConfig, key: &str) -> Result<Value> {
    let tree = serde_json::to_value(config).context("Failed to serialize config")?;
    lookup(&tree, key)
        .cloned()
        .with_context(|| format!("Unknown config key: {}", key))
}

/// Return a copy of `config` with one option replaced
///
/// The value is parsed as JSON when possible (numbers, booleans) and taken as a
/// string otherwise. The result is validated as a whole.
pub fn set(config: &RoutingConfig, key: &str, value: &str) -> Result<RoutingConfig> {
    let mut tree = serde_json::to_value(config).context("Failed to serialize config")?;
    let slot = lookup_mut(&mut tree, key).with_context(|| format!("Unknown config key: {}", key))?;
    *slot = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));

    let text = serde_json::to_string(&tree).context("Failed to serialize config")?;
    RoutingConfig::from_json(&text).with_context(|| format!("Invalid value for {}", key))
}

/// Every leaf option as `(dotted key, value)`
pub fn list(config: &RoutingConfig) -> Result<Vec<(String, Value)>> {
    let tree = serde_json::to_value(config).context("Failed to serialize config")?;
    let mut out = Vec::new();
    flatten("", &tree, &mut out);
    Ok(out)
}

fn lookup<'a>(tree: &'a Value, key: &str) -> Option<&'a Value> {
    key.split('.').try_fold(tree, |node, part| node.get(part))
}

fn lookup_mut<'a>(tree: &'a mut Value, key: &str) -> Option<&'a mut Value> {
    key.split('.').try_fold(tree, |node, part| node.get_mut(part))
}

fn flatten(prefix: &str, node: &Value, out: &mut Vec<(String, Value)>) {
    match node {
        Value::Object(fields) => {
            for (name, child) in fields {
                let key = if prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{}.{}", prefix, name)
                };
                flatten(&key, child, out);
            }
        }
        leaf => out.push((prefix.to_string(), leaf.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_top_level_and_nested() {
        let config = RoutingConfig::default();
        assert_eq!(get(&config, "levels").unwrap(), Value::from(4));
        assert_eq!(get(&config, "weights.rtt").unwrap(), Value::from(0.5));
        assert!(get(&config, "weights.jitter").is_err());
    }

    #[test]
    fn test_set_validates_result() {
        let config = RoutingConfig::default();
        let updated = set(&config, "group_size", "16").unwrap();
        assert_eq!(updated.group_size, 16);
        assert!(set(&config, "group_size", "1").is_err());
        assert!(set(&config, "levels", "many").is_err());
        assert!(set(&config, "colour", "blue").is_err());
    }

    #[test]
    fn test_list_covers_nested_weights() {
        let keys: Vec<String> = list(&RoutingConfig::default())
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert!(keys.contains(&"probe_interval_ms".to_string()));
        assert!(keys.contains(&"weights.down".to_string()));
        assert!(!keys.contains(&"weights".to_string()));
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = RoutingConfig {
            levels: 2,
            group_size: 32,
            ..Default::default()
        };
        save(&config, &path).unwrap();
        let (loaded, source) = load(Some(&path)).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(source, Source::File(path));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        assert!(load(Some(&path)).is_err());
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"levels": 0}"#).unwrap();
        assert!(load_file(&path).is_err());
    }
}
