use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::DEFAULT_CONCURRENCY;
use crate::manifest::{Manifest, DEFAULT_EXTENSIONS};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin the application is served from; manifest paths resolve against it
  pub origin: Url,
  /// Name of the generation to install, bumped whenever the manifest changes
  pub generation: String,
  #[serde(default)]
  pub manifest: ManifestConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub network: NetworkConfig,
  /// Also write logs to this file
  pub log_file: Option<PathBuf>,
}

/// Where the asset list comes from. Exactly one source must be set.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestConfig {
  /// Hand-authored list of asset paths
  #[serde(default)]
  pub assets: Vec<String>,
  /// YAML/JSON file holding the list
  pub file: Option<PathBuf>,
  /// Build output directory to generate the list from
  pub build_dir: Option<PathBuf>,
  /// File extensions picked up from `build_dir`
  #[serde(default = "default_extensions")]
  pub extensions: Vec<String>,
}

impl Default for ManifestConfig {
  fn default() -> Self {
    Self {
      assets: Vec::new(),
      file: None,
      build_dir: None,
      extensions: default_extensions(),
    }
  }
}

fn default_extensions() -> Vec<String> {
  DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
  /// SQLite database path (default: $XDG_DATA_HOME/precache/cache.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
  /// Manifest entries fetched at once during install
  #[serde(default = "default_install_concurrency")]
  pub install_concurrency: usize,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      timeout_secs: default_timeout_secs(),
      install_concurrency: default_install_concurrency(),
    }
  }
}

fn default_timeout_secs() -> u64 {
  30
}

fn default_install_concurrency() -> usize {
  DEFAULT_CONCURRENCY
}

impl NetworkConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./precache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/precache/config.yaml
  ///
  /// `PRECACHE_ORIGIN` and `PRECACHE_GENERATION` override the file.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => {
        return Err(eyre!(
          "No configuration file found. Create ./precache.yaml or ~/.config/precache/config.yaml"
        ))
      }
    };

    config.with_env_overrides(|name| std::env::var(name).ok())
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("precache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("precache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let mut config = Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    // Relative manifest paths are relative to the config file
    if let Some(base) = path.parent() {
      config.manifest.resolve_paths(base);
    }

    Ok(config)
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  fn with_env_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
    if let Some(origin) = var("PRECACHE_ORIGIN") {
      self.origin =
        Url::parse(&origin).map_err(|e| eyre!("Invalid PRECACHE_ORIGIN '{}': {}", origin, e))?;
    }
    if let Some(generation) = var("PRECACHE_GENERATION") {
      self.generation = generation;
    }
    Ok(self)
  }
}

impl ManifestConfig {
  fn resolve_paths(&mut self, base: &Path) {
    for path in [&mut self.file, &mut self.build_dir].into_iter().flatten() {
      if path.is_relative() {
        *path = base.join(&*path);
      }
    }
  }

  /// Build the manifest from whichever source is configured.
  pub fn build(&self) -> Result<Manifest> {
    let manifest = match (self.assets.is_empty(), &self.file, &self.build_dir) {
      (false, None, None) => Manifest::from_urls(self.assets.iter().cloned()),
      (true, Some(file), None) => Manifest::load(file)?,
      (true, None, Some(dir)) => Manifest::from_build_dir(dir, &self.extensions)?,
      (true, None, None) => {
        return Err(eyre!(
          "No manifest configured: set manifest.assets, manifest.file or manifest.build_dir"
        ))
      }
      _ => {
        return Err(eyre!(
          "Only one of manifest.assets, manifest.file and manifest.build_dir may be set"
        ))
      }
    };

    if manifest.is_empty() {
      return Err(eyre!("Manifest is empty"));
    }
    Ok(manifest)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const MINIMAL: &str = r#"
origin: "http://localhost:5173"
generation: eudi-wallet-v1
manifest:
  assets: ["/", "/src/app.js"]
"#;

  #[test]
  fn test_parse_minimal_with_defaults() {
    let config = Config::parse(MINIMAL).unwrap();
    assert_eq!(config.origin.as_str(), "http://localhost:5173/");
    assert_eq!(config.generation, "eudi-wallet-v1");
    assert_eq!(config.network.timeout(), Duration::from_secs(30));
    assert_eq!(config.network.install_concurrency, DEFAULT_CONCURRENCY);
    assert_eq!(config.manifest.extensions.len(), DEFAULT_EXTENSIONS.len());
    assert!(config.cache.path.is_none());
    assert!(config.log_file.is_none());

    let manifest = config.manifest.build().unwrap();
    assert_eq!(manifest.urls().collect::<Vec<_>>(), vec!["/", "/src/app.js"]);
  }

  #[test]
  fn test_rejects_invalid_origin() {
    let yaml = "origin: not a url\ngeneration: v1\n";
    assert!(Config::parse(yaml).is_err());
  }

  #[test]
  fn test_env_overrides() {
    let config = Config::parse(MINIMAL)
      .unwrap()
      .with_env_overrides(|name| match name {
        "PRECACHE_GENERATION" => Some("eudi-wallet-v2".to_string()),
        "PRECACHE_ORIGIN" => Some("https://wallet.example.org".to_string()),
        _ => None,
      })
      .unwrap();
    assert_eq!(config.generation, "eudi-wallet-v2");
    assert_eq!(config.origin.host_str(), Some("wallet.example.org"));
  }

  #[test]
  fn test_manifest_sources_are_exclusive() {
    let manifest = ManifestConfig {
      assets: vec!["/".to_string()],
      build_dir: Some(PathBuf::from("dist")),
      ..Default::default()
    };
    assert!(manifest.build().is_err());
    assert!(ManifestConfig::default().build().is_err());
  }

  #[test]
  fn test_relative_paths_resolve_against_config_dir() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("assets.yaml"), "- /\n- /a.js\n").unwrap();
    let config_path = dir.path().join("precache.yaml");
    std::fs::write(
      &config_path,
      "origin: http://localhost:5173\ngeneration: v1\nmanifest:\n  file: assets.yaml\n",
    )
    .unwrap();

    let config = Config::load_from_path(&config_path).unwrap();
    assert_eq!(config.generation, "v1");
    assert_eq!(config.manifest.build().unwrap().len(), 2);
  }

  #[test]
  fn test_missing_explicit_config() {
    assert!(Config::load(Some(Path::new("/nonexistent/precache.yaml"))).is_err());
  }
}
