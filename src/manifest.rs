//! Manifests: the ordered list of assets a generation must contain.
//!
//! A manifest is either authored by hand (inline in the config or in a
//! separate YAML/JSON file) or generated from a build output directory, in
//! which case every entry carries a content revision.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;
use walkdir::WalkDir;

use crate::error::{CacheError, Result};

/// Extensions picked up from a build directory when none are configured.
pub const DEFAULT_EXTENSIONS: &[&str] = &["js", "css", "html", "ico", "png", "svg"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
  pub url: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub revision: Option<String>,
}

/// Entries in a manifest file may be bare URLs or `{url, revision}` objects.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawEntry {
  Url(String),
  Entry(ManifestEntry),
}

impl From<RawEntry> for ManifestEntry {
  fn from(raw: RawEntry) -> Self {
    match raw {
      RawEntry::Url(url) => ManifestEntry {
        url,
        revision: None,
      },
      RawEntry::Entry(entry) => entry,
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
  entries: Vec<ManifestEntry>,
}

impl Manifest {
  /// Build a manifest, keeping the first occurrence of each URL.
  pub fn new(entries: impl IntoIterator<Item = ManifestEntry>) -> Self {
    let mut seen = HashSet::new();
    let entries = entries
      .into_iter()
      .filter(|e| seen.insert(e.url.clone()))
      .collect();
    Self { entries }
  }

  pub fn from_urls<I, S>(urls: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self::new(urls.into_iter().map(|url| ManifestEntry {
      url: url.into(),
      revision: None,
    }))
  }

  /// Load a manifest list from a YAML or JSON file.
  pub fn load(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
      CacheError::Manifest(format!("Failed to read manifest {}: {}", path.display(), e))
    })?;

    let raw: Vec<RawEntry> = serde_yaml::from_str(&contents).map_err(|e| {
      CacheError::Manifest(format!("Failed to parse manifest {}: {}", path.display(), e))
    })?;

    Ok(Self::new(raw.into_iter().map(ManifestEntry::from)))
  }

  /// Generate a manifest from the files of a build output directory.
  ///
  /// Each file with a matching extension becomes `/<relative path>` with a
  /// revision equal to the SHA-256 of its contents. A root `index.html` also
  /// yields `/`.
  pub fn from_build_dir(dir: &Path, extensions: &[String]) -> Result<Self> {
    if !dir.is_dir() {
      return Err(CacheError::Manifest(format!(
        "Build directory not found: {}",
        dir.display()
      )));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true) {
      let entry = entry.map_err(|e| CacheError::Manifest(format!("Failed to walk build dir: {e}")))?;
      if !entry.file_type().is_file() {
        continue;
      }
      let matches = entry
        .path()
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)));
      if matches {
        files.push(entry.into_path());
      }
    }
    files.sort();

    let mut entries = Vec::with_capacity(files.len() + 1);
    for file in files {
      let relative = file
        .strip_prefix(dir)
        .map_err(|e| CacheError::Manifest(format!("{}: {}", file.display(), e)))?;
      let url = format!(
        "/{}",
        relative
          .components()
          .map(|c| c.as_os_str().to_string_lossy())
          .collect::<Vec<_>>()
          .join("/")
      );

      let contents = std::fs::read(&file)
        .map_err(|e| CacheError::Manifest(format!("Failed to read {}: {}", file.display(), e)))?;
      let revision = hex::encode(Sha256::digest(&contents));

      if url == "/index.html" {
        entries.push(ManifestEntry {
          url: "/".to_string(),
          revision: Some(revision.clone()),
        });
      }
      entries.push(ManifestEntry {
        url,
        revision: Some(revision),
      });
    }

    Ok(Self::new(entries))
  }

  pub fn entries(&self) -> &[ManifestEntry] {
    &self.entries
  }

  pub fn urls(&self) -> impl Iterator<Item = &str> {
    self.entries.iter().map(|e| e.url.as_str())
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Hex SHA-256 over every entry's URL and revision, in order.
  pub fn digest(&self) -> String {
    let mut hasher = Sha256::new();
    for entry in &self.entries {
      hasher.update(entry.url.as_bytes());
      hasher.update(b"\0");
      hasher.update(entry.revision.as_deref().unwrap_or("").as_bytes());
      hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
  }
}
