//! Maps request paths to the resource type that selects a caching policy.

use serde::{Deserialize, Serialize};
use std::fmt;

const ASSET_EXTENSIONS: &[&str] = &[
  "js", "mjs", "css", "map", "woff", "woff2", "ttf", "otf", "eot",
];

const IMAGE_EXTENSIONS: &[&str] = &[
  "png", "jpg", "jpeg", "gif", "webp", "svg", "ico", "avif", "bmp",
];

/// Kind of resource, which determines strategy and max age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
  Page,
  Api,
  Asset,
  Image,
}

impl ResourceType {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Page => "page",
      Self::Api => "api",
      Self::Asset => "asset",
      Self::Image => "image",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "page" => Some(Self::Page),
      "api" => Some(Self::Api),
      "asset" => Some(Self::Asset),
      "image" => Some(Self::Image),
      _ => None,
    }
  }
}

impl fmt::Display for ResourceType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Path classifier with a configurable API prefix.
#[derive(Debug, Clone)]
pub struct Classifier {
  api_prefix: String,
}

impl Default for Classifier {
  fn default() -> Self {
    Self::new("/api/")
  }
}

impl Classifier {
  pub fn new(api_prefix: &str) -> Self {
    Self {
      api_prefix: api_prefix.to_string(),
    }
  }

  /// Classify a path. Rules apply in order: API prefix, asset extension,
  /// image extension, then everything else is a page.
  pub fn classify(&self, path: &str) -> ResourceType {
    let path = strip_query(path);

    if path.starts_with(&self.api_prefix) {
      return ResourceType::Api;
    }

    match extension(path) {
      Some(ext) if ASSET_EXTENSIONS.contains(&ext.as_str()) => ResourceType::Asset,
      Some(ext) if IMAGE_EXTENSIONS.contains(&ext.as_str()) => ResourceType::Image,
      _ => ResourceType::Page,
    }
  }
}

/// Classify with the default `/api/` prefix.
pub fn classify(path: &str) -> ResourceType {
  Classifier::default().classify(path)
}

fn strip_query(path: &str) -> &str {
  let end = path.find(['?', '#']).unwrap_or(path.len());
  &path[..end]
}

fn extension(path: &str) -> Option<String> {
  let file = path.rsplit('/').next()?;
  let (stem, ext) = file.rsplit_once('.')?;
  if stem.is_empty() && ext.is_empty() {
    return None;
  }
  Some(ext.to_ascii_lowercase())
}
