use crate::error::ConfigurationError;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const DISPLAY_LIMIT: usize = 80;

/// Canonical directories outside of which no operation may act.
/// Built once at startup and never mutated afterwards.
#[derive(Clone, Debug)]
pub struct AllowedRoots {
	roots: Vec<PathBuf>,
}

impl AllowedRoots {
	pub fn initialize<S: AsRef<str>>(paths: &[S]) -> Result<Self, ConfigurationError> {
		if paths.is_empty() {
			return Err(ConfigurationError::NoDirectories);
		}
		let cwd = std::env::current_dir().map_err(ConfigurationError::CurrentDir)?;
		let mut roots: Vec<PathBuf> = Vec::new();
		for raw in paths {
			let expanded = absolutize(&expand_home(raw.as_ref()), &cwd);
			let canonical = std::fs::canonicalize(&expanded).map_err(
				|err| ConfigurationError::InvalidDirectory {
					path: expanded.display().to_string(),
					source: Some(err)
				}
			)?;
			if !canonical.is_dir() {
				return Err(ConfigurationError::InvalidDirectory {
					path: canonical.display().to_string(),
					source: None
				});
			}
			if roots.contains(&canonical) {
				debug!(root = %canonical.display(), "duplicate allowed directory ignored");
				continue;
			}
			roots.push(canonical);
		}
		let formatted = roots.iter()
			.map(|root| shorten(&root.display().to_string()))
			.collect::<Vec<_>>()
			.join(", ");
		info!(count = roots.len(), "allowed directories: {}", formatted);
		Ok(Self {
			roots
		})
	}

	/// `candidate` must already be canonical; a raw request string never reaches here.
	pub fn contains(&self, candidate: &Path) -> bool {
		self.roots
			.iter()
			.any(|root| candidate.starts_with(root))
	}

	pub fn iter(&self) -> impl Iterator<Item = &Path> {
		self.roots.iter().map(PathBuf::as_path)
	}

	pub fn is_root(&self, candidate: &Path) -> bool {
		self.roots.iter().any(|root| root == candidate)
	}
}

pub fn expand_home(raw: &str) -> PathBuf {
	if raw == "~" {
		if let Some(home) = dirs::home_dir() {
			return home;
		}
	}
	else if let Some(rest) = raw.strip_prefix("~/") {
		if let Some(home) = dirs::home_dir() {
			return home.join(rest);
		}
	}
	PathBuf::from(raw)
}

pub fn absolutize(path: &Path, cwd: &Path) -> PathBuf {
	if path.is_absolute() {
		path.to_path_buf()
	}
	else {
		cwd.join(path)
	}
}

fn shorten(text: &str) -> String {
	if text.chars().count() <= DISPLAY_LIMIT {
		return text.to_string();
	}
	let head: String = text.chars().take(DISPLAY_LIMIT).collect();
	format!("{}...", head)
}
