use crate::roots::{absolutize, expand_home, AllowedRoots};
use std::collections::VecDeque;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

const MAX_SYMLINK_HOPS: usize = 40;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathIntent {
	ReadExisting,
	WriteMayCreate,
	WriteMustExist,
}

/// A canonical path proven to sit inside an allowed root.
/// Only [`Resolver`] constructs these.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedPath(PathBuf);

impl ResolvedPath {
	pub fn as_path(&self) -> &Path {
		&self.0
	}
}

impl fmt::Display for ResolvedPath {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0.display())
	}
}

#[derive(Debug, Error)]
pub enum ValidationError {
	#[error("Path does not exist: {requested}")]
	NotFound {
		requested: String
	},

	#[error("Access denied: Path '{requested}' is outside allowed areas.")]
	OutsideAllowedArea {
		requested: String
	},

	#[error("No allowed parent for '{requested}'")]
	ParentNotFound {
		requested: String
	},

	#[error("Access denied or invalid path: '{requested}': {source}")]
	Resolution {
		requested: String,
		source: io::Error,
	},
}

impl ValidationError {
	pub fn code(&self) -> &'static str {
		match self {
			ValidationError::NotFound { .. } => "NOT_FOUND",
			ValidationError::OutsideAllowedArea { .. } => "OUTSIDE_ALLOWED_AREA",
			ValidationError::ParentNotFound { .. } => "PARENT_NOT_FOUND",
			ValidationError::Resolution { .. } => "RESOLUTION_ERROR",
		}
	}
}

/// Turns request strings into [`ResolvedPath`]s. Nothing is cached: the root
/// set is static but the filesystem under it is not.
#[derive(Clone, Debug)]
pub struct Resolver {
	roots: Arc<AllowedRoots>,
}

impl Resolver {
	pub fn new(roots: Arc<AllowedRoots>) -> Self {
		Self {
			roots
		}
	}

	pub fn roots(&self) -> &AllowedRoots {
		&self.roots
	}

	pub async fn validate(&self, requested: &str, intent: PathIntent) -> Result<ResolvedPath, ValidationError> {
		let resolver = self.clone();
		let owned = requested.to_string();
		tokio::task::spawn_blocking(move || resolver.validate_blocking(&owned, intent))
			.await
			.map_err(|err| ValidationError::Resolution {
				requested: requested.to_string(),
				source: io::Error::other(err)
			})?
	}

	pub fn validate_blocking(&self, requested: &str, intent: PathIntent) -> Result<ResolvedPath, ValidationError> {
		let cwd = std::env::current_dir().map_err(|err| resolution(requested, err))?;
		let expanded = absolutize(&expand_home(requested), &cwd);
		match intent {
			PathIntent::ReadExisting | PathIntent::WriteMustExist => self.resolve_existing(requested, &expanded),
			PathIntent::WriteMayCreate => self.resolve_creatable(requested, &expanded),
		}
	}

	/// Re-validates an entry found while walking a confined directory. The
	/// entry may be a symlink pointing anywhere.
	pub async fn validate_entry(&self, dir: &ResolvedPath, name: &OsStr) -> Result<ResolvedPath, ValidationError> {
		let resolver = self.clone();
		let candidate = dir.as_path().join(name);
		let requested = candidate.display().to_string();
		let fallback = requested.clone();
		tokio::task::spawn_blocking(move || resolver.resolve_existing(&requested, &candidate))
			.await
			.map_err(|err| ValidationError::Resolution {
				requested: fallback,
				source: io::Error::other(err)
			})?
	}

	/// Parent of an already confined path, if the parent is itself confined.
	pub fn parent_of(&self, path: &ResolvedPath) -> Option<ResolvedPath> {
		let parent = path.as_path().parent()?;
		if self.roots.contains(parent) {
			Some(ResolvedPath(parent.to_path_buf()))
		}
		else {
			None
		}
	}

	fn resolve_existing(&self, requested: &str, expanded: &Path) -> Result<ResolvedPath, ValidationError> {
		let canonical = std::fs::canonicalize(expanded).map_err(
			|err| {
				if err.kind() == io::ErrorKind::NotFound {
					ValidationError::NotFound {
						requested: requested.to_string()
					}
				}
				else {
					resolution(requested, err)
				}
			}
		)?;
		self.confine(requested, canonical)
	}

	fn resolve_creatable(&self, requested: &str, expanded: &Path) -> Result<ResolvedPath, ValidationError> {
		// an existing target, an allowed root included, needs no ancestor walk
		match std::fs::canonicalize(expanded) {
			Ok(canonical) => return self.confine(requested, canonical),
			Err(err) if err.kind() == io::ErrorKind::NotFound => {}
			Err(err) => return Err(resolution(requested, err)),
		}
		let mut ancestor = expanded.parent().unwrap_or(expanded);
		let anchor = loop {
			match std::fs::canonicalize(ancestor) {
				Ok(canonical) => break canonical,
				Err(err) if err.kind() == io::ErrorKind::NotFound => {
					match ancestor.parent() {
						Some(parent) => ancestor = parent,
						None => {
							return Err(ValidationError::ParentNotFound {
								requested: requested.to_string()
							});
						}
					}
				}
				Err(err) => return Err(resolution(requested, err)),
			}
		};
		if !self.roots.contains(&anchor) {
			return Err(self.outside(requested, &anchor));
		}
		let suffix = expanded.strip_prefix(ancestor)
			.map_err(|err| resolution(requested, io::Error::new(io::ErrorKind::InvalidInput, err)))?;
		let rebuilt = resolve_suffix(anchor, suffix).map_err(|err| resolution(requested, err))?;
		// a symlink in the not-yet-walked suffix may still point elsewhere
		self.confine(requested, rebuilt)
	}

	fn confine(&self, requested: &str, canonical: PathBuf) -> Result<ResolvedPath, ValidationError> {
		if !self.roots.contains(&canonical) {
			return Err(self.outside(requested, &canonical));
		}
		Ok(ResolvedPath(canonical))
	}

	fn outside(&self, requested: &str, resolved: &Path) -> ValidationError {
		warn!(
			requested,
			resolved = %resolved.display(),
			"access denied: path resolves outside allowed directories"
		);
		ValidationError::OutsideAllowedArea {
			requested: requested.to_string()
		}
	}
}

fn resolution(requested: &str, source: io::Error) -> ValidationError {
	warn!(requested, error = %source, "error resolving path");
	ValidationError::Resolution {
		requested: requested.to_string(),
		source
	}
}

enum Segment {
	Root(PathBuf),
	Parent,
	Name(OsString),
}

fn segments(path: &Path) -> Vec<Segment> {
	let mut out = Vec::new();
	let mut root = PathBuf::new();
	for component in path.components() {
		match component {
			Component::Prefix(prefix) => root.push(prefix.as_os_str()),
			Component::RootDir => {
				root.push(component.as_os_str());
				out.push(Segment::Root(std::mem::take(&mut root)));
			}
			Component::CurDir => {}
			Component::ParentDir => out.push(Segment::Parent),
			Component::Normal(name) => out.push(Segment::Name(name.to_os_string())),
		}
	}
	out
}

/// Appends `suffix` to the canonical `anchor`, following any symlink met on
/// the way (dangling ones included) and applying `..` after resolution.
/// Components that do not exist are kept as written.
fn resolve_suffix(anchor: PathBuf, suffix: &Path) -> io::Result<PathBuf> {
	let mut pending: VecDeque<Segment> = segments(suffix).into();
	let mut resolved = anchor;
	let mut hops = 0usize;
	while let Some(segment) = pending.pop_front() {
		match segment {
			Segment::Root(root) => resolved = root,
			Segment::Parent => {
				resolved.pop();
			}
			Segment::Name(name) => {
				resolved.push(&name);
				let meta = match std::fs::symlink_metadata(&resolved) {
					Ok(meta) => meta,
					Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
					Err(err) => return Err(err),
				};
				if !meta.file_type().is_symlink() {
					continue;
				}
				hops += 1;
				if hops > MAX_SYMLINK_HOPS {
					return Err(io::Error::new(io::ErrorKind::Other, "too many levels of symbolic links"));
				}
				let target = std::fs::read_link(&resolved)?;
				resolved.pop();
				for segment in segments(&target).into_iter().rev() {
					pending.push_front(segment);
				}
			}
		}
	}
	Ok(resolved)
}
