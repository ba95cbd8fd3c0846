use crate::pdf::{self, ExtractedPdf, PdfError};
use crate::resolver::ResolvedPath;
use encoding_rs::Encoding;
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use similar::TextDiff;
use std::ffi::OsString;
use std::fs::Metadata;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

/// Optional backends compiled into this build.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
	pub pdf: bool,
}

impl Capabilities {
	pub fn detect() -> Self {
		Self {
			pdf: cfg!(feature = "pdf")
		}
	}
}

/// WHATWG label lookup. Also accepts the common `latin-1` / `utf_8` spellings.
pub fn lookup_encoding(label: &str) -> Option<&'static Encoding> {
	let label = label.trim();
	Encoding::for_label(label.as_bytes()).or_else(
		|| {
			let squeezed: String = label.chars()
				.filter(|c| *c != '-' && *c != '_')
				.collect();
			Encoding::for_label(squeezed.as_bytes())
		}
	)
}

/// Reads `length` bytes (or to EOF) from `offset` and decodes them. Malformed
/// input never fails the read: it comes back with replacement characters.
pub async fn read_range(
	path: &ResolvedPath,
	offset: u64,
	length: Option<u64>,
	encoding: &'static Encoding) -> io::Result<String> {
	let mut file = fs::File::open(path.as_path()).await?;
	if offset > 0 {
		file.seek(SeekFrom::Start(offset)).await?;
	}
	let mut bytes = Vec::new();
	match length {
		Some(length) => {
			file.take(length).read_to_end(&mut bytes).await?;
		}
		None => {
			file.read_to_end(&mut bytes).await?;
		}
	}
	Ok(decode(&bytes, encoding, path))
}

fn decode(bytes: &[u8], encoding: &'static Encoding, path: &ResolvedPath) -> String {
	let (text, had_errors) = encoding.decode_without_bom_handling(bytes);
	if had_errors {
		warn!(
			path = %path,
			encoding = encoding.name(),
			"decoding failed, returning degraded text"
		);
	}
	text.into_owned()
}

/// Whole file as bytes, or `None` when it does not exist yet.
pub async fn read_existing(path: &ResolvedPath) -> io::Result<Option<Vec<u8>>> {
	match fs::read(path.as_path()).await {
		Ok(bytes) => Ok(Some(bytes)),
		Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
		Err(err) => Err(err),
	}
}

/// Create or truncate. There is no append primitive; callers concatenate.
pub async fn write(path: &ResolvedPath, contents: impl AsRef<[u8]>) -> io::Result<()> {
	fs::write(path.as_path(), contents).await
}

/// Already existing directories are not an error.
pub async fn create_dir(path: &ResolvedPath, recursive: bool) -> io::Result<()> {
	let result = if recursive {
		fs::create_dir_all(path.as_path()).await
	}
	else {
		fs::create_dir(path.as_path()).await
	};
	match result {
		Ok(()) => Ok(()),
		Err(err) if err.kind() == io::ErrorKind::AlreadyExists && is_dir(path).await => Ok(()),
		Err(err) => Err(err),
	}
}

/// Single rename call. Cross-device moves fail.
pub async fn rename(from: &ResolvedPath, to: &ResolvedPath) -> io::Result<()> {
	fs::rename(from.as_path(), to.as_path()).await
}

pub async fn stat(path: &ResolvedPath) -> io::Result<Metadata> {
	fs::metadata(path.as_path()).await
}

/// True for anything at `path`, dangling symlinks included.
pub async fn exists(path: &ResolvedPath) -> bool {
	fs::symlink_metadata(path.as_path()).await.is_ok()
}

pub async fn is_dir(path: &ResolvedPath) -> bool {
	fs::metadata(path.as_path())
		.await
		.map(|meta| meta.is_dir())
		.unwrap_or(false)
}

/// Entry names of a directory, sorted.
pub async fn read_dir(path: &ResolvedPath) -> io::Result<Vec<OsString>> {
	let mut entries = fs::read_dir(path.as_path()).await?;
	let mut names = Vec::new();
	while let Some(entry) = entries.next_entry().await? {
		names.push(entry.file_name());
	}
	names.sort();
	Ok(names)
}

/// Metadata of one entry of a listed directory, following symlinks.
pub async fn stat_entry(dir: &ResolvedPath, name: &OsString) -> io::Result<Metadata> {
	fs::metadata(dir.as_path().join(name)).await
}

pub fn build_exclude_set(patterns: &[String]) -> Result<Option<GlobSet>, globset::Error> {
	if patterns.is_empty() {
		return Ok(None);
	}
	let mut builder = GlobSetBuilder::new();
	for pattern in patterns {
		builder.add(Glob::new(pattern)?);
	}
	Ok(Some(builder.build()?))
}

/// Recursive name search below `base`. `pattern` is a case-insensitive
/// substring of the entry name.
/// Symlinks are reported but not followed.
pub async fn search(
	base: &ResolvedPath,
	pattern: &str,
	excludes: Option<GlobSet>) -> io::Result<Vec<PathBuf>> {
	let base = base.as_path().to_path_buf();
	let needle = pattern.to_lowercase();
	tokio::task::spawn_blocking(move || search_blocking(base, &needle, excludes))
		.await
		.map_err(io::Error::other)
}

fn search_blocking(base: PathBuf, needle: &str, excludes: Option<GlobSet>) -> Vec<PathBuf> {
	let mut builder = WalkBuilder::new(&base);
	builder.standard_filters(false);
	builder.follow_links(false);
	builder.sort_by_file_name(|a, b| a.cmp(b));
	let mut matches = Vec::new();
	for entry in builder.build() {
		let entry = match entry {
			Ok(entry) => entry,
			Err(err) => {
				debug!(error = %err, "skipping entry during search");
				continue;
			}
		};
		if entry.depth() == 0 {
			continue;
		}
		if let Some(excludes) = &excludes {
			if is_excluded(excludes, &base, entry.path()) {
				continue;
			}
		}
		let name = entry.file_name().to_string_lossy().to_lowercase();
		if name.contains(needle) {
			matches.push(entry.into_path());
		}
	}
	matches
}

/// Each entry is tested on its own name and on its path relative to the
/// search base. Children of an excluded directory are tested on their own.
fn is_excluded(excludes: &GlobSet, base: &Path, path: &Path) -> bool {
	if path.file_name().is_some_and(|name| excludes.is_match(name)) {
		return true;
	}
	match path.strip_prefix(base) {
		Ok(rel) => excludes.is_match(rel),
		Err(_) => false,
	}
}

pub async fn read_pdf(
	capabilities: Capabilities,
	path: &ResolvedPath,
	pages: Option<Vec<i64>>) -> Result<ExtractedPdf, PdfError> {
	if !capabilities.pdf {
		return Err(PdfError::Unavailable);
	}
	let target = path.as_path().to_path_buf();
	let display = path.to_string();
	tokio::task::spawn_blocking(move || pdf::extract_pages(&target, pages.as_deref()))
		.await
		.map_err(
			|err| PdfError::Extraction {
				path: display,
				reason: err.to_string()
			}
		)?
}

pub fn make_diff(existing: &str, updated: &str, path: &ResolvedPath) -> String {
	let diff = TextDiff::from_lines(existing, updated);
	diff.unified_diff()
		.context_radius(3)
		.header(&format!("a/{}", path), &format!("b/{}", path))
		.to_string()
}
