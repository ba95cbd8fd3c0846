use crate::error::ToolError;
use crate::fs::{self, Capabilities};
use crate::pdf::PdfPage;
use crate::resolver::{PathIntent, ResolvedPath, Resolver};
use chrono::{DateTime, Utc};
use globset::{GlobBuilder, GlobMatcher};
use serde::{Deserialize, Serialize};
use std::fs::Metadata;
use std::future::Future;
use std::num::NonZeroU64;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::SystemTime;
use tracing::warn;

const EMPTY_SEARCH: &str = "No matches found";

/// Everything a handler may touch. Cloned per request.
#[derive(Clone, Debug)]
pub struct ToolContext {
	pub resolver: Resolver,
	pub capabilities: Capabilities,
}

impl ToolContext {
	pub fn new(resolver: Resolver, capabilities: Capabilities) -> Self {
		Self {
			resolver,
			capabilities
		}
	}

	async fn resolve(&self, path: &str, intent: PathIntent) -> Result<ResolvedPath, ToolError> {
		Ok(self.resolver.validate(path, intent).await?)
	}
}

fn default_encoding() -> String {
	"utf-8".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ReadFileArgs {
	pub path: String,
	#[serde(default)]
	pub offset: Option<u64>,
	#[serde(default)]
	pub length: Option<NonZeroU64>,
	#[serde(default = "default_encoding")]
	pub encoding: String,
}

#[derive(Debug, Deserialize)]
pub struct ReadMultipleFilesArgs {
	pub paths: Vec<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
	#[default]
	Overwrite,
	Append,
}

#[derive(Debug, Deserialize)]
pub struct WriteFileArgs {
	pub path: String,
	pub content: String,
	#[serde(default)]
	pub mode: WriteMode,
}

#[derive(Debug, Deserialize)]
pub struct EditOperation {
	#[serde(rename = "oldText")]
	pub old_text: String,
	#[serde(rename = "newText")]
	pub new_text: String,
}

#[derive(Debug, Deserialize)]
pub struct EditFileArgs {
	pub path: String,
	pub edits: Vec<EditOperation>,
	#[serde(default, rename = "dryRun")]
	pub dry_run: bool,
}

/// Shared by create_directory, directory_tree and get_file_info.
#[derive(Debug, Deserialize)]
pub struct PathArgs {
	pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct ListDirectoryArgs {
	pub path: String,
	#[serde(default)]
	pub show_hidden: bool,
	#[serde(default)]
	pub pattern: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MoveFileArgs {
	pub source: String,
	pub destination: String,
}

#[derive(Debug, Deserialize)]
pub struct SearchFilesArgs {
	pub path: String,
	pub pattern: String,
	#[serde(default, rename = "excludePatterns")]
	pub exclude_patterns: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct ReadPdfFileArgs {
	pub path: String,
	#[serde(default)]
	pub page_numbers: Option<Vec<i64>>,
}

#[derive(Debug, Serialize)]
pub struct FileContentResult {
	pub path: String,
	pub content: Option<String>,
	pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
	File,
	Directory,
	Unknown,
}

#[derive(Debug, Serialize)]
pub struct DirectoryEntry {
	pub name: String,
	#[serde(rename = "type")]
	pub kind: EntryKind,
	pub size: Option<u64>,
	pub modified_timestamp: Option<String>,
	pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TreeEntry {
	pub name: String,
	#[serde(rename = "type")]
	pub kind: EntryKind,
	pub children: Option<Vec<TreeEntry>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
	pub size: u64,
	pub created: String,
	pub modified: String,
	pub accessed: String,
	pub is_directory: bool,
	pub is_file: bool,
	pub permissions: String,
	pub mime_type: String,
	pub path: String,
}

#[derive(Debug, Serialize)]
pub struct PdfContent {
	pub path: String,
	pub total_pages: usize,
	pub pages: Vec<PdfPage>,
}

#[derive(Debug, Serialize)]
pub struct EditSummary {
	#[serde(skip)]
	pub message: String,
	pub diff: String,
	pub applied: bool,
}

pub async fn read_file(ctx: &ToolContext, args: ReadFileArgs) -> Result<String, ToolError> {
	let encoding = fs::lookup_encoding(&args.encoding)
		.ok_or_else(|| ToolError::InvalidParams(format!("Unknown encoding: {}", args.encoding)))?;
	let path = ctx.resolve(&args.path, PathIntent::ReadExisting).await?;
	fs::read_range(
		&path,
		args.offset.unwrap_or(0),
		args.length.map(NonZeroU64::get),
		encoding
	)
		.await
		.map_err(|err| ToolError::io("read", &args.path, err))
}

/// One result per requested path; a failure never affects the others.
pub async fn read_multiple_files(ctx: &ToolContext, args: ReadMultipleFilesArgs) -> Vec<FileContentResult> {
	let mut results = Vec::with_capacity(args.paths.len());
	for path in args.paths {
		let outcome = read_file(
			ctx,
			ReadFileArgs {
				path: path.clone(),
				offset: None,
				length: None,
				encoding: default_encoding()
			}
		).await;
		results.push(match outcome {
			Ok(content) => FileContentResult {
				path,
				content: Some(content),
				error: None
			},
			Err(err) => FileContentResult {
				path,
				content: None,
				error: Some(err.to_string())
			},
		});
	}
	results
}

pub async fn write_file(ctx: &ToolContext, args: WriteFileArgs) -> Result<String, ToolError> {
	let path = ctx.resolve(&args.path, PathIntent::WriteMayCreate).await?;
	ensure_parent(ctx, &path, &args.path).await?;
	match args.mode {
		WriteMode::Overwrite => {
			fs::write(&path, args.content.as_bytes())
				.await
				.map_err(|err| ToolError::io("write", &args.path, err))?;
			Ok(format!("Successfully wrote to {}", args.path))
		}
		WriteMode::Append => {
			let mut combined = fs::read_existing(&path)
				.await
				.map_err(|err| ToolError::io("read", &args.path, err))?
				.unwrap_or_default();
			combined.extend_from_slice(args.content.as_bytes());
			fs::write(&path, combined)
				.await
				.map_err(|err| ToolError::io("write", &args.path, err))?;
			Ok(format!("Successfully appended to {}", args.path))
		}
	}
}

pub async fn edit_file(ctx: &ToolContext, args: EditFileArgs) -> Result<EditSummary, ToolError> {
	let path = ctx.resolve(&args.path, PathIntent::WriteMustExist).await?;
	let bytes = fs::read_existing(&path)
		.await
		.map_err(|err| ToolError::io("read", &args.path, err))?
		.ok_or_else(|| ToolError::io("read", &args.path, std::io::ErrorKind::NotFound.into()))?;
	let content = String::from_utf8(bytes)
		.map_err(|_| ToolError::InvalidParams(format!("File is not valid UTF-8 text: {}", args.path)))?;
	let original = content.replace("\r\n", "\n");
	let updated = apply_edits(&original, &args.edits);
	let diff = fs::make_diff(&original, &updated, &path);
	let fenced = fence_diff(&diff);
	if args.dry_run {
		return Ok(EditSummary {
			message: format!("Dry run. Proposed changes:\n{}", fenced),
			diff,
			applied: false
		});
	}
	if updated == original {
		return Ok(EditSummary {
			message: "File unchanged; no edit changed its content.".to_string(),
			diff,
			applied: false
		});
	}
	fs::write(&path, updated.as_bytes())
		.await
		.map_err(|err| ToolError::io("write", &args.path, err))?;
	Ok(EditSummary {
		message: format!("File edited. Changes:\n{}", fenced),
		diff,
		applied: true
	})
}

/// Each edit replaces every occurrence of its text in the running result.
/// An edit whose text is absent is skipped.
fn apply_edits(original: &str, edits: &[EditOperation]) -> String {
	let mut updated = original.to_string();
	for edit in edits {
		let old_text = edit.old_text.replace("\r\n", "\n");
		let new_text = edit.new_text.replace("\r\n", "\n");
		if old_text.is_empty() {
			warn!("skipping edit with empty oldText");
			continue;
		}
		if !updated.contains(&old_text) {
			let preview: String = edit.old_text.chars().take(50).collect();
			warn!(old_text = %preview, "edit oldText not found, skipping");
			continue;
		}
		updated = updated.replace(&old_text, &new_text);
	}
	updated
}

/// Wraps a diff in a ```diff block whose fence never occurs inside it.
fn fence_diff(diff: &str) -> String {
	let mut ticks = 3;
	while diff.contains(&"`".repeat(ticks)) {
		ticks += 1;
	}
	let fence = "`".repeat(ticks);
	format!("{}diff\n{}{}\n\n", fence, diff, fence)
}

pub async fn create_directory(ctx: &ToolContext, args: PathArgs) -> Result<String, ToolError> {
	let path = ctx.resolve(&args.path, PathIntent::WriteMayCreate).await?;
	fs::create_dir(&path, true)
		.await
		.map_err(|err| ToolError::io("create directory", &args.path, err))?;
	Ok(format!("Successfully created directory {} (or it already existed).", args.path))
}

pub async fn list_directory(ctx: &ToolContext, args: ListDirectoryArgs) -> Result<Vec<DirectoryEntry>, ToolError> {
	let dir = ctx.resolve(&args.path, PathIntent::ReadExisting).await?;
	if !fs::is_dir(&dir).await {
		return Err(ToolError::NotADirectory(args.path));
	}
	let filter = match args.pattern.as_deref() {
		Some(pattern) => Some(NameFilter::new(pattern)?),
		None => None,
	};
	let names = fs::read_dir(&dir)
		.await
		.map_err(|err| ToolError::io("list", &args.path, err))?;
	let mut entries = Vec::with_capacity(names.len());
	for raw in names {
		let name = raw.to_string_lossy().to_string();
		if !args.show_hidden && name.starts_with('.') {
			continue;
		}
		if let Some(filter) = &filter {
			if !filter.matches(&name) {
				continue;
			}
		}
		let entry = match fs::stat_entry(&dir, &raw).await {
			Ok(meta) => {
				let is_dir = meta.is_dir();
				DirectoryEntry {
					name,
					kind: if is_dir {
						EntryKind::Directory
					}
					else {
						EntryKind::File
					},
					size: if is_dir {
						None
					}
					else {
						Some(meta.len())
					},
					modified_timestamp: meta.modified().ok().map(rfc3339),
					error: None
				}
			}
			Err(err) => {
				warn!(entry = %name, error = %err, "error getting entry info");
				DirectoryEntry {
					name,
					kind: EntryKind::Unknown,
					size: None,
					modified_timestamp: None,
					error: Some(err.to_string())
				}
			}
		};
		entries.push(entry);
	}
	Ok(entries)
}

/// Case-insensitive. Patterns with glob syntax are globs; anything else is a
/// name suffix, so `txt` and `*.txt` both select `a.txt`.
enum NameFilter {
	Glob(GlobMatcher),
	Suffix(String),
}

impl NameFilter {
	fn new(pattern: &str) -> Result<Self, ToolError> {
		if pattern.contains(['*', '?', '[', '{']) {
			let glob = GlobBuilder::new(pattern)
				.case_insensitive(true)
				.literal_separator(true)
				.build()
				.map_err(|err| ToolError::InvalidParams(format!("Invalid pattern '{}': {}", pattern, err)))?;
			Ok(NameFilter::Glob(glob.compile_matcher()))
		}
		else {
			Ok(NameFilter::Suffix(pattern.to_lowercase()))
		}
	}

	fn matches(&self, name: &str) -> bool {
		match self {
			NameFilter::Glob(glob) => glob.is_match(name),
			NameFilter::Suffix(suffix) => name.to_lowercase().ends_with(suffix.as_str()),
		}
	}
}

pub async fn directory_tree(ctx: &ToolContext, args: PathArgs) -> Result<Vec<TreeEntry>, ToolError> {
	let top = ctx.resolve(&args.path, PathIntent::ReadExisting).await?;
	if !fs::is_dir(&top).await {
		return Err(ToolError::NotADirectory(args.path));
	}
	let mut branch = vec![top.as_path().to_path_buf()];
	build_tree(ctx, top, &mut branch).await
}

/// `branch` holds the canonical directories from the top down to `dir`; a
/// child resolving to one of them is a symlink cycle and is not descended.
fn build_tree<'a>(
	ctx: &'a ToolContext,
	dir: ResolvedPath,
	branch: &'a mut Vec<PathBuf>) -> Pin<Box<dyn Future<Output = Result<Vec<TreeEntry>, ToolError>> + Send + 'a>> {
	Box::pin(
		async move {
			let names = fs::read_dir(&dir)
				.await
				.map_err(|err| ToolError::io("list", &dir.to_string(), err))?;
			let mut entries = Vec::with_capacity(names.len());
			for raw in names {
				let child = match ctx.resolver.validate_entry(&dir, &raw).await {
					Ok(child) => child,
					Err(err) => {
						warn!(entry = %dir.as_path().join(&raw).display(), error = %err, "skipping entry in directory tree");
						continue;
					}
				};
				let name = raw.to_string_lossy().to_string();
				if !fs::is_dir(&child).await {
					entries.push(TreeEntry {
						name,
						kind: EntryKind::File,
						children: None
					});
					continue;
				}
				let children = if branch.iter().any(|seen| seen == child.as_path()) {
					warn!(entry = %child, "directory cycle in tree, not descending");
					Vec::new()
				}
				else {
					branch.push(child.as_path().to_path_buf());
					let children = build_tree(ctx, child, branch).await;
					branch.pop();
					match children {
						Ok(children) => children,
						Err(err) => {
							warn!(entry = %dir.as_path().join(&raw).display(), error = %err, "cannot list directory in tree");
							Vec::new()
						}
					}
				};
				entries.push(TreeEntry {
					name,
					kind: EntryKind::Directory,
					children: Some(children)
				});
			}
			Ok(entries)
		}
	)
}

pub async fn move_file(ctx: &ToolContext, args: MoveFileArgs) -> Result<String, ToolError> {
	let source = ctx.resolve(&args.source, PathIntent::ReadExisting).await?;
	if ctx.resolver.roots().is_root(source.as_path()) {
		return Err(ToolError::InvalidParams(format!("Cannot move an allowed directory: {}", args.source)));
	}
	let destination = ctx.resolve(&args.destination, PathIntent::WriteMayCreate).await?;
	if fs::exists(&destination).await {
		return Err(ToolError::AlreadyExists(args.destination));
	}
	ensure_parent(ctx, &destination, &args.destination).await?;
	fs::rename(&source, &destination)
		.await
		.map_err(|err| ToolError::io("move", &args.source, err))?;
	Ok(format!("Successfully moved {} to {}", args.source, args.destination))
}

async fn ensure_parent(ctx: &ToolContext, path: &ResolvedPath, requested: &str) -> Result<(), ToolError> {
	let Some(parent) = ctx.resolver.parent_of(path) else {
		return Ok(());
	};
	if fs::is_dir(&parent).await {
		return Ok(());
	}
	fs::create_dir(&parent, true)
		.await
		.map_err(|err| ToolError::io("create parent directory for", requested, err))
}

pub async fn search_files(ctx: &ToolContext, args: SearchFilesArgs) -> Result<Vec<String>, ToolError> {
	let base = ctx.resolve(&args.path, PathIntent::ReadExisting).await?;
	if !fs::is_dir(&base).await {
		return Err(ToolError::NotADirectory(args.path));
	}
	let excludes = fs::build_exclude_set(args.exclude_patterns.as_deref().unwrap_or_default())
		.map_err(|err| ToolError::InvalidParams(format!("Invalid exclude pattern: {}", err)))?;
	let found = fs::search(&base, &args.pattern, excludes)
		.await
		.map_err(|err| ToolError::io("search", &args.path, err))?;
	Ok(found.iter().map(|path| path.display().to_string()).collect())
}

pub fn format_matches(matches: &[String]) -> String {
	if matches.is_empty() {
		return EMPTY_SEARCH.to_string();
	}
	matches.join("\n")
}

pub async fn get_file_info(ctx: &ToolContext, args: PathArgs) -> Result<FileInfo, ToolError> {
	let path = ctx.resolve(&args.path, PathIntent::ReadExisting).await?;
	let meta = fs::stat(&path)
		.await
		.map_err(|err| ToolError::io("stat", &args.path, err))?;
	let modified = meta.modified().ok();
	let mime_type = if meta.is_dir() {
		"inode/directory".to_string()
	}
	else {
		mime_guess::from_path(path.as_path())
			.first_or_octet_stream()
			.essence_str()
			.to_string()
	};
	Ok(FileInfo {
		size: meta.len(),
		created: created_time(&meta).or(modified).map(rfc3339).unwrap_or_default(),
		modified: modified.map(rfc3339).unwrap_or_default(),
		accessed: meta.accessed().ok().or(modified).map(rfc3339).unwrap_or_default(),
		is_directory: meta.is_dir(),
		is_file: meta.is_file(),
		permissions: permission_string(&meta),
		mime_type,
		path: path.to_string()
	})
}

/// Birth time where the platform records one, inode change time otherwise.
fn created_time(meta: &Metadata) -> Option<SystemTime> {
	meta.created().ok().or_else(|| changed_time(meta))
}

#[cfg(unix)]
fn changed_time(meta: &Metadata) -> Option<SystemTime> {
	use std::os::unix::fs::MetadataExt;
	let changed = DateTime::<Utc>::from_timestamp(meta.ctime(), meta.ctime_nsec() as u32)?;
	Some(SystemTime::from(changed))
}

#[cfg(not(unix))]
fn changed_time(_meta: &Metadata) -> Option<SystemTime> {
	None
}

#[cfg(unix)]
fn permission_string(meta: &Metadata) -> String {
	use std::os::unix::fs::PermissionsExt;
	let mode = meta.permissions().mode();
	let flags = [(0o400, 'r'), (0o200, 'w'), (0o100, 'x'), (0o040, 'r'), (0o020, 'w'), (0o010, 'x'), (0o004, 'r'), (0o002, 'w'), (0o001, 'x')];
	flags.iter()
		.map(|(bit, ch)| if mode & bit != 0 {
			*ch
		}
		else {
			'-'
		})
		.collect()
}

#[cfg(not(unix))]
fn permission_string(meta: &Metadata) -> String {
	if meta.permissions().readonly() {
		"r--r--r--".to_string()
	}
	else {
		"rw-rw-rw-".to_string()
	}
}

fn rfc3339(time: SystemTime) -> String {
	DateTime::<Utc>::from(time).to_rfc3339()
}

pub fn list_allowed_directories(ctx: &ToolContext) -> Vec<String> {
	ctx.resolver
		.roots()
		.iter()
		.map(|root| root.display().to_string())
		.collect()
}

pub fn format_allowed_directories(dirs: &[String]) -> String {
	format!("Allowed directories:\n{}", dirs.join("\n"))
}

pub async fn read_pdf_file(ctx: &ToolContext, args: ReadPdfFileArgs) -> Result<PdfContent, ToolError> {
	let path = ctx.resolve(&args.path, PathIntent::ReadExisting).await?;
	let extracted = fs::read_pdf(ctx.capabilities, &path, args.page_numbers).await?;
	Ok(PdfContent {
		path: path.to_string(),
		total_pages: extracted.total_pages,
		pages: extracted.pages
	})
}
