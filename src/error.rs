use crate::pdf::PdfError;
use crate::resolver::ValidationError;
use std::io;
use thiserror::Error;

/// Startup failures. Fatal: the process exits when the allow-list cannot be built.
#[derive(Debug, Error)]
pub enum ConfigurationError {
	#[error("At least one allowed directory must be specified.")]
	NoDirectories,

	#[error("Allowed directory does not exist or is not a directory: {path}")]
	InvalidDirectory {
		path: String,
		#[source]
		source: Option<io::Error>,
	},

	#[error("failed to determine current directory: {0}")]
	CurrentDir(#[source] io::Error),
}

/// Failure of a single tool call.
#[derive(Debug, Error)]
pub enum ToolError {
	#[error(transparent)]
	Validation(#[from] ValidationError),

	#[error("{0}")]
	InvalidParams(String),

	#[error("Destination path already exists: {0}")]
	AlreadyExists(String),

	#[error("Path is not a directory: {0}")]
	NotADirectory(String),

	#[error(transparent)]
	Pdf(#[from] PdfError),

	#[error("{action} {path}: {source}")]
	Io {
		action: &'static str,
		path: String,
		#[source]
		source: io::Error,
	},

	#[error("failed to encode result: {0}")]
	Encode(#[from] serde_json::Error),
}

impl ToolError {
	pub fn io(action: &'static str, path: &str, source: io::Error) -> Self {
		ToolError::Io {
			action,
			path: path.to_string(),
			source
		}
	}

	pub fn code(&self) -> &'static str {
		match self {
			ToolError::Validation(err) => err.code(),
			ToolError::InvalidParams(_) => "INVALID_PARAMS",
			ToolError::AlreadyExists(_) => "ALREADY_EXISTS",
			ToolError::NotADirectory(_) => "NOT_A_DIRECTORY",
			ToolError::Pdf(err) => err.code(),
			ToolError::Io { .. } => "IO_ERROR",
			ToolError::Encode(_) => "INTERNAL_ERROR",
		}
	}
}
