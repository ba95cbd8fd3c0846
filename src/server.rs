use crate::error::ToolError;
use crate::fs::Capabilities;
use crate::protocol::{self, Request, Response};
use crate::tools::{self, ToolContext};
use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, info_span, Instrument, Span};

const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Error)]
#[error("{message}")]
struct ProtocolError {
	code: i64,
	message: String,
}

impl ProtocolError {
	fn new(code: i64, message: impl Into<String>) -> Self {
		Self {
			code,
			message: message.into()
		}
	}
}

pub struct ServerState {
	tools: ToolContext,
	session_id: String,
}

impl ServerState {
	pub fn new(tools: ToolContext, session_id: String) -> Self {
		Self {
			tools,
			session_id
		}
	}
}

/// What a tool hands back: the text block every client shows, plus the
/// machine-readable form when there is one.
struct ToolOutput {
	text: String,
	structured: Option<Value>,
}

impl ToolOutput {
	fn text(text: String) -> Self {
		Self {
			text,
			structured: None
		}
	}

	fn structured<T: Serialize>(value: &T) -> Result<Self, ToolError> {
		let structured = serde_json::to_value(value)?;
		Ok(Self {
			text: serde_json::to_string_pretty(&structured)?,
			structured: Some(structured)
		})
	}
}

pub async fn run(state: ServerState) -> Result<()> {
	serve(&state, BufReader::new(io::stdin()), io::BufWriter::new(io::stdout())).await
}

/// One JSON-RPC message per line in, one response per line out.
pub async fn serve<R, W>(state: &ServerState, reader: R, mut writer: W) -> Result<()>
where
	R: AsyncBufRead + Unpin,
	W: AsyncWrite + Unpin, {
	let mut lines = reader.lines();
	while let Some(line) = lines.next_line().await? {
		if line.trim().is_empty() {
			continue;
		}
		let value: Value = match serde_json::from_str(&line) {
			Ok(value) => value,
			Err(err) => {
				let resp = Response::err(Value::Null, protocol::PARSE_ERROR, err.to_string());
				write_response(&mut writer, resp).await?;
				continue;
			}
		};
		let id = value.get("id")
			.cloned()
			.unwrap_or(Value::Null);
		let req: Request = match serde_json::from_value(value) {
			Ok(req) => req,
			Err(err) => {
				let resp = Response::err(id, protocol::INVALID_REQUEST, err.to_string());
				write_response(&mut writer, resp).await?;
				continue;
			}
		};
		if let Some(resp) = handle_request(state, req).await {
			write_response(&mut writer, resp).await?;
		}
	}
	info!("input closed, shutting down");
	Ok(())
}

async fn handle_request(state: &ServerState, req: Request) -> Option<Response> {
	let Some(id) = req.id.clone() else {
		debug!(method = %req.method, "notification received");
		return None;
	};
	let tool_name = extract_tool_name(&req);
	let span = info_span!(
		"mcp.request",
		"mcp.session_id" = %state.session_id,
		"mcp.method" = %req.method,
		"mcp.tool_name" = tool_name.as_deref().unwrap_or(""),
		"mcp.is_error" = tracing::field::Empty,
		"mcp.error_code" = tracing::field::Empty,
		"mcp.response_bytes" = tracing::field::Empty,
	);
	let outcome = route(state, &req).instrument(span.clone()).await;
	Some(match outcome {
		Ok(value) => {
			record_result(&span, &value);
			Response::ok(id, value)
		}
		Err(err) => {
			span.record("mcp.is_error", true);
			Response::err(id, err.code, err.message)
		}
	})
}

async fn route(state: &ServerState, req: &Request) -> Result<Value, ProtocolError> {
	match req.method.as_str() {
		"initialize" => {
			let version = req.params
				.get("protocolVersion")
				.and_then(Value::as_str)
				.unwrap_or(PROTOCOL_VERSION);
			Ok(json!({
				"protocolVersion": version,
				"serverInfo": {
					"name": env!("CARGO_PKG_NAME"),
					"version": env!("CARGO_PKG_VERSION")
				},
				"capabilities": {
					"tools": {
						"listChanged": false
					}
				}
			}))
		}
		"ping" => Ok(json!({})),
		"tools/list" => Ok(json!({
			"tools": tool_definitions(state.tools.capabilities),
		})),
		"tools/call" => {
			let name = req.params
				.get("name")
				.and_then(Value::as_str)
				.ok_or_else(|| ProtocolError::new(protocol::INVALID_PARAMS, "name is required"))?;
			let arguments = req.params
				.get("arguments")
				.cloned()
				.unwrap_or_else(|| json!({}));
			execute_tool(&state.tools, name, arguments).await
		}
		_ => Err(ProtocolError::new(protocol::METHOD_NOT_FOUND, format!("method not found: {}", req.method))),
	}
}

/// Arguments are parsed into the handler's typed request before anything
/// touches the filesystem; a parse failure is a protocol error, not a tool error.
async fn execute_tool(ctx: &ToolContext, name: &str, arguments: Value) -> Result<Value, ProtocolError> {
	let result = match name {
		"read_file" => {
			let args: tools::ReadFileArgs = parse_args(arguments)?;
			run_tool(|| async { Ok(ToolOutput::text(tools::read_file(ctx, args).await?)) }).await
		}
		"read_multiple_files" => {
			let args: tools::ReadMultipleFilesArgs = parse_args(arguments)?;
			run_tool(
				|| async {
					let files = tools::read_multiple_files(ctx, args).await;
					ToolOutput::structured(&json!({
						"files": files
					}))
				}
			).await
		}
		"write_file" => {
			let args: tools::WriteFileArgs = parse_args(arguments)?;
			run_tool(|| async { Ok(ToolOutput::text(tools::write_file(ctx, args).await?)) }).await
		}
		"edit_file" => {
			let args: tools::EditFileArgs = parse_args(arguments)?;
			run_tool(
				|| async {
					let summary = tools::edit_file(ctx, args).await?;
					Ok(ToolOutput {
						text: summary.message.clone(),
						structured: Some(serde_json::to_value(&summary)?)
					})
				}
			).await
		}
		"create_directory" => {
			let args: tools::PathArgs = parse_args(arguments)?;
			run_tool(|| async { Ok(ToolOutput::text(tools::create_directory(ctx, args).await?)) }).await
		}
		"list_directory" => {
			let args: tools::ListDirectoryArgs = parse_args(arguments)?;
			run_tool(
				|| async {
					let entries = tools::list_directory(ctx, args).await?;
					ToolOutput::structured(&json!({
						"entries": entries
					}))
				}
			).await
		}
		"directory_tree" => {
			let args: tools::PathArgs = parse_args(arguments)?;
			run_tool(
				|| async {
					let tree = tools::directory_tree(ctx, args).await?;
					ToolOutput::structured(&json!({
						"tree": tree
					}))
				}
			).await
		}
		"move_file" => {
			let args: tools::MoveFileArgs = parse_args(arguments)?;
			run_tool(|| async { Ok(ToolOutput::text(tools::move_file(ctx, args).await?)) }).await
		}
		"search_files" => {
			let args: tools::SearchFilesArgs = parse_args(arguments)?;
			run_tool(
				|| async {
					let matches = tools::search_files(ctx, args).await?;
					Ok(ToolOutput {
						text: tools::format_matches(&matches),
						structured: Some(json!({
							"matches": matches
						}))
					})
				}
			).await
		}
		"get_file_info" => {
			let args: tools::PathArgs = parse_args(arguments)?;
			run_tool(|| async { ToolOutput::structured(&tools::get_file_info(ctx, args).await?) }).await
		}
		"list_allowed_directories" => {
			run_tool(
				|| async {
					let directories = tools::list_allowed_directories(ctx);
					Ok(ToolOutput {
						text: tools::format_allowed_directories(&directories),
						structured: Some(json!({
							"directories": directories
						}))
					})
				}
			).await
		}
		"read_pdf_file" => {
			let args: tools::ReadPdfFileArgs = parse_args(arguments)?;
			run_tool(|| async { ToolOutput::structured(&tools::read_pdf_file(ctx, args).await?) }).await
		}
		_ => return Err(ProtocolError::new(protocol::METHOD_NOT_FOUND, format!("unknown tool: {}", name))),
	};
	Ok(result)
}

fn parse_args<T: DeserializeOwned>(arguments: Value) -> Result<T, ProtocolError> {
	serde_json::from_value(arguments).map_err(|err| ProtocolError::new(protocol::INVALID_PARAMS, format!("invalid arguments: {}", err)))
}

async fn run_tool<F, Fut>(handler: F) -> Value
where
	F: FnOnce() -> Fut,
	Fut: std::future::Future<Output = Result<ToolOutput, ToolError>>, {
	match handler().await {
		Ok(output) => tool_success(output),
		Err(err) => tool_error(&err),
	}
}

fn tool_success(output: ToolOutput) -> Value {
	let mut result = json!({
		"content": [
			{
				"type": "text",
				"text": output.text
			}
		]
	});
	if let (Some(structured), Some(obj)) = (output.structured, result.as_object_mut()) {
		obj.insert("structuredContent".to_string(), structured);
	}
	result
}

fn tool_error(err: &ToolError) -> Value {
	json!({
		"isError": true,
		"structuredContent": {
			"code": err.code()
		},
		"content": [
			{
				"type": "text",
				"text": err.to_string()
			}
		]
	})
}

fn path_property(description: &str) -> Value {
	json!({
		"type": "string",
		"description": description
	})
}

fn tool(name: &str, description: &str, read_only: bool, properties: Value, required: &[&str]) -> Value {
	json!({
		"name": name,
		"description": description,
		"annotations": {
			"readOnlyHint": read_only
		},
		"inputSchema": {
			"type": "object",
			"properties": properties,
			"required": required
		}
	})
}

fn tool_definitions(capabilities: Capabilities) -> Vec<Value> {
	let mut definitions = vec![
		tool(
			"read_file",
			"Read a text file. Supports a byte offset, a byte length and any WHATWG encoding label.",
			true,
			json!({
				"path": path_property("File to read."),
				"offset": { "type": "integer", "minimum": 0, "default": 0, "description": "Byte offset to start reading from." },
				"length": { "type": "integer", "minimum": 1, "description": "Maximum number of bytes to read. Reads to EOF when omitted." },
				"encoding": { "type": "string", "default": "utf-8", "description": "Text encoding, e.g. utf-8 or latin-1." }
			}),
			&["path"]
		),
		tool(
			"read_multiple_files",
			"Read several files at once. A failure on one path is reported next to it and does not stop the others.",
			true,
			json!({
				"paths": { "type": "array", "items": { "type": "string" } }
			}),
			&["paths"]
		),
		tool(
			"write_file",
			"Create or overwrite a file, or append to it. Missing parent directories are created.",
			false,
			json!({
				"path": path_property("File to write."),
				"content": { "type": "string" },
				"mode": { "type": "string", "enum": ["overwrite", "append"], "default": "overwrite" }
			}),
			&["path", "content"]
		),
		tool(
			"edit_file",
			"Replace exact text in a file and return a unified diff. Edits whose oldText is absent are skipped.",
			false,
			json!({
				"path": path_property("File to edit."),
				"edits": {
					"type": "array",
					"items": {
						"type": "object",
						"properties": {
							"oldText": { "type": "string", "description": "Text to search for; must match exactly." },
							"newText": { "type": "string", "description": "Replacement text." }
						},
						"required": ["oldText", "newText"]
					}
				},
				"dryRun": { "type": "boolean", "default": false, "description": "Preview the diff without writing." }
			}),
			&["path", "edits"]
		),
		tool(
			"create_directory",
			"Create a directory and any missing parents. Succeeds if it already exists.",
			false,
			json!({
				"path": path_property("Directory to create.")
			}),
			&["path"]
		),
		tool(
			"list_directory",
			"List the entries of a directory with type, size and modification time.",
			true,
			json!({
				"path": path_property("Directory to list."),
				"show_hidden": { "type": "boolean", "default": false, "description": "Include entries starting with '.'." },
				"pattern": { "type": "string", "description": "Case-insensitive glob or name suffix, e.g. '*.txt'." }
			}),
			&["path"]
		),
		tool(
			"directory_tree",
			"Recursive tree of a directory. Entries resolving outside the allowed directories are left out.",
			true,
			json!({
				"path": path_property("Directory at the top of the tree.")
			}),
			&["path"]
		),
		tool(
			"move_file",
			"Move or rename a file or directory. Fails if the destination exists.",
			false,
			json!({
				"source": path_property("Existing path to move."),
				"destination": path_property("New path; must not exist.")
			}),
			&["source", "destination"]
		),
		tool(
			"search_files",
			"Recursively find entries whose name contains the pattern, case-insensitively.",
			true,
			json!({
				"path": path_property("Directory to search from."),
				"pattern": { "type": "string" },
				"excludePatterns": { "type": "array", "items": { "type": "string" }, "default": [], "description": "Globs matched against entry names and paths relative to the search root." }
			}),
			&["path", "pattern"]
		),
		tool(
			"get_file_info",
			"Size, timestamps, type, permissions and MIME type of a path.",
			true,
			json!({
				"path": path_property("Path to inspect.")
			}),
			&["path"]
		),
		tool(
			"list_allowed_directories",
			"List the directories this server may access.",
			true,
			json!({}),
			&[]
		),
	];
	if capabilities.pdf {
		definitions.push(tool(
			"read_pdf_file",
			"Extract text from a PDF, page by page. Page numbers are 1-based.",
			true,
			json!({
				"path": path_property("PDF file to read."),
				"page_numbers": { "type": "array", "items": { "type": "integer", "minimum": 1 }, "description": "Pages to extract; all pages when omitted." }
			}),
			&["path"]
		));
	}
	definitions
}

fn extract_tool_name(req: &Request) -> Option<String> {
	if req.method != "tools/call" {
		return None;
	}
	req.params
		.get("name")
		.and_then(Value::as_str)
		.map(|value| value.to_string())
}

fn record_result(span: &Span, result: &Value) {
	let response_bytes = serde_json::to_string(result).map(|value| value.len() as u64).ok();
	if let Some(bytes) = response_bytes {
		span.record("mcp.response_bytes", bytes);
	}
	let is_error = result.get("isError")
		.and_then(Value::as_bool)
		.unwrap_or(false);
	span.record("mcp.is_error", is_error);
	if !is_error {
		return;
	}
	if let Some(code) = result.get("structuredContent")
		.and_then(|value| value.get("code"))
		.and_then(Value::as_str) {
		span.record("mcp.error_code", code);
	}
}

async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, resp: Response) -> Result<()> {
	let line = serde_json::to_string(&resp)?;
	writer.write_all(line.as_bytes()).await?;
	writer.write_all(b"\n").await?;
	writer.flush().await?;
	Ok(())
}
