use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

const BIN: &str = env!("CARGO_BIN_EXE_secure-fs-mcp");

struct RpcClient {
	child: Child,
	stdin: ChildStdin,
	stdout: BufReader<ChildStdout>,
	next_id: u64,
}

impl RpcClient {
	fn spawn(roots: &[&Path]) -> Self {
		let mut child = Command::new(BIN)
			.args(roots)
			.env_remove("MCP_CONFIG")
			.env_remove("MCP_ALLOWED_ROOTS")
			.env_remove("MCP_OTEL_ENABLED")
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::null())
			.spawn()
			.expect("spawn secure-fs-mcp");
		let stdin = child.stdin
			.take()
			.expect("stdin");
		let stdout = child.stdout
			.take()
			.expect("stdout");
		Self {
			child,
			stdin,
			stdout: BufReader::new(stdout),
			next_id: 1
		}
	}

	fn send(&mut self, method: &str, params: Value) -> Value {
		let id = self.next_id;
		self.next_id += 1;
		let req = json!({
			"jsonrpc": "2.0",
			"id": id,
			"method": method,
			"params": params
		});
		let line = serde_json::to_string(&req).expect("serialize request");
		writeln!(self.stdin, "{}", line).expect("write request");
		self.stdin
			.flush()
			.expect("flush request");
		let mut resp_line = String::new();
		loop {
			resp_line.clear();
			let bytes = self.stdout
				.read_line(&mut resp_line)
				.expect("read response");
			if bytes == 0 {
				panic!("secure-fs-mcp exited unexpectedly");
			}
			let trimmed = resp_line.trim();
			if trimmed.is_empty() {
				continue;
			}
			let parsed: Value = match serde_json::from_str(trimmed) {
				Ok(value) => value,
				Err(_) => continue,
			};
			if parsed.get("id").and_then(Value::as_u64) == Some(id) {
				return parsed;
			}
		}
	}

	fn call(&mut self, name: &str, arguments: Value) -> Value {
		let resp = self.send("tools/call", json!({
			"name": name,
			"arguments": arguments
		}));
		resp.get("result")
			.cloned()
			.unwrap_or_else(|| panic!("expected result, got {}", resp))
	}
}

impl Drop for RpcClient {
	fn drop(&mut self) {
		let _ = self.child.kill();
		let _ = self.child.wait();
	}
}

struct Workspace {
	_dir: tempfile::TempDir,
	outer: PathBuf,
	root: PathBuf,
}

impl Workspace {
	fn new() -> Self {
		let dir = tempfile::tempdir().expect("tempdir");
		let outer = std::fs::canonicalize(dir.path()).expect("canonicalize");
		let root = outer.join("sandbox");
		std::fs::create_dir(&root).expect("create sandbox");
		Self {
			_dir: dir,
			outer,
			root
		}
	}

	fn path(&self, rel: &str) -> String {
		self.root.join(rel).display().to_string()
	}

	fn write(&self, rel: &str, contents: &str) {
		let full = self.root.join(rel);
		if let Some(parent) = full.parent() {
			std::fs::create_dir_all(parent).expect("create parent");
		}
		std::fs::write(full, contents).expect("write file");
	}

	fn read(&self, rel: &str) -> String {
		std::fs::read_to_string(self.root.join(rel)).expect("read file")
	}

	fn client(&self) -> RpcClient {
		RpcClient::spawn(&[&self.root])
	}
}

fn text(result: &Value) -> &str {
	result["content"][0]["text"].as_str().expect("text content")
}

fn error_code(result: &Value) -> Option<&str> {
	if result.get("isError").and_then(Value::as_bool) != Some(true) {
		return None;
	}
	result["structuredContent"]["code"].as_str()
}

#[test]
fn initialize_reports_server_info() {
	let ws = Workspace::new();
	let mut client = ws.client();
	let resp = client.send("initialize", json!({
		"protocolVersion": "2024-11-05",
		"capabilities": {},
		"clientInfo": { "name": "test", "version": "0" }
	}));
	assert_eq!(resp["result"]["serverInfo"]["name"], "secure-fs-mcp");
	assert!(resp["result"]["capabilities"]["tools"].is_object());
	let list = client.send("tools/list", json!({}));
	let tools = list["result"]["tools"].as_array().expect("tools");
	assert!(tools.iter().any(|tool| tool["name"] == "edit_file"));
	assert!(tools.iter().all(|tool| tool["inputSchema"]["type"] == "object"));
}

#[test]
fn read_file_with_offset_and_length() {
	let ws = Workspace::new();
	ws.write("sample.txt", "0123456789");
	let mut client = ws.client();
	let result = client.call("read_file", json!({ "path": ws.path("sample.txt"), "offset": 2, "length": 4 }));
	assert_eq!(error_code(&result), None);
	assert_eq!(text(&result), "2345");
	let result = client.call("read_file", json!({ "path": ws.path("sample.txt") }));
	assert_eq!(text(&result), "0123456789");
}

#[test]
fn read_file_rejects_zero_length_before_touching_disk() {
	let ws = Workspace::new();
	let mut client = ws.client();
	let resp = client.send("tools/call", json!({
		"name": "read_file",
		"arguments": { "path": ws.path("sample.txt"), "length": 0 }
	}));
	assert_eq!(resp["error"]["code"], -32602);
}

#[test]
fn escape_and_missing_are_distinct_failures() {
	let ws = Workspace::new();
	std::fs::write(ws.outer.join("secret.txt"), "secret").expect("write secret");
	let mut client = ws.client();
	let outside = client.call("read_file", json!({ "path": format!("{}/../secret.txt", ws.root.display()) }));
	assert_eq!(error_code(&outside), Some("OUTSIDE_ALLOWED_AREA"));
	assert!(!text(&outside).contains("secret\n"));
	let missing = client.call("read_file", json!({ "path": ws.path("missing.txt") }));
	assert_eq!(error_code(&missing), Some("NOT_FOUND"));
	assert_ne!(text(&outside), text(&missing));
}

#[test]
fn write_nested_then_append_round_trips() {
	let ws = Workspace::new();
	let mut client = ws.client();
	let result = client.call("write_file", json!({ "path": ws.path("a/b/c/notes.txt"), "content": "hello\n" }));
	assert_eq!(error_code(&result), None);
	assert!(text(&result).starts_with("Successfully wrote to"));
	let result = client.call("write_file", json!({ "path": ws.path("a/b/c/notes.txt"), "content": "world\n", "mode": "append" }));
	assert!(text(&result).starts_with("Successfully appended to"));
	let read = client.call("read_file", json!({ "path": ws.path("a/b/c/notes.txt") }));
	assert_eq!(text(&read), "hello\nworld\n");
}

#[test]
fn write_outside_root_is_refused() {
	let ws = Workspace::new();
	let mut client = ws.client();
	let target = ws.outer.join("x/newfile.txt");
	let result = client.call("write_file", json!({ "path": target.display().to_string(), "content": "nope" }));
	assert_eq!(error_code(&result), Some("OUTSIDE_ALLOWED_AREA"));
	assert!(!target.exists());
}

#[test]
fn edit_file_skips_unmatched_and_supports_dry_run() {
	let ws = Workspace::new();
	ws.write("config.ini", "name = old\nmode = fast\n");
	let mut client = ws.client();
	let preview = client.call("edit_file", json!({
		"path": ws.path("config.ini"),
		"edits": [{ "oldText": "name = old", "newText": "name = new" }],
		"dryRun": true
	}));
	assert!(text(&preview).starts_with("Dry run. Proposed changes:\n```diff\n"));
	assert_eq!(preview["structuredContent"]["applied"], false);
	assert_eq!(ws.read("config.ini"), "name = old\nmode = fast\n");

	let applied = client.call("edit_file", json!({
		"path": ws.path("config.ini"),
		"edits": [
			{ "oldText": "not present", "newText": "ignored" },
			{ "oldText": "mode = fast", "newText": "mode = slow" }
		]
	}));
	assert_eq!(error_code(&applied), None);
	assert!(text(&applied).starts_with("File edited. Changes:\n"));
	let diff = applied["structuredContent"]["diff"].as_str().expect("diff");
	assert!(diff.contains("-mode = fast"));
	assert!(diff.contains("+mode = slow"));
	assert_eq!(ws.read("config.ini"), "name = old\nmode = slow\n");
}

#[test]
fn create_directory_twice_succeeds() {
	let ws = Workspace::new();
	let mut client = ws.client();
	for _ in 0..2 {
		let result = client.call("create_directory", json!({ "path": ws.path("x/y/z") }));
		assert_eq!(error_code(&result), None);
	}
	assert!(ws.root.join("x/y/z").is_dir());
}

#[test]
fn list_directory_hides_dotfiles_and_filters() {
	let ws = Workspace::new();
	ws.write("a.txt", "a");
	ws.write(".b.txt", "b");
	ws.write("c.md", "c");
	let mut client = ws.client();
	let result = client.call("list_directory", json!({ "path": ws.path(""), "pattern": "*.txt", "show_hidden": false }));
	let entries = result["structuredContent"]["entries"].as_array().expect("entries");
	let names: Vec<&str> = entries.iter().filter_map(|entry| entry["name"].as_str()).collect();
	assert_eq!(names, vec!["a.txt"]);
	assert_eq!(entries[0]["type"], "file");
	assert_eq!(entries[0]["size"], 1);
	assert!(entries[0]["error"].is_null());
}

#[test]
fn list_directory_on_file_is_not_a_directory() {
	let ws = Workspace::new();
	ws.write("a.txt", "a");
	let mut client = ws.client();
	let result = client.call("list_directory", json!({ "path": ws.path("a.txt") }));
	assert_eq!(error_code(&result), Some("NOT_A_DIRECTORY"));
}

#[cfg(unix)]
#[test]
fn directory_tree_skips_links_leaving_the_root() {
	let ws = Workspace::new();
	ws.write("src/main.rs", "fn main() {}\n");
	std::os::unix::fs::symlink(&ws.outer, ws.root.join("escape")).expect("symlink");
	let mut client = ws.client();
	let result = client.call("directory_tree", json!({ "path": ws.path("") }));
	let tree = result["structuredContent"]["tree"].as_array().expect("tree");
	assert_eq!(tree.len(), 1);
	assert_eq!(tree[0]["name"], "src");
	assert_eq!(tree[0]["type"], "directory");
	assert_eq!(tree[0]["children"][0]["name"], "main.rs");
	assert!(tree[0]["children"][0]["children"].is_null());
}

#[test]
fn move_file_refuses_existing_destination_then_moves() {
	let ws = Workspace::new();
	ws.write("from.txt", "payload");
	ws.write("taken.txt", "already here");
	let mut client = ws.client();
	let result = client.call("move_file", json!({ "source": ws.path("from.txt"), "destination": ws.path("taken.txt") }));
	assert_eq!(error_code(&result), Some("ALREADY_EXISTS"));
	assert_eq!(ws.read("taken.txt"), "already here");
	let result = client.call("move_file", json!({ "source": ws.path("from.txt"), "destination": ws.path("moved/to.txt") }));
	assert_eq!(error_code(&result), None);
	assert!(text(&result).starts_with("Successfully moved"));
	assert!(!ws.root.join("from.txt").exists());
	assert_eq!(ws.read("moved/to.txt"), "payload");
}

#[test]
fn search_files_honors_excludes() {
	let ws = Workspace::new();
	ws.write("docs/Report-2024.md", "");
	ws.write("build/report.tmp", "");
	let mut client = ws.client();
	let result = client.call("search_files", json!({
		"path": ws.path(""),
		"pattern": "report",
		"excludePatterns": ["build/*"]
	}));
	assert_eq!(text(&result), ws.path("docs/Report-2024.md"));
	let result = client.call("search_files", json!({ "path": ws.path(""), "pattern": "zzz" }));
	assert_eq!(text(&result), "No matches found");
}

#[test]
fn get_file_info_reports_metadata() {
	let ws = Workspace::new();
	ws.write("data.json", "{}");
	let mut client = ws.client();
	let result = client.call("get_file_info", json!({ "path": ws.path("data.json") }));
	let info = &result["structuredContent"];
	assert_eq!(info["size"], 2);
	assert_eq!(info["isFile"], true);
	assert_eq!(info["isDirectory"], false);
	assert_eq!(info["mimeType"], "application/json");
	assert_eq!(info["path"], ws.path("data.json"));
	assert_eq!(info["permissions"].as_str().map(str::len), Some(9));
	for field in ["created", "modified", "accessed"] {
		assert!(info[field].as_str().map(|value| !value.is_empty()).unwrap_or(false), "{}", field);
	}
}

#[test]
fn list_allowed_directories_and_multi_read() {
	let ws = Workspace::new();
	ws.write("one.txt", "1");
	let mut client = ws.client();
	let result = client.call("list_allowed_directories", json!({}));
	assert_eq!(text(&result), format!("Allowed directories:\n{}", ws.root.display()));
	let result = client.call("read_multiple_files", json!({ "paths": [ws.path("one.txt"), ws.path("two.txt")] }));
	let files = result["structuredContent"]["files"].as_array().expect("files");
	assert_eq!(files[0]["content"], "1");
	assert!(files[0]["error"].is_null());
	assert!(files[1]["content"].is_null());
	assert!(files[1]["error"].as_str().unwrap_or_default().starts_with("Path does not exist"));
}

#[cfg(feature = "pdf")]
#[test]
fn corrupted_pdf_is_reported() {
	let ws = Workspace::new();
	ws.write("broken.pdf", "definitely not a pdf");
	let mut client = ws.client();
	let result = client.call("read_pdf_file", json!({ "path": ws.path("broken.pdf") }));
	assert_eq!(error_code(&result), Some("PDF_ERROR"));
	assert!(text(&result).starts_with("Invalid or corrupted PDF file"));
}

#[test]
fn startup_fails_without_valid_directories() {
	let status = Command::new(BIN)
		.env_remove("MCP_CONFIG")
		.env_remove("MCP_ALLOWED_ROOTS")
		.stdin(Stdio::null())
		.stdout(Stdio::null())
		.stderr(Stdio::null())
		.status()
		.expect("run secure-fs-mcp");
	assert!(!status.success());
	let ws = Workspace::new();
	let status = Command::new(BIN)
		.arg(ws.root.join("does-not-exist"))
		.env_remove("MCP_CONFIG")
		.env_remove("MCP_ALLOWED_ROOTS")
		.stdin(Stdio::null())
		.stdout(Stdio::null())
		.stderr(Stdio::null())
		.status()
		.expect("run secure-fs-mcp");
	assert_eq!(status.code(), Some(1));
}
