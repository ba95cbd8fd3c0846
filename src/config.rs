use anyhow::{anyhow, Context, Result};
use clap::Parser;
use opentelemetry::global;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace as sdktrace;
use opentelemetry_semantic_conventions::resource as semconv;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::Subscriber;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_OTEL_ENDPOINT: &str = "http://127.0.0.1:4317";

#[derive(Debug, Parser)]
#[command(name = "secure-fs-mcp", version, about = "MCP filesystem server confined to a set of allowed directories")]
pub struct Cli {
	/// Directories the server may access.
	#[arg(value_name = "ALLOWED_DIRECTORY")]
	pub allowed_directories: Vec<String>,

	/// Enable debug logging.
	#[arg(short, long)]
	pub verbose: bool,

	/// JSON config file.
	#[arg(long, env = "MCP_CONFIG")]
	pub config: Option<PathBuf>,

	#[arg(long, env = "MCP_OTEL_ENABLED", value_parser = parse_bool, num_args = 0..=1, default_missing_value = "true")]
	pub otel_enabled: Option<bool>,

	#[arg(long, env = "MCP_OTEL_ENDPOINT")]
	pub otel_endpoint: Option<String>,

	#[arg(long, env = "MCP_OTEL_SERVICE_NAME")]
	pub otel_service_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
	allowed_directories: Vec<String>,
	verbose: Option<bool>,
	otel_enabled: Option<bool>,
	otel_endpoint: Option<String>,
	otel_service_name: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Config {
	pub allowed_directories: Vec<String>,
	pub verbose: bool,
	pub otel_enabled: bool,
	pub otel_endpoint: String,
	pub otel_service_name: String,
	pub session_id: String,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			allowed_directories: Vec::new(),
			verbose: false,
			otel_enabled: false,
			otel_endpoint: DEFAULT_OTEL_ENDPOINT.to_string(),
			otel_service_name: env!("CARGO_PKG_NAME").to_string(),
			session_id: uuid::Uuid::new_v4().to_string()
		}
	}
}

pub fn load_config() -> Result<Config> {
	let cli = Cli::parse();
	let env_roots = std::env::var("MCP_ALLOWED_ROOTS").ok();
	resolve(cli, env_roots.as_deref())
}

/// Later layers win: defaults, config file, environment, command line.
/// Directory lists are concatenated in that order instead.
pub fn resolve(cli: Cli, env_roots: Option<&str>) -> Result<Config> {
	let mut config = Config::default();
	if let Some(path) = &cli.config {
		apply_file(&mut config, load_file(path)?);
	}
	config.allowed_directories.extend(split_roots(env_roots));
	config.allowed_directories.extend(cli.allowed_directories);
	config.verbose = config.verbose || cli.verbose;
	if let Some(enabled) = cli.otel_enabled {
		config.otel_enabled = enabled;
	}
	if let Some(endpoint) = cli.otel_endpoint.filter(|value| !value.trim().is_empty()) {
		config.otel_endpoint = endpoint;
	}
	if let Some(name) = cli.otel_service_name.filter(|value| !value.trim().is_empty()) {
		config.otel_service_name = name;
	}
	Ok(config)
}

fn load_file(path: &Path) -> Result<FileConfig> {
	let content = std::fs::read_to_string(path)
		.with_context(|| format!("failed to read config {}", path.display()))?;
	serde_json::from_str(&content).with_context(|| format!("failed to parse config {}", path.display()))
}

fn apply_file(config: &mut Config, file: FileConfig) {
	config.allowed_directories.extend(file.allowed_directories);
	if let Some(verbose) = file.verbose {
		config.verbose = verbose;
	}
	if let Some(enabled) = file.otel_enabled {
		config.otel_enabled = enabled;
	}
	if let Some(endpoint) = file.otel_endpoint {
		config.otel_endpoint = endpoint;
	}
	if let Some(name) = file.otel_service_name {
		config.otel_service_name = name;
	}
}

fn split_roots(raw: Option<&str>) -> Vec<String> {
	raw.map(
		|value| {
			value.split(',')
				.map(str::trim)
				.filter(|root| !root.is_empty())
				.map(str::to_string)
				.collect()
		}
	)
		.unwrap_or_default()
}

fn parse_bool(value: &str) -> Result<bool> {
	match value.trim().to_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Ok(true),
		"0" | "false" | "no" | "off" => Ok(false),
		other => Err(anyhow!("expected a boolean, got '{}'", other)),
	}
}

/// Logs go to stderr; stdout carries the protocol.
pub fn init_tracing(config: &Config) {
	let _ = global::set_error_handler(|_| {});
	let filter = if config.verbose {
		EnvFilter::new("debug")
	}
	else {
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
	};
	let otel_layer = build_otel_layer(config);
	let fmt_layer = tracing_subscriber::fmt::layer()
		.with_writer(std::io::stderr)
		.with_target(false);
	tracing_subscriber::registry()
		.with(filter)
		.with(fmt_layer)
		.with(otel_layer)
		.init();
}

/// OTLP export layer, when enabled. `install_batch` also registers the
/// global provider flushed at shutdown.
fn build_otel_layer<S>(config: &Config) -> Option<OpenTelemetryLayer<S, sdktrace::Tracer>>
where
	S: Subscriber + for<'span> LookupSpan<'span>, {
	if !config.otel_enabled {
		return None;
	}
	let resource = Resource::new(
		vec![
		KeyValue::new(semconv::SERVICE_NAME, config.otel_service_name.clone()),
		KeyValue::new(semconv::SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
		KeyValue::new("mcp.session_id", config.session_id.clone()),
		]
	);
	let exporter = opentelemetry_otlp::new_exporter().tonic().with_endpoint(config.otel_endpoint.clone());
	opentelemetry_otlp::new_pipeline()
		.tracing()
		.with_exporter(exporter)
		.with_trace_config(sdktrace::Config::default().with_resource(resource))
		.install_batch(opentelemetry_sdk::runtime::Tokio)
		.ok()
		.map(OpenTelemetryLayer::new)
}
