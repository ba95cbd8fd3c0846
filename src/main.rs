mod config;
mod error;
mod fs;
mod pdf;
mod protocol;
mod resolver;
mod roots;
mod server;
mod tools;

use anyhow::Result;
use fs::Capabilities;
use resolver::Resolver;
use roots::AllowedRoots;
use server::ServerState;
use std::sync::Arc;
use tools::ToolContext;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
	let config = config::load_config()?;
	config::init_tracing(&config);
	let roots = match AllowedRoots::initialize(&config.allowed_directories) {
		Ok(roots) => roots,
		Err(err) => {
			error!(error = %err, "failed to initialize allowed directories");
			opentelemetry::global::shutdown_tracer_provider();
			std::process::exit(1);
		}
	};
	let capabilities = Capabilities::detect();
	info!(
		session_id = %config.session_id,
		pdf = capabilities.pdf,
		"starting filesystem server"
	);
	let tools = ToolContext::new(Resolver::new(Arc::new(roots)), capabilities);
	let result = server::run(ServerState::new(tools, config.session_id.clone())).await;
	opentelemetry::global::shutdown_tracer_provider();
	result
}
