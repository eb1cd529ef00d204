//! Conclave CLI entry point.

use clap::Parser;

use conclave::cli::output::{emit, emit_error};
use conclave::cli::{run, AppContext, Cli};
use conclave::infrastructure::logging::{LogConfig, LoggerImpl};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let ctx = match AppContext::load(cli.config.as_ref(), cli.state_dir.as_ref()) {
        Ok(ctx) => ctx,
        Err(err) => std::process::exit(emit_error(&err)),
    };
    let logger = match LoggerImpl::init(&LogConfig::from(&ctx.config.logging)) {
        Ok(logger) => logger,
        Err(err) => std::process::exit(emit_error(&err)),
    };

    let code = match run(cli, &ctx).await {
        Ok(output) => emit(&output),
        Err(err) => {
            tracing::error!(error = %err, "command failed");
            emit_error(&err)
        }
    };
    // Flush buffered file logs before exiting.
    drop(logger);
    std::process::exit(code);
}
