/// Flowline: multi-tenant workflow execution worker
///
/// Main entry point for the Flowline worker. Initializes configuration and runs
/// the queue-driven execution pipeline until Ctrl-C.

use flowline::{config::Config, worker::start_worker};

/// Application entry point
///
/// The worker:
/// - Loads workflow definitions from `FLOWLINE_WORKFLOWS_DIR`
/// - Publishes execution requests read as JSON lines from stdin
/// - Consumes and executes them with a bounded worker pool
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration (defaults overridable through FLOWLINE_* variables)
    let config = Config::default();

    // Run the worker
    start_worker(config).await?;

    Ok(())
}
