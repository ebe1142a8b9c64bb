use anyhow::Result;
use runscope::logging;
use runscope_server::RunscopeServer;
use tracing::info;

use crate::args::ServeArgs;

pub async fn start_server(args: &ServeArgs) -> Result<()> {
    let log_dir = args.logging.log_dir()?;
    let log_path = log_dir.join("runscope_server.log");
    match &args.logging.log_filter {
        Some(filter) => {
            logging::setup_global_logging_with_filter(&log_path, filter, args.log_stdout)?
        }
        None => logging::setup_global_logging(&log_path, &args.logging.level(), args.log_stdout)?,
    }

    let config = args.config()?;
    info!("Starting runscope server on {}", config.server_address);
    info!("Serving runs from {:?}", config.samples_root);
    info!("Logging to directory: {:?}", log_dir);

    let server = RunscopeServer::new(&config).await?;
    server.run().await?;

    Ok(())
}
