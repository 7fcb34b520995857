use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use sidekiq_cluster::app;
use sidekiq_cluster::cli::Cli;
use sidekiq_cluster::config::RuntimeEnv;
use sidekiq_cluster::errors::{CommandError, QueryError};
use sidekiq_cluster::logging::{init_tracing, LogFormat};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    init_tracing(LogFormat::from_env());

    let cli = Cli::parse();
    let result = match RuntimeEnv::load() {
        Ok(runtime) => app::run(cli, runtime).await,
        Err(err) => Err(err),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if let Some(command_error) = err.downcast_ref::<CommandError>() {
                eprintln!("{command_error}");
            } else if let Some(query_error) = err.downcast_ref::<QueryError>() {
                eprintln!("Invalid queue selector: {query_error}");
            } else {
                error!("{err:#}");
            }
            ExitCode::FAILURE
        }
    }
}
