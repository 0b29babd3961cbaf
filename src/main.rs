use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use inference_serving::config::InferenceConfiguration;
use inference_serving::logging::init_logging;
use inference_serving::pipeline::executor::PipelineExecutor;
use inference_serving::runtime::RuntimeRegistry;
use inference_serving::server::{start_server, AppState};

#[derive(Parser)]
#[command(name = "inference_serving")]
#[command(about = "Inference pipeline server")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the configured pipeline and serve it over HTTP
    Serve {
        /// Path to the pipeline configuration (.json or .toml)
        #[arg(long)]
        config: PathBuf,
        /// Override the configured HTTP port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Validate a pipeline configuration without serving
    ValidateConfig {
        /// Path to the pipeline configuration (.json or .toml)
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, port } => {
            let mut configuration = InferenceConfiguration::load(&config)?;
            configuration.validate()?;
            if let Some(port) = port {
                configuration.serving.http_port = port;
            }

            let registry = RuntimeRegistry::with_builtins();
            let executor = PipelineExecutor::build(&configuration.steps, &registry)?;
            info!(
                steps = executor.step_count(),
                port = configuration.serving.http_port,
                "pipeline compiled"
            );

            let state = Arc::new(AppState {
                executor,
                serving: configuration.serving.clone(),
            });
            start_server(state).await?;
        }
        Commands::ValidateConfig { config } => {
            let configuration = InferenceConfiguration::load(&config)?;
            configuration.validate()?;
            // A full build catches errors validation alone cannot, e.g.
            // unreadable script files and unregistered backend kinds.
            let registry = RuntimeRegistry::with_builtins();
            let executor = PipelineExecutor::build(&configuration.steps, &registry)?;
            executor.close().await?;
            println!("✅ Configuration is valid ({} steps)", configuration.steps.len());
        }
    }

    Ok(())
}
