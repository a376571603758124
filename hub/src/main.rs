use anyhow::Result;
use clap::Parser;

mod agent_rpc;
mod args;
mod cache;
mod channel;
mod cli;
mod client;
mod error;
mod handlers;
mod models;
mod orchestrator;
mod queue;
mod registry;
mod server;
mod session;
mod store;

pub mod proto {
    pub mod agent {
        tonic::include_proto!("agent");
    }
}

use args::{Cli, ClustersCommands, Commands, OperationsCommands};
use server::run_server;

#[tokio::main]
async fn main() -> Result<()> {
    armada_common::init();

    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server(args) => {
            armada_common::metrics::maybe_spawn_metrics_server("armada-hub");
            run_server(args).await
        }
        Commands::Health(args) => cli::run_health(args).await,
        Commands::Clusters(args) => match args.command {
            ClustersCommands::List(args) => cli::run_list_clusters(args).await,
            ClustersCommands::Get(args) => cli::run_get_cluster(args).await,
        },
        Commands::Operations(args) => match args.command {
            OperationsCommands::Get(args) => cli::run_get_operation(args).await,
            OperationsCommands::Cancel(args) => cli::run_cancel_operation(args).await,
        },
    }
}
