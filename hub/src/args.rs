use armada_common::args::{PostgresArgs, RedisArgs};
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "armada-hub")]
#[command(about = "Multi-cluster Kubernetes management hub")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the hub server
    Server(ServerArgs),

    /// Check hub health
    Health(HealthArgs),

    /// Cluster inspection
    Clusters(ClustersCommandArgs),

    /// Operation inspection
    Operations(OperationsCommandArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreBackend {
    /// Relational store (production)
    Postgres,
    /// Process-local store for development; lost on restart
    Memory,
}

#[derive(Parser, Debug, Clone)]
pub struct ServerArgs {
    /// HTTP API port
    #[arg(long, env = "HTTP_PORT", default_value_t = 8080)]
    pub http_port: u16,

    /// Agent gRPC port
    #[arg(long, env = "GRPC_PORT", default_value_t = 9090)]
    pub grpc_port: u16,

    /// Dispatch worker pool size
    #[arg(long, env = "WORKERS", default_value_t = 5)]
    pub workers: usize,

    /// Heartbeat interval handed to agents, in seconds
    #[arg(long, env = "HEARTBEAT_INTERVAL", default_value_t = 30)]
    pub heartbeat_interval: u32,

    /// Outbound buffer per agent channel
    #[arg(long, env = "CHANNEL_CAPACITY", default_value_t = 64)]
    pub channel_capacity: usize,

    /// Queued-operation bound per cluster
    #[arg(long, env = "QUEUE_DEPTH", default_value_t = 256)]
    pub queue_depth: usize,

    /// Timeout for operations submitted over HTTP, in seconds
    #[arg(long, env = "DEFAULT_TIMEOUT_SECONDS", default_value_t = 300)]
    pub default_timeout_seconds: i64,

    /// Store backend
    #[arg(long, env = "STORE", value_enum, default_value_t = StoreBackend::Postgres)]
    pub store: StoreBackend,

    /// Run without the Redis cache
    #[arg(long, env = "NO_CACHE", default_value_t = false)]
    pub no_cache: bool,

    #[clap(flatten)]
    pub postgres: PostgresArgs,

    #[clap(flatten)]
    pub redis: RedisArgs,
}

#[derive(Parser, Debug, Clone)]
pub struct HealthArgs {
    /// Hub HTTP endpoint
    #[arg(long, env = "HUB_ENDPOINT")]
    pub endpoint: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct ClustersCommandArgs {
    #[command(subcommand)]
    pub command: ClustersCommands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ClustersCommands {
    /// List registered clusters
    List(ListClustersArgs),
    /// Get one cluster by id
    Get(GetClusterArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct ListClustersArgs {
    /// Hub HTTP endpoint
    #[arg(long, env = "HUB_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Offset for pagination
    #[arg(long, default_value_t = 0)]
    pub offset: i64,

    /// Maximum number of clusters to return
    #[arg(long, default_value_t = 20)]
    pub limit: i64,
}

#[derive(Parser, Debug, Clone)]
pub struct GetClusterArgs {
    /// Hub HTTP endpoint
    #[arg(long, env = "HUB_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Cluster UUID
    #[arg(long)]
    pub id: String,

    /// Also list the cluster's most recent operations
    #[arg(long, default_value_t = false)]
    pub operations: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct OperationsCommandArgs {
    #[command(subcommand)]
    pub command: OperationsCommands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum OperationsCommands {
    /// Get one operation by id
    Get(GetOperationArgs),
    /// Cancel a non-terminal operation
    Cancel(CancelOperationArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct GetOperationArgs {
    /// Hub HTTP endpoint
    #[arg(long, env = "HUB_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Operation UUID
    #[arg(long)]
    pub id: String,
}

#[derive(Parser, Debug, Clone)]
pub struct CancelOperationArgs {
    /// Hub HTTP endpoint
    #[arg(long, env = "HUB_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Operation UUID
    #[arg(long)]
    pub id: String,
}
