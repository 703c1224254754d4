use calcflow_core::OperationKind;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "calcflow")]
#[command(about = "calcflow: cached, audited arithmetic with an event stream")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (overrides CALCFLOW_CONFIG)
    #[arg(short, long, global = true)]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one operation through the pipeline
    Compute(ComputeArgs),
    /// Register a requester and print a bearer token for it
    Token(TokenArgs),
    /// List audit records, newest first
    History(HistoryArgs),
    /// Consume the event stream until Ctrl-C
    Consume(ConsumeArgs),
}

#[derive(clap::Args)]
pub struct ComputeArgs {
    /// fibonacci, factorial or power
    pub operation: OperationKind,
    /// Operands (power takes base and exponent)
    #[arg(required = true, allow_hyphen_values = true)]
    pub operands: Vec<String>,
    /// Bearer token identifying the requester
    #[arg(short, long, env = "CALCFLOW_TOKEN")]
    pub token: String,
    /// Register the token's subject first (for the in-memory audit store)
    #[arg(long)]
    pub register: bool,
}

#[derive(clap::Args)]
pub struct TokenArgs {
    /// Requester name
    pub username: String,
}

#[derive(clap::Args)]
pub struct HistoryArgs {
    /// Only records of this requester
    #[arg(short, long)]
    pub requester: Option<String>,
    /// Only records of this operation
    #[arg(short, long)]
    pub operation: Option<OperationKind>,
    /// Maximum number of records
    #[arg(short, long)]
    pub limit: Option<usize>,
}

#[derive(clap::Args)]
pub struct ConsumeArgs {
    /// Log the buffer size every N seconds
    #[arg(long)]
    pub print_every: Option<u64>,
}
