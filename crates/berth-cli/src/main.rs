use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "berth",
    about = "Berth — VM placement for a compute cluster",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Choose a server for a VM from a cluster snapshot.
    ///
    /// The request file holds `servers`, `vm`, and optionally `image`,
    /// `package` and `tickets`, in the inventory wire format.
    Allocate {
        /// Path to the JSON allocation request
        #[arg(short, long)]
        request: String,
        /// Path to a berth.toml policy (default: built-in defaults)
        #[arg(short, long)]
        policy: Option<String>,
        /// Seed for the random tie-breaker, for reproducible runs
        #[arg(long)]
        seed: Option<u64>,
        /// Abandon the run after this many milliseconds
        #[arg(long)]
        deadline_ms: Option<u64>,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Print the effective policy as TOML
    Policy {
        /// Policy file to validate and print (default: built-in defaults)
        #[arg(short, long)]
        policy: Option<String>,
    },
    /// List the pipeline steps in trace order
    Steps,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "warn,berth_placement=info,berth_cli=info".into());
    let logs = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter);
    if cli.log_json {
        logs.json().init();
    } else {
        logs.init();
    }

    match cli.command {
        Commands::Allocate { request, policy, seed, deadline_ms, format } => {
            commands::allocate::allocate(&request, policy.as_deref(), seed, deadline_ms, &format)
        }
        Commands::Policy { policy } => commands::policy::show(policy.as_deref()),
        Commands::Steps => commands::policy::steps(),
    }
}
