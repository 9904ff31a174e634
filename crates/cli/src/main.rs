mod commands;
mod script;

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

/// Arbor case engine toolchain.
#[derive(Parser)]
#[command(name = "arbor", version, about = "Arbor case engine toolchain")]
struct Cli {
    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text", value_enum)]
    output: OutputFormat,

    /// Suppress non-essential output
    #[arg(long, global = true)]
    quiet: bool,

    /// Log engine operations at debug level
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and validate a case definition
    Validate {
        /// Path to the definition JSON file
        definition: PathBuf,
    },

    /// Run a script of commands against a fresh in-memory case instance
    Run {
        /// Path to the definition JSON file
        definition: PathBuf,
        /// Path to the JSON script (a list of steps)
        #[arg(long)]
        script: PathBuf,
        /// Engine configuration (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Business key of the created instance
        #[arg(long)]
        business_key: Option<String>,
        /// Tenant of the created instance
        #[arg(long)]
        tenant: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match cli.command {
        Commands::Validate { definition } => {
            commands::validate::cmd_validate(&definition, cli.output, cli.quiet);
        }
        Commands::Run {
            definition,
            script,
            config,
            business_key,
            tenant,
        } => {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    report_error(&format!("error starting runtime: {e}"), cli.output, cli.quiet);
                    process::exit(1);
                }
            };
            let args = commands::run::RunArgs {
                definition,
                script,
                config,
                business_key,
                tenant,
            };
            runtime.block_on(commands::run::cmd_run(args, cli.output, cli.quiet));
        }
    }
}

/// Logs go to stderr so that stdout stays parseable.
fn init_tracing(verbose: bool, quiet: bool) {
    let default = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    let filter = if verbose {
        EnvFilter::new(default)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .init();
}

pub(crate) fn report_error(msg: &str, output: OutputFormat, quiet: bool) {
    if quiet {
        return;
    }
    match output {
        OutputFormat::Text => eprintln!("{}", msg),
        OutputFormat::Json => {
            eprintln!("{}", serde_json::json!({ "error": msg }));
        }
    }
}
