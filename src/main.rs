use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use dispaint::{client, server};

#[derive(Parser, Debug)]
#[command(author, version, about = "Draw together on a shared canvas.")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Host a drawing session.
    Server(server::Args),
    /// Join a session and log every stroke as it arrives.
    Watch(client::Args),
    /// Show the strokes and connections of a running session.
    Status(client::Args),
    /// Make a running session write its log to its state file.
    Export(client::Args),
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Create ~/.dispaint directory if it doesn't exist
    let home_dir = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let dispaint_dir = format!("{home_dir}/.dispaint");
    std::fs::create_dir_all(&dispaint_dir)?;

    // Determine log file based on subcommand
    let (log_path, console_output) = match &args.command {
        Commands::Server(_) => (format!("{dispaint_dir}/dispaint-server.log"), true),
        Commands::Watch(_) | Commands::Status(_) | Commands::Export(_) => {
            (format!("{dispaint_dir}/dispaint.log"), false)
        }
    };

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&log_path)?;

    if console_output {
        // For the server: log to both console and file
        use tracing_subscriber::fmt::writer::MakeWriterExt;
        let writer = std::io::stdout.and(log_file);

        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_writer(writer)
            .init();
    } else {
        // Client commands print their own output; logs only go to file
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_writer(log_file)
            .with_ansi(false)
            .init();
    }

    match &args.command {
        Commands::Server(_) => info!("Starting dispaint server"),
        Commands::Watch(_) => info!("Starting dispaint watcher"),
        Commands::Status(_) => info!("Querying dispaint status"),
        Commands::Export(_) => info!("Requesting dispaint export"),
    }

    match args.command {
        Commands::Server(server_args) => server::run_server(server_args).await,
        Commands::Watch(client_args) => client::run_watch(client_args).await,
        Commands::Status(client_args) => client::run_status(client_args).await,
        Commands::Export(client_args) => client::run_export(client_args).await,
    }
}
