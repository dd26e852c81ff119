use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use quic_pusher::{client, server};

#[derive(Parser)]
#[clap(name = "quic-pusher", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run as the load-generating client
    Client(client::Opt),
    /// Run as the echo server
    Server(server::Opt),
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new("info"))
                .unwrap(),
        )
        .with(fmt::layer())
        .init();

    let r = match cli.command {
        Commands::Client(opt) => client::run(opt).await,
        Commands::Server(opt) => server::run(opt).await,
    };
    if let Err(e) = r {
        error!("{e:#}");
        std::process::exit(1);
    }
}
