use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use berth::auth::{AuthKeys, Role};
use berth::config::Config;
use berth::server;

#[derive(Parser)]
#[command(name = "berth", version, about = "Single-node application hosting orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator and REST API (the default)
    Serve {
        /// HTTP listen port; overrides BERTH_PORT
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Issue a bearer token signed with BERTH_AUTH_SECRET
    Token {
        /// Subject the token is issued for
        #[arg(long)]
        user: String,
        /// Either "user" or "admin"
        #[arg(long, default_value = "user")]
        role: String,
        /// Token lifetime in seconds
        #[arg(long, default_value_t = 86_400)]
        ttl: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();

    match cli.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Serve { port } => {
            if let Some(port) = port {
                config.http_port = port;
            }
            server::start_server(config).await
        }
        Commands::Token { user, role, ttl } => {
            let role = match role.as_str() {
                "user" => Role::User,
                "admin" => Role::Admin,
                other => anyhow::bail!("unknown role '{}'; expected 'user' or 'admin'", other),
            };
            let keys = AuthKeys::new(config.auth_secret.as_bytes());
            println!("{}", keys.issue(&user, role, ttl)?);
            Ok(())
        }
    }
}
