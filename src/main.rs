use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use courier_auth::{HmacAlgorithm, JwtConfig, JwtGate};
use courier_core::Principal;
use courier_server::{RegistryMode, ServerConfig};
use courier_store::Database;
use courier_telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use secrecy::SecretString;

/// Courier - real-time point-to-point message relay
#[derive(Parser, Debug)]
#[command(version, about, long_about = None, args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Used when no subcommand is given
    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay server (default)
    Serve(ServeArgs),

    /// Mint a signed token for local development
    Token(TokenArgs),
}

#[derive(Args, Debug, Clone)]
struct ServeArgs {
    /// Bind address
    #[arg(long, env = "COURIER_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 4000)]
    port: u16,

    /// SQLite file for persisted messages
    #[arg(long, env = "DATABASE_PATH", default_value = "courier.db")]
    database_path: PathBuf,

    /// Outbound queue capacity per connection
    #[arg(long, env = "COURIER_QUEUE_CAPACITY", default_value_t = 256)]
    queue_capacity: usize,

    /// Registry implementation: "actor" or "shared"
    #[arg(long, env = "COURIER_REGISTRY", default_value = "actor")]
    registry: RegistryMode,

    /// Stdout log format: "json" or "pretty"
    #[arg(long, env = "COURIER_LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,

    /// Also persist warn+ logs to this SQLite file
    #[arg(long, env = "COURIER_LOG_DB")]
    log_db: Option<PathBuf>,

    #[command(flatten)]
    jwt: JwtArgs,
}

#[derive(Args, Debug, Clone)]
struct TokenArgs {
    /// Principal the token is issued for
    #[arg(long)]
    principal: String,

    /// Lifetime in seconds
    #[arg(long, default_value_t = 3600)]
    ttl_secs: i64,

    #[command(flatten)]
    jwt: JwtArgs,
}

#[derive(Args, Debug, Clone)]
struct JwtArgs {
    /// HMAC signing secret
    #[arg(long = "jwt-secret", env = "COURIER_JWT_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Accepted signing algorithm
    #[arg(long = "jwt-algorithm", env = "COURIER_JWT_ALGORITHM", default_value = "HS256")]
    algorithm: HmacAlgorithm,
}

impl JwtArgs {
    fn config(&self) -> Result<JwtConfig> {
        let secret = self
            .secret
            .clone()
            .filter(|s| !s.trim().is_empty())
            .context("a JWT secret is required (--jwt-secret or COURIER_JWT_SECRET)")?;
        Ok(JwtConfig {
            secret: SecretString::from(secret),
            algorithm: self.algorithm,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Token(args)) => issue_token(&args),
        Some(Commands::Serve(args)) => serve(args).await,
        None => serve(cli.serve).await,
    }
}

fn issue_token(args: &TokenArgs) -> Result<()> {
    let gate = JwtGate::new(&args.jwt.config()?);
    let token = gate.issue(
        &Principal::new(args.principal.as_str()),
        chrono::Duration::seconds(args.ttl_secs),
    )?;
    println!("{token}");
    Ok(())
}

async fn serve(args: ServeArgs) -> Result<()> {
    let _telemetry = init_telemetry(&TelemetryConfig {
        format: args.log_format,
        log_db_path: args.log_db.clone(),
        ..Default::default()
    });

    let jwt = args.jwt.config()?;
    let db = Database::open(&args.database_path)
        .with_context(|| format!("opening {}", args.database_path.display()))?;

    let config = ServerConfig {
        host: args.host,
        port: args.port,
        queue_capacity: args.queue_capacity,
        registry: args.registry,
        ..Default::default()
    };
    let handle = courier_server::start(config, Arc::new(JwtGate::new(&jwt)), db)
        .await
        .context("starting server")?;
    tracing::info!(port = handle.port(), "courier ready");

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl+c")?;
    handle.shutdown().await;
    Ok(())
}
