use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use service_gateway::config::GatewayConfig;
use service_gateway::gateway::server::{self, ADMIN_TOKEN_ENV};
use service_gateway::transport::AdminClient;
use service_gateway::utils;

#[derive(Parser)]
#[command(name = "gateway", version, about = "Request-protection gateway for internal services")]
struct AppCli {
    /// Run in daemon mode (background)
    #[arg(long)]
    daemon: bool,

    /// Config file path
    #[arg(short, long, default_value = "gateway.json", global = true)]
    config: String,

    /// Subcommands
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args)]
struct AdminTarget {
    /// Admin listener base URL
    #[arg(long, default_value = "http://127.0.0.1:9090")]
    admin_url: String,

    /// Admin token (defaults to the server's environment variable)
    #[arg(long, env = ADMIN_TOKEN_ENV, hide_env_values = true)]
    admin_token: String,
}

impl AdminTarget {
    fn client(&self) -> Result<AdminClient> {
        AdminClient::new(&self.admin_url, &self.admin_token)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway (default)
    Serve,
    /// Load and validate the config file, then exit
    CheckConfig,
    /// Rotate a service's signing key
    RotateKey {
        name: String,
        #[command(flatten)]
        target: AdminTarget,
    },
    /// Revoke a service identity
    Revoke {
        name: String,
        #[command(flatten)]
        target: AdminTarget,
    },
    /// Register a new service identity with a fresh signing key
    Provision {
        name: String,
        /// Comma-separated scopes the service may hold
        #[arg(long, value_delimiter = ',')]
        scopes: Vec<String>,
        #[command(flatten)]
        target: AdminTarget,
    },
    /// Print the running gateway's counters
    Metrics {
        #[command(flatten)]
        target: AdminTarget,
    },
    /// Reload WAF rules from the configured rule file
    ReloadWaf {
        #[command(flatten)]
        target: AdminTarget,
    },
    /// Issue a service token
    IssueToken {
        service: String,
        /// Comma-separated scopes
        #[arg(long, value_delimiter = ',')]
        scopes: Vec<String>,
        /// Lifetime in seconds; the server default applies when omitted
        #[arg(long)]
        ttl: Option<u64>,
        #[arg(long)]
        subject: Option<String>,
        #[command(flatten)]
        target: AdminTarget,
    },
}

fn run_daemon() -> Result<()> {
    use daemonize::Daemonize;
    let daemonize = Daemonize::new()
        .pid_file("gateway.pid")
        .working_directory(".")
        .umask(0o027)
        .privileged_action(|| {
            info!("daemon started");
        });

    daemonize.start().map_err(|e| anyhow::anyhow!(e))?;
    Ok(())
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    utils::logging::init();

    let args = AppCli::parse();
    let command = args.command.unwrap_or(Commands::Serve);

    // Fork before any runtime threads exist; only the calling thread
    // survives a fork. The config is checked first so errors still reach
    // the terminal.
    if args.daemon && matches!(command, Commands::Serve) {
        GatewayConfig::from_file(&args.config).with_context(|| format!("loading {}", args.config))?;
        run_daemon()?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    runtime.block_on(run(command, &args.config))
}

async fn run(command: Commands, config_path: &str) -> Result<()> {
    match command {
        Commands::Serve => {
            let config = GatewayConfig::from_file(config_path)
                .with_context(|| format!("loading {config_path}"))?;
            info!(config = %config_path, services = config.services.len(), "starting gateway");
            server::serve(config).await?;
        }
        Commands::CheckConfig => {
            let config = GatewayConfig::from_file(config_path)
                .with_context(|| format!("loading {config_path}"))?;
            println!("{config_path}: ok ({} services)", config.services.len());
        }
        Commands::RotateKey { name, target } => print_json(&target.client()?.rotate_key(&name).await?)?,
        Commands::Revoke { name, target } => print_json(&target.client()?.revoke(&name).await?)?,
        Commands::Provision { name, scopes, target } => {
            print_json(&target.client()?.provision(&name, &scopes).await?)?
        }
        Commands::Metrics { target } => print_json(&target.client()?.metrics().await?)?,
        Commands::ReloadWaf { target } => print_json(&target.client()?.reload_waf().await?)?,
        Commands::IssueToken {
            service,
            scopes,
            ttl,
            subject,
            target,
        } => {
            let issued = target
                .client()?
                .issue_token(&service, subject.as_deref(), &scopes, ttl)
                .await?;
            println!("{}", serde_json::to_string_pretty(&issued)?);
        }
    }

    Ok(())
}
