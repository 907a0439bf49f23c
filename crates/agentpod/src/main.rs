//! agentpod - run coding agents in containers with filtered credentials.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{LevelFilter, error, info, warn};
use tokio::signal::unix::{SignalKind, signal};

use agentpod::allowlist::AllowList;
use agentpod::backend;
use agentpod::config::{self, AppConfig, RunOverrides};
use agentpod::gpg_agent::GpgAgentProxy;
use agentpod::session::{ContainerSession, ForwardMode, ForwardingConfig, SessionMode};
use agentpod::ssh_agent::SshAgentProxy;
use agentpod::temp_registry::TempResourceRegistry;

#[derive(Parser, Debug)]
#[command(
    name = "agentpod",
    version,
    about = "Run AI coding agents in containers without exposing host credentials",
    after_help = "Examples:\n  \
        agentpod run -a claude\n  \
        agentpod run --ephemeral -a codex -- --help\n  \
        agentpod ssh-proxy"
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an agent in its container
    Run(RunCommand),
    /// Print the container name for the current directory
    Name(NameCommand),
    /// Run the SSH agent proxy in the foreground
    SshProxy,
    /// Run the GPG agent proxy in the foreground
    GpgProxy,
    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Args, Debug, Clone, Default)]
struct SessionArgs {
    /// Reuse one container per project and extension set
    #[arg(long, conflicts_with = "ephemeral")]
    persistent: bool,
    /// Use a fresh container and remove it afterwards
    #[arg(long)]
    ephemeral: bool,
    /// Extension to enable (repeatable); the first one is run
    #[arg(short = 'a', long = "agent", value_name = "NAME")]
    agents: Vec<String>,
}

impl SessionArgs {
    fn mode(&self) -> Option<SessionMode> {
        if self.persistent {
            Some(SessionMode::Persistent)
        } else if self.ephemeral {
            Some(SessionMode::Ephemeral)
        } else {
            None
        }
    }
}

#[derive(Args, Debug)]
struct RunCommand {
    #[command(flatten)]
    session: SessionArgs,
    /// Arguments passed to the agent
    #[arg(last = true)]
    args: Vec<String>,
}

#[derive(Args, Debug)]
struct NameCommand {
    #[command(flatten)]
    session: SessionArgs,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print the effective configuration
    Show,
    /// Print the config file path
    Path,
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn init_logging(common: &CommonOpts) {
    if common.quiet {
        env_logger::Builder::new()
            .filter_level(LevelFilter::Error)
            .init();
        return;
    }

    let level = match common.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn config_path(common: &CommonOpts) -> Result<PathBuf> {
    match common.config {
        Some(ref path) => Ok(path.clone()),
        None => config::default_config_path(),
    }
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() -> Result<()> {
    let mut term = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("waiting for Ctrl-C")?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli.common);

    match try_main(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("agentpod: {e:#}");
            TempResourceRegistry::global().purge();
            std::process::exit(1);
        }
    }
}

async fn try_main(cli: Cli) -> Result<i32> {
    let path = config_path(&cli.common)?;

    match cli.command {
        Command::Config(cmd) => handle_config(cmd, &path),
        Command::Name(cmd) => {
            let app = config::load(&path)?;
            let overrides = RunOverrides {
                mode: cmd.session.mode(),
                extensions: cmd.session.agents,
                ..Default::default()
            };
            let cwd = std::env::current_dir().context("reading current directory")?;
            let session = app.resolve(&cwd, &overrides, HashMap::new())?;
            println!("{}", session.identity().name());
            Ok(0)
        }
        Command::Run(cmd) => {
            let app = config::load(&path)?;
            run(app, cmd).await
        }
        Command::SshProxy => {
            let app = config::load(&path)?;
            ssh_proxy(app).await
        }
        Command::GpgProxy => {
            let app = config::load(&path)?;
            gpg_proxy(app).await
        }
    }
}

fn handle_config(cmd: ConfigCommand, path: &std::path::Path) -> Result<i32> {
    match cmd {
        ConfigCommand::Path => println!("{}", path.display()),
        ConfigCommand::Show => {
            let app = config::load(path)?;
            print!("{}", toml::to_string_pretty(&app).context("serializing config")?);
        }
        ConfigCommand::Init { force } => {
            if path.exists() && !force {
                anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
            }
            config::write_default(path)?;
            println!("Wrote {}", path.display());
        }
    }
    Ok(0)
}

async fn run(app: AppConfig, cmd: RunCommand) -> Result<i32> {
    let overrides = RunOverrides {
        mode: cmd.session.mode(),
        extensions: cmd.session.agents,
        args: cmd.args,
        tty: std::io::IsTerminal::is_terminal(&std::io::stdin()),
    };
    let cwd = std::env::current_dir().context("reading current directory")?;
    let host_env: HashMap<String, String> = std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect();
    let session_config = app.resolve(&cwd, &overrides, host_env)?;

    let backend = backend::for_kind(app.backend);
    let mut session = ContainerSession::new(session_config, backend);
    info!("Session {} ({})", session.name(), session.identity().mode());

    let outcome = tokio::select! {
        result = session.run() => Some(result),
        signal = shutdown_signal() => {
            if let Err(e) = signal {
                warn!("Signal handling failed: {:#}", e);
            }
            warn!("Interrupted, tearing down");
            None
        }
    };

    session.teardown().await;

    match outcome {
        Some(result) => Ok(result?),
        None => Ok(130),
    }
}

async fn ssh_proxy(app: AppConfig) -> Result<i32> {
    let default_socket = std::env::var_os("SSH_AUTH_SOCK").map(PathBuf::from);
    let fwd = AppConfig::forwarding(&app.ssh, default_socket, None)?;
    let allow = proxy_allow_list(&fwd)?;
    let upstream = fwd.upstream.context("SSH_AUTH_SOCK is not set")?;

    let proxy = SshAgentProxy::new(upstream, allow)?;
    let socket = proxy.start()?;
    println!("SSH_AUTH_SOCK={}", socket.display());

    let result = shutdown_signal().await;
    proxy.stop().await;
    TempResourceRegistry::global().purge();
    result.map(|()| 0)
}

async fn gpg_proxy(app: AppConfig) -> Result<i32> {
    let fwd = AppConfig::forwarding(&app.gpg, config::default_gpg_socket(), None)?;
    let allow = proxy_allow_list(&fwd)?;
    let upstream = fwd.upstream.context("cannot locate the gpg-agent socket")?;

    let proxy = GpgAgentProxy::new(upstream, allow)?;
    let socket = proxy.start()?;
    println!("{}", socket.display());

    let result = shutdown_signal().await;
    proxy.stop().await;
    TempResourceRegistry::global().purge();
    result.map(|()| 0)
}

/// Standalone proxies filter only in `proxy` mode.
fn proxy_allow_list(fwd: &ForwardingConfig) -> Result<AllowList> {
    match fwd.mode {
        ForwardMode::Proxy => Ok(AllowList::new(&fwd.allow)?),
        _ => Ok(AllowList::passthrough()),
    }
}
