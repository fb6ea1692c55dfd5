//! probed - unattended text-service explorer
//!
//! Main entry point for the agent binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::Parser;
use eyre::{bail, WrapErr};
use probe_core::tasks::truncate_chars;
use probe_core::Config;
use probed::connection::TcpConnection;
use probed::journal::Journal;
use probed::oracle::{DecisionOracle, ModelTier, OpenAiBackend};
use probed::{Agent, AgentOutcome};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "probed",
    about = "Unattended explorer for text-based network services",
    version
)]
struct Cli {
    /// Config file (key=value)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Target host
    #[arg(long, env = "AGENT_TARGET_IP")]
    host: Option<String>,

    /// Target port
    #[arg(short, long, env = "AGENT_TARGET_PORT")]
    port: Option<u16>,

    /// Directory holding the per-phase knowledge files
    #[arg(long)]
    knowledge_dir: Option<PathBuf>,

    /// Journal database path
    #[arg(long)]
    journal: Option<PathBuf>,

    /// Disable the journal
    #[arg(long)]
    no_journal: bool,

    /// Cycles a task may run before it is declared stuck
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Oracle API key
    #[arg(long, env = "DEEPSEEK_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// OpenAI-compatible API base URL
    #[arg(long, env = "DEEPSEEK_BASE_URL")]
    base_url: Option<String>,

    /// Model for per-cycle decisions and knowledge review
    #[arg(long, env = "DEEPSEEK_MODEL")]
    model: Option<String>,

    /// Model for planning and stuck handling
    #[arg(long, env = "DEEPSEEK_REASONER_MODEL")]
    reasoner_model: Option<String>,

    /// Send one prompt to each model, report latency and exit
    #[arg(long)]
    check_oracle: bool,
}

impl Cli {
    /// Defaults, then the config file, then flags and environment.
    fn load_config(&self) -> eyre::Result<Config> {
        let mut config = match &self.config {
            Some(path) => {
                let mut config = Config::from_file(path)
                    .wrap_err_with(|| format!("failed to load config {}", path.display()))?;
                if let Some(base) = path.parent() {
                    config.resolve_paths(base);
                }
                config
            }
            None => Config::default(),
        };

        if let Some(host) = &self.host {
            config.target_host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.target_port = port;
        }
        if let Some(dir) = &self.knowledge_dir {
            config.knowledge_dir.clone_from(dir);
        }
        if let Some(path) = &self.journal {
            config.journal_path.clone_from(path);
        }
        if self.no_journal {
            config.journal_enabled = false;
        }
        if let Some(max) = self.max_attempts {
            config.max_task_attempts = max;
        }
        if let Some(url) = &self.base_url {
            config.oracle_base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(model) = &self.model {
            config.oracle_model.clone_from(model);
        }
        if let Some(model) = &self.reasoner_model {
            config.oracle_reasoner_model.clone_from(model);
        }

        config.validate().wrap_err("invalid configuration")?;
        Ok(config)
    }

    fn api_key(&self, config: &Config) -> eyre::Result<String> {
        if let Some(key) = self.api_key.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
            return Ok(key.to_string());
        }
        if let Some(path) = &config.api_key_file {
            let key = std::fs::read_to_string(path)
                .wrap_err_with(|| format!("failed to read API key file {}", path.display()))?;
            let key = key.trim();
            if !key.is_empty() {
                return Ok(key.to_string());
            }
        }
        bail!("no API key: pass --api-key, set DEEPSEEK_API_KEY or configure api_key_file")
    }
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = cli.load_config()?;
    let api_key = cli.api_key(&config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    runtime.block_on(async {
        let backend = Arc::new(
            OpenAiBackend::from_config(&config, api_key).wrap_err("failed to build HTTP client")?,
        );

        if cli.check_oracle {
            let oracle = DecisionOracle::new(backend, &config);
            return check_oracle(&oracle).await;
        }

        let journal = if config.journal_enabled {
            match Journal::open(&config.journal_path).await {
                Ok(journal) => {
                    info!(path = %config.journal_path.display(), "journal opened");
                    Some(journal)
                }
                Err(err) => {
                    warn!(error = %err, "journal unavailable, continuing without it");
                    None
                }
            }
        } else {
            None
        };

        let stop = CancellationToken::new();
        let mut signals = ShutdownSignals::new().wrap_err("failed to register signal handlers")?;
        let connection = Box::new(TcpConnection::new(
            config.target(),
            Duration::from_millis(config.read_timeout_ms),
        ));
        let mut agent = Agent::new(config, connection, backend, journal, stop.clone())?;

        tokio::spawn(async move {
            let name = signals.recv().await;
            info!(signal = name, "initiating graceful shutdown");
            stop.cancel();
            let name = signals.recv().await;
            warn!(signal = name, "second signal, exiting immediately");
            std::process::exit(130);
        });

        let outcome = agent.run().await;
        agent.shutdown().await;
        match outcome {
            AgentOutcome::Stopped => info!("agent stopped"),
            AgentOutcome::Exited(environment) => {
                info!(environment = %environment, "agent finished exploring");
            }
        }
        Ok(())
    })
}

/// One plain call per model tier, without retries.
async fn check_oracle(oracle: &DecisionOracle) -> eyre::Result<()> {
    let mut failed = false;
    for tier in [ModelTier::Chat, ModelTier::Reasoner] {
        let model = oracle.model(tier).to_string();
        match oracle.probe(tier, "Say 'Hello'").await {
            Ok((reply, elapsed)) => info!(
                model = %model,
                elapsed_ms = elapsed.as_millis() as u64,
                reply = %truncate_chars(&reply, 100),
                "oracle reachable"
            ),
            Err(err) => {
                error!(model = %model, error = %err, "oracle check failed");
                failed = true;
            }
        }
    }
    if failed {
        bail!("oracle check failed");
    }
    Ok(())
}

/// SIGINT and SIGTERM.
struct ShutdownSignals {
    #[cfg(unix)]
    sigint: tokio::signal::unix::Signal,
    #[cfg(unix)]
    sigterm: tokio::signal::unix::Signal,
}

impl ShutdownSignals {
    #[cfg(unix)]
    fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
        })
    }

    #[cfg(not(unix))]
    fn new() -> std::io::Result<Self> {
        Ok(Self {})
    }

    #[cfg(unix)]
    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.sigint.recv() => "SIGINT",
            _ = self.sigterm.recv() => "SIGTERM",
        }
    }

    #[cfg(not(unix))]
    async fn recv(&mut self) -> &'static str {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT"
    }
}
