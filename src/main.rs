mod logging;

use anyhow::{Context as _, Result};
use clap::{Parser, ValueEnum};
use idgate_auth::{AdcProvider, TokenManager};
use idgate_config::{Config, LogFormat};
use idgate_proxy::{ProxyContext, run_stdio};
use idgate_upstream::ReqwestTransport;
use std::{path::PathBuf, sync::Arc};
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(
    name = "idgate",
    version,
    about = "idgate: stdio MCP bridge to IAM-protected HTTPS servers"
)]
struct Cli {
    /// Target MCP endpoint; also the identity token audience.
    #[arg(short, long, env = "IDGATE_TARGET_URL", value_name = "URL")]
    url: Option<String>,
    /// Per-request timeout in milliseconds (default: 30000).
    #[arg(short, long, value_name = "MS")]
    timeout: Option<u64>,
    /// Path to a YAML configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Log filter directive, e.g. `debug` or `idgate_proxy=trace`.
    #[arg(long, value_name = "FILTER")]
    log_level: Option<String>,
    /// Log line format.
    #[arg(long, value_enum)]
    log_format: Option<LogFormatArg>,
    /// Also write logs to this file, rotated daily.
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormatArg {
    Text,
    Json,
}

impl Cli {
    /// Flags win over the file and the environment.
    fn apply(self, config: &mut Config) {
        if let Some(url) = self.url {
            config.target_url = Some(url);
        }
        if let Some(ms) = self.timeout {
            config.timeout_ms = ms;
        }
        if let Some(level) = self.log_level {
            config.log.level = level;
        }
        if let Some(format) = self.log_format {
            config.log.format = match format {
                LogFormatArg::Text => LogFormat::Text,
                LogFormatArg::Json => LogFormat::Json,
            };
        }
        if let Some(file) = self.log_file {
            config.log.file = Some(file);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    cli.apply(&mut config);

    let guard = logging::init(&config.log)?;
    let settings = config.upstream().context("invalid configuration")?;
    tracing::info!(
        target_url = %settings.audience,
        timeout_ms = settings.timeout.as_millis(),
        "idgate starting"
    );

    let http = idgate_upstream::build_client().context("failed to build HTTP client")?;
    let tokens = Arc::new(TokenManager::new(Arc::new(AdcProvider::new(http.clone()))));
    let transport = Arc::new(ReqwestTransport::new(http));
    let ctx = Arc::new(ProxyContext::new(
        settings.audience,
        settings.timeout,
        tokens,
        transport,
    ));

    let shutdown = CancellationToken::new();
    watch_signals(&shutdown);

    run_stdio(
        ctx,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        shutdown.clone(),
    )
    .await
    .context("stdio transport failed")?;
    tracing::info!("idgate stopped");

    if shutdown.is_cancelled() {
        // A blocking stdin read would otherwise keep the runtime alive.
        drop(guard);
        std::process::exit(0);
    }
    Ok(())
}

/// Cancel `shutdown` on Ctrl-C or SIGTERM.
fn watch_signals(shutdown: &CancellationToken) {
    let on_ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("received SIGINT, shutting down");
                on_ctrl_c.cancel();
            }
            Err(e) => tracing::error!(error = %e, "failed to listen for SIGINT"),
        }
    });

    #[cfg(unix)]
    {
        let on_term = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    tracing::info!("received SIGTERM, shutting down");
                    on_term.cancel();
                }
                Err(e) => tracing::error!(error = %e, "failed to listen for SIGTERM"),
            }
        });
    }
}
