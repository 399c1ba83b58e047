mod logging;
mod server;
mod ws;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use parley_app::Config;
use parley_core::{Broker, QuotaState, Source, SourceSetup, UsageStats};
use parley_db::{SharedStore, Store};
use parley_llm_openai::{ApiConfig, BrowserSessionConfig};
use server::AppState;

#[derive(Parser)]
#[command(name = "parley", version)]
struct Cli {
    /// Config file; defaults to `config.toml` in the per-user config dir.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP and WebSocket server (default).
    Serve,
    /// Load and validate the configuration, then print it.
    CheckConfig,
    /// Inspect or replace a user's stored quota.
    Quota {
        #[command(subcommand)]
        action: QuotaCommand,
    },
}

#[derive(Subcommand)]
enum QuotaCommand {
    Show {
        #[arg(long)]
        user: i64,
        #[arg(long, value_parser = parse_source)]
        source: Source,
    },
    Set {
        #[arg(long)]
        user: i64,
        #[arg(long, value_parser = parse_source)]
        source: Source,
        /// The quota as JSON; omitted fields take their defaults.
        #[arg(long)]
        json: String,
    },
}

fn parse_source(raw: &str) -> Result<Source, String> {
    Source::parse(raw).ok_or_else(|| format!("unknown source {raw:?} (browser_session or api)"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let _ = dotenvy::dotenv();

    let config = Config::load(cli.config.as_deref())?;
    logging::init(&config.log.console_level);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            config.validate()?;
            serve(config).await
        }
        Command::CheckConfig => {
            config.validate()?;
            println!("{:#?}", config.redacted());
            Ok(())
        }
        Command::Quota { action } => quota(&config, action),
    }
}

fn quota(config: &Config, action: QuotaCommand) -> Result<(), Box<dyn std::error::Error>> {
    let mut store = Store::open(config.database_path()?)?;
    match action {
        QuotaCommand::Show { user, source } => match store.quotas().get(user, source)? {
            Some(quota) => println!("{}", serde_json::to_string_pretty(&quota)?),
            None => println!("user {user} has no stored {source} quota"),
        },
        QuotaCommand::Set { user, source, json } => {
            let quota: QuotaState = serde_json::from_str(&json)?;
            store.quotas().put(user, source, &quota)?;
            tracing::info!(user, %source, "quota stored");
        }
    }
    Ok(())
}

async fn serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let store = SharedStore::new(Store::open(config.database_path()?)?);

    let stats = Arc::new(UsageStats::new(&config.stats.to_stats_config())?);
    let stats_path = config.stats_path()?;
    if let Err(e) = stats.load(&stats_path) {
        tracing::warn!(path = %stats_path.display(), error = %e, "could not restore usage stats");
    }

    let broker = build_broker(&config, store, Arc::clone(&stats))?;

    let listener = tokio::net::TcpListener::bind((config.http.host.as_str(), config.http.port)).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    let dumper = {
        let stats = Arc::clone(&stats);
        let path = stats_path.clone();
        let period = Duration::from_secs(config.stats.dump_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = stats.dump(&path) {
                    tracing::warn!(error = %e, "could not save usage stats");
                }
            }
        })
    };

    axum::serve(listener, server::router(AppState::new(broker)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    dumper.abort();
    stats.dump(&stats_path)?;
    tracing::info!(path = %stats_path.display(), "usage stats saved");
    Ok(())
}

fn build_broker(
    config: &Config,
    store: SharedStore,
    stats: Arc<UsageStats>,
) -> Result<Broker, Box<dyn std::error::Error>> {
    let mut builder = Broker::builder(store.stores(), stats)
        .default_title(config.conversation.default_title.clone());

    let section = &config.browser_session;
    if section.enabled {
        let session = parley_llm_openai::browser_session(BrowserSessionConfig {
            access_token: section.access_token.clone(),
            base_url: section.base_url.clone(),
            common_timeout: section.common_timeout(),
            ask_timeout: section.ask_timeout(),
            team_account_id: section.team_account_id.clone(),
            ..Default::default()
        })?;
        builder = builder.browser_session(
            SourceSetup {
                source: session.source,
                catalog: section.models.clone(),
                ask_timeout: section.ask_timeout(),
            },
            session.remote,
            section.max_completion_concurrency,
        );
        tracing::info!(models = section.models.names().count(), "browser session source enabled");
    }

    let section = &config.api;
    if section.enabled {
        let source = parley_llm_openai::api(ApiConfig {
            api_key: section.api_key.clone(),
            base_url: section.base_url.clone(),
            connect_timeout: section.connect_timeout(),
            read_timeout: section.read_timeout(),
        })?;
        builder = builder.api(SourceSetup {
            source,
            catalog: section.models.clone(),
            ask_timeout: section.ask_timeout(),
        });
        tracing::info!(models = section.models.names().count(), "api source enabled");
    }

    if let Some(quota) = &config.default_quota.browser_session {
        builder = builder.default_quota(Source::BrowserSession, quota.clone());
    }
    if let Some(quota) = &config.default_quota.api {
        builder = builder.default_quota(Source::Api, quota.clone());
    }

    Ok(builder.build())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "could not listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutting down");
}
