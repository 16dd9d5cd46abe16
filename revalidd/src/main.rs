use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use revalid_core::ApiClient;
use revalidd::connectivity::{ConnectivityMonitor, Reachability};
use revalidd::service::CURRENT_USER_ENDPOINT;
use revalidd::store::OfflineStore;
use revalidd::{ApiService, OfflineConfig, OfflineContext, SyncEngine, SyncOutcome};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Status,
    Sync,
    Precache,
    Clear,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--status" => mode = CliMode::Status,
            "--sync" => mode = CliMode::Sync,
            "--precache" => mode = CliMode::Precache,
            "--clear" => mode = CliMode::Clear,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn bootstrap(config: &OfflineConfig) -> anyhow::Result<Arc<SyncEngine>> {
    let store = OfflineStore::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open {}", config.db_path.display()))?;
    store.init().await.context("failed to prepare offline tables")?;

    let connectivity = match &config.probe_url {
        Some(url) => {
            ConnectivityMonitor::with_probe(url.clone(), PROBE_TIMEOUT, Reachability::Offline)
        }
        None => ConnectivityMonitor::manual(Reachability::Online),
    };
    let ctx = OfflineContext::restore(store, connectivity)
        .await
        .context("failed to restore cached subscription tier")?;
    ctx.set_session_token(config.token.clone());

    let client = ApiClient::with_base_url(config.api_base_url.as_str())
        .context("invalid API base URL")?
        .with_timeout(config.request_timeout);
    let service = ApiService::new(client, ctx);
    Ok(Arc::new(
        SyncEngine::new(service).with_refresh_cooldown(config.refresh_cooldown),
    ))
}

async fn run(engine: Arc<SyncEngine>, config: &OfflineConfig) -> anyhow::Result<()> {
    let ctx = engine.service().context().clone();
    let probe = config
        .probe_url
        .as_ref()
        .map(|_| ctx.connectivity.spawn_probe_loop(config.probe_interval));
    let watcher = Arc::clone(&engine).spawn_watcher();
    info!(
        base_url = %config.api_base_url,
        db = %config.db_path.display(),
        "revalidd running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");

    watcher.abort();
    if let Some(probe) = probe {
        probe.abort();
    }
    ctx.store.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("Usage: revalidd [--status | --sync | --precache | --clear]");
        println!("  --status     Show queued operations and connectivity, then exit");
        println!("  --sync       Run one sync pass, then exit");
        println!("  --precache   Cache the important collections for offline use");
        println!("  --clear      Remove cached data and queued operations");
        return Ok(());
    }

    init_tracing();
    let config = OfflineConfig::from_env().context("invalid configuration")?;
    let engine = bootstrap(&config).await?;
    let service = engine.service();
    let token = config.token.as_deref();

    match mode {
        CliMode::Run => run(Arc::clone(&engine), &config).await?,
        CliMode::Status => {
            let pending = service.pending_operation_count().await?;
            let reachability = service.context().connectivity.check().await;
            println!("connectivity: {reachability:?}");
            println!("pending operations: {pending}");
        }
        CliMode::Sync => match engine.sync_pending().await? {
            SyncOutcome::Completed(report) => println!(
                "synced {}, failed {}, retrying {}",
                report.synced, report.failed, report.retrying
            ),
            SyncOutcome::Offline => println!("offline, nothing replayed"),
            SyncOutcome::AlreadyRunning => println!("a sync pass is already running"),
        },
        CliMode::Precache => {
            if let Err(err) = service.refresh(CURRENT_USER_ENDPOINT, token).await {
                warn!(error = %err, "could not refresh subscription tier");
            }
            let cached = service.pre_cache_offline_data(token).await?;
            println!("cached {cached} endpoints");
        }
        CliMode::Clear => {
            service.clear_offline_data().await?;
            println!("offline data cleared");
        }
        CliMode::Help => {}
    }
    Ok(())
}
