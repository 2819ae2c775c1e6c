use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use ada_gateway::gateway::http::{GatewayHttpState, router};
use ada_gateway::gateway::telemetry::init_tracing;
use ada_gateway::gateway::{
    BypassPolicy, ChatOrchestrator, FileKvStore, GatewayPaths, HttpUpstream, KvCache,
    ProviderFile, SettingsStore, SystemClock,
};

#[derive(Debug, Parser)]
#[command(name = "ada-gateway", about = "Cost-optimizing chat gateway")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Directory holding cost_settings.json and the kv_cache/ directory.
    #[arg(long, default_value = "./ai_data")]
    data_dir: PathBuf,

    /// Provider file; defaults to <data-dir>/providers.json.
    #[arg(long)]
    providers: Option<PathBuf>,

    #[arg(long)]
    json_logs: bool,

    /// Only clients named by --bypass-client may skip the cost optimizer.
    #[arg(long, overrides_with = "no_bypass_allowlist")]
    bypass_allowlist: bool,

    /// Any client may skip the cost optimizer.
    #[arg(long)]
    no_bypass_allowlist: bool,

    /// Client allowed to skip the cost optimizer (repeatable).
    #[arg(long = "bypass-client", default_values_t = vec!["cyoa".to_string()])]
    bypass_clients: Vec<String>,

    /// Requests without a client name may skip the cost optimizer.
    #[arg(long)]
    bypass_allow_empty_client: bool,

    #[arg(long, default_value_t = 600)]
    upstream_timeout_secs: u64,
}

impl Args {
    fn bypass_policy(&self) -> BypassPolicy {
        BypassPolicy {
            allowlist_enabled: self.bypass_allowlist || !self.no_bypass_allowlist,
            allowed_clients: self.bypass_clients.clone(),
            allow_empty_client: self.bypass_allow_empty_client,
        }
    }

    fn paths(&self) -> GatewayPaths {
        let paths = GatewayPaths::new(&self.data_dir);
        match &self.providers {
            Some(path) => paths.with_providers_file(path),
            None => paths,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();
    init_tracing(args.json_logs)?;

    let paths = args.paths();
    tokio::fs::create_dir_all(paths.data_dir()).await?;

    let settings = Arc::new(SettingsStore::new(paths.settings_file()));
    let providers = Arc::new(ProviderFile::new(&paths.providers_file));
    let cache = KvCache::new(
        Arc::new(FileKvStore::new(paths.kv_cache_dir())),
        Arc::new(SystemClock),
    );
    let upstream = Arc::new(HttpUpstream::with_timeout(Duration::from_secs(
        args.upstream_timeout_secs,
    ))?);

    let orchestrator = ChatOrchestrator::new(settings, providers, cache, upstream)
        .with_bypass_policy(args.bypass_policy());
    let app = router(GatewayHttpState::new(Arc::new(orchestrator)));

    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    tracing::info!(
        listen = %args.listen,
        data_dir = %paths.data_dir().display(),
        providers = %paths.providers_file.display(),
        "ada-gateway listening"
    );
    axum::serve(listener, app).await?;
    Ok(())
}
