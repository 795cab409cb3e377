use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use stormio_api::{build_app, AppState};
use stormio_config::{locate_profile, ConfigError, Settings};
use stormio_overlay::OverlayClient;
use stormio_provision::{ProviderCache, ProvisionOptions};
use stormio_scheduler::{Provisioner, SchedulerConfig};
use stormio_store::PostgresStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "stormio", about = "Cloud-instance provisioning controller")]
struct Cli {
    /// Path to the configuration profile. Falls back to
    /// $CLOUDIOPATH/[$CLOUDIOCONFIG|cloudio.cfg], then /etc/cloudio/default.cfg.
    #[arg(long)]
    profile: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let profile = match locate_profile(cli.profile.as_deref()) {
        Ok(path) => path,
        Err(ConfigError::ProfileNotFound) => {
            eprintln!("FATAL: no configuration profile found, terminating");
            std::process::exit(2);
        }
        Err(e) => return Err(e.into()),
    };
    let settings = Settings::from_file(&profile)
        .with_context(|| format!("loading profile {}", profile.display()))?;

    init_tracing(&settings);
    info!(profile = %profile.display(), "loaded configuration profile");

    let db_url = format!(
        "postgres://{}:{}/cloudio",
        settings.database.host, settings.database.port
    );
    let store = Arc::new(
        PostgresStore::connect(&db_url)
            .await
            .with_context(|| format!("connecting to the store at {db_url}"))?,
    );

    // The provider cache and the scheduler must be up before the listener
    // accepts traffic.
    let overlay = OverlayClient::new();
    let options = ProvisionOptions {
        signer_id: settings.meta_data.signer_id.clone(),
        nexus_url: settings.meta_data.nexus_url.clone(),
        delay_between_os_calls: settings.module_option.delay_between_os_calls,
        maximum_fip: settings.openstack.maximum_fip,
    };
    let cache = Arc::new(ProviderCache::new(options, overlay.clone()));
    let scheduler_config = SchedulerConfig {
        rate_limit: settings.server.rate_limit,
        vertex_url: settings.external.vertex_url.clone(),
        usg_username: settings.usg.username.clone(),
        usg_password: settings.usg.password.clone(),
        usg_authurl: settings.usg.authurl.clone(),
    };
    let provisioner = Provisioner::start(store.clone(), cache.clone(), overlay, scheduler_config);

    let state = AppState { store, provisioner, cache };
    let app = build_app(state, &settings.web_app.context_path);

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "stormio running");
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

/// Filter directives come from `path.config-root`/`path.log-conf` when that
/// file exists, otherwise from `RUST_LOG`.
fn init_tracing(settings: &Settings) {
    let filter = if settings.path.log_conf.is_empty() {
        EnvFilter::from_default_env()
    } else {
        let path = PathBuf::from(&settings.path.config_root).join(&settings.path.log_conf);
        match std::fs::read_to_string(&path) {
            Ok(directives) => EnvFilter::new(directives.trim()),
            Err(_) => EnvFilter::from_default_env(),
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
