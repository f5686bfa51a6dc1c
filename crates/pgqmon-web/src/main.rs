mod auth;
mod handlers;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

use pgqmon_core::registry::FileRegistry;
use pgqmon_core::store::{MemoryStore, PgStore, QueryStore};
use pgqmon_core::{MonitorSettings, QueryMonitor};

use auth::AccessLogLayer;
use state::AppState;

// ============================================================
// CLI
// ============================================================

#[derive(Parser)]
#[command(name = "pgqmon-web", about = "pgqmon web API server", version = pgqmon_core::VERSION)]
struct Args {
    /// Listen address.
    #[arg(long, default_value = "0.0.0.0:8080", env = "PGQMON_LISTEN")]
    listen: String,

    /// Path to the JSON instance/database registry.
    #[arg(long, env = "PGQMON_REGISTRY")]
    registry: PathBuf,

    /// PostgreSQL URL of the store. Data is kept in memory when not set.
    #[arg(long, env = "PGQMON_STORE_URL")]
    store_url: Option<String>,

    /// Basic Auth username. If set, --auth-password is also required.
    #[arg(long, env = "PGQMON_AUTH_USER")]
    auth_user: Option<String>,

    /// Basic Auth password.
    #[arg(long, env = "PGQMON_AUTH_PASSWORD")]
    auth_password: Option<String>,

    /// Default polling interval of a monitoring session, in seconds.
    #[arg(long, default_value_t = pgqmon_core::settings::DEFAULT_POLL_INTERVAL_SECS, env = "PGQMON_POLL_INTERVAL")]
    poll_interval: u64,

    /// Continuous kill interval, in seconds.
    #[arg(long, default_value = "2", env = "PGQMON_KILL_INTERVAL")]
    kill_interval: u64,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    fn settings(&self) -> MonitorSettings {
        MonitorSettings {
            default_poll_interval_secs: self.poll_interval,
            kill_interval: Duration::from_secs(self.kill_interval.max(1)),
            ..MonitorSettings::default()
        }
    }
}

// ============================================================
// Main
// ============================================================

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to build tokio runtime");
            process::exit(1);
        }
    };
    runtime.block_on(async_main(args));
}

/// `RUST_LOG` takes precedence; otherwise info for both crates.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "pgqmon_web={level},pgqmon_core={level},audit={level}"
        ))
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn async_main(args: Args) {
    info!(version = pgqmon_core::VERSION, "starting");

    let registry = match FileRegistry::load(&args.registry) {
        Ok(r) => Arc::new(r),
        Err(e) => {
            error!(path = %args.registry.display(), error = %e, "failed to load registry");
            process::exit(1);
        }
    };

    let store: Arc<dyn QueryStore> = match args.store_url.clone() {
        Some(url) => {
            // The sync postgres client must be created off the runtime.
            match tokio::task::spawn_blocking(move || PgStore::connect(&url)).await {
                Ok(Ok(store)) => Arc::new(store),
                Ok(Err(e)) => {
                    error!(error = %e, "failed to open store");
                    process::exit(1);
                }
                Err(e) => {
                    error!(error = %e, "store setup task failed");
                    process::exit(1);
                }
            }
        }
        None => {
            warn!("no store URL configured, data will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let monitor = Arc::new(QueryMonitor::with_registry(
        store,
        registry,
        args.settings(),
    ));
    match monitor.recover().await {
        Ok(0) => {}
        Ok(n) => info!(sessions = n, "recovered running sessions"),
        Err(e) => warn!(error = %e, "session recovery failed"),
    }

    // Basic Auth
    let auth_creds: Option<Arc<(String, String)>> = match (&args.auth_user, &args.auth_password) {
        (Some(user), Some(pass)) => {
            info!("basic auth enabled");
            Some(Arc::new((user.clone(), pass.clone())))
        }
        (Some(_), None) | (None, Some(_)) => {
            error!("--auth-user and --auth-password must both be set");
            process::exit(1);
        }
        _ => None,
    };

    let mut app = handlers::routes(AppState::new(monitor.clone()));

    // The last layer added is the outermost: auth runs before the access
    // log and can hand it the authenticated user.
    app = app.layer(AccessLogLayer);

    if let Some(creds) = auth_creds {
        app = app.layer(axum::middleware::from_fn_with_state(
            creds,
            auth::basic_auth_middleware,
        ));
    }

    let app = app
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new());

    let app = app.into_make_service_with_connect_info::<SocketAddr>();

    let addr: SocketAddr = match args.listen.parse() {
        Ok(a) => a,
        Err(e) => {
            error!(listen = %args.listen, error = %e, "invalid listen address");
            process::exit(1);
        }
    };
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(%addr, error = %e, "failed to bind");
            process::exit(1);
        }
    };
    info!(%addr, "listening");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "server error");
    }

    monitor.shutdown().await;
    // Dropping a PgStore tears down the runtimes of its pooled clients, which
    // is not allowed on a runtime worker.
    let _ = tokio::task::spawn_blocking(move || drop(monitor)).await;
    info!("stopped");
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal"),
        Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
    }
}
