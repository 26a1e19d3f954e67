mod collectors;
mod config;
mod http;
mod release;
mod snapshot;
mod store;
mod update;

use axum::serve;
use clap::Parser;
use collectors::collect_system;
use config::Config;
use http::QueryState;
use release::ReleaseClient;
use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use store::{ArchiveMirror, MetricsStore};
use sysinfo::SystemExt;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use update::{promote_if_staged, CheckOutcome, Promotion, UpdateController, UpdatePaths};

#[derive(Parser, Debug)]
#[command(name = "hwmond")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };

    if let Err(err) = std::fs::create_dir_all(&cfg.data_dir) {
        error!(error = %err, data_dir = %cfg.data_dir, "failed to create data directory");
        std::process::exit(1);
    }

    // Promotion must happen before anything samples or serves: if a staged
    // artifact is present this process may already be the new binary running
    // for the first time, or the old one about to install its successor.
    let update_paths = match std::env::current_exe() {
        Ok(live) => Some(UpdatePaths::new(live, Path::new(&cfg.data_dir))),
        Err(err) => {
            warn!(error = %err, "cannot resolve own executable path, self-update disabled");
            None
        }
    };
    if let Some(paths) = &update_paths {
        match promote_if_staged(paths) {
            Ok(Promotion::Promoted) => info!("staged update promoted at boot"),
            Ok(Promotion::NotStaged) => {}
            Err(err) => warn!(error = %err, "promotion failed, continuing on current binary"),
        }
    }

    info!(
        listen = %cfg.listen,
        interval_secs = cfg.metrics_interval_secs,
        update_enabled = cfg.update.enabled,
        "starting hwmond"
    );

    let store = match MetricsStore::open(cfg.db_path(), cfg.metrics_interval_secs) {
        Ok(store) => store,
        Err(err) => {
            error!(error = %err, "failed to open metrics store");
            std::process::exit(1);
        }
    };
    let archive = ArchiveMirror::new(cfg.archive_path());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let cfg = cfg.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(QueryState {
                db_path: cfg.db_path(),
                interval_secs: cfg.metrics_interval_secs,
            });
            let addr: SocketAddr = match cfg.listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %cfg.listen, "invalid listen address");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "failed to start HTTP server");
                    return;
                }
            };

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "HTTP server failed");
            }
        })
    };

    let sampler_task = {
        let cfg = cfg.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut system = sysinfo::System::new_all();
            let mut ticker =
                tokio::time::interval(Duration::from_secs(cfg.metrics_interval_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            let mut updater = update_paths.filter(|_| cfg.update.enabled).map(|paths| {
                let http = reqwest::Client::builder()
                    .user_agent(concat!("hwmond/", env!("CARGO_PKG_VERSION")))
                    .build()
                    .unwrap_or_else(|_| reqwest::Client::new());
                let client = ReleaseClient::new(
                    http,
                    cfg.update.github_repo.clone(),
                    Duration::from_secs(cfg.update.download_timeout_secs),
                )
                .with_token(std::env::var(&cfg.update.token_env).ok());
                let ctrl = UpdateController::new(
                    paths,
                    Duration::from_secs(cfg.update.check_interval_secs),
                );
                info!(installed = ctrl.installed_version(), "self-update enabled");
                (ctrl, client)
            });

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!("sampling loop received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        let snapshot = collect_system(&mut system, now_unix_ms());

                        // The two sinks are independent on purpose: a fault in
                        // either one is logged and the other still commits.
                        match store.append(&snapshot) {
                            Ok(true) => {}
                            Ok(false) => {
                                warn!(timestamp_ms = snapshot.timestamp_ms, "duplicate timestamp, record skipped");
                            }
                            Err(err) => error!(error = %err, "metrics store write failed"),
                        }
                        if let Err(err) = archive.append(&snapshot) {
                            error!(error = %err, "archive write failed");
                        }

                        if let Some((ctrl, client)) = updater.as_mut() {
                            if ctrl.due(Instant::now()) {
                                report_check(ctrl.check_and_stage(client).await);
                            }
                        }
                    }
                }
            }
        })
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to wait for Ctrl+C");
    }
    info!("received Ctrl+C, shutting down");

    let _ = shutdown_tx.send(true);

    let _ = sampler_task.await;
    let _ = http_task.await;
}

fn report_check(outcome: CheckOutcome) {
    match outcome {
        CheckOutcome::UpToDate => info!("update check: up to date"),
        CheckOutcome::NoRelease => info!("update check: nothing published"),
        CheckOutcome::Staged { from, to } => {
            info!(%from, %to, "update staged, will activate at next start");
        }
        CheckOutcome::CheckFailed(err) => {
            warn!(error = %err, "update check failed, will retry on schedule");
        }
        CheckOutcome::StageFailed(err) => {
            warn!(error = %err, "staging the downloaded update failed");
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
