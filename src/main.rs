use std::io::Write;

use actix_web::{web, App, HttpServer};
use log::{error, info};

use bleepstore::app_state::AppState;
use bleepstore::config::{AppConfig, LogFormat, LoggingConfig};
use bleepstore::s3::handlers;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let config_path = config_path_from_args();
    let config = match AppConfig::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fatal: could not load configuration: {}", e);
            std::process::exit(1);
        }
    };
    init_logging(&config.logging);

    let host = config.server.host.clone();
    let port = config.server.port;
    let max_body_size = config.server.max_body_size;
    let shutdown_timeout = config.server.shutdown_timeout;

    let state = match AppState::from_config(config).await {
        Ok(state) => state,
        Err(e) => {
            error!("fatal: startup failed: {}", e);
            std::process::exit(1);
        }
    };
    let data = web::Data::new(state);

    spawn_shutdown_watchdog(shutdown_timeout);
    info!("listening on {}:{}", host, port);

    HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .app_data(web::PayloadConfig::new(max_body_size))
            .default_service(web::route().to(handlers::entry))
    })
    .bind((host, port))?
    .shutdown_timeout(shutdown_timeout)
    .run()
    .await
}

/// `--config <path>` or a single positional path.
fn config_path_from_args() -> Option<std::path::PathBuf> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            return iter.next().map(Into::into);
        }
        if !arg.starts_with('-') {
            return Some(arg.into());
        }
    }
    None
}

fn init_logging(config: &LoggingConfig) {
    let mut builder = env_logger::Builder::new();
    builder.parse_filters(&config.level);
    if config.format == LogFormat::Json {
        builder.format(|buf, record| {
            writeln!(
                buf,
                "{}",
                serde_json::json!({
                    "ts": chrono::Utc::now().to_rfc3339(),
                    "level": record.level().to_string(),
                    "target": record.target(),
                    "message": record.args().to_string(),
                })
            )
        });
    }
    // try_init so embedding the binary in tests cannot panic on double init.
    let _ = builder.try_init();
}

/// Failsafe for shutdown: once a termination signal arrives, the graceful
/// drain gets `shutdown_timeout` seconds plus a small grace before the
/// process hard-exits with code 1.
fn spawn_shutdown_watchdog(shutdown_timeout: u64) {
    tokio::spawn(async move {
        wait_for_termination_signal().await;
        info!("shutdown signal received, draining in-flight requests");
        tokio::time::sleep(std::time::Duration::from_secs(shutdown_timeout + 2)).await;
        error!("drain exceeded {}s, forcing exit", shutdown_timeout);
        std::process::exit(1);
    });
}

#[cfg(unix)]
async fn wait_for_termination_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!("could not install SIGTERM handler: {}", e);
            return std::future::pending().await;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
