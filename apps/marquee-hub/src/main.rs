use axum::{routing::get, Router};
use clap::Parser;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tower_http::trace::TraceLayer;
use tracing::info;

use marquee_hub::{config::Config, routes, state::HubState};

#[derive(Debug, Parser)]
#[command(name = "marquee-hub", about = "Fleet management hub for digital-signage devices")]
struct Cli {
    /// Override the MARQUEE_HUB_PORT environment variable.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to INFO if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    let port = config.port;

    info!(
        "dispatch timeout defaults: commands {} ms, content {} ms",
        config.command_timeout_ms, config.content_timeout_ms
    );
    info!(
        "outbound buffer: {} frames per session",
        config.outbound_buffer
    );

    let prometheus_handle = install_metrics_recorder();
    let state = HubState::new(config);

    let metrics_routes = Router::new()
        .route("/metrics", get(routes::metrics_handler))
        .with_state(prometheus_handle);

    let app = Router::new()
        .merge(routes::build_router(state.clone()))
        .merge(metrics_routes)
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Marquee hub listening on {}", addr);
    println!("📺 Marquee hub listening on {addr}");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    Ok(())
}

async fn shutdown_signal(state: HubState) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown signal received");
        state.shutdown();
    }
}

fn install_metrics_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}
