use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{info, warn};
use vidgrab::{
    AppState, Config, build_cors_layer,
    engine::YtDlpEngine,
    router,
    verification::TurnstileVerifier,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "vidgrab=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {error:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = Config::from_env().context("invalid configuration")?;

    if !config.trust_proxy_headers {
        warn!("TRUST_PROXY_HEADERS=false: rate limiting uses the socket address");
    }
    if config.verification.enabled {
        if config.verification.secret_key.is_none() {
            warn!("VERIFICATION_ENABLED=true without TURNSTILE_SECRET_KEY: downloads will be refused");
        } else {
            info!("Turnstile verification enabled for downloads");
        }
        if config.verification.site_key.is_none() {
            warn!("TURNSTILE_SITE_KEY is not set: clients cannot render the challenge");
        }
    }

    let engine = Arc::new(YtDlpEngine::new(config.engine.clone()));
    let verifier = Arc::new(
        TurnstileVerifier::new(&config.turnstile_verify_url, config.turnstile_timeout)
            .context("could not build the verification HTTP client")?,
    );
    let state = AppState::new(&config, engine, verifier);

    state.artifacts.prepare().await.with_context(|| {
        format!(
            "could not create artifact directory {}",
            state.artifacts.dir().display()
        )
    })?;
    state
        .artifacts
        .sweep_orphans(config.artifact_retention)
        .await;

    let sweeper = state.admission.spawn_sweeper(config.rate_limit.window);
    let cors = build_cors_layer(&config.allowed_origins)?;
    let app = router(state.clone()).layer(cors);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("could not bind {}", config.bind_addr))?;

    info!("Listening on http://{}", config.bind_addr);

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    sweeper.abort();
    state.artifacts.shutdown().await;

    served.context("HTTP server error")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!("could not listen for Ctrl-C: {error}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!("could not listen for SIGTERM: {error}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown requested");
}
