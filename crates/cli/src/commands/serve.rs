use std::path::Path;
use std::sync::Arc;

use axum::http::HeaderValue;
use margin_core::crypto::SecretBox;
use margin_core::signing::ToolKey;
use margin_lti::AppState;
use tokio::net::TcpListener;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{error, info};

use super::open;

/// Run the `serve` command: serve launches and the frontend API.
pub async fn run(config_path: &str, bind: &str, port: u16) -> anyhow::Result<()> {
    let (config, repo) = open(config_path).await?;

    let master_key_path = config
        .margin
        .master_key_path
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("margin.master_key_path is not configured"))?;
    let secrets = Arc::new(SecretBox::from_key_file(Path::new(master_key_path))?);

    let signing_key_path = config
        .margin
        .signing_key_path
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("margin.signing_key_path is not configured"))?;
    let tool_key = Arc::new(ToolKey::from_file(Path::new(signing_key_path))?);
    info!(kid = tool_key.kid(), "loaded LTI signing key");

    let state = Arc::new(AppState::build(config, repo, secrets, tool_key)?);
    let public_url = state.public_url.clone();

    // No X-Frame-Options: LMSes embed launches in an iframe.
    let app = margin_lti::router(state)
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::REFERRER_POLICY,
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ));

    let addr = format!("{}:{}", bind, port);
    let listener = TcpListener::bind(&addr).await?;

    println!("margin listening on http://{}", addr);
    println!("  Launch URL: {}/lti_launches", public_url);
    println!("  OIDC login: {}/lti/1.3/oidc", public_url);
    println!("  Key set:    {}/lti/1.3/jwks", public_url);
    info!("Starting server on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for CTRL+C: {e}");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}
