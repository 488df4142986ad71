//! Parampara Webhooks Server
//!
//! Stripe webhook receiver with signature verification, idempotency and retry.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use parampara_webhooks::stripe::{
    stripe_webhook_router, Downstream, StripeWebhookConfig, WebhookIngestService,
};

/// Parampara Webhooks Server
#[derive(Parser, Debug)]
#[command(name = "parampara-webhooks")]
#[command(version)]
#[command(about = "Stripe webhook ingestion service with retry and idempotency")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "3001")]
    port: u16,

    /// Host to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --verbose
    let default_filter = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = StripeWebhookConfig::from_env().context("loading webhook configuration")?;
    tracing::info!(config = ?config, "Loaded webhook configuration");

    let service = Arc::new(WebhookIngestService::in_memory(config, &Downstream::logging()));
    tracing::info!(
        handlers = service.router().handler_count(),
        "Registered built-in event handlers"
    );

    let app = stripe_webhook_router(service);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;

    tracing::info!("Parampara Webhooks listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")?;

    Ok(())
}
