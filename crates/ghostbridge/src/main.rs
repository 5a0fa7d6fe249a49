//! ghostbridge: edit browser text fields in acme.
//!
//! Serves the GhostText protocol and opens one acme window per text field.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use ghostbridge_acme::{AcmeFactory, acme_socket, namespace};
use ghostbridge_session::SessionOptions;
use ghostbridge_transport::{ServerConfig, config::DEFAULT_PORT, websocket};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "ghostbridge")]
#[command(version, about = "GhostText server that edits browser text fields in acme")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on.
    #[arg(long, env = "GHOSTBRIDGE_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Origin allowed to connect. May be repeated; any origin if absent.
    #[arg(long = "allow-origin")]
    allow_origins: Vec<String>,

    /// Keep a window that still holds unsaved edits when its browser tab
    /// goes away.
    #[arg(long)]
    keep_dirty: bool,

    /// plan9port namespace directory. Defaults to $NAMESPACE or
    /// /tmp/ns.$USER.$DISPLAY.
    #[arg(long)]
    namespace: Option<PathBuf>,

    /// Output logs as JSON.
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(
        |_| "ghostbridge=info,ghostbridge_session=info,ghostbridge_transport=info,ghostbridge_acme=info".into(),
    ));
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let ns = args
        .namespace
        .or_else(namespace)
        .context("cannot locate the plan9port namespace; set $NAMESPACE or pass --namespace")?;
    let user = ghostbridge_acme::namespace::user().unwrap_or_else(|| "none".to_string());
    let factory = AcmeFactory::new(acme_socket(ns), user);

    let config = ServerConfig {
        host: args.host,
        port: args.port,
        allowed_origins: args.allow_origins,
        session: SessionOptions {
            discard_on_disconnect: !args.keep_dirty,
            ..SessionOptions::default()
        },
        ..ServerConfig::default()
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.bind_addr(),
        acme = %factory.socket().display(),
        "Starting ghostbridge"
    );

    let listener = websocket::bind(&config)
        .await
        .with_context(|| format!("failed to listen on {}", config.bind_addr()))?;
    websocket::serve(listener, config, factory)
        .await
        .context("server failed")
}
