use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;

use mail_relay::channels::{ImapConnector, SmtpOutbound, spawn_daemon};
use mail_relay::config::RelayConfig;
use mail_relay::pipeline::Relay;
use mail_relay::signing::UnsubscribeSigner;
use mail_relay::store::{LibSqlBackend, RelayStore};
use mail_relay::web::{UnsubscribeState, unsubscribe_routes};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let config = RelayConfig::from_env().context("Invalid configuration")?;
    let _log_guard = mail_relay::logging::init(config.log_dir.as_deref());

    eprintln!("📨 mail-relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Mailbox: {} on {}:{}", config.imap.username, config.imap.host, config.imap.port);
    eprintln!("   Outbound: {}:{}", config.smtp.host, config.smtp.port);
    eprintln!("   Broadcasters: {}", config.allowed_senders.join(", "));
    eprintln!("   Database: {}", config.db_path.display());

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn RelayStore> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );

    // ── Unsubscribe endpoint ─────────────────────────────────────────────
    let app = unsubscribe_routes(UnsubscribeState {
        store: Arc::clone(&store),
        signer: UnsubscribeSigner::new(&config.unsubscribe),
    });
    let listener = tokio::net::TcpListener::bind(&config.web_bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.web_bind))?;
    eprintln!(
        "   Unsubscribe: http://{}{}",
        config.web_bind, config.unsubscribe.path
    );
    tokio::spawn(async move {
        tracing::info!("Unsubscribe endpoint started");
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Unsubscribe endpoint stopped: {e}");
        }
    });

    // ── Relay daemon ─────────────────────────────────────────────────────
    let mailbox = Arc::new(ImapConnector::new(&config.imap));
    let transport = Arc::new(SmtpOutbound::new(&config.smtp).context("Invalid SMTP settings")?);
    let relay = Arc::new(Relay::from_config(&config, mailbox, transport, store));

    let (handle, shutdown) = spawn_daemon(relay, config.poll_interval);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    eprintln!("\nShutting down after the current pass...");
    shutdown.store(true, Ordering::Relaxed);
    handle.await.context("Relay daemon panicked")?;

    Ok(())
}
