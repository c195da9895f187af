use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use greenlight::{
    Config, Coordinator, McpServer, RequestRegistry, SessionDirectory, TelegramAdapter,
    TelegramTransport,
};

/// Run the broker as an MCP server speaking line-delimited JSON-RPC on
/// stdio. The Telegram bot polls in the background so human replies still
/// flow back while an agent drives the stdio transport.
pub async fn run(config: Config) -> Result<()> {
    let store = crate::serve::build_store(&config)?;
    let directory = Arc::new(SessionDirectory::new(store.clone()));
    let registry = Arc::new(RequestRegistry::new(store));

    let bot = teloxide::Bot::new(&config.telegram_bot_token);
    let transport = Arc::new(TelegramTransport::new(bot.clone()));

    let coordinator = Arc::new(Coordinator::new(
        directory.clone(),
        registry,
        transport.clone(),
        config.request_timeout_seconds,
        config.max_concurrent_requests,
    ));
    coordinator
        .restore_pending_timeouts()
        .context("failed to restore pending timeouts")?;

    let cancel = CancellationToken::new();

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGINT handler");
                return;
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = sigint.recv() => tracing::info!("SIGINT received"),
            _ = sigterm.recv() => tracing::info!("SIGTERM received"),
        }
        signal_cancel.cancel();
    });

    tokio::spawn(coordinator.timeout_scheduler().run(cancel.clone()));

    let adapter = Arc::new(TelegramAdapter::new(
        bot,
        transport,
        coordinator.clone(),
        directory,
    ));
    tokio::spawn(adapter.run());
    tracing::info!("telegram bot started");

    let server = Arc::new(McpServer::new(coordinator));
    tracing::info!("MCP server ready for stdio communication");
    server
        .run_stdio(cancel)
        .await
        .context("MCP stdio transport error")?;
    Ok(())
}
