//! storechat-web：HTTP 入口
//!
//! 端口由 STORECHAT_WEB_PORT 指定（默认 8080）；Ctrl+C / SIGTERM 触发优雅关闭并排空归档。

use std::sync::Arc;

use anyhow::Context;
use storechat::config::load_config;
use storechat::core::ShutdownManager;
use storechat::{observability, server, ChatService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cfg = load_config(None).context("Failed to load config")?;
    cfg.require_tool_endpoint()?;

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let service = ChatService::from_config(&cfg, shutdown.token())
        .await
        .context("Failed to build chat service")?;

    let port = std::env::var("STORECHAT_WEB_PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("storechat web: http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    let token = shutdown.token();
    axum::serve(listener, server::router(Arc::clone(&service)))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;

    service.shutdown().await;
    Ok(())
}
