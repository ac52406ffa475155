//! storechat REPL
//!
//! 从 stdin 逐行读取用户消息，打印清洗后的回复。`/close` 关闭当前会话并开新会话；Ctrl-D 退出并排空归档。

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use storechat::config::load_config;
use storechat::core::ShutdownManager;
use storechat::memory::Role;
use storechat::{observability, ChatRequest, ChatService};
use tokio::io::{AsyncBufReadExt, BufReader};

fn new_session_id() -> String {
    format!("repl_{}", uuid::Uuid::new_v4().simple())
}

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;

    cfg.require_tool_endpoint()?;

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let service = ChatService::from_config(&cfg, shutdown.token())
        .await
        .context("Failed to build chat service")?;

    let mut session_id = new_session_id();
    println!("storechat ({}), /close to end the session, Ctrl-D to quit", session_id);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        prompt();
        let line = tokio::select! {
            _ = shutdown.wait_for_shutdown() => break,
            line = lines.next_line() => line.context("Failed to read stdin")?,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/close" {
            if let Err(e) = service.close_session(&session_id).await {
                eprintln!("[error] {e}");
            }
            session_id = new_session_id();
            println!("session closed, new session {}", session_id);
            continue;
        }

        match service.start_turn(ChatRequest::new(&session_id, line)).await {
            Ok(outcome) => {
                for m in &outcome.transcript {
                    match m.role {
                        Role::Assistant if !m.tool_calls.is_empty() => {
                            for call in &m.tool_calls {
                                println!("  [tool] {} {}", call.name, call.arguments);
                            }
                        }
                        Role::Tool => {
                            let status = m.tool_status.map(|s| s.as_str()).unwrap_or("unknown");
                            println!("  [tool] -> {}", status);
                        }
                        _ => {}
                    }
                }
                println!("{}", outcome.reply);
                if outcome.hit_round_limit {
                    println!("  (tool round limit reached)");
                }
            }
            Err(e) => eprintln!("[error] {e}"),
        }
    }

    if service.sessions().get(&session_id).await.is_some() {
        let _ = service.close_session(&session_id).await;
    }
    service.shutdown().await;
    let m = service.archive_metrics();
    tracing::info!(archived = m.archived, dropped = m.dropped, failed = m.failed, "bye");
    Ok(())
}
