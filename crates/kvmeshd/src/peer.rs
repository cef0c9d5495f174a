//! Peer mode: one replica driven by line commands on stdin.
//!
//! Commands:
//!   set <key> <json>   write a value
//!   get <key>          print the merged value
//!   sync               broadcast the full local state
//!   status             print the status as JSON
//!   quit               dispose and exit

use anyhow::Result;
use kvmesh_core::SyncConfig;
use kvmesh_sync::SyncCoordinator;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Debug, PartialEq)]
enum Command {
    Set { key: String, value: Value },
    Get(String),
    Sync,
    Status,
    Quit,
}

/// Parse one input line. Blank lines yield `None`.
fn parse_command(line: &str) -> Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();

    let command = match verb {
        "set" => {
            let (key, raw) = rest
                .split_once(char::is_whitespace)
                .ok_or_else(|| anyhow::anyhow!("usage: set <key> <json>"))?;
            let value = serde_json::from_str(raw.trim())
                .map_err(|e| anyhow::anyhow!("invalid json for {key}: {e}"))?;
            Command::Set {
                key: key.to_string(),
                value,
            }
        }
        "get" if !rest.is_empty() => Command::Get(rest.to_string()),
        "get" => anyhow::bail!("usage: get <key>"),
        "sync" => Command::Sync,
        "status" => Command::Status,
        "quit" | "exit" => Command::Quit,
        other => anyhow::bail!("unknown command: {other}"),
    };
    Ok(Some(command))
}

pub async fn run(config: SyncConfig, watch: Vec<String>) -> Result<()> {
    let coordinator = SyncCoordinator::builder(config)
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("starting coordinator: {e}"))?;
    info!(peer = %coordinator.peer_id(), "replica ready");

    let mut subscriptions = Vec::with_capacity(watch.len());
    for key in watch {
        let name = key.clone();
        let sub = coordinator
            .watch(key, move |new, old| {
                info!(key = %name, new = ?new, old = ?old, "value changed");
            })
            .await?;
        subscriptions.push(sub);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };

        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                warn!("{e}");
                continue;
            }
        };
        if command == Command::Quit {
            break;
        }
        if let Err(e) = execute(&coordinator, command).await {
            warn!(error = %e, "command failed");
        }
    }

    for sub in subscriptions {
        sub.unsubscribe();
    }
    coordinator.dispose().await?;
    info!("replica stopped");
    Ok(())
}

async fn execute(coordinator: &SyncCoordinator, command: Command) -> Result<()> {
    match command {
        Command::Set { key, value } => coordinator.set(key, value).await?,
        Command::Get(key) => match coordinator.get(&key).await? {
            Some(value) => println!("{value}"),
            None => println!("(unset)"),
        },
        Command::Sync => {
            coordinator.sync().await?;
            println!("synced");
        }
        Command::Status => {
            let status = coordinator.status().await?;
            println!("{}", serde_json::to_string(&status)?);
        }
        Command::Quit => {}
    }
    Ok(())
}
