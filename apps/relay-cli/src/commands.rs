use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result, bail};
use delegation_client::DelegationClient;
use nostr_relay_pool::{
    ContactListSync, Filter, PoolNotification, RelayInfo, RelayPool, RelayUrl,
};
use serde_json::json;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{self, CliConfig};
use crate::sync::{self, SyncOptions, SyncReport};
use crate::{AddRelayArgs, WatchArgs};

pub fn list_relays(path: &Path, out: &mut impl Write) -> Result<()> {
    let config = CliConfig::load(path)?;
    if config.relays.is_empty() {
        writeln!(out, "no relays configured in {}", path.display())?;
        return Ok(());
    }
    for relay in &config.relays {
        writeln!(out, "{}\t{}", relay.url, relay.info)?;
    }
    Ok(())
}

pub async fn add_relay(path: &Path, args: &AddRelayArgs, out: &mut impl Write) -> Result<()> {
    let url = RelayUrl::parse(&args.url).context("invalid relay URL")?;
    let config = save_relay(path, &url, args.info, out)?;

    if args.offline {
        return Ok(());
    }
    let Some(secret) = config::secret_key_from_env() else {
        info!(
            "{} is not set; published relay lists were not updated",
            config::SECRET_KEY_ENV
        );
        return Ok(());
    };
    let signer = ContactListSync::from_secret_hex(&secret)
        .with_context(|| format!("invalid {}", config::SECRET_KEY_ENV))?;

    let options = SyncOptions {
        timeout: Duration::from_secs(args.timeout.max(1)),
        bootstrap: args.bootstrap,
    };
    let report = sync::publish_relay_addition(&config, &signer, &url, args.info, &options).await?;
    write_sync_report(&report, out)
}

/// Insert or update `url` in the config file and report what changed.
fn save_relay(
    path: &Path,
    url: &RelayUrl,
    info: RelayInfo,
    out: &mut impl Write,
) -> Result<CliConfig> {
    let mut config = CliConfig::load(path)?;
    let mut list = config.relay_list();
    let existed = list.contains(url);
    if !list.upsert(url.clone(), info) {
        writeln!(out, "{url} already configured as {info}")?;
        return Ok(config);
    }
    config.set_relay_list(list);
    config.save(path)?;
    if existed {
        writeln!(out, "updated {url} to {info}")?;
    } else {
        writeln!(out, "added {url} ({info})")?;
    }
    Ok(config)
}

fn write_sync_report(report: &SyncReport, out: &mut impl Write) -> Result<()> {
    if report.published.is_empty() {
        writeln!(out, "no published relay list to update")?;
        return Ok(());
    }
    for list in &report.published {
        writeln!(
            out,
            "kind {} relay list {}: {} accepted, {} rejected, {} no answer",
            list.kind,
            list.event_id,
            list.accepted.len(),
            list.rejected.len(),
            list.silent.len()
        )?;
        for (relay, message) in &list.rejected {
            writeln!(out, "  {relay} rejected: {message}")?;
        }
    }
    Ok(())
}

pub fn remove_relay(path: &Path, url: &str, out: &mut impl Write) -> Result<()> {
    let url = RelayUrl::parse(url).context("invalid relay URL")?;
    let mut config = CliConfig::load(path)?;
    let mut list = config.relay_list();
    if !list.remove(&url) {
        writeln!(out, "{url} is not configured")?;
        return Ok(());
    }
    config.set_relay_list(list);
    config.save(path)?;
    writeln!(out, "removed {url}")?;
    Ok(())
}

pub async fn watch(path: &Path, args: &WatchArgs, out: &mut impl Write) -> Result<()> {
    let config = CliConfig::load(path)?;
    if config.relays.is_empty() {
        bail!("no relays configured in {}", path.display());
    }

    let pool = RelayPool::new(config.pool_config());
    let notifications = pool.notifications();
    for relay in &config.relays {
        pool.add_relay(relay.url.as_str(), relay.info).await?;
    }
    pool.connect_all().await;

    let mut filter = Filter::new().kinds(args.kinds.clone());
    if let Some(author) = &args.author {
        filter = filter.authors(vec![author.clone()]);
    }
    if let Some(limit) = args.limit {
        filter = filter.limit(limit);
    }
    let subscription_id = pool.subscribe(vec![filter]).await?;
    info!("watching {} relays as {}", config.relays.len(), subscription_id);

    let stop = tokio::signal::ctrl_c();
    let streamed = stream_events(notifications, args.max_events, stop, out).await;
    pool.unsubscribe(&subscription_id).await?;
    pool.shutdown().await;
    let count = streamed?;
    debug!("streamed {} events", count);
    Ok(())
}

/// Write each incoming event as a JSON line until `stop` resolves, the
/// pool closes, or `max_events` have been written. Returns the count.
async fn stream_events<S>(
    mut notifications: broadcast::Receiver<PoolNotification>,
    max_events: Option<usize>,
    stop: S,
    out: &mut impl Write,
) -> Result<usize>
where
    S: Future,
{
    let mut written = 0usize;
    if max_events == Some(0) {
        return Ok(written);
    }
    tokio::pin!(stop);
    loop {
        let received = tokio::select! {
            _ = &mut stop => {
                info!("stopping");
                break;
            }
            received = notifications.recv() => received,
        };
        match received {
            Ok(PoolNotification::IncomingEvent { relay, event, .. }) => {
                let line = json!({ "relay": relay, "event": event });
                writeln!(out, "{line}")?;
                out.flush()?;
                written += 1;
                if max_events.is_some_and(|max| written >= max) {
                    break;
                }
            }
            Ok(PoolNotification::EndOfStoredEvents { relay, .. }) => {
                debug!("{} finished stored events", relay);
            }
            Ok(PoolNotification::RelayStatus { relay, state }) => {
                info!("{}: {:?}", relay, state);
            }
            Ok(PoolNotification::Notice { relay, message }) => {
                warn!("{}: {}", relay, message);
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!("output fell behind; skipped {} notifications", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
    Ok(written)
}

fn delegation_client(path: &Path) -> Result<DelegationClient> {
    let config = CliConfig::load(path)?;
    let client = DelegationClient::new(config.delegation).context("invalid [delegation] config")?;
    if !client.is_enabled() {
        bail!("delegation service is disabled; set [delegation] enabled and base_url");
    }
    Ok(client)
}

pub async fn nip05(path: &Path, identifier: &str, out: &mut impl Write) -> Result<()> {
    let client = delegation_client(path)?;
    let Some(response) = client.spawn_nip05(identifier).wait().await.flatten() else {
        bail!("NIP-05 lookup for {identifier} failed");
    };
    match response.resolved_pubkey() {
        Some(pubkey) => writeln!(out, "{pubkey}")?,
        None => bail!(
            "{identifier} did not resolve (status {:?}, code {})",
            response.status,
            response.code
        ),
    }
    Ok(())
}

pub async fn delegation_status(path: &Path, out: &mut impl Write) -> Result<()> {
    let client = delegation_client(path)?;
    match client.check_status().await {
        Some(status) if status.is_good() => writeln!(out, "delegation service ok")?,
        Some(status) => bail!(
            "delegation service refused (status {:?}, code {})",
            status.status,
            status.code
        ),
        None => bail!("delegation service unreachable"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::routing::get;
    use axum::{Json, Router};
    use nostr::{EventTemplate, finalize_event, generate_secret_key};
    use nostr_relay_pool::RelayDescriptor;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    fn add_args(url: &str, info: RelayInfo) -> AddRelayArgs {
        AddRelayArgs {
            url: url.to_string(),
            info,
            timeout: 1,
            bootstrap: false,
            offline: true,
        }
    }

    fn output(buffer: Vec<u8>) -> Result<String> {
        Ok(String::from_utf8(buffer)?)
    }

    #[tokio::test]
    async fn relay_list_edits_persist() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("relay-cli.toml");
        let mut out = Vec::new();

        list_relays(&path, &mut out)?;
        add_relay(&path, &add_args("wss://A.example/", RelayInfo::Read), &mut out).await?;
        add_relay(&path, &add_args("wss://b.example", RelayInfo::ReadWrite), &mut out).await?;
        add_relay(&path, &add_args("wss://a.example", RelayInfo::Read), &mut out).await?;
        add_relay(&path, &add_args("wss://a.example", RelayInfo::Write), &mut out).await?;
        remove_relay(&path, "wss://b.example", &mut out)?;
        remove_relay(&path, "wss://b.example", &mut out)?;
        list_relays(&path, &mut out)?;

        let text = output(out)?;
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("no relays configured"));
        assert_eq!(
            &lines[1..],
            [
                "added wss://a.example (read)",
                "added wss://b.example (read-write)",
                "wss://a.example already configured as read",
                "updated wss://a.example to write",
                "removed wss://b.example",
                "wss://b.example is not configured",
                "wss://a.example\twrite",
            ]
        );

        let config = CliConfig::load(&path)?;
        assert_eq!(
            config.relays,
            vec![RelayDescriptor::new(RelayUrl::parse("wss://a.example")?, RelayInfo::Write)]
        );
        Ok(())
    }

    #[tokio::test]
    async fn add_rejects_non_websocket_url() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("relay-cli.toml");
        let mut out = Vec::new();

        let args = add_args("https://a.example", RelayInfo::Read);
        let result = add_relay(&path, &args, &mut out).await;
        assert!(result.is_err());
        assert!(!path.exists());
        Ok(())
    }

    #[tokio::test]
    async fn stream_writes_json_lines_until_limit() -> Result<()> {
        let (tx, rx) = broadcast::channel(16);
        let relay = RelayUrl::parse("wss://a.example")?;
        let secret_key = generate_secret_key();
        for content in ["one", "two", "three"] {
            let template = EventTemplate {
                created_at: 1_700_000_000,
                kind: 1,
                tags: Vec::new(),
                content: content.to_string(),
            };
            tx.send(PoolNotification::RelayStatus {
                relay: relay.clone(),
                state: nostr_relay_pool::ConnectionState::Connected,
            })?;
            tx.send(PoolNotification::IncomingEvent {
                relay: relay.clone(),
                subscription_id: "sub-1".to_string(),
                event: finalize_event(&template, &secret_key)?,
            })?;
        }

        let mut out = Vec::new();
        let written = stream_events(rx, Some(2), std::future::pending::<()>(), &mut out).await?;
        assert_eq!(written, 2);

        let text = output(out)?;
        let lines: Vec<Value> = text
            .lines()
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["relay"], "wss://a.example");
        assert_eq!(lines[0]["event"]["content"], "one");
        assert_eq!(lines[1]["event"]["content"], "two");
        Ok(())
    }

    #[tokio::test]
    async fn stream_stops_on_signal_or_closed_pool() -> Result<()> {
        let (tx, rx) = broadcast::channel::<PoolNotification>(4);
        let mut out = Vec::new();
        let written = stream_events(rx, None, std::future::ready(()), &mut out).await?;
        assert_eq!(written, 0);

        let rx = tx.subscribe();
        drop(tx);
        let written = stream_events(rx, None, std::future::pending::<()>(), &mut out).await?;
        assert_eq!(written, 0);
        assert!(out.is_empty());
        Ok(())
    }

    async fn spawn_delegation_stub() -> Result<SocketAddr> {
        let app = Router::new()
            .route(
                "/nip05",
                get(|Query(params): Query<HashMap<String, String>>| async move {
                    let body = match params.get("nip05").map(String::as_str) {
                        Some("bob@example.com") => json!({
                            "status": "ok",
                            "code": 1,
                            "pubkey": "b0b",
                        }),
                        _ => json!({ "status": "not found", "code": 0 }),
                    };
                    Json(body)
                }),
            )
            .route(
                "/is_good",
                get(|| async { Json(json!({ "status": "ok", "code": 1 })) }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok(addr)
    }

    fn write_delegation_config(path: &Path, base_url: &str) -> Result<()> {
        let mut config = CliConfig::default();
        config.delegation.enabled = true;
        config.delegation.base_url = base_url.to_string();
        config.save(path)
    }

    #[tokio::test]
    async fn nip05_prints_resolved_pubkey() -> Result<()> {
        let addr = spawn_delegation_stub().await?;
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("relay-cli.toml");
        write_delegation_config(&path, &format!("http://{addr}"))?;

        let mut out = Vec::new();
        nip05(&path, "bob@example.com", &mut out).await?;
        delegation_status(&path, &mut out).await?;
        assert_eq!(output(out)?, "b0b\ndelegation service ok\n");

        let mut out = Vec::new();
        assert!(nip05(&path, "nobody@example.com", &mut out).await.is_err());
        assert!(out.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn nip05_requires_enabled_service() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("relay-cli.toml");
        let mut out = Vec::new();

        let error = nip05(&path, "bob@example.com", &mut out)
            .await
            .err()
            .map(|error| error.to_string());
        assert!(error.is_some_and(|message| message.contains("disabled")));
        Ok(())
    }
}
