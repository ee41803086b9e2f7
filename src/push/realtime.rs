//! Realtime websocket channel (Phoenix-style protocol).

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use super::{ChangeKind, ChangeNotification, PushChannel};
use crate::config::Config;
use crate::model::SyncDomain;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Subscribes to row changes over the backend's realtime websocket.
#[derive(Clone)]
pub struct RealtimeChannel {
  endpoint: Url,
  access_token: Option<String>,
}

impl RealtimeChannel {
  pub fn new(config: &Config) -> Result<Self> {
    let api_key = Config::get_api_key()?;
    let realtime_url = config.realtime_url();

    let mut endpoint = Url::parse(&realtime_url)
      .map_err(|e| eyre!("Invalid realtime url {}: {}", realtime_url, e))?;
    endpoint
      .query_pairs_mut()
      .append_pair("apikey", &api_key)
      .append_pair("vsn", "1.0.0");

    Ok(Self {
      endpoint,
      access_token: Config::get_access_token().or(Some(api_key)),
    })
  }
}

#[async_trait]
impl PushChannel for RealtimeChannel {
  async fn subscribe(
    &self,
    domain: &SyncDomain,
    tables: &[String],
  ) -> Result<mpsc::UnboundedReceiver<ChangeNotification>> {
    let (tx, rx) = mpsc::unbounded_channel();
    let join = join_message(domain, tables, self.access_token.as_deref());
    let endpoint = self.endpoint.clone();

    info!(domain = %domain, tables = tables.len(), "subscribing to realtime changes");
    tokio::spawn(run_socket(endpoint, join, tables.to_vec(), tx));

    Ok(rx)
  }
}

/// Keep a session alive until the receiver goes away, reconnecting with backoff.
///
/// Every rejoin after the first signals a change on each table, since whatever
/// changed while the socket was down was never pushed.
async fn run_socket(
  endpoint: Url,
  join: String,
  tables: Vec<String>,
  tx: mpsc::UnboundedSender<ChangeNotification>,
) {
  let missed = missed_changes(&tables);
  let mut joined = false;
  let mut backoff = Duration::from_secs(1);

  loop {
    if tx.is_closed() {
      return;
    }

    match session(&endpoint, &join, &missed, &mut joined, &tx).await {
      Ok(SessionEnd::ReceiverGone) => return,
      Ok(SessionEnd::ClosedByServer) => {
        debug!("realtime socket closed by server, reconnecting");
        backoff = Duration::from_secs(1);
      }
      Err(e) => warn!(error = %e, retry_in = ?backoff, "realtime socket failed"),
    }

    tokio::time::sleep(backoff).await;
    backoff = (backoff * 2).min(MAX_BACKOFF);
  }
}

enum SessionEnd {
  ReceiverGone,
  ClosedByServer,
}

async fn session(
  endpoint: &Url,
  join: &str,
  missed: &[ChangeNotification],
  joined: &mut bool,
  tx: &mpsc::UnboundedSender<ChangeNotification>,
) -> Result<SessionEnd> {
  let (socket, _) = connect_async(endpoint.as_str())
    .await
    .map_err(|e| eyre!("Failed to connect to realtime endpoint: {}", e))?;
  let (mut sink, mut stream) = socket.split();

  sink
    .send(Message::Text(join.to_string()))
    .await
    .map_err(|e| eyre!("Failed to join realtime channel: {}", e))?;

  if *joined {
    info!(tables = missed.len(), "realtime channel rejoined, requesting refetch");
    for notification in missed {
      if tx.send(notification.clone()).is_err() {
        return Ok(SessionEnd::ReceiverGone);
      }
    }
  }
  *joined = true;

  let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
  heartbeat.tick().await;
  let mut next_ref: u64 = 2;

  loop {
    tokio::select! {
      _ = heartbeat.tick() => {
        if tx.is_closed() {
          let _ = sink.send(Message::Close(None)).await;
          return Ok(SessionEnd::ReceiverGone);
        }
        sink
          .send(Message::Text(heartbeat_message(next_ref)))
          .await
          .map_err(|e| eyre!("Failed to send heartbeat: {}", e))?;
        next_ref += 1;
      }
      message = stream.next() => match message {
        Some(Ok(Message::Text(text))) => {
          if let Some(notification) = parse_message(&text) {
            debug!(table = %notification.table, kind = ?notification.kind, "change notification");
            if tx.send(notification).is_err() {
              return Ok(SessionEnd::ReceiverGone);
            }
          }
        }
        Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::ClosedByServer),
        Some(Ok(_)) => {}
        Some(Err(e)) => return Err(eyre!("Realtime socket error: {}", e)),
      }
    }
  }
}

fn missed_changes(tables: &[String]) -> Vec<ChangeNotification> {
  tables
    .iter()
    .map(|table| ChangeNotification {
      table: table.to_lowercase(),
      kind: ChangeKind::Other,
    })
    .collect()
}

fn topic(domain: &SyncDomain) -> String {
  format!("realtime:congregation:{}", domain.id())
}

fn join_message(domain: &SyncDomain, tables: &[String], access_token: Option<&str>) -> String {
  let changes: Vec<Value> = tables
    .iter()
    .map(|table| {
      json!({
        "event": "*",
        "schema": "public",
        "table": table,
        "filter": domain.filter(),
      })
    })
    .collect();

  let mut payload = json!({
    "config": {
      "broadcast": { "self": false },
      "presence": { "key": "" },
      "postgres_changes": changes,
    }
  });
  if let Some(token) = access_token {
    payload["access_token"] = json!(token);
  }

  json!({
    "topic": topic(domain),
    "event": "phx_join",
    "payload": payload,
    "ref": "1",
    "join_ref": "1",
  })
  .to_string()
}

fn heartbeat_message(reference: u64) -> String {
  json!({
    "topic": "phoenix",
    "event": "heartbeat",
    "payload": {},
    "ref": reference.to_string(),
  })
  .to_string()
}

/// Extract a change notification from a socket frame, ignoring everything else.
fn parse_message(text: &str) -> Option<ChangeNotification> {
  let value: Value = serde_json::from_str(text).ok()?;
  let event = value.get("event")?.as_str()?;
  let payload = value.get("payload")?;

  match event {
    "postgres_changes" => {
      let data = payload.get("data")?;
      Some(ChangeNotification {
        table: data.get("table")?.as_str()?.to_lowercase(),
        kind: ChangeKind::parse(data.get("type").and_then(Value::as_str).unwrap_or("")),
      })
    }
    // Older servers send one event per change kind
    "INSERT" | "UPDATE" | "DELETE" => Some(ChangeNotification {
      table: payload.get("table")?.as_str()?.to_lowercase(),
      kind: ChangeKind::parse(event),
    }),
    "phx_reply" => {
      if payload.get("status").and_then(Value::as_str) == Some("error") {
        warn!(response = %payload, "realtime server refused request");
      }
      None
    }
    _ => None,
  }
}
