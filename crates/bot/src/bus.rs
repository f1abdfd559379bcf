//! The host side of the bridge: where command events go and where outbound
//! send requests come from.

use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;
use bridge_core::{CommandEvent, EventSink, MessageDispatcher};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt as _, AsyncWrite, AsyncWriteExt as _},
    sync::Mutex,
};
use tracing::{debug, info, warn};

use crate::config::OneOrMany;

#[derive(Debug, Serialize)]
struct Envelope<'a> {
    event: &'a str,
    data: &'a CommandEvent,
}

/// Writes one JSON object per event, e.g.
/// `{"event":"matrix_command","data":{"command":"Ping",...}}`.
#[derive(Debug)]
pub(crate) struct JsonLinesSink<W> {
    out: Mutex<W>,
}

impl<W> JsonLinesSink<W> {
    pub(crate) fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

#[async_trait]
impl<W> EventSink for JsonLinesSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn emit(&self, name: &str, event: &CommandEvent) -> Result<()> {
        let mut line = serde_json::to_vec(&Envelope { event: name, data: event })
            .context("serializing command event")?;
        line.push(b'\n');
        let mut out = self.out.lock().await;
        out.write_all(&line).await.context("writing command event")?;
        out.flush().await.context("flushing command event")?;
        Ok(())
    }
}

/// Posts each event as JSON to a host webhook.
#[derive(Debug)]
pub(crate) struct WebhookSink {
    http: reqwest::Client,
    url: Url,
}

impl WebhookSink {
    pub(crate) const fn new(http: reqwest::Client, url: Url) -> Self {
        Self { http, url }
    }
}

#[async_trait]
impl EventSink for WebhookSink {
    async fn emit(&self, name: &str, event: &CommandEvent) -> Result<()> {
        let resp = self
            .http
            .post(self.url.clone())
            .json(&Envelope { event: name, data: event })
            .send()
            .await
            .with_context(|| format!("posting event to {}", self.url))?;
        let status = resp.status();
        if !status.is_success() {
            bail!("webhook {} answered {status}", self.url);
        }
        debug!(url = %self.url, "Event delivered to webhook");
        Ok(())
    }
}

/// An outbound message from the host.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SendRequest {
    pub(crate) message: String,
    pub(crate) target: OneOrMany,
}

impl SendRequest {
    pub(crate) fn parse(line: &str) -> Result<Self> {
        let request: Self = serde_json::from_str(line).context("parsing send request")?;
        if matches!(&request.target, OneOrMany::Many(targets) if targets.is_empty()) {
            bail!("send request has no target");
        }
        Ok(request)
    }
}

/// Reads send requests line by line until the input closes. Bad lines and
/// failed deliveries are logged; neither ends the loop.
pub(crate) async fn serve_send_requests<R>(dispatcher: &MessageDispatcher, input: R) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await.context("reading send requests")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let request = match SendRequest::parse(line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = ?e, "Ignoring malformed send request");
                continue;
            }
        };
        let targets = request.target.into_vec();
        let report = dispatcher.send(&request.message, &targets).await;
        info!(
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "Send request handled"
        );
    }
    debug!("Send request input closed");
    Ok(())
}
