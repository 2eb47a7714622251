//! Push socket: authenticates, feeds message events into the cache and
//! reconnects with exponential backoff.

use std::{sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use shared::{
    protocol::{PushEnvelope, PushEvent},
    validation::decode_envelope,
};
use tokio::{sync::broadcast, task::JoinHandle, time::sleep};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{api::ApiClient, error::ClientError, message_cache::MessageCache};

const STATUS_CHANNEL_CAPACITY: usize = 64;
const BACKOFF_MULTIPLIER: u32 = 2;

/// Reconnect delays: `initial`, doubling per failed attempt, capped at `max`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self
            .current
            .saturating_mul(BACKOFF_MULTIPLIER)
            .min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushStatus {
    Connecting { attempt: u32 },
    /// Socket open and auth frame sent.
    Connected,
    /// The backend accepted the token.
    Ready,
    Reconnecting { delay: Duration },
    Stopped { reason: String },
}

pub struct PushHandle {
    task: JoinHandle<()>,
    status: broadcast::Sender<PushStatus>,
}

impl PushHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<PushStatus> {
        self.status.subscribe()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn shutdown(self) {
        self.task.abort();
    }
}

impl Drop for PushHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum SessionEnd {
    Closed,
    AuthRejected { reason: String },
}

pub struct PushStream {
    ws_url: Url,
    api: Arc<ApiClient>,
    cache: Arc<MessageCache>,
    backoff: Backoff,
    status: broadcast::Sender<PushStatus>,
}

impl PushStream {
    pub fn spawn(
        ws_url: Url,
        api: Arc<ApiClient>,
        cache: Arc<MessageCache>,
        backoff: Backoff,
    ) -> PushHandle {
        let (status, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let stream = PushStream {
            ws_url,
            api,
            cache,
            backoff,
            status: status.clone(),
        };
        let task = tokio::spawn(stream.run());
        PushHandle { task, status }
    }

    async fn run(mut self) {
        loop {
            // Re-read on every attempt: a refresh may have rotated the token.
            let token = match self.api.access_token().await {
                Ok(Some(token)) => token,
                Ok(None) => {
                    self.stop("no active session");
                    return;
                }
                Err(err) => {
                    error!(error = %err, "push: failed to read session tokens");
                    self.stop(&err.to_string());
                    return;
                }
            };

            self.publish(PushStatus::Connecting {
                attempt: self.backoff.attempt(),
            });
            match self.run_session(&token).await {
                Ok(SessionEnd::Closed) => info!(url = %self.ws_url, "push: socket closed"),
                Ok(SessionEnd::AuthRejected { reason }) => {
                    warn!(reason = %reason, "push: backend rejected access token");
                    match self.api.refresh_after_rejection(Some(&token)).await {
                        Ok(_) => debug!("push: token refreshed; reconnecting"),
                        Err(err) if err.requires_login() => {
                            self.stop(&err.to_string());
                            return;
                        }
                        Err(err) => warn!(error = %err, "push: token refresh failed; retrying"),
                    }
                }
                Err(err) => warn!(url = %self.ws_url, error = %err, "push: connection failed"),
            }

            let delay = self.backoff.next_delay();
            info!(
                attempt = self.backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "push: reconnecting"
            );
            self.publish(PushStatus::Reconnecting { delay });
            sleep(delay).await;
        }
    }

    async fn run_session(&mut self, token: &str) -> Result<SessionEnd, ClientError> {
        let (socket, _) = connect_async(self.ws_url.as_str())
            .await
            .map_err(|err| ClientError::Push(format!("failed to connect {}: {err}", self.ws_url)))?;
        let (mut writer, mut reader) = socket.split();

        let auth = serde_json::to_string(&PushEnvelope::auth(token))
            .map_err(|err| ClientError::Push(format!("failed to encode auth frame: {err}")))?;
        writer
            .send(WsMessage::Text(auth))
            .await
            .map_err(|err| ClientError::Push(format!("failed to send auth frame: {err}")))?;
        self.publish(PushStatus::Connected);

        while let Some(frame) = reader.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => match decode_envelope(&text) {
                    Ok(PushEvent::AuthFailed { reason }) => {
                        return Ok(SessionEnd::AuthRejected { reason })
                    }
                    Ok(event) => self.apply(event),
                    Err(err) => warn!(error = %err, "push: dropping invalid frame"),
                },
                Ok(WsMessage::Close(_)) => return Ok(SessionEnd::Closed),
                Ok(_) => {}
                Err(err) => return Err(ClientError::Push(format!("receive failed: {err}"))),
            }
        }
        Ok(SessionEnd::Closed)
    }

    fn apply(&mut self, event: PushEvent) {
        match event {
            PushEvent::Initialized => {
                self.backoff.reset();
                info!(url = %self.ws_url, "push: session initialized");
                self.publish(PushStatus::Ready);
            }
            PushEvent::IncomingMessage(message) | PushEvent::MessageUpdated(message) => {
                debug!(message_id = %message.id, "push: message event");
                self.cache.apply_push(message);
            }
            PushEvent::MessageDeleted(deleted) => match deleted.target() {
                Some(target) => {
                    if !self.cache.remove(&target, &deleted.id) {
                        debug!(message_id = %deleted.id, %target, "push: deleted message not cached");
                    }
                }
                None => warn!(
                    message_id = %deleted.id,
                    "push: deletion has no channel or group id; dropping"
                ),
            },
            PushEvent::AuthFailed { .. } => {}
        }
    }

    fn stop(&self, reason: &str) {
        info!(reason, "push: stopped");
        self.publish(PushStatus::Stopped {
            reason: reason.to_string(),
        });
    }

    fn publish(&self, status: PushStatus) {
        let _ = self.status.send(status);
    }
}

#[cfg(test)]
#[path = "tests/push_tests.rs"]
mod tests;
