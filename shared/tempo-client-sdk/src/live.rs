//! Live update feed - WebSocket subscription that keeps local tiers fresh
//!
//! Reconnects with capped exponential backoff. Any disconnect or lag signal
//! means updates may have been missed, so coverage is discarded and the next
//! queries re-fetch from the service.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use tempo_core::{EntityType, LiveUpdateMessage, Result, TempoError};

use crate::manager::CacheManager;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Frames the service pushes over `/v1/live`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Update(LiveUpdateMessage),
    ResyncRequired {
        dropped: u64,
    },
    Subscribed {
        entity_type: Option<String>,
        entity_id: Option<String>,
    },
    Unsubscribed,
    Pong,
    Error {
        code: String,
        message: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Subscribe {
        entity_type: Option<String>,
        entity_id: Option<String>,
    },
}

pub struct LiveFeed {
    manager: Arc<CacheManager>,
    url: String,
    entity_type: Option<EntityType>,
    entity_id: Option<String>,
}

impl LiveFeed {
    pub fn new(
        manager: Arc<CacheManager>,
        url: impl Into<String>,
        entity_type: Option<EntityType>,
        entity_id: Option<String>,
    ) -> Self {
        Self {
            manager,
            url: url.into(),
            entity_type,
            entity_id,
        }
    }

    /// Fold one server frame into the local cache state.
    pub async fn apply(&self, event: ServerEvent) -> Result<()> {
        match event {
            ServerEvent::Update(msg) => self.manager.apply_live_update(msg).await,
            ServerEvent::ResyncRequired { dropped } => {
                self.manager.handle_resync_required(dropped);
                Ok(())
            }
            ServerEvent::Subscribed {
                entity_type,
                entity_id,
            } => {
                debug!(?entity_type, ?entity_id, "Live subscription confirmed");
                Ok(())
            }
            ServerEvent::Unsubscribed | ServerEvent::Pong => Ok(()),
            ServerEvent::Error { code, message } => {
                warn!(code, message, "Live feed server error");
                Ok(())
            }
        }
    }

    /// Run the feed until cancelled, reconnecting on failure.
    pub async fn run(&self) -> Result<()> {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match self.session().await {
                Ok(()) => {
                    info!("Live feed closed by server; reconnecting");
                    backoff = INITIAL_BACKOFF;
                }
                Err(e) => {
                    warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "Live feed failed");
                }
            }
            // Whatever happened, updates may have been missed while away.
            self.manager.handle_resync_required(0);

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn session(&self) -> Result<()> {
        let (stream, _) = connect_async(&self.url)
            .await
            .map_err(|e| TempoError::Network(e.to_string()))?;
        let (mut sink, mut source) = stream.split();
        info!(url = %self.url, "Live feed connected");

        let subscribe = ClientFrame::Subscribe {
            entity_type: self.entity_type.as_ref().map(|t| t.to_string()),
            entity_id: self.entity_id.clone(),
        };
        sink.send(Message::Text(serde_json::to_string(&subscribe)?.into()))
            .await
            .map_err(|e| TempoError::Network(e.to_string()))?;

        while let Some(frame) = source.next().await {
            match frame.map_err(|e| TempoError::Network(e.to_string()))? {
                Message::Text(text) => match serde_json::from_str::<ServerEvent>(&text) {
                    Ok(event) => self.apply(event).await?,
                    Err(e) => debug!(error = %e, "Ignoring unparseable live frame"),
                },
                Message::Ping(payload) => {
                    sink.send(Message::Pong(payload))
                        .await
                        .map_err(|e| TempoError::Network(e.to_string()))?;
                }
                Message::Close(_) => return Ok(()),
                _ => {}
            }
        }
        Ok(())
    }
}
