//! Stream Relay
//!
//! Forwards a conversational completion to a caller as it arrives. Quota is reserved up
//! front from the estimated request size plus a fixed reply allowance; a rejection is
//! returned before any event is sent. After that every outcome is reported in-band: deltas
//! in order, then exactly one `Done` or one `Error`.

use crate::error::{ApiError, ProviderError};
use crate::logging::{LogThrottle, ThrottleDecision};
use crate::provider::{ChatMessage, CompletionOptions, GenerativeClient};
use crate::quota::{estimate_json_tokens, QuotaLedger, Reservation};
use futures::StreamExt;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const THROTTLE_CHANNEL: &str = "relay.error";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RelayEvent {
    Delta { content: String },
    Done,
    Error { message: String },
}

impl RelayEvent {
    /// Render as one Server-Sent-Events frame.
    pub fn to_sse(&self) -> String {
        match self {
            RelayEvent::Delta { content } => format!("data: {}\n\n", json!({ "content": content })),
            RelayEvent::Error { message } => format!("data: {}\n\n", json!({ "error": message })),
            RelayEvent::Done => "data: [DONE]\n\n".to_string(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RelayEvent::Delta { .. })
    }
}

#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub identity: String,
    pub bypass_quota: bool,
    pub messages: Vec<ChatMessage>,
    pub max_output_tokens: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    Done,
    Error,
    /// The caller stopped listening
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySummary {
    pub fragments: usize,
    pub characters: usize,
    pub tokens_reserved: u64,
    pub reservation: Reservation,
    pub end: RelayEnd,
}

pub struct StreamRelay {
    client: Arc<dyn GenerativeClient>,
    ledger: Option<Arc<QuotaLedger>>,
    estimated_response_tokens: u64,
    throttle: Arc<LogThrottle>,
}

impl StreamRelay {
    pub fn new(
        client: Arc<dyn GenerativeClient>,
        ledger: Option<Arc<QuotaLedger>>,
        estimated_response_tokens: u64,
        throttle: Arc<LogThrottle>,
    ) -> Self {
        Self {
            client,
            ledger,
            estimated_response_tokens,
            throttle,
        }
    }

    /// Tokens a request will be charged before streaming starts.
    pub fn estimate(&self, request: &RelayRequest) -> u64 {
        estimate_json_tokens(&request.messages) + self.estimated_response_tokens
    }

    pub async fn relay(
        &self,
        request: RelayRequest,
        tx: mpsc::Sender<RelayEvent>,
    ) -> Result<RelaySummary, ApiError> {
        if request.messages.is_empty() {
            return Err(ApiError::InvalidRequest(
                "a conversation needs at least one message".to_string(),
            ));
        }
        let tokens_reserved = self.estimate(&request);
        let reservation = match &self.ledger {
            Some(ledger) => {
                ledger.reserve_for(&request.identity, tokens_reserved, request.bypass_quota)?
            }
            None => Reservation::Disabled,
        };

        let mut summary = RelaySummary {
            fragments: 0,
            characters: 0,
            tokens_reserved,
            reservation,
            end: RelayEnd::Done,
        };

        let options = CompletionOptions {
            temperature: None,
            max_tokens: request.max_output_tokens,
            json_response: false,
        };
        let mut stream = match self.client.stream(request.messages, options).await {
            Ok(stream) => stream,
            Err(err) => {
                self.log_failure(&request.identity, &err);
                summary.end = self.finish(&tx, error_event(&err)).await;
                return Ok(summary);
            }
        };

        while let Some(item) = stream.next().await {
            match item {
                Ok(content) => {
                    if content.is_empty() {
                        continue;
                    }
                    let characters = content.chars().count();
                    if tx.send(RelayEvent::Delta { content }).await.is_err() {
                        debug!(identity = %request.identity, "relay receiver dropped");
                        summary.end = RelayEnd::Disconnected;
                        return Ok(summary);
                    }
                    summary.fragments += 1;
                    summary.characters += characters;
                }
                Err(err) => {
                    self.log_failure(&request.identity, &err);
                    summary.end = self.finish(&tx, error_event(&err)).await;
                    return Ok(summary);
                }
            }
        }

        summary.end = self.finish(&tx, RelayEvent::Done).await;
        debug!(
            identity = %request.identity,
            fragments = summary.fragments,
            characters = summary.characters,
            "relay finished"
        );
        Ok(summary)
    }

    async fn finish(&self, tx: &mpsc::Sender<RelayEvent>, event: RelayEvent) -> RelayEnd {
        let end = match event {
            RelayEvent::Error { .. } => RelayEnd::Error,
            _ => RelayEnd::Done,
        };
        match tx.send(event).await {
            Ok(()) => end,
            Err(_) => RelayEnd::Disconnected,
        }
    }

    fn log_failure(&self, identity: &str, err: &ProviderError) {
        if let ThrottleDecision::Emit { suppressed } = self.throttle.check(THROTTLE_CHANNEL) {
            warn!(identity, error = %err, suppressed, "conversation stream failed");
        }
    }
}

fn error_event(err: &ProviderError) -> RelayEvent {
    RelayEvent::Error {
        message: err.to_string(),
    }
}
