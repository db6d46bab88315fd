use async_trait::async_trait;
use chrono::Utc;
use colony_eventstream::EventStream;
use colony_store::Store;
use colony_types::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Delivery attempts are spaced by these delays; the final entry's failure
/// is permanent. Four attempts total (one immediate, three retried).
const BACKOFF_MS: [u64; 3] = [250, 500, 1000];

/// Delivery seam. `send` hands every attempt to this trait and only
/// inspects whether it succeeded — the backoff, retry count and the
/// resulting `SendExhausted` error live in `Messaging` itself.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(&self, envelope: &MessageEnvelope) -> ColonyResult<()>;
}

/// The shipped transport: writes straight into the recipient's inbox row.
/// Every in-process agent shares one store, so "delivery" is just an
/// insert of the wire-wrapped envelope.
pub struct LoopbackTransport {
    store: Arc<Store>,
}

impl LoopbackTransport {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn deliver(&self, envelope: &MessageEnvelope) -> ColonyResult<()> {
        let wire = WireEnvelope {
            protocol: COLONY_MESSAGE_PROTOCOL.to_string(),
            sent_at: Utc::now(),
            message: envelope.clone(),
        };
        let content = serde_json::to_string(&wire)?;
        let msg = InboxMessage {
            id: new_id(),
            from: envelope.from.clone(),
            to: envelope.to.clone(),
            content,
            status: InboxMessageStatus::Received,
            retry_count: 0,
            max_retries: 3,
            received_at: Utc::now(),
            processed_at: None,
        };
        self.store.insert_inbox_message(&msg).await
    }
}

/// Reacts to one delivered envelope of a given `MessageType`. Handlers are
/// registered per type; `process_inbox` looks one up by the envelope it
/// just claimed and dispatches to it.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: &MessageEnvelope) -> ColonyResult<()>;
}

/// Typed messaging over the inbox table: validated, retried sends and
/// priority-ordered, handler-dispatched inbox draining.
pub struct Messaging {
    store: Arc<Store>,
    transport: Arc<dyn Transport>,
    handlers: HashMap<MessageType, Arc<dyn MessageHandler>>,
}

impl Messaging {
    pub fn new(store: Arc<Store>, transport: Arc<dyn Transport>) -> Self {
        Self {
            store,
            transport,
            handlers: HashMap::new(),
        }
    }

    /// Builder-style registration; call before sharing the instance.
    pub fn with_handler(mut self, message_type: MessageType, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.insert(message_type, handler);
        self
    }

    fn validate(envelope: &MessageEnvelope) -> ColonyResult<()> {
        if envelope.to.is_empty() {
            return Err(ColonyError::InvalidInput("envelope.to must not be empty".into()));
        }
        if envelope.from.is_empty() {
            return Err(ColonyError::InvalidInput("envelope.from must not be empty".into()));
        }
        if let Some(expires_at) = envelope.expires_at {
            if expires_at < Utc::now() {
                return Err(ColonyError::InvalidInput(format!(
                    "envelope {} already expired at {expires_at}",
                    envelope.id
                )));
            }
        }
        Ok(())
    }

    /// Validates, then attempts delivery with backoff between retries.
    /// Records an `action` event on success; raises `SendExhausted` after
    /// the final attempt fails.
    pub async fn send(&self, mut envelope: MessageEnvelope) -> ColonyResult<()> {
        if envelope.id.is_empty() {
            envelope.id = new_id();
        }
        Self::validate(&envelope)?;

        let mut last_err: Option<ColonyError> = None;
        for attempt in 0..=BACKOFF_MS.len() {
            match self.transport.deliver(&envelope).await {
                Ok(()) => {
                    let stream = EventStream::new(&self.store);
                    stream
                        .append(StreamEvent {
                            id: String::new(),
                            event_type: StreamEventType::Action,
                            agent_address: envelope.from.clone(),
                            goal_id: envelope.goal_id.clone(),
                            task_id: envelope.task_id.clone(),
                            content: format!(
                                "sent {:?} to {} (attempt {})",
                                envelope.message_type,
                                envelope.to,
                                attempt + 1
                            ),
                            token_count: 0,
                            compacted_to: None,
                            created_at: Utc::now(),
                        })
                        .await?;
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        to = %envelope.to,
                        error = %e,
                        "message delivery attempt failed"
                    );
                    last_err = Some(e);
                    if attempt < BACKOFF_MS.len() {
                        tokio::time::sleep(Duration::from_millis(BACKOFF_MS[attempt])).await;
                    }
                }
            }
        }
        Err(ColonyError::SendExhausted(format!(
            "{} to {} after {} attempts: {}",
            envelope.id,
            envelope.to,
            BACKOFF_MS.len() + 1,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Claims up to `batch_size` received messages for `to`, sorts them by
    /// priority (critical first) and then FIFO within a priority tier, and
    /// dispatches each to its registered handler. A message is moved to
    /// `processed` whether its handler succeeds or fails — an unhandled
    /// or malformed message should not jam the inbox forever — but handler
    /// errors are logged so the failure is still visible.
    pub async fn process_inbox(&self, to: &str, batch_size: usize) -> ColonyResult<usize> {
        let claimed = self.store.claim_inbox_messages(to, batch_size).await?;

        let mut envelopes = Vec::with_capacity(claimed.len());
        for msg in claimed {
            match serde_json::from_str::<WireEnvelope>(&msg.content) {
                Ok(wire) => {
                    if let Some(expires_at) = wire.message.expires_at {
                        if expires_at < Utc::now() {
                            tracing::warn!(message_id = %msg.id, "dropping expired inbox message");
                            let mut msg = msg;
                            msg.status = InboxMessageStatus::Failed;
                            msg.processed_at = Some(Utc::now());
                            self.store.update_inbox_message(&msg).await?;
                            continue;
                        }
                    }
                    envelopes.push((msg, wire.message));
                }
                Err(e) => {
                    tracing::error!(message_id = %msg.id, error = %e, "dropping malformed inbox message");
                    let mut msg = msg;
                    msg.status = InboxMessageStatus::Failed;
                    msg.processed_at = Some(Utc::now());
                    self.store.update_inbox_message(&msg).await?;
                }
            }
        }

        envelopes.sort_by(|(_, a), (_, b)| {
            b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at))
        });

        let mut processed = 0usize;
        for (mut msg, envelope) in envelopes {
            let outcome = match self.handlers.get(&envelope.message_type) {
                Some(handler) => handler.handle(&envelope).await,
                None => Err(ColonyError::InvalidState(format!(
                    "no handler registered for {:?}",
                    envelope.message_type
                ))),
            };
            if let Err(e) = &outcome {
                tracing::error!(message_id = %msg.id, error = %e, "inbox handler failed");
            }
            msg.status = InboxMessageStatus::Processed;
            msg.processed_at = Some(Utc::now());
            self.store.update_inbox_message(&msg).await?;
            processed += 1;
        }
        Ok(processed)
    }

    /// Puts an `in_progress` or `failed` message back in front of the
    /// queue for another attempt if it has retry budget left, otherwise
    /// marks it permanently `failed`. Returns `true` if it was requeued.
    pub async fn requeue(&self, message_id: &str) -> ColonyResult<bool> {
        let mut msg = self
            .store
            .get_inbox_message(message_id)
            .await?
            .ok_or_else(|| ColonyError::NotFound(format!("inbox message {message_id}")))?;

        if msg.retry_count < msg.max_retries {
            msg.retry_count += 1;
            msg.status = InboxMessageStatus::Received;
            msg.processed_at = None;
            self.store.update_inbox_message(&msg).await?;
            Ok(true)
        } else {
            msg.status = InboxMessageStatus::Failed;
            msg.processed_at = Some(Utc::now());
            self.store.update_inbox_message(&msg).await?;
            Ok(false)
        }
    }
}
