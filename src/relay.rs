use crate::adapters::{ChatChunk, ChunkSink, GenerationContext};
use crate::coordination::CoordinationStore;
use crate::dispatch::Dispatcher;
use crate::error::AppError;
use crate::objectstore::ObjectStore;
use crate::ticket::TicketCache;
use crate::usage::{RecordStore, UsageRecorder};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Why a payload could not be handed to the client right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// Transport buffer is full; the payload may fit after a short wait.
    Full,
    /// The client is gone; nothing will ever be deliverable again.
    Gone,
}

/// One client connection as the relay sees it. Implementations wrap
/// whatever the server hands out (an SSE event channel, a test capture).
pub trait ClientTransport: Send + Sync {
    fn send(&self, payload: String) -> Result<(), SendError>;
    fn close(&self);
}

/// Wire payload delivered to the client, one JSON object per event.
#[derive(Debug, Serialize)]
struct RelayPayload<'a> {
    data: &'a str,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    is_reasoning: bool,
    is_finished: bool,
    log_id: &'a str,
}

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub retry_times: u32,
    pub retry_sleep: Duration,
}

enum Delivery {
    Delivered,
    Closed,
}

fn closed_key(session_id: &str) -> String {
    format!("session:closed:{session_id}")
}

/// Pulls normalized chunks out of an adapter and pushes wire payloads to
/// one client, absorbing the impedance mismatch between the two: upstream
/// reads never block on the client, and a slow or vanished client ends the
/// session instead of wedging it.
#[derive(Clone)]
pub struct StreamRelay {
    tickets: TicketCache,
    dispatcher: Dispatcher,
    records: Arc<dyn RecordStore>,
    coordination: Arc<dyn CoordinationStore>,
    http: reqwest::Client,
    objects: Arc<dyn ObjectStore>,
    rehost_images: bool,
    settings: RelaySettings,
}

impl StreamRelay {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tickets: TicketCache,
        dispatcher: Dispatcher,
        records: Arc<dyn RecordStore>,
        coordination: Arc<dyn CoordinationStore>,
        http: reqwest::Client,
        objects: Arc<dyn ObjectStore>,
        rehost_images: bool,
        settings: RelaySettings,
    ) -> Self {
        Self {
            tickets,
            dispatcher,
            records,
            coordination,
            http,
            objects,
            rehost_images,
            settings,
        }
    }

    /// Record that the client for `session_id` hung up. Checked by the
    /// delivery loop before every send and retry.
    pub async fn mark_closed(&self, session_id: &str) {
        let key = closed_key(session_id);
        if let Err(err) = self
            .coordination
            .set_if_absent(&key, "1", Duration::from_secs(3600))
            .await
        {
            tracing::warn!(session_id, error = %err, "closed flag write failed");
        }
    }

    /// Run one streaming session end to end: redeem the ticket, start the
    /// adapter, pump chunks until the stream or the client ends. The client
    /// sees exactly one terminal payload unless it disconnected first.
    pub async fn run(&self, session_id: &str, ticket: &str, transport: &dyn ClientTransport) {
        let staged = match self.tickets.take_once(ticket).await {
            Ok(Some(staged)) => staged,
            Ok(None) => {
                self.finish_with_error(session_id, transport, "", &AppError::ticket_invalid())
                    .await;
                return;
            }
            Err(err) => {
                tracing::error!(session_id, error = %err, "ticket lookup failed");
                self.finish_with_error(
                    session_id,
                    transport,
                    "",
                    &AppError::internal("ticket_store", err),
                )
                .await;
                return;
            }
        };

        let (config, adapter) = match self.dispatcher.resolve(&staged.model).await {
            Ok(resolved) => resolved,
            Err(err) => {
                self.finish_with_error(session_id, transport, "", &err).await;
                return;
            }
        };

        let recorder =
            match UsageRecorder::begin(self.records.clone(), &staged.user_id, &staged.model).await {
                Ok(recorder) => recorder,
                Err(err) => {
                    tracing::error!(session_id, error = %err, "usage record create failed");
                    self.finish_with_error(
                        session_id,
                        transport,
                        "",
                        &AppError::internal("usage_store", err),
                    )
                    .await;
                    return;
                }
            };
        let log_id = recorder.record_id().to_string();
        tracing::info!(
            session_id,
            model = %staged.model,
            user_id = %staged.user_id,
            log_id = %log_id,
            "stream session started"
        );

        let (tx, rx) = mpsc::channel(32);
        let mut ctx = GenerationContext {
            model: config,
            messages: staged.messages,
            params: staged.params,
            user_id: staged.user_id,
            recorder,
            http: self.http.clone(),
            objects: self.objects.clone(),
            rehost_images: self.rehost_images,
        };
        let adapter_task = tokio::spawn(async move {
            let sink = ChunkSink::new(tx);
            adapter.generate(&mut ctx, &sink).await;
        });

        self.pump(session_id, &log_id, rx, transport).await;
        // The adapter always runs to completion so the usage record is
        // finalized even when the client left mid-stream.
        if let Err(err) = adapter_task.await {
            tracing::error!(session_id, error = %err, "adapter task panicked");
        }
    }

    /// Deliver chunks until the adapter finishes or the client goes away,
    /// then emit the single terminal payload.
    async fn pump(
        &self,
        session_id: &str,
        log_id: &str,
        mut rx: mpsc::Receiver<ChatChunk>,
        transport: &dyn ClientTransport,
    ) {
        while let Some(chunk) = rx.recv().await {
            let delivery = match chunk {
                ChatChunk::Text(text) => {
                    self.deliver(
                        session_id,
                        transport,
                        &RelayPayload {
                            data: &text,
                            is_reasoning: false,
                            is_finished: false,
                            log_id,
                        },
                    )
                    .await
                }
                ChatChunk::Reasoning(text) => {
                    self.deliver(
                        session_id,
                        transport,
                        &RelayPayload {
                            data: &text,
                            is_reasoning: true,
                            is_finished: false,
                            log_id,
                        },
                    )
                    .await
                }
                ChatChunk::Error(message) => {
                    self.deliver(
                        session_id,
                        transport,
                        &RelayPayload {
                            data: &message,
                            is_reasoning: false,
                            is_finished: true,
                            log_id,
                        },
                    )
                    .await;
                    transport.close();
                    return;
                }
            };
            if matches!(delivery, Delivery::Closed) {
                tracing::info!(session_id, "client gone, dropping the session");
                transport.close();
                return;
            }
        }
        self.deliver(
            session_id,
            transport,
            &RelayPayload {
                data: "",
                is_reasoning: false,
                is_finished: true,
                log_id,
            },
        )
        .await;
        transport.close();
    }

    async fn finish_with_error(
        &self,
        session_id: &str,
        transport: &dyn ClientTransport,
        log_id: &str,
        err: &AppError,
    ) {
        self.deliver(
            session_id,
            transport,
            &RelayPayload {
                data: &err.message,
                is_reasoning: false,
                is_finished: true,
                log_id,
            },
        )
        .await;
        transport.close();
    }

    /// One payload, `retry_times` redeliveries on backpressure. The closed
    /// flag is consulted before the first attempt and before every retry so
    /// a dead client stops the session instead of sleeping through retries.
    async fn deliver(
        &self,
        session_id: &str,
        transport: &dyn ClientTransport,
        payload: &RelayPayload<'_>,
    ) -> Delivery {
        let encoded = match serde_json::to_string(payload) {
            Ok(encoded) => encoded,
            Err(err) => {
                tracing::error!(session_id, error = %err, "payload encode failed");
                return Delivery::Closed;
            }
        };
        let mut attempts = 0;
        loop {
            if self.is_closed(session_id).await {
                return Delivery::Closed;
            }
            match transport.send(encoded.clone()) {
                Ok(()) => return Delivery::Delivered,
                Err(SendError::Gone) => return Delivery::Closed,
                Err(SendError::Full) => {
                    if attempts >= self.settings.retry_times {
                        tracing::warn!(
                            session_id,
                            attempts,
                            "client too slow, delivery abandoned"
                        );
                        metrics::counter!("aigate_relay_backpressure_drops_total").increment(1);
                        return Delivery::Closed;
                    }
                    attempts += 1;
                    tokio::time::sleep(self.settings.retry_sleep).await;
                }
            }
        }
    }

    async fn is_closed(&self, session_id: &str) -> bool {
        match self.coordination.get(&closed_key(session_id)).await {
            Ok(flag) => flag.is_some(),
            Err(err) => {
                tracing::warn!(session_id, error = %err, "closed flag read failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ModelCatalog;
    use crate::coordination::MemoryCoordinationStore;
    use crate::objectstore::MemoryObjectStore;
    use crate::usage::MemoryRecordStore;
    use serde_json::Value;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Default)]
    struct CaptureTransport {
        sent: Mutex<Vec<String>>,
        closed: AtomicBool,
        reject_full: AtomicU32,
        gone: AtomicBool,
    }

    impl ClientTransport for CaptureTransport {
        fn send(&self, payload: String) -> Result<(), SendError> {
            if self.gone.load(Ordering::SeqCst) {
                return Err(SendError::Gone);
            }
            if self.reject_full.load(Ordering::SeqCst) > 0 {
                self.reject_full.fetch_sub(1, Ordering::SeqCst);
                return Err(SendError::Full);
            }
            self.sent.lock().unwrap().push(payload);
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    impl CaptureTransport {
        fn payloads(&self) -> Vec<Value> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|raw| serde_json::from_str(raw).unwrap())
                .collect()
        }

        fn terminal_count(&self) -> usize {
            self.payloads()
                .iter()
                .filter(|p| p["is_finished"] == Value::Bool(true))
                .count()
        }
    }

    fn relay(coordination: Arc<dyn CoordinationStore>) -> StreamRelay {
        StreamRelay::new(
            TicketCache::new(coordination.clone(), Duration::from_secs(60)),
            Dispatcher::new(ModelCatalog::new(), Vec::new()),
            Arc::new(MemoryRecordStore::default()),
            coordination,
            reqwest::Client::new(),
            Arc::new(MemoryObjectStore::default()),
            false,
            RelaySettings {
                retry_times: 2,
                retry_sleep: Duration::from_millis(1),
            },
        )
    }

    async fn pump_chunks(relay: &StreamRelay, transport: &CaptureTransport, chunks: Vec<ChatChunk>) {
        let (tx, rx) = mpsc::channel(32);
        for chunk in chunks {
            tx.send(chunk).await.unwrap();
        }
        drop(tx);
        relay.pump("session-1", "log_test", rx, transport).await;
    }

    #[tokio::test]
    async fn finished_stream_gets_exactly_one_terminal() {
        let transport = CaptureTransport::default();
        let relay = relay(Arc::new(MemoryCoordinationStore::default()));
        pump_chunks(
            &relay,
            &transport,
            vec![
                ChatChunk::Text("hel".to_string()),
                ChatChunk::Text("lo".to_string()),
            ],
        )
        .await;
        let payloads = transport.payloads();
        assert_eq!(payloads.len(), 3);
        assert_eq!(payloads[0]["data"], "hel");
        assert_eq!(payloads[0]["is_finished"], false);
        assert_eq!(payloads[0]["log_id"], "log_test");
        assert_eq!(transport.terminal_count(), 1);
        assert!(transport.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn empty_stream_still_gets_a_terminal() {
        let transport = CaptureTransport::default();
        let relay = relay(Arc::new(MemoryCoordinationStore::default()));
        pump_chunks(&relay, &transport, Vec::new()).await;
        assert_eq!(transport.terminal_count(), 1);
    }

    #[tokio::test]
    async fn error_chunk_is_the_terminal() {
        let transport = CaptureTransport::default();
        let relay = relay(Arc::new(MemoryCoordinationStore::default()));
        pump_chunks(
            &relay,
            &transport,
            vec![
                ChatChunk::Text("partial".to_string()),
                ChatChunk::Error("upstream broke".to_string()),
            ],
        )
        .await;
        let payloads = transport.payloads();
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[1]["data"], "upstream broke");
        assert_eq!(payloads[1]["is_finished"], true);
        assert_eq!(transport.terminal_count(), 1);
    }

    #[tokio::test]
    async fn reasoning_chunks_are_flagged() {
        let transport = CaptureTransport::default();
        let relay = relay(Arc::new(MemoryCoordinationStore::default()));
        pump_chunks(
            &relay,
            &transport,
            vec![
                ChatChunk::Reasoning("mull".to_string()),
                ChatChunk::Text("answer".to_string()),
            ],
        )
        .await;
        let payloads = transport.payloads();
        assert_eq!(payloads[0]["is_reasoning"], true);
        assert!(payloads[1].get("is_reasoning").is_none());
    }

    #[tokio::test]
    async fn transient_backpressure_is_retried() {
        let transport = CaptureTransport::default();
        transport.reject_full.store(2, Ordering::SeqCst);
        let relay = relay(Arc::new(MemoryCoordinationStore::default()));
        pump_chunks(&relay, &transport, vec![ChatChunk::Text("hi".to_string())]).await;
        let payloads = transport.payloads();
        assert_eq!(payloads[0]["data"], "hi");
        assert_eq!(transport.terminal_count(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_end_the_session() {
        let transport = CaptureTransport::default();
        transport.reject_full.store(100, Ordering::SeqCst);
        let relay = relay(Arc::new(MemoryCoordinationStore::default()));
        pump_chunks(&relay, &transport, vec![ChatChunk::Text("hi".to_string())]).await;
        assert!(transport.payloads().is_empty());
        assert!(transport.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn gone_client_stops_immediately() {
        let transport = CaptureTransport::default();
        transport.gone.store(true, Ordering::SeqCst);
        let relay = relay(Arc::new(MemoryCoordinationStore::default()));
        pump_chunks(
            &relay,
            &transport,
            vec![
                ChatChunk::Text("a".to_string()),
                ChatChunk::Text("b".to_string()),
            ],
        )
        .await;
        assert!(transport.payloads().is_empty());
        assert!(transport.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn closed_flag_short_circuits_delivery() {
        let coordination: Arc<dyn CoordinationStore> =
            Arc::new(MemoryCoordinationStore::default());
        let relay = relay(coordination.clone());
        relay.mark_closed("session-1").await;
        let transport = CaptureTransport::default();
        pump_chunks(&relay, &transport, vec![ChatChunk::Text("hi".to_string())]).await;
        assert!(transport.payloads().is_empty());
    }

    #[tokio::test]
    async fn unknown_ticket_yields_terminal_error() {
        let transport = CaptureTransport::default();
        let relay = relay(Arc::new(MemoryCoordinationStore::default()));
        relay.run("session-1", "no-such-ticket", &transport).await;
        let payloads = transport.payloads();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0]["is_finished"], true);
        assert_eq!(transport.terminal_count(), 1);
    }
}
