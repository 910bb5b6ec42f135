use futures::StreamExt;
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::assembler::{Progress, ResponseAssembler};
use super::types::Snapshot;
use crate::core::StreamError;
use crate::eventsource::EventStream;

/// `Ok(None)` marks an orderly end of stream.
type Delivery = Result<Option<Snapshot>, StreamError>;

/// Pull side of a streaming response.
///
/// A background pump reads the event source, folds every event through a
/// [`ResponseAssembler`] and hands snapshots over a single-slot channel, so
/// the pump waits whenever the caller has not yet taken the previous one.
pub struct StreamHandle {
    rx: mpsc::Receiver<Delivery>,
    cancel: CancellationToken,
    pump: Option<JoinHandle<()>>,
    transcript: String,
    last: Option<Snapshot>,
    finished: bool,
}

/// Closes a [`StreamHandle`] from another task, e.g. while `receive` is pending.
#[derive(Clone)]
pub struct CloseHandle(CancellationToken);

impl CloseHandle {
    pub fn close(&self) {
        self.0.cancel();
    }
}

impl StreamHandle {
    /// Starts pumping `events`. Must be called within a tokio runtime.
    pub fn spawn(events: EventStream) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let pump = tokio::spawn(pump(events, tx, cancel.clone()));

        Self {
            rx,
            cancel,
            pump: Some(pump),
            transcript: String::new(),
            last: None,
            finished: false,
        }
    }

    /// Waits for the next snapshot.
    ///
    /// Returns `Ok(Some(_))` per meaningful event, `Ok(None)` once after
    /// `message_stop`, or a terminal `Err`. Calling again after a terminal
    /// result is a caller error and yields `Err(StreamError::Closed)`.
    pub async fn receive(&mut self) -> Delivery {
        if self.finished {
            return Err(StreamError::Closed);
        }

        let delivery = tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(StreamError::Closed),
            delivery = self.rx.recv() => delivery.unwrap_or(Err(StreamError::Closed)),
        };

        match &delivery {
            Ok(Some(snapshot)) => {
                self.transcript.push_str(&snapshot.text());
                self.last = Some(snapshot.clone());
            }
            Ok(None) | Err(_) => {
                self.finished = true;
                self.close();
            }
        }
        delivery
    }

    /// Releases the connection and stops the pump. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.cancel.cancel();
        self.rx.close();
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }

    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle(self.cancel.clone())
    }

    /// Concatenation of every text fragment received so far.
    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    /// The most recent snapshot received, kept after a terminal error.
    pub fn last_snapshot(&self) -> Option<&Snapshot> {
        self.last.as_ref()
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.close();
    }
}

async fn pump(mut events: EventStream, tx: mpsc::Sender<Delivery>, cancel: CancellationToken) {
    let mut assembler = ResponseAssembler::new();

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!("[Stream] closed while waiting for the next event");
                return;
            }
            next = events.next() => next,
        };

        let delivery = match next {
            Some(Ok(event)) => match assembler.handle_event(&event) {
                Ok(None) => continue,
                Ok(Some(Progress::Snapshot(snapshot))) => Ok(Some(snapshot)),
                Ok(Some(Progress::Complete)) => Ok(None),
                Err(e) => Err(e),
            },
            Some(Err(e)) => {
                warn!("[Stream] transport failed: {e}");
                Err(StreamError::Transport(e.to_string()))
            }
            None => Err(StreamError::Transport(
                "connection closed before message_stop".to_string(),
            )),
        };
        let terminal = !matches!(delivery, Ok(Some(_)));

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!("[Stream] closed while handing off a snapshot");
                return;
            }
            sent = tx.send(delivery) => {
                if sent.is_err() {
                    return;
                }
            }
        }

        if terminal {
            debug!("[Stream] pump finished");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventsource::{Event, EventError};
    use crate::providers::claude::assembler::tests::{
        error_event, message_delta, message_start, message_stop, ping, text_delta,
    };
    use crate::providers::claude::types::{ContentBlock, StopReason};
    use crate::providers::Role;
    use futures::stream;
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_stream::wrappers::ReceiverStream;

    const BOUND: Duration = Duration::from_secs(2);

    fn source(events: Vec<Event>) -> EventStream {
        Box::pin(stream::iter(events.into_iter().map(Ok::<Event, EventError>)))
    }

    async fn drain(handle: &mut StreamHandle) -> (Vec<Snapshot>, Delivery) {
        let mut snapshots = Vec::new();
        loop {
            match timeout(BOUND, handle.receive()).await.expect("receive hung") {
                Ok(Some(snapshot)) => snapshots.push(snapshot),
                terminal => return (snapshots, terminal),
            }
        }
    }

    fn well_formed() -> Vec<Event> {
        vec![
            message_start(),
            text_delta("Hello"),
            text_delta(", world"),
            message_delta(42),
            message_stop(),
        ]
    }

    #[tokio::test]
    async fn test_well_formed_stream_ends_once() {
        let mut handle = StreamHandle::spawn(source(well_formed()));
        let (snapshots, terminal) = drain(&mut handle).await;

        assert!(matches!(terminal, Ok(None)));
        assert_eq!(snapshots.len(), 4);
        let last = snapshots.last().unwrap();
        assert_eq!(last.id, "msg_1");
        assert_eq!(last.model, "claude-3-5-sonnet-20240620");
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.stop_reason, Some(StopReason::EndTurn));
        assert_eq!(last.usage.output_tokens, 42);
        assert_eq!(handle.transcript(), "Hello, world");

        assert!(matches!(handle.receive().await, Err(StreamError::Closed)));
    }

    #[tokio::test]
    async fn test_first_delta_is_not_prefixed() {
        let mut handle = StreamHandle::spawn(source(vec![
            message_start(),
            text_delta("Hello"),
            message_stop(),
        ]));

        let start = handle.receive().await.unwrap().unwrap();
        assert_eq!(start.content, vec![ContentBlock::text("")]);
        let hello = handle.receive().await.unwrap().unwrap();
        assert_eq!(hello.content, vec![ContentBlock::text("Hello")]);
    }

    #[tokio::test]
    async fn test_ignored_events_do_not_change_deliveries() {
        let mut plain = StreamHandle::spawn(source(well_formed()));
        let (expected, _) = drain(&mut plain).await;

        let mut noisy = StreamHandle::spawn(source(vec![
            ping(),
            message_start(),
            Event::named("content_block_start", r#"{"index":0}"#),
            ping(),
            text_delta("Hello"),
            text_delta(", world"),
            Event::named("content_block_stop", r#"{"index":0}"#),
            Event::named("some_future_event", "{}"),
            message_delta(42),
            ping(),
            message_stop(),
        ]));
        let (actual, terminal) = drain(&mut noisy).await;

        assert!(matches!(terminal, Ok(None)));
        assert_eq!(actual, expected);
    }

    #[tokio::test]
    async fn test_error_event_is_protocol_error() {
        let mut handle = StreamHandle::spawn(source(vec![
            message_start(),
            text_delta("partial"),
            error_event("Overloaded"),
            text_delta("never delivered"),
        ]));
        let (snapshots, terminal) = drain(&mut handle).await;

        assert_eq!(snapshots.len(), 2);
        assert!(matches!(terminal, Err(StreamError::Protocol(ref msg)) if msg == "Overloaded"));
        assert_eq!(handle.last_snapshot().unwrap().text(), "partial");
        handle.close();
        handle.close();
    }

    #[tokio::test]
    async fn test_error_event_before_start() {
        let mut handle = StreamHandle::spawn(source(vec![
            ping(),
            error_event("Overloaded"),
            message_start(),
        ]));
        let (snapshots, terminal) = drain(&mut handle).await;

        assert!(snapshots.is_empty());
        assert!(matches!(terminal, Err(StreamError::Protocol(ref msg)) if msg == "Overloaded"));
        assert!(handle.last_snapshot().is_none());
    }

    #[tokio::test]
    async fn test_unlisted_stop_reasons_end_normally() {
        for reason in ["pause_turn", "refusal", "model_context_window_exceeded"] {
            let delta = serde_json::json!({
                "type": "message_delta",
                "delta": {"stop_reason": reason, "stop_sequence": null},
                "usage": {"output_tokens": 3}
            });
            let mut handle = StreamHandle::spawn(source(vec![
                message_start(),
                text_delta("Hi"),
                Event::named("message_delta", delta.to_string()),
                message_stop(),
            ]));
            let (snapshots, terminal) = drain(&mut handle).await;

            assert!(matches!(terminal, Ok(None)), "{reason}: {terminal:?}");
            assert_eq!(snapshots.len(), 3);
            let last = handle.last_snapshot().unwrap();
            assert_eq!(last.stop_reason.as_ref().map(ToString::to_string).as_deref(), Some(reason));
            assert_eq!(handle.transcript(), "Hi");
        }
    }

    #[tokio::test]
    async fn test_stop_before_start_is_protocol_error() {
        let mut handle = StreamHandle::spawn(source(vec![message_stop()]));
        let (snapshots, terminal) = drain(&mut handle).await;
        assert!(snapshots.is_empty());
        assert!(matches!(terminal, Err(StreamError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_decode_failure_is_terminal() {
        let mut handle = StreamHandle::spawn(source(vec![
            message_start(),
            Event::named("message_delta", "{not json"),
            message_stop(),
        ]));
        let (_, terminal) = drain(&mut handle).await;
        assert!(matches!(terminal, Err(StreamError::Decode(ref e)) if e.payload == "{not json"));
    }

    #[tokio::test]
    async fn test_transport_failure_mid_stream() {
        let events: Vec<Result<Event, EventError>> = vec![
            Ok(message_start()),
            Ok(text_delta("cut")),
            Err(EventError::Transport("connection reset by peer".to_string())),
        ];
        let mut handle = StreamHandle::spawn(Box::pin(stream::iter(events)));
        let (snapshots, terminal) = drain(&mut handle).await;

        assert_eq!(snapshots.len(), 2);
        assert!(matches!(terminal, Err(StreamError::Transport(ref msg)) if msg.contains("reset")));
    }

    #[tokio::test]
    async fn test_connection_closed_without_stop() {
        let mut handle = StreamHandle::spawn(source(vec![message_start(), text_delta("Hi")]));
        let (_, terminal) = drain(&mut handle).await;
        assert!(matches!(terminal, Err(StreamError::Transport(_))));
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_receive() {
        let mut handle = StreamHandle::spawn(Box::pin(stream::pending::<Result<Event, EventError>>()));
        let closer = handle.close_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            closer.close();
        });

        let result = timeout(BOUND, handle.receive()).await.expect("receive hung");
        assert!(matches!(result, Err(StreamError::Closed)));
    }

    #[tokio::test]
    async fn test_close_releases_pump_blocked_on_full_channel() {
        let (tx, rx) = mpsc::channel(16);
        let mut handle = StreamHandle::spawn(Box::pin(ReceiverStream::new(rx).map(Ok::<Event, EventError>)));

        tx.send(message_start()).await.unwrap();
        for i in 0..8 {
            tx.send(text_delta(&i.to_string())).await.unwrap();
        }
        // Give the pump time to fill the hand-off slot and block on it.
        tokio::time::sleep(Duration::from_millis(20)).await;

        handle.close();
        handle.close();

        // The pump drops the source, and with it the receiving end, once it exits.
        timeout(BOUND, tx.closed()).await.expect("pump did not release the source");
        assert!(matches!(handle.receive().await, Err(StreamError::Closed)));
    }

    #[tokio::test]
    async fn test_drop_releases_source() {
        let (tx, rx) = mpsc::channel::<Event>(1);
        let handle = StreamHandle::spawn(Box::pin(ReceiverStream::new(rx).map(Ok::<Event, EventError>)));
        drop(handle);
        timeout(BOUND, tx.closed()).await.expect("pump outlived its handle");
    }
}
