//! Pull-side view of one chat run.

use std::time::Duration;

use futures::Stream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::ChatEvent;
use crate::supervisor::Command;

/// Events of a single run, consumed in arrival order.
///
/// The sequence ends after a terminal event, when the connection drops, or
/// when no event arrives within the idle timeout. It is not restartable.
/// Dropping the stream unregisters its listener.
pub struct ChatRunStream {
    run_id: String,
    listener_id: u64,
    rx: mpsc::UnboundedReceiver<ChatEvent>,
    idle_timeout: Duration,
    commands: mpsc::UnboundedSender<Command>,
    finished: bool,
    saw_terminal: bool,
}

impl ChatRunStream {
    pub(crate) fn new(
        run_id: String,
        listener_id: u64,
        rx: mpsc::UnboundedReceiver<ChatEvent>,
        idle_timeout: Duration,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            run_id,
            listener_id,
            rx,
            idle_timeout,
            commands,
            finished: false,
            saw_terminal: false,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Whether the run's terminal event has been handed out.
    pub fn saw_terminal(&self) -> bool {
        self.saw_terminal
    }

    /// Wait for the next event. `None` means the sequence is over.
    pub async fn next_event(&mut self) -> Option<ChatEvent> {
        if self.finished {
            return None;
        }

        match tokio::time::timeout(self.idle_timeout, self.rx.recv()).await {
            Ok(Some(event)) => {
                if event.state.is_terminal() {
                    self.finished = true;
                    self.saw_terminal = true;
                }
                Some(event)
            }
            Ok(None) => {
                self.finished = true;
                if !self.saw_terminal {
                    debug!(run_id = %self.run_id, "Run listener dropped before terminal event");
                }
                None
            }
            Err(_) => {
                self.finished = true;
                warn!(
                    run_id = %self.run_id,
                    idle_ms = self.idle_timeout.as_millis() as u64,
                    "No run event within idle timeout, ending stream"
                );
                self.unlisten();
                None
            }
        }
    }

    /// Adapt into a `futures::Stream`.
    pub fn into_stream(self) -> impl Stream<Item = ChatEvent> + Send {
        futures::stream::unfold(self, |mut stream| async move {
            let event = stream.next_event().await?;
            Some((event, stream))
        })
    }

    fn unlisten(&self) {
        let _ = self.commands.send(Command::Unlisten {
            run_id: self.run_id.clone(),
            listener_id: self.listener_id,
        });
    }
}

impl Drop for ChatRunStream {
    fn drop(&mut self) {
        if !self.saw_terminal {
            self.unlisten();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChatState;
    use futures::StreamExt;

    fn event(seq: u64, state: ChatState) -> ChatEvent {
        ChatEvent {
            run_id: "run-1".into(),
            session_key: "main".into(),
            seq,
            state,
            message: None,
            error_message: None,
            usage: None,
            stop_reason: None,
        }
    }

    fn stream(
        idle: Duration,
    ) -> (
        ChatRunStream,
        mpsc::UnboundedSender<ChatEvent>,
        mpsc::UnboundedReceiver<Command>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        (
            ChatRunStream::new("run-1".into(), 9, rx, idle, cmd_tx),
            tx,
            cmd_rx,
        )
    }

    #[tokio::test]
    async fn yields_in_order_and_ends_after_terminal() {
        let (mut s, tx, _cmd) = stream(Duration::from_secs(5));
        tx.send(event(1, ChatState::Delta)).unwrap();
        tx.send(event(2, ChatState::Delta)).unwrap();
        tx.send(event(3, ChatState::Final)).unwrap();

        assert_eq!(s.next_event().await.unwrap().seq, 1);
        assert_eq!(s.next_event().await.unwrap().seq, 2);
        assert_eq!(s.next_event().await.unwrap().state, ChatState::Final);
        assert!(s.saw_terminal());
        assert!(s.next_event().await.is_none());
    }

    #[tokio::test]
    async fn closed_channel_ends_without_terminal() {
        let (mut s, tx, _cmd) = stream(Duration::from_secs(5));
        tx.send(event(1, ChatState::Delta)).unwrap();
        drop(tx);

        assert!(s.next_event().await.is_some());
        assert!(s.next_event().await.is_none());
        assert!(!s.saw_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_ends_stream_and_unlistens() {
        let (mut s, _tx, mut cmd) = stream(Duration::from_secs(120));
        let started = tokio::time::Instant::now();
        assert!(s.next_event().await.is_none());
        assert!(started.elapsed() >= Duration::from_secs(120));
        assert!(!s.saw_terminal());
        match cmd.try_recv() {
            Ok(Command::Unlisten { run_id, listener_id }) => {
                assert_eq!(run_id, "run-1");
                assert_eq!(listener_id, 9);
            }
            other => panic!("Expected Unlisten, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn drop_before_terminal_unlistens() {
        let (s, _tx, mut cmd) = stream(Duration::from_secs(5));
        drop(s);
        assert!(matches!(
            cmd.try_recv(),
            Ok(Command::Unlisten { listener_id: 9, .. })
        ));
    }

    #[tokio::test]
    async fn drop_after_terminal_is_quiet() {
        let (mut s, tx, mut cmd) = stream(Duration::from_secs(5));
        tx.send(event(1, ChatState::Aborted)).unwrap();
        s.next_event().await;
        drop(s);
        assert!(cmd.try_recv().is_err());
    }

    #[tokio::test]
    async fn into_stream_collects_run() {
        let (s, tx, _cmd) = stream(Duration::from_secs(5));
        tx.send(event(1, ChatState::Delta)).unwrap();
        tx.send(event(2, ChatState::Error)).unwrap();
        tx.send(event(3, ChatState::Delta)).unwrap();

        let seqs: Vec<u64> = s.into_stream().map(|e| e.seq).collect().await;
        assert_eq!(seqs, vec![1, 2]);
    }
}
