//! The per-request watcher handle and the producer side feeding it.

use crate::decoder::Message;
use crate::error::Error;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, watch};

/// Consumer handle for one read request.
///
/// Messages arrive in write order. Errors arrive on a separate channel and
/// do not end the message stream by themselves; the message stream ends
/// when the producing task exits. Dropping the watcher asks the producer to
/// stop.
pub struct LogWatcher {
    messages: mpsc::Receiver<Message>,
    errors: mpsc::UnboundedReceiver<Error>,
    close: Arc<watch::Sender<bool>>,
}

/// Producer side of a [`LogWatcher`], owned by the reading task. The message
/// channel closes when this is dropped.
pub(crate) struct Output {
    messages: mpsc::Sender<Message>,
    errors: mpsc::UnboundedSender<Error>,
}

impl LogWatcher {
    /// Create a connected watcher, its producer side, and the close signal
    /// the producer observes.
    pub(crate) fn channel(capacity: usize) -> (Self, Output, watch::Receiver<bool>) {
        let (msg_tx, msg_rx) = mpsc::channel(capacity.max(1));
        let (err_tx, err_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = watch::channel(false);

        let watcher = LogWatcher {
            messages: msg_rx,
            errors: err_rx,
            close: Arc::new(close_tx),
        };
        let output = Output {
            messages: msg_tx,
            errors: err_tx,
        };
        (watcher, output, close_rx)
    }

    /// Receive the next message, or `None` once the producer has finished.
    pub async fn next_message(&mut self) -> Option<Message> {
        self.messages.recv().await
    }

    /// Receive the next error, or `None` once the producer has finished and
    /// every error has been taken.
    pub async fn next_error(&mut self) -> Option<Error> {
        self.errors.recv().await
    }

    /// Take an already reported error without waiting.
    pub fn try_next_error(&mut self) -> Option<Error> {
        self.errors.try_recv().ok()
    }

    /// Ask the producer to stop. Records that are already readable are
    /// still flushed before the message stream ends.
    pub fn close(&self) {
        self.close.send_replace(true);
    }

    /// Whether close has been requested.
    pub fn is_closing(&self) -> bool {
        *self.close.borrow()
    }

    pub(crate) fn close_signal(&self) -> Arc<watch::Sender<bool>> {
        Arc::clone(&self.close)
    }
}

impl Drop for LogWatcher {
    fn drop(&mut self) {
        self.close();
    }
}

impl Stream for LogWatcher {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.messages.poll_recv(cx)
    }
}

impl Output {
    /// Deliver a message, waiting while the consumer is behind. Returns
    /// `false` once the watcher has gone away.
    pub(crate) async fn emit(&self, message: Message) -> bool {
        self.messages.send(message).await.is_ok()
    }

    pub(crate) fn error(&self, error: Error) {
        let _ = self.errors.send(error);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.messages.is_closed()
    }
}
