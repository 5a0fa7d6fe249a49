//! In-process duplex channel.
//!
//! Stands in for a network connection: the session holds a
//! [`PipeSource`] and [`PipeSink`], the caller plays the browser through
//! the [`RemoteEnd`].

use async_trait::async_trait;
use ghostbridge_core::{DocumentSnapshot, RecvError, SendError, SnapshotSink, SnapshotSource};
use tokio::sync::mpsc;

/// Create a connected pipe.
#[must_use]
pub fn pipe() -> (RemoteEnd, PipeSource, PipeSink) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    (
        RemoteEnd {
            inbound_tx: Some(inbound_tx),
            outbound_rx,
        },
        PipeSource { rx: inbound_rx },
        PipeSink {
            tx: Some(outbound_tx),
        },
    )
}

/// Browser side of a pipe.
pub struct RemoteEnd {
    inbound_tx: Option<mpsc::UnboundedSender<Result<DocumentSnapshot, RecvError>>>,
    outbound_rx: mpsc::UnboundedReceiver<DocumentSnapshot>,
}

impl RemoteEnd {
    /// Send a snapshot to the session.
    ///
    /// # Errors
    /// Returns error if the session side is gone.
    pub fn send(&self, snapshot: DocumentSnapshot) -> Result<(), SendError> {
        self.push(Ok(snapshot))
    }

    /// Make the session's next read fail with `err`.
    ///
    /// # Errors
    /// Returns error if the session side is gone.
    pub fn fail(&self, err: RecvError) -> Result<(), SendError> {
        self.push(Err(err))
    }

    fn push(&self, item: Result<DocumentSnapshot, RecvError>) -> Result<(), SendError> {
        self.inbound_tx
            .as_ref()
            .ok_or(SendError::ChannelClosed)?
            .send(item)
            .map_err(|_| SendError::ChannelClosed)
    }

    /// Close the browser side. The session's next read reports an orderly close.
    pub fn close(&mut self) {
        self.inbound_tx = None;
    }

    /// Receive the next published snapshot; `None` once the session closed its sink.
    pub async fn recv(&mut self) -> Option<DocumentSnapshot> {
        self.outbound_rx.recv().await
    }
}

/// Session read side of a pipe.
pub struct PipeSource {
    rx: mpsc::UnboundedReceiver<Result<DocumentSnapshot, RecvError>>,
}

#[async_trait]
impl SnapshotSource for PipeSource {
    async fn recv(&mut self) -> Result<DocumentSnapshot, RecvError> {
        self.rx.recv().await.unwrap_or(Err(RecvError::Closed))
    }
}

/// Session write side of a pipe.
pub struct PipeSink {
    tx: Option<mpsc::UnboundedSender<DocumentSnapshot>>,
}

#[async_trait]
impl SnapshotSink for PipeSink {
    async fn send(&mut self, snapshot: &DocumentSnapshot) -> Result<(), SendError> {
        self.tx
            .as_ref()
            .ok_or(SendError::ChannelClosed)?
            .send(snapshot.clone())
            .map_err(|_| SendError::ChannelClosed)
    }

    async fn close(&mut self) -> Result<(), SendError> {
        self.tx.take().map(drop).ok_or(SendError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_reads_as_orderly() {
        let (mut remote, mut source, _sink) = pipe();
        remote.send(DocumentSnapshot::default()).unwrap();
        remote.close();
        assert!(source.recv().await.is_ok());
        assert!(matches!(source.recv().await, Err(RecvError::Closed)));
    }

    #[tokio::test]
    async fn test_sink_close_ends_remote() {
        let (mut remote, _source, mut sink) = pipe();
        sink.send(&DocumentSnapshot::default()).await.unwrap();
        sink.close().await.unwrap();
        assert!(remote.recv().await.is_some());
        assert!(remote.recv().await.is_none());
        assert!(matches!(
            sink.send(&DocumentSnapshot::default()).await,
            Err(SendError::ChannelClosed)
        ));
    }
}
