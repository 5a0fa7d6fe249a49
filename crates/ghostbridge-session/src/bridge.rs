//! Session bridge: one connection bound to one editable surface.

use std::sync::Arc;

use ghostbridge_core::{
    ClientInfo, RecvError, SnapshotSink, SnapshotSource, Surface, SurfaceError, SurfaceEvents,
    SurfaceFactory,
};
use tokio::sync::oneshot;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::{SessionOptions, inbound, outbound};

/// Session bridge error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Failed to create surface: {0}")]
    SurfaceCreation(#[source] SurfaceError),
    #[error("Failed to subscribe to surface events: {0}")]
    Events(#[source] SurfaceError),
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client closed the connection in an orderly way.
    RemoteClosed,
    /// The connection failed or carried a malformed message.
    ChannelFailed(String),
    /// The surface was closed on the local side.
    SurfaceClosed,
}

impl From<RecvError> for SessionEnd {
    fn from(err: RecvError) -> Self {
        match err {
            RecvError::Closed => Self::RemoteClosed,
            other => Self::ChannelFailed(other.to_string()),
        }
    }
}

/// Opens sessions against surfaces produced by `F`.
pub struct SessionBridge<F>
where
    F: SurfaceFactory,
{
    factory: F,
    options: Arc<SessionOptions>,
}

impl<F> SessionBridge<F>
where
    F: SurfaceFactory,
{
    /// Create a new session bridge.
    #[must_use]
    pub fn new(factory: F, options: SessionOptions) -> Self {
        Self {
            factory,
            options: Arc::new(options),
        }
    }

    /// Open a session on an already established channel.
    ///
    /// Creates the surface and announces the available commands in its
    /// tag. Nothing has been read from or written to the channel when this
    /// returns; on error the caller should just drop the channel.
    ///
    /// # Errors
    /// Returns error if the surface cannot be created or observed.
    pub async fn open<R, W>(
        &self,
        source: R,
        sink: W,
        client: ClientInfo,
    ) -> Result<Session<F::Surface, R, W>, SessionError>
    where
        R: SnapshotSource,
        W: SnapshotSink + 'static,
    {
        let surface = self
            .factory
            .create()
            .await
            .map_err(SessionError::SurfaceCreation)?;

        let events = match surface.events().await {
            Ok(events) => events,
            Err(err) => {
                if let Err(del_err) = surface.delete(true).await {
                    debug!(error = %del_err, "failed to delete unobservable surface");
                }
                surface.close().await;
                return Err(SessionError::Events(err));
            }
        };

        if let Err(err) = surface.write_tag(&self.options.tag).await {
            warn!(session = %client.session_id, error = %err, "failed to write surface tag");
        }

        Ok(Session {
            surface: Arc::new(surface),
            events,
            source,
            sink,
            client,
            options: Arc::clone(&self.options),
        })
    }
}

/// One live connection and the surface it edits.
pub struct Session<S, R, W>
where
    S: Surface,
{
    surface: Arc<S>,
    events: SurfaceEvents<S::Event>,
    source: R,
    sink: W,
    client: ClientInfo,
    options: Arc<SessionOptions>,
}

impl<S, R, W> Session<S, R, W>
where
    S: Surface,
    R: SnapshotSource,
    W: SnapshotSink + 'static,
{
    /// Run the session to completion.
    ///
    /// Spawns the outbound publish flow, runs inbound sync on the current
    /// task and deletes the surface once inbound sync ends, whatever the
    /// reason. The outbound task exits by itself when the surface's event
    /// sequence ends.
    pub async fn run(self) -> SessionEnd {
        let span = info_span!(
            "session",
            id = %self.client.session_id,
            peer = ?self.client.peer,
        );
        self.run_inner().instrument(span).await
    }

    async fn run_inner(self) -> SessionEnd {
        let Self {
            surface,
            events,
            mut source,
            sink,
            client,
            options,
        } = self;
        info!(user_agent = client.user_agent_or_dash(), "session started");

        let (closed_tx, closed_rx) = oneshot::channel();
        tokio::spawn(
            outbound::run(
                Arc::clone(&surface),
                events,
                sink,
                Arc::clone(&options),
                closed_tx,
            )
            .in_current_span(),
        );

        let end = inbound::run(&*surface, &mut source, &options, &client, closed_rx).await;

        match surface.delete(options.discard_on_disconnect).await {
            Ok(()) => debug!("surface deleted"),
            Err(SurfaceError::Closed) => debug!("surface already closed"),
            Err(err) => warn!(error = %err, "failed to delete surface"),
        }

        info!(?end, "session ended");
        end
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ghostbridge_core::{DocumentSnapshot, SelectionRange};
    use tokio::time::timeout;

    use super::*;
    use crate::pipe::{PipeSink, PipeSource, RemoteEnd, pipe};
    use crate::surface::{MemoryEvent, MemorySurface, MemorySurfaceFactory};

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn open(
        factory: &MemorySurfaceFactory,
        options: SessionOptions,
    ) -> (RemoteEnd, Session<MemorySurface, PipeSource, PipeSink>, MemorySurface) {
        let bridge = SessionBridge::new(factory.clone(), options);
        let (remote, source, sink) = pipe();
        let session = bridge.open(source, sink, ClientInfo::new()).await.unwrap();
        let surface = factory.surfaces().pop().unwrap();
        (remote, session, surface)
    }

    fn hello() -> DocumentSnapshot {
        DocumentSnapshot {
            selections: vec![SelectionRange::new(0, 5)],
            text: "hello".to_string(),
            url: "http://x".to_string(),
            ..DocumentSnapshot::default()
        }
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        timeout(TIMEOUT, async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_open_fails_without_surface() {
        let bridge = SessionBridge::new(MemorySurfaceFactory::unavailable(), SessionOptions::default());
        let (_remote, source, sink) = pipe();
        let result = bridge.open(source, sink, ClientInfo::new()).await;
        assert!(matches!(result, Err(SessionError::SurfaceCreation(_))));
    }

    #[tokio::test]
    async fn test_open_writes_tag() {
        let factory = MemorySurfaceFactory::new();
        let (_remote, _session, surface) = open(&factory, SessionOptions::default()).await;
        assert_eq!(surface.tag(), "Undo Redo Put");
        assert_eq!(factory.surfaces().len(), 1);
    }

    #[tokio::test]
    async fn test_scenario_apply_publish_close() {
        let factory = MemorySurfaceFactory::new();
        let (mut remote, session, surface) = open(&factory, SessionOptions::default()).await;
        let running = tokio::spawn(session.run());

        remote.send(hello()).unwrap();
        wait_until(|| surface.text() == "hello").await;
        assert_eq!(surface.dot(), (0, 5));
        assert!(!surface.is_dirty());

        surface.execute("Put");
        let published = timeout(TIMEOUT, remote.recv()).await.unwrap().unwrap();
        assert_eq!(published.text, "hello");
        assert_eq!(published.selections, vec![SelectionRange::new(0, 5)]);

        remote.close();
        let end = timeout(TIMEOUT, running).await.unwrap().unwrap();
        assert_eq!(end, SessionEnd::RemoteClosed);
        assert!(surface.is_deleted());
        assert_eq!(surface.delete_calls(), 1);

        // Event sequence ended: outbound closes its sink and releases handles.
        assert!(timeout(TIMEOUT, remote.recv()).await.unwrap().is_none());
        wait_until(|| surface.is_released()).await;
    }

    #[tokio::test]
    async fn test_local_close_ends_session() {
        let factory = MemorySurfaceFactory::new();
        let (mut remote, session, surface) = open(&factory, SessionOptions::default()).await;
        let running = tokio::spawn(session.run());

        remote.send(hello()).unwrap();
        wait_until(|| surface.text() == "hello").await;
        surface.close_locally();

        let end = timeout(TIMEOUT, running).await.unwrap().unwrap();
        assert_eq!(end, SessionEnd::SurfaceClosed);
        assert_eq!(surface.delete_calls(), 1);
        assert!(timeout(TIMEOUT, remote.recv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unexpected_failure_still_deletes() {
        let factory = MemorySurfaceFactory::new();
        let (remote, session, surface) = open(&factory, SessionOptions::default()).await;
        let running = tokio::spawn(session.run());

        remote.fail(RecvError::Transport("connection reset".into())).unwrap();
        let end = timeout(TIMEOUT, running).await.unwrap().unwrap();
        assert_eq!(end, SessionEnd::ChannelFailed("Transport error: connection reset".into()));
        assert!(surface.is_deleted());
        assert_eq!(surface.delete_calls(), 1);
    }

    #[tokio::test]
    async fn test_keep_dirty_leaves_edited_surface() {
        let factory = MemorySurfaceFactory::new();
        let options = SessionOptions {
            discard_on_disconnect: false,
            ..SessionOptions::default()
        };
        let (mut remote, session, surface) = open(&factory, options).await;
        let running = tokio::spawn(session.run());

        remote.send(hello()).unwrap();
        wait_until(|| surface.text() == "hello").await;
        surface.type_text("!");
        wait_until(|| !surface.forwarded().is_empty()).await;
        remote.close();

        timeout(TIMEOUT, running).await.unwrap().unwrap();
        assert_eq!(surface.delete_calls(), 1);
        assert!(!surface.is_deleted());

        // The user closes it eventually; outbound then winds down.
        surface.close_locally();
        wait_until(|| surface.is_released()).await;
        assert!(matches!(
            surface.forwarded().first(),
            Some(MemoryEvent::Insert { .. })
        ));
    }
}
