//! Outbound publish: surface events, with the publish command sent to the browser.

use std::sync::Arc;

use futures::StreamExt;
use ghostbridge_core::{
    Address, DocumentSnapshot, SelectionRange, SnapshotSink, Surface, SurfaceError, SurfaceEvent,
    SurfaceEvents,
};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::SessionOptions;

/// Consume surface events until the surface is closed.
///
/// The publish command captures the surface and writes it to `sink`; every
/// other event goes back to the surface's default processing. On exit the
/// surface's handles are released, `sink` is closed and `done` is dropped,
/// which wakes the inbound flow.
pub async fn run<S, W>(
    surface: Arc<S>,
    mut events: SurfaceEvents<S::Event>,
    mut sink: W,
    options: Arc<SessionOptions>,
    done: oneshot::Sender<()>,
) where
    S: Surface,
    W: SnapshotSink,
{
    while let Some(event) = events.next().await {
        match event {
            SurfaceEvent::CommandExecuted { command, .. } if command == options.publish_command => {
                publish(&*surface, &mut sink).await;
            }
            other => {
                if let Err(err) = surface.forward(other.into_raw()).await {
                    warn!(error = %err, "failed to forward surface event");
                }
            }
        }
    }

    debug!("surface event stream ended");
    surface.close().await;
    if let Err(err) = sink.close().await {
        debug!(error = %err, "channel already closed");
    }
    drop(done);
}

async fn publish<S, W>(surface: &S, sink: &mut W)
where
    S: Surface,
    W: SnapshotSink,
{
    let snapshot = match capture(surface).await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            warn!(error = %err, "failed to capture surface");
            return;
        }
    };

    match sink.send(&snapshot).await {
        Ok(()) => info!(bytes = snapshot.text.len(), "published snapshot"),
        // The inbound side notices the dead channel; keep serving events.
        Err(err) => warn!(error = %err, "failed to publish snapshot"),
    }

    if let Err(err) = surface.set_dirty(false).await {
        warn!(error = %err, "failed to mark surface clean");
    }
}

/// Read the surface's text and active selection.
///
/// # Errors
/// Returns the first surface operation that fails.
pub async fn capture<S: Surface>(surface: &S) -> Result<DocumentSnapshot, SurfaceError> {
    let text = surface.read_body().await?;
    surface.set_addr(Address::Dot).await?;
    let (start, end) = surface.read_addr().await?;
    Ok(DocumentSnapshot::captured(
        text,
        SelectionRange::new(start, end),
    ))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ghostbridge_core::SendError;
    use tokio::time::timeout;

    use super::*;
    use crate::inbound::apply;
    use crate::pipe::pipe;
    use crate::surface::{MemoryEvent, MemorySurface};

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Spawned {
        surface: MemorySurface,
        done: oneshot::Receiver<()>,
        remote: crate::pipe::RemoteEnd,
    }

    async fn spawn_outbound() -> Spawned {
        let surface = MemorySurface::new();
        let events = surface.events().await.unwrap();
        let (remote, _source, sink) = pipe();
        let (done_tx, done) = oneshot::channel();
        tokio::spawn(run(
            Arc::new(surface.clone()),
            events,
            sink,
            Arc::new(SessionOptions::default()),
            done_tx,
        ));
        Spawned {
            surface,
            done,
            remote,
        }
    }

    #[tokio::test]
    async fn test_publish_round_trip() {
        let mut s = spawn_outbound().await;
        let text = "línea uno\n\tline two\n";
        let snapshot = DocumentSnapshot {
            text: text.to_string(),
            ..DocumentSnapshot::default()
        };
        apply(&s.surface, &snapshot, &SessionOptions::default())
            .await
            .unwrap();

        s.surface.execute("Put");
        let published = timeout(TIMEOUT, s.remote.recv()).await.unwrap().unwrap();
        assert_eq!(published.text, text);
        assert_eq!(published.selections.len(), 1);
    }

    #[tokio::test]
    async fn test_publish_captures_current_selection() {
        let mut s = spawn_outbound().await;
        let snapshot = DocumentSnapshot {
            selections: vec![SelectionRange::new(0, 5)],
            text: "hello world".to_string(),
            ..DocumentSnapshot::default()
        };
        apply(&s.surface, &snapshot, &SessionOptions::default())
            .await
            .unwrap();

        s.surface.select(6, 11);
        s.surface.execute("Put");
        let published = timeout(TIMEOUT, s.remote.recv()).await.unwrap().unwrap();
        assert_eq!(published.selections, vec![SelectionRange::new(6, 11)]);
    }

    #[tokio::test]
    async fn test_publish_marks_clean() {
        let mut s = spawn_outbound().await;
        s.surface.type_text("typed");
        assert!(s.surface.is_dirty());

        s.surface.execute("Put");
        let published = timeout(TIMEOUT, s.remote.recv()).await.unwrap().unwrap();
        assert_eq!(published.text, "typed");
        timeout(TIMEOUT, async {
            while s.surface.is_dirty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_other_commands_pass_through() {
        let mut s = spawn_outbound().await;
        s.surface.execute("Undo");
        s.surface.execute("put");
        s.surface.select(0, 0);
        timeout(TIMEOUT, async {
            while s.surface.forwarded().len() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        s.surface.close_locally();

        timeout(TIMEOUT, &mut s.done).await.unwrap().unwrap_err();
        assert_eq!(
            s.surface.forwarded(),
            vec![
                MemoryEvent::Execute("Undo".into()),
                MemoryEvent::Execute("put".into()),
                MemoryEvent::Select { start: 0, end: 0 },
            ]
        );
        assert!(s.remote.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_surface_close_releases_and_closes_sink() {
        let mut s = spawn_outbound().await;
        s.surface.close_locally();

        timeout(TIMEOUT, &mut s.done).await.unwrap().unwrap_err();
        assert!(s.surface.is_released());
        assert!(s.remote.recv().await.is_none());
    }

    /// Sink whose writes always fail.
    struct BrokenSink;

    #[async_trait::async_trait]
    impl SnapshotSink for BrokenSink {
        async fn send(&mut self, _snapshot: &DocumentSnapshot) -> Result<(), SendError> {
            Err(SendError::Transport("broken pipe".into()))
        }

        async fn close(&mut self) -> Result<(), SendError> {
            Err(SendError::ChannelClosed)
        }
    }

    #[tokio::test]
    async fn test_write_failure_is_not_fatal() {
        let surface = MemorySurface::new();
        let events = surface.events().await.unwrap();
        let (done_tx, mut done) = oneshot::channel();
        tokio::spawn(run(
            Arc::new(surface.clone()),
            events,
            BrokenSink,
            Arc::new(SessionOptions::default()),
            done_tx,
        ));

        surface.type_text("keep me");
        surface.execute("Put");
        surface.execute("Redo");
        timeout(TIMEOUT, async {
            while surface.forwarded().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        // A capture clears the dirty flag even when the send failed.
        assert!(!surface.is_dirty());
        assert!(done.try_recv().is_err());

        surface.close_locally();
        timeout(TIMEOUT, done).await.unwrap().unwrap_err();
    }
}
