//! Inbound sync: browser snapshots applied to the local surface.

use ghostbridge_core::{
    Address, ClientInfo, DocumentSnapshot, RecvError, SnapshotSource, Surface, SurfaceError,
};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::{SessionEnd, SessionOptions};

/// Decode and apply snapshots until the channel ends or the surface goes away.
///
/// `surface_closed` resolves once the outbound flow has exited, which only
/// happens after the surface's event sequence ended.
pub async fn run<S, R>(
    surface: &S,
    source: &mut R,
    options: &SessionOptions,
    client: &ClientInfo,
    mut surface_closed: oneshot::Receiver<()>,
) -> SessionEnd
where
    S: Surface,
    R: SnapshotSource + ?Sized,
{
    loop {
        let snapshot = tokio::select! {
            result = source.recv() => match result {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    report(&err, client);
                    return SessionEnd::from(err);
                }
            },
            _ = &mut surface_closed => {
                debug!("surface closed locally, ending inbound sync");
                return SessionEnd::SurfaceClosed;
            }
        };

        match apply(surface, &snapshot, options).await {
            Ok(()) => debug!(bytes = snapshot.text.len(), url = %snapshot.url, "applied snapshot"),
            Err(err) if err.is_closed() => {
                debug!("surface gone while applying snapshot");
                return SessionEnd::SurfaceClosed;
            }
            Err(err) => warn!(error = %err, url = %snapshot.url, "failed to apply snapshot"),
        }
    }
}

/// Make the surface show `snapshot`: label, whole text, clean state, selection.
///
/// # Errors
/// Returns the first surface operation that fails.
pub async fn apply<S: Surface>(
    surface: &S,
    snapshot: &DocumentSnapshot,
    options: &SessionOptions,
) -> Result<(), SurfaceError> {
    surface
        .set_name(&options.surface_name(&snapshot.url))
        .await?;
    surface.set_addr(Address::Whole).await?;
    surface.replace(&snapshot.text).await?;
    surface.set_dirty(false).await?;

    if let Some(sel) = snapshot.primary_selection() {
        surface
            .set_addr(Address::Chars {
                start: sel.start,
                end: sel.end,
            })
            .await?;
        surface.select_addr().await?;
    }
    Ok(())
}

fn report(err: &RecvError, client: &ClientInfo) {
    if err.is_expected() {
        debug!("connection closed by client");
    } else {
        warn!(
            error = %err,
            user_agent = client.user_agent_or_dash(),
            peer = ?client.peer,
            "connection ended unexpectedly"
        );
    }
}
