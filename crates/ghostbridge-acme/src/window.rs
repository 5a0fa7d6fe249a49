//! acme window surface.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use futures::StreamExt;
use ghostbridge_core::{Address, Surface, SurfaceError, SurfaceEvent, SurfaceEvents, SurfaceFactory};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    client::{Client, File, NinepError},
    event::{AcmeEvent, EventDecoder},
    fcall::ORDWR,
};

impl From<NinepError> for SurfaceError {
    fn from(err: NinepError) -> Self {
        match err {
            NinepError::Disconnected => Self::Closed,
            NinepError::Remote(e) if e.contains("deleted") => Self::Closed,
            NinepError::Remote(e) if e.contains("dirty") => Self::Unsaved,
            NinepError::Remote(e) if e.contains("address") => Self::InvalidAddress(e),
            other => Self::Io(other.to_string()),
        }
    }
}

/// One acme window.
///
/// The window's `ctl` file is the `new/ctl` fid it was created through;
/// other files are opened on first use and kept open until [`Surface::close`].
pub struct AcmeWindow {
    id: u64,
    client: Client,
    ctl: File,
    addr: File,
    files: Mutex<HashMap<&'static str, Arc<File>>>,
    events_taken: AtomicBool,
    released: AtomicBool,
}

impl AcmeWindow {
    /// Create a new window.
    ///
    /// # Errors
    /// Returns error if acme refuses to create the window.
    pub async fn new(client: Client) -> Result<Self, NinepError> {
        let ctl = client.open("new/ctl", ORDWR).await?;
        let id = match ctl.read().await.map(|data| parse_id(&data)) {
            Ok(Some(id)) => id,
            Ok(None) => {
                ctl.clunk().await;
                return Err(NinepError::Protocol("unreadable window id".into()));
            }
            Err(err) => {
                ctl.clunk().await;
                return Err(err);
            }
        };

        // acme resets a window's address whenever addr is first opened, so
        // it stays open for the window's lifetime.
        let addr = match client.open(&format!("{id}/addr"), ORDWR).await {
            Ok(addr) => addr,
            Err(err) => {
                if let Err(del_err) = ctl.write_str("delete\n").await {
                    debug!(window = id, error = %del_err, "failed to delete half-open window");
                }
                ctl.clunk().await;
                return Err(err);
            }
        };

        debug!(window = id, "created acme window");
        Ok(Self {
            id,
            client,
            ctl,
            addr,
            files: Mutex::new(HashMap::new()),
            events_taken: AtomicBool::new(false),
            released: AtomicBool::new(false),
        })
    }

    /// acme's window id.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    fn live(&self) -> Result<(), SurfaceError> {
        if self.released.load(Ordering::Acquire) {
            Err(SurfaceError::Closed)
        } else {
            Ok(())
        }
    }

    async fn file(&self, name: &'static str) -> Result<Arc<File>, SurfaceError> {
        self.live()?;
        let mut files = self.files.lock().await;
        if let Some(file) = files.get(name) {
            return Ok(Arc::clone(file));
        }
        let file = Arc::new(
            self.client
                .open(&format!("{}/{name}", self.id), ORDWR)
                .await?,
        );
        files.insert(name, Arc::clone(&file));
        Ok(file)
    }

    async fn ctl(&self, msg: &str) -> Result<(), SurfaceError> {
        self.live()?;
        Ok(self.ctl.write_str(&format!("{msg}\n")).await?)
    }
}

fn parse_id(data: &[u8]) -> Option<u64> {
    std::str::from_utf8(data)
        .ok()?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

fn parse_addr(data: &[u8]) -> Result<(usize, usize), SurfaceError> {
    let text = String::from_utf8_lossy(data);
    let mut fields = text.split_whitespace().map(str::parse::<usize>);
    match (fields.next(), fields.next()) {
        (Some(Ok(q0)), Some(Ok(q1))) => Ok((q0, q1)),
        _ => Err(SurfaceError::Io(format!("unreadable address {text:?}"))),
    }
}

fn classify(event: AcmeEvent) -> SurfaceEvent<AcmeEvent> {
    if event.is_execute() {
        SurfaceEvent::CommandExecuted {
            command: event.text.clone(),
            event,
        }
    } else {
        SurfaceEvent::Other(event)
    }
}

#[async_trait]
impl Surface for AcmeWindow {
    type Event = AcmeEvent;

    async fn set_name(&self, name: &str) -> Result<(), SurfaceError> {
        self.ctl(&format!("name {name}")).await
    }

    async fn write_tag(&self, text: &str) -> Result<(), SurfaceError> {
        Ok(self.file("tag").await?.write_str(text).await?)
    }

    async fn set_addr(&self, addr: Address) -> Result<(), SurfaceError> {
        match addr {
            Address::Dot => self.ctl("addr=dot").await,
            other => {
                self.live()?;
                Ok(self.addr.write_str(&other.to_string()).await?)
            }
        }
    }

    async fn read_addr(&self) -> Result<(usize, usize), SurfaceError> {
        self.live()?;
        parse_addr(&self.addr.read_at(0).await?)
    }

    async fn select_addr(&self) -> Result<(), SurfaceError> {
        self.ctl("dot=addr").await
    }

    async fn replace(&self, text: &str) -> Result<(), SurfaceError> {
        Ok(self.file("data").await?.write_str(text).await?)
    }

    async fn read_body(&self) -> Result<String, SurfaceError> {
        let body = self.file("body").await?.read_all().await?;
        String::from_utf8(body).map_err(|e| SurfaceError::Io(format!("body is not utf-8: {e}")))
    }

    async fn set_dirty(&self, dirty: bool) -> Result<(), SurfaceError> {
        self.ctl(if dirty { "dirty" } else { "clean" }).await
    }

    async fn events(&self) -> Result<SurfaceEvents<AcmeEvent>, SurfaceError> {
        if self.events_taken.swap(true, Ordering::AcqRel) {
            return Err(SurfaceError::EventsTaken);
        }
        let file = self.file("event").await?;
        let id = self.id;

        let stream = futures::stream::unfold(
            (file, EventDecoder::new()),
            move |(file, mut decoder)| async move {
                loop {
                    match decoder.next_event() {
                        Ok(Some(event)) => return Some((classify(event), (file, decoder))),
                        Ok(None) => {}
                        Err(err) => {
                            warn!(window = id, error = %err, "unreadable event, detaching");
                            return None;
                        }
                    }
                    match file.read().await {
                        Ok(data) if !data.is_empty() => decoder.push(&data),
                        Ok(_) => return None,
                        Err(err) => {
                            debug!(window = id, error = %err, "event file closed");
                            return None;
                        }
                    }
                }
            },
        );
        Ok(stream.boxed())
    }

    async fn forward(&self, event: AcmeEvent) -> Result<(), SurfaceError> {
        // Inserts and deletes are already applied; acme rejects them.
        if !event.is_replayable() {
            return Ok(());
        }
        Ok(self.file("event").await?.write_str(&event.write_back()).await?)
    }

    async fn delete(&self, discard: bool) -> Result<(), SurfaceError> {
        self.ctl(if discard { "delete" } else { "del" }).await
    }

    async fn close(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let files: Vec<Arc<File>> = self.files.lock().await.drain().map(|(_, f)| f).collect();
        for file in files {
            file.clunk().await;
        }
        self.addr.clunk().await;
        self.ctl.clunk().await;
        debug!(window = self.id, "released acme window");
    }
}

/// Opens windows in a running acme.
///
/// The 9P connection is made on first use and remade if acme restarted,
/// so the bridge can start before acme does.
pub struct AcmeFactory {
    socket: PathBuf,
    uname: String,
    client: Mutex<Option<Client>>,
}

impl AcmeFactory {
    /// Create a factory for the acme serving `socket`.
    #[must_use]
    pub fn new(socket: PathBuf, uname: String) -> Self {
        Self {
            socket,
            uname,
            client: Mutex::new(None),
        }
    }

    /// Socket the factory connects to.
    #[must_use]
    pub fn socket(&self) -> &Path {
        &self.socket
    }

    async fn client(&self) -> Result<Client, NinepError> {
        let mut client = self.client.lock().await;
        if let Some(live) = client.as_ref().filter(|c| !c.is_closed()) {
            return Ok(live.clone());
        }
        let fresh = Client::connect(&self.socket, &self.uname).await?;
        debug!(socket = %self.socket.display(), "connected to acme");
        *client = Some(fresh.clone());
        Ok(fresh)
    }
}

#[async_trait]
impl SurfaceFactory for AcmeFactory {
    type Surface = AcmeWindow;

    async fn create(&self) -> Result<AcmeWindow, SurfaceError> {
        let client = self.client().await.map_err(|e| {
            SurfaceError::Unavailable(format!("acme at {}: {e}", self.socket.display()))
        })?;
        AcmeWindow::new(client)
            .await
            .map_err(|e| SurfaceError::Unavailable(e.to_string()))
    }
}
