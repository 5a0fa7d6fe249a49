//! In-memory editable surface.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use ghostbridge_core::{Address, Surface, SurfaceError, SurfaceEvent, SurfaceEvents, SurfaceFactory};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Raw event of a [`MemorySurface`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryEvent {
    /// A command was executed.
    Execute(String),
    /// The selection was moved.
    Select { start: usize, end: usize },
    /// Text was typed at the selection.
    Insert { at: usize, text: String },
}

type EventTx = mpsc::UnboundedSender<SurfaceEvent<MemoryEvent>>;
type EventRx = mpsc::UnboundedReceiver<SurfaceEvent<MemoryEvent>>;

struct State {
    name: String,
    tag: String,
    body: String,
    addr: (usize, usize),
    dot: (usize, usize),
    dirty: bool,
    deleted: bool,
    released: bool,
    delete_calls: usize,
    forwarded: Vec<MemoryEvent>,
    events_tx: Option<EventTx>,
    events_rx: Option<EventRx>,
}

impl State {
    fn live(&mut self) -> Result<&mut Self, SurfaceError> {
        if self.deleted {
            Err(SurfaceError::Closed)
        } else {
            Ok(self)
        }
    }

    fn len(&self) -> usize {
        self.body.chars().count()
    }

    fn emit(&self, event: SurfaceEvent<MemoryEvent>) {
        if let Some(tx) = &self.events_tx {
            let _ = tx.send(event);
        }
    }

    fn splice(&mut self, (start, end): (usize, usize), text: &str) -> usize {
        let from = byte_offset(&self.body, start);
        let to = byte_offset(&self.body, end);
        self.body.replace_range(from..to, text);
        self.dirty = true;
        start + text.chars().count()
    }

    fn drop_events(&mut self) {
        self.events_tx = None;
    }
}

fn byte_offset(text: &str, chars: usize) -> usize {
    text.char_indices().nth(chars).map_or(text.len(), |(i, _)| i)
}

/// Surface backed by a `String`, addressed in characters.
///
/// Cloning yields another handle to the same surface, so a test can play
/// the user while a session drives it. Useful for development and tests;
/// nothing is visible outside the process.
#[derive(Clone)]
pub struct MemorySurface {
    state: Arc<Mutex<State>>,
}

impl MemorySurface {
    /// Create an empty surface.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(Mutex::new(State {
                name: String::new(),
                tag: String::new(),
                body: String::new(),
                addr: (0, 0),
                dot: (0, 0),
                dirty: false,
                deleted: false,
                released: false,
                delete_calls: 0,
                forwarded: Vec::new(),
                events_tx: Some(tx),
                events_rx: Some(rx),
            })),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, SurfaceError> {
        self.state
            .lock()
            .map_err(|e| SurfaceError::Io(e.to_string()))
    }

    fn inspect(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Execute a command as the user would.
    pub fn execute(&self, command: &str) {
        self.inspect().emit(SurfaceEvent::CommandExecuted {
            command: command.to_string(),
            event: MemoryEvent::Execute(command.to_string()),
        });
    }

    /// Move the selection as the user would.
    pub fn select(&self, start: usize, end: usize) {
        let mut state = self.inspect();
        let len = state.len();
        let end = end.min(len);
        let start = start.min(end);
        state.dot = (start, end);
        state.emit(SurfaceEvent::Other(MemoryEvent::Select { start, end }));
    }

    /// Type text over the selection as the user would.
    pub fn type_text(&self, text: &str) {
        let mut state = self.inspect();
        let dot = state.dot;
        let end = state.splice(dot, text);
        state.dot = (end, end);
        state.emit(SurfaceEvent::Other(MemoryEvent::Insert {
            at: dot.0,
            text: text.to_string(),
        }));
    }

    /// Close the surface from the user's side, ending its event sequence.
    pub fn close_locally(&self) {
        let mut state = self.inspect();
        state.deleted = true;
        state.drop_events();
    }

    /// Current text.
    #[must_use]
    pub fn text(&self) -> String {
        self.inspect().body.clone()
    }

    /// Current label.
    #[must_use]
    pub fn name(&self) -> String {
        self.inspect().name.clone()
    }

    /// Current tag contents.
    #[must_use]
    pub fn tag(&self) -> String {
        self.inspect().tag.clone()
    }

    /// Active selection.
    #[must_use]
    pub fn dot(&self) -> (usize, usize) {
        self.inspect().dot
    }

    /// Whether the surface holds unsaved edits.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.inspect().dirty
    }

    /// Whether the surface has been deleted from either side.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.inspect().deleted
    }

    /// Whether held handles were released.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.inspect().released
    }

    /// Number of [`Surface::delete`] calls received.
    #[must_use]
    pub fn delete_calls(&self) -> usize {
        self.inspect().delete_calls
    }

    /// Events handed back for default processing.
    #[must_use]
    pub fn forwarded(&self) -> Vec<MemoryEvent> {
        self.inspect().forwarded.clone()
    }
}

impl Default for MemorySurface {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Surface for MemorySurface {
    type Event = MemoryEvent;

    async fn set_name(&self, name: &str) -> Result<(), SurfaceError> {
        self.state()?.live()?.name = name.to_string();
        Ok(())
    }

    async fn write_tag(&self, text: &str) -> Result<(), SurfaceError> {
        self.state()?.live()?.tag.push_str(text);
        Ok(())
    }

    async fn set_addr(&self, addr: Address) -> Result<(), SurfaceError> {
        let mut guard = self.state()?;
        let state = guard.live()?;
        state.addr = match addr {
            Address::Whole => (0, state.len()),
            Address::Chars { start, end } => {
                if start > end || end > state.len() {
                    return Err(SurfaceError::InvalidAddress(addr.to_string()));
                }
                (start, end)
            }
            Address::Dot => state.dot,
        };
        Ok(())
    }

    async fn read_addr(&self) -> Result<(usize, usize), SurfaceError> {
        Ok(self.state()?.live()?.addr)
    }

    async fn select_addr(&self) -> Result<(), SurfaceError> {
        let mut guard = self.state()?;
        let state = guard.live()?;
        state.dot = state.addr;
        Ok(())
    }

    async fn replace(&self, text: &str) -> Result<(), SurfaceError> {
        let mut guard = self.state()?;
        let state = guard.live()?;
        let addr = state.addr;
        let end = state.splice(addr, text);
        state.addr = (end, end);
        Ok(())
    }

    async fn read_body(&self) -> Result<String, SurfaceError> {
        Ok(self.state()?.live()?.body.clone())
    }

    async fn set_dirty(&self, dirty: bool) -> Result<(), SurfaceError> {
        self.state()?.live()?.dirty = dirty;
        Ok(())
    }

    async fn events(&self) -> Result<SurfaceEvents<MemoryEvent>, SurfaceError> {
        let rx = self
            .state()?
            .events_rx
            .take()
            .ok_or(SurfaceError::EventsTaken)?;
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn forward(&self, event: MemoryEvent) -> Result<(), SurfaceError> {
        self.state()?.live()?.forwarded.push(event);
        Ok(())
    }

    async fn delete(&self, discard: bool) -> Result<(), SurfaceError> {
        let mut state = self.state()?;
        state.delete_calls += 1;
        let state = state.live()?;
        if state.dirty && !discard {
            return Err(SurfaceError::Unsaved);
        }
        state.deleted = true;
        state.drop_events();
        Ok(())
    }

    async fn close(&self) {
        self.inspect().released = true;
    }
}

/// Factory handing out [`MemorySurface`]s and remembering each one.
#[derive(Clone, Default)]
pub struct MemorySurfaceFactory {
    created: Arc<Mutex<Vec<MemorySurface>>>,
    unavailable: bool,
}

impl MemorySurfaceFactory {
    /// Create a new factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory whose every `create` fails.
    #[must_use]
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    /// Handles to every surface created so far, oldest first.
    #[must_use]
    pub fn surfaces(&self) -> Vec<MemorySurface> {
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl SurfaceFactory for MemorySurfaceFactory {
    type Surface = MemorySurface;

    async fn create(&self) -> Result<MemorySurface, SurfaceError> {
        if self.unavailable {
            return Err(SurfaceError::Unavailable("memory surfaces disabled".into()));
        }
        let surface = MemorySurface::new();
        self.created
            .lock()
            .map_err(|e| SurfaceError::Io(e.to_string()))?
            .push(surface.clone());
        Ok(surface)
    }
}
