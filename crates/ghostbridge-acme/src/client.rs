//! Multiplexed 9P2000 client.
//!
//! Requests from any number of tasks share one connection: writes are
//! serialized behind a mutex and a single reader task routes each reply to
//! its caller by tag. A blocking read (acme's event file) therefore never
//! holds up other requests.

use std::{
    collections::HashMap,
    path::Path,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering},
    },
};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::UnixStream,
    sync::oneshot,
};
use tracing::{debug, warn};

use crate::fcall::{self, IOHDRSZ, NOFID, NOTAG, Rmsg, Tmsg, VERSION};

/// Largest message we ask the server for.
const MSIZE: u32 = 8192 + IOHDRSZ;
const ROOT_FID: u32 = 0;

/// 9P error.
#[derive(Debug, thiserror::Error)]
pub enum NinepError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// Error string returned by the server.
    #[error("{0}")]
    Remote(String),
    #[error("Connection closed")]
    Disconnected,
}

type Reply = Result<Rmsg, NinepError>;

struct Shared {
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    /// Outstanding requests by tag; `None` once the connection is gone.
    pending: Mutex<Option<HashMap<u16, oneshot::Sender<Reply>>>>,
    next_tag: AtomicU16,
    next_fid: AtomicU32,
    msize: u32,
}

impl Shared {
    fn register(&self, tx: oneshot::Sender<Reply>) -> Result<u16, NinepError> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let pending = pending.as_mut().ok_or(NinepError::Disconnected)?;
        loop {
            let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
            if tag != NOTAG && !pending.contains_key(&tag) {
                pending.insert(tag, tx);
                return Ok(tag);
            }
        }
    }

    fn forget(&self, tag: u16) {
        if let Some(pending) = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            pending.remove(&tag);
        }
    }

    fn complete(&self, tag: u16, reply: Rmsg) {
        let tx = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
            .and_then(|pending| pending.remove(&tag));
        match tx {
            // The caller may have given up waiting.
            Some(tx) => drop(tx.send(Ok(reply))),
            None => warn!(tag, "9P reply for unknown tag"),
        }
    }

    fn shutdown(&self) {
        // Dropping the senders wakes every waiter with `Disconnected`.
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn is_closed(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

/// Connection to a 9P file server, attached at its root.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    /// Connect to a file server listening on a Unix socket.
    ///
    /// # Errors
    /// Returns error if the socket cannot be reached or the handshake fails.
    pub async fn connect(path: &Path, uname: &str) -> Result<Self, NinepError> {
        let stream = UnixStream::connect(path).await?;
        Self::handshake(stream, uname).await
    }

    /// Negotiate the protocol version and attach over `io`.
    ///
    /// # Errors
    /// Returns error if the server rejects the version or the attach.
    pub async fn handshake<T>(io: T, uname: &str) -> Result<Self, NinepError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(io);

        let mut buf = BytesMut::new();
        Tmsg::Version {
            msize: MSIZE,
            version: VERSION.to_string(),
        }
        .encode(NOTAG, &mut buf);
        writer.write_all(&buf).await?;
        writer.flush().await?;

        let mut rbuf = BytesMut::with_capacity(MSIZE as usize);
        let msize = match read_reply(&mut reader, &mut rbuf).await? {
            (_, Rmsg::Version { msize, version }) if version == VERSION => msize.min(MSIZE),
            (_, Rmsg::Version { version, .. }) => {
                return Err(NinepError::Protocol(format!(
                    "unsupported version {version}"
                )));
            }
            (_, Rmsg::Error { ename }) => return Err(NinepError::Remote(ename)),
            (_, other) => return Err(unexpected(&other)),
        };
        if msize <= IOHDRSZ {
            return Err(NinepError::Protocol(format!("msize {msize} too small")));
        }

        let shared = Arc::new(Shared {
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending: Mutex::new(Some(HashMap::new())),
            next_tag: AtomicU16::new(0),
            next_fid: AtomicU32::new(ROOT_FID + 1),
            msize,
        });
        tokio::spawn(read_loop(reader, rbuf, Arc::clone(&shared)));

        let client = Self { shared };
        match client
            .rpc(Tmsg::Attach {
                fid: ROOT_FID,
                afid: NOFID,
                uname: uname.to_string(),
                aname: String::new(),
            })
            .await?
        {
            Rmsg::Attach { .. } => Ok(client),
            other => Err(unexpected(&other)),
        }
    }

    /// Whether the connection has been lost.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Walk to `path` from the root and open it.
    ///
    /// # Errors
    /// Returns error if the file does not exist or cannot be opened.
    pub async fn open(&self, path: &str, mode: u8) -> Result<File, NinepError> {
        let names: Vec<String> = path
            .split('/')
            .filter(|name| !name.is_empty())
            .map(String::from)
            .collect();
        let wanted = names.len();
        let fid = self.shared.next_fid.fetch_add(1, Ordering::Relaxed);

        match self
            .rpc(Tmsg::Walk {
                fid: ROOT_FID,
                newfid: fid,
                names,
            })
            .await?
        {
            Rmsg::Walk { qids } if qids.len() == wanted => {}
            // A partial walk leaves `fid` unassigned.
            Rmsg::Walk { .. } => return Err(NinepError::Remote(format!("{path}: file not found"))),
            other => return Err(unexpected(&other)),
        }

        let iounit = match self.rpc(Tmsg::Open { fid, mode }).await {
            Ok(Rmsg::Open { iounit, .. }) => iounit,
            Ok(other) => {
                self.clunk(fid).await;
                return Err(unexpected(&other));
            }
            Err(err) => {
                self.clunk(fid).await;
                return Err(err);
            }
        };
        let max = self.shared.msize - IOHDRSZ;
        let iounit = if iounit == 0 { max } else { iounit.min(max) };

        debug!(path, fid, iounit, "opened 9P file");
        Ok(File {
            client: self.clone(),
            fid,
            iounit,
            offset: AtomicU64::new(0),
        })
    }

    async fn clunk(&self, fid: u32) {
        if let Err(err) = self.rpc(Tmsg::Clunk { fid }).await {
            debug!(fid, error = %err, "clunk failed");
        }
    }

    async fn rpc(&self, msg: Tmsg) -> Result<Rmsg, NinepError> {
        let (tx, rx) = oneshot::channel();
        let tag = self.shared.register(tx)?;
        let mut buf = BytesMut::new();
        msg.encode(tag, &mut buf);

        {
            let mut writer = self.shared.writer.lock().await;
            let written = async {
                writer.write_all(&buf).await?;
                writer.flush().await
            }
            .await;
            if let Err(err) = written {
                self.shared.forget(tag);
                return Err(err.into());
            }
        }

        match rx.await {
            Ok(Ok(Rmsg::Error { ename })) => Err(NinepError::Remote(ename)),
            Ok(reply) => reply,
            Err(_) => Err(NinepError::Disconnected),
        }
    }
}

async fn read_reply<R>(reader: &mut R, buf: &mut BytesMut) -> Result<(u16, Rmsg), NinepError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(reply) = fcall::decode_reply(buf)? {
            return Ok(reply);
        }
        if reader.read_buf(buf).await? == 0 {
            return Err(NinepError::Disconnected);
        }
    }
}

async fn read_loop<R>(mut reader: R, mut buf: BytesMut, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    let err = loop {
        match read_reply(&mut reader, &mut buf).await {
            Ok((tag, reply)) => shared.complete(tag, reply),
            Err(err) => break err,
        }
    };
    debug!(error = %err, "9P connection closed");
    shared.shutdown();
}

fn unexpected(reply: &Rmsg) -> NinepError {
    NinepError::Protocol(format!("unexpected reply {reply:?}"))
}

/// An open file on the server.
pub struct File {
    client: Client,
    fid: u32,
    iounit: u32,
    offset: AtomicU64,
}

impl File {
    /// Largest payload of a single read or write.
    #[must_use]
    pub const fn iounit(&self) -> u32 {
        self.iounit
    }

    /// Read up to one `iounit` at `offset`.
    ///
    /// # Errors
    /// Returns error if the server rejects the read.
    pub async fn read_at(&self, offset: u64) -> Result<Bytes, NinepError> {
        match self
            .client
            .rpc(Tmsg::Read {
                fid: self.fid,
                offset,
                count: self.iounit,
            })
            .await?
        {
            Rmsg::Read { data } => Ok(data),
            other => Err(unexpected(&other)),
        }
    }

    /// Read at the file's cursor and advance it.
    ///
    /// An empty result means end of file.
    ///
    /// # Errors
    /// Returns error if the server rejects the read.
    pub async fn read(&self) -> Result<Bytes, NinepError> {
        let data = self.read_at(self.offset.load(Ordering::Acquire)).await?;
        self.offset.fetch_add(data.len() as u64, Ordering::AcqRel);
        Ok(data)
    }

    /// Read from offset 0 to end of file, leaving the cursor alone.
    ///
    /// # Errors
    /// Returns error if any read fails.
    pub async fn read_all(&self) -> Result<Vec<u8>, NinepError> {
        let mut out = Vec::new();
        loop {
            let data = self.read_at(out.len() as u64).await?;
            if data.is_empty() {
                return Ok(out);
            }
            out.extend_from_slice(&data);
        }
    }

    /// Write `text` at the cursor, split into `iounit` sized pieces that
    /// never cut a character in half.
    ///
    /// # Errors
    /// Returns error if any write fails or comes up short.
    pub async fn write_str(&self, text: &str) -> Result<(), NinepError> {
        for chunk in chunks(text, self.iounit as usize) {
            let offset = self.offset.load(Ordering::Acquire);
            let len = chunk.len();
            match self
                .client
                .rpc(Tmsg::Write {
                    fid: self.fid,
                    offset,
                    data: Bytes::copy_from_slice(chunk.as_bytes()),
                })
                .await?
            {
                Rmsg::Write { count } if count as usize == len => {
                    self.offset.fetch_add(len as u64, Ordering::AcqRel);
                }
                Rmsg::Write { count } => {
                    return Err(NinepError::Protocol(format!(
                        "short write: {count} of {len} bytes"
                    )));
                }
                other => return Err(unexpected(&other)),
            }
        }
        Ok(())
    }

    /// Release the fid.
    pub async fn clunk(&self) {
        self.client.clunk(self.fid).await;
    }
}

/// Split `text` into pieces of at most `max` bytes on character boundaries.
/// A character wider than `max` gets a piece of its own.
fn chunks(text: &str, max: usize) -> Vec<&str> {
    // An empty write still goes out; acme deletes the addressed text on it.
    if text.is_empty() {
        return vec![text];
    }
    let mut out = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let mut end = max.min(rest.len());
        while end > 0 && !rest.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            end = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        let (head, tail) = rest.split_at(end);
        out.push(head);
        rest = tail;
    }
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex as StdMutex;

    use tokio::io::DuplexStream;

    use super::*;
    use crate::fcall::tests::{rattach, rclunk, rerror, ropen, rread, rversion, rwalk, rwrite};

    /// A request as seen by the fake server.
    #[derive(Debug, Clone)]
    pub(crate) struct Request {
        pub kind: u8,
        pub tag: u16,
        pub body: Vec<u8>,
    }

    impl Request {
        pub(crate) fn u32_at(&self, at: usize) -> u32 {
            u32::from_le_bytes(self.body[at..at + 4].try_into().unwrap())
        }

        pub(crate) fn u64_at(&self, at: usize) -> u64 {
            u64::from_le_bytes(self.body[at..at + 8].try_into().unwrap())
        }

        /// Payload of a Twrite.
        pub(crate) fn write_data(&self) -> &[u8] {
            &self.body[16..]
        }
    }

    /// Serve 9P on `io`, answering each request with `answer`. Returning
    /// `None` hangs up.
    pub(crate) async fn serve<F>(mut io: DuplexStream, mut answer: F)
    where
        F: FnMut(&Request) -> Option<Vec<u8>> + Send,
    {
        let mut buf = Vec::new();
        loop {
            while buf.len() < 4
                || buf.len() < u32::from_le_bytes(buf[..4].try_into().unwrap()) as usize
            {
                let mut chunk = [0u8; 4096];
                let n = io.read(&mut chunk).await.unwrap_or(0);
                if n == 0 {
                    return;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            let size = u32::from_le_bytes(buf[..4].try_into().unwrap()) as usize;
            let frame: Vec<u8> = buf.drain(..size).collect();
            let request = Request {
                kind: frame[4],
                tag: u16::from_le_bytes([frame[5], frame[6]]),
                body: frame[7..].to_vec(),
            };
            let Some(reply) = answer(&request) else {
                return;
            };
            if io.write_all(&reply).await.is_err() {
                return;
            }
        }
    }

    /// Answers the handshake, walks of any depth, opens with `iounit`,
    /// clunks, and writes; reads return `content` once then EOF.
    pub(crate) fn simple_server(
        iounit: u32,
        content: &'static [u8],
        writes: Arc<StdMutex<Vec<Vec<u8>>>>,
    ) -> impl FnMut(&Request) -> Option<Vec<u8>> + Send {
        move |req| {
            Some(match req.kind {
                100 => rversion(8192 + IOHDRSZ),
                104 => rattach(req.tag),
                110 => rwalk(req.tag, u16::from_le_bytes([req.body[8], req.body[9]])),
                112 => ropen(req.tag, iounit),
                116 => {
                    let offset = usize::try_from(req.u64_at(4)).unwrap();
                    rread(req.tag, content.get(offset..).unwrap_or_default())
                }
                118 => {
                    let data = req.write_data().to_vec();
                    let count = u32::try_from(data.len()).unwrap();
                    writes.lock().unwrap().push(data);
                    rwrite(req.tag, count)
                }
                120 => rclunk(req.tag),
                _ => rerror(req.tag, "unsupported"),
            })
        }
    }

    #[tokio::test]
    async fn test_open_read_write() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let writes = Arc::new(StdMutex::new(Vec::new()));
        tokio::spawn(serve(
            server_io,
            simple_server(0, b"hello body", Arc::clone(&writes)),
        ));

        let client = Client::handshake(client_io, "glenda").await.unwrap();
        let file = client.open("1/body", fcall::ORDWR).await.unwrap();
        assert_eq!(file.iounit(), 8192);
        assert_eq!(file.read_all().await.unwrap(), b"hello body");

        file.write_str("appended").await.unwrap();
        assert_eq!(writes.lock().unwrap().as_slice(), &[b"appended".to_vec()]);
        file.clunk().await;
    }

    #[tokio::test]
    async fn test_write_is_chunked_on_char_boundaries() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let writes = Arc::new(StdMutex::new(Vec::new()));
        tokio::spawn(serve(server_io, simple_server(4, b"", Arc::clone(&writes))));

        let client = Client::handshake(client_io, "glenda").await.unwrap();
        let file = client.open("1/data", fcall::OWRITE).await.unwrap();
        file.write_str("abéfgh").await.unwrap();

        let writes = writes.lock().unwrap().clone();
        assert_eq!(writes.concat(), "abéfgh".as_bytes());
        assert!(writes.iter().all(|w| w.len() <= 4));
        assert!(writes.iter().all(|w| std::str::from_utf8(w).is_ok()));
    }

    #[tokio::test]
    async fn test_empty_write_sends_one_twrite() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let writes = Arc::new(StdMutex::new(Vec::new()));
        tokio::spawn(serve(server_io, simple_server(4, b"", Arc::clone(&writes))));

        let client = Client::handshake(client_io, "glenda").await.unwrap();
        let file = client.open("1/data", fcall::OWRITE).await.unwrap();
        file.write_str("").await.unwrap();

        assert_eq!(*writes.lock().unwrap(), vec![Vec::<u8>::new()]);
    }

    #[tokio::test]
    async fn test_remote_error() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve(server_io, |req| {
            Some(match req.kind {
                100 => rversion(8192),
                104 => rattach(req.tag),
                _ => rerror(req.tag, "file does not exist"),
            })
        }));

        let client = Client::handshake(client_io, "glenda").await.unwrap();
        let err = client.open("nope", fcall::OREAD).await.err().unwrap();
        assert!(matches!(err, NinepError::Remote(ref e) if e == "file does not exist"));
    }

    #[tokio::test]
    async fn test_hangup_fails_pending_and_later_requests() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve(server_io, |req| match req.kind {
            100 => Some(rversion(8192)),
            104 => Some(rattach(req.tag)),
            _ => None,
        }));

        let client = Client::handshake(client_io, "glenda").await.unwrap();
        let err = client.open("1/event", fcall::ORDWR).await.err().unwrap();
        assert!(matches!(err, NinepError::Disconnected));
        assert!(client.is_closed());
        assert!(matches!(
            client.open("1/ctl", fcall::ORDWR).await,
            Err(NinepError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_version_mismatch() {
        let (client_io, server_io) = tokio::io::duplex(1024);
        tokio::spawn(serve(server_io, |_| {
            let mut body = 8192u32.to_le_bytes().to_vec();
            body.extend(crate::fcall::tests::string("9P2000.L"));
            Some(crate::fcall::tests::reply(101, NOTAG, &body))
        }));
        assert!(matches!(
            Client::handshake(client_io, "glenda").await,
            Err(NinepError::Protocol(_))
        ));
    }

    #[test]
    fn test_chunks() {
        assert_eq!(chunks("abcdef", 4), vec!["abcd", "ef"]);
        assert_eq!(chunks("aé", 2), vec!["a", "é"]);
        assert_eq!(chunks("€", 1), vec!["€"]);
        assert_eq!(chunks("", 8), vec![""]);
    }
}
