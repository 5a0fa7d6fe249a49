//! 9P2000 message encoding.
//!
//! Only the messages a client of the acme file server needs are modeled.
//! Every message is `size[4] type[1] tag[2] body`, little endian, with
//! strings as `len[2] utf8`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::client::NinepError;

pub const VERSION: &str = "9P2000";
pub const NOTAG: u16 = 0xFFFF;
pub const NOFID: u32 = 0xFFFF_FFFF;
/// Header bytes of an Rread/Twrite around the data.
pub const IOHDRSZ: u32 = 24;

pub const OREAD: u8 = 0;
pub const OWRITE: u8 = 1;
pub const ORDWR: u8 = 2;

const TVERSION: u8 = 100;
const RVERSION: u8 = 101;
const TATTACH: u8 = 104;
const RATTACH: u8 = 105;
const RERROR: u8 = 107;
const TWALK: u8 = 110;
const RWALK: u8 = 111;
const TOPEN: u8 = 112;
const ROPEN: u8 = 113;
const TREAD: u8 = 116;
const RREAD: u8 = 117;
const TWRITE: u8 = 118;
const RWRITE: u8 = 119;
const TCLUNK: u8 = 120;
const RCLUNK: u8 = 121;

/// Server's identity for a file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Qid {
    pub kind: u8,
    pub version: u32,
    pub path: u64,
}

/// Client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tmsg {
    Version { msize: u32, version: String },
    Attach {
        fid: u32,
        afid: u32,
        uname: String,
        aname: String,
    },
    Walk {
        fid: u32,
        newfid: u32,
        names: Vec<String>,
    },
    Open { fid: u32, mode: u8 },
    Read { fid: u32, offset: u64, count: u32 },
    Write { fid: u32, offset: u64, data: Bytes },
    Clunk { fid: u32 },
}

/// Server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rmsg {
    Version { msize: u32, version: String },
    Attach { qid: Qid },
    Error { ename: String },
    Walk { qids: Vec<Qid> },
    Open { qid: Qid, iounit: u32 },
    Read { data: Bytes },
    Write { count: u32 },
    Clunk,
}

impl Tmsg {
    const fn kind(&self) -> u8 {
        match self {
            Self::Version { .. } => TVERSION,
            Self::Attach { .. } => TATTACH,
            Self::Walk { .. } => TWALK,
            Self::Open { .. } => TOPEN,
            Self::Read { .. } => TREAD,
            Self::Write { .. } => TWRITE,
            Self::Clunk { .. } => TCLUNK,
        }
    }

    /// Append the framed message to `buf`.
    pub fn encode(&self, tag: u16, buf: &mut BytesMut) {
        let start = buf.len();
        buf.put_u32_le(0);
        buf.put_u8(self.kind());
        buf.put_u16_le(tag);
        match self {
            Self::Version { msize, version } => {
                buf.put_u32_le(*msize);
                put_str(buf, version);
            }
            Self::Attach {
                fid,
                afid,
                uname,
                aname,
            } => {
                buf.put_u32_le(*fid);
                buf.put_u32_le(*afid);
                put_str(buf, uname);
                put_str(buf, aname);
            }
            Self::Walk { fid, newfid, names } => {
                buf.put_u32_le(*fid);
                buf.put_u32_le(*newfid);
                buf.put_u16_le(u16::try_from(names.len()).unwrap_or(u16::MAX));
                for name in names {
                    put_str(buf, name);
                }
            }
            Self::Open { fid, mode } => {
                buf.put_u32_le(*fid);
                buf.put_u8(*mode);
            }
            Self::Read { fid, offset, count } => {
                buf.put_u32_le(*fid);
                buf.put_u64_le(*offset);
                buf.put_u32_le(*count);
            }
            Self::Write { fid, offset, data } => {
                buf.put_u32_le(*fid);
                buf.put_u64_le(*offset);
                buf.put_u32_le(u32::try_from(data.len()).unwrap_or(u32::MAX));
                buf.put_slice(data);
            }
            Self::Clunk { fid } => buf.put_u32_le(*fid),
        }
        let size = u32::try_from(buf.len() - start).unwrap_or(u32::MAX);
        buf[start..start + 4].copy_from_slice(&size.to_le_bytes());
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    let len = s.len().min(usize::from(u16::MAX));
    buf.put_u16_le(u16::try_from(len).unwrap_or(u16::MAX));
    buf.put_slice(&s.as_bytes()[..len]);
}

/// Split one complete reply off the front of `buf`.
///
/// Returns `Ok(None)` while the frame is still incomplete.
///
/// # Errors
/// Returns error if the frame is malformed.
pub fn decode_reply(buf: &mut BytesMut) -> Result<Option<(u16, Rmsg)>, NinepError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let size = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if size < 7 {
        return Err(NinepError::Protocol(format!("frame too short: {size} bytes")));
    }
    if buf.len() < size {
        return Ok(None);
    }

    let mut frame = buf.split_to(size).freeze();
    frame.advance(4);
    let kind = frame.get_u8();
    let tag = frame.get_u16_le();
    let frame = &mut frame;
    let msg = match kind {
        RVERSION => Rmsg::Version {
            msize: get_u32(frame)?,
            version: get_str(frame)?,
        },
        RATTACH => Rmsg::Attach {
            qid: get_qid(frame)?,
        },
        RERROR => Rmsg::Error {
            ename: get_str(frame)?,
        },
        RWALK => {
            let n = get_u16(frame)?;
            let qids = (0..n)
                .map(|_| get_qid(frame))
                .collect::<Result<Vec<_>, _>>()?;
            Rmsg::Walk { qids }
        }
        ROPEN => Rmsg::Open {
            qid: get_qid(frame)?,
            iounit: get_u32(frame)?,
        },
        RREAD => {
            let count = get_u32(frame)? as usize;
            need(frame, count)?;
            Rmsg::Read {
                data: frame.split_to(count),
            }
        }
        RWRITE => Rmsg::Write {
            count: get_u32(frame)?,
        },
        RCLUNK => Rmsg::Clunk,
        other => {
            return Err(NinepError::Protocol(format!(
                "unexpected message type {other}"
            )));
        }
    };
    Ok(Some((tag, msg)))
}

fn need(frame: &Bytes, n: usize) -> Result<(), NinepError> {
    if frame.remaining() < n {
        Err(NinepError::Protocol("short message".into()))
    } else {
        Ok(())
    }
}

fn get_u16(frame: &mut Bytes) -> Result<u16, NinepError> {
    need(frame, 2)?;
    Ok(frame.get_u16_le())
}

fn get_u32(frame: &mut Bytes) -> Result<u32, NinepError> {
    need(frame, 4)?;
    Ok(frame.get_u32_le())
}

fn get_str(frame: &mut Bytes) -> Result<String, NinepError> {
    let len = usize::from(get_u16(frame)?);
    need(frame, len)?;
    String::from_utf8(frame.split_to(len).to_vec())
        .map_err(|e| NinepError::Protocol(format!("invalid string: {e}")))
}

fn get_qid(frame: &mut Bytes) -> Result<Qid, NinepError> {
    need(frame, 13)?;
    Ok(Qid {
        kind: frame.get_u8(),
        version: frame.get_u32_le(),
        path: frame.get_u64_le(),
    })
}
