//! acme event file messages.
//!
//! Each message is `c1 c2 q0 q1 flag nr text\n` where `c1` is the origin,
//! `c2` the kind, and `text` is exactly `nr` characters (and may itself
//! contain newlines). An event with flag 2 is followed by its expansion; an
//! execute with flag 8 is followed by the chorded argument and its location.

use std::fmt;

/// A whole acme event, with follow-up messages folded in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcmeEvent {
    /// Origin: `E` file write, `F` other file, `K` keyboard, `M` mouse.
    pub origin: char,
    /// Kind: `D`/`d` delete, `I`/`i` insert, `L`/`l` look, `X`/`x` execute.
    pub kind: char,
    pub q0: usize,
    pub q1: usize,
    /// Range as originally reported, before expansion.
    pub orig_q0: usize,
    pub orig_q1: usize,
    pub flag: u32,
    pub text: String,
    /// Chorded argument of an execute.
    pub arg: String,
    /// Location of the chorded argument.
    pub loc: String,
}

impl AcmeEvent {
    /// Whether this is a command execution in the body or tag.
    #[must_use]
    pub const fn is_execute(&self) -> bool {
        matches!(self.kind, 'x' | 'X')
    }

    /// Whether acme accepts this event being written back to it.
    #[must_use]
    pub const fn is_replayable(&self) -> bool {
        matches!(self.kind, 'x' | 'X' | 'l' | 'L')
    }

    /// Message that hands the event back to acme.
    #[must_use]
    pub fn write_back(&self) -> String {
        format!("{}{}{} {} \n", self.origin, self.kind, self.q0, self.q1)
    }
}

impl fmt::Display for AcmeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{} {} {} {:?}",
            self.origin, self.kind, self.q0, self.q1, self.text
        )
    }
}

/// Malformed event message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed acme event: {0}")]
pub struct EventError(String);

/// One message as it appears on the wire.
#[derive(Debug)]
struct Record {
    origin: char,
    kind: char,
    q0: usize,
    q1: usize,
    flag: u32,
    text: String,
}

/// Incremental decoder over bytes read from the event file.
#[derive(Debug, Default)]
pub struct EventDecoder {
    buf: Vec<u8>,
}

impl EventDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the event file.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete event, if all of its messages have arrived.
    ///
    /// # Errors
    /// Returns error if the buffered data is not an event message.
    pub fn next_event(&mut self) -> Result<Option<AcmeEvent>, EventError> {
        let Some((first, mut used)) = parse_record(&self.buf)? else {
            return Ok(None);
        };

        let mut event = AcmeEvent {
            origin: first.origin,
            kind: first.kind,
            q0: first.q0,
            q1: first.q1,
            orig_q0: first.q0,
            orig_q1: first.q1,
            flag: first.flag,
            text: first.text,
            ..AcmeEvent::default()
        };

        if event.flag & 2 != 0 {
            let Some((expansion, n)) = parse_record(&self.buf[used..])? else {
                return Ok(None);
            };
            used += n;
            if event.q0 == event.q1 {
                event.q0 = expansion.q0;
                event.q1 = expansion.q1;
                event.text = expansion.text;
            }
        }

        if event.flag & 8 != 0 {
            let Some((arg, n)) = parse_record(&self.buf[used..])? else {
                return Ok(None);
            };
            used += n;
            let Some((loc, n)) = parse_record(&self.buf[used..])? else {
                return Ok(None);
            };
            used += n;
            event.arg = arg.text;
            event.loc = loc.text;
        }

        self.buf.drain(..used);
        Ok(Some(event))
    }
}

/// Parse one message off the front of `buf`, returning it and its length.
fn parse_record(buf: &[u8]) -> Result<Option<(Record, usize)>, EventError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let origin = char::from(buf[0]);
    let kind = char::from(buf[1]);
    if !origin.is_ascii_alphabetic() || !kind.is_ascii_alphabetic() {
        return Err(EventError(format!("bad event type {origin:?}{kind:?}")));
    }

    let mut pos = 2;
    let mut fields = [0usize; 4];
    for field in &mut fields {
        let Some((value, n)) = parse_number(&buf[pos..])? else {
            return Ok(None);
        };
        *field = value;
        pos += n;
    }
    let [q0, q1, flag, nr] = fields;

    let mut text = String::new();
    let mut rest = &buf[pos..];
    for _ in 0..nr {
        let Some(&lead) = rest.first() else {
            return Ok(None);
        };
        let width = utf8_width(lead);
        if rest.len() < width {
            return Ok(None);
        }
        let ch = std::str::from_utf8(&rest[..width])
            .map_err(|e| EventError(format!("invalid utf-8 in text: {e}")))?;
        text.push_str(ch);
        rest = &rest[width..];
        pos += width;
    }

    match buf.get(pos).copied() {
        None => Ok(None),
        Some(b'\n') => Ok(Some((
            Record {
                origin,
                kind,
                q0,
                q1,
                flag: u32::try_from(flag).map_err(|e| EventError(e.to_string()))?,
                text,
            },
            pos + 1,
        ))),
        Some(other) => Err(EventError(format!(
            "expected newline, found {:?}",
            char::from(other)
        ))),
    }
}

/// Parse a decimal number terminated by a space.
fn parse_number(buf: &[u8]) -> Result<Option<(usize, usize)>, EventError> {
    let digits = buf.iter().take_while(|b| b.is_ascii_digit()).count();
    match buf.get(digits).copied() {
        None => Ok(None),
        Some(b' ') if digits > 0 => {
            let value = std::str::from_utf8(&buf[..digits])
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| EventError("number out of range".into()))?;
            Ok(Some((value, digits + 1)))
        }
        Some(other) => Err(EventError(format!(
            "expected number, found {:?}",
            char::from(other)
        ))),
    }
}

const fn utf8_width(lead: u8) -> usize {
    match lead {
        0xF0..=0xFF => 4,
        0xE0..=0xEF => 3,
        0xC0..=0xDF => 2,
        _ => 1,
    }
}
