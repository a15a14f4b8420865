//! Line framing for the control channel
//!
//! A record is `CMD<SP>ARGS<LF>`. The accumulation buffer is capped at 1024
//! octets; crossing the cap is a protocol error that closes the connection
//! before any further parsing. Encrypted traffic travels inside the secure
//! envelope `_: <base64-ciphertext>`, itself framed as one line.

use crate::crypto::latin1_string;
use crate::{Error, Result, MAX_LINE_BYTES};

/// Command marking a line as chained-cipher ciphertext
pub const SECURE_CMD: &str = "_:";

/// Smallest parseable record (`a b<LF>` is 4 octets)
const MIN_RECORD_BYTES: usize = 4;

/// Reply lines read by the client are capped independently of the
/// server-side request cap
const MAX_REPLY_BYTES: usize = 64 * 1024;

/// One framed record, command and arguments trimmed as Latin-1 text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub cmd: String,
    pub args: String,
}

impl Record {
    /// Whether this record is the secure envelope
    pub fn is_secure(&self) -> bool {
        self.cmd == SECURE_CMD
    }
}

/// Server-side accumulation buffer with overflow guard
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append received octets. Fails when the buffer would exceed the cap;
    /// the caller must close the connection without parsing further.
    pub fn extend(&mut self, bytes: &[u8]) -> Result<()> {
        if self.buf.len() + bytes.len() > MAX_LINE_BYTES {
            return Err(Error::Malformed(format!(
                "Accumulation buffer exceeds {} octets",
                MAX_LINE_BYTES
            )));
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Parse the next record out of the buffer.
    ///
    /// Returns `Ok(None)` when more octets are needed. Any framing
    /// violation is a protocol error; the caller closes the connection.
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        if self.buf.len() < MIN_RECORD_BYTES {
            return Ok(None);
        }

        let space = self.buf.iter().position(|&b| b == b' ');
        let lf = self.buf.iter().position(|&b| b == b'\n');

        match (space, lf) {
            (None, Some(_)) => {
                return Err(Error::Malformed("Record without separator".to_string()));
            }
            (Some(idx), _) if idx <= 1 => {
                return Err(Error::Malformed(format!("Command too short ({})", idx)));
            }
            (_, None) => return Ok(None),
            (Some(space), Some(lf)) if lf < space => {
                return Err(Error::Malformed("Line break before separator".to_string()));
            }
            (Some(space), Some(lf)) => {
                let cmd = latin1_string(&self.buf[..space]).trim().to_string();
                let args = latin1_string(&self.buf[space + 1..lf]).trim().to_string();

                // Consume through the LF plus any immediately-following
                // line-break, carriage-return, or space octets
                let mut end = lf + 1;
                while end < self.buf.len() && matches!(self.buf[end], b'\n' | b'\r' | b' ') {
                    end += 1;
                }
                self.buf.drain(..end);

                Ok(Some(Record { cmd, args }))
            }
        }
    }
}

/// Parse a decrypted secure payload into a record.
///
/// The inner text follows the same `CMD<SP>ARGS` shape without the line
/// terminator.
pub fn parse_inner(line: &str) -> Result<Record> {
    let space = line
        .find(' ')
        .ok_or_else(|| Error::Malformed("Payload without separator".to_string()))?;
    if space <= 1 {
        return Err(Error::Malformed(format!("Command too short ({})", space)));
    }
    Ok(Record {
        cmd: line[..space].trim().to_string(),
        args: line[space + 1..].trim().to_string(),
    })
}

/// Frame a plain record
pub fn encode_record(cmd: &str, args: &str) -> String {
    format!("{} {}\n", cmd, args)
}

/// Frame base64 ciphertext as a secure line
pub fn encode_secure(ciphertext_b64: &str) -> String {
    format!("{} {}\n", SECURE_CMD, ciphertext_b64)
}

/// Frame a reply line
pub fn encode_reply(text: &str) -> String {
    format!("{}\n", text)
}

/// Client-side reply accumulator: splits raw octets into LF-terminated
/// lines without the server's strict record grammar (replies such as an
/// empty accept list are bare lines)
#[derive(Debug, Default)]
pub struct LineReader {
    buf: Vec<u8>,
}

impl LineReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) -> Result<()> {
        if self.buf.len() + bytes.len() > MAX_REPLY_BYTES {
            return Err(Error::Malformed(format!(
                "Reply exceeds {} octets",
                MAX_REPLY_BYTES
            )));
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Pop the next complete line, trimmed of the terminator
    pub fn next_line(&mut self) -> Option<String> {
        let lf = self.buf.iter().position(|&b| b == b'\n')?;
        let line = latin1_string(&self.buf[..lf]).trim_end_matches('\r').to_string();
        self.buf.drain(..=lf);
        Some(line)
    }
}
