use std::fmt;

/// One parsed reply frame from the broker.
///
/// `Ok` carries the payload after the leading `+`, trimmed. `Error` carries the
/// full raw line including the `-` marker. `Bulk` carries the trimmed payload
/// of a `$<n>\r\n<n bytes>\r\n` frame; a bulk length of 1 or less is `Nil`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Ok(String),
    Error(String),
    Bulk(String),
    Nil,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ProtocolError {
    InvalidBulkLength { header: String },
    UnexpectedReplyLine { line: String },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidBulkLength { header } => {
                write!(f, "invalid bulk reply length header '{header}'")
            }
            Self::UnexpectedReplyLine { line } => {
                write!(f, "unexpected reply line '{line}', expected '+', '-' or '$'")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Accumulation buffer between raw socket reads and parsed replies.
///
/// Reads arrive at arbitrary boundaries: a reply line, or the payload of a
/// bulk frame, may span any number of chunks. `try_parse` consumes complete
/// frames from the front of the buffer and returns `None` until one is whole.
#[derive(Debug)]
struct BulkFrame {
    expected: usize,
    nil: bool,
}

#[derive(Debug, Default)]
pub struct ReplyBuffer {
    buffer: Vec<u8>,
    bulk: Option<BulkFrame>,
}

impl ReplyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a raw chunk, stripping embedded NUL padding bytes.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != 0));
    }

    pub fn try_parse(&mut self) -> Result<Option<Reply>, ProtocolError> {
        loop {
            if let Some(frame) = &self.bulk {
                if self.buffer.len() < frame.expected {
                    return Ok(None);
                }
                let payload: Vec<u8> = self.buffer.drain(..frame.expected).collect();
                let nil = frame.nil;
                self.bulk = None;
                return Ok(Some(if nil {
                    Reply::Nil
                } else {
                    Reply::Bulk(trimmed_text(&payload))
                }));
            }

            let Some(crlf) = find_crlf(&self.buffer) else {
                return Ok(None);
            };
            let raw: Vec<u8> = self.buffer.drain(..crlf + 2).collect();
            let line = String::from_utf8_lossy(&raw[..crlf]).into_owned();

            // Stray CRLF between frames.
            if line.is_empty() {
                continue;
            }

            match line.as_bytes()[0] {
                b'+' => return Ok(Some(Reply::Ok(line[1..].trim().to_owned()))),
                b'-' => return Ok(Some(Reply::Error(line.trim().to_owned()))),
                b'$' => {
                    let count: i64 =
                        line[1..]
                            .trim()
                            .parse()
                            .map_err(|_| ProtocolError::InvalidBulkLength {
                                header: line.clone(),
                            })?;
                    if count < 0 {
                        return Ok(Some(Reply::Nil));
                    }
                    // Payload plus its trailing CRLF. Lengths of 0 or 1 still
                    // consume their payload bytes but read out as nil.
                    self.bulk = Some(BulkFrame {
                        expected: count as usize + 2,
                        nil: count <= 1,
                    });
                }
                _ => return Err(ProtocolError::UnexpectedReplyLine { line }),
            }
        }
    }
}

fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|pair| pair == b"\r\n")
}

fn trimmed_text(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).trim().to_owned()
}
