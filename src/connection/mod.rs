use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};

use crate::config::BrokerUri;
use crate::logging::Logger;
use crate::protocol::{ProtocolError, Reply, ReplyBuffer};

pub const READ_CHUNK_SIZE: usize = 4096;

#[derive(Debug)]
pub enum ConnectionError {
    Connect {
        address: String,
        source: io::Error,
    },
    Io {
        source: io::Error,
    },
    ClosedByPeer,
    NotConnected,
    BadGreeting {
        reply: String,
    },
    ErrorReply {
        reply: String,
    },
    Codec(ProtocolError),
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect { address, source } => {
                write!(f, "failed to connect to broker at {address}: {source}")
            }
            Self::Io { source } => write!(f, "broker socket I/O error: {source}"),
            Self::ClosedByPeer => write!(f, "broker closed the connection"),
            Self::NotConnected => write!(f, "not connected to the broker"),
            Self::BadGreeting { reply } => {
                write!(f, "unexpected broker greeting '{reply}', expected '+HI'")
            }
            Self::ErrorReply { reply } => write!(f, "broker returned error reply '{reply}'"),
            Self::Codec(source) => write!(f, "reply framing error: {source}"),
        }
    }
}

impl std::error::Error for ConnectionError {}

/// Blocking TCP transport to the broker. Owns the socket and the reply
/// accumulation buffer; exactly one thread may drive it at a time.
pub struct Connection {
    uri: BrokerUri,
    stream: Option<TcpStream>,
    buffer: ReplyBuffer,
    logger: Logger,
}

impl Connection {
    pub fn new(uri: BrokerUri, logger: Logger) -> Self {
        Self {
            uri,
            stream: None,
            buffer: ReplyBuffer::new(),
            logger,
        }
    }

    /// Socket liveness as seen locally; never attempts a read.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Opens the socket and performs the first read. The broker must greet
    /// with a success line starting `+HI`; the text after the marker is the
    /// handshake document, decoded by the caller.
    pub fn handshake(&mut self) -> Result<String, ConnectionError> {
        if self.stream.is_none() {
            let address = self.uri.address();
            let stream =
                TcpStream::connect(&address).map_err(|source| ConnectionError::Connect {
                    address,
                    source,
                })?;
            let _ = stream.set_nodelay(true);
            self.stream = Some(stream);
            self.buffer = ReplyBuffer::new();
        }

        match self.read_reply()? {
            Reply::Ok(payload) if payload.starts_with("HI") => {
                self.logger.trace(Some("connection"), &format!("> +{payload}"));
                Ok(payload["HI".len()..].trim().to_owned())
            }
            Reply::Ok(payload) => Err(ConnectionError::BadGreeting {
                reply: format!("+{payload}"),
            }),
            Reply::Error(reply) => Err(ConnectionError::BadGreeting { reply }),
            Reply::Bulk(reply) => Err(ConnectionError::BadGreeting { reply }),
            Reply::Nil => Err(ConnectionError::BadGreeting {
                reply: "nil".to_owned(),
            }),
        }
    }

    pub fn connect(&mut self, hello_payload: &str) -> Result<(), ConnectionError> {
        self.send(&format!("HELLO {hello_payload}"))?;
        Ok(())
    }

    /// Sends one newline-terminated command and blocks for the reply.
    /// `None` is a nil bulk reply; error replies raise.
    pub fn send(&mut self, command: &str) -> Result<Option<String>, ConnectionError> {
        self.logger.trace(Some("connection"), command);

        let stream = self
            .stream
            .as_mut()
            .ok_or(ConnectionError::NotConnected)?;
        stream
            .write_all(format!("{command}\n").as_bytes())
            .map_err(|source| ConnectionError::Io { source })?;

        match self.read_reply()? {
            Reply::Ok(payload) => {
                self.logger.trace(Some("connection"), &format!("> +{payload}"));
                Ok(Some(payload))
            }
            Reply::Bulk(payload) => {
                self.logger.trace(Some("connection"), &format!("> {payload}"));
                Ok(Some(payload))
            }
            Reply::Nil => {
                self.logger.trace(Some("connection"), "> nil");
                Ok(None)
            }
            Reply::Error(reply) => {
                self.logger.debug(Some("connection"), &format!("> {reply}"));
                Err(ConnectionError::ErrorReply { reply })
            }
        }
    }

    /// Releases the socket unconditionally; tolerant of an already-closed
    /// stream, callable any number of times.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn read_reply(&mut self) -> Result<Reply, ConnectionError> {
        loop {
            if let Some(reply) = self.buffer.try_parse().map_err(ConnectionError::Codec)? {
                return Ok(reply);
            }

            let stream = self
                .stream
                .as_mut()
                .ok_or(ConnectionError::NotConnected)?;
            let mut chunk = [0_u8; READ_CHUNK_SIZE];
            let read = stream
                .read(&mut chunk)
                .map_err(|source| ConnectionError::Io { source })?;
            if read == 0 {
                return Err(ConnectionError::ClosedByPeer);
            }
            self.buffer.extend(&chunk[..read]);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    use crate::config::BrokerUri;
    use crate::logging::{Logger, LoggerConfig};

    use super::{Connection, ConnectionError};

    fn test_logger() -> Logger {
        Logger::new(LoggerConfig::default())
    }

    fn spawn_broker<F>(serve: F) -> (BrokerUri, JoinHandle<()>)
    where
        F: FnOnce(TcpStream) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listener should bind");
        let addr = listener.local_addr().expect("local addr should exist");
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().expect("broker should accept");
            serve(stream);
        });

        (
            BrokerUri {
                host: addr.ip().to_string(),
                port: addr.port(),
            },
            handle,
        )
    }

    #[test]
    fn handshake_returns_greeting_document() {
        let (uri, broker) = spawn_broker(|mut stream| {
            stream
                .write_all(b"+HI {\"v\":2}\r\n")
                .expect("greeting should write");
        });

        let mut connection = Connection::new(uri, test_logger());
        let doc = connection.handshake().expect("handshake should pass");
        assert_eq!(doc, "{\"v\":2}");
        assert!(connection.is_connected());

        connection.close();
        broker.join().expect("broker thread should finish");
    }

    #[test]
    fn handshake_rejects_error_greeting() {
        let (uri, broker) = spawn_broker(|mut stream| {
            stream
                .write_all(b"-ERR shutting down\r\n")
                .expect("greeting should write");
        });

        let mut connection = Connection::new(uri, test_logger());
        let err = connection.handshake().expect_err("bad greeting should fail");
        assert!(matches!(err, ConnectionError::BadGreeting { .. }));

        connection.close();
        broker.join().expect("broker thread should finish");
    }

    #[test]
    fn send_reads_reply_across_partial_writes() {
        let payload = r#"{"jid":"1","jobtype":"Email","args":[]}"#;
        let frame = format!("${}\r\n{payload}\r\n", payload.len());
        let (uri, broker) = spawn_broker(move |mut stream| {
            stream
                .write_all(b"+HI {\"v\":2}\r\n")
                .expect("greeting should write");

            let mut reader = BufReader::new(stream.try_clone().expect("stream should clone"));
            let mut line = String::new();
            reader.read_line(&mut line).expect("command should arrive");
            assert!(line.starts_with("FETCH"));

            for chunk in frame.as_bytes().chunks(7) {
                stream.write_all(chunk).expect("chunk should write");
                stream.flush().expect("chunk should flush");
                thread::sleep(Duration::from_millis(5));
            }
        });

        let mut connection = Connection::new(uri, test_logger());
        connection.handshake().expect("handshake should pass");
        let reply = connection
            .send("FETCH default")
            .expect("send should pass")
            .expect("bulk reply should carry payload");
        assert_eq!(reply, payload);

        connection.close();
        broker.join().expect("broker thread should finish");
    }

    #[test]
    fn nil_reply_maps_to_none() {
        let (uri, broker) = spawn_broker(|mut stream| {
            stream
                .write_all(b"+HI {\"v\":2}\r\n")
                .expect("greeting should write");

            let mut reader = BufReader::new(stream.try_clone().expect("stream should clone"));
            let mut line = String::new();
            reader.read_line(&mut line).expect("command should arrive");
            stream.write_all(b"$-1\r\n").expect("nil should write");
        });

        let mut connection = Connection::new(uri, test_logger());
        connection.handshake().expect("handshake should pass");
        let reply = connection.send("FETCH default").expect("send should pass");
        assert!(reply.is_none());

        connection.close();
        broker.join().expect("broker thread should finish");
    }

    #[test]
    fn error_reply_carries_full_text() {
        let (uri, broker) = spawn_broker(|mut stream| {
            stream
                .write_all(b"+HI {\"v\":2}\r\n")
                .expect("greeting should write");

            let mut reader = BufReader::new(stream.try_clone().expect("stream should clone"));
            let mut line = String::new();
            reader.read_line(&mut line).expect("command should arrive");
            stream
                .write_all(b"-ERR Job not found\r\n")
                .expect("error should write");
        });

        let mut connection = Connection::new(uri, test_logger());
        connection.handshake().expect("handshake should pass");
        let err = connection
            .send("ACK {\"jid\":\"nope\"}")
            .expect_err("error reply should fail");
        match err {
            ConnectionError::ErrorReply { reply } => assert_eq!(reply, "-ERR Job not found"),
            other => panic!("unexpected error: {other}"),
        }

        connection.close();
        broker.join().expect("broker thread should finish");
    }

    #[test]
    fn close_is_idempotent_and_send_requires_connection() {
        let (uri, broker) = spawn_broker(|mut stream| {
            stream
                .write_all(b"+HI {\"v\":2}\r\n")
                .expect("greeting should write");
        });

        let mut connection = Connection::new(uri, test_logger());
        connection.handshake().expect("handshake should pass");

        connection.close();
        connection.close();
        assert!(!connection.is_connected());
        assert!(matches!(
            connection.send("BEAT {}"),
            Err(ConnectionError::NotConnected)
        ));

        broker.join().expect("broker thread should finish");
    }
}
