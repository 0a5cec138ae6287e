use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use crate::http::parser::{ParseError, parse_http_request};
use crate::http::request::Request;
use crate::http::response::{Response, StatusCode};
use crate::http::writer::ResponseWriter;

/// Produces a response for one parsed request.
///
/// Implemented by the load balancer, the gateway router and the metrics
/// endpoint. The returned future may be dropped mid-flight when the client
/// goes away, so implementations must not rely on running to completion.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: Request) -> Response;
}

pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    buffer: Vec<u8>,
    state: ConnectionState,
    handler: Arc<dyn Handler>,
}

/// What one read from the client produced.
pub enum Inbound {
    Request(Request),
    /// The client sent something unusable; answer and close.
    Rejected(ParseError),
    Eof,
}

pub enum ConnectionState {
    Reading,
    Processing(Request),
    Writing(ResponseWriter, bool), // bool = keep_alive?
    Closed,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, handler: Arc<dyn Handler>) -> Self {
        Self {
            stream,
            peer,
            buffer: Vec::with_capacity(4096),
            state: ConnectionState::Reading,
            handler,
        }
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            match std::mem::replace(&mut self.state, ConnectionState::Closed) {
                ConnectionState::Reading => {
                    self.state = match self.read_request().await? {
                        Inbound::Request(req) => ConnectionState::Processing(req),
                        Inbound::Rejected(e) => {
                            tracing::debug!(remote = %self.peer, error = ?e, "Rejecting request");
                            let writer = ResponseWriter::new(&rejection(&e), false);
                            ConnectionState::Writing(writer, false)
                        }
                        Inbound::Eof => ConnectionState::Closed,
                    };
                }

                ConnectionState::Processing(req) => {
                    let keep_alive = req.keep_alive();
                    let handler = self.handler.clone();

                    // Dropping the handler future aborts backoff sleeps and
                    // upstream I/O for a client that already left.
                    let outcome = tokio::select! {
                        response = handler.handle(req) => Some(response),
                        _ = wait_for_close(&self.stream) => None,
                    };

                    let Some(response) = outcome else {
                        tracing::debug!(remote = %self.peer, "Client went away, request abandoned");
                        continue;
                    };

                    let writer = ResponseWriter::new(&response, keep_alive);
                    self.state = ConnectionState::Writing(writer, keep_alive);
                }

                ConnectionState::Writing(mut writer, keep_alive) => {
                    writer.write_to_stream(&mut self.stream).await?;

                    self.state = if keep_alive {
                        ConnectionState::Reading
                    } else {
                        ConnectionState::Closed
                    };
                }

                ConnectionState::Closed => {
                    break;
                }
            }
        }

        Ok(())
    }

    /// Reads until one complete request is buffered.
    ///
    /// The parser enforces the head and body size caps, so the buffer never
    /// grows past one maximal request plus a single read.
    pub async fn read_request(&mut self) -> anyhow::Result<Inbound> {
        loop {
            match parse_http_request(&self.buffer) {
                Ok((mut request, consumed)) => {
                    self.buffer.drain(..consumed);
                    request.remote_addr = Some(self.peer);
                    return Ok(Inbound::Request(request));
                }

                Err(ParseError::Incomplete) => {}

                Err(e) => return Ok(Inbound::Rejected(e)),
            }

            let mut temp = [0u8; 16 * 1024];
            let n = self.stream.read(&mut temp).await?;

            if n == 0 {
                return Ok(Inbound::Eof);
            }

            self.buffer.extend_from_slice(&temp[..n]);
        }
    }
}

/// Error response for a request that could not be parsed.
fn rejection(error: &ParseError) -> Response {
    match error {
        ParseError::HeadTooLarge => Response::text(
            StatusCode::RequestHeaderFieldsTooLarge,
            "431 Request Header Fields Too Large",
        ),
        ParseError::BodyTooLarge => {
            Response::text(StatusCode::PayloadTooLarge, "413 Payload Too Large")
        }
        ParseError::UnsupportedTransferEncoding => {
            Response::text(StatusCode::NotImplemented, "501 Not Implemented")
        }
        _ => Response::text(StatusCode::BadRequest, "400 Bad Request"),
    }
}

/// Resolves once the peer has closed its side of the connection.
///
/// Pipelined bytes are left in the socket; while they are pending the
/// client is clearly still there, so the future simply never resolves.
async fn wait_for_close(stream: &TcpStream) {
    let mut probe = [0u8; 1];
    match stream.peek(&mut probe).await {
        Ok(0) | Err(_) => {}
        Ok(_) => std::future::pending::<()>().await,
    }
}
