//! TCP server for inbound peer requests.
//!
//! Each accepted connection gets a reader task and two dispatchers, one for
//! membership traffic and one for data traffic. Each dispatcher handles its
//! requests strictly in arrival order, which gives FIFO delivery per sender.
//! The queues in front of the dispatchers are bounded; a request that finds
//! its queue full is answered with [`Message::Overloaded`] straight from the
//! reader.

use crate::config::TransportConfig;
use crate::error::{NetworkError, Result};
use crate::network::rpc::{read_frame, write_frame, Frame, Message};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Handler for inbound requests.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Handle one request, writing zero or more replies through `responder`.
    async fn handle(&self, message: Message, responder: &mut Responder) -> Result<()>;
}

/// Writes replies for a single request.
pub struct Responder {
    correlation_id: u64,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    max_frame_size: usize,
    replies: usize,
}

impl Responder {
    fn new(correlation_id: u64, writer: Arc<Mutex<OwnedWriteHalf>>, max_frame_size: usize) -> Self {
        Self {
            correlation_id,
            writer,
            max_frame_size,
            replies: 0,
        }
    }

    /// Send a reply carrying the request's correlation id.
    pub async fn reply(&mut self, message: Message) -> Result<()> {
        let frame = Frame::new(self.correlation_id, message);
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &frame, self.max_frame_size).await?;
        self.replies += 1;
        Ok(())
    }

    /// Number of replies sent so far.
    pub fn replies(&self) -> usize {
        self.replies
    }
}

/// TCP server for peer communication.
pub struct NetworkServer {
    /// Bound listener.
    listener: TcpListener,

    /// Request handler.
    handler: Arc<dyn RequestHandler>,

    /// Transport settings.
    config: TransportConfig,

    /// Stops the accept loop and every connection.
    shutdown: CancellationToken,
}

impl NetworkServer {
    /// Create a server over an already bound listener.
    pub fn new(
        listener: TcpListener,
        handler: Arc<dyn RequestHandler>,
        config: TransportConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            listener,
            handler,
            config,
            shutdown,
        }
    }

    /// Address the server accepts connections on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr().map_err(NetworkError::Io)?)
    }

    /// Run the accept loop until shutdown.
    pub async fn run(self) -> Result<()> {
        let addr = self.local_addr()?;
        info!(%addr, "Network server listening");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "Accepted connection");
                            let _ = stream.set_nodelay(true);
                            let handler = self.handler.clone();
                            let config = self.config.clone();
                            let token = self.shutdown.child_token();
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, handler, config, token).await {
                                    debug!(peer = %peer_addr, error = %e, "Connection handler error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = self.shutdown.cancelled() => {
                    info!(%addr, "Network server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(
        stream: TcpStream,
        handler: Arc<dyn RequestHandler>,
        config: TransportConfig,
        token: CancellationToken,
    ) -> Result<()> {
        let (mut reader, writer) = stream.into_split();
        let writer = Arc::new(Mutex::new(writer));

        let (control_tx, control_rx) = mpsc::channel(config.inbound_queue_depth);
        let (data_tx, data_rx) = mpsc::channel(config.inbound_queue_depth);
        for rx in [control_rx, data_rx] {
            tokio::spawn(Self::dispatch(
                rx,
                handler.clone(),
                writer.clone(),
                config.max_frame_size,
                token.clone(),
            ));
        }

        let result = loop {
            let frame = tokio::select! {
                _ = token.cancelled() => break Ok(()),
                frame = read_frame(&mut reader, config.max_frame_size) => frame,
            };
            let frame = match frame {
                Ok(Some(frame)) => frame,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };
            trace!(kind = %frame.kind, correlation_id = frame.correlation_id, "Inbound request");

            let queue = if frame.kind.is_control() {
                &control_tx
            } else {
                &data_tx
            };
            match queue.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(frame)) => {
                    warn!(kind = %frame.kind, "Inbound queue full, rejecting request");
                    let reply = Frame::new(frame.correlation_id, Message::Overloaded);
                    let mut writer = writer.lock().await;
                    if let Err(e) = write_frame(&mut *writer, &reply, config.max_frame_size).await {
                        break Err(e);
                    }
                }
                Err(TrySendError::Closed(_)) => break Ok(()),
            }
        };

        token.cancel();
        result
    }

    async fn dispatch(
        mut rx: mpsc::Receiver<Frame>,
        handler: Arc<dyn RequestHandler>,
        writer: Arc<Mutex<OwnedWriteHalf>>,
        max_frame_size: usize,
        token: CancellationToken,
    ) {
        loop {
            let frame = tokio::select! {
                _ = token.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            let kind = frame.kind;
            let mut responder = Responder::new(frame.correlation_id, writer.clone(), max_frame_size);

            let handled = tokio::select! {
                _ = token.cancelled() => break,
                handled = handler.handle(frame.message, &mut responder) => handled,
            };
            if let Err(e) = handled {
                debug!(%kind, error = %e, "Request failed");
                if responder.replies() == 0 {
                    let reason = e.to_string();
                    if responder.reply(Message::Error { reason }).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}
