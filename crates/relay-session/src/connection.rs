//! Per-connection task: framing, dispatch and cleanup for one agent socket.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::StreamExt;
use relay_core::{EventStore, SessionId};
use relay_transport::{FrameError, LineCodec, TransportFault};
use tokio::net::TcpStream;
use tokio_util::{codec::FramedRead, sync::CancellationToken};

use crate::{dispatch::Dispatcher, registry::Registry, session::Session};

/// Shared handles a connection task needs.
#[derive(Clone)]
pub(crate) struct ConnectionContext {
    pub registry: Arc<Registry>,
    pub events: Arc<EventStore>,
    pub shutdown: CancellationToken,
    pub error_grace: Duration,
}

/// Serve one accepted socket until it closes.
pub(crate) async fn serve(stream: TcpStream, remote_addr: SocketAddr, seq: u64, ctx: ConnectionContext) {
    let id = SessionId::from_endpoint(remote_addr, seq);
    tracing::info!(session_id = %id, %remote_addr, "Agent connected");

    let (read_half, write_half) = stream.into_split();
    let (session, outbox) = Session::new(id.clone(), remote_addr, ctx.shutdown.child_token());

    tokio::spawn(outbox.forward(write_half, id));

    let dispatcher = Dispatcher::new(Arc::clone(&session), ctx.registry, ctx.events);
    let mut frames = FramedRead::new(read_half, LineCodec::new());

    loop {
        tokio::select! {
            () = session.closed() => break,
            frame = frames.next() => match frame {
                Some(Ok(line)) => dispatcher.handle_frame(&line),
                Some(Err(FrameError::Io(e))) => {
                    match TransportFault::classify(&e) {
                        TransportFault::Benign => {
                            tracing::debug!(session_id = %session.id(), "Agent connection dropped: {e}");
                            tokio::select! {
                                () = session.closed() => {}
                                () = tokio::time::sleep(ctx.error_grace) => {}
                            }
                        }
                        TransportFault::Unexpected => dispatcher.report_error(e.to_string()),
                    }
                    break;
                }
                Some(Err(e)) => {
                    dispatcher.report_error(e.to_string());
                    break;
                }
                None => {
                    tracing::debug!(session_id = %session.id(), "Agent closed connection");
                    break;
                }
            },
        }
    }

    dispatcher.finish();
}
