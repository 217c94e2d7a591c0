// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [`Server`]-related things

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, Stream, StreamExt};
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::{service_fn, HttpService};
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{error, info, info_span, warn, Instrument};

use crate::response::GenericResponse;

/// Serves HTTP/1 connections (including ones that upgrade to other protocols) while allowing
/// for graceful shutdowns.
pub struct Server {
    concurrent_connections: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

impl Server {
    /// Create a new [`Server`].
    ///
    /// `max_connections` is the maximum number of simultaneous HTTP connections that may be
    /// handled across all [`serve`](Self::serve) calls before new ones get a minimal 503.
    /// Connections that have been upgraded are handed off and no longer count.
    pub fn new(max_connections: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            concurrent_connections: Arc::new(Semaphore::new(max_connections)),
            shutdown,
        }
    }

    /// Receiver that flips to `true` once [`graceful_shutdown`](Self::graceful_shutdown) has
    /// been called.
    ///
    /// [`graceful_shutdown`](Self::graceful_shutdown) doesn't resolve while any of these are
    /// alive, so long-lived tasks spawned by a responder (e.g. upgraded connections) can hold
    /// one to be waited for.
    pub fn shutdown_watch(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Serve incoming `connections` with `responder`.
    ///
    /// Each connection is handled in its own task. This resolves once
    /// [`graceful_shutdown`](Self::graceful_shutdown) has been called (or `connections` is
    /// exhausted) and every connection it accepted has finished.
    ///
    /// # Cancel Safety
    ///
    /// Canceling aborts every connection accepted by this call.
    pub async fn serve<P, C, R, F>(&self, connections: P, responder: R)
    where
        P: Stream<Item = std::io::Result<(C, SocketAddr)>>,
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
        R: Fn(Request<Incoming>, SocketAddr) -> F + Clone + Send + Sync + 'static,
        F: Future<Output = GenericResponse> + Send + 'static,
    {
        let respond = move |request: Request<Incoming>, peer_addr| {
            let respond = responder.clone();
            async move {
                let method = request.method().clone();
                let path = request.uri().path().to_owned();
                let response = respond(request, peer_addr).await;
                info!("{method} {path} -> {}", response.status());
                response
            }
        };

        // This receiver keeps graceful_shutdown from returning, so it must outlive everything
        // else here.
        let mut shutdown_receiver = self.shutdown.subscribe();
        let mut was_shutdown = pin!(shutdown_receiver.wait_for(|&done| done));

        let mut tasks = JoinSet::new();
        info!("Started serving");

        // scope is only to force `connections` to be dropped before waiting on tasks
        {
            let mut connections = pin!(connections);
            loop {
                let accepted = select! {
                    // never accept anything once shut down
                    biased;
                    _ = &mut was_shutdown => break,
                    accepted = connections.next() => match accepted {
                        Some(accepted) => accepted,
                        None => break,
                    },
                };
                while tasks.try_join_next().is_some() {}

                let (connection, peer_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        error!("Couldn't accept connection: {err}");
                        continue;
                    }
                };
                let span = info_span!("connection", addr = %peer_addr);

                let Ok(permit) = self.concurrent_connections.clone().try_acquire_owned() else {
                    span.in_scope(|| warn!("Too overloaded; sending minimal 503."));
                    tasks.spawn(respond_with_temporarily_unavailable(connection).instrument(span));
                    continue;
                };

                let respond = respond.clone();
                let service =
                    service_fn(move |request| respond(request, peer_addr).map(Ok::<_, Infallible>));
                let mut wants_shutdown = self.shutdown.subscribe();
                let connection_task = async move {
                    let _permit = permit;
                    info!("Connected.");
                    let http_connection = http1::Builder::new()
                        .half_close(true)
                        .serve_connection(TokioIo::new(connection), service)
                        .with_upgrades();
                    let result = with_graceful_shutdown(
                        http_connection,
                        wants_shutdown.wait_for(|&done| done),
                    )
                    .await;
                    if let Err(err) = result {
                        warn!("Error serving: {err}");
                    }
                    info!("Disconnected.");
                };
                tasks.spawn(connection_task.instrument(span));
            }
        }

        while let Some(finished) = tasks.join_next().await {
            if let Err(err) = finished {
                if err.is_panic() {
                    error!("Connection task panicked: {err}");
                }
            }
        }
        info!("Stopped serving");
    }

    /// Gracefully shuts down server.
    ///
    /// Calls to [`serve`](Self::serve) stop accepting connections, let their ongoing requests
    /// finish, and resolve. This resolves once every [`serve`](Self::serve) call has resolved
    /// and every [`shutdown_watch`](Self::shutdown_watch) receiver has been dropped.
    ///
    /// # Cancel Safety
    ///
    /// After this has been polled, canceling does not stop the shutdown.
    pub async fn graceful_shutdown(&self) {
        self.shutdown.send_replace(true);
        self.shutdown.closed().await;
    }
}

/// Accepts connections from `listener` forever.
///
/// Accept errors (e.g. running out of file descriptors) are yielded after a short pause.
pub fn tcp_connections(
    listener: TcpListener,
) -> impl Stream<Item = std::io::Result<(TcpStream, SocketAddr)>> {
    futures::stream::unfold(listener, |listener| async move {
        let accepted = listener.accept().await;
        if accepted.is_err() {
            sleep(Duration::from_millis(100)).await;
        }
        Some((accepted, listener))
    })
}

/// Cheaply responds to an HTTP 1 connection with a minimal 503.
///
/// The request isn't even parsed, so an overloaded server spends as little as possible on it.
async fn respond_with_temporarily_unavailable(mut connection: impl AsyncWrite + Unpin) {
    let write_response = async {
        let msg = b"HTTP/1.1 503 Service Unavailable\r\n\
                    Content-Type: text/plain;charset=utf-8\r\n\
                    Content-Length: 22\r\n\
                    \r\n\
                    Too many connections!\n";
        connection.write_all(msg).await?;
        connection.shutdown().await
    };
    let result = select! {
        result = write_response => result,
        _ = sleep(Duration::from_secs(1)) => Err(std::io::ErrorKind::TimedOut.into()),
    };
    if let Err(err) = result {
        warn!("Couldn't send 503: {err}");
    }
}

/// Gracefully terminate `connection` if `want_shutdown` resolves.
async fn with_graceful_shutdown<I, S, B>(
    connection: http1::UpgradeableConnection<I, S>,
    want_shutdown: impl Future,
) -> Result<(), hyper::Error>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
    S: HttpService<Incoming, ResBody = B>,
    S::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    B: Body + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    // Polling and shutting down both need exclusive access, hence poll_fn.
    let mut connection = pin!(connection);
    let mut want_shutdown = pin!(want_shutdown.fuse());
    std::future::poll_fn(|cx| {
        if want_shutdown.as_mut().poll(cx).is_ready() {
            connection.as_mut().graceful_shutdown();
        }
        connection.as_mut().poll(cx)
    })
    .await
}
