// Copyright 2015-2024 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! HTTP interface for updating records
//!
//! * `GET /` reports that the server is running, or lists all records in debug mode
//! * `GET /update/{domain}/v4?user=&password=&ipv4=` sets the IPv4 address of `domain`
//! * `GET /update/{domain}/v6?user=&password=&ipv6=` sets the IPv6 address of `domain`
//! * `GET /update/{domain}?user=&password=&ipv4=&ipv6=` sets either or both

use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use hyper::{body::Incoming, service::Service, Request, Response};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::{conn::auto::Builder, graceful::GracefulShutdown},
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::{select, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

mod handler;

pub use self::handler::WebState;

/// A listener the web server accepts connections from
trait Accept: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn accept_stream(&self) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

impl Accept for TcpListener {
    type Stream = TcpStream;

    async fn accept_stream(&self) -> io::Result<TcpStream> {
        self.accept().await.map(|(stream, _)| stream)
    }
}

#[cfg(unix)]
impl Accept for tokio::net::UnixListener {
    type Stream = tokio::net::UnixStream;

    async fn accept_stream(&self) -> io::Result<tokio::net::UnixStream> {
        self.accept().await.map(|(stream, _)| stream)
    }
}

/// An HTTP server that accepts record updates
pub struct WebServer {
    service: WebService,
    join_handles: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl WebServer {
    /// Creates a server without listeners
    pub fn new(state: WebState) -> Self {
        Self {
            service: WebService {
                state: Arc::new(state),
            },
            join_handles: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Serves HTTP on a bound TCP listener
    pub fn register_listener(&mut self, listener: TcpListener) {
        debug!("register http: {:?}", listener);
        self.spawn(listener);
    }

    /// Serves HTTP on a bound Unix socket
    #[cfg(unix)]
    pub fn register_unix_listener(&mut self, listener: tokio::net::UnixListener) {
        debug!("register http socket: {:?}", listener);
        self.spawn(listener);
    }

    fn spawn<L: Accept>(&mut self, listener: L) {
        let service = self.service.clone();
        let cancellation_token = self.cancellation_token.clone();
        let shutdown = GracefulShutdown::new();

        self.join_handles.push(tokio::spawn(async move {
            let builder = Builder::new(TokioExecutor::new());
            loop {
                let stream = select! {
                    result = listener.accept_stream() => {
                        match result {
                            Ok(stream) => stream,
                            Err(error) => {
                                debug!(%error, "error accepting connection");
                                continue;
                            }
                        }
                    },
                    _ = cancellation_token.cancelled() => {
                        drop(listener);
                        break;
                    },
                };
                let io = TokioIo::new(stream);
                let conn = builder.serve_connection_with_upgrades(io, service.clone());
                let conn = shutdown.watch(conn.into_owned());
                tokio::spawn(async move {
                    if let Err(error) = conn.await {
                        debug!(%error, "connection error");
                    }
                });
            }
            shutdown.shutdown().await;
        }));
    }

    /// Stop accepting connections and wait for the open ones to finish
    pub async fn stop(self) {
        self.cancellation_token.cancel();
        for join_handle in self.join_handles {
            if let Err(error) = join_handle.await {
                error!(%error, "Error from HTTP server task");
            }
        }
        info!("http server stopped");
    }
}

/// Binds a Unix socket at `path` with the permissions `mode`, replacing a stale socket file
#[cfg(unix)]
pub fn bind_unix_socket(
    path: &std::path::Path,
    mode: u32,
) -> io::Result<tokio::net::UnixListener> {
    use std::os::unix::fs::PermissionsExt;

    match std::fs::remove_file(path) {
        Ok(()) => debug!("removed stale socket {path:?}"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => (),
        Err(e) => return Err(e),
    }

    let listener = tokio::net::UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    info!("listening for http on socket {path:?} with mode {mode:o}");
    Ok(listener)
}

#[derive(Clone)]
struct WebService {
    state: Arc<WebState>,
}

impl Service<Request<Incoming>> for WebService {
    type Response = Response<String>;

    type Error = Infallible;

    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let state = Arc::clone(&self.state);
        let method = req.method().clone();
        let uri = req.uri().clone();

        Box::pin(async move { Ok(handler::handle(&state, &method, &uri).await) })
    }
}
