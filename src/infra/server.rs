//! Listener loop: rustls handshakes with client certificate authorization,
//! HTTP/1.1 and HTTP/2 per connection, and graceful shutdown.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{Extension, Router, extract::ConnectInfo};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
    service::TowerToHyperService,
};
use rustls::ServerConfig;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
    task::JoinSet,
};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use super::error::InfraError;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolves once shutdown has been requested.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (sender, receiver) = watch::channel(false);
        (sender, Self { receiver })
    }

    pub async fn wait(mut self) {
        // A dropped sender also counts as shutdown.
        let _ = self.receiver.wait_for(|stop| *stop).await;
    }
}

/// Process termination signals, registered up front so a failure to install
/// them aborts startup instead of leaving an unstoppable server.
pub struct TerminationSignals {
    #[cfg(unix)]
    sigterm: tokio::signal::unix::Signal,
    #[cfg(unix)]
    sigint: tokio::signal::unix::Signal,
}

impl TerminationSignals {
    pub fn install() -> Result<Self, InfraError> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            Ok(Self {
                sigterm: signal(SignalKind::terminate())?,
                sigint: signal(SignalKind::interrupt())?,
            })
        }
        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    /// Wait for SIGINT or SIGTERM.
    pub async fn recv(mut self) {
        #[cfg(unix)]
        tokio::select! {
            _ = self.sigterm.recv() => info!(target = "folio::server", "SIGTERM received, beginning shutdown"),
            _ = self.sigint.recv() => info!(target = "folio::server", "SIGINT received, beginning shutdown"),
        }
        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!(target = "folio::server", "Ctrl-C received, beginning shutdown");
            }
        }
    }
}

pub struct Server {
    listener: TcpListener,
    router: Router,
    tls: Option<Arc<ServerConfig>>,
    graceful_timeout: Duration,
}

impl Server {
    pub async fn bind(
        addr: SocketAddr,
        router: Router,
        tls: Option<Arc<ServerConfig>>,
        graceful_timeout: Duration,
    ) -> Result<Self, InfraError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            router,
            tls,
            graceful_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, InfraError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, shutdown: ShutdownSignal) -> Result<(), InfraError> {
        let addr = self.local_addr()?;
        match self.tls {
            Some(tls) => {
                info!(target = "folio::server", %addr, tls = true, "Listening");
                serve_tls(
                    self.listener,
                    self.router,
                    TlsAcceptor::from(tls),
                    shutdown,
                    self.graceful_timeout,
                )
                .await
            }
            None => {
                info!(target = "folio::server", %addr, tls = false, "Listening");
                serve_plain(self.listener, self.router, shutdown, self.graceful_timeout).await
            }
        }
    }
}

async fn serve_plain(
    listener: TcpListener,
    router: Router,
    shutdown: ShutdownSignal,
    graceful_timeout: Duration,
) -> Result<(), InfraError> {
    let (drain_tx, drain_rx) = watch::channel(());
    let server = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown({
        let shutdown = shutdown.clone();
        async move {
            shutdown.wait().await;
            drop(drain_tx);
        }
    });

    let mut server = std::pin::pin!(server.into_future());
    tokio::select! {
        result = &mut server => return result.map_err(InfraError::from),
        _ = wait_closed(drain_rx) => {}
    }

    match tokio::time::timeout(graceful_timeout, server).await {
        Ok(result) => result.map_err(InfraError::from),
        Err(_) => {
            warn!(
                target = "folio::server",
                timeout_ms = graceful_timeout.as_millis() as u64,
                "Graceful shutdown timed out, dropping open connections"
            );
            Ok(())
        }
    }
}

async fn wait_closed(mut receiver: watch::Receiver<()>) {
    let _ = receiver.changed().await;
}

async fn serve_tls(
    listener: TcpListener,
    router: Router,
    acceptor: TlsAcceptor,
    shutdown: ShutdownSignal,
    graceful_timeout: Duration,
) -> Result<(), InfraError> {
    let mut connections = JoinSet::new();
    let stop = shutdown.clone().wait();
    tokio::pin!(stop);

    loop {
        let (stream, peer) = tokio::select! {
            _ = &mut stop => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(target = "folio::server", error = %err, "Failed to accept connection");
                    continue;
                }
            },
            // Reap finished connections as we go.
            Some(_) = connections.join_next(), if !connections.is_empty() => continue,
        };

        connections.spawn(handle_connection(
            stream,
            peer,
            acceptor.clone(),
            router.clone(),
            shutdown.clone(),
        ));
    }

    drop(listener);
    info!(
        target = "folio::server",
        open_connections = connections.len(),
        "Listener closed, draining connections"
    );

    let drained = tokio::time::timeout(graceful_timeout, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            target = "folio::server",
            timeout_ms = graceful_timeout.as_millis() as u64,
            remaining = connections.len(),
            "Graceful shutdown timed out, dropping open connections"
        );
        connections.shutdown().await;
    }
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    router: Router,
    shutdown: ShutdownSignal,
) {
    // Client certificate authorization runs inside the handshake.
    let tls_stream = match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            warn!(
                target = "folio::server::tls",
                peer = %peer,
                error = %err,
                "TLS handshake failed"
            );
            return;
        }
        Err(_) => {
            warn!(
                target = "folio::server::tls",
                peer = %peer,
                timeout_ms = HANDSHAKE_TIMEOUT.as_millis() as u64,
                "TLS handshake timed out"
            );
            return;
        }
    };
    debug!(target = "folio::server::tls", peer = %peer, "TLS handshake completed");

    let service = TowerToHyperService::new(router.layer(Extension(ConnectInfo(peer))));
    let builder = ConnectionBuilder::new(TokioExecutor::new());
    let connection = builder.serve_connection_with_upgrades(TokioIo::new(tls_stream), service);
    tokio::pin!(connection);

    let stop = shutdown.wait();
    tokio::pin!(stop);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = &mut stop => {
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };
    if let Err(err) = result {
        debug!(
            target = "folio::server",
            peer = %peer,
            error = %err,
            "Connection closed with error"
        );
    }
}
