use crate::config::TlsMode;
use crate::jobs::JobRegistry;
use crate::rate_limit::RateLimiter;
use axum::Router;
use axum::extract::ConnectInfo;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::server::graceful::GracefulShutdown;
use rustls::pki_types::CertificateDer;
use std::fs::File;
use std::future::IntoFuture;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, info, warn};

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error("failed to read {}: {source}", .path.display())]
    TlsFile { path: PathBuf, source: io::Error },
    #[error("no certificate found in {}", .0.display())]
    NoCertificate(PathBuf),
    #[error("no private key found in {}", .0.display())]
    NoPrivateKey(PathBuf),
    #[error("invalid TLS configuration: {0}")]
    Tls(#[from] rustls::Error),
    #[error("server error: {0}")]
    Io(#[from] io::Error),
}

impl ServeError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bind { .. } => "bind_failed",
            Self::TlsFile { .. } => "tls_file_unreadable",
            Self::NoCertificate(_) => "tls_no_certificate",
            Self::NoPrivateKey(_) => "tls_no_private_key",
            Self::Tls(_) => "tls_invalid",
            Self::Io(_) => "io",
        }
    }
}

pub async fn bind(addr: SocketAddr) -> Result<TcpListener, ServeError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServeError::Bind { addr, source })
}

/// Serve `router` until `shutdown` fires, then drain open connections for
/// at most `drain_timeout`.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    tls: &TlsMode,
    shutdown: CancellationToken,
    drain_timeout: Duration,
) -> Result<(), ServeError> {
    match tls {
        TlsMode::Disabled => serve_plain(listener, router, shutdown, drain_timeout).await,
        TlsMode::Auto { domain } => {
            warn!(
                domain = %domain,
                "automatic TLS is not implemented; serving plain HTTP"
            );
            serve_plain(listener, router, shutdown, drain_timeout).await
        }
        TlsMode::Manual {
            cert_path,
            key_path,
        } => {
            let config = load_tls_config(cert_path, key_path)?;
            let config = Arc::new(config);
            serve_tls(
                listener,
                router,
                config,
                shutdown,
                drain_timeout,
                TLS_HANDSHAKE_TIMEOUT,
            )
            .await
        }
    }
}

async fn serve_plain(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
    drain_timeout: Duration,
) -> Result<(), ServeError> {
    info!(addr = ?listener.local_addr().ok(), "listening (http)");
    let signal = shutdown.clone();
    let server = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { signal.cancelled().await })
    .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => result?,
        _ = drain_deadline(&shutdown, drain_timeout) => {
            warn!(timeout_secs = drain_timeout.as_secs(), "connection drain timed out");
        }
    }
    Ok(())
}

async fn drain_deadline(shutdown: &CancellationToken, drain_timeout: Duration) {
    shutdown.cancelled().await;
    tokio::time::sleep(drain_timeout).await;
}

async fn serve_tls(
    listener: TcpListener,
    router: Router,
    config: Arc<rustls::ServerConfig>,
    shutdown: CancellationToken,
    drain_timeout: Duration,
    handshake_timeout: Duration,
) -> Result<(), ServeError> {
    info!(addr = ?listener.local_addr().ok(), "listening (https)");
    let acceptor = TlsAcceptor::from(config);
    let graceful = GracefulShutdown::new();
    let builder = auto::Builder::new(TokioExecutor::new());

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    // Errors like EMFILE repeat until a descriptor frees up.
                    warn!(err = %err, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let router = router.clone();
        let builder = builder.clone();
        let watcher = graceful.watcher();
        tokio::spawn(async move {
            let handshake = tokio::time::timeout(handshake_timeout, acceptor.accept(stream));
            let stream = match handshake.await {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => {
                    debug!(peer = %peer, err = %err, "TLS handshake failed");
                    return;
                }
                Err(_) => {
                    debug!(peer = %peer, "TLS handshake timed out");
                    return;
                }
            };
            let service = hyper::service::service_fn(move |mut request: hyper::Request<Incoming>| {
                request.extensions_mut().insert(ConnectInfo(peer));
                router.clone().oneshot(request)
            });
            let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
            if let Err(err) = watcher.watch(conn).await {
                debug!(peer = %peer, err = %err, "connection closed with error");
            }
        });
    }

    drop(listener);
    tokio::select! {
        _ = graceful.shutdown() => info!("TLS connections drained"),
        _ = tokio::time::sleep(drain_timeout) => {
            warn!(timeout_secs = drain_timeout.as_secs(), "connection drain timed out");
        }
    }
    Ok(())
}

/// rustls server config from a PEM certificate chain and private key.
pub fn load_tls_config(
    cert_path: &Path,
    key_path: &Path,
) -> Result<rustls::ServerConfig, ServeError> {
    let mut cert_reader = open_pem(cert_path)?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<_, _>>()
        .map_err(|source| ServeError::TlsFile {
            path: cert_path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(ServeError::NoCertificate(cert_path.to_path_buf()));
    }

    let mut key_reader = open_pem(key_path)?;
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|source| ServeError::TlsFile {
            path: key_path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| ServeError::NoPrivateKey(key_path.to_path_buf()))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

fn open_pem(path: &Path) -> Result<BufReader<File>, ServeError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| ServeError::TlsFile {
            path: path.to_path_buf(),
            source,
        })
}

/// Background eviction for the job registry and the rate limiter.
pub fn spawn_sweepers(
    jobs: Arc<JobRegistry>,
    job_interval: Duration,
    limiter: Arc<RateLimiter>,
    limiter_interval: Duration,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    vec![
        spawn_periodic("jobs", job_interval, shutdown.clone(), move || {
            let removed = jobs.sweep(crate::current_unix_secs());
            (removed, jobs.len())
        }),
        spawn_periodic("rate_limit", limiter_interval, shutdown, move || {
            let removed = limiter.sweep(Instant::now());
            (removed, limiter.tracked_clients())
        }),
    ]
}

fn spawn_periodic<F>(
    name: &'static str,
    period: Duration,
    shutdown: CancellationToken,
    mut sweep: F,
) -> JoinHandle<()>
where
    F: FnMut() -> (usize, usize) + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let (removed, remaining) = sweep();
                    if removed > 0 {
                        debug!(sweeper = name, removed, remaining, "sweep complete");
                    }
                }
            }
        }
        debug!(sweeper = name, "sweeper stopped");
    })
}
