//! Send and receive orchestration (C7): wires CodePhrase, Identity,
//! FileCatalog, Beacon, TransferServer, and TransferClient into the two
//! end-to-end flows the CLI binaries drive.

use std::net::{SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::beacon::{Broadcaster, Listener as BeaconListener, DEFAULT_PORT};
use crate::catalog::FileCatalog;
use crate::client::{TransferClient, TransferSummary};
use crate::codephrase;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::server::TransferServer;

const PORT_PROBE_RANGE: std::ops::Range<u16> = 53317..53417;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Shared settings both orchestrators accept, mirroring the per-binary
/// `Args` struct the CLI layer converts into these narrower configs.
#[derive(Debug, Clone)]
pub struct Config {
    pub timeout: Duration,
    pub verbose: u8,
    pub quiet: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            verbose: 0,
            quiet: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SendConfig {
    pub paths: Vec<PathBuf>,
    pub port: Option<u16>,
    pub common: Config,
}

#[derive(Debug, Clone)]
pub struct ReceiveConfig {
    pub code_phrase: String,
    pub output_dir: PathBuf,
    pub auto_accept: bool,
    pub common: Config,
}

/// Outcome of a successful send: the phrase shown to the operator and how
/// many files were delivered.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub code_phrase: String,
    pub files_sent: usize,
}

fn default_alias() -> String {
    format!(
        "sendcode@{}",
        hostname_or_fallback()
    )
}

fn hostname_or_fallback() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

/// Binds and immediately releases a TCP port in `[53317, 53417)`, returning
/// the first free one.
fn find_available_port() -> Result<u16> {
    for candidate in PORT_PROBE_RANGE {
        let addr = SocketAddr::from(([0, 0, 0, 0], candidate));
        if TcpListener::bind(addr).is_ok() {
            return Ok(candidate);
        }
    }
    Err(Error::Discovery(format!(
        "no available port in {:?}",
        PORT_PROBE_RANGE
    )))
}

/// Scans `paths`, generates a fresh identity and code phrase, serves the
/// files over a pinned-TLS HTTP server, and broadcasts an authenticated
/// beacon until a receiver connects and finishes downloading.
#[tracing::instrument(skip(config))]
pub async fn send(config: SendConfig) -> Result<SendOutcome> {
    rustls::crypto::ring::default_provider().install_default().ok();

    let catalog = FileCatalog::scan(&config.paths).await?;
    let identity = Identity::generate()?;
    let phrase = codephrase::generate();
    let port = match config.port {
        Some(p) => p,
        None => find_available_port()?,
    };

    let alias = default_alias();
    let mut server = TransferServer::start(
        &identity,
        alias.clone(),
        phrase.clone(),
        catalog,
        port,
    )
    .await?;

    let bound_port = server.port();
    let file_count = server.file_count();

    tracing::info!(phrase = %phrase, port = bound_port, files = file_count, "ready to send");
    if !config.common.quiet {
        println!("code phrase: {phrase}");
        println!("waiting for a receiver on port {bound_port}...");
    }

    let broadcaster = match Broadcaster::start(
        identity.fingerprint_hex(),
        &phrase,
        alias,
        bound_port,
        true,
    )
    .await
    {
        Ok(broadcaster) => broadcaster,
        Err(e) => {
            server.shutdown().await;
            return Err(e);
        }
    };

    let result = run_send_session(&mut server, config.common.timeout).await;

    broadcaster.stop().await;
    server.shutdown().await;

    result.map(|()| SendOutcome {
        code_phrase: phrase,
        files_sent: file_count,
    })
}

async fn run_send_session(server: &mut TransferServer, timeout: Duration) -> Result<()> {
    server.await_connected(timeout).await?;
    server.await_completion(timeout).await?;
    Ok(())
}

/// Validates the phrase, listens for a matching beacon, and runs the
/// pinned-TLS download flow against the first verified peer.
#[tracing::instrument(skip(config))]
pub async fn receive(config: ReceiveConfig) -> Result<TransferSummary> {
    rustls::crypto::ring::default_provider().install_default().ok();

    let canonical = codephrase::normalize(&config.code_phrase);
    if !codephrase::validate(&canonical) {
        return Err(Error::Config(format!(
            "'{}' is not a valid code phrase",
            config.code_phrase
        )));
    }

    let listener = BeaconListener::bind(&canonical).await?;

    if !config.common.quiet {
        println!("listening for a sender using phrase '{canonical}'...");
    }

    let discovery_result = tokio::time::timeout(config.common.timeout, listener.recv_verified())
        .await
        .map_err(|_| Error::Discovery("timed out waiting for a sender".to_string()))
        .and_then(|inner| inner);

    // Leave the multicast group and close the socket on every exit path,
    // including a discovery timeout or a verification error, not only the
    // happy path.
    if let Err(e) = listener.stop().await {
        tracing::warn!(error = %e, "failed to leave multicast group cleanly");
    }

    let peer = discovery_result?;

    tracing::info!(peer = %peer.addr, alias = %peer.alias, "discovered sender");

    let client_identity = Identity::generate()?;
    ensure_output_dir(&config.output_dir).await?;

    let client = TransferClient::new(
        client_identity.fingerprint_hex(),
        default_alias(),
        canonical,
        config.output_dir.clone(),
        config.auto_accept,
    );

    client.run(&peer).await
}

async fn ensure_output_dir(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    Ok(())
}
