//! The receiver's pinned-TLS transfer client (C6): handshake, manifest
//! confirmation, and the per-file download loop into the sink pipeline.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use reqwest::{Client, StatusCode};
use uuid::Uuid;

use crate::auth;
use crate::beacon::VerifiedDevice;
use crate::error::{Error, Result};
use crate::identity;
use crate::protocol::{
    CliAuth, DeviceInfo, DeviceType, DownloadQuery, FileDescriptor, PrepareUploadRequest,
    PrepareUploadResponse, PROTOCOL_VERSION,
};
use crate::sink;

/// Summary of a completed receive flow, printed by the orchestrator.
#[derive(Debug, Clone)]
pub struct TransferSummary {
    pub files_written: usize,
    pub bytes_written: u64,
    pub destination: PathBuf,
}

/// Drives the receiver side of a single transfer against one verified peer.
pub struct TransferClient {
    client_fingerprint: String,
    alias: String,
    canonical_phrase: String,
    output_dir: PathBuf,
    auto_accept: bool,
}

impl TransferClient {
    pub fn new(
        client_fingerprint: String,
        alias: String,
        canonical_phrase: String,
        output_dir: PathBuf,
        auto_accept: bool,
    ) -> Self {
        Self {
            client_fingerprint,
            alias,
            canonical_phrase,
            output_dir,
            auto_accept,
        }
    }

    /// Performs the pinned-TLS handshake, confirms the manifest, and
    /// downloads every advertised file into the sink.
    #[tracing::instrument(skip(self, peer))]
    pub async fn run(&self, peer: &VerifiedDevice) -> Result<TransferSummary> {
        let client = build_pinned_client(&peer.fingerprint)?;
        let base_url = format!(
            "{}://{}:{}/api/localsend/v2",
            peer.protocol,
            peer.addr.ip(),
            peer.port
        );

        let manifest = self.handshake(&client, &base_url, &peer.fingerprint).await?;

        if !self.auto_accept {
            confirm_manifest(&manifest).await?;
        }

        let mut rename_map: HashMap<String, String> = HashMap::new();
        let mut ordered: Vec<(Uuid, FileDescriptor)> = manifest.files.into_iter().collect();
        ordered.sort_by(|a, b| a.1.name.cmp(&b.1.name));

        let mut files_written = 0usize;
        let mut bytes_written = 0u64;

        for (file_id, descriptor) in ordered {
            let written = self
                .download_one(&client, &base_url, manifest.session_id, file_id, &descriptor, &mut rename_map)
                .await?;
            bytes_written += written;
            files_written += 1;
        }

        Ok(TransferSummary {
            files_written,
            bytes_written,
            destination: self.output_dir.clone(),
        })
    }

    async fn handshake(
        &self,
        client: &Client,
        base_url: &str,
        peer_fingerprint: &str,
    ) -> Result<PrepareUploadResponse> {
        let timestamp = unix_millis_now().to_string();
        let proof = auth::compute_proof(&self.canonical_phrase, &timestamp, peer_fingerprint);

        let request = PrepareUploadRequest {
            info: DeviceInfo {
                alias: self.alias.clone(),
                version: PROTOCOL_VERSION.to_string(),
                device_model: "headless".to_string(),
                device_type: DeviceType::Headless,
                fingerprint: self.client_fingerprint.clone(),
                port: None,
                protocol: None,
                download: false,
            },
            files: HashMap::new(),
            cli_auth: Some(CliAuth { timestamp, proof }),
        };

        let response = client
            .post(format!("{base_url}/prepare-upload"))
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Protocol(format!("prepare-upload request failed: {e}")))?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::UNAUTHORIZED => {
                return Err(Error::Auth(
                    "handshake rejected: authentication missing or expired".to_string(),
                ))
            }
            StatusCode::FORBIDDEN => {
                return Err(Error::Auth("handshake rejected: proof mismatch".to_string()))
            }
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(Error::Protocol("sender is rate-limiting requests".to_string()))
            }
            status => {
                return Err(Error::Protocol(format!(
                    "unexpected status from prepare-upload: {status}"
                )))
            }
        }

        response
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("malformed prepare-upload response: {e}")))
    }

    async fn download_one(
        &self,
        client: &Client,
        base_url: &str,
        session_id: Uuid,
        file_id: Uuid,
        descriptor: &FileDescriptor,
        rename_map: &mut HashMap<String, String>,
    ) -> Result<u64> {
        let query = DownloadQuery { session_id, file_id };
        let response = client
            .get(format!("{base_url}/download"))
            .query(&query)
            .send()
            .await
            .map_err(|e| Error::Transfer(format!("download request failed for '{}': {e}", descriptor.name)))?;

        if !response.status().is_success() {
            return Err(Error::Transfer(format!(
                "download failed for '{}': status {}",
                descriptor.name,
                response.status()
            )));
        }

        let target = sink::resolve_sink_path(&self.output_dir, &descriptor.name, rename_map).await?;
        let stream = response.bytes_stream();
        let written = sink::stream_to_sink(stream, &target, descriptor.size).await?;
        tracing::info!(file = %descriptor.name, bytes = written, "received file");
        Ok(written)
    }
}

fn unix_millis_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Builds an HTTP client whose TLS verifier accepts only the server
/// certificate whose fingerprint matches `expected_fingerprint`.
fn build_pinned_client(expected_fingerprint_hex: &str) -> Result<Client> {
    rustls::crypto::ring::default_provider().install_default().ok();

    let fingerprint = identity::fingerprint_from_hex(expected_fingerprint_hex)?;
    let tls_config = identity::client_config(fingerprint);

    Client::builder()
        .use_preconfigured_tls(tls_config)
        .build()
        .map_err(|e| Error::Tls(format!("failed to build pinned TLS client: {e}")))
}

async fn confirm_manifest(manifest: &PrepareUploadResponse) -> Result<()> {
    let count = manifest.files.len();
    let total_bytes: u64 = manifest.files.values().map(|d| d.size).sum();
    let answer = tokio::task::spawn_blocking(move || -> Result<String> {
        print!("receive {count} file(s), {total_bytes} bytes total? [Y/n] ");
        std::io::stdout().flush().ok();
        let mut line = String::new();
        std::io::stdin().read_line(&mut line)?;
        Ok(line.trim().to_lowercase())
    })
    .await
    .map_err(|e| Error::Transfer(format!("confirmation prompt task panicked: {e}")))??;

    if answer.is_empty() || answer == "y" || answer == "yes" {
        Ok(())
    } else {
        Err(Error::User("declined at confirmation prompt".to_string()))
    }
}
