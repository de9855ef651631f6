//! Authenticated multicast discovery (C4): broadcaster on the sender side,
//! listener + verifier on the receiver side.
//!
//! The socket-reuse idiom (bind with `SO_REUSEADDR` via `socket2`, then hand
//! the raw fd to `tokio::net::UdpSocket` for the actual multicast join and
//! async I/O) mirrors how the workspace already sets up sockets before
//! handing them to tokio elsewhere.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::auth;
use crate::codephrase;
use crate::error::{Error, Result};
use crate::protocol::{BeaconEnvelope, BeaconPayload, DeviceType, PROTOCOL_VERSION};

/// Multicast group all beacons are sent to.
pub const MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 167);
/// Default multicast port.
pub const DEFAULT_PORT: u16 = 53317;
const BROADCAST_INTERVAL: Duration = Duration::from_millis(500);
const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// A peer discovered and verified via the beacon protocol.
#[derive(Debug, Clone)]
pub struct VerifiedDevice {
    pub addr: SocketAddr,
    pub alias: String,
    pub fingerprint: String,
    pub port: u16,
    pub protocol: String,
}

/// Periodically broadcasts an authenticated beacon on the sender side.
pub struct Broadcaster {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Broadcaster {
    /// Binds an ephemeral broadcast-enabled socket and starts emitting one
    /// beacon every 500 ms until [`Broadcaster::stop`] is called.
    #[tracing::instrument(skip(fingerprint, canonical_phrase, alias))]
    pub async fn start(
        fingerprint: String,
        canonical_phrase: &str,
        alias: String,
        server_port: u16,
        use_https: bool,
    ) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.set_broadcast(true)?;
        let target = SocketAddr::V4(SocketAddrV4::new(MULTICAST_ADDR, DEFAULT_PORT));

        let key = canonical_phrase.to_string();
        let code_hash = codephrase::hash(canonical_phrase);
        let cli_session_id = Uuid::new_v4();
        let protocol = if use_https { "https" } else { "http" }.to_string();

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(BROADCAST_INTERVAL);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        break;
                    }
                    _ = interval.tick() => {
                        let payload = BeaconPayload {
                            alias: alias.clone(),
                            version: PROTOCOL_VERSION.to_string(),
                            device_model: "headless".to_string(),
                            device_type: DeviceType::Headless,
                            fingerprint: fingerprint.clone(),
                            port: server_port,
                            protocol: protocol.clone(),
                            download: false,
                            announce: true,
                            code_hash: code_hash.clone(),
                            cli_session_id,
                            cli_mode: true,
                        };
                        match encode_envelope(&payload, &key) {
                            Ok(bytes) => {
                                if let Err(e) = socket.send_to(&bytes, target).await {
                                    tracing::warn!(error = %e, "failed to send beacon datagram");
                                }
                            }
                            Err(e) => tracing::warn!(error = %e, "failed to encode beacon"),
                        }
                    }
                }
            }
        });

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            task,
        })
    }

    /// Cancels the broadcast timer and waits for the task to exit.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }
}

fn encode_envelope(payload: &BeaconPayload, key: &str) -> Result<Vec<u8>> {
    let data = serde_json::to_string(payload)?;
    let hmac = auth::hmac_hex(key, &data);
    let envelope = BeaconEnvelope { data, hmac };
    Ok(serde_json::to_vec(&envelope)?)
}

/// Listens for and verifies beacons on the receiver side.
pub struct Listener {
    socket: UdpSocket,
    canonical_phrase: String,
}

impl Listener {
    /// Binds the multicast port with address reuse and joins the group.
    /// Surfaces a [`Error::Discovery`] if the port is already bound by
    /// another process.
    pub async fn bind(canonical_phrase: &str) -> Result<Self> {
        let std_socket = bind_reuseaddr_socket()?;
        let socket = UdpSocket::from_std(std_socket)?;
        socket.join_multicast_v4(MULTICAST_ADDR, Ipv4Addr::UNSPECIFIED)?;
        Ok(Self {
            socket,
            canonical_phrase: canonical_phrase.to_string(),
        })
    }

    /// Waits for, decodes, and verifies the next beacon, retrying on any
    /// malformed or unauthenticated datagram until a verified device arrives.
    #[tracing::instrument(skip(self))]
    pub async fn recv_verified(&self) -> Result<VerifiedDevice> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, addr) = self.socket.recv_from(&mut buf).await?;
            match self.verify_datagram(&buf[..len], addr) {
                Some(device) => return Ok(device),
                None => continue,
            }
        }
    }

    fn verify_datagram(&self, data: &[u8], addr: SocketAddr) -> Option<VerifiedDevice> {
        let envelope: BeaconEnvelope = match serde_json::from_slice(data) {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!(error = %e, "discarding malformed beacon envelope");
                return None;
            }
        };

        if !auth::verify_hmac(&self.canonical_phrase, &envelope.data, &envelope.hmac) {
            tracing::warn!(peer = %addr, "beacon HMAC mismatch, possible spoofing");
            return None;
        }

        let payload: BeaconPayload = match serde_json::from_str(&envelope.data) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(error = %e, "discarding malformed beacon payload");
                return None;
            }
        };

        if !payload.cli_mode {
            return None;
        }
        if payload.code_hash != codephrase::hash(&self.canonical_phrase) {
            return None;
        }

        Some(VerifiedDevice {
            addr: SocketAddr::new(addr.ip(), payload.port),
            alias: payload.alias,
            fingerprint: payload.fingerprint,
            port: payload.port,
            protocol: payload.protocol,
        })
    }

    /// Leaves the multicast group and closes the socket.
    pub async fn stop(self) -> Result<()> {
        self.socket
            .leave_multicast_v4(MULTICAST_ADDR, Ipv4Addr::UNSPECIFIED)?;
        Ok(())
    }
}

fn bind_reuseaddr_socket() -> Result<std::net::UdpSocket> {
    use socket2::{Domain, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;

    let addr: SocketAddr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DEFAULT_PORT).into();
    socket.bind(&addr.into()).map_err(|e| {
        Error::Discovery(format!(
            "multicast port {DEFAULT_PORT} already in use (is another sendcode process running?): {e}"
        ))
    })?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload(phrase: &str) -> BeaconPayload {
        BeaconPayload {
            alias: "host".to_string(),
            version: PROTOCOL_VERSION.to_string(),
            device_model: "headless".to_string(),
            device_type: DeviceType::Headless,
            fingerprint: "ab".repeat(32),
            port: 53317,
            protocol: "https".to_string(),
            download: false,
            announce: true,
            code_hash: codephrase::hash(phrase),
            cli_session_id: Uuid::new_v4(),
            cli_mode: true,
        }
    }

    #[test]
    fn verify_datagram_accepts_correctly_signed_envelope() {
        let phrase = "swift-ocean";
        let payload = sample_payload(phrase);
        let bytes = encode_envelope(&payload, phrase).unwrap();

        let listener = Listener {
            socket: {
                // a bound-but-unused socket is fine, verify_datagram doesn't touch it
                let std_socket =
                    std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
                UdpSocket::from_std(std_socket).unwrap()
            },
            canonical_phrase: phrase.to_string(),
        };

        let addr: SocketAddr = "127.0.0.1:12345".parse().unwrap();
        let device = listener.verify_datagram(&bytes, addr).unwrap();
        assert_eq!(device.alias, "host");
        assert_eq!(device.port, 53317);
    }

    #[test]
    fn verify_datagram_rejects_wrong_phrase() {
        let payload = sample_payload("swift-ocean");
        let bytes = encode_envelope(&payload, "swift-ocean").unwrap();

        let listener = Listener {
            socket: {
                let std_socket =
                    std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
                UdpSocket::from_std(std_socket).unwrap()
            },
            canonical_phrase: "other-phrase".to_string(),
        };

        let addr: SocketAddr = "127.0.0.1:12345".parse().unwrap();
        assert!(listener.verify_datagram(&bytes, addr).is_none());
    }

    #[test]
    fn verify_datagram_rejects_tampered_hmac() {
        let phrase = "swift-ocean";
        let payload = sample_payload(phrase);
        let bytes = encode_envelope(&payload, phrase).unwrap();
        let mut envelope: BeaconEnvelope = serde_json::from_slice(&bytes).unwrap();
        envelope.hmac = "0".repeat(64);
        let tampered = serde_json::to_vec(&envelope).unwrap();

        let listener = Listener {
            socket: {
                let std_socket =
                    std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
                UdpSocket::from_std(std_socket).unwrap()
            },
            canonical_phrase: phrase.to_string(),
        };

        let addr: SocketAddr = "127.0.0.1:12345".parse().unwrap();
        assert!(listener.verify_datagram(&tampered, addr).is_none());
    }

    #[test]
    fn verify_datagram_rejects_malformed_json() {
        let listener = Listener {
            socket: {
                let std_socket =
                    std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
                UdpSocket::from_std(std_socket).unwrap()
            },
            canonical_phrase: "swift-ocean".to_string(),
        };
        let addr: SocketAddr = "127.0.0.1:12345".parse().unwrap();
        assert!(listener.verify_datagram(b"not json", addr).is_none());
    }
}
