//! Bootstrap discovery: one UDP request, first reply wins, bounded wait.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use orch_core::wire::MAX_DATAGRAM_LEN;
use orch_core::{
    decode_envelope, encode_message, AdvertOutcome, BootstrapRequest, Coordinator, Envelope,
};
use serde::Serialize;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// Discovery target alias for the all-ones broadcast address.
const BROADCAST_ALIAS: &str = "broadcast";

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("no network connectivity")]
    NoNetwork,
    #[error("cannot resolve {0}: {1}")]
    Resolve(String, #[source] io::Error),
    #[error("{0} resolved to no address")]
    NoAddress(String),
    #[error("socket setup failed: {0}")]
    Socket(#[source] io::Error),
    #[error("send failed: {0}")]
    Send(#[source] io::Error),
    #[error("receive failed: {0}")]
    Receive(#[source] io::Error),
    #[error("no reply within {0:?}")]
    NotFound(Duration),
    #[error("request could not be encoded: {0}")]
    Encode(#[from] orch_core::WireError),
}

/// The first datagram that arrived.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryReply {
    pub from: SocketAddr,
    pub body: ReplyBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyBody {
    Envelope(Envelope),
    /// The reply was not an envelope; kept for diagnostics.
    Undecodable { payload: String, size: usize },
}

impl ReplyBody {
    /// Diagnostic object `{"Payload", "Size", "From"}` for a reply that did not decode.
    pub fn diagnostic(&self, from: SocketAddr) -> Option<serde_json::Value> {
        match self {
            ReplyBody::Undecodable { payload, size } => Some(serde_json::json!({
                "Payload": payload,
                "Size": size,
                "From": from.to_string(),
            })),
            ReplyBody::Envelope(_) => None,
        }
    }
}

async fn resolve(target: &str, port: u16) -> Result<(SocketAddr, bool), DiscoveryError> {
    let target = target.trim();
    if target.eq_ignore_ascii_case(BROADCAST_ALIAS) {
        return Ok((SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port), true));
    }
    if let Ok(ip) = target.parse::<IpAddr>() {
        let broadcast = matches!(ip, IpAddr::V4(v4) if v4.is_broadcast());
        return Ok((SocketAddr::new(ip, port), broadcast));
    }
    let mut addrs = tokio::net::lookup_host((target, port))
        .await
        .map_err(|e| DiscoveryError::Resolve(target.to_string(), e))?;
    addrs
        .next()
        .map(|a| (a, false))
        .ok_or_else(|| DiscoveryError::NoAddress(target.to_string()))
}

/// Send a request to `target:port` from an ephemeral socket and return the first reply.
///
/// `make_request` receives the ephemeral local port so the request can name it as `Reply Port`.
/// The socket is closed on return; later datagrams are dropped with it.
pub async fn send_and_await<R: Serialize>(
    target: &str,
    port: u16,
    make_request: impl FnOnce(u16) -> R,
    wait: Duration,
) -> Result<DiscoveryReply, DiscoveryError> {
    let (dest, broadcast) = resolve(target, port).await?;
    if broadcast && local_ip_address::local_ip().is_err() {
        return Err(DiscoveryError::NoNetwork);
    }

    let bind: SocketAddr = match dest {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind).await.map_err(DiscoveryError::Socket)?;
    if broadcast {
        socket.set_broadcast(true).map_err(DiscoveryError::Socket)?;
    }
    let local_port = socket.local_addr().map_err(DiscoveryError::Socket)?.port();

    let bytes = encode_message(&make_request(local_port))?;
    socket.send_to(&bytes, dest).await.map_err(DiscoveryError::Send)?;
    debug!(%dest, local_port, "discovery request sent");

    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    let (n, from) = match tokio::time::timeout(wait, socket.recv_from(&mut buf)).await {
        Ok(Ok(r)) => r,
        Ok(Err(e)) => return Err(DiscoveryError::Receive(e)),
        Err(_) => return Err(DiscoveryError::NotFound(wait)),
    };
    let raw = &buf[..n];
    let body = match decode_envelope(raw) {
        Ok(env) => ReplyBody::Envelope(env),
        Err(_) => ReplyBody::Undecodable {
            payload: String::from_utf8_lossy(raw).into_owned(),
            size: n,
        },
    };
    Ok(DiscoveryReply { from, body })
}

/// Broadcast a Discover and fold any controller advert into the record.
/// Returns true when the record changed and must be saved.
pub async fn bootstrap(
    coordinator: &mut Coordinator,
    target: &str,
    port: u16,
    wait: Duration,
) -> bool {
    let reply = match send_and_await(target, port, BootstrapRequest::new, wait).await {
        Ok(r) => r,
        Err(e) => {
            warn!(discovery_target = target, port, "bootstrap discovery: {}", e);
            return false;
        }
    };
    let envelope = match &reply.body {
        ReplyBody::Envelope(env) => env,
        ReplyBody::Undecodable { .. } => {
            warn!(
                reply = %reply.body.diagnostic(reply.from).unwrap_or_default(),
                "bootstrap reply is not an envelope"
            );
            return false;
        }
    };
    let Some(advert) = &envelope.orchestrator else {
        warn!(from = %reply.from, "bootstrap reply carries no controller advert");
        return false;
    };
    let outcome = coordinator.on_discovery_reply(advert, reply.from.ip());
    match &outcome {
        AdvertOutcome::Adopted | AdvertOutcome::AddressUpdated => info!(
            from = %reply.from,
            server_id = %advert.server_id,
            ?outcome,
            "controller endpoint recorded"
        ),
        AdvertOutcome::Unchanged => debug!(from = %reply.from, "controller endpoint unchanged"),
        AdvertOutcome::ForeignIgnored => warn!(
            from = %reply.from,
            "bootstrap reply from a controller that does not own this device ignored"
        ),
        AdvertOutcome::Invalid => warn!(from = %reply.from, "bootstrap reply advert is invalid"),
    }
    outcome.changed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use orch_core::{encode_envelope, AssignmentRecord, ControllerAdvert, DeviceIdentity, ServerId};
    use std::time::Instant;

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            product_name: "orch-agent".into(),
            hardware_model: "test".into(),
            version: "0.1.0".into(),
            hostname: "dev-1".into(),
            mac_address: "AA:BB:CC:DD:EE:FF".into(),
            ip_address: "127.0.0.1".into(),
        }
    }

    /// Controller stand-in: answers the first datagram with `reply` at the request's `Reply Port`.
    async fn fake_controller(reply: Vec<u8>) -> (u16, tokio::task::JoinHandle<serde_json::Value>) {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = sock.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let (n, from) = sock.recv_from(&mut buf).await.unwrap();
            let req: serde_json::Value = serde_json::from_slice(&buf[..n]).unwrap();
            let reply_port = req["Reply Port"].as_u64().unwrap() as u16;
            let reply_to = SocketAddr::new(from.ip(), reply_port);
            sock.send_to(&reply, reply_to).await.unwrap();
            // A second datagram must not be seen by the caller.
            let _ = sock.send_to(b"late", reply_to).await;
            req
        });
        (port, handle)
    }

    fn advert_reply(server_id: &str, port: u16) -> Vec<u8> {
        let env = Envelope {
            orchestrator: Some(ControllerAdvert {
                server_id: server_id.into(),
                ip_address: None,
                port: Some(port),
            }),
            ..Envelope::default()
        };
        encode_envelope(&env).unwrap()
    }

    #[tokio::test]
    async fn silent_target_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();
        let start = Instant::now();
        let r = send_and_await(
            "127.0.0.1",
            port,
            BootstrapRequest::new,
            Duration::from_millis(1000),
        )
        .await;
        let elapsed = start.elapsed();
        assert!(matches!(r, Err(DiscoveryError::NotFound(_))));
        assert!(elapsed >= Duration::from_millis(950), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(3000), "{:?}", elapsed);
    }

    #[tokio::test]
    async fn first_reply_is_returned() {
        let (port, controller) = fake_controller(advert_reply("ABCDEFGHJKLMNPQ", 31000)).await;
        let reply = send_and_await(
            "127.0.0.1",
            port,
            BootstrapRequest::new,
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        let req = controller.await.unwrap();
        assert_eq!(req["Orchestrator"], "Discover");
        assert!(req.get("Command").is_none());
        match reply.body {
            ReplyBody::Envelope(env) => {
                assert_eq!(env.orchestrator.unwrap().server_id, "ABCDEFGHJKLMNPQ")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn undecodable_reply_becomes_diagnostic() {
        let (port, _controller) = fake_controller(b"not json".to_vec()).await;
        let reply = send_and_await(
            "127.0.0.1",
            port,
            BootstrapRequest::new,
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        assert_eq!(
            reply.body,
            ReplyBody::Undecodable {
                payload: "not json".into(),
                size: 8
            }
        );
        let diag = reply.body.diagnostic(reply.from).unwrap();
        assert_eq!(diag["Size"], 8);
        assert_eq!(diag["From"], reply.from.to_string());
    }

    #[tokio::test]
    async fn bootstrap_adopts_endpoint_on_unassigned_device() {
        let (port, _controller) = fake_controller(advert_reply("ABCDEFGHJKLMNPQ", 31000)).await;
        let mut c = Coordinator::new(AssignmentRecord::default(), identity());
        assert!(bootstrap(&mut c, "127.0.0.1", port, Duration::from_secs(2)).await);
        assert!(!c.record().assigned);
        assert_eq!(c.record().controller_addr, Some("127.0.0.1".parse().unwrap()));
        assert_eq!(c.record().controller_port, 31000);
    }

    #[tokio::test]
    async fn bootstrap_ignores_foreign_controller() {
        let (port, _controller) = fake_controller(advert_reply("QPNMLKJHGFEDCBA", 31000)).await;
        let mut record = AssignmentRecord::default();
        record.assign(ServerId::parse("ABCDEFGHJKLMNPQ").unwrap());
        let mut c = Coordinator::new(record.clone(), identity());
        assert!(!bootstrap(&mut c, "127.0.0.1", port, Duration::from_secs(2)).await);
        assert_eq!(c.record(), &record);
    }

    #[tokio::test]
    async fn bootstrap_without_reply_keeps_record() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();
        let mut c = Coordinator::new(AssignmentRecord::default(), identity());
        assert!(!bootstrap(&mut c, "127.0.0.1", port, Duration::from_millis(200)).await);
        assert_eq!(c.record(), &AssignmentRecord::default());
    }

    #[tokio::test]
    async fn unresolvable_name_fails() {
        let r = send_and_await(
            "no-such-host.invalid",
            30030,
            BootstrapRequest::new,
            Duration::from_millis(100),
        )
        .await;
        assert!(matches!(
            r,
            Err(DiscoveryError::Resolve(..)) | Err(DiscoveryError::NoAddress(_))
        ));
    }
}
