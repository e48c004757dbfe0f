//! UDP command listener. One datagram is handled to completion before the next is read.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use orch_core::wire::MAX_DATAGRAM_LEN;
use orch_core::{decode_request, WireError};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::agent::{Agent, Outcome};

/// Pause after a failed receive before reading again.
const RECV_BACKOFF: Duration = Duration::from_millis(100);

/// Why the listener stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Restart,
}

/// Where the dispatcher reads datagrams from.
pub trait Inbound {
    async fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

impl Inbound for UdpSocket {
    async fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.recv_from(buf).await
    }
}

/// Serve commands until one asks for a restart. Neither receive nor decode failures stop the loop.
pub async fn run(inbound: &impl Inbound, agent: &mut Agent) -> Exit {
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    loop {
        let (n, from) = match inbound.recv_datagram(&mut buf).await {
            Ok(r) => r,
            // ICMP errors from earlier sends surface here on some platforms.
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
            Err(e) => {
                warn!("receive failed: {}", e);
                tokio::time::sleep(RECV_BACKOFF).await;
                continue;
            }
        };
        let request = match decode_request(&buf[..n]) {
            Ok(r) => r,
            Err(WireError::UnknownCommand(verb)) => {
                warn!(%from, verb = %verb, "unknown command ignored");
                continue;
            }
            Err(e) => {
                debug!(%from, len = n, "dropping datagram: {}", e);
                continue;
            }
        };
        debug!(
            %from,
            command = %request.command,
            provider = request.provider.as_deref().unwrap_or("-"),
            "command received"
        );
        if agent.handle(&request, from).await == Outcome::Restart {
            return Exit::Restart;
        }
    }
}
