use crate::error::HubError;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, warn};

const SAME_PORT_ATTEMPTS: u32 = 5;
const RETRY_BACKOFF: Duration = Duration::from_millis(120);

/// Bind a loopback listener, preferring `preferred`.
///
/// The preferred port is retried a few times with back-off (dev-server
/// restarts frequently leave it in TIME_WAIT); after that, subsequent
/// ports are probed once each, skipping `skip` (the sibling endpoint's
/// port), until the port space runs out.
pub async fn bind_loopback(preferred: u16, skip: Option<u16>) -> Result<TcpListener, HubError> {
    for attempt in 1..=SAME_PORT_ATTEMPTS {
        match try_bind(preferred).await {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                debug!(
                    event = "bind_retry",
                    port = preferred,
                    attempt,
                    error = %err
                );
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
        }
    }
    warn!(event = "bind_fallback", port = preferred);

    let mut candidate = preferred;
    while candidate < u16::MAX {
        candidate += 1;
        if Some(candidate) == skip {
            continue;
        }
        if let Ok(listener) = try_bind(candidate).await {
            return Ok(listener);
        }
    }
    Err(HubError::PortExhausted(preferred))
}

async fn try_bind(port: u16) -> std::io::Result<TcpListener> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    TcpListener::bind(addr).await
}
