//! Stateful port pick plus live network probe (§4.2).

use std::collections::HashSet;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

const LOWEST_PORT: u16 = 8000;
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
/// The manager's own default bind port; never handed out to a child.
const RESERVED_PORT: u16 = 3000;

pub struct PortAllocator;

impl PortAllocator {
    /// First port at or above 8000 that is neither in `persisted` nor
    /// answering a live TCP connect on localhost.
    pub async fn next_available(persisted: &HashSet<u16>) -> u16 {
        let mut port = LOWEST_PORT;
        loop {
            if !persisted.contains(&port) && Self::is_free(port).await {
                return port;
            }
            port = port.saturating_add(1);
        }
    }

    /// A live probe: connection refused or timeout means free; a
    /// successful connect means busy. Ports below 1024 and the manager's
    /// own reserved port are always busy.
    pub async fn is_free(port: u16) -> bool {
        if port < 1024 || port == RESERVED_PORT {
            return false;
        }
        match timeout(PROBE_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await {
            Ok(Ok(_stream)) => false,
            Ok(Err(_)) => true,
            Err(_elapsed) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[tokio::test]
    async fn reserved_and_privileged_ports_are_never_free() {
        assert!(!PortAllocator::is_free(80).await);
        assert!(!PortAllocator::is_free(RESERVED_PORT).await);
    }

    #[tokio::test]
    async fn next_available_returns_8000_on_an_empty_store() {
        let persisted = HashSet::new();
        let port = PortAllocator::next_available(&persisted).await;
        assert_eq!(port, 8000);
    }

    #[tokio::test]
    async fn next_available_skips_persisted_ports() {
        let mut persisted = HashSet::new();
        persisted.insert(8000);
        persisted.insert(8001);
        let port = PortAllocator::next_available(&persisted).await;
        assert_eq!(port, 8002);
    }

    #[tokio::test]
    async fn next_available_skips_a_port_with_a_live_listener() {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let bound_port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });

        assert!(!PortAllocator::is_free(bound_port).await);
    }
}
