//! UDP discovery responder: answers LAN probes with the server's address.

use log::{debug, error, info, warn};
use shared::{discovery_advertisement, DISCOVERY_PROBE};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;

/// Receives datagrams until shutdown. The exact probe payload gets the
/// advertisement back; anything else is ignored.
pub async fn run_discovery(
    socket: UdpSocket,
    server_name: String,
    tcp_port: u16,
    mut shutdown: watch::Receiver<bool>,
) {
    match socket.local_addr() {
        Ok(addr) => info!("Discovery responder listening on {}", addr),
        Err(_) => info!("Discovery responder listening"),
    }
    let advertisement = discovery_advertisement(&server_name, tcp_port);
    let mut buf = [0u8; 256];

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, peer)) => {
                    if &buf[..len] == DISCOVERY_PROBE.as_bytes() {
                        debug!("Discovery probe from {}, replying '{}'", peer, advertisement);
                        if let Err(e) = socket.send_to(advertisement.as_bytes(), peer).await {
                            warn!("Failed to answer discovery probe from {}: {}", peer, e);
                        }
                    } else {
                        debug!("Ignoring unknown datagram from {}", peer);
                    }
                }
                Err(e) => {
                    error!("Discovery receive error: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            },
            _ = shutdown.changed() => break,
        }
    }

    info!("Discovery responder stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn probe_gets_the_advertisement_and_noise_is_ignored() {
        let server_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server_socket.local_addr().unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(run_discovery(
            server_socket,
            "lanparty".to_string(),
            5556,
            shutdown_rx,
        ));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // Noise first: no reply may arrive for it
        client.send_to(b"hello?", server_addr).await.unwrap();
        client.send_to(DISCOVERY_PROBE.as_bytes(), server_addr).await.unwrap();

        let mut buf = [0u8; 256];
        let (len, from) = tokio::time::timeout(
            Duration::from_secs(2),
            client.recv_from(&mut buf),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(from, server_addr);
        assert_eq!(
            std::str::from_utf8(&buf[..len]).unwrap(),
            "hello i'm a quiznet server:lanparty:5556"
        );
    }
}
