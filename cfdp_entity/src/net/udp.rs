// One PDU per datagram. Outbound PDUs go through an unbounded channel to a
// dedicated sender task so the dispatcher never awaits the socket.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use cfdp_protocol::{EntityId, MAX_DATA_FIELD_LEN};
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::logging;
use crate::manager::PduSink;

/// Largest datagram a valid PDU can occupy (header + data field + CRC).
const MAX_DATAGRAM: usize = 15 + MAX_DATA_FIELD_LEN + 4;

#[derive(Debug)]
pub struct Outbound {
    pub destination: EntityId,
    pub bytes: Vec<u8>,
}

/// [`PduSink`] backed by the link's outbound queue.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { tx }
    }
}

impl PduSink for ChannelSink {
    fn send(&self, destination: EntityId, bytes: Vec<u8>) {
        if self.tx.send(Outbound { destination, bytes }).is_err() {
            debug!(event = "link_closed", destination = %destination);
        }
    }
}

/// Drops each datagram independently with probability `p`.
#[derive(Debug, Clone, Copy)]
pub struct LossModel {
    p: f64,
}

impl LossModel {
    pub fn new(p: f64) -> Self {
        Self { p: p.clamp(0.0, 1.0) }
    }

    pub fn should_drop<R: Rng + ?Sized>(&self, rng: &mut R) -> bool {
        self.p > 0.0 && rng.random_bool(self.p)
    }
}

pub async fn bind(addr: &str) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(addr).await?;
    info!(event = "udp_bound", addr = %socket.local_addr()?);
    Ok(socket)
}

pub fn spawn_sender(
    socket: Arc<UdpSocket>,
    peers: HashMap<EntityId, SocketAddr>,
    loss: LossModel,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            let Some(addr) = peers.get(&out.destination) else {
                warn!(event = "no_route", destination = %out.destination);
                continue;
            };
            // thread-local rng is not Send; keep it out of the await points
            let dropped = loss.should_drop(&mut rand::rng());
            if dropped {
                debug!(event = "simulated_loss", destination = %out.destination, bytes = out.bytes.len());
                logging::pdus::log_pdu("drop", out.destination, &out.bytes).await;
                continue;
            }
            match socket.send_to(&out.bytes, addr).await {
                Ok(_) => logging::pdus::log_pdu("tx", out.destination, &out.bytes).await,
                Err(e) => warn!(event = "udp_send_failed", %addr, error = %e),
            }
        }
        debug!(event = "udp_sender_stopped");
    })
}

pub fn spawn_receiver(socket: Arc<UdpSocket>, tx: mpsc::Sender<(Vec<u8>, SocketAddr)>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((n, from)) => {
                    if tx.send((buf[..n].to_vec(), from)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(event = "udp_recv_failed", error = %e),
            }
        }
        debug!(event = "udp_receiver_stopped");
    })
}
