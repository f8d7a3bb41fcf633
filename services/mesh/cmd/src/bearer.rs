//! Advertising bearer emulated over UDP.
//!
//! Every datagram carries one advertising payload: an AD type byte followed
//! by the mesh message or beacon. Transmissions are repeated according to
//! the PDU's transmit state and go to every configured peer.

use bytes::{BufMut, Bytes, BytesMut};
use mesh_net::{BearerSink, Bearers, NetError, RelayQueue, SendToken, Transmit};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// AD type of a mesh network PDU
pub const AD_MESH_MESSAGE: u8 = 0x2a;
/// AD type of a mesh beacon
pub const AD_MESH_BEACON: u8 = 0x2b;

const BEACON_SECURE_NETWORK: u8 = 0x01;

/// Bearer completion reported back to the stack
pub type SendReport = (SendToken, Result<(), NetError>);

/// Secure Network beacon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecureBeacon {
    pub flags: u8,
    pub net_id: [u8; 8],
    pub iv_index: u32,
    pub auth: [u8; 8],
}

impl SecureBeacon {
    const LEN: usize = 22;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_u8(BEACON_SECURE_NETWORK);
        buf.put_u8(self.flags);
        buf.put_slice(&self.net_id);
        buf.put_u32(self.iv_index);
        buf.put_slice(&self.auth);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() != Self::LEN || data[0] != BEACON_SECURE_NETWORK {
            return None;
        }
        let mut net_id = [0u8; 8];
        net_id.copy_from_slice(&data[2..10]);
        let mut iv = [0u8; 4];
        iv.copy_from_slice(&data[10..14]);
        let mut auth = [0u8; 8];
        auth.copy_from_slice(&data[14..22]);
        Some(Self {
            flags: data[1],
            net_id,
            iv_index: u32::from_be_bytes(iv),
            auth,
        })
    }
}

/// A received advertisement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Network PDU
    Message(Bytes),
    /// Secure Network beacon
    Beacon(SecureBeacon),
}

/// Split a datagram into its AD type and payload
pub fn parse_frame(datagram: &[u8]) -> Option<Frame> {
    let (&ad_type, payload) = datagram.split_first()?;
    match ad_type {
        AD_MESH_MESSAGE if !payload.is_empty() => {
            Some(Frame::Message(Bytes::copy_from_slice(payload)))
        }
        AD_MESH_BEACON => SecureBeacon::decode(payload).map(Frame::Beacon),
        _ => None,
    }
}

fn frame(ad_type: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + payload.len());
    buf.put_u8(ad_type);
    buf.put_slice(payload);
    buf.freeze()
}

struct Outgoing {
    frame: Bytes,
    xmit: Transmit,
    token: Option<SendToken>,
}

/// Bearer sink writing to a UDP socket from a dedicated task
pub struct UdpBearer {
    queue: mpsc::UnboundedSender<Outgoing>,
    reports: mpsc::UnboundedSender<SendReport>,
    queued: Arc<AtomicUsize>,
    capacity: usize,
}

impl UdpBearer {
    /// Start the transmit task.
    ///
    /// Completions of tokened sends are posted to `reports`.
    pub fn spawn(
        socket: Arc<UdpSocket>,
        peers: Vec<SocketAddr>,
        capacity: usize,
        reports: mpsc::UnboundedSender<SendReport>,
    ) -> (Self, JoinHandle<()>) {
        let (queue, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let task = tokio::spawn(run(socket, peers, rx, queued.clone(), reports.clone()));
        let bearer = Self {
            queue,
            reports,
            queued,
            capacity,
        };
        (bearer, task)
    }

    /// Advertise a Secure Network beacon once
    pub fn send_beacon(&self, beacon: &SecureBeacon) -> Result<(), NetError> {
        self.enqueue(Outgoing {
            frame: frame(AD_MESH_BEACON, &beacon.encode()),
            xmit: Transmit::new(0, 10),
            token: None,
        })
    }

    fn enqueue(&self, out: Outgoing) -> Result<(), NetError> {
        self.queued.fetch_add(1, Ordering::Relaxed);
        self.queue.send(out).map_err(|_| {
            self.queued.fetch_sub(1, Ordering::Relaxed);
            NetError::Io("bearer stopped".to_string())
        })
    }
}

impl BearerSink for UdpBearer {
    fn send(
        &self,
        pdu: Bytes,
        bearers: Bearers,
        xmit: Transmit,
        token: Option<SendToken>,
    ) -> Result<(), NetError> {
        if !bearers.contains(Bearers::ADV) {
            // No GATT connections on this node
            if let Some(token) = token {
                self.reports
                    .send((token, Ok(())))
                    .map_err(|_| NetError::Io("driver stopped".to_string()))?;
            }
            return Ok(());
        }

        self.enqueue(Outgoing {
            frame: frame(AD_MESH_MESSAGE, &pdu),
            xmit,
            token,
        })
    }

    fn relay_queue(&self) -> RelayQueue {
        RelayQueue {
            stored: self.queued.load(Ordering::Relaxed),
            capacity: self.capacity,
        }
    }
}

async fn run(
    socket: Arc<UdpSocket>,
    peers: Vec<SocketAddr>,
    mut queue: mpsc::UnboundedReceiver<Outgoing>,
    queued: Arc<AtomicUsize>,
    reports: mpsc::UnboundedSender<SendReport>,
) {
    while let Some(out) = queue.recv().await {
        let result = transmit(&socket, &peers, &out).await;
        queued.fetch_sub(1, Ordering::Relaxed);
        if let Some(token) = out.token {
            if reports.send((token, result)).is_err() {
                break;
            }
        }
    }
    debug!("UDP bearer stopped");
}

async fn transmit(socket: &UdpSocket, peers: &[SocketAddr], out: &Outgoing) -> Result<(), NetError> {
    let count = out.xmit.count();
    let interval = Duration::from_millis(u64::from(out.xmit.interval_ms()));
    let mut delivered = peers.is_empty();

    for i in 0..=count {
        for peer in peers {
            match socket.send_to(&out.frame, peer).await {
                Ok(_) => delivered = true,
                Err(e) => warn!("Failed to send to {}: {}", peer, e),
            }
        }
        if i < count {
            tokio::time::sleep(interval).await;
        }
    }

    if delivered {
        Ok(())
    } else {
        Err(NetError::Io("no peer reachable".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_beacon_frame() {
        let beacon = SecureBeacon {
            flags: 0x02,
            net_id: [1, 2, 3, 4, 5, 6, 7, 8],
            iv_index: 0x1234_5678,
            auth: [9; 8],
        };
        let datagram = frame(AD_MESH_BEACON, &beacon.encode());
        assert_eq!(datagram.len(), 23);
        assert_eq!(parse_frame(&datagram), Some(Frame::Beacon(beacon)));
    }

    #[test]
    fn test_parse_frame_rejects_unknown() {
        assert_eq!(parse_frame(&[]), None);
        assert_eq!(parse_frame(&[AD_MESH_MESSAGE]), None);
        assert_eq!(parse_frame(&[0x01, 0x02]), None);
        // Unprovisioned device beacon
        assert_eq!(parse_frame(&[AD_MESH_BEACON, 0x00, 0x01]), None);
        assert_eq!(
            parse_frame(&[AD_MESH_MESSAGE, 0xaa, 0xbb]),
            Some(Frame::Message(Bytes::from_static(&[0xaa, 0xbb])))
        );
    }

    #[tokio::test]
    async fn test_transmissions_reach_peer() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (reports_tx, mut reports) = mpsc::unbounded_channel();
        let (bearer, _task) =
            UdpBearer::spawn(socket, vec![peer.local_addr().unwrap()], 8, reports_tx);

        bearer
            .send(
                Bytes::from_static(&[0x11, 0x22, 0x33]),
                Bearers::ALL,
                Transmit::new(1, 10),
                Some(SendToken(7)),
            )
            .unwrap();

        let mut buf = [0u8; 64];
        for _ in 0..2 {
            let (len, _) = peer.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..len], &[AD_MESH_MESSAGE, 0x11, 0x22, 0x33]);
        }

        let (token, result) = reports.recv().await.unwrap();
        assert_eq!(token, SendToken(7));
        assert!(result.is_ok());
        assert_eq!(bearer.relay_queue().stored, 0);
    }

    #[tokio::test]
    async fn test_gatt_only_completes_immediately() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let (reports_tx, mut reports) = mpsc::unbounded_channel();
        let (bearer, _task) = UdpBearer::spawn(socket, Vec::new(), 8, reports_tx);

        bearer
            .send(Bytes::from_static(&[0x01]), Bearers::GATT, Transmit::default(), Some(SendToken(1)))
            .unwrap();
        let (token, result) = reports.recv().await.unwrap();
        assert_eq!(token, SendToken(1));
        assert!(result.is_ok());
    }
}
