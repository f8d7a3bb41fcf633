//! Tokio driver for one mesh node.
//!
//! [`Node`] wires a [`MeshStack`] to the UDP bearer and the tokio
//! scheduler, then feeds it datagrams, timer events and bearer completions
//! from a single `select!` loop.

use crate::bearer::{parse_frame, Frame, SecureBeacon, SendReport, UdpBearer};
use crate::config::MeshConfig;
use crate::scheduler::TokioScheduler;
use crate::{component_debug, component_info, component_warn};
use anyhow::{Context, Result};
use bytes::Bytes;
use mesh_net::{NetEvents, NetIf, NetRx, Network, TimerEvent};
use mesh_subnet::{KeyRefreshPhase, SimCrypto, NET_FLAG_IVU};
use mesh_transport::{MeshStack, MsgCtx, NoFriend, SendCallback, UpperTransport};
use mesh_wire::{address, Features};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const DATAGRAM_MAX: usize = 64;

/// An access message delivered to this node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub src: u16,
    pub dst: u16,
    pub app_idx: u16,
    pub payload: Bytes,
}

struct NodeUpper {
    deliveries: mpsc::UnboundedSender<Delivery>,
}

impl UpperTransport for NodeUpper {
    fn deliver_access(&self, rx: &NetRx, app_idx: u16, payload: Bytes) {
        component_info!(
            "node",
            "Message src=0x{:04x} dst=0x{:04x} app_idx=0x{:03x} ttl={} len={}",
            rx.src,
            rx.dst,
            app_idx,
            rx.ttl,
            payload.len()
        );
        let delivery = Delivery {
            src: rx.src,
            dst: rx.dst,
            app_idx,
            payload,
        };
        if self.deliveries.send(delivery).is_err() {
            component_debug!("node", "No consumer for delivered messages");
        }
    }

    fn heartbeat_received(&self, src: u16, dst: u16, hops: u8, features: Features) {
        component_info!(
            "node",
            "Heartbeat src=0x{:04x} dst=0x{:04x} hops={} features=0x{:04x}",
            src,
            dst,
            hops,
            features.bits()
        );
    }
}

struct NodeEvents {
    beacons: mpsc::UnboundedSender<Option<u16>>,
}

impl NetEvents for NodeEvents {
    fn iv_update_changed(&self, iv_index: u32, in_progress: bool) {
        component_info!("iv", "IV index 0x{:08x} update in progress {}", iv_index, in_progress);
    }

    fn key_refresh_changed(&self, net_idx: u16, phase: KeyRefreshPhase) {
        component_info!("subnet", "Subnet 0x{:03x} key refresh {:?}", net_idx, phase);
    }

    fn secure_beacon_update(&self, net_idx: Option<u16>) {
        if self.beacons.send(net_idx).is_err() {
            component_debug!("node", "Beacon request dropped, driver stopped");
        }
    }
}

/// A running mesh node
pub struct Node {
    config: MeshConfig,
    stack: Arc<MeshStack>,
    bearer: Arc<UdpBearer>,
    scheduler: Arc<TokioScheduler>,
    socket: Arc<UdpSocket>,
    timers: mpsc::UnboundedReceiver<TimerEvent>,
    reports: mpsc::UnboundedReceiver<SendReport>,
    beacons: mpsc::UnboundedReceiver<Option<u16>>,
    deliveries: Option<mpsc::UnboundedReceiver<Delivery>>,
    bearer_task: JoinHandle<()>,
}

impl Node {
    /// Bind the bearer socket and provision the stack from `config`
    pub async fn start(config: MeshConfig) -> Result<Self> {
        config.validate()?;

        let socket = UdpSocket::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;
        let socket = Arc::new(socket);

        let (timer_tx, timers) = mpsc::unbounded_channel();
        let (report_tx, reports) = mpsc::unbounded_channel();
        let (beacon_tx, beacons) = mpsc::unbounded_channel();
        let (delivery_tx, deliveries) = mpsc::unbounded_channel();

        let (bearer, bearer_task) =
            UdpBearer::spawn(socket.clone(), config.peers.clone(), config.relay_queue, report_tx);
        let bearer = Arc::new(bearer);
        let scheduler = Arc::new(TokioScheduler::new(Handle::current(), timer_tx));
        let settings = mesh_storage::open(&config.storage_mode())?;

        component_warn!("node", "Using simulated mesh crypto; not interoperable with real devices");
        let net = Network::new(
            config.net_config(),
            Arc::new(SimCrypto::new()),
            bearer.clone(),
            scheduler.clone(),
            settings,
            Arc::new(NodeEvents { beacons: beacon_tx }),
        );

        // A stored IV index is never rolled back by the configured one
        let restored = net.iv_state();
        let (iv_index, flags) = if restored.iv_index >= config.iv_index {
            let flags = if restored.in_progress() { NET_FLAG_IVU } else { 0 };
            (restored.iv_index, flags)
        } else {
            (config.iv_index, 0)
        };
        net.create(config.net_idx, flags, &config.net_key()?, iv_index)?;
        net.subnets_mut()
            .app_key_add(config.app_idx, config.net_idx, &config.app_key()?)?;
        for group in &config.subscribe {
            net.subscribe(*group);
        }

        let upper = Arc::new(NodeUpper {
            deliveries: delivery_tx,
        });
        let stack = MeshStack::new(config.stack_config()?, net, upper, Arc::new(NoFriend));

        component_info!(
            "node",
            "Node 0x{:04x} ({} elements) with {} peers",
            config.unicast_addr,
            config.element_count,
            config.peers.len()
        );

        Ok(Self {
            config,
            stack: Arc::new(stack),
            bearer,
            scheduler,
            socket,
            timers,
            reports,
            beacons,
            deliveries: Some(deliveries),
            bearer_task,
        })
    }

    /// The node's transport stack
    pub fn stack(&self) -> Arc<MeshStack> {
        self.stack.clone()
    }

    /// Address the bearer socket is bound to
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Take the stream of delivered access messages
    pub fn take_deliveries(&mut self) -> Option<mpsc::UnboundedReceiver<Delivery>> {
        self.deliveries.take()
    }

    /// Advertise the Secure Network beacon of one subnet, or of all
    fn send_beacons(&self, net_idx: Option<u16>) {
        let net = self.stack.net();
        let state = net.iv_state();
        let beacons: Vec<SecureBeacon> = net
            .subnets()
            .iter()
            .filter(|sub| net_idx.map_or(true, |idx| idx == sub.net_idx))
            .map(|sub| SecureBeacon {
                flags: sub.net_flags(state.in_progress()),
                net_id: sub.tx_keys().net_id,
                iv_index: state.iv_index,
                auth: sub.beacon_auth,
            })
            .collect();

        for beacon in &beacons {
            if let Err(e) = self.bearer.send_beacon(beacon) {
                component_warn!("bearer", "Failed to send beacon: {}", e);
            }
        }
    }

    fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) {
        match parse_frame(datagram) {
            Some(Frame::Message(pdu)) => {
                if let Err(e) = self.stack.net_recv(&pdu, NetIf::Adv) {
                    component_debug!("node", "Dropped PDU from {}: {}", from, e);
                }
            }
            Some(Frame::Beacon(beacon)) => {
                match self.stack.process_beacon(
                    &beacon.net_id,
                    beacon.flags,
                    beacon.iv_index,
                    &beacon.auth,
                ) {
                    Ok(outcome) => component_debug!(
                        "node",
                        "Beacon net_idx=0x{:03x} kr_changed={} iv={:?}",
                        outcome.net_idx,
                        outcome.kr_changed,
                        outcome.iv
                    ),
                    Err(e) => component_debug!("node", "Ignoring beacon from {}: {}", from, e),
                }
            }
            None => component_debug!(
                "node",
                "Ignoring {} byte datagram from {}",
                datagram.len(),
                from
            ),
        }
    }

    fn publish(&self, payload: &[u8]) {
        let ctx = MsgCtx::new(
            self.config.net_idx,
            self.config.app_idx,
            self.config.unicast_addr,
            self.config.publish_dst,
        );
        let dst = ctx.dst;
        let callback: SendCallback = Box::new(move |result| match result {
            Ok(()) => component_debug!("node", "Publication to 0x{:04x} sent", dst),
            Err(e) => component_warn!("node", "Publication to 0x{:04x} failed: {}", dst, e),
        });
        if let Err(e) = self.stack.send(&ctx, payload, Some(callback)) {
            component_warn!("node", "Failed to publish to 0x{:04x}: {}", dst, e);
        }
    }

    fn publish_heartbeat(&self) {
        let enabled = self.stack.net().features();
        let mut features = Features::empty();
        features.set(Features::RELAY, enabled.relay);
        features.set(Features::PROXY, enabled.proxy);
        features.set(Features::FRIEND, enabled.friend);

        if let Err(e) = self.stack.send_heartbeat(
            self.config.net_idx,
            self.config.heartbeat_dst,
            self.config.default_ttl,
            features,
        ) {
            component_warn!("node", "Failed to send heartbeat: {}", e);
        }
    }

    /// Drive the node until `shutdown` completes
    pub async fn run<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        // Without a consumer delivered messages are only logged
        self.deliveries = None;

        let payload = self.config.publish_payload()?;
        let heartbeat_enabled = self.config.heartbeat_dst != address::UNASSIGNED;
        let publish_enabled = self.config.publish_dst != address::UNASSIGNED;
        let mut beacon_tick = tokio::time::interval(self.config.beacon_interval);
        let mut heartbeat_tick = tokio::time::interval(self.config.heartbeat_period);
        let mut publish_tick = tokio::time::interval(self.config.publish_period);
        let mut buf = [0u8; DATAGRAM_MAX];

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    component_info!("node", "Shutting down node 0x{:04x}", self.config.unicast_addr);
                    break;
                }
                Some(event) = self.timers.recv() => self.stack.on_timer(event),
                Some((token, result)) = self.reports.recv() => self.stack.on_sent(token, result),
                Some(net_idx) = self.beacons.recv() => self.send_beacons(net_idx),
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => self.handle_datagram(&buf[..len], from),
                    Err(e) => component_warn!("bearer", "UDP receive failed: {}", e),
                },
                _ = beacon_tick.tick() => self.send_beacons(None),
                _ = heartbeat_tick.tick(), if heartbeat_enabled => self.publish_heartbeat(),
                _ = publish_tick.tick(), if publish_enabled => self.publish(&payload),
            }
        }

        self.stack.tx_reset();
        self.bearer_task.abort();
        component_debug!("node", "{} timers pending at shutdown", self.scheduler.pending());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_transport::TransportError;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn config(addr: u16) -> MeshConfig {
        MeshConfig {
            unicast_addr: addr,
            listen: "127.0.0.1:0".parse().unwrap(),
            beacon_interval: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_two_nodes_exchange_segmented_message() {
        let mut receiver = Node::start(config(0x0002)).await.unwrap();
        let mut deliveries = receiver.take_deliveries().unwrap();

        let sender_config = MeshConfig {
            peers: vec![receiver.local_addr().unwrap()],
            ..config(0x0001)
        };
        let sender = Node::start(sender_config).await.unwrap();
        let sender_stack = sender.stack();

        let (stop_rx_tx, stop_rx) = oneshot::channel::<()>();
        let (stop_tx_tx, stop_tx) = oneshot::channel::<()>();
        let receiver_task = tokio::spawn(receiver.run(async {
            let _ = stop_rx.await;
        }));
        let sender_task = tokio::spawn(sender.run(async {
            let _ = stop_tx.await;
        }));

        // Acks from the receiver never reach the sender, so send to a group
        let payload: Vec<u8> = (0..20).collect();
        let (done_tx, done_rx) = oneshot::channel::<Result<(), TransportError>>();
        let ctx = MsgCtx::new(0, 0, 0x0001, address::ALL_NODES);
        sender_stack
            .send(
                &ctx,
                &payload,
                Some(Box::new(move |result| {
                    let _ = done_tx.send(result);
                })),
            )
            .unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(5), deliveries.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.src, 0x0001);
        assert_eq!(delivery.dst, address::ALL_NODES);
        assert_eq!(delivery.payload.as_ref(), payload.as_slice());

        let result = tokio::time::timeout(Duration::from_secs(5), done_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Ok(()));

        stop_rx_tx.send(()).unwrap();
        stop_tx_tx.send(()).unwrap();
        receiver_task.await.unwrap().unwrap();
        sender_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let bad = MeshConfig {
            unicast_addr: address::UNASSIGNED,
            ..config(0x0001)
        };
        assert!(Node::start(bad).await.is_err());
    }
}
