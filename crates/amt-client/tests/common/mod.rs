//! In-process AMT relay for integration tests
#![allow(dead_code)]

use amt_client::amt_proto::{
    build_ipv4_udp, AmtMessage, GroupRecordType, MembershipQuery, MembershipUpdate,
    MulticastData, Nonce, RelayAdvertisement, ResponseMac,
};
use amt_client::{GatewayConfig, RelayIdentity, ResourceSample, ResourceSampler};
use bytes::Bytes;
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const RESPONSE_MAC: ResponseMac = ResponseMac([1, 2, 3, 4, 5, 6]);
pub const GROUP: &str = "232.198.38.1";
pub const SOURCE: &str = "198.38.23.145";

/// What the relay saw from a gateway
#[derive(Debug, Clone)]
pub enum RelayEvent {
    Discovery { from: SocketAddr, nonce: Nonce },
    Request { from: SocketAddr, nonce: Nonce },
    Update { from: SocketAddr, update: MembershipUpdate },
}

struct Behaviour {
    answer_discovery: AtomicBool,
    answer_request: AtomicBool,
}

pub struct MockRelay {
    socket: Arc<UdpSocket>,
    addr: SocketAddr,
    behaviour: Arc<Behaviour>,
    events: mpsc::UnboundedReceiver<RelayEvent>,
    task: JoinHandle<()>,
}

impl MockRelay {
    pub async fn bind(addr: &str) -> Self {
        let socket = Arc::new(UdpSocket::bind(addr).await.unwrap());
        let addr = socket.local_addr().unwrap();
        let behaviour = Arc::new(Behaviour {
            answer_discovery: AtomicBool::new(true),
            answer_request: AtomicBool::new(true),
        });
        let (tx, events) = mpsc::unbounded_channel();

        let task = tokio::spawn(serve(socket.clone(), behaviour.clone(), tx));

        Self {
            socket,
            addr,
            behaviour,
            events,
            task,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop answering anything
    pub fn go_silent(&self) {
        self.behaviour.answer_discovery.store(false, Ordering::SeqCst);
        self.behaviour.answer_request.store(false, Ordering::SeqCst);
    }

    pub fn answer_request(&self, answer: bool) {
        self.behaviour.answer_request.store(answer, Ordering::SeqCst);
    }

    /// Next event, failing the test if none arrives in time
    pub async fn next_event(&mut self) -> RelayEvent {
        tokio::time::timeout(Duration::from_secs(5), self.events.recv())
            .await
            .expect("relay saw no gateway traffic")
            .expect("relay task ended")
    }

    /// Skip events until a membership update arrives
    pub async fn next_update(&mut self) -> (SocketAddr, MembershipUpdate) {
        loop {
            if let RelayEvent::Update { from, update } = self.next_event().await {
                return (from, update);
            }
        }
    }

    /// Send one replicated datagram to a gateway as Multicast Data
    pub async fn send_data(&self, gateway: SocketAddr, payload: &[u8]) {
        let source: SocketAddrV4 = format!("{}:40000", SOURCE).parse().unwrap();
        let group: SocketAddrV4 = format!("{}:5500", GROUP).parse().unwrap();
        let data = MulticastData {
            packet: build_ipv4_udp(source, group, payload),
        };
        self.socket.send_to(&data.encode(), gateway).await.unwrap();
    }

    /// Keep replicating data to `gateway` every `every`, regardless of
    /// joins and leaves, the way in-flight replication outlives a session
    pub fn stream_to(&self, gateway: SocketAddr, every: Duration) -> JoinHandle<()> {
        let socket = self.socket.clone();
        tokio::spawn(async move {
            let source: SocketAddrV4 = format!("{}:40000", SOURCE).parse().unwrap();
            let group: SocketAddrV4 = format!("{}:5500", GROUP).parse().unwrap();
            let data = MulticastData {
                packet: build_ipv4_udp(source, group, b"stream"),
            }
            .encode();
            loop {
                if socket.send_to(&data, gateway).await.is_err() {
                    return;
                }
                tokio::time::sleep(every).await;
            }
        })
    }

    pub async fn send_raw(&self, gateway: SocketAddr, bytes: &[u8]) {
        self.socket.send_to(bytes, gateway).await.unwrap();
    }
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    socket: Arc<UdpSocket>,
    behaviour: Arc<Behaviour>,
    events: mpsc::UnboundedSender<RelayEvent>,
) {
    let mut buf = vec![0u8; 1500];
    let relay_ip = socket.local_addr().map(|a| a.ip()).unwrap();

    loop {
        let Ok((len, from)) = socket.recv_from(&mut buf).await else {
            return;
        };
        let Ok(message) = AmtMessage::decode(Bytes::copy_from_slice(&buf[..len])) else {
            continue;
        };

        match message {
            AmtMessage::RelayDiscovery(discovery) => {
                let _ = events.send(RelayEvent::Discovery {
                    from,
                    nonce: discovery.nonce,
                });
                if behaviour.answer_discovery.load(Ordering::SeqCst) {
                    let advertisement = RelayAdvertisement {
                        nonce: discovery.nonce,
                        relay_address: relay_ip,
                    };
                    let _ = socket.send_to(&advertisement.encode(), from).await;
                }
            }
            AmtMessage::RelayRequest(request) => {
                let _ = events.send(RelayEvent::Request {
                    from,
                    nonce: request.nonce,
                });
                if behaviour.answer_request.load(Ordering::SeqCst) {
                    let query = MembershipQuery {
                        limited: false,
                        has_gateway_address: false,
                        response_mac: RESPONSE_MAC,
                        nonce: Some(request.nonce),
                        encapsulated_query: Bytes::from_static(&[0x46, 0xc0, 0x00, 0x20]),
                    };
                    let _ = socket.send_to(&query.encode(), from).await;
                }
            }
            AmtMessage::MembershipUpdate(update) => {
                let _ = events.send(RelayEvent::Update { from, update });
            }
            _ => {}
        }
    }
}

pub fn is_leave(update: &MembershipUpdate) -> bool {
    update.report().unwrap().records[0].record_type == GroupRecordType::BlockOldSources
}

/// Consumer standing in for the local player
pub async fn output_sink() -> (UdpSocket, u16) {
    let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = sink.local_addr().unwrap().port();
    (sink, port)
}

pub async fn recv_payload(sink: &UdpSocket) -> Vec<u8> {
    let mut buf = vec![0u8; 1500];
    let len = tokio::time::timeout(Duration::from_secs(5), sink.recv(&mut buf))
        .await
        .expect("no payload forwarded")
        .unwrap();
    buf.truncate(len);
    buf
}

/// Gateway configuration aimed at `relay` with test-sized timers
pub fn config_for(relay: &MockRelay, output_port: u16) -> GatewayConfig {
    GatewayConfig::builder()
        .relay(RelayIdentity::Literal(relay.addr().ip().to_string()))
        .relay_port(relay.port())
        .source(SOURCE.parse().unwrap())
        .group(GROUP.parse().unwrap())
        .local_port(0)
        .output_port(output_port)
        .handshake_timeout(Duration::from_millis(300))
        .poll_interval(Duration::from_millis(20))
        .idle_reconnect_after(Duration::from_secs(30))
        .heartbeat_after(Duration::from_secs(60))
        .build()
        .unwrap()
}

/// A port that was free a moment ago
pub fn free_udp_port() -> u16 {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Sampler replaying a fixed script, then reporting an idle host
#[derive(Clone, Default)]
pub struct ScriptedSampler {
    script: Arc<Mutex<VecDeque<ResourceSample>>>,
    taken: Arc<Mutex<usize>>,
}

impl ScriptedSampler {
    pub fn new(samples: impl IntoIterator<Item = ResourceSample>) -> Self {
        Self {
            script: Arc::new(Mutex::new(samples.into_iter().collect())),
            taken: Arc::new(Mutex::new(0)),
        }
    }

    pub fn taken(&self) -> usize {
        *self.taken.lock().unwrap()
    }
}

impl ResourceSampler for ScriptedSampler {
    fn sample(&mut self) -> ResourceSample {
        *self.taken.lock().unwrap() += 1;
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ResourceSample {
                cpu_percent: 5.0,
                mem_percent: 20.0,
            })
    }
}

pub fn loopback(ip: &str) -> IpAddr {
    ip.parse().unwrap()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("amt_client=debug")),
        )
        .with_test_writer()
        .try_init();
}
