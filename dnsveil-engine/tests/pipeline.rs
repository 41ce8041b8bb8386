//! End-to-end pipeline tests against in-memory device and transport
//! doubles: datagrams are injected as if the OS had routed them to the
//! tunnel, and assertions run on what reaches the upstream and what
//! comes back out of the device.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;

use dnsveil_engine::doh::ResolveResult;
use dnsveil_engine::{
    Config, Error, PacketDevice, Proxy, ProxyHooks, ProxyState, ResolveError, ResponseBody,
    Transport,
};

const MTU: usize = 1500;

fn test_config() -> Config {
    Config::from_toml(
        r#"
        [upstream]
        url = "https://dns.example.com/dns-query"

        [proxy]
        leak_guard = false
        "#,
    )
    .unwrap()
}

/// Build an IPv4/UDP query datagram for `www.example.com` with message
/// ID 0xABCD, sent from the tunnel's local address, addressed to `dst`
/// with the given IP protocol.
fn query_datagram(dst: [u8; 4], protocol: u8) -> Vec<u8> {
    let mut buf = vec![0u8; 28];
    buf[0] = 0x45; // version + IHL
    buf[8] = 64; // TTL
    buf[9] = protocol;
    buf[12..16].copy_from_slice(&[192, 0, 2, 43]);
    buf[16..20].copy_from_slice(&dst);
    buf[20..22].copy_from_slice(&54321u16.to_be_bytes()); // source port
    buf[22..24].copy_from_slice(&53u16.to_be_bytes());
    buf.extend_from_slice(&[
        0xAB, 0xCD, 0x01, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0, 0x03, b'w', b'w', b'w', 0x07, b'e',
        b'x', b'a', b'm', b'p', b'l', b'e', 0x03, b'c', b'o', b'm', 0x00, 0x00, 0x01, 0x00, 0x01,
    ]);
    let total_len = buf.len() as u16;
    buf[2..4].copy_from_slice(&total_len.to_be_bytes());
    let udp_len = (buf.len() - 20) as u16;
    buf[24..26].copy_from_slice(&udp_len.to_be_bytes());
    buf
}

fn dns_query() -> Vec<u8> {
    query_datagram([192, 0, 2, 42], 17)
}

/// In-memory packet device fed and drained through channels
struct TestDevice {
    inbound: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    outbound: mpsc::Sender<Vec<u8>>,
}

impl TestDevice {
    fn new() -> (Arc<Self>, mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>) {
        let (inject_tx, inject_rx) = mpsc::channel(16);
        let (outbound_tx, outbound_rx) = mpsc::channel(16);
        (
            Arc::new(Self {
                inbound: tokio::sync::Mutex::new(inject_rx),
                outbound: outbound_tx,
            }),
            inject_tx,
            outbound_rx,
        )
    }
}

#[async_trait]
impl PacketDevice for TestDevice {
    async fn recv(&self, buf: &mut [u8]) -> dnsveil_engine::Result<usize> {
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(packet) => {
                buf[..packet.len()].copy_from_slice(&packet);
                Ok(packet.len())
            }
            None => Err(Error::TunRead(veil_tun::Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "device closed",
            )))),
        }
    }

    async fn send(&self, buf: &[u8]) -> dnsveil_engine::Result<usize> {
        self.outbound
            .send(buf.to_vec())
            .await
            .map_err(|_| Error::TunWrite(veil_tun::Error::Config("outbound closed".into())))?;
        Ok(buf.len())
    }
}

enum MockReply {
    Body(Vec<u8>),
    Status(u16),
}

/// Transport double that records request bodies and serves a canned reply
struct MockTransport {
    requests: Mutex<Vec<Vec<u8>>>,
    reply: MockReply,
}

impl MockTransport {
    fn replying(body: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            reply: MockReply::Body(body),
        })
    }

    fn failing(status: u16) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            reply: MockReply::Status(status),
        })
    }

    fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn round_trip(&self, body: Vec<u8>) -> ResolveResult<Box<dyn ResponseBody>> {
        self.requests.lock().push(body);
        match &self.reply {
            MockReply::Body(bytes) => Ok(Box::new(VecBody {
                data: bytes.clone(),
                pos: 0,
            })),
            MockReply::Status(code) => Err(ResolveError::Status(*code)),
        }
    }
}

struct VecBody {
    data: Vec<u8>,
    pos: usize,
}

#[async_trait]
impl ResponseBody for VecBody {
    async fn chunk(&mut self) -> ResolveResult<Option<Bytes>> {
        if self.pos >= self.data.len() {
            return Ok(None);
        }
        let end = (self.pos + 512).min(self.data.len());
        let chunk = Bytes::copy_from_slice(&self.data[self.pos..end]);
        self.pos = end;
        Ok(Some(chunk))
    }
}

#[derive(Default)]
struct RecordingHooks {
    states: Mutex<Vec<bool>>,
    queries: Mutex<Vec<(u16, String)>>,
    errors: Mutex<Vec<String>>,
}

#[async_trait]
impl ProxyHooks for RecordingHooks {
    async fn on_state_change(&self, running: bool) {
        self.states.lock().push(running);
    }

    async fn on_query(&self, msg_id: u16, qname: &str) {
        self.queries.lock().push((msg_id, qname.to_string()));
    }

    async fn on_error(&self, error: &Error) {
        self.errors.lock().push(error.to_string());
    }
}

struct Harness {
    proxy: Proxy,
    hooks: Arc<RecordingHooks>,
    inject: mpsc::Sender<Vec<u8>>,
    outbound: mpsc::Receiver<Vec<u8>>,
}

async fn start_proxy(config: Config, transport: Arc<MockTransport>) -> Harness {
    let (device, inject, outbound) = TestDevice::new();
    let hooks = Arc::new(RecordingHooks::default());
    let mut proxy = Proxy::new(config)
        .unwrap()
        .with_hooks(hooks.clone())
        .with_transport(transport);
    proxy.start_with_device(device).await.unwrap();
    Harness {
        proxy,
        hooks,
        inject,
        outbound,
    }
}

async fn expect_no_outbound(outbound: &mut mpsc::Receiver<Vec<u8>>) {
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(outbound.try_recv().is_err(), "unexpected outbound datagram");
}

#[tokio::test]
async fn happy_path_resolves_and_replies() {
    let reply = vec![0xAB, 0xCD, 0x81, 0x80, 0, 1, 0, 1, 0, 0, 0, 0];
    let transport = MockTransport::replying(reply.clone());
    let mut h = start_proxy(test_config(), transport.clone()).await;

    h.inject.send(dns_query()).await.unwrap();

    let out = timeout(Duration::from_secs(5), h.outbound.recv())
        .await
        .expect("no reply datagram")
        .unwrap();
    assert_eq!(out, reply);

    // one POST carrying the raw datagram
    assert_eq!(transport.request_count(), 1);
    assert_eq!(transport.requests.lock()[0], dns_query());

    // query log fired with the parsed ID and name
    assert_eq!(
        h.hooks.queries.lock().as_slice(),
        &[(0xABCD, "www.example.com.".to_string())]
    );

    h.proxy.stop().await.unwrap();
}

#[tokio::test]
async fn duplicate_query_is_suppressed() {
    let reply = vec![0xAB, 0xCD, 0x81, 0x80];
    let transport = MockTransport::replying(reply);
    let mut h = start_proxy(test_config(), transport.clone()).await;

    h.inject.send(dns_query()).await.unwrap();
    h.inject.send(dns_query()).await.unwrap();

    timeout(Duration::from_secs(5), h.outbound.recv())
        .await
        .expect("no reply datagram")
        .unwrap();
    expect_no_outbound(&mut h.outbound).await;
    assert_eq!(transport.request_count(), 1);

    h.proxy.stop().await.unwrap();
}

#[tokio::test]
async fn wrong_destination_is_dropped() {
    let transport = MockTransport::replying(vec![0; 4]);
    let mut h = start_proxy(test_config(), transport.clone()).await;

    h.inject
        .send(query_datagram([192, 0, 2, 99], 17))
        .await
        .unwrap();

    expect_no_outbound(&mut h.outbound).await;
    assert_eq!(transport.request_count(), 0);

    h.proxy.stop().await.unwrap();
}

#[tokio::test]
async fn non_udp_is_dropped() {
    let transport = MockTransport::replying(vec![0; 4]);
    let mut h = start_proxy(test_config(), transport.clone()).await;

    h.inject
        .send(query_datagram([192, 0, 2, 42], 6))
        .await
        .unwrap();

    expect_no_outbound(&mut h.outbound).await;
    assert_eq!(transport.request_count(), 0);

    h.proxy.stop().await.unwrap();
}

#[tokio::test]
async fn short_datagram_is_dropped() {
    let transport = MockTransport::replying(vec![0; 4]);
    let mut h = start_proxy(test_config(), transport.clone()).await;

    h.inject.send(vec![0u8; 20]).await.unwrap();

    expect_no_outbound(&mut h.outbound).await;
    assert_eq!(transport.request_count(), 0);

    h.proxy.stop().await.unwrap();
}

#[tokio::test]
async fn upstream_error_is_reported_and_dropped() {
    let transport = MockTransport::failing(500);
    let mut h = start_proxy(test_config(), transport.clone()).await;

    h.inject.send(dns_query()).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if !h.hooks.errors.lock().is_empty() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "no error reported");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let errors = h.hooks.errors.lock().clone();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("abcd"), "missing msg id: {}", errors[0]);
    assert!(
        errors[0].contains("error code: 500"),
        "missing status: {}",
        errors[0]
    );

    expect_no_outbound(&mut h.outbound).await;

    h.proxy.stop().await.unwrap();
}

#[tokio::test]
async fn payload_only_strips_headers_and_reframes_reply() {
    let mut config = test_config();
    config.upstream.payload_only = true;

    let reply = vec![0xAB, 0xCD, 0x81, 0x80, 0, 1, 0, 1, 0, 0, 0, 0];
    let transport = MockTransport::replying(reply.clone());
    let mut h = start_proxy(config, transport.clone()).await;

    h.inject.send(dns_query()).await.unwrap();

    let out = timeout(Duration::from_secs(5), h.outbound.recv())
        .await
        .expect("no reply datagram")
        .unwrap();

    // the POST body is the bare DNS message
    assert_eq!(transport.requests.lock()[0], dns_query()[28..].to_vec());

    // the datagram written back is still IP/UDP framed: the query's
    // header reversed, carrying the DoH reply as the UDP payload
    assert_eq!(out.len(), 28 + reply.len());
    assert_eq!(out[0], 0x45);
    assert_eq!(out[9], 17);
    assert_eq!(&out[12..16], &[192, 0, 2, 42]);
    assert_eq!(&out[16..20], &[192, 0, 2, 43]);
    assert_eq!(u16::from_be_bytes([out[20], out[21]]), 53);
    assert_eq!(u16::from_be_bytes([out[22], out[23]]), 54321);
    assert_eq!(
        u16::from_be_bytes([out[2], out[3]]) as usize,
        28 + reply.len()
    );
    assert_eq!(
        u16::from_be_bytes([out[24], out[25]]) as usize,
        8 + reply.len()
    );
    assert_eq!(&out[28..], &reply[..]);

    h.proxy.stop().await.unwrap();
}

#[tokio::test]
async fn oversized_reply_is_truncated_with_tc_bit() {
    let mut reply = vec![0u8; MTU + 300];
    reply[0] = 0xAB;
    reply[1] = 0xCD;
    let transport = MockTransport::replying(reply);
    let mut h = start_proxy(test_config(), transport).await;

    h.inject.send(dns_query()).await.unwrap();

    let out = timeout(Duration::from_secs(5), h.outbound.recv())
        .await
        .expect("no reply datagram")
        .unwrap();
    assert_eq!(out.len(), MTU);
    assert_eq!(out[2] & 0x2, 0x2, "TC bit not set");

    h.proxy.stop().await.unwrap();
}

#[tokio::test]
async fn lifecycle_transitions_fire_exactly_once() {
    let transport = MockTransport::replying(vec![0; 4]);
    let (device, _inject, _outbound) = TestDevice::new();
    let hooks = Arc::new(RecordingHooks::default());
    let mut proxy = Proxy::new(test_config())
        .unwrap()
        .with_hooks(hooks.clone())
        .with_transport(transport);

    assert_eq!(proxy.state(), ProxyState::Stopped);

    proxy.start_with_device(device.clone()).await.unwrap();
    assert_eq!(proxy.state(), ProxyState::Running);

    // start while running is a no-op
    proxy.start_with_device(device).await.unwrap();
    assert_eq!(hooks.states.lock().as_slice(), &[true]);

    proxy.stop().await.unwrap();
    assert_eq!(proxy.state(), ProxyState::Stopped);
    assert_eq!(hooks.states.lock().as_slice(), &[true, false]);

    // stop while stopped is a no-op
    proxy.stop().await.unwrap();
    assert_eq!(hooks.states.lock().as_slice(), &[true, false]);
}

#[tokio::test]
async fn device_eof_stops_the_engine() {
    let transport = MockTransport::replying(vec![0; 4]);
    let (device, inject, _outbound) = TestDevice::new();
    let hooks = Arc::new(RecordingHooks::default());
    let mut proxy = Proxy::new(test_config())
        .unwrap()
        .with_hooks(hooks.clone())
        .with_transport(transport);
    proxy.start_with_device(device).await.unwrap();

    // closing the inject side reads as EOF from the device
    drop(inject);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while proxy.started() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "engine still running after device EOF"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(hooks.states.lock().as_slice(), &[true, false]);
    // EOF is a clean shutdown, not an error
    assert!(hooks.errors.lock().is_empty());
}
