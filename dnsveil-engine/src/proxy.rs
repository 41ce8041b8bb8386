//! Packet-to-DoH translation engine
//!
//! Owns the TUN handle and runs the read / filter / dispatch / write
//! pipeline: datagrams the OS delivers to the tunnel are filtered down
//! to UDP queries addressed at the advertised resolver, deduplicated,
//! resolved in parallel per-query tasks against the DoH upstream, and
//! written back as reply datagrams. Replies may interleave out of order;
//! the stub resolver matches them by message ID.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use veil_tun::{TunConfig, TunDevice};

use crate::config::Config;
use crate::dedup::Dedup;
use crate::doh::{self, HttpTransport, Transport};
use crate::error::{Error, Result};
use crate::event::{LoggingHooks, ProxyHooks, ProxyState};
use crate::pool::{BufferPool, BUFFER_SIZE};
use crate::unleak;
use crate::wire;

/// Name of the tunnel interface
pub const TUN_NAME: &str = "tun0";

/// Address the tunnel interface claims for itself
pub const TUN_LOCAL_ADDR: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 43);

/// Peer address of the point-to-point link, advertised to the OS as the
/// only system resolver
pub const DNS_ADDR: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 42);

const TUN_PREFIX_LEN: u8 = 24;

/// Depth of the channels between the reader, dispatcher and writer
const PACKET_QUEUE_DEPTH: usize = 64;

/// Byte-level packet device consumed by the pipeline
///
/// Implemented for the TUN device and by in-memory doubles in tests.
#[async_trait]
pub trait PacketDevice: Send + Sync {
    async fn recv(&self, buf: &mut [u8]) -> Result<usize>;
    async fn send(&self, buf: &[u8]) -> Result<usize>;
}

#[async_trait]
impl PacketDevice for TunDevice {
    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        self.read(buf).await.map_err(Error::TunRead)
    }

    async fn send(&self, buf: &[u8]) -> Result<usize> {
        self.write(buf).await.map_err(Error::TunWrite)
    }
}

/// Host-local DNS proxy
///
/// The tunnel interface and the resolver registration are host-global
/// resources, so only one running proxy per host is meaningful;
/// concurrent processes would fight over the device. Within one process,
/// a second `start` while running is a no-op.
///
/// The upstream configuration and hook set are captured when the proxy
/// is built; changing them means building a new proxy.
pub struct Proxy {
    config: Config,
    hooks: Arc<dyn ProxyHooks>,
    transport: Arc<dyn Transport>,
    running: Arc<AtomicBool>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    pipeline: Option<JoinHandle<()>>,
}

impl Proxy {
    /// Create a proxy from a validated configuration
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let transport = Arc::new(HttpTransport::new(&config.upstream)?);
        Ok(Self {
            config,
            hooks: Arc::new(LoggingHooks),
            transport,
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx: None,
            pipeline: None,
        })
    }

    /// Replace the default logging hooks
    pub fn with_hooks(mut self, hooks: Arc<dyn ProxyHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Replace the HTTP transport (test doubles, alternative upstreams)
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    /// Current run state
    pub fn state(&self) -> ProxyState {
        if self.running.load(Ordering::SeqCst) {
            ProxyState::Running
        } else {
            ProxyState::Stopped
        }
    }

    /// Whether the pipeline is running
    pub fn started(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Open the tunnel device and start the pipeline.
    ///
    /// Registers `tun0` as a point-to-point interface and pushes the peer
    /// address as the system resolver. Returns once the pipeline tasks
    /// are spawned; a start while running is a no-op.
    pub async fn start(&mut self) -> Result<()> {
        if self.started() {
            return Ok(());
        }

        let tun_config = TunConfig::builder()
            .name(TUN_NAME)
            .ipv4_with_dest(TUN_LOCAL_ADDR, TUN_PREFIX_LEN, DNS_ADDR)
            .dns_server(DNS_ADDR)
            .mtu(BUFFER_SIZE as u16)
            .build()?;

        let device = TunDevice::create(tun_config).await?;
        self.start_with_device(Arc::new(device)).await
    }

    /// Start the pipeline on an already-open packet device.
    ///
    /// Embedders that obtain the tunnel through other means use this
    /// directly; [`start`](Self::start) is the convenience path that
    /// opens `tun0` itself.
    pub async fn start_with_device(&mut self, device: Arc<dyn PacketDevice>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        self.hooks.on_state_change(true).await;

        // Firewall rules against DNS leaks for the lifetime of the
        // pipeline. Best effort: the proxy runs without them.
        if self.config.proxy.leak_guard {
            let helper = self
                .config
                .proxy
                .helper
                .clone()
                .unwrap_or_else(unleak::default_helper_path);
            if let Err(e) =
                unleak::spawn(helper, self.hooks.clone(), shutdown_tx.subscribe()).await
            {
                self.hooks.on_error(&e).await;
            }
        }

        let pool = Arc::new(BufferPool::new());
        let (packet_in_tx, packet_in_rx) = mpsc::channel::<Vec<u8>>(PACKET_QUEUE_DEPTH);
        let (packet_out_tx, packet_out_rx) = mpsc::channel::<Vec<u8>>(PACKET_QUEUE_DEPTH);

        spawn_reader(
            device.clone(),
            pool.clone(),
            self.hooks.clone(),
            packet_in_tx,
        );
        spawn_writer(
            device,
            pool.clone(),
            self.hooks.clone(),
            packet_out_rx,
            shutdown_tx.subscribe(),
        );

        self.pipeline = Some(spawn_dispatcher(DispatchContext {
            hooks: self.hooks.clone(),
            transport: self.transport.clone(),
            pool,
            running: self.running.clone(),
            payload_only: self.config.upstream.payload_only,
            shutdown_tx,
            packet_in_rx,
            packet_out_tx,
        }));

        Ok(())
    }

    /// Stop the pipeline.
    ///
    /// Signals the stop channel and waits for the dispatcher to wind
    /// down; a reader stuck in a blocked device read is abandoned, since
    /// dropping the handle is the only wake mechanism some drivers offer.
    /// A stop while stopped is a no-op.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(pipeline) = self.pipeline.take() {
            let _ = pipeline.await;
        }
        Ok(())
    }
}

fn spawn_reader(
    device: Arc<dyn PacketDevice>,
    pool: Arc<BufferPool>,
    hooks: Arc<dyn ProxyHooks>,
    packet_in_tx: mpsc::Sender<Vec<u8>>,
) {
    tokio::spawn(async move {
        // Reads live in their own task so the rest of the pipeline can
        // stop while a device read is still pending: on some platforms
        // dropping the handle does not wake a blocked read, which likely
        // papers over a bug in the TUN driver. An abandoned read keeps
        // its buffer until the device finally wakes or the process ends.
        loop {
            let mut buf = pool.get();
            match device.recv(&mut buf).await {
                Ok(n) => {
                    buf.truncate(n);
                    if packet_in_tx.send(buf).await.is_err() {
                        // dispatcher gone
                        return;
                    }
                }
                Err(e) => {
                    if !is_read_eof(&e) {
                        hooks.on_error(&e).await;
                    }
                    // closing packet_in ends the dispatcher
                    return;
                }
            }
        }
    });
}

fn spawn_writer(
    device: Arc<dyn PacketDevice>,
    pool: Arc<BufferPool>,
    hooks: Arc<dyn ProxyHooks>,
    mut packet_out_rx: mpsc::Receiver<Vec<u8>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        loop {
            let buf = tokio::select! {
                _ = shutdown_rx.recv() => return,
                buf = packet_out_rx.recv() => match buf {
                    Some(buf) => buf,
                    None => return,
                },
            };
            if let Err(e) = device.send(&buf).await {
                hooks.on_error(&e).await;
                // outbound frames are lost until the next start
                return;
            }
            pool.put(buf);
        }
    });
}

struct DispatchContext {
    hooks: Arc<dyn ProxyHooks>,
    transport: Arc<dyn Transport>,
    pool: Arc<BufferPool>,
    running: Arc<AtomicBool>,
    payload_only: bool,
    shutdown_tx: broadcast::Sender<()>,
    packet_in_rx: mpsc::Receiver<Vec<u8>>,
    packet_out_tx: mpsc::Sender<Vec<u8>>,
}

fn spawn_dispatcher(mut ctx: DispatchContext) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut shutdown_rx = ctx.shutdown_tx.subscribe();
        let mut dedup = Dedup::new();
        let dns_ip = DNS_ADDR.octets();

        loop {
            let buf = tokio::select! {
                _ = shutdown_rx.recv() => break,
                buf = ctx.packet_in_rx.recv() => match buf {
                    Some(buf) => buf,
                    // reader hit EOF or a fatal read error
                    None => break,
                },
            };

            if buf.len() <= wire::IPV4_HEADER_LEN {
                ctx.pool.put(buf);
                continue;
            }
            if buf[wire::IP_PROTOCOL_OFFSET] != wire::IP_PROTOCOL_UDP {
                // Not UDP
                ctx.pool.put(buf);
                continue;
            }
            if buf[wire::IP_DST_OFFSET..wire::IP_DST_OFFSET + 4] != dns_ip {
                // Skip packets not directed at us
                ctx.pool.put(buf);
                continue;
            }
            let msg_id = wire::msg_id(&buf);
            if dedup.is_duplicate(msg_id) {
                // Skip duplicated query
                ctx.pool.put(buf);
                continue;
            }

            tokio::spawn(resolve_query(QueryContext {
                hooks: ctx.hooks.clone(),
                transport: ctx.transport.clone(),
                pool: ctx.pool.clone(),
                payload_only: ctx.payload_only,
                shutdown_rx: ctx.shutdown_tx.subscribe(),
                packet_out_tx: ctx.packet_out_tx.clone(),
                msg_id,
                buf,
            }));
        }

        if ctx.running.swap(false, Ordering::SeqCst) {
            ctx.hooks.on_state_change(false).await;
        }
    })
}

struct QueryContext {
    hooks: Arc<dyn ProxyHooks>,
    transport: Arc<dyn Transport>,
    pool: Arc<BufferPool>,
    payload_only: bool,
    shutdown_rx: broadcast::Receiver<()>,
    packet_out_tx: mpsc::Sender<Vec<u8>>,
    msg_id: u16,
    buf: Vec<u8>,
}

/// Resolve one query end to end: log it, round-trip the upstream, read
/// the reply into the query's buffer and hand it to the writer.
async fn resolve_query(mut ctx: QueryContext) {
    let mut buf = ctx.buf;

    let qname = wire::qname(&buf);
    ctx.hooks.on_query(ctx.msg_id, &qname).await;

    let stripped = ctx.payload_only && buf.len() > wire::DNS_PAYLOAD_OFFSET;
    let query = if stripped {
        buf[wire::DNS_PAYLOAD_OFFSET..].to_vec()
    } else {
        buf.clone()
    };

    let mut body = match ctx.transport.round_trip(query).await {
        Ok(body) => body,
        Err(source) => {
            ctx.hooks
                .on_error(&Error::Resolve {
                    msg_id: ctx.msg_id,
                    source,
                })
                .await;
            ctx.pool.put(buf);
            return;
        }
    };

    // reuse the query's buffer for the reply, restored to full size
    buf.resize(BUFFER_SIZE, 0);
    let read = if stripped {
        // a bare DNS reply: keep the query's IP/UDP header in place and
        // read in behind it
        doh::read_dns_response(&mut *body, &mut buf[wire::DNS_PAYLOAD_OFFSET..]).await
    } else {
        // the upstream echoes full datagram framing; overwrite from the
        // start of the buffer
        doh::read_dns_response(&mut *body, &mut buf).await
    };
    let n = match read {
        Ok(n) if stripped => {
            // turn the query's header into the reply's: addresses and
            // ports swapped, lengths and checksum redone
            wire::frame_reply(&mut buf[..wire::DNS_PAYLOAD_OFFSET], n);
            wire::DNS_PAYLOAD_OFFSET + n
        }
        Ok(n) => n,
        Err(e) => {
            ctx.hooks.on_error(&Error::ResponseRead(e)).await;
            ctx.pool.put(buf);
            return;
        }
    };
    buf.truncate(n);

    tokio::select! {
        _ = ctx.shutdown_rx.recv() => {
            // stopped before handoff
            ctx.pool.put(buf);
        }
        permit = ctx.packet_out_tx.reserve() => {
            match permit {
                Ok(permit) => permit.send(buf),
                Err(_) => ctx.pool.put(buf),
            }
        }
    }
}

fn is_read_eof(err: &Error) -> bool {
    matches!(
        err,
        Error::TunRead(veil_tun::Error::Io(e))
            if e.kind() == std::io::ErrorKind::UnexpectedEof
    )
}
