//! Session coordinator: composes discovery, the peer link, and the
//! two transfer state machines behind one delegate-driven surface.
//!
//! Every socket, timer, and discovery event is serialized through a
//! single event loop ([`Session::run`]), so internal state is mutated
//! from exactly one place and needs no locking. Delegate callbacks
//! receive `&mut Session`, letting a completed transfer chain the
//! next `send_file`/`read_file` from inside the callback — the
//! request/response ping-pong the protocol is built from.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::Decoder;
use tracing::{debug, info, warn};

use crate::codec::{FrameCodec, encode_field};
use crate::connection::{LinkEvent, PeerLink, TaggedLinkEvent};
use crate::discovery::{
    self, ClientBrowse, DiscoveryEvent, HostAdvertisement, OneShot,
};
use crate::error::LinkError;
use crate::frame::{
    DEFAULT_RECEIVE_TIMEOUT, DEFAULT_STAGE_TIMEOUT, FrameField, MAX_BUFFER_SIZE, TransferUnit,
};
use crate::state::{RecvMachine, RecvProgress, SendMachine, SendProgress, SendStage};

/// Capacity for the session's accept/connect event channel.
const EVENT_QUEUE: usize = 16;

/// Capacity for the link event channel. Reads are chunked, so this
/// also bounds how far the reader task can run ahead of the loop.
const LINK_QUEUE: usize = 64;

// ── Delegate ─────────────────────────────────────────────────────

/// Callback surface implemented by the session's owner.
///
/// All asynchronous outcomes arrive here; the only synchronous
/// failures a caller ever sees are [`LinkError::Busy`] and
/// construction errors.
pub trait SessionDelegate {
    /// One inbound transfer completed.
    fn on_file_received(
        &mut self,
        session: &mut Session,
        payload: Bytes,
        type_tag: String,
        name: String,
    );

    /// One outbound transfer completed. `purpose` is the tag the
    /// caller supplied to [`Session::send_file`].
    fn on_file_written(&mut self, session: &mut Session, purpose: u32);

    /// The peer connection dropped. In-flight transfers were cleared;
    /// caller-held session data is untouched, enabling resume.
    fn on_peer_disconnected(&mut self, session: &mut Session, error: Option<LinkError>);

    /// Unrecoverable discovery/connect error, or a malformed frame.
    /// The usual response is to rebuild the session.
    fn on_failed(&mut self, session: &mut Session, error: Option<LinkError>);

    /// The listening/advertising path itself stopped. Optional.
    fn on_listener_stopped(&mut self, session: &mut Session, error: Option<LinkError>) {
        let _ = (session, error);
    }
}

// ── Lifecycle ────────────────────────────────────────────────────

/// Explicit session lifecycle. Every external-event handler refuses
/// to act unless the session is `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lifecycle {
    #[default]
    Active,
    Closing,
    Closed,
}

impl Lifecycle {
    pub fn is_active(self) -> bool {
        matches!(self, Lifecycle::Active)
    }

    pub fn is_closed(self) -> bool {
        matches!(self, Lifecycle::Closed)
    }
}

// ── Config ───────────────────────────────────────────────────────

/// Tunables for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Instance name for the advertised service record.
    pub instance: String,
    /// Deadline for each metadata stage write.
    pub stage_timeout: Duration,
    /// Inbound wait used when `read_file` passes no timeout.
    pub receive_timeout: Duration,
    /// TCP connect deadline after a service resolves.
    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            instance: "doclink".to_string(),
            stage_timeout: DEFAULT_STAGE_TIMEOUT,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

// ── Internal events ──────────────────────────────────────────────

#[derive(Debug)]
enum SessionEvent {
    /// Host: the accept loop produced a connection.
    Accepted(TcpStream, SocketAddr),
    /// Host: the accept loop died.
    ListenerStopped(Option<LinkError>),
    /// Client: outbound connect finished.
    Connected(TcpStream, SocketAddr),
    /// Client: outbound connect failed.
    ConnectFailed(LinkError),
    /// Bridged discovery outcome.
    Discovery(DiscoveryEvent),
    /// Something from the peer link's I/O tasks.
    Link(TaggedLinkEvent),
    /// The armed receive stage missed its deadline.
    RecvStageTimedOut,
    /// `disconnect()` dropped the link locally.
    LocalDisconnected,
    /// A read was armed while bytes were already buffered.
    DrainReceiveBuffer,
}

#[derive(Debug)]
enum Role {
    Host {
        advert: Option<HostAdvertisement>,
        accept_task: JoinHandle<()>,
    },
    Client {
        browse: Option<ClientBrowse>,
        awaiting_search: OneShot,
    },
}

// ── Session ──────────────────────────────────────────────────────

/// The public-facing protocol engine: one discovery attempt, at most
/// one peer connection, one transfer in flight per direction.
#[derive(Debug)]
pub struct Session {
    lifecycle: Lifecycle,
    config: SessionConfig,
    role: Role,
    listen_addr: Option<SocketAddr>,

    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: mpsc::Receiver<SessionEvent>,
    link_tx: mpsc::Sender<TaggedLinkEvent>,
    link_rx: mpsc::Receiver<TaggedLinkEvent>,
    // Kept so the discovery channel never closes while the session
    // lives, even when no discovery handle holds a sender.
    _disco_tx: mpsc::Sender<DiscoveryEvent>,
    disco_rx: mpsc::Receiver<DiscoveryEvent>,
    /// Locally generated events, delivered before awaiting I/O.
    pending: VecDeque<SessionEvent>,

    link: Option<PeerLink>,
    next_generation: u64,
    codec: FrameCodec,
    recv_buf: BytesMut,
    send: SendMachine,
    recv: RecvMachine,
    recv_deadline: Option<Instant>,
}

impl Session {
    // ── Constructors ─────────────────────────────────────────────

    /// Host mode: bind an ephemeral listening port and advertise it
    /// on the local network.
    pub async fn host(config: SessionConfig) -> Result<Self, LinkError> {
        let listener = TcpListener::bind(("0.0.0.0", 0)).await?;
        Self::host_inner(listener, config, true)
    }

    /// Host mode without the mDNS advertisement, for peers that learn
    /// the address some other way. See [`Session::listen_addr`].
    pub async fn host_unadvertised(config: SessionConfig) -> Result<Self, LinkError> {
        let listener = TcpListener::bind(("0.0.0.0", 0)).await?;
        Self::host_inner(listener, config, false)
    }

    fn host_inner(
        listener: TcpListener,
        config: SessionConfig,
        advertise: bool,
    ) -> Result<Self, LinkError> {
        let listen_addr = listener.local_addr()?;
        info!(%listen_addr, "listening");

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (link_tx, link_rx) = mpsc::channel(LINK_QUEUE);
        let (disco_tx, disco_rx) = discovery::event_channel();

        let advert = if advertise {
            Some(HostAdvertisement::register(
                &config.instance,
                listen_addr.port(),
                disco_tx.clone(),
            )?)
        } else {
            None
        };
        let accept_task = spawn_accept(listener, events_tx.clone());

        Ok(Self {
            lifecycle: Lifecycle::Active,
            config,
            role: Role::Host {
                advert,
                accept_task,
            },
            listen_addr: Some(listen_addr),
            events_tx,
            events_rx,
            link_tx,
            link_rx,
            _disco_tx: disco_tx,
            disco_rx,
            pending: VecDeque::new(),
            link: None,
            next_generation: 0,
            codec: FrameCodec::new(),
            recv_buf: BytesMut::new(),
            send: SendMachine::new(),
            recv: RecvMachine::new(),
            recv_deadline: None,
        })
    }

    /// Client mode: browse for a host and connect to the first one
    /// that resolves.
    pub fn client(config: SessionConfig) -> Result<Self, LinkError> {
        let (disco_tx, disco_rx) = discovery::event_channel();
        let browse = ClientBrowse::start(disco_tx.clone())?;
        Ok(Self::client_inner(
            config,
            Role::Client {
                browse: Some(browse),
                awaiting_search: OneShot::new(),
            },
            disco_tx,
            disco_rx,
        ))
    }

    /// Client mode with a known peer address, skipping discovery.
    pub fn client_direct(addr: SocketAddr, config: SessionConfig) -> Self {
        let (disco_tx, disco_rx) = discovery::event_channel();
        let session = Self::client_inner(
            config,
            Role::Client {
                browse: None,
                awaiting_search: OneShot::spent(),
            },
            disco_tx,
            disco_rx,
        );
        spawn_connect(
            addr,
            session.config.connect_timeout,
            session.events_tx.clone(),
        );
        session
    }

    fn client_inner(
        config: SessionConfig,
        role: Role,
        disco_tx: mpsc::Sender<DiscoveryEvent>,
        disco_rx: mpsc::Receiver<DiscoveryEvent>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (link_tx, link_rx) = mpsc::channel(LINK_QUEUE);
        Self {
            lifecycle: Lifecycle::Active,
            config,
            role,
            listen_addr: None,
            events_tx,
            events_rx,
            link_tx,
            link_rx,
            _disco_tx: disco_tx,
            disco_rx,
            pending: VecDeque::new(),
            link: None,
            next_generation: 0,
            codec: FrameCodec::new(),
            recv_buf: BytesMut::new(),
            send: SendMachine::new(),
            recv: RecvMachine::new(),
            recv_deadline: None,
        }
    }

    // ── Introspection ────────────────────────────────────────────

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Bound listening address (host roles only).
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    pub fn is_sending(&self) -> bool {
        self.send.is_busy()
    }

    pub fn is_receiving(&self) -> bool {
        self.recv.is_busy()
    }

    // ── Operations ───────────────────────────────────────────────

    /// Queue one outbound transfer.
    ///
    /// Fails with [`LinkError::Busy`] while a send is in flight.
    /// Transmission starts immediately if a peer link exists and is
    /// otherwise deferred until one is established.
    pub fn send_file(
        &mut self,
        payload: Bytes,
        type_tag: impl Into<String>,
        name: impl Into<String>,
        purpose: u32,
    ) -> Result<(), LinkError> {
        if !self.lifecycle.is_active() {
            return Err(LinkError::Closed);
        }
        let unit = TransferUnit::new(payload, type_tag, name, purpose)?;
        debug!(purpose = unit.purpose, size = unit.size, "send queued");
        self.send.begin(unit)?;
        if self.link.is_some() {
            self.flush_outbound();
        }
        Ok(())
    }

    /// Arm one inbound transfer.
    ///
    /// Fails with [`LinkError::Busy`] while a receive is being
    /// assembled. `timeout` bounds how long the peer may take to
    /// start the transfer and to deliver the payload (a CLI peer
    /// waiting on a human may pass hours); `None` uses the session
    /// default. Deferred until a link exists when called early.
    pub fn read_file(&mut self, timeout: Option<Duration>) -> Result<(), LinkError> {
        if !self.lifecycle.is_active() {
            return Err(LinkError::Closed);
        }
        self.recv.begin(timeout, self.config.receive_timeout)?;
        if self.link.is_some() {
            self.arm_recv_deadline();
            if !self.recv_buf.is_empty() {
                self.pending.push_back(SessionEvent::DrainReceiveBuffer);
            }
        }
        Ok(())
    }

    /// Drop only the active peer connection, keeping discovery and
    /// the listening path alive. Used when the caller detects a
    /// session-identity mismatch. In-flight transfers are cleared;
    /// `on_peer_disconnected(None)` fires on the next loop turn.
    pub fn disconnect(&mut self) {
        if !self.lifecycle.is_active() {
            return;
        }
        if self.link.take().is_some() {
            info!("disconnecting upon request");
            self.reset_transfer_state();
            self.pending.push_back(SessionEvent::LocalDisconnected);
        }
    }

    /// Tear everything down: discovery, the listening/advertising
    /// path, and any active peer connection. Idempotent.
    pub fn close(&mut self) {
        if self.lifecycle.is_closed() {
            return;
        }
        self.lifecycle = Lifecycle::Closing;
        info!("closing session");
        match &mut self.role {
            Role::Host {
                advert,
                accept_task,
            } => {
                if let Some(advert) = advert.take() {
                    advert.shutdown();
                }
                accept_task.abort();
            }
            Role::Client { browse, .. } => {
                if let Some(browse) = browse.take() {
                    browse.shutdown();
                }
            }
        }
        self.link = None;
        self.reset_transfer_state();
        self.pending.clear();
        self.lifecycle = Lifecycle::Closed;
    }

    // ── Event loop ───────────────────────────────────────────────

    /// Drive the session until it is closed.
    pub async fn run<D: SessionDelegate>(&mut self, delegate: &mut D) {
        while self.process_next(delegate).await {}
    }

    /// Handle exactly one event. Returns `false` once the session is
    /// closed.
    pub async fn process_next<D: SessionDelegate>(&mut self, delegate: &mut D) -> bool {
        let Some(event) = self.next_event().await else {
            return false;
        };
        self.handle_event(event, delegate);
        !self.lifecycle.is_closed()
    }

    async fn next_event(&mut self) -> Option<SessionEvent> {
        if !self.lifecycle.is_active() {
            return None;
        }
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }
        let deadline = self.recv_deadline;
        tokio::select! {
            Some(event) = self.events_rx.recv() => Some(event),
            Some(event) = self.link_rx.recv() => Some(SessionEvent::Link(event)),
            Some(event) = self.disco_rx.recv() => Some(SessionEvent::Discovery(event)),
            _ = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            } => Some(SessionEvent::RecvStageTimedOut),
            else => None,
        }
    }

    fn handle_event<D: SessionDelegate>(&mut self, event: SessionEvent, delegate: &mut D) {
        if !self.lifecycle.is_active() {
            return;
        }
        match event {
            SessionEvent::Accepted(stream, addr) => self.on_accepted(stream, addr),
            SessionEvent::ListenerStopped(error) => {
                warn!("stopped listening");
                delegate.on_listener_stopped(self, error);
            }
            SessionEvent::Connected(stream, addr) => self.on_connected(stream, addr),
            SessionEvent::ConnectFailed(error) => {
                warn!(error = %error, "connect failed");
                delegate.on_failed(self, Some(error));
            }
            SessionEvent::Discovery(event) => self.on_discovery(event, delegate),
            SessionEvent::Link(tagged) => self.on_link_event(tagged, delegate),
            SessionEvent::RecvStageTimedOut => self.on_recv_timeout(delegate),
            SessionEvent::LocalDisconnected => delegate.on_peer_disconnected(self, None),
            SessionEvent::DrainReceiveBuffer => self.drain_receive_buffer(delegate),
        }
    }

    // ── Connection establishment ─────────────────────────────────

    fn on_accepted(&mut self, stream: TcpStream, addr: SocketAddr) {
        if self.link.is_some() {
            // One peer at a time; the active connection is untouched.
            info!(%addr, "busy, rejected incoming connection");
            return;
        }
        info!(%addr, "accepted incoming connection");
        self.install_link(stream);
        // The client's opening send must always find a reader armed.
        if !self.recv.is_busy() {
            let _ = self.recv.begin(None, self.config.receive_timeout);
        }
        self.arm_recv_deadline();
        self.flush_outbound();
    }

    fn on_connected(&mut self, stream: TcpStream, addr: SocketAddr) {
        if self.link.is_some() {
            debug!(%addr, "already connected, ignoring");
            return;
        }
        info!(%addr, "connected");
        self.install_link(stream);
        if self.recv.is_busy() {
            // A read armed before the link existed starts now.
            self.arm_recv_deadline();
        }
        self.flush_outbound();
    }

    fn install_link(&mut self, stream: TcpStream) {
        self.next_generation += 1;
        self.codec.reset();
        self.recv_buf.clear();
        self.link = Some(PeerLink::new(
            stream,
            self.next_generation,
            self.link_tx.clone(),
        ));
    }

    // ── Discovery ────────────────────────────────────────────────

    fn on_discovery<D: SessionDelegate>(&mut self, event: DiscoveryEvent, delegate: &mut D) {
        match event {
            DiscoveryEvent::Resolved(addr) => {
                let Role::Client {
                    awaiting_search, ..
                } = &mut self.role
                else {
                    return;
                };
                if !awaiting_search.consume() {
                    debug!(%addr, "duplicate resolution ignored");
                    return;
                }
                info!(%addr, "service resolved, connecting");
                spawn_connect(addr, self.config.connect_timeout, self.events_tx.clone());
            }
            DiscoveryEvent::Failed(error) => {
                warn!(error = %error, "discovery failed");
                delegate.on_failed(self, Some(error));
            }
            DiscoveryEvent::SearchStopped => {
                let still_expected = matches!(
                    &self.role,
                    Role::Client { awaiting_search, .. } if awaiting_search.is_armed()
                );
                if still_expected {
                    warn!("search stopped before a service resolved");
                    delegate.on_failed(
                        self,
                        Some(LinkError::Discovery("search stopped".into())),
                    );
                }
            }
        }
    }

    // ── Peer link ────────────────────────────────────────────────

    fn on_link_event<D: SessionDelegate>(&mut self, tagged: TaggedLinkEvent, delegate: &mut D) {
        let current = self.link.as_ref().map(PeerLink::generation);
        if current != Some(tagged.generation) {
            debug!(generation = tagged.generation, "stale link event ignored");
            return;
        }
        match tagged.event {
            LinkEvent::Bytes(bytes) => {
                self.recv_buf.extend_from_slice(&bytes);
                self.drain_receive_buffer(delegate);
                if self.recv_buf.len() > MAX_BUFFER_SIZE {
                    self.on_buffer_overflow(delegate);
                }
            }
            LinkEvent::StageWritten(stage) => match self.send.on_stage_written(stage) {
                Some(SendProgress::Next { stage, field }) => self.queue_stage(stage, field),
                Some(SendProgress::Done { purpose }) => {
                    info!(purpose, "file sent");
                    delegate.on_file_written(self, purpose);
                }
                None => {}
            },
            LinkEvent::Closed(error) => {
                info!("peer disconnected");
                self.link = None;
                self.reset_transfer_state();
                delegate.on_peer_disconnected(self, error);
            }
        }
    }

    /// Decode as much of the buffer as the armed receive will take.
    /// Bytes with no read armed stay buffered until `read_file`.
    fn drain_receive_buffer<D: SessionDelegate>(&mut self, delegate: &mut D) {
        while self.recv.is_busy() {
            let field = match self.codec.decode(&mut self.recv_buf) {
                Ok(Some(field)) => field,
                Ok(None) => break,
                Err(error) => {
                    self.on_malformed(error, delegate);
                    return;
                }
            };
            match self.recv.on_field(field) {
                Ok(RecvProgress::Continue) => self.arm_recv_deadline(),
                Ok(RecvProgress::Done(file)) => {
                    self.recv_deadline = None;
                    info!(
                        type_tag = %file.type_tag,
                        size = file.payload.len(),
                        "file received"
                    );
                    delegate.on_file_received(self, file.payload, file.type_tag, file.name);
                    // The delegate may have armed the next read; if
                    // so the loop keeps draining.
                }
                Err(error) => {
                    self.on_malformed(error, delegate);
                    return;
                }
            }
        }
    }

    /// A protocol error is reported, not fatal: the inbound slot is
    /// cleared and the connection stays up (resync is impossible, so
    /// the stale buffer is discarded with it).
    fn on_malformed<D: SessionDelegate>(&mut self, error: LinkError, delegate: &mut D) {
        warn!(error = %error, "malformed frame");
        self.recv.clear();
        self.codec.reset();
        self.recv_buf.clear();
        self.recv_deadline = None;
        delegate.on_failed(self, Some(error));
    }

    /// More than a full frame's worth of bytes piled up with nothing
    /// consuming them. The peer is flooding or the stream is garbage;
    /// either way it gets dropped.
    fn on_buffer_overflow<D: SessionDelegate>(&mut self, delegate: &mut D) {
        let buffered = self.recv_buf.len() as u64;
        warn!(buffered, "receive buffer overflowed, dropping peer");
        self.link = None;
        self.reset_transfer_state();
        delegate.on_peer_disconnected(
            self,
            Some(LinkError::PayloadTooLarge {
                size: buffered,
                max: MAX_BUFFER_SIZE as u64,
            }),
        );
    }

    fn on_recv_timeout<D: SessionDelegate>(&mut self, delegate: &mut D) {
        let budget = self.recv.stage_timeout();
        warn!(?budget, "receive stage timed out, dropping peer");
        self.link = None;
        self.reset_transfer_state();
        delegate.on_peer_disconnected(self, Some(LinkError::Timeout(budget)));
    }

    // ── Outbound staging ─────────────────────────────────────────

    fn flush_outbound(&mut self) {
        if let Some((stage, field)) = self.send.start() {
            self.queue_stage(stage, field);
        }
    }

    fn queue_stage(&mut self, stage: SendStage, field: FrameField) {
        let (generation, queued) = match self.link.as_ref() {
            Some(link) => (
                link.generation(),
                link.queue_write(stage, encode_field(field), self.config.stage_timeout),
            ),
            None => return,
        };
        if queued.is_err() {
            // The writer task is gone; treat it as a dropped peer.
            self.pending.push_back(SessionEvent::Link(TaggedLinkEvent {
                generation,
                event: LinkEvent::Closed(Some(LinkError::Disconnected)),
            }));
        }
    }

    fn arm_recv_deadline(&mut self) {
        if self.recv.is_busy() && self.link.is_some() {
            self.recv_deadline = Some(Instant::now() + self.recv.stage_timeout());
        }
    }

    fn reset_transfer_state(&mut self) {
        self.send.clear();
        self.recv.clear();
        self.codec.reset();
        self.recv_buf.clear();
        self.recv_deadline = None;
    }
}

// ── Spawned helpers ──────────────────────────────────────────────

fn spawn_accept(listener: TcpListener, events: mpsc::Sender<SessionEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    if events
                        .send(SessionEvent::Accepted(stream, addr))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    let _ = events
                        .send(SessionEvent::ListenerStopped(Some(e.into())))
                        .await;
                    break;
                }
            }
        }
    })
}

fn spawn_connect(addr: SocketAddr, connect_timeout: Duration, events: mpsc::Sender<SessionEvent>) {
    tokio::spawn(async move {
        let event = match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => SessionEvent::Connected(stream, addr),
            Ok(Err(e)) => SessionEvent::ConnectFailed(e.into()),
            Err(_) => SessionEvent::ConnectFailed(LinkError::Timeout(connect_timeout)),
        };
        let _ = events.send(event).await;
    });
}
