use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::stream::{FuturesUnordered, StreamExt};
use hickory_proto::op::Message;
use hickory_proto::rr::{RData, Record, RecordType};
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::Instrument;
use crate::config::{ConfigError, DiscoveryConfig};
use crate::peer::{Peer, Topic};
use crate::secrets::{SecretRing, TokenValidity};
use crate::session::{SessionReport, TrackerSession, TrackerSlot, VisitKind};
use crate::store::PeerStore;
use crate::transport::{Inbound, MulticastTransport, TransportError, UdpTransport};
use crate::wire::{self, TxtData};

// Secrets rotate on this cadence; cached tracker tokens die with the
// generation that issued them.
const ROTATE_INTERVAL: Duration = Duration::from_secs(300);

const DEFAULT_LISTEN_PORTS: [u16; 2] = [53, 5300];

// Sample sizes for responder answers and pushes.
const TXT_SAMPLE: usize = 100;
const ADDR_SAMPLE: usize = 10;
const PUSH_SAMPLE: usize = 16;
const PUSH_RETRIES: u32 = 2;
const WHOAMI_RETRIES: u32 = 2;

pub type Result<T> = std::result::Result<T, DiscoveryError>;
pub type EventRx = mpsc::UnboundedReceiver<DiscoveryEvent>;

#[derive(thiserror::Error, Debug)]
pub enum DiscoveryError {

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("already listening")]
    AlreadyListening,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // No fan-out leg produced a decodable response.
    #[error("Query failed")]
    QueryFailed,

    #[error("Probe failed")]
    ProbeFailed,

    #[error("Inconsistent remote port/host")]
    InconsistentObservation,

    #[error("instance closed")]
    Closed,

}

#[derive(Debug)]
pub enum DiscoveryEvent {

    Peer { topic: Topic, peer: Peer },

    // Transport faults; reported, never fatal to the instance.
    Error(DiscoveryError),

    Listening,

    Close,

}

enum Command {
    Visit { kind: VisitKind, topic: Topic, port: u16, done: oneshot::Sender<Result<()>> },
    Listen { ports: Vec<u16>, done: oneshot::Sender<Result<Vec<SocketAddr>>> },
    Whoami { done: oneshot::Sender<Result<Peer>> },
    ToJson { done: oneshot::Sender<serde_json::Value> },
    Destroy { done: oneshot::Sender<()> },
}

// Handle to a discovery instance. All state lives in a single actor
// task; the handle is cheap to clone and is usable from any task.
#[derive(Clone)]
pub struct Discovery {

    cmd_tx: mpsc::UnboundedSender<Command>,

    instance_id: String,

}

impl Discovery {

    // Spawns the instance and returns the handle plus its event stream.
    pub async fn new(config: DiscoveryConfig) -> Result<(Self, EventRx)> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (session_tx, session_rx) = mpsc::unbounded_channel();

        // Client-side socket for probes, visits and pushes.
        let bind: SocketAddr = (Ipv4Addr::UNSPECIFIED, 0).into();
        let (primary, primary_task) = UdpTransport::bind(bind, inbound_tx.clone()).await?;

        let (mdns, mdns_task) = if config.multicast {
            match MulticastTransport::bind(inbound_tx.clone()) {
                Ok((mdns, task)) => (Some(mdns), Some(task)),
                Err(e) => {
                    tracing::warn!("multicast disabled: {}", e);
                    events_tx.send(DiscoveryEvent::Error(e.into())).ok();
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        let mut id = [0u8; 32];
        rand::thread_rng().fill(&mut id[..]);
        let instance_id = BASE64.encode(id);

        let instance = Instance {
            trackers: config.trackers.iter().map(TrackerSlot::new).collect(),
            peers: PeerStore::new(config.ttl, config.limit),
            subscribers: PeerStore::new(Some(config.subscriber_ttl), config.subscriber_limit),
            secrets: SecretRing::new(),
            tick: 0,
            listening: false,
            local_host: primary_ipv4(),
            primary,
            server_tasks: vec![primary_task],
            mdns,
            mdns_task,
            cmd_rx,
            inbound_tx,
            inbound_rx,
            session_tx,
            session_rx,
            events: events_tx,
            config,
        };

        let span = tracing::info_span!("discovery", id = %&instance_id[..8]);
        tokio::spawn(instance.run().instrument(span));

        Ok((Discovery { cmd_tx, instance_id }, events_rx))
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub async fn announce(&self, topic: impl Into<Topic>, port: u16) -> Result<()> {
        self.visit(VisitKind::Announce, topic.into(), port).await
    }

    pub async fn unannounce(&self, topic: impl Into<Topic>, port: u16) -> Result<()> {
        self.visit(VisitKind::Unannounce, topic.into(), port).await
    }

    pub async fn lookup(&self, topic: impl Into<Topic>) -> Result<()> {
        self.visit(VisitKind::Lookup, topic.into(), 0).await
    }

    // Binds server sockets and flips the instance into tracker mode.
    // May be called at most once; empty `ports` means [53, 5300].
    pub async fn listen(&self, ports: &[u16]) -> Result<Vec<SocketAddr>> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Listen { ports: ports.to_vec(), done })?;
        rx.await.map_err(|_| DiscoveryError::Closed)?
    }

    // Cross-checks how the configured trackers see our host:port.
    pub async fn whoami(&self) -> Result<Peer> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Whoami { done })?;
        rx.await.map_err(|_| DiscoveryError::Closed)?
    }

    pub async fn to_json(&self) -> Result<serde_json::Value> {
        let (done, rx) = oneshot::channel();
        self.send(Command::ToJson { done })?;
        rx.await.map_err(|_| DiscoveryError::Closed)
    }

    // Tears down every socket and the rotation timer; "close" is
    // emitted exactly once. Safe to call on an already-closed instance.
    pub async fn destroy(&self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Destroy { done }).is_err() {
            return Ok(());
        }
        rx.await.ok();
        Ok(())
    }

    async fn visit(&self, kind: VisitKind, topic: Topic, port: u16) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Visit { kind, topic, port, done })?;
        rx.await.map_err(|_| DiscoveryError::Closed)?
    }

    fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx.send(cmd).map_err(|_| DiscoveryError::Closed)
    }
}

struct Instance {

    config: DiscoveryConfig,

    trackers: Vec<TrackerSlot>,

    peers: PeerStore,

    // Who to push fresh registrations to, per topic.
    subscribers: PeerStore,

    secrets: SecretRing,

    // Monotonic rotation tick; tokens cached before the current tick
    // are stale.
    tick: u64,

    listening: bool,

    // Our primary interface address, substituted for 0.0.0.0 in
    // A answers.
    local_host: Option<Ipv4Addr>,

    primary: UdpTransport,

    server_tasks: Vec<JoinHandle<()>>,

    mdns: Option<MulticastTransport>,

    mdns_task: Option<JoinHandle<()>>,

    cmd_rx: mpsc::UnboundedReceiver<Command>,

    inbound_tx: mpsc::UnboundedSender<Inbound>,

    inbound_rx: mpsc::UnboundedReceiver<Inbound>,

    session_tx: mpsc::UnboundedSender<SessionReport>,

    session_rx: mpsc::UnboundedReceiver<SessionReport>,

    events: mpsc::UnboundedSender<DiscoveryEvent>,

}

impl Instance {

    async fn run(mut self) {
        let mut rotate = time::interval_at(
            time::Instant::now() + ROTATE_INTERVAL,
            ROTATE_INTERVAL,
        );

        loop {
            tokio::select! {

                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle_command(cmd).await {
                            break;
                        }
                    }
                    // Every handle dropped: tear down.
                    None => break,
                },

                Some(inbound) = self.inbound_rx.recv() => {
                    self.handle_inbound(inbound).await;
                }

                Some(report) = self.session_rx.recv() => {
                    self.handle_report(report);
                }

                _ = rotate.tick() => self.rotate(),

            }
        }

        self.shutdown();
    }

    // True when the instance should shut down.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {

            Command::Visit { kind, topic, port, done } => {
                self.start_visit(kind, topic, port, done);
            }

            Command::Listen { ports, done } => {
                done.send(self.listen(&ports).await).ok();
            }

            Command::Whoami { done } => self.start_whoami(done),

            Command::ToJson { done } => {
                done.send(self.peers.to_json()).ok();
            }

            Command::Destroy { done } => {
                done.send(()).ok();
                return true;
            }

        }
        false
    }

    async fn listen(&mut self, ports: &[u16]) -> Result<Vec<SocketAddr>> {
        if self.listening {
            return Err(DiscoveryError::AlreadyListening);
        }
        let ports: &[u16] = if ports.is_empty() { &DEFAULT_LISTEN_PORTS } else { ports };

        let mut bound = Vec::with_capacity(ports.len());
        for &port in ports {
            let addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, port).into();
            let (transport, task) = UdpTransport::bind(addr, self.inbound_tx.clone()).await?;
            let addr = transport.local_addr()?;
            tracing::info!("listening on {}", addr);
            bound.push(addr);
            self.server_tasks.push(task);
        }

        self.listening = true;
        self.events.send(DiscoveryEvent::Listening).ok();
        Ok(bound)
    }

    // One logical operation across every tracker plus the local link.
    // The local store is mirrored synchronously so we answer on our own
    // behalf before any tracker has confirmed.
    fn start_visit(&mut self, kind: VisitKind, topic: Topic, port: u16, done: oneshot::Sender<Result<()>>) {
        match kind {
            VisitKind::Announce => {
                self.peers.add(&topic, Peer::new(Ipv4Addr::UNSPECIFIED, port));
            }
            VisitKind::Unannounce => {
                self.peers.remove(&topic, Peer::new(Ipv4Addr::UNSPECIFIED, port));
            }
            VisitKind::Lookup => {}
        }

        let sessions: Vec<TrackerSession> = self
            .trackers
            .iter()
            .enumerate()
            .map(|(slot, state)| {
                TrackerSession::new(
                    slot,
                    state,
                    self.config.domain.clone(),
                    self.config.implied_port,
                    self.config.retries,
                    self.primary.clone(),
                    self.session_tx.clone(),
                )
            })
            .collect();

        // Unannounces stay off the link.
        let mdns = if kind == VisitKind::Unannounce { None } else { self.mdns.clone() };
        let domain = self.config.domain.clone();

        tokio::spawn(async move {
            if let Some(mdns) = mdns {
                // Settles on send; never counts as a response.
                match wire::topic_name(&topic, &domain) {
                    Ok(name) => {
                        let query = wire::new_query(name, RecordType::TXT);
                        if let Err(e) = mdns.query(query).await {
                            tracing::debug!("mdns query failed: {}", e);
                        }
                    }
                    Err(e) => tracing::warn!("bad topic name: {}", e),
                }
            }

            let legs = sessions.into_iter().map(|mut session| {
                let topic = topic.clone();
                async move {
                    if session.has_token() {
                        session.send(kind, &topic, port).await
                    } else {
                        session.probe_and_send(kind, &topic, port).await
                    }
                }
            });
            let results = futures::future::join_all(legs).await;

            let ok = results.iter().any(|r| r.is_ok());
            done.send(if ok { Ok(()) } else { Err(DiscoveryError::QueryFailed) }).ok();
        });
    }

    fn start_whoami(&mut self, done: oneshot::Sender<Result<Peer>>) {
        // A single tracker has no independent cross-check.
        if self.trackers.len() < 2 {
            done.send(Err(DiscoveryError::ProbeFailed)).ok();
            return;
        }

        let sessions: Vec<TrackerSession> = self
            .trackers
            .iter()
            .enumerate()
            .map(|(slot, state)| {
                TrackerSession::new(
                    slot,
                    state,
                    self.config.domain.clone(),
                    self.config.implied_port,
                    WHOAMI_RETRIES,
                    self.primary.clone(),
                    self.session_tx.clone(),
                )
            })
            .collect();

        tokio::spawn(async move {
            let mut probes: FuturesUnordered<_> = sessions
                .into_iter()
                .map(|mut session| async move { session.probe().await })
                .collect();

            let mut prev = None;
            let mut result = Err(DiscoveryError::ProbeFailed);
            while let Some(probed) = probes.next().await {
                let Ok((data, from)) = probed else { continue };
                let Some(observed) = data.observed() else { continue };
                let Some(src) = src_host(from) else { continue };
                if let Some(outcome) = whoami_step(&mut prev, src, observed) {
                    result = outcome;
                    break;
                }
            }
            done.send(result).ok();
        });
    }

    async fn handle_inbound(&mut self, inbound: Inbound) {
        match inbound {

            Inbound::UnicastQuery { msg, from, socket } => {
                self.on_query(&msg, from, Responder::Unicast(socket)).await;
            }

            Inbound::UnicastResponse { msg, from } => {
                let via = self.primary.clone();
                self.ingest_sections(&msg, from, &via);
            }

            Inbound::MulticastQuery { msg, from } => {
                self.on_query(&msg, from, Responder::Multicast).await;
            }

            Inbound::MulticastResponse { msg, from } => {
                let via = self.primary.clone();
                self.ingest_sections(&msg, from, &via);
            }

            Inbound::Fault(e) => {
                tracing::warn!("transport fault: {}", e);
                self.events.send(DiscoveryEvent::Error(e.into())).ok();
            }

        }
    }

    // Slot state reported back from fan-out legs.
    fn handle_report(&mut self, report: SessionReport) {
        match report {

            SessionReport::Port { slot, port } => {
                if let Some(state) = self.trackers.get_mut(slot) {
                    state.port = port;
                    state.secondary_port = 0;
                }
            }

            SessionReport::Token { slot, token } => {
                if let Some(state) = self.trackers.get_mut(slot) {
                    state.token = Some(token);
                    state.token_age = self.tick;
                }
            }

            SessionReport::Reply { slot, msg, from } => {
                self.parse_tracker_reply(slot, &msg, from);
            }

        }
    }

    // A tracker's reply to one of our visits: refresh the slot's token
    // and surface any peers it packed into the TXT answers.
    fn parse_tracker_reply(&mut self, slot: usize, msg: &Message, from: SocketAddr) {
        let Some(src) = src_host(from) else { return };

        for answer in msg.answers() {
            let Some(txt) = wire::txt_rdata(answer) else { continue };
            let Some(data) = TxtData::decode(txt) else { continue };

            if let Some(token) = &data.token {
                if let Some(state) = self.trackers.get_mut(slot) {
                    state.token = Some(token.clone());
                    state.token_age = self.tick;
                }
            }

            let Some(topic) = wire::topic_from_name(answer.name(), &self.config.domain) else {
                continue;
            };
            if let Some(peers) = data.peer_list() {
                for peer in peers {
                    self.emit_peer(&topic, peer.resolve(src));
                }
            }
        }
    }

    // Answer inbound questions from the peer store and run every
    // answer/additional through the ingester. Unicast queries always
    // get a reply; multicast replies are suppressed when there is
    // nothing to say.
    async fn on_query(&mut self, msg: &Message, from: SocketAddr, responder: Responder) {
        let via = match &responder {
            Responder::Unicast(socket) => socket.clone(),
            Responder::Multicast => self.primary.clone(),
        };
        self.ingest_sections(msg, from, &via);

        let Some(src) = src_host(from) else { return };
        let multicast = matches!(responder, Responder::Multicast);
        let ttl = self.config.record_ttl();
        let mut reply = wire::new_response(msg);

        for question in msg.queries() {
            let name = question.name().clone();
            // The bare domain is the probe question; everything else
            // must carry a topic or is ignored.
            let probe = wire::is_domain(question.name(), &self.config.domain);
            let topic = wire::topic_from_name(question.name(), &self.config.domain);

            match question.query_type() {

                RecordType::TXT if probe => {
                    // Token handoff plus the sender's own address as
                    // we see it.
                    let data = TxtData {
                        token: Some(self.secrets.issue(src)),
                        host: Some(src.to_string()),
                        port: Some(from.port().to_string()),
                        ..Default::default()
                    };
                    reply.add_answer(wire::txt_record(name, ttl, &data));
                }

                RecordType::TXT => {
                    let Some(topic) = topic else { continue };
                    let packed = self.peers.sample_packed(&topic, TXT_SAMPLE);
                    if multicast && packed.is_empty() {
                        // Keep the link quiet.
                        continue;
                    }
                    let data = TxtData {
                        token: Some(self.secrets.issue(src)),
                        peers: Some(wire::encode_peers(&packed)),
                        ..Default::default()
                    };
                    reply.add_answer(wire::txt_record(name, ttl, &data));
                }

                RecordType::A => {
                    let Some(topic) = topic else { continue };
                    for peer in self.peers.sample(&topic, ADDR_SAMPLE) {
                        let host = if peer.is_unspecified() {
                            match self.local_host {
                                Some(local) => local,
                                None => continue,
                            }
                        } else {
                            peer.host
                        };
                        reply.add_answer(wire::a_record(name.clone(), ttl, host));
                    }
                }

                RecordType::SRV => {
                    let Some(topic) = topic else { continue };
                    for peer in self.peers.sample(&topic, ADDR_SAMPLE) {
                        match wire::srv_record(name.clone(), ttl, peer.port, &peer.host.to_string()) {
                            Ok(record) => { reply.add_answer(record); }
                            Err(e) => tracing::debug!("bad srv target: {}", e),
                        }
                    }
                }

                _ => {}
            }
        }

        let sent = match responder {
            Responder::Unicast(socket) => socket.respond(reply, from).await,
            Responder::Multicast => {
                if reply.answers().is_empty() {
                    return;
                }
                match &self.mdns {
                    Some(mdns) => mdns.respond(reply).await,
                    None => return,
                }
            }
        };
        if let Err(e) = sent {
            tracing::debug!("response to {} failed: {}", from, e);
        }
    }

    fn ingest_sections(&mut self, msg: &Message, from: SocketAddr, via: &UdpTransport) {
        for record in msg.answers().iter().chain(msg.additionals()) {
            self.ingest_record(record, from, via);
        }
    }

    // The answer ingester: the same logic runs for answers from both
    // transports and for the additionals of inbound queries.
    fn ingest_record(&mut self, record: &Record, from: SocketAddr, via: &UdpTransport) {
        let Some(src) = src_host(from) else { return };
        let Some(topic) = wire::topic_from_name(record.name(), &self.config.domain) else {
            return;
        };

        match record.data() {

            Some(RData::SRV(srv)) => {
                // Targets that are not dotted-quad IPv4 are dropped.
                let mut target = srv.target().to_ascii();
                if target.ends_with('.') {
                    target.pop();
                }
                let Ok(host) = target.parse::<Ipv4Addr>() else { return };
                let port = if srv.port() == 0 { from.port() } else { srv.port() };
                self.emit_peer(&topic, Peer::new(host, port).resolve(src));
            }

            Some(RData::TXT(txt)) => {
                let Some(data) = TxtData::decode(txt) else { return };

                let validity = data
                    .token
                    .as_deref()
                    .map(|token| self.secrets.validate(token, src))
                    .unwrap_or(TokenValidity::Invalid);

                // A token we did not just issue means this is another
                // peer's payload, not an echo of our own answer.
                if validity != TokenValidity::Fresh {
                    if let Some(peers) = data.peer_list() {
                        for peer in peers {
                            self.emit_peer(&topic, peer.resolve(src));
                        }
                    }
                }

                if !self.listening {
                    return;
                }
                // Registration requires a token from the current or
                // grace generation, bound to the source address.
                if validity == TokenValidity::Invalid {
                    return;
                }

                if let Some(port) = data.announce_port(from.port()) {
                    let peer = Peer::new(src, port);
                    self.emit_peer(&topic, peer);
                    if self.peers.add(&topic, peer) {
                        self.push(&topic, peer, via);
                    }
                }

                if let Some(port) = data.unannounce_port(from.port()) {
                    self.peers.remove(&topic, Peer::new(src, port));
                }

                if data.subscribed() {
                    self.subscribers.add(&topic, Peer::new(src, from.port()));
                } else {
                    self.subscribers.remove(&topic, Peer::new(src, from.port()));
                }
            }

            _ => {}
        }
    }

    // Fire-and-forget SRV notifications to a sample of the topic's
    // subscribers when a fresh peer registers.
    fn push(&mut self, topic: &Topic, peer: Peer, via: &UdpTransport) {
        let targets = self.subscribers.sample(topic, PUSH_SAMPLE);
        if targets.is_empty() {
            return;
        }
        let name = match wire::topic_name(topic, &self.config.domain) {
            Ok(name) => name,
            Err(e) => {
                tracing::warn!("bad topic name: {}", e);
                return;
            }
        };
        let msg = match wire::push_query(name, self.config.record_ttl(), peer) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("bad push record: {}", e);
                return;
            }
        };

        tracing::debug!("pushing {} to {} subscribers", peer, targets.len());
        for target in targets {
            let transport = via.clone();
            let msg = msg.clone();
            tokio::spawn(async move {
                let to = SocketAddr::new(target.host.into(), target.port);
                if let Err(e) = transport.query(msg, to, PUSH_RETRIES).await {
                    tracing::debug!("push to {} went unanswered: {}", to, e);
                }
            });
        }
    }

    fn rotate(&mut self) {
        self.tick += 1;
        if self.listening {
            self.secrets.rotate();
            tracing::debug!("rotated announce secrets");
        }
        for state in &mut self.trackers {
            if state.token.is_some() && state.token_age < self.tick {
                state.token = None;
            }
        }
    }

    fn emit_peer(&self, topic: &Topic, peer: Peer) {
        self.events
            .send(DiscoveryEvent::Peer { topic: topic.clone(), peer })
            .ok();
    }

    fn shutdown(&mut self) {
        if let Some(task) = self.mdns_task.take() {
            task.abort();
        }
        for task in self.server_tasks.drain(..) {
            task.abort();
        }
        self.events.send(DiscoveryEvent::Close).ok();
        tracing::info!("instance closed");
    }
}

enum Responder {
    Unicast(UdpTransport),
    Multicast,
}

// Success once two observations from distinct source hosts agree on
// both host and port; any disagreement is fatal.
fn whoami_step(
    prev: &mut Option<(Ipv4Addr, Peer)>,
    src: Ipv4Addr,
    observed: Peer,
) -> Option<Result<Peer>> {
    match prev {
        Some((prev_src, prev_observed)) => {
            if *prev_observed != observed {
                return Some(Err(DiscoveryError::InconsistentObservation));
            }
            if *prev_src != src {
                return Some(Ok(observed));
            }
            None
        }
        None => {
            *prev = Some((src, observed));
            None
        }
    }
}

fn src_host(addr: SocketAddr) -> Option<Ipv4Addr> {
    match addr.ip() {
        IpAddr::V4(host) => Some(host),
        IpAddr::V6(_) => None,
    }
}

fn primary_ipv4() -> Option<Ipv4Addr> {
    if_addrs::get_if_addrs()
        .ok()?
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .find_map(|iface| match iface.ip() {
            IpAddr::V4(host) => Some(host),
            IpAddr::V6(_) => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(host: [u8; 4], port: u16) -> Peer {
        Peer::new(Ipv4Addr::from(host), port)
    }

    #[test]
    fn test_whoami_consensus_distinct_sources() {
        let mut prev = None;
        let observed = peer([8, 8, 8, 8], 4000);
        assert!(whoami_step(&mut prev, Ipv4Addr::new(1, 1, 1, 1), observed).is_none());
        let outcome = whoami_step(&mut prev, Ipv4Addr::new(2, 2, 2, 2), observed);
        assert!(matches!(outcome, Some(Ok(p)) if p == observed));
    }

    #[test]
    fn test_whoami_same_source_keeps_waiting() {
        // Retry duplication from one tracker is not a cross-check.
        let mut prev = None;
        let observed = peer([8, 8, 8, 8], 4000);
        assert!(whoami_step(&mut prev, Ipv4Addr::new(1, 1, 1, 1), observed).is_none());
        assert!(whoami_step(&mut prev, Ipv4Addr::new(1, 1, 1, 1), observed).is_none());
    }

    #[test]
    fn test_whoami_disagreement_errors() {
        let mut prev = None;
        assert!(whoami_step(&mut prev, Ipv4Addr::new(1, 1, 1, 1), peer([8, 8, 8, 8], 4000)).is_none());
        let outcome = whoami_step(&mut prev, Ipv4Addr::new(2, 2, 2, 2), peer([8, 8, 8, 8], 4001));
        assert!(matches!(outcome, Some(Err(DiscoveryError::InconsistentObservation))));
    }
}
