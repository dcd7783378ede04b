use std::net::{SocketAddr, ToSocketAddrs};
use hickory_proto::error::ProtoError;
use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use tokio::sync::mpsc;
use crate::config::TrackerAddr;
use crate::peer::Topic;
use crate::transport::{TransportError, UdpTransport};
use crate::wire::{self, TxtData};

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(thiserror::Error, Debug)]
pub enum SessionError {

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("dns encoding error: {0}")]
    Proto(#[from] ProtoError),

    #[error("no ipv4 address for tracker {0}")]
    Resolve(String),

}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitKind {

    // type 1: { subscribe, token }
    Lookup,

    // type 2: { subscribe, token, announce }
    Announce,

    // type 3: { token, unannounce }
    Unannounce,

}

// Instance-side state for one configured tracker.
#[derive(Debug, Clone)]
pub struct TrackerSlot {

    pub host: String,

    pub port: u16,

    // Cleared once a probe settles which port the tracker answers on.
    pub secondary_port: u16,

    pub token: Option<String>,

    // Rotation tick at which the token was cached; it is dropped once
    // the tick moves past it.
    pub token_age: u64,

}

impl TrackerSlot {
    pub fn new(addr: &TrackerAddr) -> Self {
        Self {
            host: addr.host.clone(),
            port: addr.port,
            secondary_port: addr.secondary_port,
            token: None,
            token_age: 0,
        }
    }
}

// Slot mutations and replies observed by fan-out legs, reported back
// to the instance actor which owns the authoritative state.
pub enum SessionReport {

    Port { slot: usize, port: u16 },

    Token { slot: usize, token: String },

    Reply { slot: usize, msg: Message, from: SocketAddr },

}

// A fan-out leg working against one tracker: a snapshot of the slot
// taken when the operation started, plus the shared client socket.
pub struct TrackerSession {

    slot: usize,

    host: String,

    port: u16,

    secondary_port: u16,

    token: Option<String>,

    domain: String,

    implied_port: bool,

    retries: u32,

    transport: UdpTransport,

    report: mpsc::UnboundedSender<SessionReport>,

}

impl TrackerSession {

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        slot: usize,
        state: &TrackerSlot,
        domain: String,
        implied_port: bool,
        retries: u32,
        transport: UdpTransport,
        report: mpsc::UnboundedSender<SessionReport>,
    ) -> Self {
        Self {
            slot,
            host: state.host.clone(),
            port: state.port,
            secondary_port: state.secondary_port,
            token: state.token.clone(),
            domain,
            implied_port,
            retries,
            transport,
            report,
        }
    }

    // TXT query for the bare domain: token handoff plus the tracker's
    // view of our address. While the tracker still has two candidate
    // ports the probe races both and keeps the winner; the losing
    // transaction is cancelled by drop.
    pub async fn probe(&mut self) -> Result<(TxtData, SocketAddr)> {
        let name = wire::domain_name(&self.domain)?;
        let msg = wire::new_query(name, RecordType::TXT);

        let (reply, from) = if self.secondary_port != 0 {
            let transport = self.transport.clone();
            let primary = self.addr(self.port)?;
            let secondary = self.addr(self.secondary_port)?;
            let a = transport.query(msg.clone(), primary, self.retries);
            let b = transport.query(msg, secondary, self.retries);
            tokio::pin!(a, b);

            let (winner, reply) = tokio::select! {
                res = &mut a => match res {
                    Ok(reply) => (self.port, reply),
                    Err(_) => (self.secondary_port, b.await?),
                },
                res = &mut b => match res {
                    Ok(reply) => (self.secondary_port, reply),
                    Err(_) => (self.port, a.await?),
                },
            };
            self.port = winner;
            self.secondary_port = 0;
            let _ = self.report.send(SessionReport::Port { slot: self.slot, port: winner });
            tracing::debug!("tracker {} answers on port {}", self.host, winner);
            reply
        } else {
            let to = self.addr(self.port)?;
            self.transport.query(msg, to, self.retries).await?
        };

        let data = wire::first_txt(&reply).unwrap_or_default();
        if let Some(token) = &data.token {
            self.token = Some(token.clone());
            let _ = self.report.send(SessionReport::Token { slot: self.slot, token: token.clone() });
        }
        Ok((data, from))
    }

    // One visit leg; the reply is handed to the actor for token refresh
    // and peer extraction.
    pub async fn send(&mut self, kind: VisitKind, topic: &Topic, port: u16) -> Result<()> {
        let name = wire::topic_name(topic, &self.domain)?;
        let data = visit_payload(kind, self.token.clone(), port, self.implied_port);
        let to = self.addr(self.port)?;
        let (reply, from) = self.transport.query(wire::visit_query(name, &data), to, self.retries).await?;
        let _ = self.report.send(SessionReport::Reply { slot: self.slot, msg: reply, from });
        Ok(())
    }

    pub async fn probe_and_send(&mut self, kind: VisitKind, topic: &Topic, port: u16) -> Result<()> {
        self.probe().await?;
        self.send(kind, topic, port).await
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    fn addr(&self, port: u16) -> Result<SocketAddr> {
        (self.host.as_str(), port)
            .to_socket_addrs()?
            .find(|a| a.is_ipv4())
            .ok_or_else(|| SessionError::Resolve(self.host.clone()))
    }
}

// The TXT payload carried in a visit's additionals. With implied port
// the textual value is "0", telling the tracker to use the observed
// UDP source port.
pub fn visit_payload(kind: VisitKind, token: Option<String>, port: u16, implied_port: bool) -> TxtData {
    let port_field = if implied_port { "0".to_string() } else { port.to_string() };
    match kind {
        VisitKind::Lookup => TxtData {
            subscribe: Some("true".to_string()),
            token,
            ..Default::default()
        },
        VisitKind::Announce => TxtData {
            subscribe: Some("true".to_string()),
            token,
            announce: Some(port_field),
            ..Default::default()
        },
        VisitKind::Unannounce => TxtData {
            token,
            unannounce: Some(port_field),
            ..Default::default()
        },
    }
}
