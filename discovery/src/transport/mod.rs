use std::net::SocketAddr;
use std::time::Duration;
use hickory_proto::op::Message;

mod multicast;
mod unicast;

pub use multicast::MulticastTransport;
pub use unicast::UdpTransport;

pub type Result<T> = std::result::Result<T, TransportError>;

// Per-attempt wait before a query is resent.
pub(crate) const QUERY_TIMEOUT: Duration = Duration::from_secs(4);

#[derive(thiserror::Error, Debug)]
pub enum TransportError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("dns encoding error: {0}")]
    Proto(#[from] hickory_proto::error::ProtoError),

    #[error("query timed out")]
    Timeout,

    #[error("socket closed")]
    Closed,

}

// Traffic forwarded to the instance actor. Unicast responses that
// match a pending transaction are consumed by the issuing query and
// never show up here.
pub enum Inbound {

    UnicastQuery { msg: Message, from: SocketAddr, socket: UdpTransport },

    UnicastResponse { msg: Message, from: SocketAddr },

    MulticastQuery { msg: Message, from: SocketAddr },

    MulticastResponse { msg: Message, from: SocketAddr },

    // Socket-level faults, surfaced but never fatal to the instance.
    Fault(TransportError),

}
