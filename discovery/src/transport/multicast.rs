use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use hickory_proto::op::{Message, MessageType};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use super::{Inbound, Result};

pub const MDNS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
pub const MDNS_PORT: u16 = 5353;

// Link-local mDNS leg. Queries and responses both go to the group;
// multicast loopback stays on so reflected answers exercise the same
// echo suppression as on a real link.
#[derive(Clone)]
pub struct MulticastTransport {
    socket: Arc<UdpSocket>,
}

impl MulticastTransport {

    pub fn bind(inbound_tx: mpsc::UnboundedSender<Inbound>) -> Result<(Self, JoinHandle<()>)> {
        // SO_REUSEADDR/SO_REUSEPORT so we can share 5353 with other
        // mDNS responders on the host.
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        socket.set_reuse_port(true)?;
        let bind_addr = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), MDNS_PORT);
        socket.bind(&bind_addr.into())?;
        socket.set_nonblocking(true)?;

        let socket = UdpSocket::from_std(socket.into())?;
        socket.join_multicast_v4(MDNS_GROUP, Ipv4Addr::UNSPECIFIED)?;
        socket.set_multicast_loop_v4(true)?;

        let transport = MulticastTransport { socket: Arc::new(socket) };
        let recv = tokio::spawn(transport.clone().recv_loop(inbound_tx));
        Ok((transport, recv))
    }

    pub async fn query(&self, msg: Message) -> Result<()> {
        self.send(msg).await
    }

    pub async fn respond(&self, msg: Message) -> Result<()> {
        self.send(msg).await
    }

    async fn send(&self, msg: Message) -> Result<()> {
        let group = SocketAddr::new(MDNS_GROUP.into(), MDNS_PORT);
        self.socket.send_to(&msg.to_vec()?, group).await?;
        Ok(())
    }

    async fn recv_loop(self, inbound_tx: mpsc::UnboundedSender<Inbound>) {
        let mut buf = vec![0u8; 65_535];
        loop {
            let (n, from) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    if inbound_tx.send(Inbound::Fault(e.into())).is_err() {
                        return;
                    }
                    continue;
                }
            };
            let Ok(msg) = Message::from_vec(&buf[..n]) else { continue };

            let inbound = match msg.message_type() {
                MessageType::Query => Inbound::MulticastQuery { msg, from },
                MessageType::Response => Inbound::MulticastResponse { msg, from },
            };
            if inbound_tx.send(inbound).is_err() {
                return;
            }
        }
    }
}
