use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use hickory_proto::op::{Message, MessageType};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;
use super::{Inbound, Result, TransportError, QUERY_TIMEOUT};

type PendingMap = HashMap<u16, oneshot::Sender<(Message, SocketAddr)>>;

// One UDP DNS socket multiplexing any number of in-flight query
// transactions. Responses are matched to callers by transaction id;
// inbound queries and unmatched responses go to the instance queue.
#[derive(Clone)]
pub struct UdpTransport {
    inner: Arc<Inner>,
}

struct Inner {

    socket: UdpSocket,

    pending: Mutex<PendingMap>,

}

impl UdpTransport {

    // Binds the socket and spawns its receive loop. The loop runs until
    // the returned handle is aborted.
    pub async fn bind(
        addr: SocketAddr,
        inbound_tx: mpsc::UnboundedSender<Inbound>,
    ) -> Result<(Self, JoinHandle<()>)> {
        let socket = UdpSocket::bind(addr).await?;
        let transport = UdpTransport {
            inner: Arc::new(Inner {
                socket,
                pending: Mutex::new(HashMap::new()),
            }),
        };
        let recv = tokio::spawn(transport.clone().recv_loop(inbound_tx));
        Ok((transport, recv))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.socket.local_addr()?)
    }

    // One transaction: send, await the matching response, resend on
    // timeout until `retries` resends are spent. Dropping the future
    // cancels the transaction.
    pub async fn query(
        &self,
        mut msg: Message,
        to: SocketAddr,
        retries: u32,
    ) -> Result<(Message, SocketAddr)> {
        let (id, mut rx) = {
            let mut pending = self.inner.pending.lock().unwrap();
            let mut id = rand::random::<u16>();
            while pending.contains_key(&id) {
                id = rand::random();
            }
            let (tx, rx) = oneshot::channel();
            pending.insert(id, tx);
            (id, rx)
        };
        let _guard = PendingGuard { inner: self.inner.clone(), id };

        msg.set_id(id);
        let bytes = msg.to_vec()?;

        for attempt in 0..=retries {
            self.inner.socket.send_to(&bytes, to).await?;
            match time::timeout(QUERY_TIMEOUT, &mut rx).await {
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(_)) => return Err(TransportError::Closed),
                Err(_) => {
                    if attempt < retries {
                        tracing::debug!("query {:#06x} to {} timed out, retrying", id, to);
                    }
                }
            }
        }
        Err(TransportError::Timeout)
    }

    // Fire a response; no transaction state.
    pub async fn respond(&self, msg: Message, to: SocketAddr) -> Result<()> {
        self.inner.socket.send_to(&msg.to_vec()?, to).await?;
        Ok(())
    }

    async fn recv_loop(self, inbound_tx: mpsc::UnboundedSender<Inbound>) {
        let mut buf = vec![0u8; 65_535];
        loop {
            let (n, from) = match self.inner.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    // Transient on UDP (e.g. ICMP port unreachable);
                    // surface and keep receiving.
                    if inbound_tx.send(Inbound::Fault(e.into())).is_err() {
                        return;
                    }
                    continue;
                }
            };
            // Byzantine frames are dropped without ceremony.
            let Ok(msg) = Message::from_vec(&buf[..n]) else { continue };

            match msg.message_type() {
                MessageType::Response => {
                    let waiter = self.inner.pending.lock().unwrap().remove(&msg.id());
                    match waiter {
                        Some(tx) => {
                            tx.send((msg, from)).ok();
                        }
                        None => {
                            if inbound_tx.send(Inbound::UnicastResponse { msg, from }).is_err() {
                                return;
                            }
                        }
                    }
                }
                MessageType::Query => {
                    let inbound = Inbound::UnicastQuery {
                        msg,
                        from,
                        socket: self.clone(),
                    };
                    if inbound_tx.send(inbound).is_err() {
                        return;
                    }
                }
            }
        }
    }
}

// Deregisters the transaction when the query future completes or is
// cancelled mid-flight.
struct PendingGuard {
    inner: Arc<Inner>,
    id: u16,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.inner.pending.lock().unwrap().remove(&self.id);
    }
}
