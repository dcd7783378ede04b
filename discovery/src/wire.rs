use std::net::Ipv4Addr;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hickory_proto::error::ProtoResult;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::rdata::{A, SRV, TXT};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use crate::peer::{self, Peer, Topic};

// TXT payloads are flat key/value pairs, one "key=value" character
// string each. Unknown keys are ignored; entries without '=' are
// skipped; a non-UTF-8 chunk drops the whole record.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TxtData {

    pub token: Option<String>,

    // Observed address/port, returned on probes (the whoami answer).
    pub host: Option<String>,

    pub port: Option<String>,

    // base64 of concatenated 6-byte peer records.
    pub peers: Option<String>,

    // Decimal port, "0" for "use the UDP source port".
    pub announce: Option<String>,

    pub unannounce: Option<String>,

    pub subscribe: Option<String>,

}

impl TxtData {

    pub fn decode(txt: &TXT) -> Option<Self> {
        let mut data = TxtData::default();
        for chunk in txt.txt_data() {
            let entry = std::str::from_utf8(chunk).ok()?;
            let Some((key, value)) = entry.split_once('=') else { continue };
            match key {
                "token" => data.token = Some(value.to_string()),
                "host" => data.host = Some(value.to_string()),
                "port" => data.port = Some(value.to_string()),
                "peers" => data.peers = Some(value.to_string()),
                "announce" => data.announce = Some(value.to_string()),
                "unannounce" => data.unannounce = Some(value.to_string()),
                "subscribe" => data.subscribe = Some(value.to_string()),
                _ => {}
            }
        }
        Some(data)
    }

    pub fn encode(&self) -> TXT {
        let mut entries = Vec::new();
        let mut push = |key: &str, value: &Option<String>| {
            if let Some(value) = value {
                entries.push(format!("{}={}", key, value));
            }
        };
        push("token", &self.token);
        push("host", &self.host);
        push("port", &self.port);
        push("peers", &self.peers);
        push("announce", &self.announce);
        push("unannounce", &self.unannounce);
        push("subscribe", &self.subscribe);
        TXT::new(entries)
    }

    // Unpacked peer list, None if absent or not base64.
    pub fn peer_list(&self) -> Option<Vec<Peer>> {
        let raw = BASE64.decode(self.peers.as_ref()?).ok()?;
        Some(peer::decode_list(&raw))
    }

    pub fn subscribed(&self) -> bool {
        matches!(self.subscribe.as_deref(), Some(v) if !v.is_empty() && v != "0" && v != "false")
    }

    pub fn announce_port(&self, src_port: u16) -> Option<u16> {
        parse_port(self.announce.as_deref()?, src_port)
    }

    pub fn unannounce_port(&self, src_port: u16) -> Option<u16> {
        parse_port(self.unannounce.as_deref()?, src_port)
    }

    // Observed {host, port} pair from a probe reply.
    pub fn observed(&self) -> Option<Peer> {
        let host = self.host.as_deref()?.parse().ok()?;
        let port = self.port.as_deref()?.parse().ok()?;
        Some(Peer::new(host, port))
    }
}

fn parse_port(value: &str, src_port: u16) -> Option<u16> {
    let port: u16 = value.trim().parse().ok()?;
    Some(if port == 0 { src_port } else { port })
}

pub fn encode_peers(packed: &[u8]) -> String {
    BASE64.encode(packed)
}

pub fn domain_name(domain: &str) -> ProtoResult<Name> {
    Name::from_ascii(domain)
}

// "<id>.<domain>"
pub fn topic_name(topic: &Topic, domain: &str) -> ProtoResult<Name> {
    Name::from_ascii(format!("{}.{}", topic, domain))
}

// Topic for a record name: strip ".<domain>", case-insensitively and
// tolerant of the trailing FQDN dot. Names outside the domain map to
// None, as does the bare domain itself (a record must be named
// "<id>.<domain>" to carry a topic).
pub fn topic_from_name(name: &Name, domain: &str) -> Option<Topic> {
    let name = normalize(name);
    let prefix = name
        .strip_suffix(&domain.to_ascii_lowercase())?
        .strip_suffix('.')?;
    if prefix.is_empty() {
        return None;
    }
    Some(Topic::from(prefix))
}

// Exact match against the bare domain, used to tell a probe question
// apart from a topic lookup.
pub fn is_domain(name: &Name, domain: &str) -> bool {
    normalize(name) == domain.to_ascii_lowercase()
}

fn normalize(name: &Name) -> String {
    let mut name = name.to_ascii().to_ascii_lowercase();
    if name.ends_with('.') {
        name.pop();
    }
    name
}

pub fn new_query(name: Name, qtype: RecordType) -> Message {
    let mut msg = Message::new();
    msg.set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(false)
        .add_query(Query::query(name, qtype));
    msg
}

// Lookup/announce/unannounce query: the TXT payload rides in the
// additionals, named like the question.
pub fn visit_query(name: Name, data: &TxtData) -> Message {
    let mut msg = new_query(name.clone(), RecordType::TXT);
    msg.add_additional(txt_record(name, 0, data));
    msg
}

// Push notification: a query with no questions carrying one SRV
// additional for the freshly registered peer.
pub fn push_query(name: Name, ttl: u32, peer: Peer) -> ProtoResult<Message> {
    let mut msg = Message::new();
    msg.set_message_type(MessageType::Query).set_op_code(OpCode::Query);
    msg.add_additional(srv_record(name, ttl, peer.port, &peer.host.to_string())?);
    Ok(msg)
}

// Reply skeleton mirroring the query id.
pub fn new_response(query: &Message) -> Message {
    let mut msg = Message::new();
    msg.set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_authoritative(true);
    msg
}

pub fn txt_record(name: Name, ttl: u32, data: &TxtData) -> Record {
    Record::from_rdata(name, ttl, RData::TXT(data.encode()))
}

pub fn a_record(name: Name, ttl: u32, host: Ipv4Addr) -> Record {
    Record::from_rdata(name, ttl, RData::A(A::from(host)))
}

pub fn srv_record(name: Name, ttl: u32, port: u16, target: &str) -> ProtoResult<Record> {
    let target = Name::from_ascii(target)?;
    Ok(Record::from_rdata(name, ttl, RData::SRV(SRV::new(0, 0, port, target))))
}

pub fn txt_rdata(record: &Record) -> Option<&TXT> {
    match record.data() {
        Some(RData::TXT(txt)) => Some(txt),
        _ => None,
    }
}

// First decodable TXT answer of a reply.
pub fn first_txt(msg: &Message) -> Option<TxtData> {
    msg.answers().iter().find_map(|r| TxtData::decode(txt_rdata(r)?))
}
