// End-to-end over loopback UDP: one tracker instance, two client
// instances, no multicast.

use std::net::Ipv4Addr;
use std::time::Duration;
use discovery::{Discovery, DiscoveryConfig, DiscoveryError, DiscoveryEvent, EventRx, Peer, Topic, TrackerAddr};
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::rdata::TXT;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use serde_json::json;
use tokio::net::UdpSocket;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

async fn start_tracker() -> (Discovery, u16) {
    let config = DiscoveryConfig {
        multicast: false,
        ..Default::default()
    };
    let (tracker, _events) = Discovery::new(config).await.unwrap();
    let bound = tracker.listen(&[0]).await.unwrap();
    (tracker, bound[0].port())
}

fn client_config(tracker_port: u16) -> DiscoveryConfig {
    DiscoveryConfig {
        trackers: vec![TrackerAddr {
            host: "127.0.0.1".to_string(),
            port: tracker_port,
            secondary_port: 0,
        }],
        multicast: false,
        ..Default::default()
    }
}

async fn next_peer(events: &mut EventRx) -> (Topic, Peer) {
    timeout(WAIT, async {
        loop {
            match events.recv().await.expect("event stream ended") {
                DiscoveryEvent::Peer { topic, peer } => return (topic, peer),
                _ => continue,
            }
        }
    })
    .await
    .expect("no peer event")
}

#[tokio::test]
async fn test_announce_then_lookup() {
    let (tracker, port) = start_tracker().await;

    let (alice, _alice_events) = Discovery::new(client_config(port)).await.unwrap();
    alice.announce("cafe", 8000).await.unwrap();

    // alice mirrors her own announcement locally as 0.0.0.0
    assert_eq!(
        alice.to_json().await.unwrap(),
        json!({ "cafe": [{ "host": "0.0.0.0", "port": 8000 }] }),
    );

    // the tracker registered her under the observed source address
    assert_eq!(
        tracker.to_json().await.unwrap(),
        json!({ "cafe": [{ "host": "127.0.0.1", "port": 8000 }] }),
    );

    // a second participant finds her
    let (bob, mut bob_events) = Discovery::new(client_config(port)).await.unwrap();
    bob.lookup("cafe").await.unwrap();
    let (topic, peer) = next_peer(&mut bob_events).await;
    assert_eq!(topic, Topic::from("cafe"));
    assert_eq!(peer, Peer::new(Ipv4Addr::new(127, 0, 0, 1), 8000));
}

#[tokio::test]
async fn test_unannounce_clears_registration() {
    let (tracker, port) = start_tracker().await;

    let (alice, _events) = Discovery::new(client_config(port)).await.unwrap();
    alice.announce("cafe", 8000).await.unwrap();
    alice.unannounce("cafe", 8000).await.unwrap();

    assert_eq!(alice.to_json().await.unwrap(), json!({}));
    assert_eq!(tracker.to_json().await.unwrap(), json!({}));
}

#[tokio::test]
async fn test_push_notifies_subscriber() {
    let (_tracker, port) = start_tracker().await;

    // alice announces (and thereby subscribes to the topic)
    let (alice, mut alice_events) = Discovery::new(client_config(port)).await.unwrap();
    alice.announce("cafe", 8000).await.unwrap();
    // drain her own reflected announcement
    let _ = next_peer(&mut alice_events).await;

    // bob registers later; the tracker pushes him to alice
    let (bob, _bob_events) = Discovery::new(client_config(port)).await.unwrap();
    bob.announce("cafe", 9000).await.unwrap();

    let pushed = timeout(WAIT, async {
        loop {
            if let DiscoveryEvent::Peer { topic, peer } =
                alice_events.recv().await.expect("event stream ended")
            {
                if peer.port == 9000 {
                    return (topic, peer);
                }
            }
        }
    })
    .await
    .expect("no push arrived");
    assert_eq!(pushed.0, Topic::from("cafe"));
    assert_eq!(pushed.1.host, Ipv4Addr::new(127, 0, 0, 1));
}

async fn ask(sock: &UdpSocket, port: u16, id: u16, name: &str, qtype: RecordType) -> Message {
    let mut msg = Message::new();
    msg.set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .add_query(Query::query(Name::from_ascii(name).unwrap(), qtype));
    sock.send_to(&msg.to_vec().unwrap(), ("127.0.0.1", port)).await.unwrap();

    let mut buf = [0u8; 4096];
    let (n, _) = timeout(WAIT, sock.recv_from(&mut buf)).await.unwrap().unwrap();
    Message::from_vec(&buf[..n]).unwrap()
}

#[tokio::test]
async fn test_responder_speaks_plain_dns() {
    let (_tracker, port) = start_tracker().await;
    let (alice, _events) = Discovery::new(client_config(port)).await.unwrap();
    alice.announce("cafe", 8000).await.unwrap();

    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let my_port = sock.local_addr().unwrap().port();

    // a probe gets a token and our observed address back
    let reply = ask(&sock, port, 7, "dns-discovery.local", RecordType::TXT).await;
    assert_eq!(reply.id(), 7);
    assert_eq!(reply.message_type(), MessageType::Response);
    let Some(RData::TXT(txt)) = reply.answers()[0].data() else {
        panic!("expected a TXT answer");
    };
    let entries: Vec<String> = txt
        .txt_data()
        .iter()
        .map(|chunk| String::from_utf8(chunk.to_vec()).unwrap())
        .collect();
    assert!(entries.iter().any(|e| e.starts_with("token=")));
    assert!(entries.contains(&"host=127.0.0.1".to_string()));
    assert!(entries.contains(&format!("port={}", my_port)));

    // A and SRV lookups surface the registered peer
    let reply = ask(&sock, port, 8, "cafe.dns-discovery.local", RecordType::A).await;
    assert_eq!(reply.answers().len(), 1);
    let Some(RData::A(a)) = reply.answers()[0].data() else {
        panic!("expected an A answer");
    };
    assert_eq!(a.0, Ipv4Addr::new(127, 0, 0, 1));

    let reply = ask(&sock, port, 9, "cafe.dns-discovery.local", RecordType::SRV).await;
    assert_eq!(reply.answers().len(), 1);
    let Some(RData::SRV(srv)) = reply.answers()[0].data() else {
        panic!("expected an SRV answer");
    };
    assert_eq!(srv.port(), 8000);
    assert_eq!(srv.target().to_ascii().trim_end_matches('.'), "127.0.0.1");

    // unknown names are ignored
    let reply = ask(&sock, port, 10, "cafe.somewhere.else", RecordType::TXT).await;
    assert!(reply.answers().is_empty());
}

#[tokio::test]
async fn test_ingester_ignores_records_named_bare_domain() {
    let (tracker, port) = start_tracker().await;
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    // fetch a valid token via a probe
    let reply = ask(&sock, port, 21, "dns-discovery.local", RecordType::TXT).await;
    let Some(RData::TXT(txt)) = reply.answers()[0].data() else {
        panic!("expected a TXT answer");
    };
    let token = txt
        .txt_data()
        .iter()
        .find_map(|chunk| {
            std::str::from_utf8(chunk).ok()?.strip_prefix("token=").map(str::to_string)
        })
        .expect("probe reply carries a token");

    // even with a valid token, an announcement may not ride on the
    // bare domain name; only "<topic>.<domain>" records register
    let name = Name::from_ascii("dns-discovery.local").unwrap();
    let mut msg = Message::new();
    msg.set_id(22)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .add_query(Query::query(name.clone(), RecordType::TXT));
    let rdata = TXT::new(vec![
        format!("token={}", token),
        "announce=4500".to_string(),
        "subscribe=true".to_string(),
    ]);
    msg.add_additional(Record::from_rdata(name, 0, RData::TXT(rdata)));
    sock.send_to(&msg.to_vec().unwrap(), ("127.0.0.1", port)).await.unwrap();
    let mut buf = [0u8; 4096];
    timeout(WAIT, sock.recv_from(&mut buf)).await.unwrap().unwrap();

    assert_eq!(tracker.to_json().await.unwrap(), json!({}));
}

#[tokio::test]
async fn test_multicast_lookup_between_pure_clients() {
    // No trackers and no listen calls: discovery runs on the link
    // alone, and a pure client still answers lookups from its own
    // store.
    let config = || DiscoveryConfig {
        trackers: Vec::new(),
        multicast: true,
        ..Default::default()
    };

    let (alice, _alice_events) = Discovery::new(config()).await.unwrap();
    // only the multicast leg exists and it never counts as a response
    let _ = alice.announce("cafe", 8000).await;

    let (bob, mut bob_events) = Discovery::new(config()).await.unwrap();

    // mDNS queries are single datagrams; re-ask until the answer lands
    let found = timeout(WAIT, async {
        loop {
            let _ = bob.lookup("cafe").await;
            let answered = timeout(Duration::from_secs(2), async {
                loop {
                    if let DiscoveryEvent::Peer { topic, peer } =
                        bob_events.recv().await.expect("event stream ended")
                    {
                        if topic == Topic::from("cafe") && peer.port == 8000 {
                            return peer;
                        }
                    }
                }
            })
            .await;
            if let Ok(peer) = answered {
                return peer;
            }
        }
    })
    .await
    .expect("no multicast answer");

    // alice packed herself as 0.0.0.0; bob must have substituted the
    // source address he observed
    assert!(!found.is_unspecified());
}

#[tokio::test]
async fn test_visit_with_no_legs_fails() {
    let config = DiscoveryConfig {
        multicast: false,
        ..Default::default()
    };
    let (lonely, _events) = Discovery::new(config).await.unwrap();
    let err = lonely.lookup("cafe").await.unwrap_err();
    assert!(matches!(err, DiscoveryError::QueryFailed));
    assert_eq!(err.to_string(), "Query failed");
}

#[tokio::test]
async fn test_whoami_needs_two_trackers() {
    let (_tracker, port) = start_tracker().await;
    let (alice, _events) = Discovery::new(client_config(port)).await.unwrap();
    let err = alice.whoami().await.unwrap_err();
    assert_eq!(err.to_string(), "Probe failed");
}

#[tokio::test]
async fn test_second_listen_is_an_error() {
    let (tracker, _port) = start_tracker().await;
    let err = tracker.listen(&[0]).await.unwrap_err();
    assert!(matches!(err, DiscoveryError::AlreadyListening));
}

#[tokio::test]
async fn test_destroy_emits_close_once() {
    let config = DiscoveryConfig {
        multicast: false,
        ..Default::default()
    };
    let (disco, mut events) = Discovery::new(config).await.unwrap();
    disco.destroy().await.unwrap();
    // second destroy is a quiet no-op
    disco.destroy().await.unwrap();

    let mut closes = 0;
    while let Ok(Some(event)) = timeout(Duration::from_secs(2), events.recv()).await {
        if matches!(event, DiscoveryEvent::Close) {
            closes += 1;
        }
    }
    assert_eq!(closes, 1);
}

#[tokio::test]
async fn test_lookup_against_dead_tracker_fails() {
    // nothing listens here
    let config = DiscoveryConfig {
        trackers: vec![TrackerAddr {
            host: "127.0.0.1".to_string(),
            port: 1,
            secondary_port: 0,
        }],
        multicast: false,
        retries: 0,
        ..Default::default()
    };
    let (alice, _events) = Discovery::new(config).await.unwrap();
    let err = alice.lookup("cafe").await.unwrap_err();
    assert!(matches!(err, DiscoveryError::QueryFailed));
}
