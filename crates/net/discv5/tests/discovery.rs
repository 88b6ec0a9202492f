//! End-to-end discovery scenarios over loopback sockets.

use kestrel_discv5::{
    Discv5, Discv5Config, Discv5Event, Enr, ListenConfig, RequestError,
};
use secp256k1::SecretKey;
use std::{net::Ipv4Addr, time::Duration};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Reserves a free loopback UDP port.
///
/// The reserving socket is dropped before the port is used, which leaves a small window for
/// another process to grab it; good enough for tests.
fn free_port() -> u16 {
    std::net::UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

fn test_config(port: u16) -> Discv5Config {
    Discv5Config::builder()
        .listen_config(ListenConfig::Ipv4 { ip: Ipv4Addr::LOCALHOST, port })
        .request_timeout(Duration::from_millis(500))
        .build()
}

/// Spawns a node listening on a fresh loopback port.
async fn build_node() -> (Discv5, SecretKey) {
    init_tracing();
    let port = free_port();
    let key = SecretKey::new(&mut rand::thread_rng());
    let enr = Enr::builder().ip4(Ipv4Addr::LOCALHOST).udp4(port).build(&key).unwrap();
    let discv5 = Discv5::spawn(enr, key, test_config(port)).await.unwrap();
    (discv5, key)
}

#[tokio::test]
async fn test_three_node_transitive_discovery() {
    let (n0, _) = build_node().await;
    let (n1, _) = build_node().await;
    let (n2, _) = build_node().await;

    // n0 knows n1, n1 knows n2; n0 has never heard of n2.
    n0.add_enr(n1.local_enr()).unwrap();
    n1.add_enr(n2.local_enr()).unwrap();

    let found = n0.find_node(n2.local_node_id()).await.unwrap();
    let ids: Vec<_> = found.iter().map(|enr| enr.node_id()).collect();
    assert_eq!(ids, vec![n2.local_node_id(), n1.local_node_id()]);
}

#[tokio::test]
async fn test_lookup_on_empty_table_returns_nothing() {
    let (n0, _) = build_node().await;
    let found = n0.find_node(enr::NodeId::random()).await.unwrap();
    assert!(found.is_empty());
}

#[tokio::test]
async fn test_talk_request_without_handler_times_out() {
    let (n0, _) = build_node().await;
    let (n1, _) = build_node().await;

    // n1 never registers a handler, so the request dies on the timeout.
    let result = n0.talk_request(n1.local_enr(), b"foo".to_vec(), vec![0, 1, 2, 3]).await;
    assert_eq!(result, Err(RequestError::Timeout));
}

#[tokio::test]
async fn test_talk_request_with_handler_resolves() {
    let (n0, _) = build_node().await;
    let (n1, _) = build_node().await;

    let mut events = n1.event_stream().await.unwrap();
    let responder = n1.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Discv5Event::TalkRequest(talk) = event {
                assert_eq!(talk.protocol, b"foo");
                assert_eq!(talk.request, vec![0, 1, 2, 3]);
                responder
                    .send_talk_response(talk.node_address, talk.id, vec![4, 5, 6, 7])
                    .unwrap();
            }
        }
    });

    let response =
        n0.talk_request(n1.local_enr(), b"foo".to_vec(), vec![0, 1, 2, 3]).await.unwrap();
    assert_eq!(response, vec![4, 5, 6, 7]);
}

#[tokio::test]
async fn test_session_reestablishment_after_restart() {
    let (n0, n0_key) = build_node().await;
    let (n1, _) = build_node().await;

    // First contact establishes a session on both sides.
    n0.send_ping(n1.local_enr()).await.unwrap();

    // n0 restarts with the same identity and endpoint, losing its session keys. n1 still
    // holds the old session.
    let n0_enr = n0.local_enr();
    n0.shutdown();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let port = n0_enr.udp4().unwrap();
    let n0 = Discv5::spawn(n0_enr, n0_key, test_config(port)).await.unwrap();

    // n1 cannot decrypt the fresh traffic, issues a WHOAREYOU and the handshake re-runs.
    let pong = n0.send_ping(n1.local_enr()).await.unwrap();
    assert_eq!(pong.enr_seq, n1.local_enr().seq());
}

#[tokio::test]
async fn test_pong_observed_endpoint_updates_local_enr() {
    // n0's record advertises a port it is not actually bound to.
    let bound_port = free_port();
    let advertised_port = free_port();
    assert_ne!(bound_port, advertised_port);

    let key = SecretKey::new(&mut rand::thread_rng());
    let enr =
        Enr::builder().ip4(Ipv4Addr::LOCALHOST).udp4(advertised_port).build(&key).unwrap();
    let seq_before = enr.seq();
    let n0 = Discv5::spawn(enr, key, test_config(bound_port)).await.unwrap();
    let (n1, _) = build_node().await;

    let pong = n0.send_ping(n1.local_enr()).await.unwrap();
    assert_eq!(pong.recipient_port, bound_port);

    // The observed endpoint replaced the stale one and bumped the sequence number once.
    let updated = n0.local_enr();
    assert_eq!(updated.udp4(), Some(bound_port));
    assert_eq!(updated.seq(), seq_before + 1);
}

#[tokio::test]
async fn test_pong_does_not_update_enr_when_disabled() {
    let bound_port = free_port();
    let advertised_port = free_port();

    let key = SecretKey::new(&mut rand::thread_rng());
    let enr =
        Enr::builder().ip4(Ipv4Addr::LOCALHOST).udp4(advertised_port).build(&key).unwrap();
    let seq_before = enr.seq();
    let config = Discv5Config::builder()
        .listen_config(ListenConfig::Ipv4 { ip: Ipv4Addr::LOCALHOST, port: bound_port })
        .request_timeout(Duration::from_millis(500))
        .enr_update(false)
        .build();
    let n0 = Discv5::spawn(enr, key, config).await.unwrap();
    let (n1, _) = build_node().await;

    n0.send_ping(n1.local_enr()).await.unwrap();
    let unchanged = n0.local_enr();
    assert_eq!(unchanged.udp4(), Some(advertised_port));
    assert_eq!(unchanged.seq(), seq_before);
}

#[tokio::test]
async fn test_shutdown_fails_pending_requests() {
    let (n0, _) = build_node().await;
    let (n1, _) = build_node().await;

    // Target a live node but shut down before the response can be processed.
    let pending = {
        let n0 = n0.clone();
        let enr = n1.local_enr();
        tokio::spawn(async move { n0.send_ping(enr).await })
    };
    n0.shutdown();
    let result = pending.await.unwrap();
    // Either the shutdown won the race or the ping resolved just before it.
    if let Err(err) = result {
        assert_eq!(err, RequestError::Shutdown);
    }

    // The handle is now disconnected.
    assert!(n0.add_enr(n1.local_enr()).is_err() || n0.find_node(n1.local_node_id()).await.is_err());
}

#[tokio::test]
async fn test_discovered_and_session_events_are_emitted() {
    let (n0, _) = build_node().await;
    let (n1, _) = build_node().await;
    let (n2, _) = build_node().await;

    let mut events = n0.event_stream().await.unwrap();

    n0.add_enr(n1.local_enr()).unwrap();
    n1.add_enr(n2.local_enr()).unwrap();
    n0.find_node(n2.local_node_id()).await.unwrap();

    let mut saw_enr_added = false;
    let mut saw_session = false;
    let mut saw_discovered = false;
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(500), events.recv()).await
    {
        match event {
            Discv5Event::EnrAdded(enr) => {
                saw_enr_added |= enr.node_id() == n1.local_node_id();
            }
            Discv5Event::SessionEstablished(enr, _) => {
                saw_session |= enr.node_id() == n1.local_node_id();
            }
            Discv5Event::Discovered(enr) => {
                saw_discovered |= enr.node_id() == n2.local_node_id();
            }
            _ => {}
        }
    }
    assert!(saw_enr_added);
    assert!(saw_session);
    assert!(saw_discovered);
}
