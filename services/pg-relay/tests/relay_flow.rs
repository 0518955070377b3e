
use harness::{
    connect, is_closed, query_message, roundtrip, startup_message, wait_until, EchoUpstream,
    RelayHandle,
};

#[test]
fn relays_bytes_in_both_directions() {
    let upstream = EchoUpstream::spawn().unwrap();
    let relay = RelayHandle::spawn(upstream.addr);
    let mut client = connect(relay.addr);

    let startup = startup_message("app");
    assert_eq!(roundtrip(&mut client, &startup), startup);

    // Largest payload a single receive can carry
    let payload: Vec<u8> = (0..1023).map(|i| (i % 251) as u8).collect();
    assert_eq!(roundtrip(&mut client, &payload), payload);

    assert_eq!(upstream.connection_count(), 1);
    assert_eq!(relay.active_pairs(), 1);
}

#[test]
fn logs_simple_queries_after_startup() {
    let upstream = EchoUpstream::spawn().unwrap();
    let mut relay = RelayHandle::spawn(upstream.addr);
    let mut client = connect(relay.addr);

    roundtrip(&mut client, &startup_message("app"));

    let first = query_message("SELECT 1");
    assert_eq!(roundtrip(&mut client, &first), first);
    let second = query_message("INSERT INTO t VALUES (42)");
    assert_eq!(roundtrip(&mut client, &second), second);

    relay.stop().unwrap();
    assert_eq!(
        relay.logged_queries(),
        "SELECT 1\nINSERT INTO t VALUES (42)\n"
    );
    assert_eq!(relay.counter(|s| &s.queries_logged), 2);
}

#[test]
fn first_chunk_is_never_logged() {
    let upstream = EchoUpstream::spawn().unwrap();
    let mut relay = RelayHandle::spawn(upstream.addr);
    let mut client = connect(relay.addr);

    // Looks like a query, but it is the connection's first chunk
    let first = query_message("SELECT 'not a query'");
    assert_eq!(roundtrip(&mut client, &first), first);

    relay.stop().unwrap();
    assert_eq!(relay.logged_queries(), "");
}

#[test]
fn truncated_query_is_relayed_but_not_logged() {
    let upstream = EchoUpstream::spawn().unwrap();
    let mut relay = RelayHandle::spawn(upstream.addr);
    let mut client = connect(relay.addr);

    roundtrip(&mut client, &startup_message("app"));
    assert_eq!(roundtrip(&mut client, b"Q"), b"Q");

    // The pair keeps working afterwards
    let query = query_message("SELECT 2");
    assert_eq!(roundtrip(&mut client, &query), query);

    relay.stop().unwrap();
    assert_eq!(relay.logged_queries(), "SELECT 2\n");
    assert_eq!(relay.counter(|s| &s.malformed_queries), 1);
}

#[test]
fn each_client_gets_its_own_upstream() {
    let upstream = EchoUpstream::spawn().unwrap();
    let mut relay = RelayHandle::spawn(upstream.addr);

    let mut clients: Vec<_> = (0..3).map(|_| connect(relay.addr)).collect();
    for (i, client) in clients.iter_mut().enumerate() {
        roundtrip(client, &startup_message(&format!("user{}", i)));
    }
    wait_until("three pairs", || relay.active_pairs() == 3);
    assert_eq!(upstream.connection_count(), 3);

    for (i, client) in clients.iter_mut().enumerate() {
        let query = query_message(&format!("SELECT {}", i));
        assert_eq!(roundtrip(client, &query), query);
    }

    relay.stop().unwrap();
    assert_eq!(relay.logged_queries(), "SELECT 0\nSELECT 1\nSELECT 2\n");
}

#[test]
fn client_disconnect_closes_upstream() {
    let upstream = EchoUpstream::spawn().unwrap();
    let relay = RelayHandle::spawn(upstream.addr);
    let mut client = connect(relay.addr);

    roundtrip(&mut client, &startup_message("app"));
    wait_until("pair to open", || relay.active_pairs() == 1);

    drop(client);

    wait_until("pair to close", || relay.active_pairs() == 0);
    wait_until("upstream to see close", || upstream.closed_count() == 1);
    assert_eq!(relay.counter(|s| &s.pairs_closed), 1);
}

#[test]
fn upstream_disconnect_closes_client() {
    let upstream = EchoUpstream::spawn_closing().unwrap();
    let relay = RelayHandle::spawn(upstream.addr);
    let mut client = connect(relay.addr);

    let startup = startup_message("app");
    assert_eq!(roundtrip(&mut client, &startup), startup);

    assert!(is_closed(&mut client));
    wait_until("pair to close", || relay.active_pairs() == 0);
}

#[test]
fn unreachable_upstream_drops_client() {
    let dead = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let relay = RelayHandle::spawn(dead_addr);
    let mut client = connect(relay.addr);

    assert!(is_closed(&mut client));
    wait_until("connect failure", || {
        relay.counter(|s| &s.upstream_connect_failures) == 1
    });
    assert_eq!(relay.active_pairs(), 0);

    // The relay keeps accepting afterwards
    let mut second = connect(relay.addr);
    assert!(is_closed(&mut second));
    wait_until("second connect failure", || {
        relay.counter(|s| &s.upstream_connect_failures) == 2
    });
}
