//! Two hosts talking over loopback.

use std::time::{Duration, Instant};

use nebula_rudp::{DisconnectCause, Event, Host, HostConfig, HostError, Packet, PeerId, PeerState};

fn bind(config: HostConfig) -> Host {
    Host::bind("127.0.0.1:0".parse().unwrap(), config).unwrap()
}

fn fast_pings() -> HostConfig {
    HostConfig {
        ping_interval: Duration::from_millis(50),
        ..HostConfig::default()
    }
}

/// Service both hosts until `done` holds for the events collected so far.
fn pump(
    a: &mut Host,
    b: &mut Host,
    mut done: impl FnMut(&[Event], &[Event]) -> bool,
) -> (Vec<Event>, Vec<Event>) {
    let deadline = Instant::now() + Duration::from_secs(10);
    let (mut from_a, mut from_b) = (Vec::new(), Vec::new());
    while !done(&from_a, &from_b) {
        assert!(
            Instant::now() < deadline,
            "gave up waiting; a: {from_a:?}, b: {from_b:?}"
        );
        if let Some(event) = a.service(Duration::from_millis(1)).unwrap() {
            from_a.push(event);
        }
        if let Some(event) = b.service(Duration::from_millis(1)).unwrap() {
            from_b.push(event);
        }
    }
    (from_a, from_b)
}

/// Service both hosts for `duration`, collecting whatever happens.
fn pump_for(a: &mut Host, b: &mut Host, duration: Duration) -> (Vec<Event>, Vec<Event>) {
    let until = Instant::now() + duration;
    pump(a, b, |_, _| Instant::now() >= until)
}

fn connect_event(events: &[Event]) -> Option<(PeerId, u32)> {
    events.iter().find_map(|event| match event {
        Event::Connect { peer, data } => Some((*peer, *data)),
        _ => None,
    })
}

fn received(events: &[Event]) -> Vec<Vec<u8>> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::Receive { packet, .. } => Some(packet.data().to_vec()),
            _ => None,
        })
        .collect()
}

fn disconnects(events: &[Event]) -> Vec<DisconnectCause> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::Disconnect { cause, .. } => Some(*cause),
            _ => None,
        })
        .collect()
}

/// Returns `(a's id for b, b's id for a)`.
fn connect_pair(a: &mut Host, b: &mut Host) -> (PeerId, PeerId) {
    let to_b = a.connect(b.local_addr(), 2, 42).unwrap();
    let (from_a, from_b) = pump(a, b, |ea, eb| {
        connect_event(ea).is_some() && connect_event(eb).is_some()
    });
    let (a_side, _) = connect_event(&from_a).unwrap();
    let (b_side, data) = connect_event(&from_b).unwrap();
    assert_eq!(a_side, to_b);
    assert_eq!(data, 42);
    assert_eq!(a.peer(to_b).unwrap().state(), PeerState::Connected);
    assert_eq!(b.peer(b_side).unwrap().state(), PeerState::Connected);
    assert_eq!(b.peer(b_side).unwrap().channel_count(), 2);
    (to_b, b_side)
}

#[test]
fn test_fifty_reliable_messages_arrive_in_order() {
    let mut a = bind(HostConfig::default());
    let mut b = bind(HostConfig::default());
    let (to_b, _) = connect_pair(&mut a, &mut b);

    for i in 0..50u32 {
        a.send(to_b, 0, Packet::reliable(i.to_be_bytes().to_vec()))
            .unwrap();
    }
    let (from_a, mut from_b) = pump(&mut a, &mut b, |_, eb| received(eb).len() == 50);
    let (more_a, more_b) = pump_for(&mut a, &mut b, Duration::from_millis(200));
    from_b.extend(more_b);

    let expected: Vec<Vec<u8>> = (0..50u32).map(|i| i.to_be_bytes().to_vec()).collect();
    assert_eq!(received(&from_b), expected);
    assert!(disconnects(&from_a).is_empty());
    assert!(disconnects(&more_a).is_empty());
    assert!(disconnects(&from_b).is_empty());
    assert_eq!(a.peer(to_b).unwrap().pending_reliable(), 0);
}

#[test]
fn test_channels_are_independent() {
    let mut a = bind(HostConfig::default());
    let mut b = bind(HostConfig::default());
    let (to_b, _) = connect_pair(&mut a, &mut b);

    a.send(to_b, 1, Packet::reliable(b"one".to_vec())).unwrap();
    a.send(to_b, 0, Packet::reliable(b"zero".to_vec())).unwrap();
    let (_, from_b) = pump(&mut a, &mut b, |_, eb| received(eb).len() == 2);
    let channels: Vec<u8> = from_b
        .iter()
        .filter_map(|event| match event {
            Event::Receive { channel, .. } => Some(*channel),
            _ => None,
        })
        .collect();
    assert_eq!(channels.len(), 2);
    assert!(channels.contains(&0) && channels.contains(&1));

    assert!(matches!(
        a.send(to_b, 2, Packet::reliable(vec![1])),
        Err(HostError::InvalidChannel(2))
    ));
}

#[test]
fn test_unreliable_packets_are_sequenced() {
    let mut a = bind(HostConfig::default());
    let mut b = bind(HostConfig::default());
    let (to_b, _) = connect_pair(&mut a, &mut b);

    for i in 0..10u8 {
        a.send(to_b, 0, Packet::unreliable(vec![i])).unwrap();
    }
    a.flush();
    let (_, from_b) = pump_for(&mut a, &mut b, Duration::from_millis(200));
    let got = received(&from_b);
    assert!(!got.is_empty());
    assert!(got.windows(2).all(|pair| pair[0][0] < pair[1][0]));
    assert!(from_b.iter().all(|event| match event {
        Event::Receive { packet, .. } => !packet.is_reliable(),
        _ => true,
    }));
}

#[test]
fn test_large_payloads_are_fragmented_and_reassembled() {
    let mut a = bind(HostConfig::default());
    let mut b = bind(HostConfig::default());
    let (to_b, _) = connect_pair(&mut a, &mut b);

    let big: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let oversized_unreliable = vec![9u8; 5000];
    a.send(to_b, 0, Packet::reliable(big.clone())).unwrap();
    a.send(to_b, 1, Packet::unreliable(oversized_unreliable.clone()))
        .unwrap();

    let (_, from_b) = pump(&mut a, &mut b, |_, eb| received(eb).len() == 2);
    let got = received(&from_b);
    assert!(got.contains(&big));
    assert!(got.contains(&oversized_unreliable));
}

#[test]
fn test_graceful_disconnect_reports_both_sides() {
    let mut a = bind(HostConfig::default());
    let mut b = bind(HostConfig::default());
    let (to_b, to_a) = connect_pair(&mut a, &mut b);

    a.disconnect(to_b, 7).unwrap();
    let (from_a, from_b) = pump(&mut a, &mut b, |ea, eb| {
        !disconnects(ea).is_empty() && !disconnects(eb).is_empty()
    });
    assert_eq!(disconnects(&from_a), vec![DisconnectCause::Local]);
    assert_eq!(disconnects(&from_b), vec![DisconnectCause::Remote]);
    assert!(from_b.iter().any(|event| matches!(
        event,
        Event::Disconnect { peer, data: 7, .. } if *peer == to_a
    )));
    assert!(a.peer(to_b).is_none());
    assert!(b.peer(to_a).is_none());
    assert_eq!(a.connected_peers().count(), 0);
}

#[test]
fn test_disconnect_later_drains_queue_first() {
    let mut a = bind(HostConfig::default());
    let mut b = bind(HostConfig::default());
    let (to_b, _) = connect_pair(&mut a, &mut b);

    for i in 0..20u8 {
        a.send(to_b, 0, Packet::reliable(vec![i; 300])).unwrap();
    }
    a.disconnect_later(to_b, 0).unwrap();
    assert_eq!(a.peer(to_b).unwrap().state(), PeerState::DisconnectLater);
    assert!(matches!(
        a.send(to_b, 0, Packet::reliable(vec![1])),
        Err(HostError::NotConnected)
    ));

    let (_, from_b) = pump(&mut a, &mut b, |_, eb| !disconnects(eb).is_empty());
    assert_eq!(received(&from_b).len(), 20);
    let last = from_b.last().unwrap();
    assert!(matches!(last, Event::Disconnect { cause: DisconnectCause::Remote, .. }));
}

#[test]
fn test_silent_peer_times_out() {
    let mut a = bind(fast_pings());
    let mut b = bind(fast_pings());
    let (to_b, _) = connect_pair(&mut a, &mut b);
    a.set_timeout(to_b, 4, Duration::from_millis(100), Duration::from_millis(500))
        .unwrap();
    drop(b);

    let deadline = Instant::now() + Duration::from_secs(5);
    let cause = loop {
        assert!(Instant::now() < deadline, "no timeout reported");
        if let Some(Event::Disconnect { peer, cause, .. }) =
            a.service(Duration::from_millis(10)).unwrap()
        {
            assert_eq!(peer, to_b);
            break cause;
        }
    };
    assert_eq!(cause, DisconnectCause::Timeout);
    assert!(a.peer(to_b).is_none());
}

#[test]
fn test_connect_to_silent_address_times_out() {
    let mut a = bind(HostConfig::default());
    let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let peer = a.connect(silent.local_addr().unwrap(), 1, 0).unwrap();
    a.set_timeout(peer, 4, Duration::from_millis(100), Duration::from_millis(1500))
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        assert!(Instant::now() < deadline, "connect never gave up");
        match a.service(Duration::from_millis(10)).unwrap() {
            Some(Event::Disconnect { cause, .. }) => {
                assert_eq!(cause, DisconnectCause::Timeout);
                break;
            }
            Some(other) => panic!("unexpected event {other:?}"),
            None => {}
        }
    }
}

#[test]
fn test_compressed_traffic() {
    let config = HostConfig {
        compress: true,
        ..HostConfig::default()
    };
    let mut a = bind(config.clone());
    let mut b = bind(config);
    let (to_b, _) = connect_pair(&mut a, &mut b);

    let sent_before = a.stats().bytes_sent;
    let payload = vec![0u8; 20_000];
    a.send(to_b, 0, Packet::reliable(payload.clone())).unwrap();
    let (_, from_b) = pump(&mut a, &mut b, |_, eb| !received(eb).is_empty());
    assert_eq!(received(&from_b), vec![payload]);
    assert!(a.stats().bytes_sent - sent_before < 10_000);
}

#[test]
fn test_broadcast_reaches_every_connected_peer() {
    let mut server = bind(HostConfig::default());
    let mut one = bind(HostConfig::default());
    let mut two = bind(HostConfig::default());
    connect_pair(&mut one, &mut server);
    connect_pair(&mut two, &mut server);
    assert_eq!(server.connected_peers().count(), 2);

    server.broadcast(0, Packet::reliable(b"hello".to_vec()));
    let (got_one, _) = pump(&mut one, &mut server, |e, _| !received(e).is_empty());
    let (got_two, _) = pump(&mut two, &mut server, |e, _| !received(e).is_empty());
    assert_eq!(received(&got_one), vec![b"hello".to_vec()]);
    assert_eq!(received(&got_two), vec![b"hello".to_vec()]);
}

#[test]
fn test_round_trip_is_measured_and_limits_propagate() {
    let mut a = bind(fast_pings());
    let mut b = bind(fast_pings());
    let (to_b, to_a) = connect_pair(&mut a, &mut b);

    a.ping(to_b).unwrap();
    a.set_bandwidth_limit(50_000, 0);
    a.configure_throttle(to_b, Duration::from_secs(1), 3, 4).unwrap();
    pump_for(&mut a, &mut b, Duration::from_millis(300));

    let peer = a.peer(to_b).unwrap();
    assert!(peer.round_trip_time() < Duration::from_millis(500));
    assert_eq!(peer.packet_loss(), 0.0);
    assert!(b.peer(to_a).unwrap().packet_throttle() > 0);
    assert_eq!(a.config().incoming_bandwidth, 50_000);
}

#[test]
fn test_full_host_ignores_extra_connections() {
    let mut server = bind(HostConfig {
        peer_count: 1,
        ..HostConfig::default()
    });
    let mut first = bind(HostConfig::default());
    let mut second = bind(HostConfig::default());
    connect_pair(&mut first, &mut server);

    second.connect(server.local_addr(), 1, 0).unwrap();
    let (got, _) = pump_for(&mut second, &mut server, Duration::from_millis(300));
    assert!(connect_event(&got).is_none());
    assert_eq!(server.connected_peers().count(), 1);
}
