//! Engine scenarios driven through a recording radio and a manual clock

mod common;

use common::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use zwave_protocol::{
    Addressing, ChannelProfile, ExploreHeader, Frame, FrameHeader, Header2ch, HomeId,
    ListeningMode, Speed, WakeupBeam,
};
use zwave_routing::{RouteCacheLine, RouteSelector, RouteSource};
use zwave_transport::{
    BeamKind, CountingIrq, EngineConfig, PhyStatus, RadioEvent, RelayDecision, RouteScheme,
    TxError, TxFrame, TxPriority, TxRequest, TxState, TxStatus,
};

fn payload() -> Vec<u8> {
    vec![0x25, 0x01, 0xFF]
}

// ====================
// Delivery and scheduling
// ====================

#[test]
fn test_direct_delivery_caches_route() {
    let mut h = Harness::classic();
    h.add_repeater(2);
    h.link(1, 2);

    let empties = Arc::new(AtomicUsize::new(0));
    let e = Arc::clone(&empties);
    h.engine
        .register_queue_empty_listener(Box::new(move || {
            e.fetch_add(1, Ordering::SeqCst);
        }));

    let (handle, reports) = h.submit(TxRequest::new(node(2), payload()));
    assert_eq!(h.engine.state(handle), TxState::Transmitting);
    h.run(ack_all);

    let reports = reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, TxStatus::Ok);
    assert_eq!(reports[0].scheme, RouteScheme::Direct);
    assert_eq!(reports[0].speed, Speed::Kbps100);
    assert_eq!(reports[0].transmit_count, 1);

    assert_eq!(h.engine.state(handle), TxState::Free);
    assert_eq!(empties.load(Ordering::SeqCst), 1);
    assert!(h.engine.is_idle());

    let cached = h.engine.route_cache().get(node(2), RouteSelector::Lwr).unwrap();
    assert!(cached.is_direct());
    assert_eq!(cached.source(), RouteSource::RoutedFrame);
}

#[test]
fn test_high_priority_overtakes_low() {
    let mut h = Harness::classic();
    for id in [2, 3, 4] {
        h.add_repeater(id);
        h.link(1, id);
    }

    h.submit(TxRequest::new(node(2), payload()));
    h.submit(TxRequest::new(node(3), payload()).with_priority(TxPriority::Low));
    h.submit(TxRequest::new(node(4), payload()));
    h.run(ack_all);

    let order: Vec<_> = h
        .radio
        .frames()
        .iter()
        .filter_map(|f| f.destination)
        .collect();
    assert_eq!(order, vec![node(2), node(4), node(3)]);
}

#[test]
fn test_queue_full_reserves_slot_for_high() {
    let mut h = Harness::classic();
    h.add_repeater(2);
    h.link(1, 2);

    for _ in 0..3 {
        h.submit(TxRequest::new(node(2), payload()).with_priority(TxPriority::Low));
    }
    let low = h.engine.submit(
        TxRequest::new(node(2), payload()).with_priority(TxPriority::Low),
        None,
        h.now,
    );
    assert!(matches!(low, Err(TxError::QueueFull)));
    assert!(h
        .engine
        .submit(TxRequest::new(node(2), payload()), None, h.now)
        .is_ok());
}

#[test]
fn test_delayed_transmission() {
    let mut h = Harness::classic();
    h.add_repeater(2);
    h.link(1, 2);

    let start = h.now;
    let (handle, reports) =
        h.submit(TxRequest::new(node(2), payload()).with_delay(Duration::from_millis(500)));
    assert_eq!(h.engine.state(handle), TxState::DelayedTxWait);
    assert!(h.radio.sent().is_empty());
    assert_eq!(
        h.engine.next_deadline(),
        Some(start + Duration::from_millis(500))
    );

    h.advance(Duration::from_millis(499));
    assert!(h.radio.sent().is_empty());
    h.advance(Duration::from_millis(1));
    assert_eq!(h.radio.frames().len(), 1);

    h.run(ack_all);
    assert_eq!(reports.lock().unwrap()[0].status, TxStatus::Ok);
}

// ====================
// Retries and the route ladder
// ====================

#[test]
fn test_every_route_and_speed_exhausted() {
    let mut h = Harness::classic();
    for id in [2, 3] {
        h.add_repeater(id);
    }
    h.link(1, 2);
    h.link(1, 3);
    h.link(2, 3);

    let (_, reports) = h.submit(TxRequest::new(node(3), payload()).without_explore());
    h.run(no_ack);

    let report = reports.lock().unwrap()[0].clone();
    assert_eq!(report.status, TxStatus::NoAck);
    // direct and via 2, each three times at 100k, 40k and 9.6k
    assert_eq!(report.transmit_count, 18);

    let frames = h.radio.frames();
    assert_eq!(frames.len(), 18);
    let speeds: Vec<_> = frames[..9].iter().map(|f| f.speed).collect();
    assert_eq!(
        speeds,
        [[Speed::Kbps100; 3], [Speed::Kbps40; 3], [Speed::Kbps9_6; 3]].concat()
    );
    assert!(frames[..9].iter().all(|f| repeaters(f).is_empty()));
    assert!(frames[9..].iter().all(|f| repeaters(f) == vec![node(2)]));
}

#[test]
fn test_failed_lwr_is_demoted() {
    let mut h = Harness::classic();
    for id in [2, 3, 5] {
        h.add_repeater(id);
    }
    h.link(1, 2);
    h.link(1, 3);
    h.link(3, 5);
    h.engine
        .route_cache_mut()
        .store(
            node(5),
            RouteCacheLine::new(vec![node(2)], Speed::Kbps100, RouteSource::RoutedFrame).unwrap(),
        )
        .unwrap();

    let (_, reports) = h.submit(TxRequest::new(node(5), payload()));
    h.run(|frame| {
        (repeaters(frame) == vec![node(3)]).then(|| RadioEvent::AckReceived {
            from: node(5),
            routed: true,
        })
    });

    let report = reports.lock().unwrap()[0].clone();
    assert_eq!(report.status, TxStatus::Ok);
    assert_eq!(report.scheme, RouteScheme::Resolved);
    assert_eq!(report.route, vec![node(3)]);
    assert_eq!(report.transmit_count, 10);

    let cache = h.engine.route_cache();
    assert_eq!(
        cache.get(node(5), RouteSelector::Lwr).unwrap().repeaters(),
        &[node(3)]
    );
    assert_eq!(
        cache.get(node(5), RouteSelector::Nlwr).unwrap().repeaters(),
        &[node(2)]
    );
}

#[test]
fn test_routed_error_moves_to_next_route() {
    let mut h = Harness::classic();
    for id in [2, 3, 5] {
        h.add_repeater(id);
    }
    h.link(1, 2);
    h.link(1, 3);
    h.link(2, 5);
    h.link(3, 5);

    let (_, reports) = h.submit(TxRequest::new(node(5), payload()));
    h.run(|frame| match repeaters(frame).as_slice() {
        [first] if *first == node(2) => Some(RadioEvent::RoutedError { reporter: node(2) }),
        _ => ack_all(frame),
    });

    let report = reports.lock().unwrap()[0].clone();
    assert_eq!(report.status, TxStatus::Ok);
    assert_eq!(report.route, vec![node(3)]);
    assert_eq!(report.transmit_count, 2);
}

#[test]
fn test_routed_ack_pauses_radio() {
    let mut h = Harness::classic();
    for id in [2, 3, 5] {
        h.add_repeater(id);
    }
    h.link(1, 2);
    h.link(2, 5);
    h.link(1, 3);

    h.submit(TxRequest::new(node(5), payload()));
    h.next_sent();
    h.complete(PhyStatus::Ok);
    h.event(RadioEvent::AckReceived {
        from: node(5),
        routed: true,
    });

    let acked = h.now;
    h.submit(TxRequest::new(node(3), payload()));
    assert_eq!(h.radio.frames().len(), 1);
    assert_eq!(h.engine.next_deadline(), Some(acked + Duration::from_millis(15)));

    h.advance(Duration::from_millis(15));
    assert_eq!(h.radio.frames().len(), 2);
}

#[test]
fn test_long_range_is_direct_only() {
    let mut h = Harness::new(config(ChannelProfile::LongRange));

    let (_, reports) = h.submit(TxRequest::new(node(257), payload()));
    h.run(no_ack);

    let report = reports.lock().unwrap()[0].clone();
    assert_eq!(report.status, TxStatus::NoAck);
    assert_eq!(report.transmit_count, 3);
    assert!(h
        .radio
        .frames()
        .iter()
        .all(|f| f.speed == Speed::Kbps100Lr && f.profile == ChannelProfile::LongRange));
    assert!(h.engine.route_cache().destinations().next().is_none());
}

#[test]
fn test_destination_checks() {
    let mut h = Harness::classic();
    assert!(matches!(
        h.engine.submit(TxRequest::new(node(1), payload()), None, h.now),
        Err(TxError::InvalidDestination(_))
    ));
    assert!(matches!(
        h.engine.submit(TxRequest::new(node(300), payload()), None, h.now),
        Err(TxError::InvalidDestination(_))
    ));
    assert!(h.engine.queue().is_empty());
}

// ====================
// Listen before talk and size limits
// ====================

#[test]
fn test_lbt_failures_inside_window_are_free() {
    let mut h = Harness::classic();
    h.add_repeater(2);
    h.link(1, 2);

    let (_, reports) = h.submit(TxRequest::new(node(2), payload()));
    h.complete(PhyStatus::LbtFailure);
    assert_eq!(h.radio.frames().len(), 2);

    h.now += Duration::from_millis(1200);
    h.complete(PhyStatus::LbtFailure);
    assert_eq!(h.radio.frames().len(), 3);

    h.complete(PhyStatus::Ok);
    h.event(RadioEvent::AckReceived {
        from: node(2),
        routed: false,
    });

    let report = reports.lock().unwrap()[0].clone();
    assert_eq!(report.status, TxStatus::Ok);
    assert_eq!(report.transmit_count, 1);
}

#[test]
fn test_oversized_frame_rejected_without_callback() {
    let mut h = Harness::classic();
    h.add_repeater(2);
    h.link(1, 2);

    let called = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&called);
    let result = h.engine.submit(
        TxRequest::new(node(2), vec![0; 200]),
        Some(Box::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        })),
        h.now,
    );

    assert!(matches!(result, Err(TxError::FrameTooLarge { size: 200, .. })));
    assert_eq!(called.load(Ordering::SeqCst), 0);
    assert!(h.engine.queue().is_empty());
    assert!(h.radio.sent().is_empty());
}

#[test]
fn test_frame_too_large_for_routed_header_rejected_at_submit() {
    let mut h = Harness::classic();
    for id in [2, 3] {
        h.add_repeater(id);
    }
    h.link(1, 2);
    h.link(2, 3);
    h.link(1, 3);

    // fits behind a direct header at 100k but not behind a routed one
    let result = h.engine.submit(
        TxRequest::new(node(3), vec![0; 159]).without_explore(),
        None,
        h.now,
    );

    match result {
        Err(TxError::FrameTooLarge { size, max }) => {
            assert_eq!(size, 159);
            assert!(max < 159);
        }
        other => panic!("expected FrameTooLarge, got {:?}", other.map(|_| ())),
    }
    assert!(h.engine.queue().is_empty());
    assert!(h.radio.sent().is_empty());
}

#[test]
fn test_large_frame_still_walks_routed_rungs() {
    let mut h = Harness::classic();
    for id in [2, 3] {
        h.add_repeater(id);
    }
    h.link(1, 2);
    h.link(2, 3);
    h.link(1, 3);

    let (_, reports) = h.submit(TxRequest::new(node(3), vec![0; 120]).without_explore());
    h.run(no_ack);

    let reports = reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, TxStatus::NoAck);
    assert!(h
        .radio
        .frames()
        .iter()
        .any(|f| repeaters(f) == vec![node(2)]));
}

#[test]
fn test_phy_too_large_ends_transmission() {
    let mut h = Harness::classic();
    h.add_repeater(2);
    h.link(1, 2);

    let (handle, reports) = h.submit(TxRequest::new(node(2), payload()));
    h.complete(PhyStatus::TooLarge);

    assert_eq!(reports.lock().unwrap()[0].status, TxStatus::FrameTooLarge);
    assert!(matches!(h.engine.cancel(handle), Err(TxError::StaleHandle)));
}

// ====================
// Cancellation
// ====================

#[test]
fn test_cancel_queued_frame() {
    let mut h = Harness::classic();
    h.add_repeater(2);
    h.link(1, 2);

    let (handle, reports) =
        h.submit(TxRequest::new(node(2), payload()).with_delay(Duration::from_secs(1)));
    h.engine.cancel(handle).unwrap();

    assert_eq!(reports.lock().unwrap()[0].status, TxStatus::Cancelled);
    assert_eq!(h.engine.state(handle), TxState::Free);
    h.advance(Duration::from_secs(2));
    assert!(h.radio.sent().is_empty());
}

#[test]
fn test_cancel_on_air_waits_for_attempt() {
    let mut h = Harness::classic();
    h.add_repeater(2);
    h.link(1, 2);

    let (handle, reports) = h.submit(TxRequest::new(node(2), payload()));
    h.engine.cancel(handle).unwrap();
    assert_eq!(h.engine.state(handle), TxState::Transmitting);
    assert!(reports.lock().unwrap().is_empty());

    h.run(no_ack);

    let reports = reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, TxStatus::Cancelled);
    assert_eq!(h.radio.frames().len(), 1);
}

// ====================
// Wake-up beams
// ====================

#[test]
fn test_fragmented_beam_until_beam_ack() {
    let mut h = Harness::new(config(ChannelProfile::ThreeChannel));
    h.add_end_device(2, ListeningMode::Frequent1000ms);
    h.link(1, 2);

    let (_, reports) = h.submit(TxRequest::new(node(2), payload()));
    let beams = h.radio.beams();
    assert_eq!(beams.len(), 1);
    assert_eq!(beams[0].kind, BeamKind::Fragment { index: 0, total: 15 });

    let sent = h.now;
    h.event(RadioEvent::BeamComplete);
    assert_eq!(h.radio.beams().len(), 1);
    assert_eq!(h.engine.next_deadline(), Some(sent + Duration::from_millis(90)));

    h.advance(Duration::from_millis(90));
    assert_eq!(
        h.radio.beams()[1].kind,
        BeamKind::Fragment { index: 1, total: 15 }
    );

    h.event(RadioEvent::BeamAck { source: node(2) });
    assert_eq!(h.radio.frames().len(), 1);
    // the fragment still on the air ends after the data frame was queued
    h.event(RadioEvent::BeamComplete);
    assert_eq!(h.radio.beams().len(), 2);

    h.complete(PhyStatus::Ok);
    h.event(RadioEvent::AckReceived {
        from: node(2),
        routed: false,
    });
    assert_eq!(reports.lock().unwrap()[0].status, TxStatus::Ok);
}

#[test]
fn test_full_fragment_train_then_data() {
    let mut h = Harness::new(config(ChannelProfile::ThreeChannel));
    h.add_end_device(2, ListeningMode::Frequent250ms);
    h.link(1, 2);

    let (_, reports) = h.submit(TxRequest::new(node(2), payload()));
    h.run(ack_all);

    let beams = h.radio.beams();
    assert_eq!(beams.len(), 15);
    for (i, beam) in beams.iter().enumerate() {
        assert_eq!(
            beam.kind,
            BeamKind::Fragment {
                index: i as u32,
                total: 15
            }
        );
    }
    assert!(matches!(h.radio.sent().last(), Some(Sent::Frame(_))));
    assert_eq!(reports.lock().unwrap()[0].status, TxStatus::Ok);
}

#[test]
fn test_continuous_beam_on_two_channel() {
    let mut h = Harness::classic();
    h.add_end_device(2, ListeningMode::Frequent250ms);
    h.link(1, 2);

    let (_, reports) = h.submit(TxRequest::new(node(2), payload()));
    assert_eq!(
        h.radio.beams()[0].kind,
        BeamKind::Continuous { duration_ms: 250 }
    );
    h.run(ack_all);

    assert_eq!(h.radio.beams().len(), 1);
    assert_eq!(h.radio.frames().len(), 1);
    assert_eq!(reports.lock().unwrap()[0].status, TxStatus::Ok);
}

// ====================
// Explore
// ====================

#[test]
fn test_explore_finds_route() {
    let mut h = Harness::classic();

    let (_, reports) = h.submit(TxRequest::new(node(9), payload()));
    h.run(|frame| {
        explore_session(frame).map(|session| RadioEvent::ExploreResult {
            session,
            repeaters: vec![node(4)],
        })
    });

    let report = reports.lock().unwrap()[0].clone();
    assert_eq!(report.status, TxStatus::Ok);
    assert_eq!(report.scheme, RouteScheme::ResortExplore);
    assert_eq!(report.route, vec![node(4)]);
    // three last-resort direct attempts and the explore frame
    assert_eq!(report.transmit_count, 4);
    assert_eq!(h.radio.frames().last().unwrap().speed, Speed::Kbps40);

    let cached = h.engine.route_cache().get(node(9), RouteSelector::Lwr).unwrap();
    assert_eq!(cached.repeaters(), &[node(4)]);
    assert_eq!(cached.source(), RouteSource::Explore);
}

#[test]
fn test_explore_timeout_reports_no_route() {
    let mut h = Harness::classic();

    let (_, reports) = h.submit(TxRequest::new(node(9), payload()));
    h.run(no_ack);

    let report = reports.lock().unwrap()[0].clone();
    assert_eq!(report.status, TxStatus::NoRoute);
    assert_eq!(report.transmit_count, 4);
    assert!(explore_session(h.radio.frames().last().unwrap()).is_some());
}

#[test]
fn test_explore_frames_relayed_once() {
    let mut h = Harness::classic();
    let frame = Frame::new(
        FrameHeader::TwoChannel(Header2ch {
            home_id: HomeId::default(),
            source: node(5),
            ack: false,
            low_power: false,
            speed_modified: false,
            multicast_followup: false,
            source_wakeup: WakeupBeam::None,
            sequence: 3,
            addressing: Addressing::Explore {
                destination: node(9),
                explore: ExploreHeader::new_search(4, 250),
            },
        }),
        payload(),
    );

    let decision = h.engine.on_explore_frame(&frame, h.now);
    let RelayDecision::Rebroadcast { delay, .. } = decision else {
        panic!("expected rebroadcast, got {:?}", decision);
    };
    if !delay.is_zero() {
        assert!(h.radio.sent().is_empty());
    }
    assert_eq!(
        h.engine.on_explore_frame(&frame, h.now),
        RelayDecision::Duplicate
    );

    h.advance(delay);
    let frames = h.radio.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].handle, None);
    assert_eq!(frames[0].destination, Some(node(9)));

    h.complete(PhyStatus::Ok);
    assert!(h.engine.is_idle());
}

fn classic_node(id: u16) -> Harness {
    Harness::new(EngineConfig {
        node_id: id,
        ..config(ChannelProfile::TwoChannel)
    })
}

/// Complete frames without ACKs until `h` puts an explore frame on the air
fn pump_until_explore(h: &mut Harness) -> Frame {
    for _ in 0..1_000 {
        match h.next_sent() {
            Some(Sent::Frame(frame)) => {
                h.complete(PhyStatus::Ok);
                if explore_session(&frame).is_some() {
                    return decode(&frame);
                }
            }
            Some(Sent::Beam(_)) => h.event(RadioEvent::BeamComplete),
            None => assert!(h.advance_to_deadline(), "no explore frame sent"),
        }
    }
    panic!("no explore frame sent");
}

/// Hand `frame` to `h` and return what it puts on the air in response
fn hear(h: &mut Harness, frame: &Frame) -> Frame {
    if let RelayDecision::Rebroadcast { delay, .. } = h.engine.on_explore_frame(frame, h.now) {
        h.advance(delay);
    }
    match h.next_sent() {
        Some(Sent::Frame(sent)) => {
            h.complete(PhyStatus::Ok);
            decode(&sent)
        }
        other => panic!("expected a frame, got {:?}", other),
    }
}

fn decode(frame: &TxFrame) -> Frame {
    Frame::decode(frame.profile, &frame.bytes, frame.speed).unwrap()
}

#[test]
fn test_explore_search_completes_between_engines() {
    let mut origin = classic_node(1);
    let mut repeater = classic_node(4);
    let mut target = classic_node(9);

    let (_, reports) = origin.submit(TxRequest::new(node(9), payload()));
    let search = pump_until_explore(&mut origin);
    let session = explore_session(origin.radio.frames().last().unwrap()).unwrap();

    let relayed = hear(&mut repeater, &search);
    let answer = hear(&mut target, &relayed);

    // the target learned the way back and answers along the same chain
    let back = target.engine.route_cache().get(node(1), RouteSelector::Lwr).unwrap();
    assert_eq!(back.repeaters(), &[node(4)]);
    assert_eq!(back.source(), RouteSource::Explore);
    assert_eq!(answer.header.source(), node(9));
    assert_eq!(answer.header.destination(), Some(node(1)));

    let forwarded = hear(&mut repeater, &answer);
    let decision = origin.engine.on_explore_frame(&forwarded, origin.now);
    assert_eq!(
        decision,
        RelayDecision::SearchResult {
            session,
            repeaters: vec![node(4)],
        }
    );

    let report = reports.lock().unwrap()[0].clone();
    assert_eq!(report.status, TxStatus::Ok);
    assert_eq!(report.scheme, RouteScheme::ResortExplore);
    assert_eq!(report.route, vec![node(4)]);
    let cached = origin.engine.route_cache().get(node(9), RouteSelector::Lwr).unwrap();
    assert_eq!(cached.repeaters(), &[node(4)]);
    assert_eq!(cached.source(), RouteSource::Explore);
}

#[test]
fn test_search_result_ignored_off_chain() {
    let mut origin = classic_node(1);
    let mut target = classic_node(9);
    let mut bystander = classic_node(6);

    origin.submit(TxRequest::new(node(9), payload()));
    let search = pump_until_explore(&mut origin);
    let answer = hear(&mut target, &search);

    assert_eq!(
        bystander.engine.on_explore_frame(&answer, bystander.now),
        RelayDecision::Ignored
    );
    assert!(bystander.radio.sent().is_empty());
}

// ====================
// Context plumbing
// ====================

#[test]
fn test_listeners_run_in_order_each_drain() {
    let mut h = Harness::classic();
    h.add_repeater(2);
    h.link(1, 2);

    let log = Arc::new(Mutex::new(Vec::new()));
    for name in ["metrics", "sleep"] {
        let log = Arc::clone(&log);
        h.engine
            .register_queue_empty_listener(Box::new(move || log.lock().unwrap().push(name)));
    }

    h.submit(TxRequest::new(node(2), payload()));
    h.run(ack_all);
    h.submit(TxRequest::new(node(2), payload()));
    h.run(ack_all);

    assert_eq!(
        *log.lock().unwrap(),
        vec!["metrics", "sleep", "metrics", "sleep"]
    );
}

#[test]
fn test_critical_sections_balanced() {
    let irq = Arc::new(CountingIrq::new());
    let mut h = Harness::classic().with_irq(irq.clone());
    h.add_repeater(2);
    h.link(1, 2);

    h.submit(TxRequest::new(node(2), payload()));
    h.run(no_ack);

    assert!(irq.entered() > 0);
    assert_eq!(irq.depth(), 0);
}

#[test]
fn test_pump_events_drains_channel() {
    let mut h = Harness::classic();
    h.add_repeater(2);
    h.link(1, 2);
    let (isr, mut events) = zwave_transport::event_channel();

    let (_, reports) = h.submit(TxRequest::new(node(2), payload()));
    isr.send(RadioEvent::TxComplete {
        status: PhyStatus::Ok,
    });
    isr.send(RadioEvent::AckReceived {
        from: node(2),
        routed: false,
    });

    assert_eq!(h.engine.pump_events(&mut events, h.now), 2);
    assert_eq!(reports.lock().unwrap()[0].status, TxStatus::Ok);
}
