//! Entry-guard behavior: the retry back-off schedule against a live
//! directory, reachability bookkeeping driven through the node, and state
//! persistence scheduling.

mod common;

use common::*;
use onion_core::circuit::CircuitPurpose;
use onion_core::config::Config;
use onion_core::events::EventSink;
use onion_core::guards::{format_time, GuardManager};
use onion_core::netdir::{NetDir, RelayId};
use onion_core::node::Action;
use rand::rngs::mock::StepRng;
use std::collections::HashSet;

const NOW: u64 = 1_700_000_000;

#[test]
fn unreachable_guard_respects_retry_window() {
    // Guard G: unreachable for 7 hours, last tried 2 hours ago. The
    // schedule says retry after 4 hours, so G is skipped now and eligible
    // three hours later.
    let g_id = RelayId::from([0x44; 20]);
    let state = format!(
        "EntryGuard guard1 {}\n\
         EntryGuardDownSince {} {}\n\
         EntryGuardAddedBy {} 0.1.0 {}\n",
        g_id,
        format_time(NOW - 7 * 3600),
        format_time(NOW - 2 * 3600),
        g_id,
        format_time(NOW - 30 * 24 * 3600),
    );
    let mut guards = GuardManager::new();
    guards.load_state(&state).unwrap();

    let dir = NetDir::new(vec![relay_entry(
        0x44,
        "guard1",
        "Fast Guard Running Stable Valid",
        5_000_000,
        vec![0x40],
        "reject *:*",
    )]);
    let mut cfg = Config::default();
    cfg.strict_entry_nodes = true;

    let exclude = HashSet::new();
    let mut rng = StepRng::new(0, 0);
    let mut events = EventSink::new();

    let chosen = guards.choose_entry(&dir, &cfg, &exclude, &mut rng, NOW, &mut events);
    assert!(chosen.is_none(), "retry window has not elapsed");

    let chosen = guards.choose_entry(&dir, &cfg, &exclude, &mut rng, NOW + 3 * 3600, &mut events);
    assert_eq!(chosen.map(|r| r.identity), Some(g_id), "eligible again");
}

#[test]
fn transport_failure_marks_guard_unreachable() {
    let relays = vec![
        relay_entry(0xAA, "alpha", "Fast Guard Running Stable Valid", 5_000_000, vec![], "reject *:*"),
        relay_entry(0xBB, "beta", "Fast Running Stable Valid", 4_000_000, vec![0xB0], "reject *:*"),
        relay_entry(0xCC, "gamma", "Exit Fast Running Stable Valid", 3_000_000, vec![0xC0], "accept *:*"),
    ];
    let mut node = client_node(Config::default(), relays, NOW);
    let circuit = node
        .launch_circuit(CircuitPurpose::General, None, NOW)
        .unwrap();
    let actions = node.take_actions();
    let (link, _, _) = expect_open_transport(&actions);

    node.link_transport_failed(link, "connection refused", NOW);

    let guard = node.guards().get(&RelayId::from([0xAA; 20])).expect("guard kept");
    assert_eq!(guard.unreachable_since, Some(NOW));
    assert_eq!(guard.last_attempted, Some(NOW));
    assert_eq!(node.circuit_state(circuit), None, "waiting circuit fails");
}

#[test]
fn guard_state_is_persisted_on_schedule() {
    let (mut node, _relays, _link, _wire, _circuit) =
        build_three_hop_circuit(Config::default(), "accept *:*", NOW);
    node.take_actions();

    node.tick(NOW + 1);
    let contents = node
        .take_actions()
        .into_iter()
        .find_map(|a| match a {
            Action::PersistGuardState { contents } => Some(contents),
            _ => None,
        })
        .expect("guard state should be written");
    assert!(contents.contains("EntryGuard alpha"));
    assert!(contents.contains("EntryGuardAddedBy"));

    // The written text loads back to the same list.
    let mut restored = GuardManager::new();
    restored.load_state(&contents).unwrap();
    assert_eq!(restored.guards().len(), 1);
    assert_eq!(
        restored.guards()[0].identity,
        RelayId::from([0xAA; 20])
    );

    // Once written, nothing more to write until the next change.
    node.tick(NOW + 2);
    let again = node
        .take_actions()
        .into_iter()
        .any(|a| matches!(a, Action::PersistGuardState { .. }));
    assert!(!again, "clean state is not rewritten");
}

#[test]
fn unlisted_guard_goes_bad_and_expires() {
    let relays = vec![
        relay_entry(0xAA, "alpha", "Fast Guard Running Stable Valid", 5_000_000, vec![], "reject *:*"),
        relay_entry(0xBB, "beta", "Fast Running Stable Valid", 4_000_000, vec![0xB0], "reject *:*"),
        relay_entry(0xCC, "gamma", "Exit Fast Running Stable Valid", 3_000_000, vec![0xC0], "accept *:*"),
    ];
    let mut node = client_node(Config::default(), relays.clone(), NOW);
    let _ = node.launch_circuit(CircuitPurpose::General, None, NOW);
    assert!(node.guards().get(&RelayId::from([0xAA; 20])).is_some());

    // A snapshot without alpha: the guard goes bad, but is kept.
    node.set_netdir(NetDir::new(relays[1..].to_vec()), NOW + 100);
    let guard = node.guards().get(&RelayId::from([0xAA; 20])).unwrap();
    assert_eq!(guard.bad_since, Some(NOW + 100));

    // Listed again: recovered.
    node.set_netdir(NetDir::new(relays.clone()), NOW + 200);
    let guard = node.guards().get(&RelayId::from([0xAA; 20])).unwrap();
    assert_eq!(guard.bad_since, None);

    // Unlisted for 30 days: dropped for good.
    node.set_netdir(NetDir::new(relays[1..].to_vec()), NOW + 300);
    node.set_netdir(
        NetDir::new(relays[1..].to_vec()),
        NOW + 300 + 30 * 24 * 3600,
    );
    assert!(node.guards().get(&RelayId::from([0xAA; 20])).is_none());
}
