//! Durability of the connection-intent store across reopen.

use meshtun::intent::{ClientState, IntentStore};
use std::net::Ipv4Addr;

fn ip(last: u8) -> Ipv4Addr {
    Ipv4Addr::new(10, 8, 0, last)
}

#[test]
fn connected_routing_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("intent.db");

    {
        let store = IntentStore::open(&path).unwrap();
        store.set_connected(ip(2), "c1", true).unwrap();
        // Dropped without any explicit flush, as a crash would.
    }

    let store = IntentStore::open(&path).unwrap();
    let invites = store.clients_for_invite().unwrap();
    assert_eq!(invites.len(), 1);
    assert_eq!(invites[0].node_name, "c1");
    assert_eq!(invites[0].vpn_address, ip(2));
    assert!(invites[0].route_all);
}

#[test]
fn intentional_disconnect_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("intent.db");

    {
        let store = IntentStore::open(&path).unwrap();
        store.set_connected(ip(2), "c1", true).unwrap();
        store
            .set_disconnected_intentional(ip(2), "user request")
            .unwrap();
    }

    let store = IntentStore::open(&path).unwrap();
    assert!(store.clients_for_invite().unwrap().is_empty());

    let record = store.get(ip(2)).unwrap().unwrap();
    assert_eq!(record.state, ClientState::DisconnectedIntentional);
    assert_eq!(record.disconnect_reason.as_deref(), Some("user request"));
    assert!(record.disconnected_at.is_some());
}

#[test]
fn connected_without_routing_is_not_invited() {
    let dir = tempfile::tempdir().unwrap();
    let store = IntentStore::open(&dir.path().join("intent.db")).unwrap();

    store.set_connected(ip(2), "c1", false).unwrap();
    store.set_connected(ip(3), "c2", true).unwrap();

    let invites = store.clients_for_invite().unwrap();
    assert_eq!(invites.len(), 1);
    assert_eq!(invites[0].node_name, "c2");
}

#[test]
fn route_all_toggle_moves_between_connected_states() {
    let dir = tempfile::tempdir().unwrap();
    let store = IntentStore::open(&dir.path().join("intent.db")).unwrap();

    store.set_connected(ip(2), "c1", true).unwrap();
    assert_eq!(
        store.get(ip(2)).unwrap().unwrap().state,
        ClientState::ConnectedRouting
    );

    store.set_route_all(ip(2), false).unwrap();
    let record = store.get(ip(2)).unwrap().unwrap();
    assert_eq!(record.state, ClientState::ConnectedNoRouting);
    assert!(!record.route_all);

    store.set_route_all(ip(2), true).unwrap();
    assert_eq!(
        store.get(ip(2)).unwrap().unwrap().state,
        ClientState::ConnectedRouting
    );
}

#[test]
fn reconnect_refreshes_but_never_deletes() {
    let dir = tempfile::tempdir().unwrap();
    let store = IntentStore::open(&dir.path().join("intent.db")).unwrap();

    store.set_connected(ip(2), "c1", true).unwrap();
    store
        .set_disconnected_intentional(ip(2), "user request")
        .unwrap();

    // A later reconnect overwrites the intent in place.
    store.set_connected(ip(2), "c1", false).unwrap();
    let record = store.get(ip(2)).unwrap().unwrap();
    assert_eq!(record.state, ClientState::ConnectedNoRouting);
    assert!(record.disconnect_reason.is_none());

    assert_eq!(store.all().unwrap().len(), 1);
}

#[test]
fn missing_record_is_none() {
    let dir = tempfile::tempdir().unwrap();
    let store = IntentStore::open(&dir.path().join("intent.db")).unwrap();
    assert!(store.get(ip(99)).unwrap().is_none());
}
