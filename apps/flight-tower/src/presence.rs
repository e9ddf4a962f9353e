//! Presence: which other unpaired clients each connection can see.

use std::collections::{HashMap, HashSet};

use metrics::counter;
use tracing::debug;

use crate::coordinator::Coordinator;
use crate::flights::FlightTable;
use crate::network::group_key;
use crate::protocol::{PeerInfo, ServerMessage};
use crate::registry::ConnectionRegistry;

/// Full presence snapshot: connection id to the peers it should list.
pub fn compute_presence(
    registry: &ConnectionRegistry,
    flights: &FlightTable,
) -> HashMap<String, Vec<PeerInfo>> {
    let seated: HashSet<&str> = flights
        .flights()
        .filter(|flight| flight.is_full())
        .flat_map(|flight| flight.members.iter().map(String::as_str))
        .collect();

    let mut groups: HashMap<String, Vec<PeerInfo>> = HashMap::new();
    for client in registry.clients() {
        if seated.contains(client.id.as_str()) {
            continue;
        }
        groups
            .entry(group_key(&client.source_address))
            .or_default()
            .push(client.peer_info());
    }

    registry
        .clients()
        .map(|client| {
            let visible = if seated.contains(client.id.as_str()) {
                Vec::new()
            } else {
                groups
                    .get(&group_key(&client.source_address))
                    .map(|group| {
                        group
                            .iter()
                            .filter(|peer| peer.id != client.id)
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default()
            };
            (client.id.clone(), visible)
        })
        .collect()
}

impl Coordinator {
    /// Push a fresh snapshot to every connection. A failed delivery is
    /// logged by the registry and does not stop the rest.
    pub fn broadcast_presence(&self) {
        let snapshot = compute_presence(&self.registry, &self.flights);
        let mut failed = 0usize;
        for (id, users) in snapshot {
            if !self
                .registry
                .send(&id, ServerMessage::UsersOnNetworkUpdate { users })
            {
                failed += 1;
            }
        }
        counter!("flight_tower_presence_broadcasts_total", 1);
        if failed > 0 {
            debug!(failed, "presence update not delivered to every connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::tests::{drain, harness};

    fn last_presence(messages: Vec<ServerMessage>) -> Vec<PeerInfo> {
        messages
            .into_iter()
            .rev()
            .find_map(|m| match m {
                ServerMessage::UsersOnNetworkUpdate { users } => Some(users),
                _ => None,
            })
            .expect("presence update")
    }

    fn ids(users: &[PeerInfo]) -> HashSet<String> {
        users.iter().map(|u| u.id.clone()).collect()
    }

    #[test_timeout::timeout]
    fn groups_private_clients_by_prefix() {
        let mut h = harness();
        let mut a = h.connect("10.0.0.5");
        let mut b = h.connect("10.0.0.9");
        let mut c = h.connect("10.0.1.9");

        let seen_by_a = last_presence(drain(&mut a.rx));
        assert_eq!(ids(&seen_by_a), HashSet::from([b.id.clone()]));
        let seen_by_b = last_presence(drain(&mut b.rx));
        assert_eq!(ids(&seen_by_b), HashSet::from([a.id.clone()]));
        assert!(last_presence(drain(&mut c.rx)).is_empty());
    }

    #[test_timeout::timeout]
    fn public_and_cgnat_group_by_full_address() {
        let mut h = harness();
        let mut a = h.connect("203.0.113.7");
        let b = h.connect("203.0.113.7");
        let mut c = h.connect("100.64.3.1");
        let _d = h.connect("100.64.3.2");

        assert_eq!(ids(&last_presence(drain(&mut a.rx))), HashSet::from([b.id.clone()]));
        assert!(last_presence(drain(&mut c.rx)).is_empty());
    }

    #[test_timeout::timeout]
    fn never_lists_self() {
        let mut h = harness();
        let mut clients: Vec<_> = (0..5).map(|_| h.connect("192.168.0.10")).collect();
        for client in clients.iter_mut() {
            let users = last_presence(drain(&mut client.rx));
            assert_eq!(users.len(), 4);
            assert!(!ids(&users).contains(&client.id));
        }
    }

    #[test_timeout::timeout]
    fn paired_clients_drop_out_and_see_nothing() {
        let mut h = harness();
        let mut a = h.connect("10.0.0.5");
        let mut b = h.connect("10.0.0.6");
        let mut c = h.connect("10.0.0.7");

        let code = h.coord.create_flight(&a.id).unwrap();
        let seen_by_c = last_presence(drain(&mut c.rx));
        assert_eq!(ids(&seen_by_c), HashSet::from([a.id.clone(), b.id.clone()]));

        h.coord.join_flight(&b.id, &code).unwrap();
        assert!(last_presence(drain(&mut a.rx)).is_empty());
        assert!(last_presence(drain(&mut b.rx)).is_empty());
        assert!(last_presence(drain(&mut c.rx)).is_empty());

        h.coord.leave_flight(&b.id);
        let seen_by_c = last_presence(drain(&mut c.rx));
        assert_eq!(ids(&seen_by_c), HashSet::from([a.id.clone(), b.id.clone()]));
    }

    #[test_timeout::timeout]
    fn renames_are_broadcast() {
        let mut h = harness();
        let a = h.connect("10.0.0.5");
        let mut b = h.connect("10.0.0.6");
        drain(&mut b.rx);
        h.coord.set_name(&a.id, "Kite").unwrap();
        let seen_by_b = last_presence(drain(&mut b.rx));
        assert_eq!(
            seen_by_b,
            vec![PeerInfo {
                id: a.id.clone(),
                name: "Kite".into()
            }]
        );
    }

    #[test_timeout::timeout]
    fn dead_receiver_does_not_block_others() {
        let mut h = harness();
        let a = h.connect("10.0.0.5");
        let mut b = h.connect("10.0.0.6");
        drain(&mut b.rx);
        drop(a.rx);
        h.coord.broadcast_presence();
        assert_eq!(ids(&last_presence(drain(&mut b.rx))), HashSet::from([a.id.clone()]));
    }
}
