use std::time::Duration;

use axum::extract::ws::close_code;
use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::coordinator::{Coordinator, Tower};

impl Coordinator {
    /// One liveness round: evict every connection that ignored the previous
    /// probe, then probe the rest. Returns the evicted ids.
    pub fn sweep_liveness(&mut self) -> Vec<String> {
        let mut evicted = Vec::new();
        for id in self.registry.ids() {
            match self.registry.arm_probe(&id) {
                Some(true) => evicted.push(id),
                Some(false) => {
                    let probed = self
                        .registry
                        .outbox(&id)
                        .map(|outbox| outbox.ping().is_ok())
                        .unwrap_or(false);
                    if !probed {
                        debug!(connection_id = %id, "liveness probe not queued");
                    }
                }
                None => {}
            }
        }

        for id in &evicted {
            info!(connection_id = %id, "terminating unresponsive connection");
            counter!("flight_tower_liveness_evictions_total", 1);
            self.close(id, close_code::POLICY, "liveness timeout");
            self.disconnect(id);
        }
        evicted
    }
}

/// Run a liveness sweep every `interval` until the task is aborted.
pub fn spawn_monitor(tower: Tower, interval: Duration) -> JoinHandle<()> {
    let mut ticker = tokio::time::interval(interval);
    tokio::spawn(async move {
        // The first tick completes immediately; probing starts one period in.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = tower.with(|coord| coord.sweep_liveness());
            if !evicted.is_empty() {
                debug!(evicted = evicted.len(), "liveness sweep finished");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::tests::{drain, drain_outbound, harness};
    use crate::protocol::ServerMessage;
    use crate::registry::{Outbound, Outbox};

    #[test_timeout::timeout]
    fn answered_probes_keep_connections() {
        let mut h = harness();
        let mut a = h.connect("10.0.0.5");
        drain(&mut a.rx);

        for _ in 0..3 {
            assert!(h.coord.sweep_liveness().is_empty());
            assert_eq!(drain_outbound(&mut a.rx), vec![Outbound::Ping]);
            h.coord.mark_alive(&a.id);
        }
        assert!(h.coord.client(&a.id).is_some());
    }

    #[test_timeout::timeout]
    fn silent_connection_is_torn_down_like_a_close() {
        let mut h = harness();
        let mut a = h.connect("10.0.0.5");
        let mut b = h.connect("10.0.0.6");
        let code = h.coord.create_flight(&a.id).unwrap();
        h.coord.join_flight(&b.id, &code).unwrap();
        drain(&mut a.rx);
        drain(&mut b.rx);

        assert!(h.coord.sweep_liveness().is_empty());
        h.coord.mark_alive(&b.id);
        assert_eq!(h.coord.sweep_liveness(), vec![a.id.clone()]);

        let to_a = drain_outbound(&mut a.rx);
        assert!(to_a.iter().any(|frame| matches!(
            frame,
            Outbound::Close {
                code: close_code::POLICY,
                ..
            }
        )));
        let to_b = drain(&mut b.rx);
        assert_eq!(
            to_b.iter().filter(|m| **m == ServerMessage::PeerLeft).count(),
            1
        );
        assert!(h.coord.client(&a.id).is_none());
        assert_eq!(h.coord.flight(&code).unwrap().members, vec![b.id.clone()]);

        // The reader loop exits afterwards and runs the same teardown.
        assert!(!h.coord.disconnect(&a.id));
    }

    #[test_timeout::tokio_timeout_test(start_paused)]
    async fn monitor_runs_on_the_interval() {
        let tower = Tower::new();
        let (outbox, mut rx) = Outbox::channel();
        let id = tower.with(|coord| coord.register("10.0.0.5".into(), None, outbox));
        drain(&mut rx);

        let handle = spawn_monitor(tower.clone(), Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(drain_outbound(&mut rx), vec![Outbound::Ping]);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(tower.with(|coord| coord.client(&id).is_none()));
        handle.abort();
    }
}
