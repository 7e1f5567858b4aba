use crate::clock::Clock;
use crate::{decode_reply, AddressMap, MetricsHub, Reply, ReplyBoard, TelemetryScale, TelemetryStore};
use std::sync::Arc;
use tracing::{debug, trace};

/// Routes inbound frames to their owning device.
///
/// Runs on the transport's receive context; nothing here is allowed to fail outward.
/// Frames nobody owns and frames that do not decode are counted and dropped.
pub struct Dispatcher {
    map: Arc<AddressMap>,
    store: Arc<TelemetryStore>,
    replies: Arc<ReplyBoard>,
    scale: TelemetryScale,
    clock: Arc<dyn Clock>,
    metrics: MetricsHub,
}

impl Dispatcher {
    pub fn new(
        map: Arc<AddressMap>,
        store: Arc<TelemetryStore>,
        replies: Arc<ReplyBoard>,
        scale: TelemetryScale,
        clock: Arc<dyn Clock>,
        metrics: MetricsHub,
    ) -> Self {
        Self {
            map,
            store,
            replies,
            scale,
            clock,
            metrics,
        }
    }

    pub fn handle(&self, address: u16, data: &[u8]) {
        self.metrics.bus.rx_frames.inc();
        let Some(node) = self.map.owner_of(address) else {
            // Our own command frames and other bus traffic land here
            trace!(address = format_args!("0x{address:03X}"), "frame has no owner");
            self.metrics.bus.unowned_frames.inc();
            return;
        };
        let reply = match decode_reply(data) {
            Ok(reply) => reply,
            Err(e) => {
                debug!(%node, error = %e, len = data.len(), "dropping reply");
                self.metrics.bus.malformed_frames.inc();
                return;
            }
        };
        if let Reply::Status { report, .. } = &reply {
            let snapshot = report.to_snapshot(&self.scale, self.clock.now());
            if let Err(e) = self.store.update(node, snapshot) {
                debug!(%node, error = %e, "telemetry update rejected");
            }
        }
        trace!(%node, opcode = format_args!("0x{:02X}", reply.opcode()), "reply");
        if let Err(e) = self.replies.post(node, reply) {
            debug!(%node, error = %e, "reply not posted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::manual::ManualClock;
    use crate::{AddressLayout, NodeId, StatusReport};
    use std::time::Duration;

    struct Rig {
        dispatcher: Dispatcher,
        store: Arc<TelemetryStore>,
        replies: Arc<ReplyBoard>,
        clock: Arc<ManualClock>,
        metrics: MetricsHub,
    }

    fn rig(scale: TelemetryScale) -> Rig {
        let nodes = [NodeId::new(1).unwrap(), NodeId::new(2).unwrap()];
        let map = Arc::new(AddressMap::new(AddressLayout::default(), nodes).unwrap());
        let store = Arc::new(TelemetryStore::new(map.nodes()));
        let replies = Arc::new(ReplyBoard::new(map.nodes()));
        let clock = Arc::new(ManualClock::default());
        let metrics = MetricsHub::new().unwrap();
        let dispatcher = Dispatcher::new(
            map,
            Arc::clone(&store),
            Arc::clone(&replies),
            scale,
            clock.clone(),
            metrics.clone(),
        );
        Rig {
            dispatcher,
            store,
            replies,
            clock,
            metrics,
        }
    }

    fn n(id: u8) -> NodeId {
        NodeId::new(id).unwrap()
    }

    #[test]
    fn test_status_reply_updates_only_owner() {
        let rig = rig(TelemetryScale::default());
        rig.clock.advance(Duration::from_millis(7));
        rig.dispatcher
            .handle(0x241, &[0x9C, 0x20, 0x0A, 0x00, 0x05, 0x00, 0x10, 0x00]);

        let snap = rig.store.read(n(1)).unwrap();
        assert_eq!(snap.temperature_c, 32);
        assert!((snap.current_a - 0.10).abs() < 1e-9);
        assert_eq!(snap.velocity_dps, 5);
        assert_eq!(snap.position_deg, 16.0);
        assert_eq!(snap.observed_at, Duration::from_millis(7));
        assert!(!rig.store.read(n(2)).unwrap().is_observed());
    }

    #[test]
    fn test_unowned_and_short_frames_are_dropped() {
        let rig = rig(TelemetryScale::default());
        // Command-side address and an unregistered reply address
        rig.dispatcher.handle(0x141, &[0x9C, 0, 0, 0, 0, 0, 0, 0]);
        rig.dispatcher.handle(0x245, &[0x9C, 0x20, 0, 0, 0, 0, 0, 0]);
        rig.dispatcher.handle(0x242, &[0x9C, 0x20, 0x0A]);

        assert_eq!(rig.metrics.bus.rx_frames.get(), 3);
        assert_eq!(rig.metrics.bus.unowned_frames.get(), 2);
        assert_eq!(rig.metrics.bus.malformed_frames.get(), 1);
        assert!(!rig.store.read(n(1)).unwrap().is_observed());
        assert!(!rig.store.read(n(2)).unwrap().is_observed());
    }

    #[test]
    fn test_non_status_reply_posts_without_touching_store() {
        let rig = rig(TelemetryScale::default());
        rig.dispatcher.handle(0x242, &[0x80, 0, 0, 0, 0, 0, 0, 0]);
        let got = rig.replies.take(n(2), 0x80).unwrap();
        assert_eq!(got.map(|r| r.opcode()), Some(0x80));
        assert!(!rig.store.read(n(2)).unwrap().is_observed());
    }

    #[test]
    fn test_configured_scale_applies() {
        let rig = rig(TelemetryScale {
            current_amps_per_lsb: 0.001,
            position_deg_per_lsb: 0.01,
        });
        rig.clock.advance(Duration::from_millis(1));
        let report = StatusReport {
            temperature_c: 40,
            current_raw: 1500,
            velocity_dps: -3,
            position_raw: 9000,
        };
        rig.dispatcher.handle(0x241, &report.encode(0xA4));
        let snap = rig.store.read(n(1)).unwrap();
        assert!((snap.current_a - 1.5).abs() < 1e-9);
        assert!((snap.position_deg - 90.0).abs() < 1e-9);
    }
}
