use crate::{DriverError, NodeId, Result, TelemetrySnapshot};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;

/// Latest snapshot per registered node. No history is kept.
///
/// Each slot holds an immutable snapshot that is swapped whole, so readers never block
/// the dispatcher and never observe a partial write.
#[derive(Debug)]
pub struct TelemetryStore {
    slots: HashMap<NodeId, ArcSwap<TelemetrySnapshot>>,
}

impl TelemetryStore {
    pub fn new(nodes: &[NodeId]) -> Self {
        Self {
            slots: nodes
                .iter()
                .map(|&n| (n, ArcSwap::from_pointee(TelemetrySnapshot::default())))
                .collect(),
        }
    }

    /// Replace the node's snapshot. `observed_at` never moves backwards for a node.
    pub fn update(&self, node: NodeId, snapshot: TelemetrySnapshot) -> Result<()> {
        let slot = self
            .slots
            .get(&node)
            .ok_or(DriverError::UnknownDevice(node.get()))?;
        slot.rcu(|current| {
            let mut next = snapshot;
            next.observed_at = next.observed_at.max(current.observed_at);
            Arc::new(next)
        });
        Ok(())
    }

    pub fn read(&self, node: NodeId) -> Result<TelemetrySnapshot> {
        let slot = self
            .slots
            .get(&node)
            .ok_or(DriverError::UnknownDevice(node.get()))?;
        Ok(**slot.load())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn node(id: u8) -> NodeId {
        NodeId::new(id).unwrap()
    }

    fn snap(position_deg: f64, at_ms: u64) -> TelemetrySnapshot {
        TelemetrySnapshot {
            temperature_c: 30,
            current_a: 0.5,
            velocity_dps: 12,
            position_deg,
            observed_at: Duration::from_millis(at_ms),
        }
    }

    #[test]
    fn test_default_entries_are_zero() {
        let store = TelemetryStore::new(&[node(1), node(2)]);
        assert_eq!(store.len(), 2);
        assert_eq!(store.read(node(1)).unwrap(), TelemetrySnapshot::default());
    }

    #[test]
    fn test_read_after_update_returns_written() {
        let store = TelemetryStore::new(&[node(1)]);
        let s = snap(42.0, 10);
        store.update(node(1), s).unwrap();
        assert_eq!(store.read(node(1)).unwrap(), s);
    }

    #[test]
    fn test_unknown_node_rejected() {
        let store = TelemetryStore::new(&[node(1)]);
        assert!(matches!(
            store.read(node(9)),
            Err(DriverError::UnknownDevice(9))
        ));
        assert!(store.update(node(9), snap(1.0, 1)).is_err());
    }

    #[test]
    fn test_observed_at_never_decreases() {
        let store = TelemetryStore::new(&[node(1)]);
        store.update(node(1), snap(1.0, 20)).unwrap();
        store.update(node(1), snap(2.0, 5)).unwrap();
        let read = store.read(node(1)).unwrap();
        assert_eq!(read.position_deg, 2.0);
        assert_eq!(read.observed_at, Duration::from_millis(20));
    }

    #[test]
    fn test_concurrent_updates_stay_separate() {
        let ids: Vec<NodeId> = (1..=8).map(node).collect();
        let store = Arc::new(TelemetryStore::new(&ids));
        let handles: Vec<_> = ids
            .iter()
            .map(|&n| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 1..=500u64 {
                        let value = f64::from(n.get()) * 1000.0 + i as f64;
                        store.update(n, snap(value, i)).unwrap();
                        let seen = store.read(n).unwrap();
                        assert_eq!(seen.position_deg, value);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        for n in ids {
            let last = store.read(n).unwrap();
            assert_eq!(last.position_deg, f64::from(n.get()) * 1000.0 + 500.0);
            assert_eq!(last.observed_at, Duration::from_millis(500));
        }
    }
}
