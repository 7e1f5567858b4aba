use crate::NodeId;
use std::collections::HashMap;
use std::f64::consts::TAU;
use std::sync::Arc;
use std::time::Duration;

/// Target angle per node as a pure function of time since Running began.
pub trait Trajectory: Send + Sync {
    fn target_deg(&self, node: NodeId, t: Duration) -> f64;
}

impl<F> Trajectory for F
where
    F: Fn(NodeId, Duration) -> f64 + Send + Sync,
{
    fn target_deg(&self, node: NodeId, t: Duration) -> f64 {
        self(node, t)
    }
}

/// `offset + amplitude * sin(2π f t + phase)`, identical for every node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sinusoid {
    pub amplitude_deg: f64,
    pub frequency_hz: f64,
    pub phase_rad: f64,
    pub offset_deg: f64,
}

impl Sinusoid {
    pub fn new(amplitude_deg: f64, frequency_hz: f64) -> Self {
        Self {
            amplitude_deg,
            frequency_hz,
            phase_rad: 0.0,
            offset_deg: 0.0,
        }
    }
}

impl Trajectory for Sinusoid {
    fn target_deg(&self, _node: NodeId, t: Duration) -> f64 {
        let angle = TAU * self.frequency_hz * t.as_secs_f64() + self.phase_rad;
        self.offset_deg + self.amplitude_deg * angle.sin()
    }
}

/// What the Running state tracks: per-node fixed targets win over the shared trajectory;
/// nodes with neither hold 0°.
#[derive(Clone, Default)]
pub struct Setpoints {
    fixed: HashMap<NodeId, f64>,
    trajectory: Option<Arc<dyn Trajectory>>,
}

impl Setpoints {
    pub fn set_fixed(&mut self, node: NodeId, angle_deg: f64) {
        self.fixed.insert(node, angle_deg);
    }

    /// Replaces the trajectory and drops every fixed target.
    pub fn set_trajectory(&mut self, trajectory: Arc<dyn Trajectory>) {
        self.fixed.clear();
        self.trajectory = Some(trajectory);
    }

    pub fn target_deg(&self, node: NodeId, t: Duration) -> f64 {
        if let Some(angle) = self.fixed.get(&node) {
            return *angle;
        }
        self.trajectory
            .as_ref()
            .map(|traj| traj.target_deg(node, t))
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u8) -> NodeId {
        NodeId::new(id).unwrap()
    }

    #[test]
    fn test_sinusoid_quarter_period_peaks() {
        let s = Sinusoid::new(100.0, 1.0 / TAU);
        let quarter = Duration::from_secs_f64(TAU / 4.0);
        assert!((s.target_deg(node(1), Duration::ZERO)).abs() < 1e-9);
        assert!((s.target_deg(node(1), quarter) - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_closure_trajectory_per_node() {
        let traj = |n: NodeId, t: Duration| f64::from(n.get()) * t.as_secs_f64();
        assert_eq!(traj.target_deg(node(2), Duration::from_secs(3)), 6.0);
    }

    #[test]
    fn test_fixed_target_overrides_trajectory() {
        let mut sp = Setpoints::default();
        assert_eq!(sp.target_deg(node(1), Duration::from_secs(1)), 0.0);
        sp.set_trajectory(Arc::new(|_: NodeId, t: Duration| t.as_secs_f64() * 10.0));
        sp.set_fixed(node(2), 45.0);
        assert_eq!(sp.target_deg(node(1), Duration::from_secs(2)), 20.0);
        assert_eq!(sp.target_deg(node(2), Duration::from_secs(2)), 45.0);
        sp.set_trajectory(Arc::new(Sinusoid::new(0.0, 1.0)));
        assert_eq!(sp.target_deg(node(2), Duration::from_secs(2)), 0.0);
    }
}
