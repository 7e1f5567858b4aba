//! The control loop: Idle → Homing → Running → Stopping → Idle.
//!
//! One cycle runs on a dedicated thread. Running sends exactly one setpoint per device per
//! tick, fire-and-forget; only Homing and Stopping wait for acknowledgements, each wait
//! bounded by the configured handshake.

use crate::clock::{Clock, Pacer, TickOutcome};
use crate::config::{ControlConfig, Handshake, StopMode};
use crate::transport::Transport;
use crate::{
    AddressMap, Command, DriverError, MetricsHub, NodeId, ReplyBoard, Result, Setpoints,
    TelemetryStore,
};
use core::fmt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    Homing,
    Running,
    Stopping,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoopState::Idle => "idle",
            LoopState::Homing => "homing",
            LoopState::Running => "running",
            LoopState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Target against last observed position for one device in one tick.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct TrackingEntry {
    pub node: NodeId,
    pub target_deg: f64,
    pub actual_deg: f64,
    pub observed_at: Duration,
}

/// Handed to the tick observer after each Running tick's sends.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TickSample {
    /// Trajectory time of the tick.
    pub t: Duration,
    pub entries: Vec<TrackingEntry>,
}

pub type TickObserver = Box<dyn FnMut(&TickSample) + Send>;

/// Summary of one control cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub ticks: u64,
    pub overruns: u64,
    /// Setpoints that could not be encoded or sent.
    pub send_failures: u64,
    pub homing_acks: usize,
    pub stop_acks: usize,
}

/// State shared between the driver facade and the loop thread.
pub(crate) struct ControlLoop {
    pub transport: Arc<dyn Transport>,
    pub map: Arc<AddressMap>,
    pub store: Arc<TelemetryStore>,
    pub replies: Arc<ReplyBoard>,
    pub setpoints: Arc<RwLock<Setpoints>>,
    pub config: ControlConfig,
    pub clock: Arc<dyn Clock>,
    pub metrics: MetricsHub,
    state: Mutex<LoopState>,
    cancel: AtomicBool,
}

impl ControlLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn Transport>,
        map: Arc<AddressMap>,
        store: Arc<TelemetryStore>,
        replies: Arc<ReplyBoard>,
        setpoints: Arc<RwLock<Setpoints>>,
        config: ControlConfig,
        clock: Arc<dyn Clock>,
        metrics: MetricsHub,
    ) -> Self {
        Self {
            transport,
            map,
            store,
            replies,
            setpoints,
            config,
            clock,
            metrics,
            state: Mutex::new(LoopState::Idle),
            cancel: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> LoopState {
        *self.state.lock()
    }

    fn enter(&self, next: LoopState) {
        let mut state = self.state.lock();
        if *state != next {
            info!(from = %*state, to = %next, "control state");
            *state = next;
        }
    }

    /// Idle → Homing, or `AlreadyRunning` if a cycle is in progress.
    pub fn begin(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != LoopState::Idle {
            return Err(DriverError::AlreadyRunning);
        }
        self.cancel.store(false, Ordering::Release);
        info!(from = %*state, to = %LoopState::Homing, "control state");
        *state = LoopState::Homing;
        Ok(())
    }

    /// Idle → Stopping for a stop requested outside a cycle. Holding Stopping keeps a
    /// concurrent `begin` out until the devices are stopped.
    pub fn begin_stopping(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != LoopState::Idle {
            return Err(DriverError::AlreadyRunning);
        }
        info!(from = %*state, to = %LoopState::Stopping, "control state");
        *state = LoopState::Stopping;
        Ok(())
    }

    /// Back to Idle without running a cycle.
    pub fn reset(&self) {
        self.enter(LoopState::Idle);
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Encode and send one command to one device. Counts the outcome.
    pub fn send(&self, node: NodeId, command: &Command) -> Result<()> {
        let payload = command.encode()?;
        let address = self.map.command_address(node.into());
        self.send_raw(address, &payload)
    }

    pub fn send_raw(&self, address: u16, payload: &[u8; 8]) -> Result<()> {
        match self.transport.send(address, payload) {
            Ok(()) => {
                self.metrics.bus.tx_frames.inc();
                Ok(())
            }
            Err(source) => {
                self.metrics.bus.send_failures.inc();
                Err(DriverError::TransportSendFailure { address, source })
            }
        }
    }

    /// Send `command` until the device echoes its opcode, at most `attempts` times.
    /// Attempts start `ack_timeout` apart on the loop clock; a failed send uses one up.
    /// Returns whether an acknowledgement arrived.
    pub fn handshake(&self, node: NodeId, command: &Command, policy: Handshake) -> Result<bool> {
        let opcode = command.opcode();
        let timeout = policy.ack_timeout();
        for attempt in 1..=policy.attempts {
            self.replies.clear(node)?;
            let deadline = self.clock.now() + timeout;
            match self.send(node, command) {
                Ok(()) => {
                    let reply = self
                        .replies
                        .wait_for(node, opcode, deadline, self.clock.as_ref())?;
                    if reply.is_some() {
                        debug!(%node, attempt, opcode = format_args!("0x{opcode:02X}"), "acknowledged");
                        return Ok(true);
                    }
                    debug!(%node, attempt, opcode = format_args!("0x{opcode:02X}"), "no acknowledgement");
                }
                Err(e @ DriverError::OutOfRange { .. }) => return Err(e),
                Err(e) => {
                    warn!(%node, attempt, error = %e, "handshake send failed");
                    self.clock.sleep_until(deadline);
                }
            }
        }
        Ok(false)
    }

    /// Send every device to the home pose, then wait out the settle period.
    fn home(&self) -> usize {
        self.enter(LoopState::Homing);
        let homing = self.config.homing;
        let command = Command::PositionWithSpeed {
            deg: homing.position_deg,
            max_speed_dps: homing.speed_dps,
        };
        let mut acks = 0;
        for &node in self.map.nodes() {
            if self.cancelled() {
                break;
            }
            match self.handshake(node, &command, homing.handshake) {
                Ok(true) => acks += 1,
                Ok(false) => warn!(%node, attempts = homing.handshake.attempts, "homing not acknowledged"),
                Err(e) => warn!(%node, error = %e, "homing failed"),
            }
        }
        self.settle();
        acks
    }

    fn settle(&self) {
        let deadline = self.clock.now() + self.config.settle();
        let step = self.config.period();
        loop {
            let now = self.clock.now();
            if now >= deadline || self.cancelled() {
                break;
            }
            self.clock.sleep_until(deadline.min(now + step));
        }
    }

    fn track(&self, observer: &mut Option<TickObserver>, report: &mut RunReport) {
        self.enter(LoopState::Running);
        let period = self.config.period();
        let pacer = Pacer::new(period);
        let run_for = self.config.run_for();
        let gap = self.config.inter_send_gap();
        let nodes = self.map.nodes();
        let mut t = Duration::ZERO;
        let mut targets = Vec::with_capacity(nodes.len());

        loop {
            if self.cancelled() {
                debug!(ticks = report.ticks, "cancelled");
                break;
            }
            if run_for.is_some_and(|limit| t >= limit) {
                break;
            }
            let tick_start = self.clock.now();

            targets.clear();
            {
                let setpoints = self.setpoints.read();
                targets.extend(nodes.iter().map(|&n| (n, setpoints.target_deg(n, t))));
            }

            for (i, &(node, deg)) in targets.iter().enumerate() {
                let command = match self.config.tracking_speed_cap_dps {
                    Some(max_speed_dps) => Command::PositionWithSpeed { deg, max_speed_dps },
                    None => Command::Position { deg },
                };
                if let Err(e) = self.send(node, &command) {
                    warn!(%node, target_deg = deg, error = %e, "setpoint not sent");
                    report.send_failures += 1;
                }
                if !gap.is_zero() && i + 1 < targets.len() {
                    self.clock.sleep_until(self.clock.now() + gap);
                }
            }

            if let Some(observe) = observer.as_mut() {
                let entries = targets
                    .iter()
                    .map(|&(node, target_deg)| {
                        let snap = self.store.read(node).unwrap_or_default();
                        TrackingEntry {
                            node,
                            target_deg,
                            actual_deg: snap.position_deg,
                            observed_at: snap.observed_at,
                        }
                    })
                    .collect();
                observe(&TickSample { t, entries });
            }

            report.ticks += 1;
            self.metrics.bus.ticks.inc();
            if let TickOutcome::Overrun { by } = pacer.finish(self.clock.as_ref(), tick_start) {
                report.overruns += 1;
                self.metrics.bus.tick_overruns.inc();
                debug!(tick = report.ticks, overrun = ?by, "tick overran period");
            }
            t += period;
        }
    }

    /// Stop or brake every device, then return to Idle.
    fn stop_devices(&self) -> usize {
        self.enter(LoopState::Stopping);
        self.stop_each()
    }

    /// Handshake stop with every device, then Idle. Expects the loop in Stopping.
    pub fn stop_each(&self) -> usize {
        let stopping = self.config.stopping;
        let command = match stopping.mode {
            StopMode::Stop => Command::Stop,
            StopMode::Brake => Command::Brake,
        };
        let mut acks = 0;
        for &node in self.map.nodes() {
            match self.handshake(node, &command, stopping.handshake) {
                Ok(true) => acks += 1,
                Ok(false) => warn!(%node, "stop not acknowledged"),
                Err(e) => warn!(%node, error = %e, "stop failed"),
            }
        }
        self.enter(LoopState::Idle);
        acks
    }

    /// One full cycle. Cancellation during Homing skips Running but still stops devices.
    pub fn run_cycle(&self, mut observer: Option<TickObserver>) -> RunReport {
        let mut report = RunReport {
            homing_acks: self.home(),
            ..RunReport::default()
        };
        if !self.cancelled() {
            self.track(&mut observer, &mut report);
        }
        report.stop_acks = self.stop_devices();
        info!(
            ticks = report.ticks,
            overruns = report.overruns,
            send_failures = report.send_failures,
            "control cycle finished"
        );
        report
    }
}
