use crate::clock::{Clock, MonotonicClock};
use crate::config::DriverConfig;
use crate::control::{ControlLoop, LoopState, RunReport, TickObserver};
use crate::dispatch::Dispatcher;
use crate::transport::Transport;
use crate::{
    AccelKind, AddressMap, Command, DeviceId, DriverError, GainStorage, MetricsHub, NodeId,
    PidGains, Reply, ReplyBoard, Result, Setpoints, TelemetrySnapshot, TelemetryStore, Trajectory,
};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};

/// Entry point for applications: owns the registered device set, the telemetry store and
/// the control loop thread.
pub struct Driver {
    map: Arc<AddressMap>,
    store: Arc<TelemetryStore>,
    replies: Arc<ReplyBoard>,
    setpoints: Arc<RwLock<Setpoints>>,
    control: Arc<ControlLoop>,
    clock: Arc<dyn Clock>,
    metrics: MetricsHub,
    observer: Mutex<Option<TickObserver>>,
    worker: Mutex<Option<JoinHandle<RunReport>>>,
}

impl Driver {
    /// Register `device_ids` and attach the dispatcher to the transport.
    pub fn configure(
        transport: Arc<dyn Transport>,
        config: DriverConfig,
        device_ids: impl IntoIterator<Item = NodeId>,
    ) -> Result<Self> {
        Self::with_clock(transport, config, device_ids, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(
        transport: Arc<dyn Transport>,
        config: DriverConfig,
        device_ids: impl IntoIterator<Item = NodeId>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let map = Arc::new(AddressMap::new(config.addresses, device_ids)?);
        let store = Arc::new(TelemetryStore::new(map.nodes()));
        let replies = Arc::new(ReplyBoard::new(map.nodes()));
        let metrics = MetricsHub::new().map_err(DriverError::Config)?;
        metrics.bus.devices_registered.set(map.nodes().len() as i64);

        let dispatcher = Dispatcher::new(
            Arc::clone(&map),
            Arc::clone(&store),
            Arc::clone(&replies),
            config.scale,
            Arc::clone(&clock),
            metrics.clone(),
        );
        transport.on_frame(Box::new(move |address, data| dispatcher.handle(address, data)))?;

        let setpoints = Arc::new(RwLock::new(Setpoints::default()));
        let control = Arc::new(ControlLoop::new(
            transport,
            Arc::clone(&map),
            Arc::clone(&store),
            Arc::clone(&replies),
            Arc::clone(&setpoints),
            config.control,
            Arc::clone(&clock),
            metrics.clone(),
        ));
        info!(
            devices = ?map.nodes().iter().map(|n| n.get()).collect::<Vec<_>>(),
            period_ms = config.control.period_ms,
            "driver configured"
        );
        Ok(Self {
            map,
            store,
            replies,
            setpoints,
            control,
            clock,
            metrics,
            observer: Mutex::new(None),
            worker: Mutex::new(None),
        })
    }

    pub fn nodes(&self) -> &[NodeId] {
        self.map.nodes()
    }

    pub fn metrics(&self) -> &MetricsHub {
        &self.metrics
    }

    pub fn state(&self) -> LoopState {
        self.control.state()
    }

    fn registered(&self, device: DeviceId) -> Result<NodeId> {
        let node = device.node().ok_or(DriverError::BroadcastNotAllowed)?;
        if self.map.is_registered(node) {
            Ok(node)
        } else {
            Err(DriverError::UnknownDevice(node.get()))
        }
    }

    /// Hold `device` at a fixed angle while Running. Overrides the shared trajectory for it.
    pub fn set_target(&self, device: DeviceId, angle_deg: f64) -> Result<()> {
        let node = self.registered(device)?;
        if !angle_deg.is_finite() {
            return Err(DriverError::OutOfRange {
                field: "angle_deg",
                value: angle_deg,
            });
        }
        self.setpoints.write().set_fixed(node, angle_deg);
        Ok(())
    }

    /// Drive every device from `trajectory`, dropping fixed targets.
    pub fn set_target_all(&self, trajectory: Arc<dyn Trajectory>) {
        self.setpoints.write().set_trajectory(trajectory);
    }

    /// Receives a sample after every tick of the next cycle started.
    pub fn set_tick_observer(&self, observer: TickObserver) {
        *self.observer.lock() = Some(observer);
    }

    /// Run Homing → Running → Stopping on a background thread.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        self.control.begin()?;
        // A finished cycle's handle may still be parked here
        if let Some(done) = worker.take() {
            let _ = done.join();
        }
        let observer = self.observer.lock().take();
        let control = Arc::clone(&self.control);
        let handle = thread::Builder::new()
            .name("rmd-control".to_string())
            .spawn(move || control.run_cycle(observer))
            .map_err(|e| {
                self.control.cancel();
                self.control.reset();
                DriverError::Worker(e.to_string())
            })?;
        *worker = Some(handle);
        Ok(())
    }

    /// Cancel Running (effective within one tick) and wait for Stopping to finish.
    /// With no cycle in progress this just stops every device.
    pub fn stop(&self) -> Result<RunReport> {
        // Held until the idle stop owns the loop, so `start` cannot slip in between
        let mut worker = self.worker.lock();
        self.control.cancel();
        match worker.take() {
            Some(handle) => {
                drop(worker);
                join(handle)
            }
            None => {
                self.control.begin_stopping()?;
                drop(worker);
                Ok(RunReport {
                    stop_acks: self.control.stop_each(),
                    ..RunReport::default()
                })
            }
        }
    }

    /// Block until the current cycle ends on its own (run duration elapsed).
    pub fn wait(&self) -> Result<RunReport> {
        match self.take_worker() {
            Some(handle) => join(handle),
            None => Ok(RunReport::default()),
        }
    }

    fn take_worker(&self) -> Option<JoinHandle<RunReport>> {
        self.worker.lock().take()
    }

    pub fn read_telemetry(&self, device: DeviceId) -> Result<TelemetrySnapshot> {
        let node = device.node().ok_or(DriverError::BroadcastNotAllowed)?;
        self.store.read(node)
    }

    /// Latest snapshot, or `StaleTelemetry` if nothing arrived within `max_age`.
    pub fn read_fresh(&self, device: DeviceId, max_age: Duration) -> Result<TelemetrySnapshot> {
        let snapshot = self.read_telemetry(device)?;
        let age = snapshot.age(self.clock.now());
        if !snapshot.is_observed() || age > max_age {
            return Err(DriverError::StaleTelemetry {
                node: device.node().map(NodeId::get).unwrap_or_default(),
                age,
                limit: max_age,
            });
        }
        Ok(snapshot)
    }

    /// Fire-and-forget send. Broadcast reaches every device on the bus, registered or not.
    pub fn command(&self, device: DeviceId, command: &Command) -> Result<()> {
        if let DeviceId::Individual(_) = device {
            self.registered(device)?;
        }
        let payload = command.encode()?;
        let address = self.map.command_address(device);
        debug!(%device, opcode = format_args!("0x{:02X}", payload[0]), "command");
        self.control.send_raw(address, &payload)
    }

    /// Send and wait for the device's reply carrying the same opcode.
    pub fn request(&self, node: NodeId, command: &Command, timeout: Duration) -> Result<Reply> {
        let device = DeviceId::Individual(node);
        self.registered(device)?;
        self.replies.clear(node)?;
        let deadline = self.clock.now() + timeout;
        self.command(device, command)?;
        let opcode = command.opcode();
        self.replies
            .wait_for(node, opcode, deadline, self.clock.as_ref())?
            .ok_or(DriverError::Timeout {
                node: node.get(),
                opcode,
                timeout,
            })
    }

    /// Round-trip time of a ping.
    pub fn ping(&self, node: NodeId, timeout: Duration) -> Result<Duration> {
        let sent_at = self.clock.now();
        self.request(node, &Command::Ping, timeout)?;
        Ok(self.clock.now().saturating_sub(sent_at))
    }

    /// Ask for a status reply and return the snapshot it produced.
    pub fn read_status(&self, node: NodeId, timeout: Duration) -> Result<TelemetrySnapshot> {
        self.request(node, &Command::ReadStatus, timeout)?;
        self.store.read(node)
    }

    pub fn read_pid(&self, node: NodeId, timeout: Duration) -> Result<PidGains> {
        match self.request(node, &Command::ReadPid, timeout)? {
            Reply::Pid { gains, .. } => Ok(gains),
            _ => Err(DriverError::MalformedFrame("expected PID reply")),
        }
    }

    /// Returns the gains the device echoed back.
    pub fn write_pid(
        &self,
        node: NodeId,
        gains: PidGains,
        storage: GainStorage,
        timeout: Duration,
    ) -> Result<PidGains> {
        match self.request(node, &Command::WritePid { gains, storage }, timeout)? {
            Reply::Pid { gains, .. } => Ok(gains),
            _ => Err(DriverError::MalformedFrame("expected PID reply")),
        }
    }

    pub fn read_acceleration(&self, node: NodeId, kind: AccelKind, timeout: Duration) -> Result<u32> {
        let reply = self.request(node, &Command::ReadAcceleration(kind), timeout)?;
        acceleration_value(reply, kind)
    }

    pub fn write_acceleration(
        &self,
        node: NodeId,
        kind: AccelKind,
        value: u32,
        timeout: Duration,
    ) -> Result<u32> {
        let reply = self.request(node, &Command::WriteAcceleration { kind, value }, timeout)?;
        acceleration_value(reply, kind)
    }

    /// Make the current position the encoder zero (RAM only until `persist_zero`).
    pub fn zero_encoder_offset(&self, node: NodeId, timeout: Duration) -> Result<()> {
        self.request(node, &Command::ZeroEncoderOffset, timeout).map(drop)
    }

    pub fn persist_zero(&self, node: NodeId, timeout: Duration) -> Result<()> {
        self.request(node, &Command::PersistZero, timeout).map(drop)
    }

    pub fn set_active_reply(
        &self,
        node: NodeId,
        opcode: u8,
        enable: bool,
        interval_10ms: u32,
        timeout: Duration,
    ) -> Result<()> {
        let command = Command::ActiveReply {
            opcode,
            enable,
            interval_10ms,
        };
        self.request(node, &command, timeout).map(drop)
    }

    /// Reboot every device on the bus. Nothing answers.
    pub fn restart_all(&self) -> Result<()> {
        self.command(DeviceId::Broadcast, &Command::Restart)
    }

    /// Assign `new_id` to whatever device is listening on the id-setting address, then
    /// restart the bus so it takes effect. Only one device should be connected.
    pub fn set_device_id(&self, new_id: NodeId) -> Result<()> {
        let payload = Command::SetDeviceId(new_id).encode()?;
        self.control.send_raw(self.map.set_id_address(), &payload)?;
        info!(new_id = new_id.get(), "device id written; restarting bus");
        self.restart_all()
    }
}

fn acceleration_value(reply: Reply, expected: AccelKind) -> Result<u32> {
    match reply {
        Reply::Acceleration { kind, value, .. } if kind == expected => Ok(value),
        Reply::Acceleration { .. } => Err(DriverError::MalformedFrame("acceleration kind mismatch")),
        _ => Err(DriverError::MalformedFrame("expected acceleration reply")),
    }
}

fn join(handle: JoinHandle<RunReport>) -> Result<RunReport> {
    handle
        .join()
        .map_err(|_| DriverError::Worker("control thread panicked".to_string()))
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.control.cancel();
        if let Some(handle) = self.take_worker() {
            let _ = handle.join();
        }
    }
}
