use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

#[derive(Clone)]
pub struct BusMetrics {
    pub tx_frames: IntCounter,
    pub rx_frames: IntCounter,
    pub malformed_frames: IntCounter,
    pub unowned_frames: IntCounter,
    pub send_failures: IntCounter,
    pub ticks: IntCounter,
    pub tick_overruns: IntCounter,
    pub devices_registered: IntGauge,
}

#[derive(Clone)]
pub struct MetricsHub {
    pub registry: Registry,
    pub bus: BusMetrics,
}

fn counter(name: &str, help: &str) -> Result<IntCounter, String> {
    IntCounter::new(name, help).map_err(|e| format!("metrics init error: {e}"))
}

impl MetricsHub {
    pub fn new() -> Result<Self, String> {
        let registry = Registry::new();
        let bus = BusMetrics {
            tx_frames: counter("rmd_can_tx_frames", "Total CAN frames sent")?,
            rx_frames: counter("rmd_can_rx_frames", "Total CAN frames received")?,
            malformed_frames: counter(
                "rmd_can_malformed_frames",
                "Inbound frames dropped as malformed",
            )?,
            unowned_frames: counter(
                "rmd_can_unowned_frames",
                "Inbound frames with no registered owner",
            )?,
            send_failures: counter("rmd_can_send_failures", "Failed send attempts")?,
            ticks: counter("rmd_control_ticks", "Control loop ticks executed")?,
            tick_overruns: counter(
                "rmd_control_tick_overruns",
                "Ticks whose work exceeded the period",
            )?,
            devices_registered: IntGauge::new(
                "rmd_devices_registered",
                "Number of actuators registered with the driver",
            )
            .map_err(|e| format!("metrics init error: {e}"))?,
        };
        let _ = registry.register(Box::new(bus.tx_frames.clone()));
        let _ = registry.register(Box::new(bus.rx_frames.clone()));
        let _ = registry.register(Box::new(bus.malformed_frames.clone()));
        let _ = registry.register(Box::new(bus.unowned_frames.clone()));
        let _ = registry.register(Box::new(bus.send_failures.clone()));
        let _ = registry.register(Box::new(bus.ticks.clone()));
        let _ = registry.register(Box::new(bus.tick_overruns.clone()));
        let _ = registry.register(Box::new(bus.devices_registered.clone()));
        Ok(Self { registry, bus })
    }

    pub fn encode_text(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            return format!("error encoding metrics: {e}");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_exposition_lists_counters() {
        let hub = MetricsHub::new().unwrap();
        hub.bus.tx_frames.inc_by(3);
        hub.bus.devices_registered.set(2);
        let text = hub.encode_text();
        assert!(text.contains("rmd_can_tx_frames 3"));
        assert!(text.contains("rmd_devices_registered 2"));
        assert!(text.contains("rmd_control_tick_overruns 0"));
    }
}
