use can_transport::{CanBus, CanFrame, CanId, TransportError};
use std::sync::atomic::{AtomicBool, Ordering};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Called for every frame seen on the bus: arbitration id and data bytes.
pub type FrameHandler = Box<dyn Fn(u16, &[u8]) + Send + Sync>;

/// The narrow bus capability the driver consumes.
pub trait Transport: Send + Sync {
    /// Queue one frame; does not wait for any answer.
    fn send(&self, address: u16, payload: &[u8; 8]) -> Result<(), TransportError>;

    /// Register the inbound handler. Only one registration is accepted.
    fn on_frame(&self, handler: FrameHandler) -> Result<(), TransportError>;
}

/// [`Transport`] over any blocking [`CanBus`]: sends are serialized on one handle while a
/// background thread polls a cloned handle with a bounded receive timeout.
pub struct BusTransport<B: CanBus + Send + 'static> {
    tx: Mutex<B>,
    rx: Mutex<Option<B>>,
    rx_timeout: Duration,
    shutdown: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<B: CanBus + Send + 'static> BusTransport<B> {
    pub fn new(bus: B, rx_timeout: Duration) -> Result<Self, TransportError> {
        let rx = bus.try_clone()?;
        Ok(Self {
            tx: Mutex::new(bus),
            rx: Mutex::new(Some(rx)),
            rx_timeout,
            shutdown: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        })
    }
}

impl<B: CanBus + Send + 'static> Transport for BusTransport<B> {
    fn send(&self, address: u16, payload: &[u8; 8]) -> Result<(), TransportError> {
        let id = CanId::standard(address).ok_or(TransportError::InvalidFrame("id range"))?;
        let frame = CanFrame::new(id, payload).ok_or(TransportError::InvalidFrame("len"))?;
        self.tx.lock().send(&frame)
    }

    fn on_frame(&self, handler: FrameHandler) -> Result<(), TransportError> {
        let bus = self
            .rx
            .lock()
            .take()
            .ok_or(TransportError::Unsupported("frame handler already registered"))?;
        let shutdown = Arc::clone(&self.shutdown);
        let timeout_ms = self.rx_timeout.as_millis().max(1) as u64;
        let worker = thread::Builder::new()
            .name("rmd-rx".to_string())
            .spawn(move || pump(bus, handler, timeout_ms, &shutdown))
            .map_err(|e| TransportError::Io(e.to_string()))?;
        *self.worker.lock() = Some(worker);
        Ok(())
    }
}

fn pump<B: CanBus>(mut bus: B, handler: FrameHandler, timeout_ms: u64, shutdown: &AtomicBool) {
    debug!(timeout_ms, "receive pump started");
    while !shutdown.load(Ordering::Acquire) {
        match bus.recv(Some(timeout_ms)) {
            Ok(frame) if frame.id.is_extended() || frame.rtr => {
                trace!(id = %frame.id, "ignoring extended/remote frame");
            }
            Ok(frame) => handler(frame.id.raw() as u16, frame.payload()),
            Err(TransportError::Timeout) => {}
            Err(e) => {
                warn!(error = %e, "bus receive failed");
                thread::sleep(Duration::from_millis(timeout_ms));
            }
        }
    }
    debug!("receive pump stopped");
}

impl<B: CanBus + Send + 'static> Drop for BusTransport<B> {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use can_transport::MockBus;
    use std::sync::mpsc;

    #[test]
    fn test_send_and_receive_through_mock() -> anyhow::Result<()> {
        let bus = MockBus::open("mock0")?;
        let tap = bus.try_clone()?;
        tap.set_loopback(true)?;
        let transport = BusTransport::new(bus, Duration::from_millis(5))?;

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        transport.on_frame(Box::new(move |address, data| {
            let _ = tx.lock().send((address, data.to_vec()));
        }))?;
        transport.send(0x141, &[0x9C, 0, 0, 0, 0, 0, 0, 0])?;

        let (address, data) = rx.recv_timeout(Duration::from_secs(2))?;
        assert_eq!(address, 0x141);
        assert_eq!(data[0], 0x9C);
        assert_eq!(tap.sent()?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_second_registration_rejected() -> anyhow::Result<()> {
        let transport = BusTransport::new(MockBus::open("mock0")?, Duration::from_millis(5))?;
        transport.on_frame(Box::new(|_, _| {}))?;
        assert!(matches!(
            transport.on_frame(Box::new(|_, _| {})),
            Err(TransportError::Unsupported(_))
        ));
        Ok(())
    }

    #[test]
    fn test_address_out_of_range() -> anyhow::Result<()> {
        let transport = BusTransport::new(MockBus::open("mock0")?, Duration::from_millis(5))?;
        assert!(transport.send(0x800, &[0; 8]).is_err());
        Ok(())
    }
}
