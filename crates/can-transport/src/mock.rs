use crate::{BusInfo, CanBus, CanFilter, CanFrame, Result, TransportError};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::trace;

/// Sent frames remembered by default; older ones are dropped first.
pub const DEFAULT_SENT_CAPACITY: usize = 1024;

/// Produces the frames other nodes would put on the bus in answer to a sent frame.
pub type Responder = Box<dyn FnMut(&CanFrame) -> Vec<CanFrame> + Send>;

struct State {
    rx: VecDeque<CanFrame>,
    sent: VecDeque<CanFrame>,
    sent_capacity: usize,
    loopback: bool,
    fail_sends: u32,
    responder: Option<Responder>,
}

struct Shared {
    state: Mutex<State>,
    ready: Condvar,
}

/// A simple in-process mock bus. Each `open` creates an independent bus; handles
/// obtained through `try_clone` share it.
pub struct MockBus {
    name: String,
    shared: Arc<Shared>,
    filters: Vec<CanFilter>,
}

impl MockBus {
    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.shared
            .state
            .lock()
            .map_err(|_| TransportError::Io("mock bus poisoned".to_string()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Echo every sent frame back to receivers (off by default).
    pub fn set_loopback(&self, enabled: bool) -> Result<()> {
        self.lock()?.loopback = enabled;
        Ok(())
    }

    /// Install the node model answering sent frames.
    pub fn set_responder(&self, responder: Responder) -> Result<()> {
        self.lock()?.responder = Some(responder);
        Ok(())
    }

    /// Make the next `count` sends fail with an I/O error.
    pub fn fail_next_sends(&self, count: u32) -> Result<()> {
        self.lock()?.fail_sends = count;
        Ok(())
    }

    /// Place a frame on the bus as if another node had sent it.
    pub fn inject(&self, frame: CanFrame) -> Result<()> {
        self.lock()?.rx.push_back(frame.stamped_now());
        self.shared.ready.notify_all();
        Ok(())
    }

    /// The most recent frames accepted by `send`, oldest first.
    pub fn sent(&self) -> Result<Vec<CanFrame>> {
        Ok(self.lock()?.sent.iter().cloned().collect())
    }

    /// How many sent frames to remember. Zero turns the log off.
    pub fn set_sent_capacity(&self, capacity: usize) -> Result<()> {
        let mut state = self.lock()?;
        state.sent_capacity = capacity;
        let excess = state.sent.len().saturating_sub(capacity);
        state.sent.drain(..excess);
        Ok(())
    }

    pub fn clear_sent(&self) -> Result<()> {
        self.lock()?.sent.clear();
        Ok(())
    }

    fn accepts(&self, frame: &CanFrame) -> bool {
        self.filters.is_empty() || self.filters.iter().any(|f| f.accepts(frame.id))
    }
}

impl CanBus for MockBus {
    fn open(name: &str) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    rx: VecDeque::new(),
                    sent: VecDeque::new(),
                    sent_capacity: DEFAULT_SENT_CAPACITY,
                    loopback: false,
                    fail_sends: 0,
                    responder: None,
                }),
                ready: Condvar::new(),
            }),
            filters: Vec::new(),
        })
    }

    fn list() -> Result<Vec<BusInfo>> {
        Ok(vec![BusInfo {
            name: "mock0".to_string(),
            driver: "mock".to_string(),
        }])
    }

    fn set_filters(&mut self, filters: &[CanFilter]) -> Result<()> {
        self.filters = filters.to_vec();
        Ok(())
    }

    fn recv(&mut self, timeout_ms: Option<u64>) -> Result<CanFrame> {
        let deadline = timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
        let mut state = self.lock()?;
        loop {
            while let Some(frame) = state.rx.pop_front() {
                if self.accepts(&frame) {
                    return Ok(frame);
                }
            }
            state = match deadline {
                None => self
                    .shared
                    .ready
                    .wait(state)
                    .map_err(|_| TransportError::Io("mock bus poisoned".to_string()))?,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(TransportError::Timeout);
                    }
                    self.shared
                        .ready
                        .wait_timeout(state, deadline - now)
                        .map_err(|_| TransportError::Io("mock bus poisoned".to_string()))?
                        .0
                }
            };
        }
    }

    fn send(&mut self, frame: &CanFrame) -> Result<()> {
        let mut state = self.lock()?;
        if state.fail_sends > 0 {
            state.fail_sends -= 1;
            trace!(bus = %self.name, id = %frame.id, "mock send failure");
            return Err(TransportError::Io("injected send failure".to_string()));
        }
        let frame = frame.clone().stamped_now();
        if state.sent_capacity > 0 {
            if state.sent.len() == state.sent_capacity {
                state.sent.pop_front();
            }
            state.sent.push_back(frame.clone());
        }
        if state.loopback {
            state.rx.push_back(frame.clone());
        }
        let replies = match state.responder.as_mut() {
            Some(responder) => responder(&frame),
            None => Vec::new(),
        };
        for reply in replies {
            state.rx.push_back(reply.stamped_now());
        }
        drop(state);
        self.shared.ready.notify_all();
        Ok(())
    }

    fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            name: self.name.clone(),
            shared: Arc::clone(&self.shared),
            filters: Vec::new(),
        })
    }
}
