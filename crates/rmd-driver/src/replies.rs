use crate::clock::Clock;
use crate::{DriverError, NodeId, Reply, Result};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::collections::HashMap;
use std::time::Duration;

/// Replies kept per node while nobody is waiting; older ones are dropped first.
const RECENT: usize = 8;
/// How often a waiter re-checks its queue.
const POLL: Duration = Duration::from_millis(1);

struct Queue {
    tx: Sender<Reply>,
    rx: Receiver<Reply>,
}

/// Bounded reply queue per node, for callers that wait on an acknowledgement.
///
/// `clear` the node before sending, then `wait_for` the opcode. Waits run on the driver
/// [`Clock`], so a deadline means the same thing to a waiter as it does to the loop.
pub struct ReplyBoard {
    queues: HashMap<NodeId, Queue>,
}

impl ReplyBoard {
    pub fn new(nodes: &[NodeId]) -> Self {
        Self {
            queues: nodes
                .iter()
                .map(|&n| {
                    let (tx, rx) = crossbeam_channel::bounded(RECENT);
                    (n, Queue { tx, rx })
                })
                .collect(),
        }
    }

    fn queue(&self, node: NodeId) -> Result<&Queue> {
        self.queues
            .get(&node)
            .ok_or(DriverError::UnknownDevice(node.get()))
    }

    pub fn post(&self, node: NodeId, reply: Reply) -> Result<()> {
        let queue = self.queue(node)?;
        let mut reply = reply;
        // A full queue gives up its oldest entry; retry once, then drop the newcomer
        for _ in 0..2 {
            match queue.tx.try_send(reply) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(back)) => {
                    let _ = queue.rx.try_recv();
                    reply = back;
                }
                Err(TrySendError::Disconnected(_)) => break,
            }
        }
        Ok(())
    }

    /// Discard everything queued for `node`. Returns how many replies were dropped.
    pub fn clear(&self, node: NodeId) -> Result<usize> {
        Ok(self.queue(node)?.rx.try_iter().count())
    }

    /// First queued reply carrying `opcode`, consuming the replies ahead of it.
    pub fn take(&self, node: NodeId, opcode: u8) -> Result<Option<Reply>> {
        let queue = self.queue(node)?;
        Ok(queue.rx.try_iter().find(|reply| reply.opcode() == opcode))
    }

    /// Poll for a reply with `opcode` until `clock` reaches `deadline`.
    pub fn wait_for(
        &self,
        node: NodeId,
        opcode: u8,
        deadline: Duration,
        clock: &dyn Clock,
    ) -> Result<Option<Reply>> {
        loop {
            if let Some(reply) = self.take(node, opcode)? {
                return Ok(Some(reply));
            }
            let now = clock.now();
            if now >= deadline {
                return Ok(None);
            }
            clock.sleep_until(deadline.min(now + POLL));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::manual::ManualClock;
    use crate::clock::MonotonicClock;
    use std::sync::Arc;
    use std::thread;

    fn node() -> NodeId {
        NodeId::new(1).unwrap()
    }

    fn info(opcode: u8) -> Reply {
        Reply::Info {
            opcode,
            data: [opcode, 0, 0, 0, 0, 0, 0, 0],
        }
    }

    #[test]
    fn test_clear_drops_replies_posted_before_send() {
        let board = ReplyBoard::new(&[node()]);
        let clock = ManualClock::default();
        board.post(node(), info(0x80)).unwrap();
        assert_eq!(board.clear(node()).unwrap(), 1);
        let got = board
            .wait_for(node(), 0x80, Duration::from_millis(5), &clock)
            .unwrap();
        assert_eq!(got, None);
        // The wait ran the clock up to its deadline
        assert_eq!(clock.now(), Duration::from_millis(5));
    }

    #[test]
    fn test_wait_wakes_on_matching_post() {
        let board = Arc::new(ReplyBoard::new(&[node()]));
        let clock = MonotonicClock::new();
        let poster = Arc::clone(&board);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            poster.post(node(), info(0x9C)).unwrap();
            poster.post(node(), info(0x80)).unwrap();
        });
        let deadline = clock.now() + Duration::from_secs(2);
        let got = board.wait_for(node(), 0x80, deadline, &clock).unwrap();
        assert_eq!(got, Some(info(0x80)));
        handle.join().unwrap();
    }

    #[test]
    fn test_full_queue_keeps_newest() {
        let board = ReplyBoard::new(&[node()]);
        for op in 0..=(RECENT as u8) {
            board.post(node(), info(op)).unwrap();
        }
        // The first one was pushed out
        assert_eq!(board.take(node(), 0).unwrap(), None);
        board.post(node(), info(0x42)).unwrap();
        assert_eq!(board.take(node(), 0x42).unwrap(), Some(info(0x42)));
    }

    #[test]
    fn test_unknown_node() {
        let board = ReplyBoard::new(&[node()]);
        let other = NodeId::new(2).unwrap();
        assert!(board.clear(other).is_err());
        assert!(board.post(other, info(0x01)).is_err());
    }
}
