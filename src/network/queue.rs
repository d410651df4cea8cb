//! Bounded per-peer outbound frame queue.
//!
//! Single producer side effects from the daemon's dispatch plus the peer's
//! own keepalive task, single consumer (the writer task). When a data frame
//! would overflow the capacity, the oldest *data* frame in the queue is shed
//! and counted; control frames are never shed and may push the queue past its
//! nominal capacity.

use crate::codec::frame::TunnelMsg;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;

struct Inner {
    queue: VecDeque<TunnelMsg>,
    closed: bool,
}

pub struct FrameQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a frame. Returns false if the queue is closed.
    pub fn push(&self, msg: TunnelMsg) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.closed {
            return false;
        }

        if !msg.is_control() && inner.queue.len() >= self.capacity {
            // Shed the oldest data frame; if the backlog is all control
            // frames, the incoming data frame is the one shed.
            match inner.queue.iter().position(|m| !m.is_control()) {
                Some(idx) => {
                    inner.queue.remove(idx);
                }
                None => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
            }
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }

        inner.queue.push_back(msg);
        drop(inner);
        self.notify.notify_one();
        true
    }

    /// Dequeue the next frame, waiting if the queue is empty. Returns `None`
    /// once the queue is closed and drained.
    pub async fn pop(&self) -> Option<TunnelMsg> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(msg) = inner.queue.pop_front() {
                    return Some(msg);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Close the queue: pending frames stay poppable, new pushes fail.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.closed = true;
        drop(inner);
        self.notify.notify_one();
    }

    pub fn is_empty(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .queue
            .is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .queue
            .len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::frame::DataMsg;

    fn data(tag: u8) -> TunnelMsg {
        TunnelMsg::Data(DataMsg {
            payload: vec![tag; 20],
        })
    }

    #[tokio::test]
    async fn fifo_order_preserved() {
        let q = FrameQueue::new(8);
        q.push(data(1));
        q.push(TunnelMsg::KeepAlive);
        q.push(data(2));

        assert!(matches!(q.pop().await, Some(TunnelMsg::Data(m)) if m.payload[0] == 1));
        assert!(matches!(q.pop().await, Some(TunnelMsg::KeepAlive)));
        assert!(matches!(q.pop().await, Some(TunnelMsg::Data(m)) if m.payload[0] == 2));
    }

    #[tokio::test]
    async fn overflow_sheds_oldest_data_frame() {
        let q = FrameQueue::new(2);
        q.push(data(1));
        q.push(data(2));
        q.push(data(3));

        assert_eq!(q.dropped(), 1);
        assert!(matches!(q.pop().await, Some(TunnelMsg::Data(m)) if m.payload[0] == 2));
        assert!(matches!(q.pop().await, Some(TunnelMsg::Data(m)) if m.payload[0] == 3));
    }

    #[tokio::test]
    async fn control_frames_never_shed() {
        let q = FrameQueue::new(2);
        q.push(TunnelMsg::KeepAlive);
        q.push(TunnelMsg::KeepAlive);
        // Control overflow is allowed past capacity.
        q.push(TunnelMsg::LatencyProbe([0; 8]));
        assert_eq!(q.len(), 3);
        assert_eq!(q.dropped(), 0);

        // A data frame against an all-control backlog is the one shed.
        q.push(data(9));
        assert_eq!(q.len(), 3);
        assert_eq!(q.dropped(), 1);
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let q = FrameQueue::new(8);
        q.push(data(1));
        q.close();
        assert!(!q.push(data(2)));
        assert!(q.pop().await.is_some());
        assert!(q.pop().await.is_none());
    }
}
