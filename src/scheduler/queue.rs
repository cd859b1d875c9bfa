use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{self, OwnedPermit};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{CoderunError, Result};

/// Producer side of the bounded FIFO of job ids awaiting execution.
///
/// Cloned into every submission path. Enqueueing never blocks: a full queue
/// is reported as [`CoderunError::QueueFull`].
#[derive(Debug, Clone)]
pub struct ExecutionQueue {
    tx: mpsc::Sender<Uuid>,
}

/// Consumer side shared by the worker pool. Each id is handed to exactly one
/// caller of [`QueueReceiver::recv`].
#[derive(Debug, Clone)]
pub struct QueueReceiver {
    rx: Arc<Mutex<mpsc::Receiver<Uuid>>>,
}

/// A reserved slot in the queue. Dropping it without sending releases the slot.
#[derive(Debug)]
pub struct QueueSlot {
    permit: OwnedPermit<Uuid>,
}

/// Create a queue holding at most `capacity` pending ids.
pub fn channel(capacity: usize) -> (ExecutionQueue, QueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        ExecutionQueue { tx },
        QueueReceiver {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

impl ExecutionQueue {
    /// Reserve room for one id without committing to send it.
    pub fn try_reserve(&self) -> Result<QueueSlot> {
        match self.tx.clone().try_reserve_owned() {
            Ok(permit) => Ok(QueueSlot { permit }),
            Err(TrySendError::Full(_)) => Err(CoderunError::QueueFull),
            Err(TrySendError::Closed(_)) => Err(CoderunError::ShuttingDown),
        }
    }

    pub fn try_enqueue(&self, job_id: Uuid) -> Result<()> {
        self.try_reserve()?.send(job_id);
        Ok(())
    }

    /// Number of ids waiting to be picked up.
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl QueueSlot {
    pub fn send(self, job_id: Uuid) {
        self.permit.send(job_id);
    }
}

impl QueueReceiver {
    /// Wait for the next id. Returns `None` once every producer is gone and
    /// the queue is drained.
    pub async fn recv(&self) -> Option<Uuid> {
        self.rx.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn preserves_insertion_order() {
        let (queue, rx) = channel(8);
        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            queue.try_enqueue(*id).unwrap();
        }
        assert_eq!(queue.depth(), 5);

        for id in &ids {
            assert_eq!(rx.recv().await, Some(*id));
        }
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn full_queue_rejects_immediately() {
        let (queue, _rx) = channel(2);
        queue.try_enqueue(Uuid::new_v4()).unwrap();
        queue.try_enqueue(Uuid::new_v4()).unwrap();
        assert!(matches!(
            queue.try_enqueue(Uuid::new_v4()),
            Err(CoderunError::QueueFull)
        ));
        assert_eq!(queue.capacity(), 2);
    }

    #[tokio::test]
    async fn dropped_slot_is_released() {
        let (queue, _rx) = channel(1);
        let slot = queue.try_reserve().unwrap();
        assert!(matches!(queue.try_reserve(), Err(CoderunError::QueueFull)));
        drop(slot);
        assert!(queue.try_reserve().is_ok());
    }

    #[tokio::test]
    async fn each_id_is_delivered_once() {
        let (queue, rx) = channel(64);
        for _ in 0..50 {
            queue.try_enqueue(Uuid::new_v4()).unwrap();
        }
        drop(queue);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let rx = rx.clone();
            handles.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(id) = rx.recv().await {
                    seen.push(id);
                }
                seen
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let unique: std::collections::HashSet<_> = all.iter().collect();
        assert_eq!(all.len(), 50);
        assert_eq!(unique.len(), 50);
    }

    #[tokio::test]
    async fn closed_queue_reports_shutdown() {
        let (queue, rx) = channel(1);
        drop(rx);
        assert!(queue.is_closed());
        assert!(matches!(
            queue.try_enqueue(Uuid::new_v4()),
            Err(CoderunError::ShuttingDown)
        ));
    }
}
