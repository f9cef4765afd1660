//! BLE Operation Queue
//!
//! A single mutex wrapping the peripheral. Every read, write, subscription
//! and MTU exchange goes through [`BleOperationQueue::with_lock`]; some
//! platform BLE stacks corrupt half-interleaved GATT requests, so the queue
//! imposes a total order on the wire. The tokio mutex queues waiters FIFO,
//! which keeps a 20 Hz monitor poll from starving an occasional command
//! write.

use std::future::Future;

use tokio::sync::Mutex;

#[derive(Debug, Default)]
pub struct BleOperationQueue {
    gate: Mutex<()>,
}

impl BleOperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs one GATT operation under the queue lock.
    pub async fn with_lock<F>(&self, op: F) -> F::Output
    where
        F: Future,
    {
        let _guard = self.gate.lock().await;
        op.await
    }
}
