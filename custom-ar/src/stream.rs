//! In-order device work queues with capture and replay.
//!
//! A [`Stream`] owns one worker thread standing in for a device's execution
//! engine. Host calls only enqueue; kernels run on the worker in submission
//! order, and any waiting a kernel does (barrier spins) stalls the worker,
//! never the host thread that launched it.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};

use crate::error::{CustomArError, Result};
use crate::types::DeviceId;

/// A unit of device work. Must be re-runnable so captured graphs can replay it.
pub type Kernel = Arc<dyn Fn() -> Result<()> + Send + Sync>;

enum Command {
    Launch(Kernel),
    Sync(oneshot::Sender<Option<CustomArError>>),
    Shutdown,
}

/// An in-order queue of device work.
pub struct Stream {
    device: DeviceId,
    tx: mpsc::UnboundedSender<Command>,
    capture: Mutex<Option<Vec<Kernel>>>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl Stream {
    /// Create a stream for `device` and start its worker.
    pub fn new(device: DeviceId) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = std::thread::Builder::new()
            .name(format!("custom-ar-stream-{device}"))
            .spawn(move || run_queue(device, rx))
            .map_err(|e| CustomArError::Stream(format!("spawn worker for device {device}: {e}")))?;
        Ok(Self {
            device,
            tx,
            capture: Mutex::new(None),
            worker: Some(worker),
        })
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Enqueue a kernel, or record it if a capture is active.
    pub fn launch(&self, kernel: Kernel) -> Result<()> {
        let mut capture = self.capture_state()?;
        if let Some(recorded) = capture.as_mut() {
            recorded.push(kernel);
            return Ok(());
        }
        drop(capture);
        self.submit(kernel)
    }

    fn submit(&self, kernel: Kernel) -> Result<()> {
        self.tx
            .send(Command::Launch(kernel))
            .map_err(|_| self.closed())
    }

    /// Wait until all previously enqueued work has run.
    ///
    /// Returns the first kernel fault since the last synchronize, if any.
    /// After a fault the stream skips further kernels until synchronized.
    pub async fn synchronize(&self) -> Result<()> {
        if self.is_capturing() {
            return Err(CustomArError::Stream(format!(
                "device {}: synchronize during capture",
                self.device
            )));
        }
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Command::Sync(done_tx))
            .map_err(|_| self.closed())?;
        match done_rx.await {
            Ok(None) => Ok(()),
            Ok(Some(fault)) => Err(fault),
            Err(_) => Err(self.closed()),
        }
    }

    /// Start recording launches instead of running them.
    pub fn begin_capture(&self) -> Result<()> {
        let mut capture = self.capture_state()?;
        if capture.is_some() {
            return Err(CustomArError::Stream(format!(
                "device {}: capture already active",
                self.device
            )));
        }
        *capture = Some(Vec::new());
        tracing::debug!(device = self.device, "graph capture started");
        Ok(())
    }

    /// Stop recording and return the captured graph.
    pub fn end_capture(&self) -> Result<Graph> {
        let kernels = self.capture_state()?.take().ok_or_else(|| {
            CustomArError::Stream(format!("device {}: no capture active", self.device))
        })?;
        tracing::debug!(
            device = self.device,
            kernels = kernels.len(),
            "graph capture finished"
        );
        Ok(Graph {
            device: self.device,
            kernels,
        })
    }

    pub fn is_capturing(&self) -> bool {
        self.capture
            .lock()
            .map(|c| c.is_some())
            .unwrap_or(false)
    }

    fn capture_state(&self) -> Result<std::sync::MutexGuard<'_, Option<Vec<Kernel>>>> {
        self.capture
            .lock()
            .map_err(|_| CustomArError::LockPoisoned("stream capture"))
    }

    fn closed(&self) -> CustomArError {
        CustomArError::Stream(format!("device {} stream is closed", self.device))
    }
}

impl Drop for Stream {
    /// Drains the queue: kernels already enqueued still run before the worker
    /// exits, so memory they touch must outlive the stream.
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            tracing::warn!(device = self.device, "stream worker panicked");
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("device", &self.device)
            .field("capturing", &self.is_capturing())
            .finish()
    }
}

fn run_queue(device: DeviceId, mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut fault: Option<CustomArError> = None;
    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            Command::Launch(kernel) => {
                if fault.is_some() {
                    continue;
                }
                if let Err(e) = kernel() {
                    tracing::warn!(device, error = %e, "kernel fault");
                    fault = Some(e);
                }
            }
            Command::Sync(done) => {
                let _ = done.send(fault.take());
            }
            Command::Shutdown => break,
        }
    }
    tracing::trace!(device, "stream worker exiting");
}

/// A recorded sequence of kernels that can be replayed on a stream.
///
/// Replay re-enqueues exactly what was recorded; no host-side logic that ran
/// at capture time runs again.
pub struct Graph {
    device: DeviceId,
    kernels: Vec<Kernel>,
}

impl Graph {
    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    /// Enqueue every recorded kernel on `stream`.
    pub fn replay(&self, stream: &Stream) -> Result<()> {
        if stream.device() != self.device {
            return Err(CustomArError::Stream(format!(
                "graph captured on device {} replayed on device {}",
                self.device,
                stream.device()
            )));
        }
        if stream.is_capturing() {
            return Err(CustomArError::Stream(format!(
                "device {}: replay during capture",
                self.device
            )));
        }
        for kernel in &self.kernels {
            stream.submit(Arc::clone(kernel))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("device", &self.device)
            .field("kernels", &self.kernels.len())
            .finish()
    }
}
