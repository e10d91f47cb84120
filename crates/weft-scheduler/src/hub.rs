use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use weft_core::PipId;
use weft_fingerprint::AccessReport;

/// Message delivered on a pip's access channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessMessage {
    Report(AccessReport),
    /// Sentinel: the process tree has exited and no further reports follow.
    ProcessTerminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("{0}: no access channel is open for this pip")]
    UnknownPip(PipId),
    #[error("{0}: access channel closed")]
    Closed(PipId),
}

/// Routes access reports from sandboxed processes to the pip that owns them.
///
/// Each executing pip gets a bounded channel; a full channel applies backpressure to the
/// reporter instead of dropping reports.
#[derive(Debug, Clone)]
pub struct AccessReportHub {
    channels: Arc<Mutex<HashMap<PipId, mpsc::Sender<AccessMessage>>>>,
    capacity: usize,
}

impl AccessReportHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Open the channel for one execution attempt, replacing any stale one.
    pub fn open(&self, pip: PipId) -> AccessReportReceiver {
        let (tx, rx) = mpsc::channel(self.capacity);
        if self.channels.lock().insert(pip, tx).is_some() {
            tracing::debug!(target = "weft.scheduler", %pip, "replaced stale access channel");
        }
        AccessReportReceiver { pip, rx }
    }

    pub async fn post(&self, pip: PipId, report: AccessReport) -> Result<(), HubError> {
        let sender = self
            .channels
            .lock()
            .get(&pip)
            .cloned()
            .ok_or(HubError::UnknownPip(pip))?;
        sender
            .send(AccessMessage::Report(report))
            .await
            .map_err(|_| HubError::Closed(pip))
    }

    /// Close the pip's channel. Reports already queued are still delivered. Idempotent.
    pub async fn terminate(&self, pip: PipId) {
        let sender = self.channels.lock().remove(&pip);
        if let Some(sender) = sender {
            // The receiver may already be gone if collection was abandoned.
            let _ = sender.send(AccessMessage::ProcessTerminated).await;
        }
    }

    pub fn is_open(&self, pip: PipId) -> bool {
        self.channels.lock().contains_key(&pip)
    }

    /// Handle an executor uses to report accesses for `pip`.
    pub fn reporter(&self, pip: PipId) -> AccessReporter {
        AccessReporter {
            hub: self.clone(),
            pip,
        }
    }
}

/// Receiving half of one pip's access channel.
#[derive(Debug)]
pub struct AccessReportReceiver {
    pip: PipId,
    rx: mpsc::Receiver<AccessMessage>,
}

impl AccessReportReceiver {
    pub fn pip(&self) -> PipId {
        self.pip
    }

    /// Drain reports until the termination sentinel arrives or every sender is gone.
    pub async fn collect(mut self) -> Vec<AccessReport> {
        let mut reports = Vec::new();
        while let Some(message) = self.rx.recv().await {
            match message {
                AccessMessage::Report(report) => reports.push(report),
                AccessMessage::ProcessTerminated => break,
            }
        }
        tracing::trace!(
            target = "weft.scheduler",
            pip = %self.pip,
            reports = reports.len(),
            "access channel drained"
        );
        reports
    }
}

/// Per-pip sending handle passed to executors.
#[derive(Debug, Clone)]
pub struct AccessReporter {
    hub: AccessReportHub,
    pip: PipId,
}

impl AccessReporter {
    pub fn pip(&self) -> PipId {
        self.pip
    }

    pub async fn report(&self, report: AccessReport) -> Result<(), HubError> {
        self.hub.post(self.pip, report).await
    }
}
