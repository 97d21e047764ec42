//! Recording device for tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::{Device, Worker, WorkerError};
use crate::fetcher::SpeedSignal;
use crate::job::Job;

pub(crate) struct RecordingDevice {
    name: String,
    canceled: Mutex<Vec<(u64, bool)>>,
    fail: AtomicBool,
}

impl RecordingDevice {
    pub(crate) fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            canceled: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        })
    }

    /// Make every cancel notification fail.
    pub(crate) fn fail_cancels(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    /// `(job id, graceful)` for every notification received.
    pub(crate) fn canceled(&self) -> Vec<(u64, bool)> {
        self.canceled.lock().unwrap().clone()
    }
}

impl Device for RecordingDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn notify_canceled(&self, job: &Arc<Job>, graceful: bool) -> Result<(), WorkerError> {
        self.canceled.lock().unwrap().push((job.id(), graceful));
        if self.fail.load(Ordering::SeqCst) {
            return Err(WorkerError::CancelFailed("device unplugged".into()));
        }
        Ok(())
    }
}

pub(crate) fn test_worker(name: &str) -> (Arc<Worker>, Arc<RecordingDevice>) {
    test_worker_with_signal(name, Arc::new(SpeedSignal::new()))
}

pub(crate) fn test_worker_with_signal(
    name: &str,
    signal: Arc<SpeedSignal>,
) -> (Arc<Worker>, Arc<RecordingDevice>) {
    let device = RecordingDevice::new(name);
    (Worker::new(device.clone(), signal), device)
}
