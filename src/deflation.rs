use std::{sync::Arc, thread::JoinHandle, time::Duration};

use crate::synchronizer::ObjectSynchronizer;

/// Background thread that deflates idle monitors whenever the synchronizer asks for it.
pub struct MonitorDeflationThread {
    sync: Arc<ObjectSynchronizer>,
    handle: Option<JoinHandle<()>>,
}

impl MonitorDeflationThread {
    pub fn start(sync: Arc<ObjectSynchronizer>) -> std::io::Result<Self> {
        {
            // a restarted thread must not see the previous shutdown
            sync.deflation_signal.lock().shutdown = false;
        }
        let thread_sync = sync.clone();
        let handle = std::thread::Builder::new()
            .name("MonitorDeflationThread".to_owned())
            .spawn(move || Self::run(&thread_sync))?;
        Ok(Self {
            sync,
            handle: Some(handle),
        })
    }

    fn run(sync: &ObjectSynchronizer) {
        let interval = Duration::from_millis(sync.config().guaranteed_safepoint_interval_ms.max(1));
        log::debug!(target: "monitorinflation", "deflation thread started");
        loop {
            {
                let mut signal = sync.deflation_signal.lock();
                while !signal.shutdown && !sync.is_async_deflation_needed() {
                    // Wait until notified that there is work or the interval passes. A
                    // timeout just re-evaluates the need for deflation.
                    sync.deflation_cond.wait_for(&mut signal, interval);
                }
                if signal.shutdown {
                    break;
                }
            }
            sync.safepoint().block_if_armed();
            sync.deflate_idle_monitors();
        }
        log::debug!(target: "monitorinflation", "deflation thread stopped");
    }

    /// Asks the thread to stop after its current cycle.
    pub fn shutdown(&self) {
        let mut signal = self.sync.deflation_signal.lock();
        signal.shutdown = true;
        self.sync.deflation_cond.notify_all();
    }

    /// Stops the thread and waits for it to exit.
    pub fn join(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!(target: "monitorinflation", "deflation thread panicked");
            }
        }
    }
}

impl Drop for MonitorDeflationThread {
    fn drop(&mut self) {
        self.stop();
    }
}
