use std::{
    collections::BTreeMap,
    sync::{mpsc::RecvTimeoutError, Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use rand::{thread_rng, Rng};

use crate::{
    api::UnleashApi, metrics::MetricsCollector, repository::Repository, Error, Result,
};

/// Drains evaluation counters into reports of the time bucket since the previous report.
pub(crate) struct MetricsReporter {
    api: Arc<UnleashApi>,
    repository: Arc<Repository>,
    metrics: Arc<dyn MetricsCollector>,
    bucket_start: Mutex<DateTime<Utc>>,
}

impl MetricsReporter {
    pub fn new(
        api: Arc<UnleashApi>,
        repository: Arc<Repository>,
        metrics: Arc<dyn MetricsCollector>,
    ) -> MetricsReporter {
        MetricsReporter {
            api,
            repository,
            metrics,
            bucket_start: Mutex::new(Utc::now()),
        }
    }

    /// Report and clear the counters of every known feature. Nothing is sent if nothing was
    /// counted.
    pub fn flush(&self) -> Result<()> {
        // Only one flush at a time, so that buckets do not overlap.
        let mut bucket_start = self
            .bucket_start
            .lock()
            .expect("thread holding metrics bucket lock should not panic");

        let toggles: BTreeMap<String, _> = self
            .repository
            .get_all()
            .keys()
            .filter_map(|name| {
                let stats = self.metrics.get(name, true);
                (!stats.is_empty()).then(|| (name.clone(), stats))
            })
            .collect();
        if toggles.is_empty() {
            log::trace!(target: "unleash", "no metrics to report");
            return Ok(());
        }

        let stop = Utc::now();
        let start = std::mem::replace(&mut *bucket_start, stop);
        log::debug!(target: "unleash", count = toggles.len(); "reporting metrics");
        self.api.send_metrics(start, stop, &toggles)
    }
}

/// A thread flushing metrics in the background.
///
/// Use [`Client::start_metrics_thread`](crate::Client::start_metrics_thread) to get an instance
/// of it.
pub struct MetricsThread {
    join_handle: std::thread::JoinHandle<()>,

    /// Used to send a stop command to the metrics thread.
    stop_sender: std::sync::mpsc::Sender<()>,
}

/// Maximum random delay added to every interval, so that instances started together do not
/// report in lockstep.
const FLUSH_JITTER: Duration = Duration::from_secs(5);

impl MetricsThread {
    pub(crate) fn start(reporter: Arc<MetricsReporter>, interval: Duration) -> Result<MetricsThread> {
        let (stop_sender, stop_receiver) = std::sync::mpsc::channel::<()>();

        let join_handle = std::thread::Builder::new()
            .name("unleash-metrics".to_owned())
            .spawn(move || loop {
                let timeout = jitter(interval, FLUSH_JITTER);
                match stop_receiver.recv_timeout(timeout) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        log::debug!(target: "unleash", "metrics thread received stop command");
                        // Report what was counted since the last flush before exiting.
                        if let Err(err) = reporter.flush() {
                            log::warn!(target: "unleash", "failed to report metrics: {:?}", err);
                        }
                        return;
                    }
                }

                if let Err(err) = reporter.flush() {
                    // Counters are cleared on flush: this bucket is lost, the next one is not.
                    log::warn!(target: "unleash", "failed to report metrics: {:?}", err);
                }
            })
            .map_err(Error::from)?;

        Ok(MetricsThread {
            join_handle,
            stop_sender,
        })
    }

    /// Stop the metrics thread after one last flush.
    ///
    /// This function does not wait for the thread to actually stop.
    pub fn stop(&self) {
        // Error means that the receiver was dropped (thread exited). Ignoring it as there's nothing
        // useful we can do.
        let _ = self.stop_sender.send(());
    }

    /// Stop the metrics thread and block waiting for it to exit.
    ///
    /// If you don't need to wait for the thread to exit, use [`MetricsThread::stop`] instead.
    pub fn shutdown(self) -> Result<()> {
        self.stop();

        self.join_handle
            .join()
            .map_err(|_| Error::ReporterThreadPanicked)?;

        Ok(())
    }
}

/// Apply a random jitter to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    interval + thread_rng().gen_range(Duration::ZERO..jitter)
}
