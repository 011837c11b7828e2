use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};

/// Connection statistics (libsrt `SRT_TRACEBSTATS` subset).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SrtStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_retransmitted: u64,
    pub packets_lost: u64,
    pub packets_dropped: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Smoothed round-trip time.
    pub rtt_ms: f64,
    /// Estimated link bandwidth.
    pub bandwidth_mbps: f64,
    pub send_rate_mbps: f64,
}

/// Runs a sampling callback on a fixed interval on its own thread.
///
/// The callback reads statistics through the driver, which never takes the
/// locks that send/recv hold. Dropping or [`stop`](Self::stop)ping the
/// sampler ends the thread at the next tick.
#[derive(Debug)]
pub struct StatsSampler {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl StatsSampler {
    pub fn start<F>(interval: Duration, mut tick: F) -> std::io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (stop_tx, stop_rx): (Sender<()>, Receiver<()>) = bounded(0);
        let handle = thread::Builder::new()
            .name("srt-stats".to_string())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => tick(),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                tracing::debug!("stats sampler exited");
            })?;
        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Idempotent. Joins the thread unless called from it.
    pub fn stop(&mut self) {
        // Dropping the sender disconnects the channel.
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for StatsSampler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let mut sampler = StatsSampler::start(Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        thread::sleep(Duration::from_millis(60));
        sampler.stop();
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 2, "only {seen} ticks");

        thread::sleep(Duration::from_millis(20));
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
        sampler.stop();
    }
}
