//! USB event thread
//!
//! The engine never schedules event processing itself. [`EventLoop`] is an
//! optional driver: a dedicated thread that services the transport's
//! completion events until it is shut down, so callers can run `start`/`stop`
//! from their own thread.

use crate::transport::BulkTransport;
use crate::usb::UsbError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Upper bound on one blocking pass of event processing
pub const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Dedicated thread driving completion events
pub struct EventLoop {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl EventLoop {
    /// Spawn the `usb-events` thread for `transport`
    pub fn spawn<T: BulkTransport>(transport: Arc<T>) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();

        let thread = std::thread::Builder::new()
            .name("usb-events".to_string())
            .spawn(move || run(transport.as_ref(), &flag))?;

        Ok(Self {
            running,
            thread: Some(thread),
        })
    }

    /// True until [`shutdown`](Self::shutdown) is requested
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop the thread and wait for it to exit
    ///
    /// Returns within one poll interval.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("USB event thread panicked");
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn run<T: BulkTransport>(transport: &T, running: &AtomicBool) {
    info!("USB event thread started");

    while running.load(Ordering::Acquire) {
        match transport.handle_events(EVENT_POLL_INTERVAL) {
            Ok(()) => {}
            Err(UsbError::Interrupted) => {
                debug!("USB event handling interrupted");
            }
            Err(e) => {
                warn!("Error handling USB events: {}", e);
                std::thread::sleep(EVENT_POLL_INTERVAL);
            }
        }
    }

    info!("USB event thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockTransport;
    use std::time::Instant;

    #[test]
    fn test_event_loop_polls_until_shutdown() {
        let transport = Arc::new(MockTransport::new());
        let events = EventLoop::spawn(transport.clone()).unwrap();
        assert!(events.is_running());

        let deadline = Instant::now() + Duration::from_secs(2);
        while transport.event_passes() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(transport.event_passes() >= 2);

        events.shutdown();
        let passes = transport.event_passes();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(transport.event_passes(), passes);
    }

    #[test]
    fn test_event_loop_stops_on_drop() {
        let transport = Arc::new(MockTransport::new());
        {
            let _events = EventLoop::spawn(transport.clone()).unwrap();
        }
        let passes = transport.event_passes();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(transport.event_passes(), passes);
    }
}
