//! Edge-event plumbing shared by the fd-backed drivers.
//!
//! A driver exposes its kernel event interface as an [`EventSource`], and
//! this module supplies the two consumers: [`wait_edge`] for blocking waits
//! and [`AsyncInterrupt`] for a callback dispatch thread. Both multiplex the
//! source with an eventfd so they can be interrupted without a timeout race.

use std::fmt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::thread;

use tracing::trace;

use super::driver::{CancelToken, EventCallback};
use super::epoll::{epoll_event, Epoll, EventFd, EPOLLIN};
use super::{Error, PinEvent, Result, WaitForEventResult};

const EVENT_ID: u64 = 0;
const STOP_ID: u64 = 1;

/// A file descriptor that produces edge events for a single pin.
pub(crate) trait EventSource {
    fn raw_fd(&self) -> RawFd;

    /// epoll event mask the descriptor signals readiness with.
    fn poll_flags(&self) -> i32;

    /// Consumes the pending readiness. Returns an empty list when it turned
    /// out to be spurious, and more than one event when a single wakeup
    /// reveals a missed pulse.
    fn read_event(&mut self) -> Result<Vec<PinEvent>>;
}

/// Blocks until the source produces an event or the token expires.
pub(crate) fn wait_edge(
    source: &mut dyn EventSource,
    cancel: &CancelToken,
) -> Result<WaitForEventResult> {
    let epoll = Epoll::new()?;
    epoll.add(source.raw_fd(), EVENT_ID, source.poll_flags())?;

    // The token's fd becomes readable on cancel() and stays readable.
    epoll.add(cancel.as_raw_fd(), STOP_ID, EPOLLIN)?;

    let mut events = [epoll_event { events: 0, u64: 0 }; 2];

    loop {
        if cancel.expired() {
            return Ok(WaitForEventResult::timed_out());
        }

        let num_events = epoll.wait(&mut events, cancel.remaining())?;

        // No events means a timeout occurred
        if num_events == 0 {
            return Ok(WaitForEventResult::timed_out());
        }

        // An edge that raced the cancellation still wins.
        let mut cancelled = false;
        for event in &events[..num_events] {
            match event.u64 {
                EVENT_ID => {
                    if let Some(pin_event) = source.read_event()?.first() {
                        return Ok(WaitForEventResult::event(pin_event.edge));
                    }
                }
                _ => cancelled = true,
            }
        }

        if cancelled {
            return Ok(WaitForEventResult::timed_out());
        }
    }
}

// Dispatches edge events to a callback from its own thread until stopped.
pub(crate) struct AsyncInterrupt {
    tx: EventFd,
    poll_thread: Option<thread::JoinHandle<Result<()>>>,
}

impl AsyncInterrupt {
    pub(crate) fn spawn<S>(mut source: S, mut callback: EventCallback) -> Result<AsyncInterrupt>
    where
        S: EventSource + Send + 'static,
    {
        let tx = EventFd::new()?;
        let rx = tx.fd();

        let poll_thread = thread::Builder::new()
            .name("gpio-events".to_string())
            .spawn(move || -> Result<()> {
                let poll = Epoll::new()?;
                poll.add(source.raw_fd(), EVENT_ID, source.poll_flags())?;

                // rx becomes readable when stop() calls notify()
                poll.add(rx, STOP_ID, EPOLLIN)?;

                let mut events = [epoll_event { events: 0, u64: 0 }; 2];
                loop {
                    let num_events = poll.wait(&mut events, None)?;

                    for event in &events[..num_events] {
                        match event.u64 {
                            EVENT_ID => {
                                for pin_event in source.read_event()? {
                                    trace!("pin {} edge {}", pin_event.pin, pin_event.edge);
                                    callback(pin_event);
                                }
                            }
                            _ => return Ok(()),
                        }
                    }
                }
            })?;

        Ok(AsyncInterrupt {
            tx,
            poll_thread: Some(poll_thread),
        })
    }

    pub(crate) fn stop(&mut self) -> Result<()> {
        self.tx.notify()?;

        if let Some(poll_thread) = self.poll_thread.take() {
            // A handler can trigger a stop from the dispatch thread itself,
            // e.g. by unregistering its own pin's last callback. The
            // notification already makes the loop exit; joining here would
            // wait on the calling thread.
            if poll_thread.thread().id() == thread::current().id() {
                return Ok(());
            }

            match poll_thread.join() {
                Ok(r) => return r,
                Err(_) => return Err(Error::ThreadPanic),
            }
        }

        Ok(())
    }
}

impl Drop for AsyncInterrupt {
    fn drop(&mut self) {
        if self.poll_thread.is_some() {
            let _ = self.stop();
        }
    }
}

impl fmt::Debug for AsyncInterrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncInterrupt")
            .field("tx", &self.tx)
            .field("poll_thread", &self.poll_thread)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::io::RawFd;
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    use libc::c_void;

    use super::super::epoll::{EventFd, EPOLLIN};
    use super::super::{PinEvent, PinEventTypes, Result};
    use super::{AsyncInterrupt, EventSource};

    // Event source backed by a plain eventfd, standing in for a GPIO line.
    struct NotifySource {
        fd: EventFd,
    }

    impl NotifySource {
        fn new() -> (NotifySource, RawFd) {
            let fd = EventFd::new().unwrap();
            let raw = fd.fd();

            (NotifySource { fd }, raw)
        }
    }

    impl EventSource for NotifySource {
        fn raw_fd(&self) -> RawFd {
            self.fd.fd()
        }

        fn poll_flags(&self) -> i32 {
            EPOLLIN
        }

        fn read_event(&mut self) -> Result<Vec<PinEvent>> {
            let mut buffer: u64 = 0;
            unsafe {
                libc::read(self.fd.fd(), &mut buffer as *mut u64 as *mut c_void, 8);
            }

            Ok(vec![PinEvent {
                pin: 0,
                edge: PinEventTypes::RISING,
            }])
        }
    }

    fn signal(fd: RawFd) {
        let buffer: u64 = 1;
        unsafe {
            libc::write(fd, &buffer as *const u64 as *const c_void, 8);
        }
    }

    #[test]
    fn dispatch_delivers_and_stop_joins() {
        let (source, fd) = NotifySource::new();
        let (tx, rx) = mpsc::channel();

        let mut interrupt = AsyncInterrupt::spawn(
            source,
            Box::new(move |event| {
                tx.send(event).unwrap();
            }),
        )
        .unwrap();

        signal(fd);
        let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(event.pin, 0);
        assert_eq!(event.edge, PinEventTypes::RISING);

        interrupt.stop().unwrap();
    }

    #[test]
    fn stop_completes_while_a_handler_is_busy() {
        let (source, fd) = NotifySource::new();
        let (entered_tx, entered_rx) = mpsc::channel();

        let mut interrupt = AsyncInterrupt::spawn(
            source,
            Box::new(move |_| {
                entered_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(200));
            }),
        )
        .unwrap();

        signal(fd);
        entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        // The caller holds no shared state here, so stopping only has to
        // wait for the handler to return.
        interrupt.stop().unwrap();
    }

    #[test]
    fn stop_from_a_handler_does_not_wait_on_itself() {
        let (source, fd) = NotifySource::new();
        let slot: Arc<Mutex<Option<AsyncInterrupt>>> = Arc::new(Mutex::new(None));
        let (tx, rx) = mpsc::channel();

        let cb_slot = slot.clone();
        let interrupt = AsyncInterrupt::spawn(
            source,
            Box::new(move |_| {
                if let Some(mut interrupt) = cb_slot.lock().unwrap().take() {
                    tx.send(interrupt.stop()).unwrap();
                }
            }),
        )
        .unwrap();
        *slot.lock().unwrap() = Some(interrupt);

        signal(fd);
        rx.recv_timeout(Duration::from_secs(2))
            .expect("stop blocked joining its own dispatch thread")
            .unwrap();
    }
}
