use std::fmt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::warn;

use super::epoll::EventFd;
use super::{PinEvent, PinEventTypes, PinMode, PinValue, Result, WaitForEventResult};

/// Boxed callback invoked for each matching edge event.
pub type EventCallback = Box<dyn FnMut(PinEvent) + Send>;

/// Requests early termination of a blocking event wait.
///
/// Tokens are cheap to clone; all clones share the same state. A token can
/// carry an optional deadline, after which [`expired`] starts returning
/// `true`. Cancelling is sticky and wakes every wait that observes the
/// token, either through [`expired`] polling or through the token's file
/// descriptor.
///
/// [`expired`]: CancelToken::expired
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug)]
struct TokenInner {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
    event_fd: EventFd,
}

impl CancelToken {
    /// Constructs a new `CancelToken` without a deadline.
    pub fn new() -> Result<CancelToken> {
        CancelToken::with_timeout(None)
    }

    /// Constructs a new `CancelToken` that expires after `timeout`.
    ///
    /// `None` means the token never expires on its own and has to be
    /// cancelled explicitly.
    pub fn with_timeout(timeout: Option<Duration>) -> Result<CancelToken> {
        Ok(CancelToken {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                deadline: timeout.map(|timeout| Instant::now() + timeout),
                event_fd: EventFd::new()?,
            }),
        })
    }

    /// Cancels the token, waking all pending waits that share it.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);

        // The fd stays readable because nothing ever reads it back down, so
        // every registered waiter sees the wakeup.
        if let Err(e) = self.inner.event_fd.notify() {
            warn!("cancel notification failed: {}", e);
        }
    }

    /// Returns `true` if [`cancel`] has been called on this token or one of
    /// its clones.
    ///
    /// [`cancel`]: CancelToken::cancel
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Returns `true` if the token has been cancelled or its deadline has
    /// passed.
    pub fn expired(&self) -> bool {
        if self.is_cancelled() {
            return true;
        }

        match self.inner.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }

    /// Returns the time left until the deadline, or `None` if the token
    /// doesn't have one.
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

impl AsRawFd for CancelToken {
    /// Returns a file descriptor that becomes readable once the token is
    /// cancelled. Waiters register it for level-triggered polling and must
    /// not read from it.
    fn as_raw_fd(&self) -> RawFd {
        self.inner.event_fd.fd()
    }
}

/// Hardware access behind a [`GpioController`].
///
/// All pin numbers passed to driver methods are logical GPIO numbers; the
/// controller performs numbering scheme translation before delegating.
/// Implementations are shared across threads, so every method takes `&self`
/// and interior state needs its own synchronization.
///
/// [`GpioController`]: super::GpioController
pub trait GpioDriver: fmt::Debug + Send + Sync {
    /// Returns the number of pins this driver exposes.
    ///
    /// Drivers that can't report a count, like the sysfs interface on an
    /// unidentified board, return [`Error::NotSupported`].
    ///
    /// [`Error::NotSupported`]: super::Error::NotSupported
    fn pin_count(&self) -> Result<u8>;

    /// Translates a physical header position to a logical GPIO number.
    ///
    /// The default implementation treats both numberings as identical.
    fn board_to_logical(&self, pin: u8) -> Result<u8> {
        Ok(pin)
    }

    /// Opens the specified pin for use.
    ///
    /// The controller calls this exactly once per open/close pair.
    fn open(&self, pin: u8) -> Result<()>;

    /// Closes the specified pin, releasing its resources.
    fn close(&self, pin: u8) -> Result<()>;

    /// Returns the current mode of the specified pin.
    fn mode(&self, pin: u8) -> Result<PinMode>;

    /// Sets the mode of the specified pin.
    fn set_mode(&self, pin: u8, mode: PinMode) -> Result<()>;

    /// Sets the mode of the specified pin and presets its logic level.
    ///
    /// The default implementation writes the level before switching an output
    /// pin's mode, so drivers whose write path latches a value while the pin
    /// is still an input get a glitch-free transition.
    fn set_mode_with_value(&self, pin: u8, mode: PinMode, value: PinValue) -> Result<()> {
        if mode == PinMode::Output {
            self.write(pin, value)?;
        }

        self.set_mode(pin, mode)
    }

    /// Checks if the specified pin supports the specified mode.
    fn is_mode_supported(&self, pin: u8, mode: PinMode) -> bool;

    /// Reads the current logic level of the specified pin.
    fn read(&self, pin: u8) -> Result<PinValue>;

    /// Writes a logic level to the specified pin.
    fn write(&self, pin: u8, value: PinValue) -> Result<()>;

    /// Inverts the current logic level of the specified pin.
    fn toggle(&self, pin: u8) -> Result<()> {
        let value = self.read(pin)?;

        self.write(pin, !value)
    }

    /// Configures the specified pin to invoke `callback` from the driver's
    /// event dispatch thread for every edge in `events`.
    ///
    /// A pin has a single callback slot; the controller multiplexes its
    /// registrations through one trampoline. Fails with [`Error::PinBusy`]
    /// if the slot is taken or a blocking wait is active on the pin.
    ///
    /// [`Error::PinBusy`]: super::Error::PinBusy
    fn set_async_interrupt(
        &self,
        pin: u8,
        events: PinEventTypes,
        callback: EventCallback,
    ) -> Result<()>;

    /// Removes the configured callback from the specified pin and stops its
    /// dispatch.
    fn clear_async_interrupt(&self, pin: u8) -> Result<()>;

    /// Blocks until an edge in `events` occurs on the specified pin, or the
    /// token expires.
    ///
    /// Expiration is reported through [`WaitForEventResult::timed_out`].
    /// Implementations either register the token's file descriptor for
    /// polling or check [`CancelToken::expired`] at a short interval.
    fn wait_for_event(
        &self,
        pin: u8,
        events: PinEventTypes,
        cancel: &CancelToken,
    ) -> Result<WaitForEventResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_flags() {
        let token = CancelToken::new().unwrap();
        assert!(!token.is_cancelled());
        assert!(!token.expired());
        assert!(token.remaining().is_none());

        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(token.expired());
    }

    #[test]
    fn cancel_token_deadline() {
        let token = CancelToken::with_timeout(Some(Duration::from_millis(0))).unwrap();
        assert!(!token.is_cancelled());
        assert!(token.expired());
        assert_eq!(token.remaining(), Some(Duration::from_millis(0)));
    }

    #[test]
    fn cancel_token_fd() {
        let token = CancelToken::new().unwrap();
        assert!(token.as_raw_fd() >= 0);
    }
}
