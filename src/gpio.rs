//! Interface for GPIO pin control through pluggable hardware drivers.
//!
//! A [`GpioController`] owns a single [`GpioDriver`] and is the entry point
//! for all pin operations. The controller tracks which pins are open,
//! translates pin numbers from the configured [`PinNumberingScheme`] to the
//! driver's logical numbering, enforces mode rules, and fans out edge-event
//! callbacks. The driver performs the actual I/O.
//!
//! ## Drivers
//!
//! [`GpioController::new`] selects the most capable driver for the running
//! board: the memory-mapped register driver on a Raspberry Pi, otherwise the
//! `/dev/gpiochip*` character device, otherwise the legacy `/sys/class/gpio`
//! interface. A specific driver (including [`SimulatedDriver`] for running
//! off target hardware) can be supplied through
//! [`GpioController::with_driver`].
//!
//! ## Pins
//!
//! Pins are opened by number in the controller's numbering scheme. Opening
//! returns a [`GpioPin`] handle that forwards its operations to the driver
//! using the translated logical number. The handle is a transient view: it
//! holds no open/closed state of its own, and closing is tracked only by the
//! controller.
//!
//! ## Edge events
//!
//! Callbacks registered through [`GpioController::register_callback`] are
//! invoked on the driver's event dispatch thread whenever a matching edge
//! occurs. [`GpioController::wait_for_event`] blocks until an edge, timeout
//! or cancellation, and [`GpioController::wait_for_event_async`] exposes the
//! same wait as a future completed on a background thread.
//!
//! ## Troubleshooting
//!
//! ### Permission denied
//!
//! On most distributions, users that are a member of the `gpio` group can
//! access `/dev/gpiomem` and `/dev/gpiochipN` without additional privileges.
//! [`Error::PermissionDenied`] usually means the current user isn't a member
//! of the `gpio` group, or the legacy sysfs interface is owned by root only.

use std::collections::BTreeMap;
use std::error;
use std::fmt;
use std::future::Future;
use std::io;
use std::ops::Not;
use std::pin::Pin;
use std::result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::thread;
use std::time::Duration;

use bitflags::bitflags;
use tracing::{debug, warn};

mod cdev;
mod driver;
mod epoll;
#[cfg(feature = "hal")]
mod hal;
mod interrupt;
mod pin;
mod rpi;
mod sim;
mod sysfs;

use crate::system;
use crate::system::DeviceInfo;

pub use self::cdev::CdevDriver;
pub use self::driver::{CancelToken, EventCallback, GpioDriver};
pub use self::pin::GpioPin;
pub use self::rpi::RaspberryPiDriver;
pub use self::sim::SimulatedDriver;
pub use self::sysfs::SysfsDriver;

/// Errors that can occur when accessing the GPIO peripheral.
#[derive(Debug)]
pub enum Error {
    /// Unknown model.
    ///
    /// The board or SoC can't be identified, so no suitable driver could be
    /// selected automatically. You may also encounter this error if your
    /// Linux distribution doesn't provide any of the common user-accessible
    /// system files that are used to identify the model and SoC.
    UnknownModel,
    /// Pin is not available.
    ///
    /// The driver doesn't expose a GPIO pin with the specified number. Pins
    /// are addressed by their logical GPIO numbers, or by their physical
    /// location on the header when the controller uses
    /// [`PinNumberingScheme::Board`].
    PinNotAvailable(u8),
    /// Pin is not open.
    ///
    /// The operation requires the pin to have been opened through the
    /// controller first. Closing a pin that is not open fails with this
    /// error as well.
    PinNotOpen(u8),
    /// The pin's current mode doesn't permit the operation.
    ///
    /// Writing or toggling requires the pin to be in [`PinMode::Output`].
    WrongMode(u8, PinMode),
    /// The driver doesn't support the requested mode on this pin.
    ModeNotSupported(u8, PinMode),
    /// The selected driver doesn't support the requested feature.
    NotSupported(&'static str),
    /// No edge event types specified.
    InvalidEventTypes,
    /// The pin's event interface is already in use.
    ///
    /// A pin can serve one event consumer at a time: either registered
    /// callbacks or a blocking wait, not both.
    PinBusy(u8),
    /// Permission denied when opening `/dev/gpiomem`, `/dev/mem`,
    /// `/dev/gpiochipN` or `/sys/class/gpio/*` for read/write access.
    ///
    /// More information on possible causes for this error can be found
    /// [here](index.html#permission-denied).
    PermissionDenied(String),
    /// I/O error.
    Io(io::Error),
    /// Thread panicked.
    ThreadPanic,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::UnknownModel => write!(f, "Unknown board model"),
            Error::PinNotAvailable(pin) => write!(f, "Pin {} is not available", pin),
            Error::PinNotOpen(pin) => write!(f, "Pin {} is not open", pin),
            Error::WrongMode(pin, mode) => {
                write!(f, "Pin {} is set to {}, which doesn't permit this operation", pin, mode)
            }
            Error::ModeNotSupported(pin, mode) => {
                write!(f, "Pin {} doesn't support mode {}", pin, mode)
            }
            Error::NotSupported(feature) => write!(f, "Not supported: {}", feature),
            Error::InvalidEventTypes => write!(f, "No edge event types specified"),
            Error::PinBusy(pin) => write!(f, "Pin {} event interface is already in use", pin),
            Error::PermissionDenied(ref path) => write!(f, "Permission denied: {}", path),
            Error::Io(ref err) => write!(f, "I/O error: {}", err),
            Error::ThreadPanic => write!(f, "Thread panicked"),
        }
    }
}

impl error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}

impl From<system::Error> for Error {
    fn from(_err: system::Error) -> Error {
        Error::UnknownModel
    }
}

/// Result type returned from methods that can have `sbc_gpio::gpio::Error`s.
pub type Result<T> = result::Result<T, Error>;

/// Pin logic levels.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[repr(u8)]
pub enum PinValue {
    Low = 0,
    High = 1,
}

impl fmt::Display for PinValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            PinValue::Low => write!(f, "Low"),
            PinValue::High => write!(f, "High"),
        }
    }
}

impl From<bool> for PinValue {
    fn from(e: bool) -> PinValue {
        if e {
            PinValue::High
        } else {
            PinValue::Low
        }
    }
}

impl From<u8> for PinValue {
    fn from(value: u8) -> Self {
        if value == 0 {
            PinValue::Low
        } else {
            PinValue::High
        }
    }
}

impl PartialEq<u8> for PinValue {
    fn eq(&self, other: &u8) -> bool {
        *self == PinValue::from(*other)
    }
}

impl PartialEq<PinValue> for u8 {
    fn eq(&self, other: &PinValue) -> bool {
        PinValue::from(*self) == *other
    }
}

impl Not for PinValue {
    type Output = PinValue;

    fn not(self) -> PinValue {
        match self {
            PinValue::Low => PinValue::High,
            PinValue::High => PinValue::Low,
        }
    }
}

/// Pin modes.
///
/// A pin is in exactly one mode at a time. Not every driver supports every
/// mode; use [`GpioController::is_pin_mode_supported`] to probe before
/// setting one.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[repr(u8)]
pub enum PinMode {
    Input,
    Output,
    InputPullUp,
    InputPullDown,
}

impl fmt::Display for PinMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            PinMode::Input => write!(f, "In"),
            PinMode::Output => write!(f, "Out"),
            PinMode::InputPullUp => write!(f, "InPullUp"),
            PinMode::InputPullDown => write!(f, "InPullDown"),
        }
    }
}

bitflags! {
    /// Edge event types.
    ///
    /// Used both to subscribe to edge transitions and to report which edge
    /// occurred. An empty set means no edges.
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    pub struct PinEventTypes: u8 {
        const RISING = 0b0000_0001;
        const FALLING = 0b0000_0010;
    }
}

impl fmt::Display for PinEventTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "None")
        } else if self.is_all() {
            write!(f, "Both")
        } else if self.contains(PinEventTypes::RISING) {
            write!(f, "Rising")
        } else {
            write!(f, "Falling")
        }
    }
}

/// Pin numbering schemes.
///
/// `Logical` numbers are the driver's native GPIO numbers. `Board` numbers
/// follow the physical header layout and are translated to logical numbers
/// through the driver. The scheme is fixed when the controller is
/// constructed.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum PinNumberingScheme {
    Logical,
    Board,
}

/// Edge event passed to registered callbacks.
///
/// `pin` is the logical pin number and `edge` contains the single edge type
/// that occurred.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct PinEvent {
    pub pin: u8,
    pub edge: PinEventTypes,
}

/// Outcome of a call to one of the `wait_for_event` methods.
///
/// `timed_out` is `true` when the wait ended because of the timeout or
/// cancellation rather than an edge. `event_types` contains the observed
/// edge, or is empty if none was seen.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct WaitForEventResult {
    pub event_types: PinEventTypes,
    pub timed_out: bool,
}

impl WaitForEventResult {
    pub(crate) fn event(edge: PinEventTypes) -> WaitForEventResult {
        WaitForEventResult {
            event_types: edge,
            timed_out: false,
        }
    }

    pub(crate) fn timed_out() -> WaitForEventResult {
        WaitForEventResult {
            event_types: PinEventTypes::empty(),
            timed_out: true,
        }
    }
}

/// Identifies a single callback registration on a controller.
///
/// Returned by [`GpioController::register_callback`]. Each registration gets
/// its own id, so registering the same closure twice yields two ids that can
/// be unregistered independently.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub struct CallbackId(u64);

struct CallbackEntry {
    id: CallbackId,
    events: PinEventTypes,
    // Shared with in-flight dispatches, so the list lock doesn't have to be
    // held while a handler runs.
    handler: Arc<Mutex<EventCallback>>,
}

// Callback registrations are shared with the driver-side trampoline through
// an Arc, so dispatch keeps working without touching the open-pin map.
type CallbackList = Arc<Mutex<Vec<CallbackEntry>>>;

struct OpenPinState {
    logical: u8,
    mode: PinMode,
    callbacks: CallbackList,
}

/// Owns a GPIO driver and provides access to its pins.
///
/// All pin numbers accepted by the controller's methods are interpreted in
/// the numbering scheme selected at construction. The controller has
/// exclusive ownership of the driver; when the controller is dropped, every
/// pin that is still open is closed.
pub struct GpioController {
    driver: Arc<dyn GpioDriver>,
    scheme: PinNumberingScheme,
    pins: Mutex<BTreeMap<u8, OpenPinState>>,
    next_callback_id: AtomicU64,
}

impl fmt::Debug for GpioController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpioController")
            .field("driver", &self.driver)
            .field("scheme", &self.scheme)
            .field("pins", &format_args!("{{ .. }}"))
            .finish()
    }
}

impl GpioController {
    /// Constructs a new `GpioController` with the most capable driver
    /// available on the running board.
    ///
    /// On a Raspberry Pi the memory-mapped register driver is used. On other
    /// boards the GPIO character device is preferred, with the legacy sysfs
    /// interface as a fallback. Returns [`Error::UnknownModel`] if no driver
    /// can be constructed.
    pub fn new(scheme: PinNumberingScheme) -> Result<GpioController> {
        let mut last_error = None;

        if let Ok(device_info) = DeviceInfo::new() {
            match RaspberryPiDriver::new() {
                Ok(driver) => {
                    debug!("detected {}, using memory-mapped driver", device_info.model());
                    return Ok(GpioController::with_driver(scheme, driver));
                }
                Err(e) => {
                    debug!("memory-mapped driver unavailable: {}", e);
                    last_error = Some(e);
                }
            }
        }

        match CdevDriver::new() {
            Ok(driver) => {
                debug!("using GPIO character device driver");
                return Ok(GpioController::with_driver(scheme, driver));
            }
            Err(e) => {
                debug!("character device driver unavailable: {}", e);
                if !matches!(e, Error::UnknownModel) {
                    last_error = Some(e);
                }
            }
        }

        if std::path::Path::new(sysfs::GPIO_BASE_PATH).exists() {
            match SysfsDriver::new() {
                Ok(driver) => {
                    debug!("using sysfs driver");
                    return Ok(GpioController::with_driver(scheme, driver));
                }
                Err(e) => {
                    debug!("sysfs driver unavailable: {}", e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(Error::UnknownModel))
    }

    /// Constructs a new `GpioController` with the specified driver.
    ///
    /// The controller takes exclusive ownership of the driver for its
    /// lifetime.
    pub fn with_driver<D>(scheme: PinNumberingScheme, driver: D) -> GpioController
    where
        D: GpioDriver + 'static,
    {
        GpioController {
            driver: Arc::new(driver),
            scheme,
            pins: Mutex::new(BTreeMap::new()),
            next_callback_id: AtomicU64::new(0),
        }
    }

    /// Returns the numbering scheme selected at construction.
    pub fn scheme(&self) -> PinNumberingScheme {
        self.scheme
    }

    /// Returns the number of pins addressable through the driver.
    pub fn pin_count(&self) -> Result<u8> {
        self.driver.pin_count()
    }

    /// Returns `true` if the specified pin is open.
    pub fn is_pin_open(&self, pin: u8) -> bool {
        self.pins.lock().unwrap().contains_key(&pin)
    }

    /// Checks if the specified pin supports the specified mode.
    ///
    /// The pin doesn't have to be open.
    pub fn is_pin_mode_supported(&self, pin: u8, mode: PinMode) -> Result<bool> {
        let logical = self.to_logical(pin)?;

        Ok(self.driver.is_mode_supported(logical, mode))
    }

    /// Opens the specified pin, inheriting the mode the driver reports for
    /// it.
    ///
    /// Opening a pin that is already open returns a handle equal to the
    /// existing one.
    pub fn open_pin(&self, pin: u8) -> Result<GpioPin<'_>> {
        let (logical, _) = self.open_pin_inner(pin)?;

        Ok(GpioPin::new(logical, self))
    }

    /// Opens the specified pin and sets its mode.
    ///
    /// If the pin is already open, only the mode is changed.
    pub fn open_pin_with_mode(&self, pin: u8, mode: PinMode) -> Result<GpioPin<'_>> {
        let (logical, fresh) = self.open_pin_inner(pin)?;

        if let Err(e) = self.set_pin_mode(pin, mode) {
            if fresh {
                self.rollback_open(pin, logical);
            }
            return Err(e);
        }

        Ok(GpioPin::new(logical, self))
    }

    /// Opens the specified pin, sets its mode and presets its logic level in
    /// a single operation.
    ///
    /// For output pins, the level is applied before the mode switch where the
    /// driver allows it, so the pin never briefly drives the wrong state.
    pub fn open_pin_with_value(
        &self,
        pin: u8,
        mode: PinMode,
        value: PinValue,
    ) -> Result<GpioPin<'_>> {
        let (logical, fresh) = self.open_pin_inner(pin)?;

        let result = if self.driver.is_mode_supported(logical, mode) {
            self.driver
                .set_mode_with_value(logical, mode, value)
                .map(|_| {
                    let mut pins = self.pins.lock().unwrap();
                    if let Some(state) = pins.get_mut(&pin) {
                        state.mode = mode;
                    }
                })
        } else {
            Err(Error::ModeNotSupported(pin, mode))
        };

        if let Err(e) = result {
            if fresh {
                self.rollback_open(pin, logical);
            }
            return Err(e);
        }

        Ok(GpioPin::new(logical, self))
    }

    /// Closes the specified pin, removing all of its callback registrations.
    ///
    /// Returns [`Error::PinNotOpen`] if the pin is not open. A handle
    /// obtained before the close stays usable and forwards straight to the
    /// driver.
    pub fn close_pin(&self, pin: u8) -> Result<()> {
        let state = self
            .pins
            .lock()
            .unwrap()
            .remove(&pin)
            .ok_or(Error::PinNotOpen(pin))?;

        self.teardown_pin(pin, &state);

        self.driver.close(state.logical)
    }

    /// Returns the current mode of the specified pin.
    pub fn pin_mode(&self, pin: u8) -> Result<PinMode> {
        let logical = self.logical_of_open(pin)?;
        let mode = self.driver.mode(logical)?;

        let mut pins = self.pins.lock().unwrap();
        if let Some(state) = pins.get_mut(&pin) {
            state.mode = mode;
        }

        Ok(mode)
    }

    /// Sets the mode of the specified pin.
    ///
    /// Fails with [`Error::ModeNotSupported`] if the driver can't provide the
    /// mode on this pin.
    pub fn set_pin_mode(&self, pin: u8, mode: PinMode) -> Result<()> {
        let logical = self.logical_of_open(pin)?;

        if !self.driver.is_mode_supported(logical, mode) {
            return Err(Error::ModeNotSupported(pin, mode));
        }

        self.driver.set_mode(logical, mode)?;

        let mut pins = self.pins.lock().unwrap();
        if let Some(state) = pins.get_mut(&pin) {
            state.mode = mode;
        }

        Ok(())
    }

    /// Reads the current logic level of the specified pin.
    ///
    /// Reading is permitted in every mode; for output pins it returns the
    /// driven level.
    pub fn read(&self, pin: u8) -> Result<PinValue> {
        let logical = self.logical_of_open(pin)?;

        self.driver.read(logical)
    }

    /// Writes a logic level to the specified pin.
    ///
    /// The pin has to be in [`PinMode::Output`]; writing to an input pin
    /// fails with [`Error::WrongMode`].
    pub fn write(&self, pin: u8, value: PinValue) -> Result<()> {
        let logical = self.writable_logical(pin)?;

        self.driver.write(logical, value)
    }

    /// Inverts the current logic level of the specified pin.
    pub fn toggle(&self, pin: u8) -> Result<()> {
        let logical = self.writable_logical(pin)?;

        self.driver.toggle(logical)
    }

    /// Reads the logic levels of several pins.
    ///
    /// The returned values are in the same order as the requested pin
    /// numbers. Every pin has to be open.
    pub fn read_many(&self, pins: &[u8]) -> Result<Vec<PinValue>> {
        pins.iter().map(|&pin| self.read(pin)).collect()
    }

    /// Writes logic levels to several pins.
    ///
    /// Writes are applied in order; the first failure aborts the remainder.
    pub fn write_many(&self, writes: &[(u8, PinValue)]) -> Result<()> {
        for &(pin, value) in writes {
            self.write(pin, value)?;
        }

        Ok(())
    }

    /// Registers a callback for edge events on the specified pin.
    ///
    /// The callback is invoked on the driver's event dispatch thread for
    /// every matching edge, with the logical pin number and the edge that
    /// occurred. Multiple callbacks can be registered per pin; they fire in
    /// registration order. Registering the same closure twice counts as two
    /// registrations. A callback may register or unregister callbacks
    /// itself, including its own registration.
    ///
    /// The returned [`CallbackId`] identifies this registration for
    /// [`GpioController::unregister_callback`].
    pub fn register_callback<C>(
        &self,
        pin: u8,
        events: PinEventTypes,
        callback: C,
    ) -> Result<CallbackId>
    where
        C: FnMut(PinEvent) + Send + 'static,
    {
        if events.is_empty() {
            return Err(Error::InvalidEventTypes);
        }

        let (logical, callbacks) = {
            let pins = self.pins.lock().unwrap();
            let state = pins.get(&pin).ok_or(Error::PinNotOpen(pin))?;

            (state.logical, state.callbacks.clone())
        };

        let id = CallbackId(self.next_callback_id.fetch_add(1, Ordering::Relaxed));

        let was_empty = {
            let mut list = callbacks.lock().unwrap();
            let was_empty = list.is_empty();
            list.push(CallbackEntry {
                id,
                events,
                handler: Arc::new(Mutex::new(Box::new(callback))),
            });

            was_empty
        };

        // The driver gets a single trampoline per pin, subscribed to both
        // edges. Filtering per registration happens here. Matching handlers
        // are snapshotted and invoked with the list lock released, so a
        // handler can register or unregister callbacks on its own pin.
        if was_empty {
            let dispatch_list = callbacks.clone();
            let trampoline: EventCallback = Box::new(move |event: PinEvent| {
                let matching: Vec<_> = dispatch_list
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|entry| entry.events.intersects(event.edge))
                    .map(|entry| entry.handler.clone())
                    .collect();

                for handler in matching {
                    let mut handler = handler.lock().unwrap();
                    (*handler)(event);
                }
            });

            if let Err(e) =
                self.driver
                    .set_async_interrupt(logical, PinEventTypes::all(), trampoline)
            {
                callbacks.lock().unwrap().retain(|entry| entry.id != id);
                return Err(e);
            }
        }

        Ok(id)
    }

    /// Removes a single callback registration from the specified pin.
    ///
    /// Other registrations on the same pin are unaffected. Removing an id
    /// that is no longer registered is a no-op.
    pub fn unregister_callback(&self, pin: u8, id: CallbackId) -> Result<()> {
        let (logical, callbacks) = {
            let pins = self.pins.lock().unwrap();
            let state = pins.get(&pin).ok_or(Error::PinNotOpen(pin))?;

            (state.logical, state.callbacks.clone())
        };

        let now_empty = {
            let mut list = callbacks.lock().unwrap();
            list.retain(|entry| entry.id != id);

            list.is_empty()
        };

        if now_empty {
            self.driver.clear_async_interrupt(logical)?;
        }

        Ok(())
    }

    /// Blocks until an edge event occurs on the specified pin, or until the
    /// timeout elapses.
    ///
    /// `timeout` can be set to `None` to wait indefinitely. A timeout is
    /// reported through [`WaitForEventResult::timed_out`], not as an error.
    pub fn wait_for_event(
        &self,
        pin: u8,
        events: PinEventTypes,
        timeout: Option<Duration>,
    ) -> Result<WaitForEventResult> {
        let cancel = CancelToken::with_timeout(timeout)?;

        self.wait_for_event_cancellable(pin, events, &cancel)
    }

    /// Blocks until an edge event occurs on the specified pin, or until the
    /// token is cancelled or its deadline passes.
    ///
    /// Cancellation is reported through [`WaitForEventResult::timed_out`],
    /// not as an error.
    pub fn wait_for_event_cancellable(
        &self,
        pin: u8,
        events: PinEventTypes,
        cancel: &CancelToken,
    ) -> Result<WaitForEventResult> {
        let logical = self.waitable_logical(pin, events)?;

        self.driver.wait_for_event(logical, events, cancel)
    }

    /// Waits for an edge event without blocking the calling thread.
    ///
    /// The wait itself runs on a background thread; the returned future
    /// completes when an edge occurs, the timeout elapses, or
    /// [`WaitForEventFuture::cancel`] is called. Dropping the future cancels
    /// the underlying wait.
    pub fn wait_for_event_async(
        &self,
        pin: u8,
        events: PinEventTypes,
        timeout: Option<Duration>,
    ) -> Result<WaitForEventFuture> {
        let logical = self.waitable_logical(pin, events)?;
        let cancel = CancelToken::with_timeout(timeout)?;

        WaitForEventFuture::spawn(self.driver.clone(), logical, events, cancel)
    }

    // Translates a pin number from the controller's numbering scheme to the
    // driver's logical numbering. This happens exactly once per operation;
    // everything past this point deals in logical numbers.
    fn to_logical(&self, pin: u8) -> Result<u8> {
        let logical = match self.scheme {
            PinNumberingScheme::Logical => pin,
            PinNumberingScheme::Board => self.driver.board_to_logical(pin)?,
        };

        if let Ok(count) = self.driver.pin_count() {
            if logical >= count {
                return Err(Error::PinNotAvailable(pin));
            }
        }

        Ok(logical)
    }

    // Opens the pin at the driver if it isn't open yet. Returns the logical
    // number and whether this call performed the open.
    fn open_pin_inner(&self, pin: u8) -> Result<(u8, bool)> {
        let logical = self.to_logical(pin)?;

        let mut pins = self.pins.lock().unwrap();
        if let Some(state) = pins.get(&pin) {
            return Ok((state.logical, false));
        }

        self.driver.open(logical)?;

        // The record always caches a mode, so a failing mode query unwinds
        // the driver-level open.
        let mode = match self.driver.mode(logical) {
            Ok(mode) => mode,
            Err(e) => {
                if let Err(close_err) = self.driver.close(logical) {
                    warn!("closing pin {} after failed open: {}", logical, close_err);
                }
                return Err(e);
            }
        };

        pins.insert(
            pin,
            OpenPinState {
                logical,
                mode,
                callbacks: Arc::new(Mutex::new(Vec::new())),
            },
        );

        Ok((logical, true))
    }

    // Unwinds a fresh open after a later setup step failed.
    fn rollback_open(&self, pin: u8, logical: u8) {
        self.pins.lock().unwrap().remove(&pin);
        if let Err(e) = self.driver.close(logical) {
            warn!("closing pin {} after failed open: {}", logical, e);
        }
    }

    fn logical_of_open(&self, pin: u8) -> Result<u8> {
        self.pins
            .lock()
            .unwrap()
            .get(&pin)
            .map(|state| state.logical)
            .ok_or(Error::PinNotOpen(pin))
    }

    // Open-pin lookup for write/toggle, enforcing output mode.
    fn writable_logical(&self, pin: u8) -> Result<u8> {
        let pins = self.pins.lock().unwrap();
        let state = pins.get(&pin).ok_or(Error::PinNotOpen(pin))?;

        if state.mode != PinMode::Output {
            return Err(Error::WrongMode(pin, state.mode));
        }

        Ok(state.logical)
    }

    // Open-pin lookup for event waits. Rejects pins that already dispatch
    // callbacks, so two consumers never race for the same edge stream.
    fn waitable_logical(&self, pin: u8, events: PinEventTypes) -> Result<u8> {
        if events.is_empty() {
            return Err(Error::InvalidEventTypes);
        }

        let pins = self.pins.lock().unwrap();
        let state = pins.get(&pin).ok_or(Error::PinNotOpen(pin))?;

        if !state.callbacks.lock().unwrap().is_empty() {
            return Err(Error::PinBusy(pin));
        }

        Ok(state.logical)
    }

    fn teardown_pin(&self, pin: u8, state: &OpenPinState) {
        let had_callbacks = {
            let mut list = state.callbacks.lock().unwrap();
            let had = !list.is_empty();
            list.clear();

            had
        };

        if had_callbacks {
            if let Err(e) = self.driver.clear_async_interrupt(state.logical) {
                warn!("clearing callbacks for pin {}: {}", pin, e);
            }
        }
    }

    // Driver-forwarding paths used by GpioPin. These take logical numbers
    // and skip the open-pin check: a handle stays valid after its pin was
    // closed at the controller. Mode bookkeeping is still kept in sync when
    // a matching record exists.
    pub(crate) fn read_logical(&self, logical: u8) -> Result<PinValue> {
        self.driver.read(logical)
    }

    pub(crate) fn write_logical(&self, logical: u8, value: PinValue) -> Result<()> {
        self.check_writable_logical(logical)?;

        self.driver.write(logical, value)
    }

    pub(crate) fn toggle_logical(&self, logical: u8) -> Result<()> {
        self.check_writable_logical(logical)?;

        self.driver.toggle(logical)
    }

    pub(crate) fn mode_logical(&self, logical: u8) -> Result<PinMode> {
        let mode = self.driver.mode(logical)?;

        let mut pins = self.pins.lock().unwrap();
        if let Some(state) = pins.values_mut().find(|state| state.logical == logical) {
            state.mode = mode;
        }

        Ok(mode)
    }

    pub(crate) fn set_mode_logical(&self, logical: u8, mode: PinMode) -> Result<()> {
        if !self.driver.is_mode_supported(logical, mode) {
            return Err(Error::ModeNotSupported(logical, mode));
        }

        self.driver.set_mode(logical, mode)?;

        let mut pins = self.pins.lock().unwrap();
        if let Some(state) = pins.values_mut().find(|state| state.logical == logical) {
            state.mode = mode;
        }

        Ok(())
    }

    fn check_writable_logical(&self, logical: u8) -> Result<()> {
        let pins = self.pins.lock().unwrap();
        if let Some(state) = pins.values().find(|state| state.logical == logical) {
            if state.mode != PinMode::Output {
                return Err(Error::WrongMode(logical, state.mode));
            }
        }

        Ok(())
    }
}

impl Drop for GpioController {
    fn drop(&mut self) {
        // Close every pin that is still open. The driver is dropped with the
        // controller once outstanding waits have finished.
        if let Ok(mut pins) = self.pins.lock() {
            for (pin, state) in pins.iter() {
                self.teardown_pin(*pin, state);
                if let Err(e) = self.driver.close(state.logical) {
                    warn!("closing pin {} on drop: {}", state.logical, e);
                }
            }

            pins.clear();
        }
    }
}

struct WaitShared {
    result: Option<Result<WaitForEventResult>>,
    waker: Option<Waker>,
}

/// Future returned by [`GpioController::wait_for_event_async`].
///
/// Resolves to the same result the synchronous wait would have produced.
/// Dropping the future cancels the underlying wait, which releases the
/// background thread promptly.
pub struct WaitForEventFuture {
    shared: Arc<Mutex<WaitShared>>,
    cancel: CancelToken,
}

impl WaitForEventFuture {
    fn spawn(
        driver: Arc<dyn GpioDriver>,
        pin: u8,
        events: PinEventTypes,
        cancel: CancelToken,
    ) -> Result<WaitForEventFuture> {
        let shared = Arc::new(Mutex::new(WaitShared {
            result: None,
            waker: None,
        }));

        let thread_shared = shared.clone();
        let thread_cancel = cancel.clone();
        thread::Builder::new()
            .name("gpio-wait".to_string())
            .spawn(move || {
                let result = driver.wait_for_event(pin, events, &thread_cancel);

                let mut state = thread_shared.lock().unwrap();
                state.result = Some(result);
                if let Some(waker) = state.waker.take() {
                    waker.wake();
                }
            })?;

        Ok(WaitForEventFuture { shared, cancel })
    }

    /// Cancels the underlying wait.
    ///
    /// The future then resolves with `timed_out` set to `true`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Future for WaitForEventFuture {
    type Output = Result<WaitForEventResult>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.lock().unwrap();

        if let Some(result) = state.result.take() {
            Poll::Ready(result)
        } else {
            state.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

impl Drop for WaitForEventFuture {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for WaitForEventFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitForEventFuture")
            .field("cancel", &self.cancel)
            .field("shared", &format_args!("{{ .. }}"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_value_conversions() {
        assert_eq!(PinValue::High, 1);
        assert_eq!(PinValue::Low, 0);
        assert_eq!(0u8, PinValue::Low);
        assert_eq!(PinValue::from(true), PinValue::High);
        assert_eq!(PinValue::from(42u8), PinValue::High);
        assert_eq!(!PinValue::High, PinValue::Low);
        assert_eq!(!PinValue::Low, PinValue::High);
    }

    #[test]
    fn event_types_display() {
        assert_eq!(PinEventTypes::empty().to_string(), "None");
        assert_eq!(PinEventTypes::RISING.to_string(), "Rising");
        assert_eq!(PinEventTypes::FALLING.to_string(), "Falling");
        assert_eq!(PinEventTypes::all().to_string(), "Both");
    }

    #[test]
    fn wait_result_constructors() {
        let timed_out = WaitForEventResult::timed_out();
        assert!(timed_out.timed_out);
        assert!(timed_out.event_types.is_empty());

        let event = WaitForEventResult::event(PinEventTypes::RISING);
        assert!(!event.timed_out);
        assert_eq!(event.event_types, PinEventTypes::RISING);
    }
}
