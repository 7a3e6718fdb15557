use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use super::driver::{CancelToken, EventCallback, GpioDriver};
use super::rpi;
use super::{Error, PinEvent, PinEventTypes, PinMode, PinValue, Result, WaitForEventResult};

// Upper bound on a single condvar wait, so blocking waits notice
// cancellation promptly.
const WAIT_SLICE: Duration = Duration::from_millis(10);

const DEFAULT_PIN_COUNT: u8 = 28;

struct PinCell {
    mode: PinMode,
    value: PinValue,
}

struct SimPin {
    state: Mutex<PinCell>,
    // Callback slot. Dispatch clones the handler out and invokes it with
    // the slot lock released, so a handler can call back into the driver.
    callback: Mutex<Option<(PinEventTypes, Arc<Mutex<EventCallback>>)>>,
}

impl SimPin {
    fn new() -> SimPin {
        SimPin {
            state: Mutex::new(PinCell {
                mode: PinMode::Input,
                value: PinValue::Low,
            }),
            callback: Mutex::new(None),
        }
    }
}

/// GPIO driver backed by an in-memory pin bank instead of hardware.
///
/// Useful for running GPIO code on a development machine and for tests.
/// Pins behave like ideal hardware: writes are readable back immediately,
/// every mode is supported, and [`drive`] injects external level changes the
/// same way a real input pin would see them. Edge callbacks are invoked
/// inline on the thread that changed the level.
///
/// Physical header positions translate using the Raspberry Pi 40-pin layout,
/// matching the default pin count of 28.
///
/// Cloning returns a second handle to the same pin bank. A test can hand one
/// clone to a [`GpioController`] and keep the other around to drive input
/// levels.
///
/// [`drive`]: SimulatedDriver::drive
/// [`GpioController`]: super::GpioController
#[derive(Clone)]
pub struct SimulatedDriver {
    inner: Arc<SimInner>,
}

struct SimInner {
    pin_count: u8,
    pins: Vec<SimPin>,
    // Bumped on every level change; blocking waits sleep on the condvar
    // instead of spinning.
    generation: Mutex<u64>,
    changed: Condvar,
}

impl SimulatedDriver {
    /// Constructs a new `SimulatedDriver` with the default pin count of 28.
    pub fn new() -> SimulatedDriver {
        SimulatedDriver::with_pin_count(DEFAULT_PIN_COUNT)
    }

    /// Constructs a new `SimulatedDriver` with the specified pin count.
    pub fn with_pin_count(pin_count: u8) -> SimulatedDriver {
        SimulatedDriver {
            inner: Arc::new(SimInner {
                pin_count,
                pins: (0..pin_count).map(|_| SimPin::new()).collect(),
                generation: Mutex::new(0),
                changed: Condvar::new(),
            }),
        }
    }

    /// Changes the level of the specified pin as if it came from an external
    /// signal, invoking any matching edge callback.
    pub fn drive(&self, pin: u8, value: PinValue) -> Result<()> {
        self.set_value(pin, value)
    }

    fn cell(&self, pin: u8) -> Result<&SimPin> {
        self.inner
            .pins
            .get(pin as usize)
            .ok_or(Error::PinNotAvailable(pin))
    }

    fn value_of(&self, pin: u8) -> Result<PinValue> {
        Ok(self.cell(pin)?.state.lock().unwrap().value)
    }

    fn set_value(&self, pin: u8, value: PinValue) -> Result<()> {
        let cell = self.cell(pin)?;

        let edge = {
            let mut state = cell.state.lock().unwrap();
            let previous = state.value;
            state.value = value;

            match (previous, value) {
                (PinValue::Low, PinValue::High) => Some(PinEventTypes::RISING),
                (PinValue::High, PinValue::Low) => Some(PinEventTypes::FALLING),
                _ => None,
            }
        };

        // Dispatch with the state and slot locks released, so the handler
        // can read or write pins and change its own registration.
        if let Some(edge) = edge {
            let handler = {
                let slot = cell.callback.lock().unwrap();
                match &*slot {
                    Some((events, handler)) if events.intersects(edge) => Some(handler.clone()),
                    _ => None,
                }
            };

            if let Some(handler) = handler {
                (*handler.lock().unwrap())(PinEvent { pin, edge });
            }

            let mut generation = self.inner.generation.lock().unwrap();
            *generation = generation.wrapping_add(1);
            self.inner.changed.notify_all();
        }

        Ok(())
    }
}

impl Default for SimulatedDriver {
    fn default() -> SimulatedDriver {
        SimulatedDriver::new()
    }
}

impl fmt::Debug for SimulatedDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedDriver")
            .field("pin_count", &self.inner.pin_count)
            .field("pins", &format_args!("{{ .. }}"))
            .finish()
    }
}

impl GpioDriver for SimulatedDriver {
    fn pin_count(&self) -> Result<u8> {
        Ok(self.inner.pin_count)
    }

    fn board_to_logical(&self, pin: u8) -> Result<u8> {
        rpi::header_to_logical(pin).ok_or(Error::PinNotAvailable(pin))
    }

    fn open(&self, pin: u8) -> Result<()> {
        self.cell(pin).map(|_| ())
    }

    fn close(&self, pin: u8) -> Result<()> {
        self.cell(pin)?.callback.lock().unwrap().take();

        Ok(())
    }

    fn mode(&self, pin: u8) -> Result<PinMode> {
        Ok(self.cell(pin)?.state.lock().unwrap().mode)
    }

    fn set_mode(&self, pin: u8, mode: PinMode) -> Result<()> {
        self.cell(pin)?.state.lock().unwrap().mode = mode;

        Ok(())
    }

    fn is_mode_supported(&self, pin: u8, _mode: PinMode) -> bool {
        pin < self.inner.pin_count
    }

    fn read(&self, pin: u8) -> Result<PinValue> {
        self.value_of(pin)
    }

    fn write(&self, pin: u8, value: PinValue) -> Result<()> {
        self.set_value(pin, value)
    }

    fn set_async_interrupt(
        &self,
        pin: u8,
        events: PinEventTypes,
        callback: EventCallback,
    ) -> Result<()> {
        let mut slot = self.cell(pin)?.callback.lock().unwrap();
        if slot.is_some() {
            return Err(Error::PinBusy(pin));
        }

        *slot = Some((events, Arc::new(Mutex::new(callback))));

        Ok(())
    }

    fn clear_async_interrupt(&self, pin: u8) -> Result<()> {
        self.cell(pin)?.callback.lock().unwrap().take();

        Ok(())
    }

    fn wait_for_event(
        &self,
        pin: u8,
        events: PinEventTypes,
        cancel: &CancelToken,
    ) -> Result<WaitForEventResult> {
        if self.cell(pin)?.callback.lock().unwrap().is_some() {
            return Err(Error::PinBusy(pin));
        }

        let mut last = self.value_of(pin)?;
        let mut generation = self.inner.generation.lock().unwrap();

        loop {
            if cancel.expired() {
                return Ok(WaitForEventResult::timed_out());
            }

            let value = self.value_of(pin)?;
            if value != last {
                let edge = if value == PinValue::High {
                    PinEventTypes::RISING
                } else {
                    PinEventTypes::FALLING
                };

                if events.intersects(edge) {
                    return Ok(WaitForEventResult::event(edge));
                }

                last = value;
            }

            // A bounded wait keeps cancellation responsive even when no
            // level changes arrive.
            let slice = cancel.remaining().map_or(WAIT_SLICE, |r| r.min(WAIT_SLICE));
            generation = self
                .inner
                .changed
                .wait_timeout(generation, slice)
                .unwrap()
                .0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn write_read_roundtrip() {
        let driver = SimulatedDriver::new();
        driver.open(4).unwrap();
        driver.write(4, PinValue::High).unwrap();
        assert_eq!(driver.read(4).unwrap(), PinValue::High);
        driver.write(4, PinValue::Low).unwrap();
        assert_eq!(driver.read(4).unwrap(), PinValue::Low);
    }

    #[test]
    fn out_of_range_pin() {
        let driver = SimulatedDriver::with_pin_count(4);
        assert!(matches!(driver.read(4), Err(Error::PinNotAvailable(4))));
    }

    #[test]
    fn callback_fires_on_matching_edge() {
        let driver = SimulatedDriver::new();
        driver.open(7).unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let cb_counter = counter.clone();
        driver
            .set_async_interrupt(
                7,
                PinEventTypes::RISING,
                Box::new(move |event| {
                    assert_eq!(event.pin, 7);
                    assert_eq!(event.edge, PinEventTypes::RISING);
                    cb_counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        driver.drive(7, PinValue::High).unwrap();
        driver.drive(7, PinValue::Low).unwrap();
        driver.drive(7, PinValue::High).unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn handler_can_clear_its_own_slot() {
        let driver = SimulatedDriver::new();
        driver.open(5).unwrap();

        let handler_driver = driver.clone();
        driver
            .set_async_interrupt(
                5,
                PinEventTypes::RISING,
                Box::new(move |event| {
                    handler_driver.clear_async_interrupt(event.pin).unwrap();
                }),
            )
            .unwrap();

        driver.drive(5, PinValue::High).unwrap();

        // The handler removed itself, so the slot accepts a new callback.
        driver
            .set_async_interrupt(5, PinEventTypes::RISING, Box::new(|_| {}))
            .unwrap();
    }

    #[test]
    fn clones_share_the_pin_bank() {
        let driver = SimulatedDriver::new();
        let clone = driver.clone();

        driver.open(3).unwrap();
        clone.write(3, PinValue::High).unwrap();
        assert_eq!(driver.read(3).unwrap(), PinValue::High);
    }

    #[test]
    fn callback_slot_is_exclusive() {
        let driver = SimulatedDriver::new();
        driver.open(2).unwrap();
        driver
            .set_async_interrupt(2, PinEventTypes::all(), Box::new(|_| {}))
            .unwrap();

        assert!(matches!(
            driver.set_async_interrupt(2, PinEventTypes::all(), Box::new(|_| {})),
            Err(Error::PinBusy(2))
        ));
    }
}
