use std::ptr;

use super::{GpioController, PinMode, PinValue, Result};

/// Handle to an open GPIO pin.
///
/// `GpioPin`s are constructed by opening a pin through one of the
/// [`GpioController::open_pin`] methods. The handle stores the pin's logical
/// GPIO number and forwards every operation to the controller's driver using
/// that number.
///
/// The handle itself carries no open/closed state. If the pin is closed at
/// the controller while a handle is still around, the handle stays usable
/// and its operations keep going straight to the driver.
///
/// [`GpioController::open_pin`]: super::GpioController::open_pin
#[derive(Debug)]
pub struct GpioPin<'a> {
    pin: u8,
    controller: &'a GpioController,
}

impl<'a> GpioPin<'a> {
    #[inline]
    pub(crate) fn new(pin: u8, controller: &'a GpioController) -> GpioPin<'a> {
        GpioPin { pin, controller }
    }

    /// Returns the pin's logical GPIO number.
    ///
    /// This is the number after scheme translation, regardless of the
    /// numbering scheme the pin was opened with.
    #[inline]
    pub fn pin(&self) -> u8 {
        self.pin
    }

    /// Returns the pin's mode.
    #[inline]
    pub fn mode(&self) -> Result<PinMode> {
        self.controller.mode_logical(self.pin)
    }

    /// Sets the pin's mode.
    #[inline]
    pub fn set_mode(&mut self, mode: PinMode) -> Result<()> {
        self.controller.set_mode_logical(self.pin, mode)
    }

    /// Reads the pin's logic level.
    #[inline]
    pub fn read(&self) -> Result<PinValue> {
        self.controller.read_logical(self.pin)
    }

    /// Reads the pin's logic level, and returns `true` if it's set to
    /// [`PinValue::Low`].
    #[inline]
    pub fn is_low(&self) -> Result<bool> {
        Ok(self.read()? == PinValue::Low)
    }

    /// Reads the pin's logic level, and returns `true` if it's set to
    /// [`PinValue::High`].
    #[inline]
    pub fn is_high(&self) -> Result<bool> {
        Ok(self.read()? == PinValue::High)
    }

    /// Sets the pin's output state.
    #[inline]
    pub fn write(&mut self, value: PinValue) -> Result<()> {
        self.controller.write_logical(self.pin, value)
    }

    /// Sets the pin's output state to [`PinValue::Low`].
    #[inline]
    pub fn set_low(&mut self) -> Result<()> {
        self.write(PinValue::Low)
    }

    /// Sets the pin's output state to [`PinValue::High`].
    #[inline]
    pub fn set_high(&mut self) -> Result<()> {
        self.write(PinValue::High)
    }

    /// Toggles the pin's output state between [`PinValue::Low`] and
    /// [`PinValue::High`].
    #[inline]
    pub fn toggle(&mut self) -> Result<()> {
        self.controller.toggle_logical(self.pin)
    }
}

// Handles are equal when they refer to the same pin on the same controller.
impl PartialEq for GpioPin<'_> {
    fn eq(&self, other: &GpioPin<'_>) -> bool {
        self.pin == other.pin && ptr::eq(self.controller, other.controller)
    }
}

impl PartialEq<&GpioPin<'_>> for GpioPin<'_> {
    fn eq(&self, other: &&GpioPin<'_>) -> bool {
        self.pin == other.pin && ptr::eq(self.controller, other.controller)
    }
}

impl PartialEq<GpioPin<'_>> for &GpioPin<'_> {
    fn eq(&self, other: &GpioPin<'_>) -> bool {
        self.pin == other.pin && ptr::eq(self.controller, other.controller)
    }
}

impl Eq for GpioPin<'_> {}
