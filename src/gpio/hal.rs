use embedded_hal::digital::{
    Error as ErrorHal, ErrorKind, ErrorType, InputPin as InputPinHal, OutputPin as OutputPinHal,
    StatefulOutputPin as StatefulOutputPinHal,
};

use super::{Error, GpioPin, PinValue};

/// `Error` trait implementation for `embedded-hal` v1.0.
impl ErrorHal for Error {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Other
    }
}

/// `ErrorType` trait implementation for `embedded-hal` v1.0.
impl ErrorType for GpioPin<'_> {
    type Error = Error;
}

/// `InputPin` trait implementation for `embedded-hal` v1.0.
impl InputPinHal for GpioPin<'_> {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        GpioPin::is_high(self)
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        GpioPin::is_low(self)
    }
}

/// `OutputPin` trait implementation for `embedded-hal` v1.0.
impl OutputPinHal for GpioPin<'_> {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        GpioPin::set_low(self)
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        GpioPin::set_high(self)
    }
}

/// `StatefulOutputPin` trait implementation for `embedded-hal` v1.0.
impl StatefulOutputPinHal for GpioPin<'_> {
    fn is_set_high(&mut self) -> Result<bool, Self::Error> {
        Ok(GpioPin::read(self)? == PinValue::High)
    }

    fn is_set_low(&mut self) -> Result<bool, Self::Error> {
        Ok(GpioPin::read(self)? == PinValue::Low)
    }

    fn toggle(&mut self) -> Result<(), Self::Error> {
        GpioPin::toggle(self)
    }
}
