//! Controller behavior against a call-recording mock driver.

use std::fmt;
use std::sync::{Arc, Mutex};

use sbc_gpio::gpio::{
    CancelToken, Error, EventCallback, GpioDriver, PinEventTypes, PinMode, PinNumberingScheme,
    PinValue, Result, SimulatedDriver, WaitForEventResult,
};

const MOCK_PIN_COUNT: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Call {
    Open(u8),
    Close(u8),
    SetMode(u8, PinMode),
    Read(u8),
    Write(u8, PinValue),
}

#[derive(Debug, Clone, Copy)]
struct MockPin {
    mode: PinMode,
    value: PinValue,
}

/// Mock driver that records every call it receives.
///
/// Board numbers are twice the logical number, so header position 2 maps to
/// logical pin 1. `InputPullDown` is reported as unsupported to exercise the
/// controller's capability check.
struct RecordingDriver {
    calls: Arc<Mutex<Vec<Call>>>,
    pins: Mutex<[MockPin; MOCK_PIN_COUNT as usize]>,
}

impl RecordingDriver {
    fn new() -> (RecordingDriver, Arc<Mutex<Vec<Call>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let driver = RecordingDriver {
            calls: calls.clone(),
            pins: Mutex::new(
                [MockPin {
                    mode: PinMode::Input,
                    value: PinValue::Low,
                }; MOCK_PIN_COUNT as usize],
            ),
        };

        (driver, calls)
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn check_pin(&self, pin: u8) -> Result<()> {
        if pin >= MOCK_PIN_COUNT {
            return Err(Error::PinNotAvailable(pin));
        }

        Ok(())
    }
}

impl fmt::Debug for RecordingDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingDriver").finish()
    }
}

impl GpioDriver for RecordingDriver {
    fn pin_count(&self) -> Result<u8> {
        Ok(MOCK_PIN_COUNT)
    }

    fn board_to_logical(&self, pin: u8) -> Result<u8> {
        if pin % 2 == 0 && pin / 2 < MOCK_PIN_COUNT {
            Ok(pin / 2)
        } else {
            Err(Error::PinNotAvailable(pin))
        }
    }

    fn open(&self, pin: u8) -> Result<()> {
        self.check_pin(pin)?;
        self.record(Call::Open(pin));

        Ok(())
    }

    fn close(&self, pin: u8) -> Result<()> {
        self.check_pin(pin)?;
        self.record(Call::Close(pin));

        Ok(())
    }

    fn mode(&self, pin: u8) -> Result<PinMode> {
        self.check_pin(pin)?;

        Ok(self.pins.lock().unwrap()[pin as usize].mode)
    }

    fn set_mode(&self, pin: u8, mode: PinMode) -> Result<()> {
        self.check_pin(pin)?;
        self.record(Call::SetMode(pin, mode));
        self.pins.lock().unwrap()[pin as usize].mode = mode;

        Ok(())
    }

    fn is_mode_supported(&self, pin: u8, mode: PinMode) -> bool {
        pin < MOCK_PIN_COUNT && mode != PinMode::InputPullDown
    }

    fn read(&self, pin: u8) -> Result<PinValue> {
        self.check_pin(pin)?;
        self.record(Call::Read(pin));

        Ok(self.pins.lock().unwrap()[pin as usize].value)
    }

    fn write(&self, pin: u8, value: PinValue) -> Result<()> {
        self.check_pin(pin)?;
        self.record(Call::Write(pin, value));
        self.pins.lock().unwrap()[pin as usize].value = value;

        Ok(())
    }

    fn set_async_interrupt(
        &self,
        _pin: u8,
        _events: PinEventTypes,
        _callback: EventCallback,
    ) -> Result<()> {
        Err(Error::NotSupported("events on the recording mock"))
    }

    fn clear_async_interrupt(&self, _pin: u8) -> Result<()> {
        Err(Error::NotSupported("events on the recording mock"))
    }

    fn wait_for_event(
        &self,
        _pin: u8,
        _events: PinEventTypes,
        _cancel: &CancelToken,
    ) -> Result<WaitForEventResult> {
        Err(Error::NotSupported("events on the recording mock"))
    }
}

fn logical_controller() -> (sbc_gpio::gpio::GpioController, Arc<Mutex<Vec<Call>>>) {
    let (driver, calls) = RecordingDriver::new();

    (
        sbc_gpio::gpio::GpioController::with_driver(PinNumberingScheme::Logical, driver),
        calls,
    )
}

#[test]
fn open_with_mode_reports_the_mode() {
    let (controller, calls) = logical_controller();

    controller.open_pin_with_mode(4, PinMode::Output).unwrap();
    assert_eq!(controller.pin_mode(4).unwrap(), PinMode::Output);

    let calls = calls.lock().unwrap();
    assert_eq!(calls[0], Call::Open(4));
    assert_eq!(calls[1], Call::SetMode(4, PinMode::Output));
}

#[test]
fn open_with_value_presets_the_level_before_the_mode_switch() {
    let (controller, calls) = logical_controller();

    let pin = controller
        .open_pin_with_value(3, PinMode::Output, PinValue::High)
        .unwrap();
    assert_eq!(pin.read().unwrap(), PinValue::High);
    assert_eq!(controller.pin_mode(3).unwrap(), PinMode::Output);

    // The level is latched before the pin switches to output, so it never
    // drives the stale default.
    let calls = calls.lock().unwrap();
    assert_eq!(
        calls[..3],
        [
            Call::Open(3),
            Call::Write(3, PinValue::High),
            Call::SetMode(3, PinMode::Output),
        ]
    );
}

#[test]
fn open_with_value_unwinds_on_an_unsupported_mode() {
    let (controller, calls) = logical_controller();

    assert!(matches!(
        controller.open_pin_with_value(1, PinMode::InputPullDown, PinValue::Low),
        Err(Error::ModeNotSupported(1, PinMode::InputPullDown))
    ));

    assert!(!controller.is_pin_open(1));
    assert_eq!(*calls.lock().unwrap(), vec![Call::Open(1), Call::Close(1)]);
}

#[test]
fn every_supported_mode_round_trips() {
    let driver = SimulatedDriver::new();
    let controller =
        sbc_gpio::gpio::GpioController::with_driver(PinNumberingScheme::Logical, driver);

    for mode in [
        PinMode::Input,
        PinMode::Output,
        PinMode::InputPullUp,
        PinMode::InputPullDown,
    ] {
        controller.open_pin_with_mode(3, mode).unwrap();
        assert_eq!(controller.pin_mode(3).unwrap(), mode);
    }
}

#[test]
fn open_is_idempotent() {
    let (controller, calls) = logical_controller();

    let first = controller.open_pin(4).unwrap();
    let second = controller.open_pin(4).unwrap();
    assert_eq!(first, second);

    let opens = calls
        .lock()
        .unwrap()
        .iter()
        .filter(|call| matches!(call, Call::Open(_)))
        .count();
    assert_eq!(opens, 1);
}

#[test]
fn close_requires_an_open_pin() {
    let (controller, _) = logical_controller();

    assert!(matches!(controller.close_pin(3), Err(Error::PinNotOpen(3))));

    controller.open_pin(3).unwrap();
    controller.close_pin(3).unwrap();
    assert!(matches!(controller.close_pin(3), Err(Error::PinNotOpen(3))));
}

#[test]
fn operations_require_an_open_pin() {
    let (controller, _) = logical_controller();

    assert!(matches!(controller.read(5), Err(Error::PinNotOpen(5))));
    assert!(matches!(
        controller.write(5, PinValue::High),
        Err(Error::PinNotOpen(5))
    ));
    assert!(matches!(
        controller.set_pin_mode(5, PinMode::Output),
        Err(Error::PinNotOpen(5))
    ));
}

#[test]
fn write_to_input_pin_is_rejected() {
    let (controller, calls) = logical_controller();

    controller.open_pin_with_mode(2, PinMode::Input).unwrap();
    assert!(matches!(
        controller.write(2, PinValue::High),
        Err(Error::WrongMode(2, PinMode::Input))
    ));
    assert!(matches!(controller.toggle(2), Err(Error::WrongMode(..))));

    // The rejection happens at the controller; the driver never sees a write.
    assert!(!calls
        .lock()
        .unwrap()
        .iter()
        .any(|call| matches!(call, Call::Write(..))));
}

#[test]
fn read_on_output_pin_returns_the_driven_level() {
    let driver = SimulatedDriver::new();
    let controller =
        sbc_gpio::gpio::GpioController::with_driver(PinNumberingScheme::Logical, driver);

    controller.open_pin_with_mode(6, PinMode::Output).unwrap();
    controller.write(6, PinValue::High).unwrap();
    assert_eq!(controller.read(6).unwrap(), PinValue::High);

    controller.toggle(6).unwrap();
    assert_eq!(controller.read(6).unwrap(), PinValue::Low);
}

#[test]
fn board_numbering_translates_once_at_the_boundary() {
    let (driver, calls) = RecordingDriver::new();
    let controller = sbc_gpio::gpio::GpioController::with_driver(PinNumberingScheme::Board, driver);

    // Header position 2 maps to logical pin 1.
    let pin = controller.open_pin_with_mode(2, PinMode::Output).unwrap();
    assert_eq!(pin.pin(), 1);

    controller.write(2, PinValue::High).unwrap();
    assert_eq!(controller.read(2).unwrap(), PinValue::High);
    controller.close_pin(2).unwrap();

    assert_eq!(
        *calls.lock().unwrap(),
        vec![
            Call::Open(1),
            Call::SetMode(1, PinMode::Output),
            Call::Write(1, PinValue::High),
            Call::Read(1),
            Call::Close(1),
        ]
    );
}

#[test]
fn board_and_logical_schemes_reach_the_same_pin() {
    let driver = SimulatedDriver::new();
    let stimulus = driver.clone();
    let controller = sbc_gpio::gpio::GpioController::with_driver(PinNumberingScheme::Board, driver);

    // Header position 3 is GPIO 2 on the 40-pin layout.
    let pin = controller.open_pin_with_mode(3, PinMode::Output).unwrap();
    assert_eq!(pin.pin(), 2);

    controller.write(3, PinValue::High).unwrap();
    assert_eq!(stimulus.read(2).unwrap(), PinValue::High);
}

#[test]
fn out_of_range_pin_is_rejected() {
    let (controller, _) = logical_controller();

    assert!(matches!(
        controller.open_pin(MOCK_PIN_COUNT),
        Err(Error::PinNotAvailable(_))
    ));
}

#[test]
fn unsupported_mode_fails_and_unwinds_the_open() {
    let (controller, calls) = logical_controller();

    assert!(matches!(
        controller.open_pin_with_mode(1, PinMode::InputPullDown),
        Err(Error::ModeNotSupported(1, PinMode::InputPullDown))
    ));

    // The failed setup closed the pin again; nothing is left open.
    assert!(!controller.is_pin_open(1));
    assert_eq!(
        *calls.lock().unwrap(),
        vec![Call::Open(1), Call::Close(1)]
    );
}

#[test]
fn capability_probe_matches_the_driver() {
    let (controller, _) = logical_controller();

    assert!(controller.is_pin_mode_supported(1, PinMode::Output).unwrap());
    assert!(!controller
        .is_pin_mode_supported(1, PinMode::InputPullDown)
        .unwrap());
}

#[test]
fn batch_reads_preserve_request_order() {
    let driver = SimulatedDriver::new();
    let controller =
        sbc_gpio::gpio::GpioController::with_driver(PinNumberingScheme::Logical, driver);

    for pin in [2, 3, 4] {
        controller.open_pin_with_mode(pin, PinMode::Output).unwrap();
    }

    controller
        .write_many(&[(2, PinValue::High), (3, PinValue::Low), (4, PinValue::High)])
        .unwrap();

    assert_eq!(
        controller.read_many(&[4, 2, 3]).unwrap(),
        vec![PinValue::High, PinValue::High, PinValue::Low]
    );
}

#[test]
fn batch_write_fails_on_the_first_unopened_pin() {
    let driver = SimulatedDriver::new();
    let controller =
        sbc_gpio::gpio::GpioController::with_driver(PinNumberingScheme::Logical, driver);

    controller.open_pin_with_mode(2, PinMode::Output).unwrap();

    assert!(matches!(
        controller.write_many(&[(2, PinValue::High), (9, PinValue::High)]),
        Err(Error::PinNotOpen(9))
    ));
}

#[test]
fn pin_handle_stays_usable_after_close() {
    let driver = SimulatedDriver::new();
    let controller =
        sbc_gpio::gpio::GpioController::with_driver(PinNumberingScheme::Logical, driver);

    let pin = controller.open_pin_with_mode(5, PinMode::Output).unwrap();
    controller.close_pin(5).unwrap();

    // The handle holds no open state of its own and keeps forwarding to the
    // driver.
    assert!(pin.read().is_ok());
}

#[test]
fn drop_closes_every_open_pin() {
    let (driver, calls) = RecordingDriver::new();

    {
        let controller =
            sbc_gpio::gpio::GpioController::with_driver(PinNumberingScheme::Logical, driver);
        controller.open_pin(1).unwrap();
        controller.open_pin(2).unwrap();
    }

    let closes: Vec<_> = calls
        .lock()
        .unwrap()
        .iter()
        .filter(|call| matches!(call, Call::Close(_)))
        .copied()
        .collect();
    assert_eq!(closes, vec![Call::Close(1), Call::Close(2)]);
}
