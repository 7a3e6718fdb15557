use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::Mutex;

use tracing::{debug, warn};

use super::driver::{CancelToken, EventCallback, GpioDriver};
use super::epoll::EPOLLIN;
use super::interrupt::{self, AsyncInterrupt, EventSource};
use super::{Error, PinEvent, PinEventTypes, PinMode, PinValue, Result, WaitForEventResult};

mod ioctl;

use self::ioctl::{
    ChipInfo, LineConfig, LineRequest, LINE_EVENT_FALLING_EDGE, LINE_EVENT_RISING_EDGE,
    LINE_FLAG_BIAS_PULL_DOWN, LINE_FLAG_BIAS_PULL_UP, LINE_FLAG_EDGE_FALLING,
    LINE_FLAG_EDGE_RISING, LINE_FLAG_INPUT, LINE_FLAG_OUTPUT,
};

const PATH_GPIOCHIP: &str = "/dev/gpiochip";

// Highest gpiochip index scanned during chip selection.
const MAX_CHIP_INDEX: u8 = 7;

fn edge_flags(events: PinEventTypes) -> u64 {
    let mut flags = 0;
    if events.contains(PinEventTypes::RISING) {
        flags |= LINE_FLAG_EDGE_RISING;
    }
    if events.contains(PinEventTypes::FALLING) {
        flags |= LINE_FLAG_EDGE_FALLING;
    }

    flags
}

fn mode_flags(mode: PinMode) -> u64 {
    match mode {
        PinMode::Input => LINE_FLAG_INPUT,
        PinMode::Output => LINE_FLAG_OUTPUT,
        PinMode::InputPullUp => LINE_FLAG_INPUT | LINE_FLAG_BIAS_PULL_UP,
        PinMode::InputPullDown => LINE_FLAG_INPUT | LINE_FLAG_BIAS_PULL_DOWN,
    }
}

struct LineState {
    request: LineRequest,
    // Direction/bias flags currently configured through the request. Zero
    // means the line was requested as-is and hasn't been reconfigured.
    mode_flags: u64,
    edge_flags: u64,
    interrupt: Option<AsyncInterrupt>,
    waiting: bool,
}

struct CdevEventSource {
    fd: RawFd,
    pin: u8,
}

impl EventSource for CdevEventSource {
    fn raw_fd(&self) -> RawFd {
        self.fd
    }

    fn poll_flags(&self) -> i32 {
        EPOLLIN
    }

    fn read_event(&mut self) -> Result<Vec<PinEvent>> {
        let event = match ioctl::read_line_event(self.fd)? {
            Some(event) => event,
            None => return Ok(Vec::new()),
        };

        let edge = match event.id {
            LINE_EVENT_RISING_EDGE => PinEventTypes::RISING,
            LINE_EVENT_FALLING_EDGE => PinEventTypes::FALLING,
            _ => return Ok(Vec::new()),
        };

        Ok(vec![PinEvent {
            pin: self.pin,
            edge,
        }])
    }
}

/// GPIO driver for the `/dev/gpiochipN` character device interface.
///
/// Works on any Linux board with a GPIO controller bound to the gpiolib
/// subsystem. Logical pin numbers are the chip's line offsets. Pins are
/// requested as-is, so opening a pin doesn't disturb its configured
/// direction until a mode is set.
pub struct CdevDriver {
    chip: File,
    label: String,
    lines: u32,
    pins: Mutex<HashMap<u8, LineState>>,
}

impl CdevDriver {
    /// Constructs a new `CdevDriver`, selecting the gpiochip wired to the
    /// board's pin controller.
    ///
    /// Chips are scanned in index order; the first whose label identifies a
    /// pin controller wins. Boards that enumerate expander chips before the
    /// SoC's own controller still get the right one. If no label matches,
    /// the first usable chip is selected.
    pub fn new() -> Result<CdevDriver> {
        let mut first: Option<CdevDriver> = None;
        let mut last_error = None;

        for index in 0..=MAX_CHIP_INDEX {
            if !Path::new(&format!("{}{}", PATH_GPIOCHIP, index)).exists() {
                continue;
            }

            match CdevDriver::with_chip(index) {
                Ok(driver) => {
                    if driver.label.contains("pinctrl") {
                        return Ok(driver);
                    }

                    if first.is_none() {
                        first = Some(driver);
                    }
                }
                Err(e) => last_error = Some(e),
            }
        }

        match (first, last_error) {
            (Some(driver), _) => Ok(driver),
            (None, Some(e)) => Err(e),
            (None, None) => Err(Error::UnknownModel),
        }
    }

    /// Constructs a new `CdevDriver` for the specified gpiochip index.
    pub fn with_chip(chip: u8) -> Result<CdevDriver> {
        let path = format!("{}{}", PATH_GPIOCHIP, chip);

        let chip_file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(ref e) if e.kind() == io::ErrorKind::PermissionDenied => {
                return Err(Error::PermissionDenied(path));
            }
            Err(e) => return Err(Error::from(e)),
        };

        let chip_info = ChipInfo::new(chip_file.as_raw_fd())?;
        let label = chip_info.label();
        debug!("opened {} ({}) with {} lines", path, label, chip_info.lines);

        Ok(CdevDriver {
            chip: chip_file,
            label,
            lines: chip_info.lines,
            pins: Mutex::new(HashMap::new()),
        })
    }

    fn check_pin(&self, pin: u8) -> Result<()> {
        if u32::from(pin) >= self.lines {
            return Err(Error::PinNotAvailable(pin));
        }

        Ok(())
    }

    // Direction/bias flags the line currently carries, queried through the
    // chip so it works for unrequested lines too.
    fn live_flags(&self, pin: u8) -> Result<u64> {
        let info = ioctl::LineInfo::new(self.chip.as_raw_fd(), u32::from(pin))?;

        Ok(info.flags)
    }

    fn input_flags(&self, state: &LineState, pin: u8) -> Result<u64> {
        let flags = if state.mode_flags != 0 {
            state.mode_flags
        } else {
            self.live_flags(pin)?
        };

        Ok(LINE_FLAG_INPUT | (flags & (LINE_FLAG_BIAS_PULL_UP | LINE_FLAG_BIAS_PULL_DOWN)))
    }
}

impl fmt::Debug for CdevDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CdevDriver")
            .field("chip", &self.chip)
            .field("label", &self.label)
            .field("lines", &self.lines)
            .field("pins", &format_args!("{{ .. }}"))
            .finish()
    }
}

impl GpioDriver for CdevDriver {
    fn pin_count(&self) -> Result<u8> {
        Ok(self.lines.min(u32::from(u8::MAX)) as u8)
    }

    fn open(&self, pin: u8) -> Result<()> {
        self.check_pin(pin)?;

        let mut pins = self.pins.lock().unwrap();
        if pins.contains_key(&pin) {
            return Ok(());
        }

        let request = LineRequest::new(self.chip.as_raw_fd(), u32::from(pin), 0)?;
        pins.insert(
            pin,
            LineState {
                request,
                mode_flags: 0,
                edge_flags: 0,
                interrupt: None,
                waiting: false,
            },
        );

        Ok(())
    }

    fn close(&self, pin: u8) -> Result<()> {
        let mut state = self
            .pins
            .lock()
            .unwrap()
            .remove(&pin)
            .ok_or(Error::PinNotOpen(pin))?;

        // Releasing the request closes its fd and returns the line.
        if let Some(mut interrupt) = state.interrupt.take() {
            interrupt.stop()?;
        }

        Ok(())
    }

    fn mode(&self, pin: u8) -> Result<PinMode> {
        self.check_pin(pin)?;

        let flags = self.live_flags(pin)?;

        if flags & LINE_FLAG_OUTPUT > 0 {
            Ok(PinMode::Output)
        } else if flags & LINE_FLAG_BIAS_PULL_UP > 0 {
            Ok(PinMode::InputPullUp)
        } else if flags & LINE_FLAG_BIAS_PULL_DOWN > 0 {
            Ok(PinMode::InputPullDown)
        } else {
            Ok(PinMode::Input)
        }
    }

    fn set_mode(&self, pin: u8, mode: PinMode) -> Result<()> {
        let mut pins = self.pins.lock().unwrap();
        let state = pins.get_mut(&pin).ok_or(Error::PinNotOpen(pin))?;

        let flags = mode_flags(mode) | state.edge_flags;
        state.request.set_config(&mut LineConfig::new(flags))?;
        state.mode_flags = mode_flags(mode);

        Ok(())
    }

    fn set_mode_with_value(&self, pin: u8, mode: PinMode, value: PinValue) -> Result<()> {
        if mode != PinMode::Output {
            return self.set_mode(pin, mode);
        }

        let mut pins = self.pins.lock().unwrap();
        let state = pins.get_mut(&pin).ok_or(Error::PinNotOpen(pin))?;

        // Direction and level change in a single ioctl, so the pin never
        // drives a stale value.
        let mut config = LineConfig::new(LINE_FLAG_OUTPUT | state.edge_flags)
            .with_output_value(value == PinValue::High);
        state.request.set_config(&mut config)?;
        state.mode_flags = LINE_FLAG_OUTPUT;

        Ok(())
    }

    fn is_mode_supported(&self, pin: u8, _mode: PinMode) -> bool {
        u32::from(pin) < self.lines
    }

    fn read(&self, pin: u8) -> Result<PinValue> {
        let pins = self.pins.lock().unwrap();
        let state = pins.get(&pin).ok_or(Error::PinNotOpen(pin))?;

        let levels = state.request.levels()?;

        Ok(PinValue::from((levels.bits & 0x01) as u8))
    }

    fn write(&self, pin: u8, value: PinValue) -> Result<()> {
        let pins = self.pins.lock().unwrap();
        let state = pins.get(&pin).ok_or(Error::PinNotOpen(pin))?;

        state.request.set_levels(value as u64, 0x01)
    }

    fn set_async_interrupt(
        &self,
        pin: u8,
        events: PinEventTypes,
        callback: EventCallback,
    ) -> Result<()> {
        let mut pins = self.pins.lock().unwrap();
        let state = pins.get_mut(&pin).ok_or(Error::PinNotOpen(pin))?;

        if state.interrupt.is_some() || state.waiting {
            return Err(Error::PinBusy(pin));
        }

        // Edge detection requires an input configuration; bias is preserved.
        let flags = self.input_flags(state, pin)? | edge_flags(events);
        state.request.set_config(&mut LineConfig::new(flags))?;
        state.mode_flags = flags & !(LINE_FLAG_EDGE_RISING | LINE_FLAG_EDGE_FALLING);
        state.edge_flags = edge_flags(events);

        // Discard events that queued up before the subscription.
        while ioctl::read_line_event(state.request.fd)?.is_some() {}

        let source = CdevEventSource {
            fd: state.request.fd,
            pin,
        };

        match AsyncInterrupt::spawn(source, callback) {
            Ok(interrupt) => {
                state.interrupt = Some(interrupt);
                Ok(())
            }
            Err(e) => {
                state.edge_flags = 0;
                if let Ok(restore) = self.input_flags(state, pin) {
                    state.request.set_config(&mut LineConfig::new(restore)).ok();
                }
                Err(e)
            }
        }
    }

    fn clear_async_interrupt(&self, pin: u8) -> Result<()> {
        // Take the dispatcher out under the lock, but stop it with the lock
        // released. Stopping joins the dispatch thread, and a handler on
        // that thread may be in the middle of a driver call.
        let interrupt = {
            let mut pins = self.pins.lock().unwrap();
            let state = pins.get_mut(&pin).ok_or(Error::PinNotOpen(pin))?;

            state.interrupt.take()
        };

        if let Some(mut interrupt) = interrupt {
            interrupt.stop()?;
        }

        let mut pins = self.pins.lock().unwrap();
        if let Some(state) = pins.get_mut(&pin) {
            if state.edge_flags != 0 {
                state.edge_flags = 0;
                let flags = self.input_flags(state, pin)?;
                state.request.set_config(&mut LineConfig::new(flags))?;
            }
        }

        Ok(())
    }

    fn wait_for_event(
        &self,
        pin: u8,
        events: PinEventTypes,
        cancel: &CancelToken,
    ) -> Result<WaitForEventResult> {
        // Configure edge detection and drain stale events while holding the
        // lock, then release it for the blocking wait.
        let fd = {
            let mut pins = self.pins.lock().unwrap();
            let state = pins.get_mut(&pin).ok_or(Error::PinNotOpen(pin))?;

            if state.interrupt.is_some() || state.waiting {
                return Err(Error::PinBusy(pin));
            }

            let flags = self.input_flags(state, pin)? | edge_flags(events);
            state.request.set_config(&mut LineConfig::new(flags))?;
            state.mode_flags = flags & !(LINE_FLAG_EDGE_RISING | LINE_FLAG_EDGE_FALLING);

            while ioctl::read_line_event(state.request.fd)?.is_some() {}

            state.waiting = true;
            state.request.fd
        };

        let mut source = CdevEventSource { fd, pin };
        let result = interrupt::wait_edge(&mut source, cancel);

        let mut pins = self.pins.lock().unwrap();
        if let Some(state) = pins.get_mut(&pin) {
            state.waiting = false;

            // Remove edge detection so events don't accumulate between waits.
            let restore = match self.input_flags(state, pin) {
                Ok(flags) => state.request.set_config(&mut LineConfig::new(flags)),
                Err(e) => Err(e),
            };
            if let Err(e) = restore {
                warn!("restoring line config for pin {}: {}", pin, e);
            }
        }

        result
    }
}
