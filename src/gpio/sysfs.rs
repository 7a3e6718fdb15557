use std::collections::HashMap;
use std::ffi::CString;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::linux::fs::MetadataExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use super::driver::{CancelToken, EventCallback, GpioDriver};
use super::epoll::{EPOLLERR, EPOLLPRI};
use super::interrupt::{self, AsyncInterrupt, EventSource};
use super::{Error, PinEvent, PinEventTypes, PinMode, PinValue, Result, WaitForEventResult};

pub(super) const GPIO_BASE_PATH: &str = "/sys/class/gpio";

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
enum Direction {
    In,
    Out,
    Low,
    High,
}

// Find group ID for specified group name
fn group_name_to_gid(name: &str) -> Option<u32> {
    if let Ok(name_cstr) = CString::new(name) {
        unsafe {
            let group_ptr = libc::getgrnam(name_cstr.as_ptr());

            if !group_ptr.is_null() {
                return Some((*group_ptr).gr_gid);
            }
        }
    }

    None
}

fn export(sys_pin: u32) -> io::Result<()> {
    // Only export if the pin isn't already exported
    if !Path::new(&format!("{}/gpio{}", GPIO_BASE_PATH, sys_pin)).exists() {
        File::create(format!("{}/export", GPIO_BASE_PATH))?
            .write_fmt(format_args!("{}", sys_pin))?;
    }

    // The directory created by exporting a pin starts off owned by
    // root:root. There's a short delay before the group is changed to gpio
    // by udev. Since non-root users are the common case, wait for max. 1s
    // for the group to change before touching the attribute files.
    let gid_gpio = group_name_to_gid("gpio").unwrap_or(0);

    let mut counter = 0;
    while counter < 20 {
        let meta = fs::metadata(format!("{}/gpio{}", GPIO_BASE_PATH, sys_pin))?;
        if meta.st_gid() == gid_gpio {
            break;
        }

        thread::sleep(Duration::from_millis(50));
        counter += 1;
    }

    Ok(())
}

fn unexport(sys_pin: u32) -> io::Result<()> {
    // Only unexport if the pin is actually exported
    if Path::new(&format!("{}/gpio{}", GPIO_BASE_PATH, sys_pin)).exists() {
        File::create(format!("{}/unexport", GPIO_BASE_PATH))?
            .write_fmt(format_args!("{}", sys_pin))?;
    }

    Ok(())
}

fn set_direction(sys_pin: u32, direction: Direction) -> io::Result<()> {
    let b_direction: &[u8] = match direction {
        Direction::In => b"in",
        Direction::Out => b"out",
        Direction::Low => b"low",
        Direction::High => b"high",
    };

    File::create(format!("{}/gpio{}/direction", GPIO_BASE_PATH, sys_pin))?
        .write_all(b_direction)?;

    Ok(())
}

fn read_direction(sys_pin: u32) -> io::Result<Direction> {
    let contents = fs::read_to_string(format!("{}/gpio{}/direction", GPIO_BASE_PATH, sys_pin))?;

    match contents.trim() {
        "out" => Ok(Direction::Out),
        _ => Ok(Direction::In),
    }
}

fn set_edge(sys_pin: u32, events: PinEventTypes) -> io::Result<()> {
    let b_edge: &[u8] = if events.is_all() {
        b"both"
    } else if events.contains(PinEventTypes::RISING) {
        b"rising"
    } else if events.contains(PinEventTypes::FALLING) {
        b"falling"
    } else {
        b"none"
    };

    File::create(format!("{}/gpio{}/edge", GPIO_BASE_PATH, sys_pin))?.write_all(b_edge)?;

    Ok(())
}

fn open_value(sys_pin: u32) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(format!("{}/gpio{}/value", GPIO_BASE_PATH, sys_pin))
}

fn read_value(value: &mut File) -> io::Result<PinValue> {
    let mut buffer = [0; 1];
    value.seek(SeekFrom::Start(0))?;
    value.read_exact(&mut buffer)?;

    Ok(match &buffer {
        b"0" => PinValue::Low,
        _ => PinValue::High,
    })
}

// Base line number and line count of the board's primary GPIO controller.
// Distributions expose both under gpiochip entries; the pinctrl-labeled chip
// is the one wired to the header.
fn read_chip_info() -> Option<(u32, Option<u32>)> {
    let mut fallback: Option<(u32, Option<u32>)> = None;

    let entries = fs::read_dir(GPIO_BASE_PATH).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(chip) = name.strip_prefix("gpiochip") {
            if chip.parse::<u32>().is_err() {
                continue;
            }

            let base: u32 = fs::read_to_string(entry.path().join("base"))
                .ok()?
                .trim()
                .parse()
                .ok()?;

            let ngpio: Option<u32> = fs::read_to_string(entry.path().join("ngpio"))
                .ok()
                .and_then(|contents| contents.trim().parse().ok());

            let label = fs::read_to_string(entry.path().join("label")).unwrap_or_default();
            if label.contains("pinctrl") {
                return Some((base, ngpio));
            }

            fallback = match fallback {
                Some((b, n)) if b <= base => Some((b, n)),
                _ => Some((base, ngpio)),
            };
        }
    }

    fallback
}

struct SysfsPin {
    value: File,
    edge: PinEventTypes,
    interrupt: Option<AsyncInterrupt>,
    waiting: bool,
}

struct SysfsEventSource {
    value: File,
    pin: u8,
    events: PinEventTypes,
    last: PinValue,
}

impl SysfsEventSource {
    fn new(sys_pin: u32, pin: u8, events: PinEventTypes) -> Result<SysfsEventSource> {
        let mut value = open_value(sys_pin)?;

        // Reading the current level clears the pending readiness the value
        // attribute reports right after registration.
        let last = read_value(&mut value)?;

        Ok(SysfsEventSource {
            value,
            pin,
            events,
            last,
        })
    }
}

impl EventSource for SysfsEventSource {
    fn raw_fd(&self) -> RawFd {
        self.value.as_raw_fd()
    }

    fn poll_flags(&self) -> i32 {
        EPOLLPRI | EPOLLERR
    }

    fn read_event(&mut self) -> Result<Vec<PinEvent>> {
        let value = read_value(&mut self.value)?;

        // The edge attribute already filters single-edge subscriptions. For
        // both-edge subscriptions the level change since the last read tells
        // which edges fired; an unchanged level means a pulse too short to
        // observe, which still crossed both edges.
        let edges = if self.events.is_all() {
            match (self.last, value) {
                (PinValue::Low, PinValue::High) => vec![PinEventTypes::RISING],
                (PinValue::High, PinValue::Low) => vec![PinEventTypes::FALLING],
                (PinValue::High, PinValue::High) => {
                    vec![PinEventTypes::FALLING, PinEventTypes::RISING]
                }
                (PinValue::Low, PinValue::Low) => {
                    vec![PinEventTypes::RISING, PinEventTypes::FALLING]
                }
            }
        } else {
            vec![self.events]
        };
        self.last = value;

        Ok(edges
            .into_iter()
            .map(|edge| PinEvent {
                pin: self.pin,
                edge,
            })
            .collect())
    }
}

/// GPIO driver for the legacy `/sys/class/gpio` interface.
///
/// Exports pins through the sysfs GPIO class, which works on older kernels
/// and boards without a usable GPIO character device. Pull-up/pull-down
/// modes aren't expressible through sysfs.
pub struct SysfsDriver {
    base: u32,
    ngpio: Option<u32>,
    pins: Mutex<HashMap<u8, SysfsPin>>,
}

impl SysfsDriver {
    /// Constructs a new `SysfsDriver`.
    ///
    /// The base line number of the board's primary gpiochip is added to
    /// every logical pin number to form the sysfs GPIO number.
    pub fn new() -> Result<SysfsDriver> {
        if !Path::new(GPIO_BASE_PATH).exists() {
            return Err(Error::UnknownModel);
        }

        let (base, ngpio) = read_chip_info().unwrap_or((0, None));
        debug!("sysfs gpiochip base {}, ngpio {:?}", base, ngpio);

        Ok(SysfsDriver {
            base,
            ngpio,
            pins: Mutex::new(HashMap::new()),
        })
    }

    fn sys_pin(&self, pin: u8) -> u32 {
        self.base + u32::from(pin)
    }
}

impl fmt::Debug for SysfsDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SysfsDriver")
            .field("base", &self.base)
            .field("ngpio", &self.ngpio)
            .field("pins", &format_args!("{{ .. }}"))
            .finish()
    }
}

impl GpioDriver for SysfsDriver {
    fn pin_count(&self) -> Result<u8> {
        match self.ngpio {
            Some(ngpio) => Ok(ngpio.min(u32::from(u8::MAX)) as u8),
            None => Err(Error::NotSupported("pin count through sysfs")),
        }
    }

    fn open(&self, pin: u8) -> Result<()> {
        let mut pins = self.pins.lock().unwrap();
        if pins.contains_key(&pin) {
            return Ok(());
        }

        let sys_pin = self.sys_pin(pin);
        export(sys_pin).map_err(|e| match e.kind() {
            io::ErrorKind::PermissionDenied => {
                Error::PermissionDenied(format!("{}/export", GPIO_BASE_PATH))
            }
            _ => Error::Io(e),
        })?;

        let value = match open_value(sys_pin) {
            Ok(file) => file,
            Err(e) => {
                unexport(sys_pin).ok();
                return Err(Error::Io(e));
            }
        };

        pins.insert(
            pin,
            SysfsPin {
                value,
                edge: PinEventTypes::empty(),
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

        if let Some(mut interrupt) = state.interrupt.take() {
            interrupt.stop()?;
        }

        unexport(self.sys_pin(pin))?;

        Ok(())
    }

    fn mode(&self, pin: u8) -> Result<PinMode> {
        match read_direction(self.sys_pin(pin))? {
            Direction::Out => Ok(PinMode::Output),
            _ => Ok(PinMode::Input),
        }
    }

    fn set_mode(&self, pin: u8, mode: PinMode) -> Result<()> {
        let direction = match mode {
            PinMode::Input => Direction::In,
            PinMode::Output => Direction::Out,
            PinMode::InputPullUp | PinMode::InputPullDown => {
                return Err(Error::ModeNotSupported(pin, mode));
            }
        };

        set_direction(self.sys_pin(pin), direction)?;

        Ok(())
    }

    fn set_mode_with_value(&self, pin: u8, mode: PinMode, value: PinValue) -> Result<()> {
        if mode != PinMode::Output {
            return self.set_mode(pin, mode);
        }

        // The direction attribute accepts "low" and "high", which switch to
        // output and apply the level atomically.
        let direction = match value {
            PinValue::Low => Direction::Low,
            PinValue::High => Direction::High,
        };

        set_direction(self.sys_pin(pin), direction)?;

        Ok(())
    }

    fn is_mode_supported(&self, _pin: u8, mode: PinMode) -> bool {
        matches!(mode, PinMode::Input | PinMode::Output)
    }

    fn read(&self, pin: u8) -> Result<PinValue> {
        let mut pins = self.pins.lock().unwrap();
        let state = pins.get_mut(&pin).ok_or(Error::PinNotOpen(pin))?;

        Ok(read_value(&mut state.value)?)
    }

    fn write(&self, pin: u8, value: PinValue) -> Result<()> {
        let mut pins = self.pins.lock().unwrap();
        let state = pins.get_mut(&pin).ok_or(Error::PinNotOpen(pin))?;

        let buffer: &[u8] = match value {
            PinValue::Low => b"0",
            PinValue::High => b"1",
        };
        state.value.write_all(buffer)?;

        Ok(())
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

        let sys_pin = self.sys_pin(pin);
        set_edge(sys_pin, events)?;
        state.edge = events;

        let interrupt = SysfsEventSource::new(sys_pin, pin, events)
            .and_then(|source| AsyncInterrupt::spawn(source, callback));

        match interrupt {
            Ok(interrupt) => {
                state.interrupt = Some(interrupt);
                Ok(())
            }
            Err(e) => {
                state.edge = PinEventTypes::empty();
                set_edge(sys_pin, PinEventTypes::empty()).ok();
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
            if !state.edge.is_empty() {
                state.edge = PinEventTypes::empty();
                set_edge(self.sys_pin(pin), PinEventTypes::empty())?;
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
        let mut source = {
            let mut pins = self.pins.lock().unwrap();
            let state = pins.get_mut(&pin).ok_or(Error::PinNotOpen(pin))?;

            if state.interrupt.is_some() || state.waiting {
                return Err(Error::PinBusy(pin));
            }

            let sys_pin = self.sys_pin(pin);
            set_edge(sys_pin, events)?;
            state.edge = events;

            let source = match SysfsEventSource::new(sys_pin, pin, events) {
                Ok(source) => source,
                Err(e) => {
                    state.edge = PinEventTypes::empty();
                    set_edge(sys_pin, PinEventTypes::empty()).ok();
                    return Err(e);
                }
            };

            state.waiting = true;
            source
        };

        let result = interrupt::wait_edge(&mut source, cancel);

        let mut pins = self.pins.lock().unwrap();
        if let Some(state) = pins.get_mut(&pin) {
            state.waiting = false;
            state.edge = PinEventTypes::empty();
            if let Err(e) = set_edge(self.sys_pin(pin), PinEventTypes::empty()) {
                warn!("resetting edge for pin {}: {}", pin, e);
            }
        }

        result
    }
}
