use std::fmt;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use libc::{self, c_void, off_t, size_t, MAP_FAILED, MAP_SHARED, O_SYNC, PROT_READ, PROT_WRITE};
use tracing::debug;

use super::cdev::CdevDriver;
use super::driver::{CancelToken, EventCallback, GpioDriver};
use super::{Error, PinEventTypes, PinMode, PinValue, Result, WaitForEventResult};
use crate::system::{DeviceInfo, SoC};

const PATH_DEV_GPIOMEM: &str = "/dev/gpiomem";
const PATH_DEV_MEM: &str = "/dev/mem";

// GPIOs wired to the 40-pin header. The BCM283x exposes more, but they're
// reserved for the system (SD card, HDMI hotplug, etc.).
const PIN_COUNT: u8 = 28;

// The mapped region covers every GPIO register up to and including the
// BCM2711's last pull control register at 0xf0 (datasheet @ 5.2).
const GPIO_MEM_REGISTERS: usize = 61;
const GPIO_MEM_SIZE: usize = GPIO_MEM_REGISTERS * std::mem::size_of::<u32>();

const GPFSEL0: usize = 0x00;
const GPSET0: usize = 0x1c / std::mem::size_of::<u32>();
const GPCLR0: usize = 0x28 / std::mem::size_of::<u32>();
const GPLEV0: usize = 0x34 / std::mem::size_of::<u32>();
const GPPUD: usize = 0x94 / std::mem::size_of::<u32>();
const GPPUDCLK0: usize = 0x98 / std::mem::size_of::<u32>();
const GPIO_PUP_PDN_CNTRL0: usize = 0xe4 / std::mem::size_of::<u32>();

const FSEL_INPUT: u32 = 0b000;
const FSEL_OUTPUT: u32 = 0b001;

/// Translates a physical position on the 40-pin header to its BCM GPIO
/// number. Power and ground positions don't translate.
pub(super) fn header_to_logical(pin: u8) -> Option<u8> {
    match pin {
        3 => Some(2),
        5 => Some(3),
        7 => Some(4),
        8 => Some(14),
        10 => Some(15),
        11 => Some(17),
        12 => Some(18),
        13 => Some(27),
        15 => Some(22),
        16 => Some(23),
        18 => Some(24),
        19 => Some(10),
        21 => Some(9),
        22 => Some(25),
        23 => Some(11),
        24 => Some(8),
        26 => Some(7),
        27 => Some(0),
        28 => Some(1),
        29 => Some(5),
        31 => Some(6),
        32 => Some(12),
        33 => Some(13),
        35 => Some(19),
        36 => Some(16),
        37 => Some(26),
        38 => Some(20),
        40 => Some(21),
        _ => None,
    }
}

// Mapped view of the SoC's GPIO register bank. Multiple pins pack into each
// 32-bit register, so every read-modify-write sequence takes the target
// register's spinlock to prevent lost updates.
struct Registers {
    mem_ptr: *mut u32,
    locks: [AtomicBool; GPIO_MEM_REGISTERS],
}

impl fmt::Debug for Registers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registers")
            .field("mem_ptr", &self.mem_ptr)
            .field("locks", &format_args!("{{ .. }}"))
            .finish()
    }
}

impl Registers {
    fn open(device_info: &DeviceInfo) -> Result<Registers> {
        // Try /dev/gpiomem first. If that fails, try /dev/mem instead. If
        // neither works, report back the error that's the most relevant.
        let mem_ptr = match Self::map_devgpiomem() {
            Ok(ptr) => ptr,
            Err(gpiomem_err) => match Self::map_devmem(device_info) {
                Ok(ptr) => ptr,
                Err(Error::Io(ref e)) if e.kind() == io::ErrorKind::PermissionDenied => {
                    // Did /dev/gpiomem also give us a Permission Denied
                    // error? If so, return that path instead of /dev/mem.
                    // Solving /dev/gpiomem issues should be preferred (add
                    // user to gpio group) over /dev/mem (use sudo).
                    match gpiomem_err {
                        Error::Io(ref e) if e.kind() == io::ErrorKind::PermissionDenied => {
                            return Err(Error::PermissionDenied(String::from(PATH_DEV_GPIOMEM)));
                        }
                        _ => return Err(Error::PermissionDenied(String::from(PATH_DEV_MEM))),
                    }
                }
                _ => return Err(gpiomem_err),
            },
        };

        Ok(Registers {
            mem_ptr,
            locks: std::array::from_fn(|_| AtomicBool::new(false)),
        })
    }

    fn map_devgpiomem() -> Result<*mut u32> {
        // Open /dev/gpiomem with read/write/sync flags. This might fail if
        // /dev/gpiomem doesn't exist, doesn't have the appropriate
        // permissions, or the current user is not a member of the gpio group.
        let gpiomem_file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(O_SYNC)
            .open(PATH_DEV_GPIOMEM)?;

        // Memory-map /dev/gpiomem at offset 0
        let gpiomem_ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                GPIO_MEM_SIZE,
                PROT_READ | PROT_WRITE,
                MAP_SHARED,
                gpiomem_file.as_raw_fd(),
                0,
            )
        };

        if gpiomem_ptr == MAP_FAILED {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        Ok(gpiomem_ptr as *mut u32)
    }

    fn map_devmem(device_info: &DeviceInfo) -> Result<*mut u32> {
        let mem_file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(O_SYNC)
            .open(PATH_DEV_MEM)?;

        // Memory-map /dev/mem at the GPIO register offset for this SoC
        let mem_ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                GPIO_MEM_SIZE,
                PROT_READ | PROT_WRITE,
                MAP_SHARED,
                mem_file.as_raw_fd(),
                (device_info.peripheral_base() + device_info.gpio_offset()) as off_t,
            )
        };

        if mem_ptr == MAP_FAILED {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        Ok(mem_ptr as *mut u32)
    }

    #[inline(always)]
    fn read(&self, offset: usize) -> u32 {
        unsafe { ptr::read_volatile(self.mem_ptr.add(offset)) }
    }

    #[inline(always)]
    fn write(&self, offset: usize, value: u32) {
        unsafe {
            ptr::write_volatile(self.mem_ptr.add(offset), value);
        }
    }

    fn lock(&self, offset: usize) {
        while self.locks[offset]
            .compare_exchange_weak(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    fn unlock(&self, offset: usize) {
        self.locks[offset].store(false, Ordering::SeqCst);
    }

    #[inline(always)]
    fn set_high(&self, pin: u8) {
        let offset = GPSET0 + pin as usize / 32;
        let shift = pin % 32;
        self.write(offset, 1 << shift);
    }

    #[inline(always)]
    fn set_low(&self, pin: u8) {
        let offset = GPCLR0 + pin as usize / 32;
        let shift = pin % 32;
        self.write(offset, 1 << shift);
    }

    #[inline(always)]
    fn level(&self, pin: u8) -> PinValue {
        let offset = GPLEV0 + pin as usize / 32;
        let shift = pin % 32;

        PinValue::from(((self.read(offset) >> shift) & 0b1) as u8)
    }

    // Function select field for the pin: 3 bits per pin, 10 pins per register.
    fn fsel(&self, pin: u8) -> u32 {
        let offset = GPFSEL0 + pin as usize / 10;
        let shift = (pin % 10) * 3;

        (self.read(offset) >> shift) & 0b111
    }

    fn set_fsel(&self, pin: u8, fsel: u32) {
        let offset = GPFSEL0 + pin as usize / 10;
        let shift = (pin % 10) * 3;

        self.lock(offset);
        let reg_value = self.read(offset);
        self.write(offset, (reg_value & !(0b111 << shift)) | (fsel << shift));
        self.unlock(offset);
    }

    // BCM2835-BCM2837: clock the pull state into the pin through the
    // GPPUD/GPPUDCLK two-step sequence (datasheet @ 6.1). The configured
    // state can't be read back.
    fn set_pull_bcm2835(&self, pin: u8, mode: PinMode) {
        let offset = GPPUDCLK0 + pin as usize / 32;
        let shift = pin % 32;

        let pud: u32 = match mode {
            PinMode::InputPullDown => 0b01,
            PinMode::InputPullUp => 0b10,
            _ => 0b00,
        };

        // Both registers participate in the sequence, so both locks are
        // taken, GPPUD first to keep lock ordering consistent.
        self.lock(GPPUD);
        self.lock(offset);

        // Set the control signal in GPPUD.
        let reg_value = self.read(GPPUD);
        self.write(GPPUD, (reg_value & !0b11) | pud);

        // The datasheet mentions waiting at least 150 cycles for set-up and
        // hold, but doesn't state which clock is used. This is likely the VPU
        // clock. At either 250MHz or 400MHz, a 5µs delay + overhead is more
        // than adequate.

        // Set-up time for the control signal.
        thread::sleep(Duration::new(0, 5000)); // >= 5µs

        // Clock the control signal into the selected pin.
        self.write(offset, 1 << shift);

        // Hold time for the control signal.
        thread::sleep(Duration::new(0, 5000)); // >= 5µs

        // Remove the control signal and clock.
        self.write(GPPUD, reg_value & !0b11);
        self.write(offset, 0);

        self.unlock(offset);
        self.unlock(GPPUD);
    }

    // BCM2711: pull state lives in dedicated registers, 2 bits per pin, and
    // can be read back.
    fn set_pull_bcm2711(&self, pin: u8, mode: PinMode) {
        let offset = GPIO_PUP_PDN_CNTRL0 + pin as usize / 16;
        let shift = (pin % 16) * 2;

        let pull: u32 = match mode {
            PinMode::InputPullUp => 0b01,
            PinMode::InputPullDown => 0b10,
            _ => 0b00,
        };

        self.lock(offset);
        let reg_value = self.read(offset);
        self.write(offset, (reg_value & !(0b11 << shift)) | (pull << shift));
        self.unlock(offset);
    }

    fn pull_bcm2711(&self, pin: u8) -> PinMode {
        let offset = GPIO_PUP_PDN_CNTRL0 + pin as usize / 16;
        let shift = (pin % 16) * 2;

        match (self.read(offset) >> shift) & 0b11 {
            0b01 => PinMode::InputPullUp,
            0b10 => PinMode::InputPullDown,
            _ => PinMode::Input,
        }
    }
}

impl Drop for Registers {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.mem_ptr as *mut c_void, GPIO_MEM_SIZE as size_t);
        }
    }
}

// Required because of the raw pointer to our memory-mapped file
unsafe impl Send for Registers {}
unsafe impl Sync for Registers {}

/// GPIO driver for the Raspberry Pi's memory-mapped GPIO register bank.
///
/// Manipulates the BCM283x function-select, set, clear, level and pull
/// registers directly through `/dev/gpiomem` or `/dev/mem`, which makes pin
/// I/O considerably faster than the file-based interfaces. Edge events
/// aren't available through the register bank; they're delegated to the GPIO
/// character device.
///
/// Construction fails fast with [`Error::UnknownModel`] when the board isn't
/// a Raspberry Pi. The Raspberry Pi 5 puts its GPIO registers on the RP1 and
/// isn't reachable through a fixed physical address; use [`CdevDriver`]
/// there.
pub struct RaspberryPiDriver {
    registers: Registers,
    soc: SoC,
    // The BCM2835-BCM2837 pull state can't be read back from the hardware,
    // so the last configured mode is cached per pin.
    pulls: Mutex<[PinMode; PIN_COUNT as usize]>,
    events: Mutex<Option<Arc<CdevDriver>>>,
}

impl RaspberryPiDriver {
    /// Constructs a new `RaspberryPiDriver`.
    ///
    /// Identifies the board through [`DeviceInfo`] and maps the GPIO register
    /// bank, preferring `/dev/gpiomem` over `/dev/mem`.
    ///
    /// [`DeviceInfo`]: crate::system::DeviceInfo
    pub fn new() -> Result<RaspberryPiDriver> {
        let device_info = DeviceInfo::new().map_err(|_| Error::UnknownModel)?;

        if device_info.soc() == SoC::Bcm2712 {
            return Err(Error::NotSupported(
                "memory-mapped GPIO on the BCM2712 (RP1)",
            ));
        }

        let registers = Registers::open(&device_info)?;
        debug!(
            "mapped GPIO registers for {} ({})",
            device_info.model(),
            device_info.soc()
        );

        Ok(RaspberryPiDriver {
            registers,
            soc: device_info.soc(),
            pulls: Mutex::new([PinMode::Input; PIN_COUNT as usize]),
            events: Mutex::new(None),
        })
    }

    fn check_pin(&self, pin: u8) -> Result<()> {
        if pin >= PIN_COUNT {
            return Err(Error::PinNotAvailable(pin));
        }

        Ok(())
    }

    // The register bank has no event interface; edge detection goes through
    // a lazily constructed character device driver on the same pins.
    fn event_driver(&self) -> Result<Arc<CdevDriver>> {
        let mut events = self.events.lock().unwrap();
        if let Some(driver) = &*events {
            return Ok(driver.clone());
        }

        let driver = Arc::new(CdevDriver::new()?);
        *events = Some(driver.clone());

        Ok(driver)
    }

    fn set_pull(&self, pin: u8, mode: PinMode) {
        if self.soc == SoC::Bcm2711 {
            self.registers.set_pull_bcm2711(pin, mode);
        } else {
            self.registers.set_pull_bcm2835(pin, mode);
        }

        self.pulls.lock().unwrap()[pin as usize] = match mode {
            PinMode::InputPullUp | PinMode::InputPullDown => mode,
            _ => PinMode::Input,
        };
    }
}

impl fmt::Debug for RaspberryPiDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RaspberryPiDriver")
            .field("registers", &self.registers)
            .field("soc", &self.soc)
            .field("pulls", &format_args!("{{ .. }}"))
            .field("events", &format_args!("{{ .. }}"))
            .finish()
    }
}

impl GpioDriver for RaspberryPiDriver {
    fn pin_count(&self) -> Result<u8> {
        Ok(PIN_COUNT)
    }

    fn board_to_logical(&self, pin: u8) -> Result<u8> {
        header_to_logical(pin).ok_or(Error::PinNotAvailable(pin))
    }

    fn open(&self, pin: u8) -> Result<()> {
        // The register bank needs no per-pin acquisition.
        self.check_pin(pin)
    }

    fn close(&self, pin: u8) -> Result<()> {
        self.check_pin(pin)?;

        // Tear down event delegation if the pin was handed to the character
        // device.
        let events = self.events.lock().unwrap().clone();
        if let Some(events) = events {
            events.clear_async_interrupt(pin).ok();
            match events.close(pin) {
                Ok(()) | Err(Error::PinNotOpen(_)) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    fn mode(&self, pin: u8) -> Result<PinMode> {
        self.check_pin(pin)?;

        match self.registers.fsel(pin) {
            FSEL_OUTPUT => Ok(PinMode::Output),
            FSEL_INPUT if self.soc == SoC::Bcm2711 => Ok(self.registers.pull_bcm2711(pin)),
            FSEL_INPUT => Ok(self.pulls.lock().unwrap()[pin as usize]),
            // Alternate functions report as input, matching the hardware's
            // behavior once the function select is cleared.
            _ => Ok(PinMode::Input),
        }
    }

    fn set_mode(&self, pin: u8, mode: PinMode) -> Result<()> {
        self.check_pin(pin)?;

        let fsel = if mode == PinMode::Output {
            FSEL_OUTPUT
        } else {
            FSEL_INPUT
        };
        self.registers.set_fsel(pin, fsel);

        if mode != PinMode::Output {
            self.set_pull(pin, mode);
        }

        Ok(())
    }

    fn set_mode_with_value(&self, pin: u8, mode: PinMode, value: PinValue) -> Result<()> {
        // The set/clear registers latch the level while the pin is still an
        // input; it takes effect with the mode switch.
        if mode == PinMode::Output {
            self.write(pin, value)?;
        }

        self.set_mode(pin, mode)
    }

    fn is_mode_supported(&self, pin: u8, _mode: PinMode) -> bool {
        pin < PIN_COUNT
    }

    fn read(&self, pin: u8) -> Result<PinValue> {
        self.check_pin(pin)?;

        Ok(self.registers.level(pin))
    }

    fn write(&self, pin: u8, value: PinValue) -> Result<()> {
        self.check_pin(pin)?;

        match value {
            PinValue::Low => self.registers.set_low(pin),
            PinValue::High => self.registers.set_high(pin),
        }

        Ok(())
    }

    fn set_async_interrupt(
        &self,
        pin: u8,
        events: PinEventTypes,
        callback: EventCallback,
    ) -> Result<()> {
        self.check_pin(pin)?;

        let driver = self.event_driver()?;
        driver.open(pin)?;
        driver.set_async_interrupt(pin, events, callback)
    }

    fn clear_async_interrupt(&self, pin: u8) -> Result<()> {
        self.check_pin(pin)?;

        let events = self.events.lock().unwrap().clone();
        match events {
            Some(driver) => match driver.clear_async_interrupt(pin) {
                Ok(()) | Err(Error::PinNotOpen(_)) => Ok(()),
                Err(e) => Err(e),
            },
            None => Ok(()),
        }
    }

    fn wait_for_event(
        &self,
        pin: u8,
        events: PinEventTypes,
        cancel: &CancelToken,
    ) -> Result<WaitForEventResult> {
        self.check_pin(pin)?;

        let driver = self.event_driver()?;
        driver.open(pin)?;
        driver.wait_for_event(pin, events, cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_map_translates_gpio_positions() {
        assert_eq!(header_to_logical(3), Some(2));
        assert_eq!(header_to_logical(7), Some(4));
        assert_eq!(header_to_logical(33), Some(13));
        assert_eq!(header_to_logical(40), Some(21));
    }

    #[test]
    fn header_map_rejects_power_and_ground() {
        // 1 and 17 are 3v3, 2 and 4 are 5V, 6 and 9 are ground.
        for pin in [1, 2, 4, 6, 9, 17, 25, 39] {
            assert_eq!(header_to_logical(pin), None);
        }

        assert_eq!(header_to_logical(0), None);
        assert_eq!(header_to_logical(41), None);
    }
}
