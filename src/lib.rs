//! sbc-gpio provides GPIO pin control for Linux single-board computers
//! through a single controller API backed by pluggable hardware drivers.
//!
//! A [`gpio::GpioController`] owns one [`gpio::GpioDriver`] implementation and
//! handles pin lifecycle, numbering-scheme translation, edge-event callbacks
//! and blocking or asynchronous event waits. Drivers are included for the
//! `/dev/gpiochip*` character device, the legacy `/sys/class/gpio` interface,
//! the Raspberry Pi's memory-mapped GPIO register bank, and a fully simulated
//! pin bank for development and testing off target hardware.
//!
//! The library can be used in conjunction with a variety of platform-agnostic
//! drivers through its `embedded-hal` trait implementations, available behind
//! the `hal` feature.
//!
//! sbc-gpio requires a recent Linux distribution. Both `gnu` and `musl` libc
//! targets are supported. Backwards compatibility for minor revisions isn't
//! guaranteed until v1.0.0.

// Used by rustdoc to link other crates to sbc-gpio's docs
#![doc(html_root_url = "https://docs.rs/sbc-gpio/0.3.0")]

#[macro_use]
mod macros;

pub mod gpio;
pub mod system;
