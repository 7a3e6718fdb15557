#![allow(clippy::unnecessary_cast)]

use std::ffi::CString;
use std::fmt;
use std::io;
use std::mem;

use libc::{self, c_int, c_void};

use crate::gpio::{Error, Result};

#[cfg(target_env = "gnu")]
type IoctlLong = libc::c_ulong;
#[cfg(target_env = "musl")]
type IoctlLong = c_int;

const CONSUMER_LABEL: &str = "sbc-gpio";

const BITS_NR: u8 = 8;
const BITS_TYPE: u8 = 8;
const BITS_SIZE: u8 = 14;

const SHIFT_NR: u8 = 0;
const SHIFT_TYPE: u8 = SHIFT_NR + BITS_NR;
const SHIFT_SIZE: u8 = SHIFT_TYPE + BITS_TYPE;
const SHIFT_DIR: u8 = SHIFT_SIZE + BITS_SIZE;

const DIR_WRITE: IoctlLong = 1 << SHIFT_DIR;
const DIR_READ: IoctlLong = 2 << SHIFT_DIR;
const DIR_READ_WRITE: IoctlLong = DIR_READ | DIR_WRITE;

const TYPE_GPIO: IoctlLong = (0xB4 as IoctlLong) << SHIFT_TYPE;

const NR_GET_CHIP_INFO: IoctlLong = 0x01 << SHIFT_NR;
const NR_GET_LINE_INFO: IoctlLong = 0x05 << SHIFT_NR;
const NR_GET_LINE: IoctlLong = 0x07 << SHIFT_NR;
const NR_LINE_SET_CONFIG: IoctlLong = 0x0D << SHIFT_NR;
const NR_LINE_GET_VALUES: IoctlLong = 0x0E << SHIFT_NR;
const NR_LINE_SET_VALUES: IoctlLong = 0x0F << SHIFT_NR;

const SIZE_CHIP_INFO: IoctlLong = (mem::size_of::<ChipInfo>() as IoctlLong) << SHIFT_SIZE;
const SIZE_LINE_INFO: IoctlLong = (mem::size_of::<LineInfo>() as IoctlLong) << SHIFT_SIZE;
const SIZE_LINE_REQUEST: IoctlLong = (mem::size_of::<LineRequest>() as IoctlLong) << SHIFT_SIZE;
const SIZE_LINE_CONFIG: IoctlLong = (mem::size_of::<LineConfig>() as IoctlLong) << SHIFT_SIZE;
const SIZE_LINE_VALUES: IoctlLong = (mem::size_of::<LineValues>() as IoctlLong) << SHIFT_SIZE;

const GPIO_GET_CHIPINFO_IOCTL: IoctlLong = DIR_READ | TYPE_GPIO | NR_GET_CHIP_INFO | SIZE_CHIP_INFO;
const GPIO_V2_GET_LINEINFO_IOCTL: IoctlLong =
    DIR_READ_WRITE | TYPE_GPIO | NR_GET_LINE_INFO | SIZE_LINE_INFO;
const GPIO_V2_GET_LINE_IOCTL: IoctlLong =
    DIR_READ_WRITE | TYPE_GPIO | NR_GET_LINE | SIZE_LINE_REQUEST;
const GPIO_V2_LINE_SET_CONFIG_IOCTL: IoctlLong =
    DIR_READ_WRITE | TYPE_GPIO | NR_LINE_SET_CONFIG | SIZE_LINE_CONFIG;
const GPIO_V2_LINE_GET_VALUES_IOCTL: IoctlLong =
    DIR_READ_WRITE | TYPE_GPIO | NR_LINE_GET_VALUES | SIZE_LINE_VALUES;
const GPIO_V2_LINE_SET_VALUES_IOCTL: IoctlLong =
    DIR_READ_WRITE | TYPE_GPIO | NR_LINE_SET_VALUES | SIZE_LINE_VALUES;

// Maximum name and label length.
const NAME_BUFSIZE: usize = 32;
const LABEL_BUFSIZE: usize = 32;

// Maximum number of requested lines.
const LINES_MAX: usize = 64;
// Maximum number of configuration attributes.
const LINE_NUM_ATTRS_MAX: usize = 10;

pub const LINE_FLAG_INPUT: u64 = 0x04;
pub const LINE_FLAG_OUTPUT: u64 = 0x08;
pub const LINE_FLAG_EDGE_RISING: u64 = 0x10;
pub const LINE_FLAG_EDGE_FALLING: u64 = 0x20;
pub const LINE_FLAG_BIAS_PULL_UP: u64 = 0x1000;
pub const LINE_FLAG_BIAS_PULL_DOWN: u64 = 0x2000;

const LINE_ATTR_ID_OUTPUT_VALUES: u32 = 2;

pub const LINE_EVENT_RISING_EDGE: u32 = 1;
pub const LINE_EVENT_FALLING_EDGE: u32 = 2;

#[derive(Copy, Clone)]
#[repr(C)]
pub struct ChipInfo {
    pub name: [u8; NAME_BUFSIZE],
    pub label: [u8; LABEL_BUFSIZE],
    pub lines: u32,
}

impl ChipInfo {
    pub fn new(cdev_fd: c_int) -> Result<ChipInfo> {
        let mut chip_info = ChipInfo {
            name: [0u8; NAME_BUFSIZE],
            label: [0u8; LABEL_BUFSIZE],
            lines: 0,
        };

        parse_retval!(unsafe { libc::ioctl(cdev_fd, GPIO_GET_CHIPINFO_IOCTL, &mut chip_info) })?;

        Ok(chip_info)
    }

    pub fn label(&self) -> String {
        cbuf_to_cstring(&self.label).into_string().unwrap_or_default()
    }
}

impl fmt::Debug for ChipInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChipInfo")
            .field("name", &cbuf_to_cstring(&self.name))
            .field("label", &cbuf_to_cstring(&self.label))
            .field("lines", &self.lines)
            .finish()
    }
}

#[derive(Copy, Clone, Default)]
#[repr(C)]
pub struct LineAttribute {
    pub id: u32,
    pub padding: u32,
    pub values: u64,
}

impl fmt::Debug for LineAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineAttribute")
            .field("id", &self.id)
            .field("values", &self.values)
            .finish()
    }
}

#[derive(Copy, Clone)]
#[repr(C)]
pub struct LineInfo {
    pub name: [u8; NAME_BUFSIZE],
    pub consumer: [u8; LABEL_BUFSIZE],
    pub offset: u32,
    pub num_attrs: u32,
    pub flags: u64,
    pub attrs: [LineAttribute; LINE_NUM_ATTRS_MAX],
    pub padding: [u32; 4],
}

impl LineInfo {
    pub fn new(cdev_fd: c_int, offset: u32) -> Result<LineInfo> {
        let mut line_info = LineInfo {
            name: [0u8; NAME_BUFSIZE],
            consumer: [0u8; LABEL_BUFSIZE],
            offset,
            num_attrs: 0,
            flags: 0,
            attrs: [LineAttribute::default(); LINE_NUM_ATTRS_MAX],
            padding: [0u32; 4],
        };

        parse_retval!(unsafe { libc::ioctl(cdev_fd, GPIO_V2_GET_LINEINFO_IOCTL, &mut line_info) })?;

        Ok(line_info)
    }
}

impl fmt::Debug for LineInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineInfo")
            .field("name", &cbuf_to_cstring(&self.name))
            .field("consumer", &cbuf_to_cstring(&self.consumer))
            .field("offset", &self.offset)
            .field("flags", &self.flags)
            .finish()
    }
}

#[derive(Copy, Clone, Default)]
#[repr(C)]
pub struct LineConfigAttribute {
    pub attr: LineAttribute,
    pub mask: u64,
}

impl fmt::Debug for LineConfigAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineConfigAttribute")
            .field("attr", &self.attr)
            .field("mask", &self.mask)
            .finish()
    }
}

#[derive(Copy, Clone, Default)]
#[repr(C)]
pub struct LineConfig {
    pub flags: u64,
    pub num_attrs: u32,
    pub padding: [u32; 5],
    pub attrs: [LineConfigAttribute; LINE_NUM_ATTRS_MAX],
}

impl LineConfig {
    pub fn new(flags: u64) -> LineConfig {
        LineConfig {
            flags,
            ..Default::default()
        }
    }

    /// Adds an output values attribute covering the first requested line.
    pub fn with_output_value(mut self, value: bool) -> LineConfig {
        self.attrs[0] = LineConfigAttribute {
            attr: LineAttribute {
                id: LINE_ATTR_ID_OUTPUT_VALUES,
                padding: 0,
                values: value as u64,
            },
            mask: 0x01,
        };
        self.num_attrs = 1;

        self
    }
}

impl fmt::Debug for LineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineConfig")
            .field("flags", &self.flags)
            .field("num_attrs", &self.num_attrs)
            .finish()
    }
}

// Owns the request fd; closed exactly once on drop, so not Clone.
#[repr(C)]
pub struct LineRequest {
    pub offsets: [u32; LINES_MAX],
    pub consumer: [u8; LABEL_BUFSIZE],
    pub config: LineConfig,
    pub num_lines: u32,
    pub event_buffer_size: u32,
    pub padding: [u32; 5],
    pub fd: c_int,
}

impl Default for LineRequest {
    fn default() -> Self {
        Self {
            offsets: [0u32; LINES_MAX],
            consumer: [0u8; LABEL_BUFSIZE],
            config: Default::default(),
            num_lines: 0,
            event_buffer_size: 0,
            padding: [0u32; 5],
            fd: 0,
        }
    }
}

impl fmt::Debug for LineRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineRequest")
            .field("offsets", &self.offsets[0])
            .field("consumer", &cbuf_to_cstring(&self.consumer))
            .field("config", &self.config)
            .field("num_lines", &self.num_lines)
            .field("fd", &self.fd)
            .finish()
    }
}

impl LineRequest {
    /// Requests a single line from the chip. Zero `flags` request the line
    /// as-is, leaving its direction and bias untouched.
    pub fn new(cdev_fd: c_int, offset: u32, flags: u64) -> Result<LineRequest> {
        let mut line_request = LineRequest {
            config: LineConfig::new(flags),
            num_lines: 1,
            ..Default::default()
        };
        line_request.offsets[0] = offset;

        // Set consumer label, so other processes know we're using this line
        line_request.consumer[0..CONSUMER_LABEL.len()].copy_from_slice(CONSUMER_LABEL.as_bytes());

        parse_retval!(unsafe { libc::ioctl(cdev_fd, GPIO_V2_GET_LINE_IOCTL, &mut line_request) })?;

        // If the fd is zero or negative, an error occurred
        if line_request.fd <= 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        // Nonblocking reads let event consumers drain the fd without hanging.
        parse_retval!(unsafe { libc::fcntl(line_request.fd, libc::F_SETFL, libc::O_NONBLOCK) })?;

        Ok(line_request)
    }

    pub fn set_config(&self, config: &mut LineConfig) -> Result<()> {
        parse_retval!(unsafe { libc::ioctl(self.fd, GPIO_V2_LINE_SET_CONFIG_IOCTL, config) })?;

        Ok(())
    }

    pub fn levels(&self) -> Result<LineValues> {
        let mut line_values = LineValues::new(0, 0x01);

        parse_retval!(unsafe {
            libc::ioctl(self.fd, GPIO_V2_LINE_GET_VALUES_IOCTL, &mut line_values)
        })?;

        Ok(line_values)
    }

    pub fn set_levels(&self, bits: u64, mask: u64) -> Result<()> {
        let mut line_values = LineValues::new(bits, mask);

        parse_retval!(unsafe {
            libc::ioctl(self.fd, GPIO_V2_LINE_SET_VALUES_IOCTL, &mut line_values)
        })?;

        Ok(())
    }

    pub fn close(&mut self) {
        if self.fd > 0 {
            unsafe {
                libc::close(self.fd);
            }

            self.fd = 0;
        }
    }
}

impl Drop for LineRequest {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Copy, Clone, Default)]
#[repr(C)]
pub struct LineValues {
    pub bits: u64,
    pub mask: u64,
}

impl fmt::Debug for LineValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineValues")
            .field("bits", &self.bits)
            .field("mask", &self.mask)
            .finish()
    }
}

impl LineValues {
    pub fn new(bits: u64, mask: u64) -> LineValues {
        LineValues { bits, mask }
    }
}

#[derive(Debug, Copy, Clone, Default)]
#[repr(C)]
pub struct LineEvent {
    pub timestamp_ns: u64,
    pub id: u32,
    pub offset: u32,
    pub seqno: u32,
    pub line_seqno: u32,
    pub padding: [u32; 6],
}

/// Reads a single edge event from a line request fd. Returns `None` when no
/// event is queued.
pub fn read_line_event(fd: c_int) -> Result<Option<LineEvent>> {
    let mut event = LineEvent::default();

    let bytes_read = unsafe {
        libc::read(
            fd,
            &mut event as *mut LineEvent as *mut c_void,
            mem::size_of::<LineEvent>(),
        )
    };

    if bytes_read == -1 {
        let e = io::Error::last_os_error();
        if e.kind() == io::ErrorKind::WouldBlock {
            return Ok(None);
        }

        return Err(Error::Io(e));
    }

    if (bytes_read as usize) < mem::size_of::<LineEvent>() {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "failed to fill whole buffer",
        )));
    }

    Ok(Some(event))
}

// Create a CString from a C-style NUL-terminated char array. This workaround
// is needed for fixed-length buffers that fill the remaining bytes with NULs,
// because CString::new() interprets those as a NUL in the middle of the byte
// slice and returns a NulError.
fn cbuf_to_cstring(buf: &[u8]) -> CString {
    CString::new({
        let pos = buf.iter().position(|&c| c == b'\0').unwrap_or(buf.len());
        &buf[..pos]
    })
    .unwrap_or_default()
}
