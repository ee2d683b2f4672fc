//! Raw ioctl surface of `/dev/raw-gadget`.
//!
//! The character device exposes a handful of fixed-size control
//! ioctls (init/run/configure/enable/disable/halt/vbus) and a handful
//! of variable-length data ioctls (event fetch, EP0 and data-endpoint
//! read/write) whose payload is a header followed by an inline byte
//! buffer. `nix::ioctl_*!` expects a fixed-size type, so the
//! fixed-size ioctls go through the macros below and the
//! variable-length ones are issued with a raw `libc::ioctl` call over
//! a manually sized buffer, the same approach `cotton-netif` takes for
//! the handful of Linux ioctls it can't express as fixed structs.

#![allow(dead_code, non_camel_case_types)]

use std::io;
use std::os::unix::io::RawFd;

use nix::{ioctl_none, ioctl_write_int, ioctl_write_ptr};

pub const RAW_IOCTL_TYPE: u8 = b'U';
pub const USB_RAW_MAX_STRING_LEN: usize = 256;

/// Inline-payload cap shared with the transfer queue (spec §6: "every
/// io structure carries... a <=4096 byte inline payload").
pub const MAX_INLINE_PAYLOAD: usize = 4096;

pub const USB_RAW_IO_FLAGS_ZERO: u16 = 0x1;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speed {
    Unknown = 0,
    Low = 1,
    Full = 2,
    High = 3,
    Super = 4,
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEventType {
    Invalid = 0,
    Connect = 1,
    Control = 2,
    Suspend = 3,
    Resume = 4,
    Reset = 5,
    Disconnect = 6,
}

impl RawEventType {
    pub fn from_raw(value: u32) -> Self {
        match value {
            1 => RawEventType::Connect,
            2 => RawEventType::Control,
            3 => RawEventType::Suspend,
            4 => RawEventType::Resume,
            5 => RawEventType::Reset,
            6 => RawEventType::Disconnect,
            _ => RawEventType::Invalid,
        }
    }
}

#[repr(C)]
pub struct RawInit {
    pub driver_name: [u8; USB_RAW_MAX_STRING_LEN],
    pub device_name: [u8; USB_RAW_MAX_STRING_LEN],
    pub speed: u8,
}

impl RawInit {
    pub fn new(driver_name: &str, device_name: &str, speed: Speed) -> Self {
        let mut init = RawInit {
            driver_name: [0; USB_RAW_MAX_STRING_LEN],
            device_name: [0; USB_RAW_MAX_STRING_LEN],
            speed: speed as u8,
        };
        copy_cstr(&mut init.driver_name, driver_name);
        copy_cstr(&mut init.device_name, device_name);
        init
    }
}

fn copy_cstr(dst: &mut [u8], src: &str) {
    let bytes = src.as_bytes();
    let n = bytes.len().min(dst.len() - 1);
    dst[..n].copy_from_slice(&bytes[..n]);
}

/// Fixed-size header for `usb_raw_event`; the event's payload (e.g. the
/// 8-byte control setup packet) follows immediately in the same ioctl
/// buffer.
#[repr(C)]
pub struct RawEventHeader {
    pub event_type: u32,
    pub length: u32,
}

/// Fixed-size header for `usb_raw_ep_io`; `data` follows inline.
#[repr(C)]
pub struct RawEpIoHeader {
    pub ep: u16,
    pub flags: u16,
    pub length: u16,
}

ioctl_write_ptr!(raw_init, RAW_IOCTL_TYPE, 0, RawInit);
ioctl_none!(raw_run, RAW_IOCTL_TYPE, 1);
ioctl_write_int!(raw_ep_disable, RAW_IOCTL_TYPE, 6);
ioctl_none!(raw_configure, RAW_IOCTL_TYPE, 9);
ioctl_write_int!(raw_vbus_draw, RAW_IOCTL_TYPE, 10);
ioctl_write_int!(raw_ep_set_halt, RAW_IOCTL_TYPE, 12);
ioctl_write_int!(raw_ep_clear_halt, RAW_IOCTL_TYPE, 13);

/// `usb_endpoint_descriptor`, verbatim USB wire format (7 bytes),
/// passed to `USB_RAW_IOCTL_EP_ENABLE`.
#[repr(C)]
pub struct RawEndpointDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub b_endpoint_address: u8,
    pub bm_attributes: u8,
    pub w_max_packet_size: u16,
    pub b_interval: u8,
}

// USB_RAW_IOCTL_EP_ENABLE is _IOW, but the kernel hands back the
// allocated endpoint handle as the ioctl's own return value rather
// than writing it into the structure, so the generated function's
// `Ok(result)` *is* the handle.
ioctl_write_ptr!(raw_ep_enable, RAW_IOCTL_TYPE, 5, RawEndpointDescriptor);

const fn ioc(dir: u32, nr: u8, size: usize) -> nix::libc::c_ulong {
    const NRBITS: u32 = 8;
    const TYPEBITS: u32 = 8;
    const SIZEBITS: u32 = 14;
    let typeshift = NRBITS;
    let sizeshift = typeshift + TYPEBITS;
    let dirshift = sizeshift + SIZEBITS;
    ((dir << dirshift)
        | ((RAW_IOCTL_TYPE as u32) << typeshift)
        | ((nr as u32) << 0)
        | ((size as u32) << sizeshift)) as nix::libc::c_ulong
}

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;
const IOC_READWRITE: u32 = 3;

const EVENT_FETCH_NR: u8 = 2;
const EP0_WRITE_NR: u8 = 3;
const EP0_READ_NR: u8 = 4;
const EP_WRITE_NR: u8 = 7;
const EP_READ_NR: u8 = 8;

/// Issues `USB_RAW_IOCTL_EVENT_FETCH`, filling `buf` (header + inline
/// data) and returning `(event_type, data_len)`.
pub fn event_fetch(fd: RawFd, buf: &mut [u8]) -> io::Result<(u32, usize)> {
    let request = ioc(IOC_READ, EVENT_FETCH_NR, std::mem::size_of::<RawEventHeader>());
    raw_ioctl(fd, request, buf.as_mut_ptr())?;
    let event_type = u32::from_ne_bytes(buf[0..4].try_into().unwrap());
    let length = u32::from_ne_bytes(buf[4..8].try_into().unwrap()) as usize;
    Ok((event_type, length))
}

pub fn ep0_write(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let request = ioc(IOC_WRITE, EP0_WRITE_NR, std::mem::size_of::<RawEpIoHeader>());
    raw_ioctl(fd, request, buf.as_mut_ptr())
}

pub fn ep0_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let request = ioc(IOC_READWRITE, EP0_READ_NR, std::mem::size_of::<RawEpIoHeader>());
    raw_ioctl(fd, request, buf.as_mut_ptr())
}

pub fn ep_write(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let request = ioc(IOC_WRITE, EP_WRITE_NR, std::mem::size_of::<RawEpIoHeader>());
    raw_ioctl(fd, request, buf.as_mut_ptr())
}

pub fn ep_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let request = ioc(IOC_READWRITE, EP_READ_NR, std::mem::size_of::<RawEpIoHeader>());
    raw_ioctl(fd, request, buf.as_mut_ptr())
}

/// Raw `ioctl(2)` call returning the kernel's non-negative result (the
/// byte count for I/O ioctls) as `usize`, or the `errno` as an `io::Error`.
fn raw_ioctl(fd: RawFd, request: nix::libc::c_ulong, buf: *mut u8) -> io::Result<usize> {
    let ret = unsafe { nix::libc::ioctl(fd, request as _, buf) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}
