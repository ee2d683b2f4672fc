//! Host gadget port (C2): drives `/dev/raw-gadget` so the real host
//! sees a controllable, proxy-owned device in place of the peripheral.

mod ioctl;

use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsFd, AsRawFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;

#[cfg(test)]
use mockall::automock;

use crate::descriptors::EndpointDescriptor;
use crate::error::{ProxyError, Result};
use crate::proto::SetupPacket;
use crate::queue::Shutdown;

pub use ioctl::Speed;

const EP_IO_HEADER_LEN: usize = 6;

pub type EpHandle = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Connect,
    Reset,
    Disconnect,
    ControlSetup(SetupPacket),
    Suspend,
    Resume,
}

pub enum EpReadOutcome {
    Data(Vec<u8>),
    Halted,
    Shutdown,
}

pub enum EpWriteOutcome {
    Ok,
    Halted,
    Shutdown,
}

/// Abstraction over the raw-gadget character device, so `control.rs`
/// and `pipeline.rs` can be driven against a `mockall` fake in tests
/// (grounded on `cotton-usb-host::host_controller::HostController`,
/// which is abstracted the same way for the same reason).
#[cfg_attr(test, automock)]
pub trait GadgetPort: Send + Sync {
    fn event_fetch(&self) -> Result<Event>;
    fn ep0_read(&self, max_len: usize) -> Result<Vec<u8>>;
    fn ep0_write(&self, data: &[u8]) -> Result<()>;
    fn ep0_stall(&self) -> Result<()>;
    fn ep_enable(&self, descriptor: &EndpointDescriptor) -> Result<EpHandle>;
    fn ep_disable(&self, handle: EpHandle) -> Result<()>;
    fn ep_read(&self, handle: EpHandle, max_len: usize, timeout: Duration) -> Result<EpReadOutcome>;
    fn ep_write(&self, handle: EpHandle, data: &[u8], timeout: Duration) -> Result<EpWriteOutcome>;
    fn ep_set_halt(&self, handle: EpHandle) -> Result<()>;
    fn ep_clear_halt(&self, handle: EpHandle) -> Result<()>;
}

/// Live implementation backed by an open `/dev/raw-gadget` fd.
pub struct RawGadget {
    file: File,
    shutdown: Shutdown,
    poll_timeout: Duration,
}

impl RawGadget {
    pub const DEVICE_PATH: &'static str = "/dev/raw-gadget";

    /// Opens the device, initializes it with the given driver/device
    /// name pair and speed, and starts the controller running so the
    /// host can begin enumeration (spec §4.2 `init`).
    ///
    /// `poll_timeout` bounds how long `event_fetch`/`ep_read` block
    /// between shutdown-flag rechecks; it must stay at or under the
    /// caller's cancellation grace window for shutdown to be prompt.
    pub fn init(
        driver_name: &str,
        device_name: &str,
        speed: Speed,
        shutdown: Shutdown,
        poll_timeout: Duration,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(Self::DEVICE_PATH)
            .map_err(|e| ProxyError::GadgetInit(format!("opening {}: {}", Self::DEVICE_PATH, e)))?;
        let fd = file.as_raw_fd();

        let init = ioctl::RawInit::new(driver_name, device_name, speed);
        unsafe { ioctl::raw_init(fd, &init) }.map_err(|e| ProxyError::GadgetIoctl("INIT", e))?;
        unsafe { ioctl::raw_run(fd) }.map_err(|e| ProxyError::GadgetIoctl("RUN", e))?;

        Ok(RawGadget { file, shutdown, poll_timeout })
    }

    /// Tells the controller pullup is complete and the configuration
    /// is live (`USB_RAW_IOCTL_CONFIGURE`); called once the host has
    /// successfully set a non-zero configuration.
    pub fn configure(&self) -> Result<()> {
        let fd = self.fd();
        unsafe { ioctl::raw_configure(fd) }.map_err(|e| ProxyError::GadgetIoctl("CONFIGURE", e))?;
        Ok(())
    }

    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Blocks (subject to shutdown polling) until the fd is readable.
    /// Returns `Ok(false)` if shutdown fired first.
    fn wait_readable(&self, timeout: Duration) -> Result<bool> {
        use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
        loop {
            if self.shutdown.is_signaled() {
                return Ok(false);
            }
            let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
            let timeout_ms = PollTimeout::from(timeout.as_millis().min(u16::MAX as u128) as u16);
            match poll(&mut fds, timeout_ms) {
                Ok(0) => continue,
                Ok(_) => return Ok(true),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(ProxyError::GadgetIoctl("poll", e)),
            }
        }
    }
}

impl GadgetPort for RawGadget {
    fn event_fetch(&self) -> Result<Event> {
        loop {
            if !self.wait_readable(self.poll_timeout)? {
                return Err(ProxyError::Disconnected);
            }
            let mut buf = vec![0u8; 8 + ioctl::MAX_INLINE_PAYLOAD];
            let (event_type, length) =
                ioctl::event_fetch(self.fd(), &mut buf).map_err(|e| wrap_io(e, "EVENT_FETCH"))?;

            let event = match ioctl::RawEventType::from_raw(event_type) {
                ioctl::RawEventType::Invalid => continue,
                ioctl::RawEventType::Connect => Event::Connect,
                ioctl::RawEventType::Reset => Event::Reset,
                ioctl::RawEventType::Disconnect => Event::Disconnect,
                ioctl::RawEventType::Suspend => Event::Suspend,
                ioctl::RawEventType::Resume => Event::Resume,
                ioctl::RawEventType::Control => {
                    if length < 8 {
                        return Err(ProxyError::GadgetInit("truncated control event".into()));
                    }
                    let data = &buf[8..16];
                    Event::ControlSetup(SetupPacket {
                        bmRequestType: data[0],
                        bRequest: data[1],
                        wValue: u16::from_le_bytes([data[2], data[3]]),
                        wIndex: u16::from_le_bytes([data[4], data[5]]),
                        wLength: u16::from_le_bytes([data[6], data[7]]),
                    })
                }
            };
            return Ok(event);
        }
    }

    fn ep0_read(&self, max_len: usize) -> Result<Vec<u8>> {
        let mut buf = build_ep_io_buf(0, 0, &vec![0u8; max_len]);
        let n = ioctl::ep0_read(self.fd(), &mut buf).map_err(|e| wrap_io(e, "EP0_READ"))?;
        Ok(buf[EP_IO_HEADER_LEN..EP_IO_HEADER_LEN + n].to_vec())
    }

    fn ep0_write(&self, data: &[u8]) -> Result<()> {
        let flags = if data.is_empty() { ioctl::USB_RAW_IO_FLAGS_ZERO } else { 0 };
        let mut buf = build_ep_io_buf(0, flags, data);
        ioctl::ep0_write(self.fd(), &mut buf).map_err(|e| wrap_io(e, "EP0_WRITE"))?;
        Ok(())
    }

    fn ep0_stall(&self) -> Result<()> {
        // raw-gadget stalls EP0 by issuing EP0_WRITE/EP0_READ with the
        // halt flag; modelled here as EP_SET_HALT on handle 0.
        unsafe { ioctl::raw_ep_set_halt(self.fd(), 0) }.map_err(|e| ProxyError::GadgetIoctl("EP0_STALL", e))?;
        Ok(())
    }

    fn ep_enable(&self, descriptor: &EndpointDescriptor) -> Result<EpHandle> {
        let raw = &descriptor.raw;
        if raw.len() < 7 {
            return Err(ProxyError::Descriptor("endpoint descriptor too short".into()));
        }
        let desc = ioctl::RawEndpointDescriptor {
            b_length: raw[0],
            b_descriptor_type: raw[1],
            b_endpoint_address: raw[2],
            bm_attributes: raw[3],
            w_max_packet_size: u16::from_le_bytes([raw[4], raw[5]]),
            b_interval: raw[6],
        };
        let handle = unsafe { ioctl::raw_ep_enable(self.fd(), &desc) }
            .map_err(|e| ProxyError::GadgetIoctl("EP_ENABLE", e))?;
        Ok(handle as u32)
    }

    fn ep_disable(&self, handle: EpHandle) -> Result<()> {
        unsafe { ioctl::raw_ep_disable(self.fd(), handle as i32) }
            .map_err(|e| ProxyError::GadgetIoctl("EP_DISABLE", e))?;
        Ok(())
    }

    fn ep_read(&self, handle: EpHandle, max_len: usize, timeout: Duration) -> Result<EpReadOutcome> {
        if !self.wait_readable(timeout)? {
            return Ok(EpReadOutcome::Shutdown);
        }
        let mut buf = build_ep_io_buf(handle as u16, 0, &vec![0u8; max_len]);
        match ioctl::ep_read(self.fd(), &mut buf) {
            Ok(n) => Ok(EpReadOutcome::Data(buf[EP_IO_HEADER_LEN..EP_IO_HEADER_LEN + n].to_vec())),
            Err(e) if e.raw_os_error() == Some(Errno::EPIPE as i32) => Ok(EpReadOutcome::Halted),
            Err(e) if is_timeout(&e) => Ok(EpReadOutcome::Data(Vec::new())),
            Err(e) => Err(wrap_io(e, "EP_READ")),
        }
    }

    fn ep_write(&self, handle: EpHandle, data: &[u8], _timeout: Duration) -> Result<EpWriteOutcome> {
        if self.shutdown.is_signaled() {
            return Ok(EpWriteOutcome::Shutdown);
        }
        let flags = if data.is_empty() { ioctl::USB_RAW_IO_FLAGS_ZERO } else { 0 };
        let mut buf = build_ep_io_buf(handle as u16, flags, data);
        match ioctl::ep_write(self.fd(), &mut buf) {
            Ok(_) => Ok(EpWriteOutcome::Ok),
            Err(e) if e.raw_os_error() == Some(Errno::EPIPE as i32) => Ok(EpWriteOutcome::Halted),
            Err(e) => Err(wrap_io(e, "EP_WRITE")),
        }
    }

    fn ep_set_halt(&self, handle: EpHandle) -> Result<()> {
        unsafe { ioctl::raw_ep_set_halt(self.fd(), handle as i32) }
            .map_err(|e| ProxyError::GadgetIoctl("EP_SET_HALT", e))?;
        Ok(())
    }

    fn ep_clear_halt(&self, handle: EpHandle) -> Result<()> {
        unsafe { ioctl::raw_ep_clear_halt(self.fd(), handle as i32) }
            .map_err(|e| ProxyError::GadgetIoctl("EP_CLEAR_HALT", e))?;
        Ok(())
    }
}

fn build_ep_io_buf(ep: u16, flags: u16, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(EP_IO_HEADER_LEN + data.len());
    buf.extend_from_slice(&ep.to_ne_bytes());
    buf.extend_from_slice(&flags.to_ne_bytes());
    buf.extend_from_slice(&(data.len() as u16).to_ne_bytes());
    buf.extend_from_slice(data);
    buf
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(err.raw_os_error(), Some(code) if code == Errno::ETIMEDOUT as i32 || code == Errno::EAGAIN as i32)
}

fn wrap_io(err: std::io::Error, name: &'static str) -> ProxyError {
    let errno = err.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO);
    ProxyError::GadgetIoctl(name, errno)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ep_io_buffer_layout_matches_header() {
        let buf = build_ep_io_buf(3, ioctl::USB_RAW_IO_FLAGS_ZERO, &[1, 2, 3]);
        assert_eq!(u16::from_ne_bytes([buf[0], buf[1]]), 3);
        assert_eq!(u16::from_ne_bytes([buf[2], buf[3]]), ioctl::USB_RAW_IO_FLAGS_ZERO);
        assert_eq!(u16::from_ne_bytes([buf[4], buf[5]]), 3);
        assert_eq!(&buf[6..], &[1, 2, 3]);
    }
}
