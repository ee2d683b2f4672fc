use failure_derive::Fail;

/// Errors surfaced by the proxy engine.
///
/// Mirrors the flat, `#[cause]`-chained shape of `ffp`'s `FFPError`,
/// generalized from one hardcoded USB device to an arbitrary peripheral
/// and an arbitrary raw-gadget instance.
#[derive(Fail, Debug)]
pub enum ProxyError {
    #[fail(display = "USB transport error: {}", _0)]
    Usb(#[cause] rusb::Error),

    #[fail(display = "I/O error: {}", _0)]
    Io(#[cause] std::io::Error),

    #[fail(display = "malformed injection rule file: {}", _0)]
    RuleSyntax(#[cause] serde_json::Error),

    #[fail(display = "invalid injection rule: {}", _0)]
    RuleInvalid(String),

    #[fail(display = "no device found for vendor={:#06x} product={:#06x}", vendor_id, product_id)]
    DeviceNotFound { vendor_id: u16, product_id: u16 },

    #[fail(display = "raw-gadget ioctl '{}' failed: {}", _0, _1)]
    GadgetIoctl(&'static str, #[cause] nix::errno::Errno),

    #[fail(display = "gadget initialization failed: {}", _0)]
    GadgetInit(String),

    #[fail(display = "descriptor error: {}", _0)]
    Descriptor(String),

    #[fail(display = "device disconnected")]
    Disconnected,
}

impl From<rusb::Error> for ProxyError {
    fn from(error: rusb::Error) -> Self {
        ProxyError::Usb(error)
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(error: std::io::Error) -> Self {
        ProxyError::Io(error)
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(error: serde_json::Error) -> Self {
        ProxyError::RuleSyntax(error)
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
