use std::error::Error;
use std::fmt;
use std::io;

/// Error kinds the transport core produces.
///
/// *Protocol* conditions (§7 of the design notes — a guest writing to a
/// read-only register, selecting an out-of-range queue, offering an
/// unsolicited feature bit) are never represented here: the virtio spec
/// permits a device to ignore guest misbehavior, so the decoder absorbs
/// them and logs at `debug!` instead of returning an error.
#[derive(Debug)]
pub enum TransportError {
    /// MMIO registration, IRQ allocation, or device registration failed.
    /// `init` rolls back any partially registered state before returning
    /// this.
    Resource(String),
    /// An MSI route could not be installed after MSI was already
    /// advertised to the guest, or the notification fast path could not be
    /// bound. There is no safe downgrade once the guest has been told the
    /// capability exists.
    Fatal(String),
    /// Propagated failure from an underlying `VmInterface` call.
    Io(io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Resource(msg) => write!(f, "resource error: {}", msg),
            TransportError::Fatal(msg) => write!(f, "fatal transport error: {}", msg),
            TransportError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl Error for TransportError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TransportError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        // EINTR is transient and is retried by the VM interface adapter
        // before it ever reaches us; anything else that surfaces here is a
        // genuine resource failure.
        TransportError::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
