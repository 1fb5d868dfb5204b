//! Audio I/O: PCM format, file source and output devices

pub mod device;
pub mod format;
pub mod output;
pub mod simulated;
pub mod source;

pub use device::{AudioDevice, DeviceSession, QueueError, SessionRequest};
pub use format::PcmFormat;
pub use output::CpalDevice;
pub use simulated::{CompletionMode, SimulatedDevice};
pub use source::PcmSource;
