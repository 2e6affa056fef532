/// Android Open Accessory transport: libusb context, handshake, bulk transfers.
pub mod aoa;
/// Event loop tying the local sockets, the USB descriptors and the codec together.
pub mod bridge;
pub mod endpoints;
pub mod framing;
pub mod poll_set;
pub mod shutdown;

pub use bridge::Bridge;
pub use endpoints::{LocalEndpoints, ModuleConfig};
pub use framing::{Deframer, FrameBuffer, Port};
pub use shutdown::ShutdownToken;
