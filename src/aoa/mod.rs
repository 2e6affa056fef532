mod constants;
mod context;
mod device;
mod transport;

pub use context::LibusbContext;
pub use transport::AoaTransport;
