//! Address parsing and wire framing shared by every `mesh-node` crate.

pub mod address;
pub mod error;
pub mod frame;
pub mod message;

pub use error::Error;
