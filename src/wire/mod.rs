//! Wire protocol: framing, message types and request correlation

pub mod codec;
pub mod router;
pub mod types;

pub use router::Router;
pub use types::{Request, Response};
