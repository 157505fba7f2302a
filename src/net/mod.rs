//! Network access: request identity and the timed HTTP client.

mod client;
mod request;

pub use client::NetworkClient;
pub use request::{Request, RequestKey, Response};
