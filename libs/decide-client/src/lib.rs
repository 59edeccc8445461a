mod client;
mod result;

pub use client::Client;
pub use result::{Error, Result};
