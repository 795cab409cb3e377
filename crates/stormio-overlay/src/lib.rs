mod client;
mod error;

pub use client::{build_storm_data, OverlayClient};
pub use error::OverlayError;
