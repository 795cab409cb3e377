mod cache;
mod compute;
mod error;
mod facade;
mod fip;
mod identity;
mod image;
mod network;

pub use cache::ProviderCache;
pub use compute::{ComputeApi, FloatingIp, RunServerOpts, Server, ServerDetail};
pub use error::{ClientError, ProvisionError, ProvisionErrorCode};
pub use facade::{ProvisionOptions, ServiceProvision};
pub use fip::{FloatingIpService, PoolFipService, PortFipService, RemediationList};
pub use identity::{authenticate, ServiceEndpoints, Session};
pub use image::{ImageApi, ImageDetail};
pub use network::NetworkApi;
