#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Shared foundation for the `rp-worker` runtime: environment/endpoint
//! resolution and the authenticated control-plane HTTP client.

pub mod env;
pub mod http;

pub use env::{Env, EnvError};
pub use http::{build_client, user_agent, SDK_VERSION};
