//! A Docker/OCI Registry V2 client for building and publishing container images.
//!
//! [`RegistryClient`] talks to one repository of one registry: it pulls and
//! pushes manifests and blobs, checks for existing blobs, mounts blobs across
//! repositories, and trades credentials for bearer tokens through
//! [`auth::RegistryAuthenticator`].
#![deny(missing_docs)]

pub mod auth;
pub mod blob;
mod caller;
pub mod client;
pub mod config;
pub mod digest;
mod endpoint;
pub mod errors;
pub mod events;
pub mod manifest;
pub mod mount;
mod regexp;
pub mod secrets;
pub mod token;
pub mod types;

#[doc(inline)]
pub use client::RegistryClient;
#[doc(inline)]
pub use config::{ClientConfig, EndpointConfig};
#[doc(inline)]
pub use digest::ContentDigest;
#[doc(inline)]
pub use errors::{RegistryError, Result};
#[doc(inline)]
pub use secrets::{Authorization, RegistryAuth};

#[macro_use]
extern crate lazy_static;
