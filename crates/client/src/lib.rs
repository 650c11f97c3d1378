//! REST client for the file-storage API.
//!
//! [`RestClient`] implements the transfer engine's [`HttpExecutor`] and
//! [`TransferApi`] over `reqwest` with Bearer token authentication.
//!
//! [`HttpExecutor`]: cloudshare_transfer::HttpExecutor
//! [`TransferApi`]: cloudshare_transfer::TransferApi

pub mod client;
mod executor;

pub use client::{Error, RestClient};
