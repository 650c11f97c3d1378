//! Wire types shared by the transfer engine and the REST client.
//!
//! Every response from the storage API is wrapped in a
//! [`ResponseEnvelope`]; the specifications returned by the upload and
//! download endpoints live in [`types`].

pub mod constants;
pub mod envelope;
pub mod types;

pub use envelope::{EnvelopeError, ResponseEnvelope};
pub use types::{
    Capability, CapabilityEntry, CapabilityFeed, DownloadSpecification, UploadMethod,
    UploadSpecification, UploadSpecificationRequest, UploadedItem,
};
