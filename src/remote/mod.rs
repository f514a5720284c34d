//! Remote Source Adapter: the structured county records service.
//!
//! `RemoteSource` is the seam the orchestrator and scheduler depend on;
//! `HttpRemoteSource` is the production implementation (bearer auth, token
//! bucket with adaptive throttling, shared backoff policy).

mod client;
pub mod normalize;

use async_trait::async_trait;

use crate::error_handling::{ConstructionError, SourceError};
use crate::models::{Apn, DataKind, NormalizedPayload};

pub use client::HttpRemoteSource;

#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Fetches one data kind for one parcel.
    ///
    /// Kinds for which `supports` is false return `Unsupported` without any
    /// network traffic.
    async fn fetch(&self, apn: &Apn, kind: DataKind) -> Result<NormalizedPayload, SourceError>;

    fn supports(&self, kind: DataKind) -> bool;

    /// Checks that the adapter is usable (endpoint and credentials present).
    fn validate(&self) -> Result<(), ConstructionError>;

    /// Current request rate, when the adapter is throttled.
    fn current_rps(&self) -> Option<u32> {
        None
    }
}
