//! Node location capability.
//!
//! Geolocation itself is performed elsewhere; the core only needs something
//! that can answer "where is this node" (or "unknown") when it registers
//! with the aggregator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Coarse physical location of the node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub country: Option<String>,
    pub city: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Answers where the node is, if known.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    async fn locate(&self) -> Option<Location>;
}

/// Location fixed by configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticLocationProvider {
    location: Option<Location>,
}

impl StaticLocationProvider {
    pub fn new(location: Option<Location>) -> Self {
        Self { location }
    }
}

#[async_trait]
impl LocationProvider for StaticLocationProvider {
    async fn locate(&self) -> Option<Location> {
        self.location.clone()
    }
}
