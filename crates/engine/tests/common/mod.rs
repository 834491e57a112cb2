pub mod mocks;

#[allow(unused_imports)]
pub use mocks::{Call, CountingIssuer, ScriptedClient};

use keepsake_core::{EndpointList, EndpointSet, EngineConfig, Identity, IdentityMethod};
use keepsake_engine::{BlobTransferEngine, ManualClock};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::time::Duration;

#[allow(dead_code)]
pub const A: &str = "https://a.example.com";
#[allow(dead_code)]
pub const B: &str = "https://b.example.com";
#[allow(dead_code)]
pub const C: &str = "https://c.example.com";

#[allow(dead_code)]
pub fn identity() -> Identity {
    Identity::new("a".repeat(64), IdentityMethod::LocalKey)
}

#[allow(dead_code)]
pub fn endpoints(urls: &[&str]) -> EndpointList {
    EndpointSet::normalize(urls.iter().copied())
        .into_list()
        .expect("at least one valid endpoint")
}

/// Config with short, deterministic backoff.
#[allow(dead_code)]
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retry.max_attempts = 3;
    config.retry.base_delay_ms = 10;
    config.retry.max_delay_ms = 40;
    config.retry.jitter = false;
    config
}

/// Engine wired to a scripted fleet, a counting issuer and a frozen clock.
#[allow(dead_code)]
pub struct Harness {
    pub engine: BlobTransferEngine,
    pub client: Arc<ScriptedClient>,
    pub issuer: Arc<CountingIssuer>,
    pub clock: Arc<ManualClock>,
}

#[allow(dead_code)]
impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let clock = Arc::new(ManualClock::new(
            OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
        ));
        let client = ScriptedClient::new();
        let issuer = CountingIssuer::new(clock.clone(), Duration::from_secs(300));
        let engine =
            BlobTransferEngine::new(&config, client.clone(), issuer.clone(), clock.clone())
                .expect("valid test config");

        Self {
            engine,
            client,
            issuer,
            clock,
        }
    }
}
