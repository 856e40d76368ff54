use async_trait::async_trait;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct EnricherMatch {
    pub external_key: String,
    pub title: String,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnricherHealth {
    Ok,
    Degraded,
}

/// The narrow contract the Enricher Pool consumes for external metadata
/// lookup providers. Rate limiting is applied by the pool, not by the
/// enricher itself — an implementation should assume it may be called as
/// fast as the pool's token bucket allows and no faster.
#[async_trait]
pub trait Enricher: Send + Sync {
    fn id(&self) -> &str;
    async fn search(&self, query: &str) -> Result<Vec<EnricherMatch>>;
    async fn health(&self) -> EnricherHealth;
}
