use async_trait::async_trait;
use media_model::Event;

/// Fire-and-forget typed event emission. The transport (in-process
/// broadcast, message queue, webhook fan-out) is an external concern;
/// `media-core` only ever calls `publish`.
///
/// Implementations must not block the caller on downstream delivery —
/// back-pressure policy (drop, buffer, disconnect slow subscribers) is the
/// implementation's responsibility, not the caller's.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: Event);
}

/// An [`EventPublisher`] that discards everything. Useful as a default for
/// tests and for composition roots that don't wire up a transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventPublisher;

#[async_trait]
impl EventPublisher for NullEventPublisher {
    async fn publish(&self, _event: Event) {}
}
