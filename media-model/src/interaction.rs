use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum InteractionKind {
    Play,
    Pause,
    Finish,
    Skip,
    Rate,
}

/// An append-only signal used as input to recommendation scoring. Never
/// mutated or deleted once recorded.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Interaction {
    pub user_id: Uuid,
    pub media_id: Uuid,
    pub kind: InteractionKind,
    pub score: f64,
    pub at: DateTime<Utc>,
}

impl Interaction {
    pub fn new(user_id: Uuid, media_id: Uuid, kind: InteractionKind, score: f64) -> Self {
        Self {
            user_id,
            media_id,
            kind,
            score,
            at: Utc::now(),
        }
    }
}
