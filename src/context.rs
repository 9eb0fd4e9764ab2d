use crate::{CommandId, EventId};
use chrono::{DateTime, Utc};

/// Clock and id source threaded through command handling.
///
/// Produces wall-clock timestamps and random unique ids by default; both can
/// be pinned for deterministic tests.
#[derive(Debug, Clone, Default)]
pub struct CqrsContext {
    fixed_now: Option<DateTime<Utc>>,
    rand_bytes: Option<[u8; 16]>,
}

impl CqrsContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.fixed_now.unwrap_or_else(Utc::now)
    }

    /// Pins the clock to a fixed instant.
    ///
    /// ⚠️ **FOR TESTING PURPOSES ONLY** — every event emitted through this
    /// context will carry the same timestamp.
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.fixed_now = Some(now);
        self
    }

    /// Overrides the random bytes used for id generation.
    ///
    /// ⚠️ **FOR TESTING PURPOSES ONLY** — it breaks the uniqueness guarantee
    /// of generated ids. Only use it in test modules where a predictable id
    /// is asserted on.
    ///
    /// ```rust
    /// use cqrs_es_runtime::CqrsContext;
    ///
    /// let context = CqrsContext::new().with_rand_bytes([0; 16]);
    /// // Will always generate: "00000000-0000-4000-8000-000000000000"
    /// let id = context.next_event_id();
    /// ```
    pub fn with_rand_bytes(mut self, bytes: [u8; 16]) -> Self {
        self.rand_bytes = Some(bytes);
        self
    }

    fn next_bytes(&self) -> [u8; 16] {
        if let Some(b) = self.rand_bytes {
            b
        } else {
            rand::random::<[u8; 16]>()
        }
    }

    pub fn next_command_id(&self) -> CommandId {
        CommandId::from_random_bytes(self.next_bytes())
    }

    pub fn next_event_id(&self) -> EventId {
        EventId::from_random_bytes(self.next_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_event_id() {
        let context = CqrsContext::default();
        let a = context.next_event_id();
        let b = context.next_event_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_next_event_id_with_rand_bytes() {
        let context = CqrsContext::default().with_rand_bytes([0; 16]);
        let id = context.next_event_id();
        assert_eq!(id.to_string(), "00000000-0000-4000-8000-000000000000");
    }

    #[test]
    fn test_pinned_clock() {
        let at = Utc::now();
        let context = CqrsContext::default().with_now(at);
        assert_eq!(context.now(), at);
        assert_eq!(context.now(), at);
    }
}
