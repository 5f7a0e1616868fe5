//! Unique message ids

use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

/// Source of `CALL` unique ids. Ids must be at most 36 characters.
pub trait MessageIdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

/// Random UUID v4 ids (36 characters).
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl MessageIdGenerator for UuidGenerator {
    fn next_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Monotonic `<prefix>-<n>` ids, handy for logs and tests.
#[derive(Debug)]
pub struct SequentialGenerator {
    prefix: String,
    counter: AtomicU64,
}

impl SequentialGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(1),
        }
    }
}

impl MessageIdGenerator for SequentialGenerator {
    fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("{}-{}", self.prefix, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_ids_fit_the_limit() {
        let id = UuidGenerator.next_id();
        assert_eq!(id.len(), 36);
        assert_ne!(id, UuidGenerator.next_id());
    }

    #[test]
    fn sequential_ids() {
        let gen = SequentialGenerator::new("CS");
        assert_eq!(gen.next_id(), "CS-1");
        assert_eq!(gen.next_id(), "CS-2");
    }
}
