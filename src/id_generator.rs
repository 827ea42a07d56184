use std::collections::VecDeque;

use tracing::debug;

use crate::error::{OdmError, Result};
use crate::metadata::ClassMetadata;
use crate::store::DocumentStore;

/// Supplies the identifier of a document entering the managed state.
pub trait IdGenerator {
    /// `current` is the identifier already set on the object, if any.
    fn generate(
        &mut self,
        class: &ClassMetadata,
        current: Option<&str>,
        store: &dyn DocumentStore,
    ) -> Result<String>;
}

/// Uses the identifier set by the application.
#[derive(Debug, Default)]
pub struct AssignedIdGenerator;

impl IdGenerator for AssignedIdGenerator {
    fn generate(
        &mut self,
        class: &ClassMetadata,
        current: Option<&str>,
        _store: &dyn DocumentStore,
    ) -> Result<String> {
        match current {
            Some(id) if !id.is_empty() => Ok(id.to_string()),
            _ => Err(OdmError::MissingAssignedIdentifier {
                class: class.name().to_string(),
            }),
        }
    }
}

/// Hands out identifiers fetched from the store in batches.
///
/// An identifier already present on the object is kept.
#[derive(Debug)]
pub struct StoreBatchIdGenerator {
    batch_size: usize,
    pool: VecDeque<String>,
}

impl StoreBatchIdGenerator {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            pool: VecDeque::new(),
        }
    }

    /// Identifiers fetched but not handed out yet.
    pub fn remaining(&self) -> usize {
        self.pool.len()
    }
}

impl Default for StoreBatchIdGenerator {
    fn default() -> Self {
        Self::new(20)
    }
}

impl IdGenerator for StoreBatchIdGenerator {
    fn generate(
        &mut self,
        _class: &ClassMetadata,
        current: Option<&str>,
        store: &dyn DocumentStore,
    ) -> Result<String> {
        if let Some(id) = current.filter(|id| !id.is_empty()) {
            return Ok(id.to_string());
        }
        if self.pool.is_empty() {
            let fresh = store.generate_identifiers(self.batch_size)?;
            debug!(count = fresh.len(), "fetched identifier batch");
            self.pool.extend(fresh);
        }
        self.pool.pop_front().ok_or(OdmError::Transport {
            status: 500,
            reason: "store returned no identifiers".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryDocumentStore;

    #[derive(Default)]
    struct Thing {
        id: Option<String>,
    }

    fn meta() -> ClassMetadata {
        ClassMetadata::document::<Thing>("Thing")
            .identifier(|t| &t.id, |t| &mut t.id)
            .build()
            .unwrap()
    }

    #[test]
    fn assigned_requires_an_identifier() {
        let store = InMemoryDocumentStore::new();
        let mut generator = AssignedIdGenerator;
        assert_eq!(generator.generate(&meta(), Some("t1"), &store).unwrap(), "t1");
        assert!(matches!(
            generator.generate(&meta(), Some(""), &store),
            Err(OdmError::MissingAssignedIdentifier { class }) if class == "Thing"
        ));
        assert!(generator.generate(&meta(), None, &store).is_err());
    }

    #[test]
    fn store_batch_amortizes_round_trips() {
        let store = InMemoryDocumentStore::new();
        let mut generator = StoreBatchIdGenerator::new(3);
        let meta = meta();

        let ids: Vec<String> = (0..4)
            .map(|_| generator.generate(&meta, None, &store).unwrap())
            .collect();
        assert_eq!(store.identifier_requests(), 2);
        assert_eq!(generator.remaining(), 2);
        assert_eq!(ids.len(), 4);
        assert!(ids.iter().all(|id| !id.is_empty()));
    }

    #[test]
    fn store_batch_keeps_preset_identifier() {
        let store = InMemoryDocumentStore::new();
        let mut generator = StoreBatchIdGenerator::default();
        assert_eq!(generator.generate(&meta(), Some("mine"), &store).unwrap(), "mine");
        assert_eq!(store.identifier_requests(), 0);
    }
}
