//! 🏊 The builder pool: one assembler per builder type, per worker, for life.
//!
//! Owned by exactly one worker and never shared, so there's nothing to lock. Builds run
//! on the blocking pool, so the worker takes an assembler out for the length of one
//! build and puts it back afterwards.

use std::collections::HashMap;

use anyhow::{Result, anyhow};
use tracing::debug;

use super::{Assembler, AssemblerBackend};
use crate::job::{BuilderType, IngestDocument};

#[derive(Debug, Default)]
pub(crate) struct BuilderPool {
    builders: HashMap<BuilderType, AssemblerBackend>,
    created: usize,
}

impl BuilderPool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 🎯 The assembler for `builder_type`, created on first ask and reused after that.
    /// The ingest document's template is compiled into it either way.
    pub(crate) fn get_or_create(
        &mut self,
        builder_type: BuilderType,
        document: &IngestDocument,
    ) -> Result<&mut AssemblerBackend> {
        let created = &mut self.created;
        let assembler = self.builders.entry(builder_type).or_insert_with(|| {
            debug!("🏗️ creating the {builder_type} assembler");
            *created += 1;
            AssemblerBackend::for_type(builder_type)
        });
        assembler.prepare(document)?;
        Ok(assembler)
    }

    /// 📤 Like [`BuilderPool::get_or_create`], but hands the assembler over by value.
    /// It comes back through [`BuilderPool::put_back`]. One that never does (its build
    /// panicked) is created afresh on the next ask.
    pub(crate) fn take_out(
        &mut self,
        builder_type: BuilderType,
        document: &IngestDocument,
    ) -> Result<AssemblerBackend> {
        self.get_or_create(builder_type, document)?;
        self.builders
            .remove(&builder_type)
            .ok_or_else(|| anyhow!("💀 the {builder_type} assembler vanished from the pool"))
    }

    pub(crate) fn put_back(&mut self, assembler: AssemblerBackend) {
        self.builders.insert(assembler.builder_type(), assembler);
    }

    /// How many assemblers this pool has ever built.
    pub(crate) fn created(&self) -> usize {
        self.created
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assemblers::tests::ingest_document;
    use serde_json::json;

    #[test]
    fn the_one_where_the_same_type_gets_the_same_assembler() {
        let mut pool = BuilderPool::new();
        let document = ingest_document(BuilderType::NestedRows, json!({"id": "DD:*name"}));

        let first: *const AssemblerBackend = pool
            .get_or_create(BuilderType::NestedRows, &document)
            .unwrap();
        for _ in 0..5 {
            let again: *const AssemblerBackend = pool
                .get_or_create(BuilderType::NestedRows, &document)
                .unwrap();
            assert!(std::ptr::eq(first, again));
        }
        assert_eq!(pool.created(), 1);
        assert_eq!(
            pool.get_or_create(BuilderType::NestedRows, &document)
                .unwrap()
                .builder_type(),
            BuilderType::NestedRows
        );
    }

    #[test]
    fn the_one_where_each_type_gets_its_own() {
        let mut pool = BuilderPool::new();
        let nested = ingest_document(BuilderType::NestedRows, json!({"id": "DD:*name"}));
        let per_row = ingest_document(BuilderType::RowPerDocument, json!({"id": "DD:*name"}));
        pool.get_or_create(BuilderType::NestedRows, &nested).unwrap();
        pool.get_or_create(BuilderType::RowPerDocument, &per_row).unwrap();
        pool.get_or_create(BuilderType::NestedRows, &nested).unwrap();
        assert_eq!(pool.created(), 2);
    }

    #[test]
    fn the_one_where_a_borrowed_assembler_comes_home() {
        let mut pool = BuilderPool::new();
        let document = ingest_document(BuilderType::NestedRows, json!({"id": "DD:*name"}));
        for _ in 0..3 {
            let assembler = pool.take_out(BuilderType::NestedRows, &document).unwrap();
            pool.put_back(assembler);
        }
        assert_eq!(pool.created(), 1);

        // -- one that never comes back gets replaced
        drop(pool.take_out(BuilderType::NestedRows, &document).unwrap());
        pool.take_out(BuilderType::NestedRows, &document).unwrap();
        assert_eq!(pool.created(), 2);
    }

    #[test]
    fn the_one_where_a_bad_template_fails_at_the_door() {
        let mut pool = BuilderPool::new();
        let broken = ingest_document(BuilderType::RowPerDocument, json!({"type": "no id"}));
        assert!(pool.get_or_create(BuilderType::RowPerDocument, &broken).is_err());
    }
}
