//! Per-project runtime: configuration plus the project's allocator.
//!
//! Built once at startup and shared read-only afterwards.

use std::collections::BTreeMap;
use std::sync::Arc;

use atrium_booking::BookingAllocator;
use atrium_core::config::ProjectConfig;
use atrium_core::types::ProjectId;

pub struct ProjectEntry {
    pub config: ProjectConfig,
    pub allocator: Arc<BookingAllocator>,
}

#[derive(Default)]
pub struct ProjectRegistry {
    projects: BTreeMap<ProjectId, Arc<ProjectEntry>>,
}

impl ProjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a project, replacing any previous entry with the same id.
    pub fn insert(&mut self, config: ProjectConfig, allocator: Arc<BookingAllocator>) {
        let id = ProjectId::from(config.project_id.as_str());
        self.projects
            .insert(id, Arc::new(ProjectEntry { config, allocator }));
    }

    pub fn get(&self, project_id: &ProjectId) -> Option<Arc<ProjectEntry>> {
        self.projects.get(project_id).cloned()
    }

    pub fn contains(&self, project_id: &ProjectId) -> bool {
        self.projects.contains_key(project_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ProjectId, &Arc<ProjectEntry>)> {
        self.projects.iter()
    }

    pub fn len(&self) -> usize {
        self.projects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::salon;
    use atrium_booking::EventFeed;
    use atrium_core::journal::{BookingJournal, MemoryJournal};

    #[test]
    fn test_insert_and_lookup() {
        let allocator = Arc::new(
            BookingAllocator::new(
                &salon(),
                30,
                Arc::new(MemoryJournal::new()) as Arc<dyn BookingJournal>,
                Arc::new(EventFeed::new()),
            )
            .unwrap(),
        );
        let mut registry = ProjectRegistry::new();
        assert!(registry.is_empty());
        registry.insert(salon(), allocator);

        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&ProjectId::from("salon")));
        let entry = registry.get(&ProjectId::from("salon")).unwrap();
        assert_eq!(entry.config.name, "Salon Aurora");
        assert_eq!(entry.allocator.project_id().as_str(), "salon");
        assert!(registry.get(&ProjectId::from("other")).is_none());
    }
}
