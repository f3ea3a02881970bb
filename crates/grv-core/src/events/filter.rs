//! Project-based event filtering.

use crate::config::FilterConfig;

use super::GerritEvent;

/// Decides whether an incoming event should produce a review task.
///
/// Pure and stateless: only `patchset-created` events with complete change
/// and patchset sections pass, subject to the configured allow/deny lists.
/// Denial wins over allow.
#[derive(Debug, Clone)]
pub struct EventFilter {
    config: FilterConfig,
}

impl EventFilter {
    /// Creates a filter from the serve configuration.
    #[must_use]
    pub fn new(config: FilterConfig) -> Self {
        Self { config }
    }

    /// Returns true if the event should be processed.
    #[must_use]
    pub fn accepts(&self, event: &GerritEvent) -> bool {
        if event.event_type != "patchset-created" {
            return false;
        }
        let Some(change) = &event.change else {
            return false;
        };
        if event.patch_set.is_none() {
            return false;
        }

        let project = change.project.as_str();
        if self.config.deny.iter().any(|d| d.trim() == project) {
            return false;
        }
        if self.config.allow.is_empty() {
            return true;
        }
        self.config.allow.iter().any(|a| a.trim() == project)
    }
}
