use std::collections::BTreeSet;

use super::{DropReason, EventFilter, Verdict};
use crate::event::FocusEvent;

/// Include/exclude predicate over app identifiers and names.
#[derive(Clone, Debug, Default)]
pub struct AppScope {
    /// When non-empty, only these apps pass.
    included: BTreeSet<String>,
    /// These apps never pass.
    excluded: BTreeSet<String>,
}

impl AppScope {
    /// Build a scope from include and exclude lists.
    pub fn new(included: BTreeSet<String>, excluded: BTreeSet<String>) -> Self {
        Self { included, excluded }
    }

    /// Whether `event` belongs to a tracked app.
    pub fn allows(&self, event: &FocusEvent) -> bool {
        let names = [event.app_identifier.as_deref(), Some(event.app_name.as_str())];
        let hit = |set: &BTreeSet<String>| names.iter().flatten().any(|n| set.contains(*n));
        if hit(&self.excluded) {
            return false;
        }
        self.included.is_empty() || hit(&self.included)
    }
}

impl EventFilter for AppScope {
    fn name(&self) -> &'static str {
        "app_scope"
    }

    fn check(&mut self, event: &FocusEvent) -> Verdict {
        if self.allows(event) {
            Verdict::Keep
        } else {
            Verdict::Drop(DropReason::OutOfScope)
        }
    }

    fn clear(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn exclusion_matches_identifier_or_name() {
        let scope = AppScope::new(BTreeSet::new(), set(&["com.apple.finder"]));
        let mut ev = FocusEvent::new("Finder", EventType::Gained, 0, 0);
        assert!(scope.allows(&ev));
        ev.app_identifier = Some("com.apple.finder".into());
        assert!(!scope.allows(&ev));
    }

    #[test]
    fn inclusion_limits_to_listed_apps() {
        let mut scope = AppScope::new(set(&["Editor"]), set(&[]));
        let editor = FocusEvent::new("Editor", EventType::Gained, 0, 0);
        let chat = FocusEvent::new("Chat", EventType::Gained, 0, 0);
        assert_eq!(scope.check(&editor), Verdict::Keep);
        assert_eq!(scope.check(&chat), Verdict::Drop(DropReason::OutOfScope));
    }

    #[test]
    fn exclusion_beats_inclusion() {
        let scope = AppScope::new(set(&["Editor"]), set(&["Editor"]));
        assert!(!scope.allows(&FocusEvent::new("Editor", EventType::Gained, 0, 0)));
    }
}
