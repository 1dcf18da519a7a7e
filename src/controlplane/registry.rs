//! Controller Registry
//!
//! Static mapping from a controller's name to its entry point. Selection
//! against an [`EnableList`] yields the controllers to launch in the order the
//! operator asked for them.

use super::selector::EnableList;
use crate::domain::ports::Controller;
use crate::error::{Error, Result};
use std::sync::Arc;
use tracing::debug;

/// A registered controller
#[derive(Clone)]
pub struct RegistryEntry {
    /// Name used in `--controllers`
    pub name: String,
    /// Entry point
    pub controller: Arc<dyn Controller>,
}

impl std::fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("name", &self.name)
            .field("controller", &"<controller>")
            .finish()
    }
}

/// Registry of controllers the host can run
#[derive(Default)]
pub struct ControllerRegistry {
    entries: Vec<RegistryEntry>,
}

impl ControllerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a controller under `name`. Names are unique.
    pub fn register(&mut self, name: impl Into<String>, controller: Arc<dyn Controller>) -> Result<()> {
        let name = name.into();
        if self.contains(&name) {
            return Err(Error::ControllerAlreadyRegistered { name });
        }
        debug!(controller = %name, "registered controller");
        self.entries.push(RegistryEntry { name, controller });
        Ok(())
    }

    /// Whether `name` is registered
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }

    /// Registered names in registration order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve the enable-list into controllers to launch, in enable-list order.
    ///
    /// Fails on the first unregistered name, or when nothing was requested.
    pub fn select(&self, enabled: &EnableList) -> Result<Vec<RegistryEntry>> {
        let mut selected = Vec::with_capacity(enabled.len());

        for name in enabled.names() {
            let entry = self
                .entries
                .iter()
                .find(|e| &e.name == name)
                .ok_or_else(|| Error::UnknownController {
                    name: name.clone(),
                    known: self.known(),
                })?;
            selected.push(entry.clone());
        }

        if selected.is_empty() {
            return Err(Error::EmptySelection { known: self.known() });
        }
        Ok(selected)
    }

    fn known(&self) -> String {
        self.names().collect::<Vec<_>>().join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{controller_fn, ControllerContext};
    use assert_matches::assert_matches;

    fn idle() -> Arc<dyn Controller> {
        controller_fn(|ctx: ControllerContext| async move {
            ctx.cancelled().await;
            Ok::<(), Error>(())
        })
    }

    fn registry() -> ControllerRegistry {
        let mut registry = ControllerRegistry::new();
        registry.register("attacher", idle()).unwrap();
        registry.register("provisioner", idle()).unwrap();
        registry.register("resizer", idle()).unwrap();
        registry
    }

    fn selected_names(entries: &[RegistryEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.name.as_str()).collect()
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut registry = registry();
        assert_matches!(
            registry.register("attacher", idle()),
            Err(Error::ControllerAlreadyRegistered { name }) if name == "attacher"
        );
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_select_uses_enable_list_order() {
        let registry = registry();
        let selected = registry.select(&EnableList::parse("resizer,attacher")).unwrap();
        assert_eq!(selected_names(&selected), ["resizer", "attacher"]);
    }

    #[test]
    fn test_select_every_subset() {
        let registry = registry();
        let all = ["attacher", "provisioner", "resizer"];

        for mask in 1u8..8 {
            let subset: Vec<&str> = all
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, n)| *n)
                .collect();

            let selected = registry.select(&EnableList::parse(&subset.join(","))).unwrap();
            assert_eq!(selected_names(&selected), subset);
        }
    }

    #[test]
    fn test_select_empty() {
        let registry = registry();
        assert_matches!(
            registry.select(&EnableList::parse(" ")),
            Err(Error::EmptySelection { .. })
        );
    }

    #[test]
    fn test_select_unknown_name() {
        let registry = registry();
        assert_matches!(
            registry.select(&EnableList::parse("attacher,bogus")),
            Err(Error::UnknownController { name, .. }) if name == "bogus"
        );
    }
}
