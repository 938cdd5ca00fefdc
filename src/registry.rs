//! Capability-typed plugin registry.
//!
//! Plugins are registered once at startup and the registry becomes
//! immutable for the rest of the process: there is no mutating method
//! after [`PluginRegistry::build`] returns, so the type system (not a
//! runtime flag) enforces the "no mutation during stages" invariant.

use std::collections::{HashMap, HashSet};

use crate::error::BuildError;
use crate::plugins::Plugin;

/// A pipeline stage a plugin can participate in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    /// Content stage: transforms the raw body into rendered HTML.
    Content,
    /// Render stage: pre/post hooks around template rendering.
    Render,
    /// Security stage: sanitises or refuses the rendered body.
    Security,
    /// Build stage: pre-build and post-build hooks.
    Build,
    /// Output stage: writes files directly into the output directory.
    Output,
    /// Asset filesystem stage: participates in static asset handling.
    AssetFS,
}

impl Capability {
    /// Parse a capability name as used in the plugin configuration file
    /// (case-insensitive): `content`, `render`, `security`, `build`,
    /// `output`, `assetfs`.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Configuration`] on an unrecognised name.
    pub fn parse(name: &str) -> Result<Self, BuildError> {
        match name.to_ascii_lowercase().as_str() {
            "content" => Ok(Self::Content),
            "render" => Ok(Self::Render),
            "security" => Ok(Self::Security),
            "build" => Ok(Self::Build),
            "output" => Ok(Self::Output),
            "assetfs" => Ok(Self::AssetFS),
            other => Err(BuildError::Configuration(format!("unknown plugin capability '{other}'"))),
        }
    }
}

/// Static plugin metadata, constructed once at startup.
#[derive(Debug, Clone)]
pub struct PluginDescriptor {
    /// Unique plugin name.
    pub name: String,
    /// Plugin version string.
    pub version: String,
    /// Priority; lower runs first within a stage.
    pub priority: i32,
    /// Advertised capability set.
    pub capabilities: HashSet<Capability>,
}

struct Slot {
    descriptor: PluginDescriptor,
    plugin: Box<dyn Plugin>,
    registration_index: usize,
}

/// Plugin instances grouped by capability, ordered by priority.
///
/// Immutable once built. `register` is only available on the builder;
/// [`PluginRegistry`] itself exposes no mutating methods.
pub struct PluginRegistry {
    slots: Vec<Slot>,
    by_capability: HashMap<Capability, Vec<usize>>,
}

/// Accumulates plugins during startup, then freezes into a [`PluginRegistry`].
#[derive(Default)]
pub struct RegistryBuilder {
    slots: Vec<Slot>,
    seen_names: HashSet<String>,
}

impl RegistryBuilder {
    /// Create an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin. Fatal on duplicate name.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Configuration`] if a plugin with the same name
    /// is already registered.
    pub fn register(&mut self, plugin: Box<dyn Plugin>) -> Result<(), BuildError> {
        let descriptor = plugin.descriptor().clone();
        if !self.seen_names.insert(descriptor.name.clone()) {
            return Err(BuildError::Configuration(format!(
                "duplicate plugin name '{}'",
                descriptor.name
            )));
        }
        let registration_index = self.slots.len();
        self.slots.push(Slot {
            descriptor,
            plugin,
            registration_index,
        });
        Ok(())
    }

    /// Freeze the builder into an immutable registry.
    #[must_use]
    pub fn build(self) -> PluginRegistry {
        let mut by_capability: HashMap<Capability, Vec<usize>> = HashMap::new();
        for (idx, slot) in self.slots.iter().enumerate() {
            for cap in &slot.descriptor.capabilities {
                by_capability.entry(*cap).or_default().push(idx);
            }
        }
        for indices in by_capability.values_mut() {
            indices.sort_by_key(|&idx| {
                let slot = &self.slots[idx];
                (slot.descriptor.priority, slot.registration_index)
            });
        }
        PluginRegistry {
            slots: self.slots,
            by_capability,
        }
    }
}

impl PluginRegistry {
    /// Plugins advertising `capability`, sorted by priority ascending, ties
    /// broken by registration order.
    #[must_use]
    pub fn by_capability(&self, capability: Capability) -> Vec<&dyn Plugin> {
        self.by_capability
            .get(&capability)
            .into_iter()
            .flatten()
            .map(|&idx| self.slots[idx].plugin.as_ref())
            .collect()
    }

    /// All registered descriptors, in registration order (for `--list-plugins`).
    #[must_use]
    pub fn descriptors(&self) -> Vec<&PluginDescriptor> {
        self.slots.iter().map(|s| &s.descriptor).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_parse_is_case_insensitive() {
        assert_eq!(Capability::parse("Content").unwrap(), Capability::Content);
        assert_eq!(Capability::parse("OUTPUT").unwrap(), Capability::Output);
    }

    #[test]
    fn capability_parse_rejects_unknown() {
        assert!(Capability::parse("bogus").is_err());
    }
}
