//! Built-in Output-capability plugin: writes `feed.xml`.

use std::collections::HashSet;
use std::path::Path;

use crate::error::BuildError;
use crate::feed::render_feed;
use crate::registry::{Capability, PluginDescriptor};
use crate::site::{Post, SiteConfig};

use super::Plugin;

/// Writes the RSS feed. Output plugins run sequentially and must not read
/// other plugins' outputs; this one only writes `feed.xml`.
pub struct FeedPlugin {
    descriptor: PluginDescriptor,
    config: SiteConfig,
}

impl FeedPlugin {
    /// Create the plugin bound to the site configuration it renders from.
    #[must_use]
    pub fn new(config: SiteConfig) -> Self {
        Self {
            descriptor: PluginDescriptor {
                name: "core.feed".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                priority: 10,
                capabilities: HashSet::from([Capability::Output]),
            },
            config,
        }
    }
}

impl Plugin for FeedPlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    fn generate(&self, posts: &[Post], output_dir: &Path) -> Result<(), BuildError> {
        let path = output_dir.join("feed.xml");
        std::fs::write(&path, render_feed(&self.config, posts)).map_err(|e| BuildError::io(&path, e))
    }
}
