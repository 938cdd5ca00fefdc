//! Built-in Output-capability plugin: writes `sitemap.xml`.

use std::collections::HashSet;
use std::path::Path;

use crate::error::BuildError;
use crate::registry::{Capability, PluginDescriptor};
use crate::site::{Post, SiteConfig};
use crate::sitemap::render_sitemap;

use super::Plugin;

/// Writes the XML sitemap.
pub struct SitemapPlugin {
    descriptor: PluginDescriptor,
    config: SiteConfig,
}

impl SitemapPlugin {
    /// Create the plugin bound to the site configuration it renders from.
    #[must_use]
    pub fn new(config: SiteConfig) -> Self {
        Self {
            descriptor: PluginDescriptor {
                name: "core.sitemap".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                priority: 20,
                capabilities: HashSet::from([Capability::Output]),
            },
            config,
        }
    }
}

impl Plugin for SitemapPlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    fn generate(&self, posts: &[Post], output_dir: &Path) -> Result<(), BuildError> {
        let path = output_dir.join("sitemap.xml");
        std::fs::write(&path, render_sitemap(&self.config, posts)).map_err(|e| BuildError::io(&path, e))
    }
}
