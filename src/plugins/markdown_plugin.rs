//! Built-in Content-capability plugin: Markdown to HTML.

use std::collections::HashSet;

use crate::error::BuildError;
use crate::markdown::{render_markdown, MarkdownOptions};
use crate::registry::{Capability, PluginDescriptor};
use crate::site::Post;

use super::Plugin;

/// Converts a post's raw Markdown body to HTML. Runs first in the content
/// stage (priority 0) so later content plugins operate on HTML, not
/// Markdown source.
pub struct MarkdownPlugin {
    descriptor: PluginDescriptor,
    options: MarkdownOptions,
}

impl MarkdownPlugin {
    /// Create the plugin with the given rendering options.
    #[must_use]
    pub fn new(options: MarkdownOptions) -> Self {
        Self {
            descriptor: PluginDescriptor {
                name: "core.markdown".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                priority: 0,
                capabilities: HashSet::from([Capability::Content]),
            },
            options,
        }
    }
}

impl Plugin for MarkdownPlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    fn transform_content(&self, _post: &Post, body: Vec<u8>) -> Result<Vec<u8>, BuildError> {
        let markdown = String::from_utf8(body).map_err(|_| BuildError::Plugin {
            name: self.descriptor.name.clone(),
            reason: "body is not valid UTF-8".to_string(),
        })?;
        Ok(render_markdown(&markdown, self.options).into_bytes())
    }
}
