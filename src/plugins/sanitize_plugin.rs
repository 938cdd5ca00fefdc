//! Built-in Security-capability plugin: allow-list HTML sanitisation.

use std::collections::HashSet;

use crate::error::BuildError;
use crate::registry::{Capability, PluginDescriptor};
use crate::security::sanitize_html;
use crate::site::Post;

use super::Plugin;

/// Runs the rendered body through the allow-list sanitiser (`ammonia`)
/// before the hash-freeze stage. Priority 0: it must run before any
/// security plugin that inspects already-sanitised output.
pub struct SanitizePlugin {
    descriptor: PluginDescriptor,
}

impl Default for SanitizePlugin {
    fn default() -> Self {
        Self {
            descriptor: PluginDescriptor {
                name: "core.sanitize".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                priority: 0,
                capabilities: HashSet::from([Capability::Security]),
            },
        }
    }
}

impl Plugin for SanitizePlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    fn transform_security(&self, _post: &Post, body: Vec<u8>) -> Result<Vec<u8>, BuildError> {
        let html = String::from_utf8(body).map_err(|_| BuildError::Plugin {
            name: self.descriptor.name.clone(),
            reason: "body is not valid UTF-8".to_string(),
        })?;
        Ok(sanitize_html(&html).into_bytes())
    }
}
