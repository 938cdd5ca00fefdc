//! Built-in, statically-linked plugins.
//!
//! The spec explicitly rules out dynamic plugin loading across a trust
//! boundary (§9 "Dynamic loading"): first-party transformations are
//! compiled in as [`Plugin`] implementations; third-party transformations
//! run out-of-process through [`crate::sandbox::SandboxedPlugin`], which
//! also implements this trait so the driver (`pipeline.rs`) never needs to
//! know whether a plugin is in-process or sandboxed.

mod feed_plugin;
mod markdown_plugin;
mod sanitize_plugin;
mod sitemap_plugin;

pub use feed_plugin::FeedPlugin;
pub use markdown_plugin::MarkdownPlugin;
pub use sanitize_plugin::SanitizePlugin;
pub use sitemap_plugin::SitemapPlugin;

use std::path::Path;

use crate::error::BuildError;
use crate::headers::PolicyFragment;
use crate::registry::PluginDescriptor;
use crate::site::{Post, RenderContext};

/// A pipeline participant. Every method has a no-op default; a plugin only
/// overrides the hooks for the capabilities it advertises in its
/// [`PluginDescriptor`] — the registry only ever calls a plugin for a stage
/// matching one of its declared capabilities, so unused defaults are never
/// reached.
pub trait Plugin: Send + Sync {
    /// Static descriptor for this plugin instance.
    fn descriptor(&self) -> &PluginDescriptor;

    /// Build-capability hook, run once before content is loaded.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError`] to abort the build.
    fn pre_build(&self, _content_dir: &Path) -> Result<(), BuildError> {
        Ok(())
    }

    /// Content-capability hook. Receives the current working body and
    /// returns its replacement.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError`] to abort the build.
    fn transform_content(&self, _post: &Post, body: Vec<u8>) -> Result<Vec<u8>, BuildError> {
        Ok(body)
    }

    /// Security-capability hook. May refuse (return `Err`) or normalise.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError`] to abort the build.
    fn transform_security(&self, _post: &Post, body: Vec<u8>) -> Result<Vec<u8>, BuildError> {
        Ok(body)
    }

    /// Security-capability hook contributing to the materialised output
    /// guard / response policy. Returning `None` contributes nothing.
    fn declare_policy(&self) -> Option<PolicyFragment> {
        None
    }

    /// Render-capability hook, run before template rendering.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError`] to abort the build.
    fn pre_render(&self, _ctx: &RenderContext<'_>) -> Result<(), BuildError> {
        Ok(())
    }

    /// Render-capability hook, run on the rendered bytes after templating.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError`] to abort the build.
    fn post_render(&self, bytes: Vec<u8>) -> Result<Vec<u8>, BuildError> {
        Ok(bytes)
    }

    /// Output-capability hook. Writes files directly; must not read other
    /// plugins' outputs.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError`] to abort the build.
    fn generate(&self, _posts: &[Post], _output_dir: &Path) -> Result<(), BuildError> {
        Ok(())
    }

    /// Build-capability hook, run once after the output tree is complete.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError`] to abort the build.
    fn post_build(&self, _output_dir: &Path) -> Result<(), BuildError> {
        Ok(())
    }
}
