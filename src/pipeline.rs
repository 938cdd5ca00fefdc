//! Pipeline driver (§4.E): runs the twelve build stages in fixed order.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::{BuildInfo, Config};
use crate::error::BuildError;
use crate::headers::HeaderPolicy;
use crate::integrity::{Manifest, SignatureEnvelope};
use crate::markdown::{self, MarkdownOptions};
use crate::registry::{Capability, PluginRegistry};
use crate::security;
use crate::site::{Post, RenderContext, Site};
use crate::templates;

/// Inputs that do not change for the lifetime of one build.
pub struct BuildInputs<'a> {
    /// Content directory (`content/posts`).
    pub content_dir: &'a Path,
    /// Static asset tree, copied verbatim.
    pub static_dir: &'a Path,
    /// Output directory. Must already exist.
    pub output_dir: &'a Path,
    /// Whether to produce a signed manifest envelope.
    pub sign: bool,
    /// Whether the hermetic runner's kernel-level network namespace
    /// isolation was asserted for this process, as opposed to merely
    /// requested (§4.H). Recorded verbatim into [`BuildInfo`].
    pub network_isolation_asserted: bool,
}

/// Run the full twelve-stage pipeline. Any stage failure aborts the whole
/// build; the output tree is left as-is for inspection.
///
/// # Errors
///
/// Returns the first [`BuildError`] encountered, from whichever stage
/// failed.
pub fn run(registry: &PluginRegistry, config: &Config, thread_pool: &rayon::ThreadPool, inputs: &BuildInputs<'_>) -> Result<BuildInfo, BuildError> {
    use rayon::prelude::*;

    // Stage 1: pre-build.
    info!("stage: pre-build");
    for plugin in registry.by_capability(Capability::Build) {
        plugin.pre_build(inputs.content_dir)?;
    }

    // Stage 2: load.
    info!("stage: load");
    let paths = markdown::enumerate(inputs.content_dir)?;
    let mut posts: Vec<Post> = thread_pool.install(|| paths.par_iter().map(|p| markdown::parse(p)).collect::<Result<Vec<_>, _>>())?;

    let mut seen_slugs = HashSet::new();
    for post in &posts {
        if !seen_slugs.insert(post.slug.clone()) {
            return Err(BuildError::Content {
                path: post.source.clone(),
                reason: format!("slug collision: '{}'", post.slug),
            });
        }
    }

    let site_config = config.site_config();
    let mut site = Site { config: site_config.clone(), posts: std::mem::take(&mut posts) };
    site.sort_posts();
    info!(count = site.posts.len(), "loaded posts");

    // Stage 3: content stage.
    info!("stage: content");
    let markdown_opts = MarkdownOptions { autolink: config.autolink };
    let content_plugins = registry.by_capability(Capability::Content);
    thread_pool.install(|| {
        site.posts.par_iter_mut().try_for_each(|post| -> Result<(), BuildError> {
            let mut body = post.raw_body.clone();
            for plugin in &content_plugins {
                body = plugin.transform_content(post, body)?;
            }
            post.rendered_body = body;
            Ok(())
        })
    })?;
    let _ = markdown_opts; // the built-in Markdown plugin carries its own copy of these options.

    // Stage 4: security stage.
    info!("stage: security");
    let security_plugins = registry.by_capability(Capability::Security);
    thread_pool.install(|| {
        site.posts.par_iter_mut().try_for_each(|post| -> Result<(), BuildError> {
            let mut body = std::mem::take(&mut post.rendered_body);
            for plugin in &security_plugins {
                body = plugin.transform_security(post, body)?;
            }
            post.rendered_body = body;
            Ok(())
        })
    })?;
    let policy_fragments: Vec<_> = security_plugins.iter().filter_map(|p| p.declare_policy()).collect();
    let header_policy = HeaderPolicy::default_policy(&policy_fragments);

    // Stage 5: hash freeze.
    info!("stage: hash-freeze");
    for post in &mut site.posts {
        let mut hasher = Sha256::new();
        hasher.update(&post.rendered_body);
        post.content_hash = Some(hex::encode(hasher.finalize()));
    }

    // Stage 6: render stage.
    info!("stage: render");
    let render_plugins = registry.by_capability(Capability::Render);
    let posts_snapshot = site.posts.clone();
    let rendered_pages: Vec<(String, Vec<u8>)> = thread_pool.install(|| {
        posts_snapshot
            .par_iter()
            .map(|post| -> Result<(String, Vec<u8>), BuildError> {
                let ctx = RenderContext { post: Some(post), site: &site_config, posts: &posts_snapshot };
                for plugin in &render_plugins {
                    plugin.pre_render(&ctx)?;
                }
                let mut bytes = templates::render_post(&site_config, post)?;
                for plugin in &render_plugins {
                    bytes = plugin.post_render(bytes)?;
                }
                security::scan_file(Path::new(&format!("{}.html", post.slug)), &bytes)
                    .map_err(BuildError::Guard)?;
                Ok((post.slug.clone(), bytes))
            })
            .collect::<Result<Vec<_>, _>>()
    })?;

    for (slug, bytes) in &rendered_pages {
        let path = inputs.output_dir.join(format!("{slug}.html"));
        fs::write(&path, bytes).map_err(|e| BuildError::io(&path, e))?;
    }

    {
        let ctx = RenderContext { post: None, site: &site_config, posts: &posts_snapshot };
        for plugin in &render_plugins {
            plugin.pre_render(&ctx)?;
        }
        let mut index_bytes = templates::render_index(&site_config, &posts_snapshot)?;
        for plugin in &render_plugins {
            index_bytes = plugin.post_render(index_bytes)?;
        }
        let index_path = inputs.output_dir.join("index.html");
        fs::write(&index_path, &index_bytes).map_err(|e| BuildError::io(&index_path, e))?;
    }
    site.posts = posts_snapshot;

    // Stage 7: output stage. Sequential: output plugins share the output
    // directory namespace.
    info!("stage: output");
    for plugin in registry.by_capability(Capability::Output) {
        plugin.generate(&site.posts, inputs.output_dir)?;
    }

    // Stage 8: static assets.
    info!("stage: static-assets");
    copy_static_assets(inputs.static_dir, inputs.output_dir)?;

    // Stage 9: headers emit.
    info!("stage: headers");
    header_policy.write(inputs.output_dir)?;

    // Build-info, written ahead of the integrity walk so it is itself
    // covered by the manifest.
    let (workers, workers_derived) = config.workers.resolve();
    let build_info = crate::hermetic::build_info(config, workers, workers_derived, inputs.network_isolation_asserted);
    write_build_info(inputs.output_dir, &build_info)?;

    // Stage 10: integrity.
    info!("stage: integrity");
    let manifest = Manifest::build(inputs.output_dir)?;
    manifest.write(inputs.output_dir)?;
    let envelope = if inputs.sign {
        match load_signing_key(config)? {
            Some(signing_key) => SignatureEnvelope::signed(
                crate::hermetic::build_epoch(),
                crate::hermetic::build_commit(),
                &signing_key,
                manifest.render().as_bytes(),
            ),
            None => {
                warn!("--sign was passed but no signing_key_path is configured; writing an unsigned envelope");
                SignatureEnvelope::unsigned(crate::hermetic::build_epoch(), crate::hermetic::build_commit())
            }
        }
    } else {
        SignatureEnvelope::unsigned(crate::hermetic::build_epoch(), crate::hermetic::build_commit())
    };
    envelope.write(inputs.output_dir)?;

    // Stage 11: guard.
    info!("stage: guard");
    security::run_guard(inputs.output_dir, &header_policy)?;

    // Stage 12: post-build.
    info!("stage: post-build");
    for plugin in registry.by_capability(Capability::Build) {
        plugin.post_build(inputs.output_dir)?;
    }

    Ok(build_info)
}

fn load_signing_key(config: &Config) -> Result<Option<ed25519_dalek::SigningKey>, BuildError> {
    let Some(path) = &config.signing_key_path else {
        return Ok(None);
    };
    let bytes = fs::read(path).map_err(|e| BuildError::io(path, e))?;
    let key_bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| BuildError::Configuration("signing key file must contain exactly 32 bytes".to_string()))?;
    Ok(Some(ed25519_dalek::SigningKey::from_bytes(&key_bytes)))
}

fn write_build_info(output_dir: &Path, info: &BuildInfo) -> Result<(), BuildError> {
    let path = output_dir.join("build-info.json");
    let json = serde_json::to_string_pretty(info)
        .map_err(|e| BuildError::Configuration(format!("failed to serialise build-info: {e}")))?;
    fs::write(&path, json).map_err(|e| BuildError::io(&path, e))
}

/// Copy the static asset tree verbatim, preserving relative paths, with
/// mode 0644 for files and 0755 for directories (§4.E stage 8).
fn copy_static_assets(static_dir: &Path, output_dir: &Path) -> Result<(), BuildError> {
    if !static_dir.exists() {
        return Ok(());
    }
    let mut entries: Vec<_> = WalkDir::new(static_dir).into_iter().filter_map(|e| e.ok()).collect();
    entries.sort_by(|a, b| a.path().cmp(b.path()));

    for entry in entries {
        let relative = entry.path().strip_prefix(static_dir).unwrap_or(entry.path());
        let dest = output_dir.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest).map_err(|e| BuildError::io(&dest, e))?;
            set_mode(&dest, 0o755);
        } else if entry.file_type().is_file() {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|e| BuildError::io(parent, e))?;
            }
            fs::copy(entry.path(), &dest).map_err(|e| BuildError::io(&dest, e))?;
            set_mode(&dest, 0o644);
        }
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = fs::metadata(path) {
        let mut perms = metadata.permissions();
        perms.set_mode(mode);
        let _ = fs::set_permissions(path, perms);
    }
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) {}
