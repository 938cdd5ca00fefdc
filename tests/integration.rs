//! End-to-end pipeline tests exercising the concrete scenarios in the
//! design notes: a single post with no plugins, deterministic manifests,
//! slug collisions, output-guard enforcement, and verify-only mode.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use secureblog_rs::config::Config;
use secureblog_rs::error::BuildError;
use secureblog_rs::integrity::Manifest;
use secureblog_rs::markdown::MarkdownOptions;
use secureblog_rs::pipeline::{self, BuildInputs};
use secureblog_rs::plugins::{FeedPlugin, MarkdownPlugin, SanitizePlugin, SitemapPlugin};
use secureblog_rs::plugins::Plugin;
use secureblog_rs::registry::{Capability, PluginDescriptor, RegistryBuilder};
use secureblog_rs::site::Post;

fn test_config() -> Config {
    // Mirrors `config::load_config`'s defaults-when-absent path; built
    // directly to sidestep a filesystem round trip in tests.
    serde_yaml::from_str(
        "title: Test Blog\nurl: https://example.test\nauthor: Tester\nworkers: 2\nautolink: true\n",
    )
    .unwrap()
}

fn write_post(dir: &Path, name: &str, body: &str) {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join(name), body).unwrap();
}

fn base_registry(config: &Config) -> RegistryBuilder {
    let mut builder = RegistryBuilder::new();
    let site_config = config.site_config();
    builder
        .register(Box::new(MarkdownPlugin::new(MarkdownOptions { autolink: config.autolink })))
        .unwrap();
    builder.register(Box::new(SanitizePlugin::default())).unwrap();
    builder.register(Box::new(FeedPlugin::new(site_config.clone()))).unwrap();
    builder.register(Box::new(SitemapPlugin::new(site_config))).unwrap();
    builder
}

#[test]
fn single_post_no_plugins_builds_expected_tree() {
    let content = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_post(&content.path().join("posts"), "hello.md", "# Hello\n");

    let config = test_config();
    let registry = base_registry(&config).build();
    let (pool, _, _) = secureblog_rs::hermetic::build_thread_pool(&config);

    let inputs = BuildInputs {
        content_dir: &content.path().join("posts"),
        static_dir: &content.path().join("static"),
        output_dir: output.path(),
        sign: false,
        network_isolation_asserted: false,
    };
    pipeline::run(&registry, &config, &pool, &inputs).unwrap();

    let hello_html = fs::read_to_string(output.path().join("hello.html")).unwrap();
    assert!(hello_html.contains("<h1>Hello</h1>"));

    let index_html = fs::read_to_string(output.path().join("index.html")).unwrap();
    assert!(index_html.contains("Hello"));

    let manifest_text = fs::read_to_string(output.path().join("manifest.sha256")).unwrap();
    let manifest = Manifest::parse(&manifest_text).unwrap();
    let paths: HashSet<&str> = manifest.entries.iter().map(|e| e.path.as_str()).collect();
    for expected in ["index.html", "hello.html", "feed.xml", "sitemap.xml", "headers.txt"] {
        assert!(paths.contains(expected), "manifest missing {expected}");
    }
}

#[test]
fn two_builds_with_same_epoch_produce_identical_manifests() {
    let content = tempfile::tempdir().unwrap();
    write_post(&content.path().join("posts"), "hello.md", "---\ndate: 2025-01-01T00:00:00Z\n---\n# Hello\n");

    std::env::set_var("BUILD_EPOCH", "1735689600");
    std::env::set_var("BUILD_COMMIT", "deadbeef");

    let config = test_config();

    let build_once = || {
        let output = tempfile::tempdir().unwrap();
        let registry = base_registry(&config).build();
        let (pool, _, _) = secureblog_rs::hermetic::build_thread_pool(&config);
        let inputs = BuildInputs {
            content_dir: &content.path().join("posts"),
            static_dir: &content.path().join("static"),
            output_dir: output.path(),
            sign: false,
            network_isolation_asserted: false,
        };
        pipeline::run(&registry, &config, &pool, &inputs).unwrap();
        let text = fs::read_to_string(output.path().join("manifest.sha256")).unwrap();
        let mut entries: Vec<_> = Manifest::parse(&text).unwrap().entries;
        entries.retain(|e| e.path != "build-info.json");
        entries
    };

    let first = build_once();
    let second = build_once();
    assert_eq!(first, second, "manifest entries (excluding build-info.json) must be byte-identical");

    std::env::remove_var("BUILD_EPOCH");
    std::env::remove_var("BUILD_COMMIT");
}

#[test]
fn slug_collision_fails_content_error_before_any_write() {
    let content = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let posts = content.path().join("posts");
    write_post(&posts, "hello.md", "---\ntitle: Hello\n---\n# A\n");
    write_post(&posts, "hello-world.md", "---\ntitle: Hello World\nslug: hello\n---\n# B\n");

    let config = test_config();
    let registry = base_registry(&config).build();
    let (pool, _, _) = secureblog_rs::hermetic::build_thread_pool(&config);
    let inputs = BuildInputs { content_dir: &posts, static_dir: &content.path().join("static"), output_dir: output.path(), sign: false, network_isolation_asserted: false };

    let err = pipeline::run(&registry, &config, &pool, &inputs).unwrap_err();
    assert!(matches!(err, BuildError::Content { .. }));
    assert_eq!(err.exit_code(), 1);
}

/// A Render-capability plugin that injects a forbidden construct into the
/// final rendered bytes, simulating a misbehaving or compromised plugin
/// that bypasses the Security-stage sanitiser entirely.
struct InjectScriptPlugin {
    descriptor: PluginDescriptor,
}

impl Default for InjectScriptPlugin {
    fn default() -> Self {
        Self {
            descriptor: PluginDescriptor {
                name: "test.inject-script".to_string(),
                version: "0.0.0".to_string(),
                priority: 100,
                capabilities: HashSet::from([Capability::Render]),
            },
        }
    }
}

impl Plugin for InjectScriptPlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    fn post_render(&self, mut bytes: Vec<u8>) -> Result<Vec<u8>, BuildError> {
        bytes.extend_from_slice(b"<script>alert(1)</script>");
        Ok(bytes)
    }
}

#[test]
fn guard_blocks_script_injected_at_render_stage_with_exit_code_two() {
    let content = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_post(&content.path().join("posts"), "hello.md", "# Hello\n");

    let config = test_config();
    let mut builder = base_registry(&config);
    builder.register(Box::new(InjectScriptPlugin::default())).unwrap();
    let registry = builder.build();
    let (pool, _, _) = secureblog_rs::hermetic::build_thread_pool(&config);
    let inputs = BuildInputs { content_dir: &content.path().join("posts"), static_dir: &content.path().join("static"), output_dir: output.path(), sign: false, network_isolation_asserted: false };

    let err = pipeline::run(&registry, &config, &pool, &inputs).unwrap_err();
    assert!(matches!(err, BuildError::Guard(_)));
    assert_eq!(err.exit_code(), 2);
}

#[test]
fn verify_mode_passes_on_freshly_built_output() {
    let content = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_post(&content.path().join("posts"), "hello.md", "# Hello\n");

    let config = test_config();
    let registry = base_registry(&config).build();
    let (pool, _, _) = secureblog_rs::hermetic::build_thread_pool(&config);
    let inputs = BuildInputs { content_dir: &content.path().join("posts"), static_dir: &content.path().join("static"), output_dir: output.path(), sign: false, network_isolation_asserted: false };
    pipeline::run(&registry, &config, &pool, &inputs).unwrap();

    let manifest_text = fs::read_to_string(output.path().join("manifest.sha256")).unwrap();
    let manifest = Manifest::parse(&manifest_text).unwrap();
    let report = manifest.verify(output.path()).unwrap();
    assert!(report.missing.is_empty());
    assert!(report.extra.is_empty(), "manifest must not list itself or the signature envelope as extra files");
    assert!(report.mismatched.is_empty());
}

#[test]
fn verify_mode_reports_missing_file_after_deletion() {
    let content = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_post(&content.path().join("posts"), "hello.md", "# Hello\n");

    let config = test_config();
    let registry = base_registry(&config).build();
    let (pool, _, _) = secureblog_rs::hermetic::build_thread_pool(&config);
    let inputs = BuildInputs { content_dir: &content.path().join("posts"), static_dir: &content.path().join("static"), output_dir: output.path(), sign: false, network_isolation_asserted: false };
    pipeline::run(&registry, &config, &pool, &inputs).unwrap();

    fs::remove_file(output.path().join("sitemap.xml")).unwrap();

    let manifest_text = fs::read_to_string(output.path().join("manifest.sha256")).unwrap();
    let manifest = Manifest::parse(&manifest_text).unwrap();
    let err = manifest.verify(output.path()).unwrap_err();
    assert!(matches!(err, BuildError::Integrity(secureblog_rs::error::IntegrityError::Missing(1))));
    assert_eq!(err.exit_code(), 3);
}

#[test]
fn front_matter_absent_defaults_title_from_filename() {
    let content = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_post(&content.path().join("posts"), "my-first-post.md", "Just prose, no heading.\n");

    let config = test_config();
    let registry = base_registry(&config).build();
    let (pool, _, _) = secureblog_rs::hermetic::build_thread_pool(&config);
    let inputs = BuildInputs { content_dir: &content.path().join("posts"), static_dir: &content.path().join("static"), output_dir: output.path(), sign: false, network_isolation_asserted: false };
    pipeline::run(&registry, &config, &pool, &inputs).unwrap();

    let page = fs::read_to_string(output.path().join("my-first-post.html")).unwrap();
    assert!(page.contains("my-first-post"));
}

/// Two content plugins at different priorities: the lower-priority one
/// (runs first) wraps the body, the higher-priority one appends after it.
struct WrapPlugin {
    descriptor: PluginDescriptor,
}

impl WrapPlugin {
    fn new(priority: i32) -> Self {
        Self {
            descriptor: PluginDescriptor {
                name: format!("test.wrap-{priority}"),
                version: "0.0.0".to_string(),
                priority,
                capabilities: HashSet::from([Capability::Content]),
            },
        }
    }
}

impl Plugin for WrapPlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    fn transform_content(&self, _post: &Post, body: Vec<u8>) -> Result<Vec<u8>, BuildError> {
        let mut out = b"<section>".to_vec();
        out.extend_from_slice(&body);
        out.extend_from_slice(b"</section>");
        Ok(out)
    }
}

struct AppendSignaturePlugin {
    descriptor: PluginDescriptor,
}

impl AppendSignaturePlugin {
    fn new(priority: i32) -> Self {
        Self {
            descriptor: PluginDescriptor {
                name: "test.append-signature".to_string(),
                version: "0.0.0".to_string(),
                priority,
                capabilities: HashSet::from([Capability::Content]),
            },
        }
    }
}

impl Plugin for AppendSignaturePlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    fn transform_content(&self, _post: &Post, mut body: Vec<u8>) -> Result<Vec<u8>, BuildError> {
        body.extend_from_slice(b"<p class=\"sig\">signed</p>");
        Ok(body)
    }
}

#[test]
fn content_plugins_apply_in_priority_order() {
    let content = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_post(&content.path().join("posts"), "hello.md", "Body text.\n");

    let config = test_config();
    let mut builder = RegistryBuilder::new();
    // No Markdown plugin here: these two plugins alone define the content
    // stage, isolating priority ordering from Markdown rendering.
    builder.register(Box::new(WrapPlugin::new(10))).unwrap();
    builder.register(Box::new(AppendSignaturePlugin::new(20))).unwrap();
    builder.register(Box::new(SanitizePlugin::default())).unwrap();
    let site_config = config.site_config();
    builder.register(Box::new(FeedPlugin::new(site_config.clone()))).unwrap();
    builder.register(Box::new(SitemapPlugin::new(site_config))).unwrap();
    let registry = builder.build();

    let (pool, _, _) = secureblog_rs::hermetic::build_thread_pool(&config);
    let inputs = BuildInputs { content_dir: &content.path().join("posts"), static_dir: &content.path().join("static"), output_dir: output.path(), sign: false, network_isolation_asserted: false };
    pipeline::run(&registry, &config, &pool, &inputs).unwrap();

    let page = fs::read_to_string(output.path().join("hello.html")).unwrap();
    let section_start = page.find("<section>").unwrap();
    let section_end = page.find("</section>").unwrap();
    let signature = page.find("signed").unwrap();
    assert!(section_start < section_end, "section must open before it closes");
    assert!(signature > section_end, "signature must be appended after the section closes");
}
