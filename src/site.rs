//! Core data model: posts, the site, and render contexts.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Free-form metadata value drawn from a post's front matter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    /// A string value.
    String(String),
    /// A boolean value.
    Bool(bool),
    /// A numeric value.
    Number(f64),
    /// A list of strings (e.g. extra tags under a custom key).
    List(Vec<String>),
}

/// Post metadata parsed from front matter, with loader-applied defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostMeta {
    /// Post title. Defaults to the filename stem when absent.
    pub title: String,
    /// Publication timestamp. Defaults to the file's mtime (normalised to
    /// the build epoch by the hermetic runner) when absent.
    pub date: DateTime<Utc>,
    /// Ordered tag list.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Explicit slug override; when empty the loader derives one from the
    /// filename.
    #[serde(default)]
    pub slug: String,
    /// Draft status. Drafts are excluded from release builds.
    #[serde(default)]
    pub draft: bool,
    /// Free-form metadata not covered by the fields above.
    #[serde(default)]
    pub extra: BTreeMap<String, MetaValue>,
}

/// One content item, originating from one source file.
///
/// The pipeline driver exclusively owns posts for the duration of a build.
/// Only the driver replaces `rendered_body`; plugins receive the raw body
/// by value or a read-only reference and return a new body, never mutating
/// in place.
#[derive(Debug, Clone)]
pub struct Post {
    /// Parsed front-matter metadata.
    pub meta: PostMeta,
    /// URL-safe slug, unique within a build.
    pub slug: String,
    /// Raw Markdown body, as read from disk.
    pub raw_body: Vec<u8>,
    /// Body as transformed by the pipeline so far. Treated as opaque bytes
    /// by the dispatcher.
    pub rendered_body: Vec<u8>,
    /// Hex SHA-256 of `rendered_body`, computed exactly once after the
    /// security stage and never recomputed downstream.
    pub content_hash: Option<String>,
    /// Source file path, for diagnostics.
    pub source: PathBuf,
}

impl Post {
    /// Rendered body decoded as UTF-8, or a lossy fallback for diagnostics.
    #[must_use]
    pub fn rendered_body_str(&self) -> String {
        String::from_utf8_lossy(&self.rendered_body).into_owned()
    }
}

/// Site-wide configuration surfaced to templates and feed generators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Site title.
    pub title: String,
    /// Site base URL, no trailing slash.
    pub url: String,
    /// Author name.
    pub author: String,
}

/// The full post set plus site configuration, ordered newest-first by
/// timestamp with ties broken by lexicographic slug.
#[derive(Debug, Clone)]
pub struct Site {
    /// Site configuration.
    pub config: SiteConfig,
    /// Posts, already ordered per the invariant above.
    pub posts: Vec<Post>,
}

impl Site {
    /// Sort posts newest-first by timestamp, ties broken by slug.
    pub fn sort_posts(&mut self) {
        self.posts.sort_by(|a, b| {
            b.meta
                .date
                .cmp(&a.meta.date)
                .then_with(|| a.slug.cmp(&b.slug))
        });
    }
}

/// A read-only view handed to render-stage plugins and templates.
///
/// Built fresh per render and discarded afterward so the site and its posts
/// never hold a cyclic ownership relationship with each other.
pub struct RenderContext<'a> {
    /// The post being rendered, or `None` for the site index.
    pub post: Option<&'a Post>,
    /// Site configuration.
    pub site: &'a SiteConfig,
    /// The full post sequence, for the index and feeds.
    pub posts: &'a [Post],
}
