//! Template compiler (§4.C): compile-time-checked HTML templates.
//!
//! Templates cannot receive arbitrary code — the only computed values they
//! see are post fields and site configuration, wired through plain structs
//! below. Askama provides the default HTML-escape filter automatically;
//! the `sanitize` filter is the strict allow-list sanitiser, for the one
//! field (the rendered post body) that is already-trusted HTML rather than
//! plain text needing escaping.

use askama::Template;
use chrono::{DateTime, Utc};

use crate::error::BuildError;
use crate::site::{Post, SiteConfig};

/// Filters exposed to templates beyond Askama's built-in HTML-escape.
pub mod filters {
    /// Run the allow-list sanitiser over the rendered body one more time
    /// at the template boundary, then chained with `|safe` in `post.html`
    /// so Askama does not re-escape the result. Keeps
    /// `crate::security::sanitize_html` the single source of truth for
    /// what "safe" means, rather than re-deriving it ad hoc in a template.
    pub fn sanitize(s: &str) -> ::askama::Result<String> {
        Ok(crate::security::sanitize_html(s))
    }
}

#[derive(Template)]
#[template(path = "post.html")]
struct PostTemplate<'a> {
    site_title: &'a str,
    author: &'a str,
    title: &'a str,
    date_iso: String,
    date_human: String,
    tags: &'a [String],
    body: &'a str,
}

struct IndexEntry {
    slug: String,
    title: String,
    date_iso: String,
    date_human: String,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate<'a> {
    site_title: &'a str,
    author: &'a str,
    entries: Vec<IndexEntry>,
}

fn ensure_trailing_newline(mut s: String) -> String {
    if !s.ends_with('\n') {
        s.push('\n');
    }
    s
}

fn format_date(date: DateTime<Utc>) -> (String, String) {
    (date.to_rfc3339(), date.format("%B %-d, %Y").to_string())
}

/// Render a single post's HTML page. The body is passed through as already
/// HTML-sanitised bytes; every other field goes through Askama's default
/// escaping.
///
/// # Errors
///
/// Returns [`BuildError::Plugin`] if template rendering fails (Askama
/// render errors are always programming errors, not user data errors, but
/// are still surfaced as a build failure rather than a panic).
pub fn render_post(config: &SiteConfig, post: &Post) -> Result<Vec<u8>, BuildError> {
    let (date_iso, date_human) = format_date(post.meta.date);
    let body = post.rendered_body_str();
    let template = PostTemplate {
        site_title: &config.title,
        author: &config.author,
        title: &post.meta.title,
        date_iso,
        date_human,
        tags: &post.meta.tags,
        body: &body,
    };
    let rendered = template
        .render()
        .map_err(|e| BuildError::Plugin { name: "core.templates".to_string(), reason: e.to_string() })?;
    Ok(ensure_trailing_newline(rendered).into_bytes())
}

/// Render the site index listing every post, newest-first (the caller's
/// order is preserved verbatim).
///
/// # Errors
///
/// Returns [`BuildError::Plugin`] if template rendering fails.
pub fn render_index(config: &SiteConfig, posts: &[Post]) -> Result<Vec<u8>, BuildError> {
    let entries = posts
        .iter()
        .map(|post| {
            let (date_iso, date_human) = format_date(post.meta.date);
            IndexEntry { slug: post.slug.clone(), title: post.meta.title.clone(), date_iso, date_human }
        })
        .collect();
    let template = IndexTemplate { site_title: &config.title, author: &config.author, entries };
    let rendered = template
        .render()
        .map_err(|e| BuildError::Plugin { name: "core.templates".to_string(), reason: e.to_string() })?;
    Ok(ensure_trailing_newline(rendered).into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site::PostMeta;
    use chrono::TimeZone;
    use std::path::PathBuf;

    fn sample_post() -> Post {
        Post {
            meta: PostMeta {
                title: "Hello".to_string(),
                date: Utc.timestamp_opt(1_735_689_600, 0).single().unwrap(),
                tags: vec!["rust".to_string()],
                slug: "hello".to_string(),
                draft: false,
                extra: Default::default(),
            },
            slug: "hello".to_string(),
            raw_body: Vec::new(),
            rendered_body: b"<h1>Hello</h1>".to_vec(),
            content_hash: None,
            source: PathBuf::from("hello.md"),
        }
    }

    #[test]
    fn post_renders_title_and_body() {
        let config = SiteConfig { title: "Blog".to_string(), url: "https://example.com".to_string(), author: "A".to_string() };
        let html = String::from_utf8(render_post(&config, &sample_post()).unwrap()).unwrap();
        assert!(html.contains("<h1>Hello</h1>"));
        assert!(html.ends_with('\n'));
        assert!(!html.ends_with("\n\n"));
    }

    #[test]
    fn index_lists_post_slug_link() {
        let config = SiteConfig { title: "Blog".to_string(), url: "https://example.com".to_string(), author: "A".to_string() };
        let html = String::from_utf8(render_index(&config, &[sample_post()]).unwrap()).unwrap();
        assert!(html.contains("/hello.html"));
        assert!(html.contains("Hello"));
    }
}
