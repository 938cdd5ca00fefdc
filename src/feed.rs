//! RSS 2.0 feed emitter.

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::site::{Post, SiteConfig};

/// Render `feed.xml` for the given posts, newest-first (caller's order is
/// preserved verbatim).
#[must_use]
pub fn render_feed(config: &SiteConfig, posts: &[Post]) -> Vec<u8> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    write_decl(&mut writer);
    write_start(&mut writer, "rss", &[("version", "2.0")]);
    write_start(&mut writer, "channel", &[]);

    write_text_elem(&mut writer, "title", &config.title);
    write_text_elem(&mut writer, "link", &config.url);
    write_text_elem(&mut writer, "description", &format!("{} — latest posts", config.title));

    for post in posts {
        write_start(&mut writer, "item", &[]);
        write_text_elem(&mut writer, "title", &post.meta.title);
        write_text_elem(&mut writer, "link", &format!("{}/{}.html", config.url, post.slug));
        write_text_elem(&mut writer, "guid", &format!("{}/{}.html", config.url, post.slug));
        write_text_elem(&mut writer, "pubDate", &post.meta.date.to_rfc2822());
        if let Some(hash) = &post.content_hash {
            write_text_elem(&mut writer, "description", &format!("sha256:{hash}"));
        }
        write_end(&mut writer, "item");
    }

    write_end(&mut writer, "channel");
    write_end(&mut writer, "rss");

    let mut bytes = writer.into_inner();
    bytes.push(b'\n');
    bytes
}

fn write_decl(writer: &mut Writer<Vec<u8>>) {
    let decl = quick_xml::events::BytesDecl::new("1.0", Some("UTF-8"), None);
    let _ = writer.write_event(Event::Decl(decl));
}

fn write_start(writer: &mut Writer<Vec<u8>>, name: &str, attrs: &[(&str, &str)]) {
    let mut start = BytesStart::new(name);
    for (key, value) in attrs {
        start.push_attribute((*key, *value));
    }
    let _ = writer.write_event(Event::Start(start));
}

fn write_end(writer: &mut Writer<Vec<u8>>, name: &str) {
    let _ = writer.write_event(Event::End(BytesEnd::new(name)));
}

fn write_text_elem(writer: &mut Writer<Vec<u8>>, name: &str, text: &str) {
    write_start(writer, name, &[]);
    let _ = writer.write_event(Event::Text(BytesText::new(text)));
    write_end(writer, name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use crate::site::PostMeta;
    use std::path::PathBuf;

    fn sample_post(slug: &str) -> Post {
        Post {
            meta: PostMeta {
                title: "Hello".to_string(),
                date: Utc.timestamp_opt(1_735_689_600, 0).single().unwrap(),
                tags: Vec::new(),
                slug: slug.to_string(),
                draft: false,
                extra: Default::default(),
            },
            slug: slug.to_string(),
            raw_body: Vec::new(),
            rendered_body: b"<p>Hi</p>".to_vec(),
            content_hash: Some("abc123".to_string()),
            source: PathBuf::from("hello.md"),
        }
    }

    #[test]
    fn feed_contains_item_link_and_guid() {
        let config = SiteConfig {
            title: "Blog".to_string(),
            url: "https://example.com".to_string(),
            author: "Author".to_string(),
        };
        let xml = String::from_utf8(render_feed(&config, &[sample_post("hello")])).unwrap();
        assert!(xml.contains("<link>https://example.com/hello.html</link>"));
        assert!(xml.contains("<guid>https://example.com/hello.html</guid>"));
        assert!(xml.starts_with("<?xml"));
        assert!(xml.ends_with('\n'));
    }
}
