//! XML sitemap emitter.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::site::{Post, SiteConfig};

const SITEMAP_XMLNS: &str = "http://www.sitemaps.org/schemas/sitemap/0.9";

/// Render `sitemap.xml` for the given posts plus the site index.
#[must_use]
pub fn render_sitemap(config: &SiteConfig, posts: &[Post]) -> Vec<u8> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    let decl = BytesDecl::new("1.0", Some("UTF-8"), None);
    let _ = writer.write_event(Event::Decl(decl));

    let mut urlset = BytesStart::new("urlset");
    urlset.push_attribute(("xmlns", SITEMAP_XMLNS));
    let _ = writer.write_event(Event::Start(urlset));

    write_url(&mut writer, &config.url);
    for post in posts {
        write_url(&mut writer, &format!("{}/{}.html", config.url, post.slug));
    }

    let _ = writer.write_event(Event::End(BytesEnd::new("urlset")));

    let mut bytes = writer.into_inner();
    bytes.push(b'\n');
    bytes
}

fn write_url(writer: &mut Writer<Vec<u8>>, loc: &str) {
    let _ = writer.write_event(Event::Start(BytesStart::new("url")));
    let _ = writer.write_event(Event::Start(BytesStart::new("loc")));
    let _ = writer.write_event(Event::Text(BytesText::new(loc)));
    let _ = writer.write_event(Event::End(BytesEnd::new("loc")));
    let _ = writer.write_event(Event::End(BytesEnd::new("url")));
}
