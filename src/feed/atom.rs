//! Atom 1.0 builder (spec §4.6). Shares enclosure/MIME/ordering conventions
//! with the RSS builder; enclosures are carried as a `rel="enclosure"` link.

use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::escape::escape;

use super::{choose_enclosure, enclosure_url, mime_type_for_path, watch_url, FeedChannelMeta};
use crate::models::{FeedType, Item};

/// ISO-8601 UTC ending in `Z`, never the `+00:00` offset form (spec §4.6).
fn iso8601_z(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub(super) fn build(
    meta: &FeedChannelMeta,
    items: &[Item],
    feed_type: FeedType,
    media_base: &str,
    self_url: &str,
    feed_id: Option<&str>,
) -> Vec<u8> {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str("<feed xmlns=\"http://www.w3.org/2005/Atom\">\n");
    xml.push_str(&format!("  <title>{}</title>\n", escape(&meta.title)));
    xml.push_str(&format!("  <subtitle>{}</subtitle>\n", escape(&meta.description)));
    let id = feed_id
        .map(str::to_string)
        .unwrap_or_else(|| format!("urn:castrelay:channel:{}", meta.id));
    xml.push_str(&format!("  <id>{}</id>\n", escape(&id)));
    xml.push_str(&format!(
        "  <updated>{}</updated>\n",
        iso8601_z(meta.updated_at)
    ));
    xml.push_str("  <author>\n");
    xml.push_str(&format!("    <name>{}</name>\n", escape(&meta.title)));
    xml.push_str("  </author>\n");
    xml.push_str(&format!(
        "  <link rel=\"alternate\" href=\"{}\"/>\n",
        escape(&meta.link)
    ));
    xml.push_str(&format!(
        "  <link rel=\"self\" href=\"{}\"/>\n",
        escape(self_url)
    ));
    if let Some(thumbnail) = &meta.thumbnail_url {
        xml.push_str(&format!("  <logo>{}</logo>\n", escape(thumbnail)));
    }

    for item in items {
        xml.push_str(&render_entry(item, feed_type, media_base));
    }

    xml.push_str("</feed>\n");
    xml.into_bytes()
}

fn render_entry(item: &Item, feed_type: FeedType, media_base: &str) -> String {
    let mut s = String::new();
    s.push_str("  <entry>\n");
    s.push_str(&format!("    <title>{}</title>\n", escape(&item.title)));
    s.push_str(&format!("    <id>yt:{}</id>\n", escape(&item.video_id)));
    let updated = match item.published_at {
        Some(published_at) => item.updated_at.max(published_at),
        None => item.updated_at,
    };
    s.push_str(&format!("    <updated>{}</updated>\n", iso8601_z(updated)));
    if let Some(published_at) = item.published_at {
        s.push_str(&format!("    <published>{}</published>\n", iso8601_z(published_at)));
    }
    s.push_str(&format!(
        "    <link rel=\"alternate\" href=\"{}\"/>\n",
        escape(&watch_url(&item.video_id))
    ));
    if let Some((path, size)) = choose_enclosure(item, feed_type) {
        let url = enclosure_url(media_base, path);
        let mime = mime_type_for_path(path);
        s.push_str(&format!(
            "    <link rel=\"enclosure\" href=\"{}\" type=\"{}\" length=\"{}\" title=\"Audio Download\"/>\n",
            escape(&url),
            mime,
            size.max(0)
        ));
    }
    s.push_str(&format!("    <summary>{}</summary>\n", escape(&item.description)));
    s.push_str(&format!(
        "    <content type=\"html\"><![CDATA[{}]]></content>\n",
        item.description
    ));
    s.push_str("  </entry>\n");
    s
}
