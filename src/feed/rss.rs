//! RSS 2.0 + iTunes podcast extension builder (spec §4.6).

use quick_xml::escape::escape;

use super::{choose_enclosure, enclosure_url, itunes_duration, mime_type_for_path, synthesize_email, watch_url, FeedChannelMeta};
use crate::models::{FeedType, Item};

pub(super) fn build(meta: &FeedChannelMeta, items: &[Item], feed_type: FeedType, media_base: &str) -> Vec<u8> {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str(
        "<rss version=\"2.0\" xmlns:itunes=\"http://www.itunes.com/dtds/podcast-1.0.dtd\" \
         xmlns:content=\"http://purl.org/rss/1.0/modules/content/\">\n",
    );
    xml.push_str("  <channel>\n");
    xml.push_str(&format!("    <title>{}</title>\n", escape(&meta.title)));
    xml.push_str(&format!("    <link>{}</link>\n", escape(&meta.link)));
    xml.push_str(&format!("    <description>{}</description>\n", escape(&meta.description)));
    xml.push_str("    <language>en-us</language>\n");
    xml.push_str(&format!(
        "    <lastBuildDate>{}</lastBuildDate>\n",
        meta.updated_at.to_rfc2822()
    ));
    xml.push_str("    <itunes:type>episodic</itunes:type>\n");
    xml.push_str(&format!("    <itunes:author>{}</itunes:author>\n", escape(&meta.title)));
    xml.push_str(&format!("    <itunes:summary>{}</itunes:summary>\n", escape(&meta.description)));
    xml.push_str("    <itunes:explicit>false</itunes:explicit>\n");
    xml.push_str("    <itunes:owner>\n");
    xml.push_str(&format!("      <itunes:name>{}</itunes:name>\n", escape(&meta.title)));
    xml.push_str(&format!(
        "      <itunes:email>{}</itunes:email>\n",
        escape(&synthesize_email(&meta.title))
    ));
    xml.push_str("    </itunes:owner>\n");
    if let Some(thumbnail) = &meta.thumbnail_url {
        xml.push_str(&format!("    <itunes:image href=\"{}\"/>\n", escape(thumbnail)));
    }

    for item in items {
        xml.push_str(&render_item(item, feed_type, media_base));
    }

    xml.push_str("  </channel>\n</rss>\n");
    xml.into_bytes()
}

fn render_item(item: &Item, feed_type: FeedType, media_base: &str) -> String {
    let mut s = String::new();
    s.push_str("    <item>\n");
    s.push_str(&format!("      <title>{}</title>\n", escape(&item.title)));
    s.push_str(&format!("      <link>{}</link>\n", escape(&watch_url(&item.video_id))));
    s.push_str(&format!("      <description>{}</description>\n", escape(&item.description)));
    s.push_str(&format!(
        "      <guid isPermaLink=\"false\">yt:{}</guid>\n",
        escape(&item.video_id)
    ));
    if let Some(published_at) = item.published_at {
        s.push_str(&format!("      <pubDate>{}</pubDate>\n", published_at.to_rfc2822()));
    }
    if let Some((path, size)) = choose_enclosure(item, feed_type) {
        let url = enclosure_url(media_base, path);
        let mime = mime_type_for_path(path);
        s.push_str(&format!(
            "      <enclosure url=\"{}\" length=\"{}\" type=\"{}\"/>\n",
            escape(&url),
            size.max(0),
            mime
        ));
    }
    s.push_str(&format!("      <itunes:title>{}</itunes:title>\n", escape(&item.title)));
    s.push_str("      <itunes:explicit>false</itunes:explicit>\n");
    s.push_str("      <itunes:episodeType>full</itunes:episodeType>\n");
    s.push_str(&format!(
        "      <itunes:duration>{}</itunes:duration>\n",
        itunes_duration(item.duration_seconds)
    ));
    if let Some(thumbnail) = &item.thumbnail_url {
        s.push_str(&format!("      <itunes:image href=\"{}\"/>\n", escape(thumbnail)));
    }
    s.push_str(&format!(
        "      <content:encoded><![CDATA[{}]]></content:encoded>\n",
        item.description
    ));
    s.push_str("    </item>\n");
    s
}
