//! HTML-to-text normalization and content hashing.
//!
//! Change detection hashes the whitespace-collapsed, lowercased, tag-stripped
//! page text, so markup reshuffling that leaves the visible text intact never
//! looks like a pricing change.

use sha2::{Digest, Sha256};

/// Tags whose entire content is dropped before text extraction.
const DROPPED_BLOCKS: [&str; 3] = ["script", "style", "noscript"];

/// Strip an HTML document down to its visible text: drops script/style/
/// noscript blocks and comments, removes all tags, decodes the basic
/// entities (`&nbsp; &amp; &quot; &#39;`), and collapses whitespace.
pub fn strip_html_to_text(html: &str) -> String {
    let mut text = remove_comments(html);
    for tag in DROPPED_BLOCKS {
        text = remove_block(&text, tag);
    }
    let text = remove_tags(&text);
    let text = decode_entities(&text);
    collapse_whitespace(&text)
}

/// Lowercased stripped text; the input to [`content_hash`].
pub fn normalize_html_for_hash(html: &str) -> String {
    strip_html_to_text(html).to_lowercase()
}

/// Lowercase hex SHA-256 of a string.
pub fn content_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn remove_comments(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut rest = html;
    while let Some(start) = rest.find("<!--") {
        out.push_str(&rest[..start]);
        match rest[start..].find("-->") {
            Some(end) => rest = &rest[start + end + 3..],
            None => return out,
        }
    }
    out.push_str(rest);
    out
}

/// Drop `<tag ...> ... </tag>` blocks, case-insensitively. An unclosed block
/// swallows the remainder of the document, matching how browsers treat a
/// dangling `<script>`.
fn remove_block(html: &str, tag: &str) -> String {
    let lower = html.to_ascii_lowercase();
    let open = format!("<{tag}");
    let close = format!("</{tag}");
    let mut out = String::with_capacity(html.len());
    let mut pos = 0;

    while let Some(found) = lower[pos..].find(&open) {
        let start = pos + found;
        let after = start + open.len();
        // Guard against prefix matches like `<scriptx`.
        let boundary = lower[after..]
            .chars()
            .next()
            .map(|c| c.is_whitespace() || c == '>' || c == '/')
            .unwrap_or(true);
        if !boundary {
            out.push_str(&html[pos..after]);
            pos = after;
            continue;
        }
        out.push_str(&html[pos..start]);
        match lower[after..].find(&close) {
            Some(close_at) => {
                let close_start = after + close_at;
                match lower[close_start..].find('>') {
                    Some(gt) => pos = close_start + gt + 1,
                    None => return out,
                }
            }
            None => return out,
        }
    }
    out.push_str(&html[pos..]);
    out
}

/// Replace every `<...>` run with a single space.
fn remove_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => {
                in_tag = true;
                out.push(' ');
            }
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

fn decode_entities(text: &str) -> String {
    // `&amp;` last so encoded ampersands do not re-form other entities.
    text.replace("&nbsp;", " ")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `(href, anchor text)` pairs from every `<a>` tag, in document order.
/// Anchor text is tag-stripped and whitespace-collapsed.
pub fn extract_anchors(html: &str) -> Vec<(String, String)> {
    let lower = html.to_ascii_lowercase();
    let mut out = Vec::new();
    let mut pos = 0;

    while let Some(found) = lower[pos..].find("<a") {
        let start = pos + found;
        let after = start + 2;
        let boundary = lower[after..]
            .chars()
            .next()
            .map(|c| c.is_whitespace() || c == '>')
            .unwrap_or(false);
        if !boundary {
            pos = after;
            continue;
        }
        let Some(open_end) = lower[start..].find('>') else {
            break;
        };
        let open_end = start + open_end;
        let tag_src = &html[start..open_end];
        let inner_start = open_end + 1;
        let Some(close_at) = lower[inner_start..].find("</a") else {
            break;
        };
        let inner = &html[inner_start..inner_start + close_at];
        if let Some(href) = attr_value(tag_src, "href") {
            let text = collapse_whitespace(&decode_entities(&remove_tags(inner)));
            out.push((href, text));
        }
        pos = inner_start + close_at + 3;
    }
    out
}

/// Inner text of `<h1>`..`<h5>` headings, tag-stripped, in document order.
pub fn extract_headings(html: &str) -> Vec<String> {
    let lower = html.to_ascii_lowercase();
    let mut out = Vec::new();
    let mut pos = 0;

    while let Some(found) = lower[pos..].find("<h") {
        let start = pos + found;
        let Some(level) = lower[start + 2..].chars().next() else {
            break;
        };
        if !('1'..='5').contains(&level) {
            pos = start + 2;
            continue;
        }
        let boundary = lower[start + 3..]
            .chars()
            .next()
            .map(|c| c.is_whitespace() || c == '>')
            .unwrap_or(false);
        if !boundary {
            pos = start + 3;
            continue;
        }
        let Some(open_end) = lower[start..].find('>') else {
            break;
        };
        let open_end = start + open_end;
        let close = format!("</h{level}");
        let inner_start = open_end + 1;
        let Some(close_at) = lower[inner_start..].find(&close) else {
            pos = inner_start;
            continue;
        };
        let inner = &html[inner_start..inner_start + close_at];
        let text = collapse_whitespace(&decode_entities(&remove_tags(inner)));
        if !text.is_empty() {
            out.push(text);
        }
        pos = inner_start + close_at + close.len();
    }
    out
}

/// Inner text of the first `<title>` element.
pub fn extract_title(html: &str) -> Option<String> {
    let lower = html.to_ascii_lowercase();
    let start = lower.find("<title")?;
    let open_end = start + lower[start..].find('>')?;
    let inner_start = open_end + 1;
    let close_at = lower[inner_start..].find("</title")?;
    let text = collapse_whitespace(&decode_entities(&html[inner_start..inner_start + close_at]));
    (!text.is_empty()).then_some(text)
}

/// `content` of the first `<meta name="description" ...>` tag.
pub fn extract_meta_description(html: &str) -> Option<String> {
    let lower = html.to_ascii_lowercase();
    let mut pos = 0;
    while let Some(found) = lower[pos..].find("<meta") {
        let start = pos + found;
        let Some(end) = lower[start..].find('>') else {
            return None;
        };
        let end = start + end;
        let tag_src = &html[start..end];
        let is_description = attr_value(tag_src, "name")
            .map(|n| n.eq_ignore_ascii_case("description"))
            .unwrap_or(false);
        if is_description {
            let content = attr_value(tag_src, "content")
                .map(|c| collapse_whitespace(&decode_entities(&c)))
                .filter(|c| !c.is_empty());
            if content.is_some() {
                return content;
            }
        }
        pos = end + 1;
    }
    None
}

/// Pull a quoted or unquoted attribute value out of an open-tag source
/// string, case-insensitively.
fn attr_value(tag_src: &str, name: &str) -> Option<String> {
    let lower = tag_src.to_ascii_lowercase();
    let mut search = 0;
    loop {
        let found = lower[search..].find(name)?;
        let at = search + found;
        // Attribute names are delimited by whitespace on the left.
        let left_ok = tag_src[..at]
            .chars()
            .next_back()
            .map(|c| c.is_whitespace())
            .unwrap_or(false);
        let mut rest = tag_src[at + name.len()..].trim_start();
        if !left_ok || !rest.starts_with('=') {
            search = at + name.len();
            continue;
        }
        rest = rest[1..].trim_start();
        let value = match rest.chars().next() {
            Some(q @ ('"' | '\'')) => {
                let body = &rest[1..];
                match body.find(q) {
                    Some(end) => &body[..end],
                    None => body,
                }
            }
            Some(_) => rest.split(|c: char| c.is_whitespace() || c == '>').next()?,
            None => return None,
        };
        return Some(value.to_string());
    }
}
