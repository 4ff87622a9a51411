//! HTML-to-text extraction and cleanup passes.
//!
//! Picks the main content container of a page, walks its text while skipping
//! page chrome and non-content subtrees, then runs the cleanup pipeline to
//! strip leftover markup, collapse whitespace and bound the length.

mod cleanup;

use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};
use tracing::{debug, instrument};

pub use cleanup::TRUNCATION_MARKER;

/// Bound `text` to `max_chars` characters, marking the cut with [`TRUNCATION_MARKER`].
pub fn truncate(text: &str, max_chars: usize) -> String {
    cleanup::truncate_chars(text, max_chars)
}

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Text and title pulled from one HTML page.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    /// `<title>`, falling back to `og:title` and then the first `<h1>`.
    /// Empty when the page has none of them.
    pub title: String,
    /// Cleaned readable text, at most `max_chars` characters.
    pub text: String,
}

/// Elements whose whole subtree is never readable content.
const SKIP_TAGS: &[&str] = &[
    "script", "style", "noscript", "nav", "header", "footer", "aside", "form", "svg",
    "template", "iframe", "button", "select",
];

/// Elements that separate words even without surrounding whitespace.
const BLOCK_TAGS: &[&str] = &[
    "p", "div", "section", "article", "main", "li", "ul", "ol", "br", "h1", "h2", "h3", "h4",
    "h5", "h6", "tr", "td", "th", "table", "pre", "blockquote", "dt", "dd", "figcaption",
];

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Extract readable text and title from a full HTML document.
#[instrument(skip(html), fields(html_len = html.len()))]
pub fn extract(html: &str, max_chars: usize) -> Extracted {
    let doc = Html::parse_document(html);

    let title = title_from_document(&doc).unwrap_or_default();

    let mut raw = String::new();
    if let Some(root) = content_root(&doc) {
        collect_text(root, &mut raw);
    }
    let text = cleanup::run_pipeline(&raw, max_chars);

    debug!(title = %title, text_len = text.len(), "extraction complete");
    Extracted { title, text }
}

/// Only the page title, for salvaging something from error pages.
pub fn extract_title(html: &str) -> Option<String> {
    title_from_document(&Html::parse_document(html))
}

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("valid selector")
}

/// Main content container in priority order, else `<body>`.
fn content_root(doc: &Html) -> Option<ElementRef<'_>> {
    static CANDIDATES: LazyLock<Vec<Selector>> = LazyLock::new(|| {
        ["article", "main", "[role=\"main\"]", "body"]
            .into_iter()
            .map(selector)
            .collect()
    });

    CANDIDATES
        .iter()
        .find_map(|sel| doc.select(sel).find(|el| !is_hidden(el)))
        .or_else(|| Some(doc.root_element()))
}

fn title_from_document(doc: &Html) -> Option<String> {
    static TITLE: LazyLock<Selector> = LazyLock::new(|| selector("head title, title"));
    static OG_TITLE: LazyLock<Selector> =
        LazyLock::new(|| selector("meta[property=\"og:title\"]"));
    static H1: LazyLock<Selector> = LazyLock::new(|| selector("h1"));

    let normalize = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ");

    doc.select(&TITLE)
        .map(|el| normalize(&el.text().collect::<String>()))
        .find(|t| !t.is_empty())
        .or_else(|| {
            doc.select(&OG_TITLE)
                .filter_map(|el| el.value().attr("content"))
                .map(normalize)
                .find(|t| !t.is_empty())
        })
        .or_else(|| {
            doc.select(&H1)
                .map(|el| normalize(&el.text().collect::<String>()))
                .find(|t| !t.is_empty())
        })
}

fn is_hidden(el: &ElementRef<'_>) -> bool {
    let value = el.value();
    value.attr("hidden").is_some() || value.attr("aria-hidden") == Some("true")
}

/// Depth-first text walk that prunes skipped and hidden subtrees.
fn collect_text(el: ElementRef<'_>, out: &mut String) {
    for child in el.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(text);
        } else if let Some(child_el) = ElementRef::wrap(child) {
            let name = child_el.value().name();
            if SKIP_TAGS.contains(&name) || is_hidden(&child_el) {
                continue;
            }
            let block = BLOCK_TAGS.contains(&name);
            if block {
                out.push('\n');
            }
            collect_text(child_el, out);
            if block {
                out.push('\n');
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_article_over_body() {
        let html = r#"<html><head><title>Rust Blog</title></head><body>
            <nav>Home | About</nav>
            <article><h1>Ownership</h1><p>Borrowing rules explained.</p></article>
            <footer>Copyright</footer>
        </body></html>"#;
        let out = extract(html, 10_000);
        assert_eq!(out.title, "Rust Blog");
        assert_eq!(out.text, "Ownership Borrowing rules explained.");
    }

    #[test]
    fn skips_scripts_styles_and_chrome() {
        let html = r#"<html><body>
            <header>Site header</header>
            <script>var tracking = 1;</script>
            <style>.x { color: red }</style>
            <p>Visible text</p>
            <aside>Related links</aside>
            <div hidden>secret</div>
            <div aria-hidden="true">icon</div>
            <form><label>Email</label></form>
        </body></html>"#;
        let out = extract(html, 10_000);
        assert_eq!(out.text, "Visible text");
    }

    #[test]
    fn block_elements_separate_words() {
        let html = "<body><ul><li>one</li><li>two</li></ul><p>three</p><p>four</p></body>";
        assert_eq!(extract(html, 10_000).text, "one two three four");
    }

    #[test]
    fn role_main_is_a_content_root() {
        let html = r#"<body><div>sidebar junk</div><div role="main">The content</div></body>"#;
        assert_eq!(extract(html, 10_000).text, "The content");
    }

    #[test]
    fn title_falls_back_to_og_then_h1() {
        let og = r#"<html><head><meta property="og:title" content="From OG"></head>
            <body><h1>Heading</h1></body></html>"#;
        assert_eq!(extract_title(og).as_deref(), Some("From OG"));

        let h1 = "<html><body><h1>  Just a\n heading </h1></body></html>";
        assert_eq!(extract_title(h1).as_deref(), Some("Just a heading"));

        assert_eq!(extract_title("<html><body><p>nothing</p></body></html>"), None);
    }

    #[test]
    fn empty_body_yields_empty_text() {
        let out = extract("<html><head><title>Only title</title></head><body></body></html>", 100);
        assert_eq!(out.title, "Only title");
        assert!(out.text.is_empty());
    }

    #[test]
    fn text_is_bounded() {
        let html = format!("<body><p>{}</p></body>", "lorem ipsum ".repeat(2_000));
        let out = extract(&html, 500);
        assert!(out.text.chars().count() <= 500);
        assert!(out.text.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn decodes_entities() {
        let out = extract("<body><p>Fish &amp; chips&nbsp;today</p></body>", 100);
        assert_eq!(out.text, "Fish & chips today");
    }

    #[test]
    fn tolerates_fragments_and_garbage() {
        let out = extract("not really <html at all", 100);
        assert_eq!(out.title, "");
        assert!(out.text.contains("not really"));
    }
}
