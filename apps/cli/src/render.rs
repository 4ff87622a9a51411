//! Plain-text rendering of a folder tree for the terminal.

use std::fmt::Write;

use markwise_shared::FolderNode;

const MAX_URL_CHARS: usize = 60;

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RenderOptions {
    pub show_urls: bool,
    pub show_descriptions: bool,
}

/// Render `root` with box-drawing connectors. Folders list before
/// bookmarks at each level.
pub(crate) fn render_tree(root: &FolderNode, options: RenderOptions) -> String {
    let mut out = format!(
        "{} ({} bookmarks)\n",
        root.name,
        root.bookmark_count()
    );
    render_children(root, "", options, &mut out);
    out
}

fn render_children(node: &FolderNode, prefix: &str, options: RenderOptions, out: &mut String) {
    let total = node.subfolders.len() + node.bookmarks.len();
    let mut position = 0;

    for folder in &node.subfolders {
        position += 1;
        let last = position == total;
        let _ = writeln!(
            out,
            "{prefix}{}{}/ ({})",
            connector(last),
            folder.name,
            folder.bookmark_count()
        );
        render_children(folder, &child_prefix(prefix, last), options, out);
    }

    for bookmark in &node.bookmarks {
        position += 1;
        let last = position == total;
        let _ = write!(out, "{prefix}{}{}", connector(last), bookmark.name);
        if bookmark.title_only {
            out.push_str(" [title only]");
        }
        out.push('\n');

        let detail_prefix = child_prefix(prefix, last);
        if options.show_urls {
            let _ = writeln!(out, "{detail_prefix}  {}", shorten(&bookmark.url, MAX_URL_CHARS));
        }
        if options.show_descriptions {
            let _ = writeln!(out, "{detail_prefix}  {}", bookmark.description);
        }
    }
}

fn connector(last: bool) -> &'static str {
    if last { "└── " } else { "├── " }
}

fn child_prefix(prefix: &str, last: bool) -> String {
    format!("{prefix}{}", if last { "    " } else { "│   " })
}

fn shorten(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{kept}...")
}
