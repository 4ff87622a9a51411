//! Taxonomy builder: asks the LLM for a folder hierarchy and resolves it
//! against the input so every bookmark lands in the tree exactly once.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use markwise_shared::{FolderNode, GeneratedMetadata, MarkwiseError, Result, TaxonomyConfig};

use crate::llm::{CompletionRequest, LlmClient, complete_json};
use crate::retry::RetryPolicy;

const MAX_REPLY_TOKENS: u32 = 4_000;

const SYSTEM_PROMPT: &str = "You organize bookmarks into a folder hierarchy. \
Always answer with a single JSON object and nothing else.";

// ---------------------------------------------------------------------------
// Raw reply schema
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawTaxonomy {
    folders: Vec<RawFolder>,
    #[serde(default)]
    bookmarks: Vec<RawBookmark>,
}

#[derive(Debug, Deserialize)]
struct RawFolder {
    name: String,
    #[serde(default)]
    bookmarks: Vec<RawBookmark>,
    #[serde(default)]
    subfolders: Vec<RawFolder>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawBookmark {
    Url(String),
    Object { url: String },
}

impl RawBookmark {
    fn url(&self) -> &str {
        match self {
            Self::Url(url) | Self::Object { url } => url,
        }
    }
}

fn parse_taxonomy(text: &str) -> Result<RawTaxonomy> {
    let raw: RawTaxonomy = serde_json::from_str(text).map_err(|e| {
        MarkwiseError::schema(format!(
            "expected {{\"folders\": [{{\"name\", \"bookmarks\", \"subfolders\"}}]}}: {e}"
        ))
    })?;

    fn check(folders: &[RawFolder], path: &str) -> Result<()> {
        for (i, folder) in folders.iter().enumerate() {
            let here = format!("{path}[{i}]");
            if folder.name.trim().is_empty() {
                return Err(MarkwiseError::schema(format!("folder {here} has an empty name")));
            }
            check(&folder.subfolders, &format!("{here}.subfolders"))?;
        }
        Ok(())
    }
    check(&raw.folders, "folders")?;

    Ok(raw)
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

/// A resolved folder tree plus what had to be repaired to build it.
#[derive(Debug, Clone, PartialEq)]
pub struct Taxonomy {
    pub root: FolderNode,
    /// Inputs the model left out, placed in the uncategorized folder.
    pub missing: Vec<String>,
    /// Repeated references that were dropped.
    pub duplicates: Vec<String>,
    /// References to URLs that were not in the input.
    pub unknown: Vec<String>,
    /// Folders absorbed into an ancestor to respect the depth limit.
    pub flattened: usize,
    pub tokens_used: u64,
    /// The model never produced a usable tree; everything is uncategorized.
    pub fallback: bool,
}

impl Taxonomy {
    fn empty(root_name: &str) -> Self {
        Self {
            root: FolderNode::new(root_name),
            missing: Vec::new(),
            duplicates: Vec::new(),
            unknown: Vec::new(),
            flattened: 0,
            tokens_used: 0,
            fallback: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct TaxonomyBuilder {
    llm: Arc<dyn LlmClient>,
    retry: RetryPolicy,
    config: TaxonomyConfig,
}

impl TaxonomyBuilder {
    pub fn new(llm: Arc<dyn LlmClient>, retry: RetryPolicy, config: TaxonomyConfig) -> Self {
        Self { llm, retry, config }
    }

    /// Organize `metadata` into folders.
    ///
    /// Errors only on provider failure or cancellation. An unusable reply
    /// produces a `fallback` taxonomy instead.
    #[instrument(skip_all, fields(items = metadata.len(), max_depth = self.config.max_depth))]
    pub async fn build(
        &self,
        metadata: &[GeneratedMetadata],
        cancel: &CancellationToken,
    ) -> Result<Taxonomy> {
        let items = dedup_by_url(metadata);
        if items.is_empty() {
            return Ok(Taxonomy::empty(&self.config.root_name));
        }

        let request = CompletionRequest {
            system: SYSTEM_PROMPT.to_string(),
            prompt: self.build_prompt(&items),
            max_tokens: MAX_REPLY_TOKENS,
        };
        let reply = complete_json(
            self.llm.as_ref(),
            &self.retry,
            &request,
            parse_taxonomy,
            cancel,
        )
        .await?;

        let (raw, fallback) = match reply.parsed {
            Ok(raw) => (raw, false),
            Err(e) => {
                warn!(error = %e, "no valid taxonomy after repair, falling back to uncategorized");
                (RawTaxonomy::default(), true)
            }
        };

        let mut taxonomy = self.resolve(&items, &raw);
        taxonomy.tokens_used = reply.tokens_used;
        taxonomy.fallback = fallback;

        info!(
            folders = taxonomy.root.folder_count(),
            missing = taxonomy.missing.len(),
            duplicates = taxonomy.duplicates.len(),
            unknown = taxonomy.unknown.len(),
            flattened = taxonomy.flattened,
            fallback,
            "taxonomy built"
        );
        Ok(taxonomy)
    }

    fn build_prompt(&self, items: &[GeneratedMetadata]) -> String {
        let mut prompt = format!(
            "Organize these {} bookmarks into a folder hierarchy grouped by theme.\n\
             Rules:\n\
             - At most {} levels of folders.\n\
             - Prefer at least 2 bookmarks per folder.\n\
             - Use every URL exactly once, copied exactly as given.\n\
             - Folder names are short and non-empty.\n\n\
             Respond with JSON of the form:\n\
             {{\"folders\": [{{\"name\": \"...\", \"bookmarks\": [\"<url>\"], \"subfolders\": [...]}}]}}\n\n\
             Bookmarks (url | name | description):\n",
            items.len(),
            self.config.max_depth.max(1),
        );
        for item in items {
            prompt.push_str(&format!("- {} | {} | {}\n", item.url, item.name, item.description));
        }
        prompt
    }

    fn resolve(&self, items: &[GeneratedMetadata], raw: &RawTaxonomy) -> Taxonomy {
        let mut resolver = Resolver::new(items, self.config.max_depth);

        let mut root = FolderNode::new(self.config.root_name.as_str());
        resolver.take_bookmarks(&raw.bookmarks, &mut root.bookmarks);
        for folder in &raw.folders {
            if self.config.max_depth == 0 {
                resolver.absorb(folder, &mut root.bookmarks);
            } else {
                let child = resolver.resolve_folder(folder, 1);
                merge_into(&mut root.subfolders, child);
            }
        }
        prune_empty(&mut root.subfolders);

        let missing: Vec<GeneratedMetadata> = items
            .iter()
            .enumerate()
            .filter(|(i, _)| !resolver.placed.contains(i))
            .map(|(_, item)| item.clone())
            .collect();
        let missing_urls: Vec<String> = missing.iter().map(|m| m.url.clone()).collect();

        if self.config.max_depth == 0 {
            root.bookmarks.extend(missing);
        } else if !missing.is_empty() {
            let name = &self.config.uncategorized_name;
            match root
                .subfolders
                .iter_mut()
                .find(|f| f.name.eq_ignore_ascii_case(name))
            {
                Some(existing) => existing.bookmarks.extend(missing),
                None => {
                    let mut folder = FolderNode::new(name.as_str());
                    folder.bookmarks = missing;
                    root.subfolders.push(folder);
                }
            }
        }

        Taxonomy {
            root,
            missing: missing_urls,
            duplicates: resolver.duplicates,
            unknown: resolver.unknown,
            flattened: resolver.flattened,
            tokens_used: 0,
            fallback: false,
        }
    }
}

/// Keep one entry per URL: the last one, at the first one's position.
fn dedup_by_url(metadata: &[GeneratedMetadata]) -> Vec<GeneratedMetadata> {
    let mut out: Vec<GeneratedMetadata> = Vec::with_capacity(metadata.len());
    let mut positions: HashMap<&str, usize> = HashMap::new();
    for item in metadata {
        match positions.get(item.url.as_str()) {
            Some(&pos) => out[pos] = item.clone(),
            None => {
                positions.insert(item.url.as_str(), out.len());
                out.push(item.clone());
            }
        }
    }
    out
}

fn loose_key(url: &str) -> String {
    url.trim().trim_end_matches('/').to_ascii_lowercase()
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

struct Resolver<'a> {
    items: &'a [GeneratedMetadata],
    exact: HashMap<&'a str, usize>,
    /// Only keys that identify a single input.
    loose: HashMap<String, usize>,
    max_depth: usize,
    placed: HashSet<usize>,
    duplicates: Vec<String>,
    unknown: Vec<String>,
    flattened: usize,
}

impl<'a> Resolver<'a> {
    fn new(items: &'a [GeneratedMetadata], max_depth: usize) -> Self {
        let exact = items
            .iter()
            .enumerate()
            .map(|(i, item)| (item.url.as_str(), i))
            .collect();

        let mut loose: HashMap<String, Option<usize>> = HashMap::new();
        for (i, item) in items.iter().enumerate() {
            loose
                .entry(loose_key(&item.url))
                .and_modify(|slot| *slot = None)
                .or_insert(Some(i));
        }
        let loose = loose
            .into_iter()
            .filter_map(|(key, slot)| slot.map(|i| (key, i)))
            .collect();

        Self {
            items,
            exact,
            loose,
            max_depth,
            placed: HashSet::new(),
            duplicates: Vec::new(),
            unknown: Vec::new(),
            flattened: 0,
        }
    }

    fn lookup(&self, url: &str) -> Option<usize> {
        self.exact
            .get(url.trim())
            .copied()
            .or_else(|| self.loose.get(&loose_key(url)).copied())
    }

    fn take_bookmarks(&mut self, refs: &[RawBookmark], into: &mut Vec<GeneratedMetadata>) {
        for bookmark in refs {
            let url = bookmark.url();
            let Some(i) = self.lookup(url) else {
                warn!(url, "taxonomy references an unknown URL");
                self.unknown.push(url.to_string());
                continue;
            };
            if self.placed.insert(i) {
                into.push(self.items[i].clone());
            } else {
                self.duplicates.push(self.items[i].url.clone());
            }
        }
    }

    /// `depth` is this folder's level; top-level folders are 1.
    fn resolve_folder(&mut self, raw: &RawFolder, depth: usize) -> FolderNode {
        let mut node = FolderNode::new(raw.name.trim());
        self.take_bookmarks(&raw.bookmarks, &mut node.bookmarks);

        for sub in &raw.subfolders {
            if depth >= self.max_depth {
                self.absorb(sub, &mut node.bookmarks);
            } else {
                let child = self.resolve_folder(sub, depth + 1);
                merge_into(&mut node.subfolders, child);
            }
        }
        node
    }

    /// Pull a whole subtree's bookmarks into `into`, preorder.
    fn absorb(&mut self, raw: &RawFolder, into: &mut Vec<GeneratedMetadata>) {
        self.flattened += 1;
        self.take_bookmarks(&raw.bookmarks, into);
        for sub in &raw.subfolders {
            self.absorb(sub, into);
        }
    }
}

/// Add `child` to `siblings`, merging into a same-named folder if present.
fn merge_into(siblings: &mut Vec<FolderNode>, child: FolderNode) {
    match siblings
        .iter_mut()
        .find(|f| f.name.to_lowercase() == child.name.to_lowercase())
    {
        Some(existing) => {
            existing.bookmarks.extend(child.bookmarks);
            for sub in child.subfolders {
                merge_into(&mut existing.subfolders, sub);
            }
        }
        None => siblings.push(child),
    }
}

fn prune_empty(folders: &mut Vec<FolderNode>) {
    for folder in folders.iter_mut() {
        prune_empty(&mut folder.subfolders);
    }
    folders.retain(|f| !f.is_empty());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedLlm, fast_retry, reply};
    use serde_json::json;

    fn item(url: &str, name: &str) -> GeneratedMetadata {
        GeneratedMetadata {
            url: url.into(),
            name: name.into(),
            description: format!("About {name}"),
            cost_units: 1,
            title_only: false,
        }
    }

    fn items(n: usize) -> Vec<GeneratedMetadata> {
        (0..n)
            .map(|i| item(&format!("https://s{i}.dev/"), &format!("Site {i}")))
            .collect()
    }

    fn builder(llm: ScriptedLlm, max_depth: usize) -> (Arc<ScriptedLlm>, TaxonomyBuilder) {
        let llm = Arc::new(llm);
        let config = TaxonomyConfig {
            max_depth,
            ..TaxonomyConfig::default()
        };
        (llm.clone(), TaxonomyBuilder::new(llm, fast_retry(), config))
    }

    fn respond(value: serde_json::Value) -> ScriptedLlm {
        ScriptedLlm::sequence(vec![Ok(reply(&value.to_string(), 50))])
    }

    fn sorted_urls(root: &FolderNode) -> Vec<String> {
        let mut urls: Vec<String> = root.urls().into_iter().map(String::from).collect();
        urls.sort();
        urls
    }

    fn input_urls(items: &[GeneratedMetadata]) -> Vec<String> {
        let mut urls: Vec<String> = items.iter().map(|m| m.url.clone()).collect();
        urls.sort();
        urls
    }

    #[tokio::test]
    async fn omitted_items_go_to_uncategorized() {
        let input = items(5);
        let (_, b) = builder(
            respond(json!({ "folders": [
                { "name": "Dev", "bookmarks": ["https://s0.dev/", "https://s1.dev/"] },
                { "name": "Docs", "bookmarks": [{ "url": "https://s2.dev/" }, "https://s3.dev/"] }
            ]})),
            3,
        );

        let t = b.build(&input, &CancellationToken::new()).await.unwrap();

        assert_eq!(t.missing, vec!["https://s4.dev/"]);
        assert_eq!(t.root.name, "Bookmarks");
        let names: Vec<_> = t.root.subfolders.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["Dev", "Docs", "Uncategorized"]);
        assert_eq!(sorted_urls(&t.root), input_urls(&input));
        assert_eq!(t.tokens_used, 50);
        assert!(!t.fallback);
    }

    #[tokio::test]
    async fn deep_folders_are_flattened() {
        let input = items(4);
        let (_, b) = builder(
            respond(json!({ "folders": [{
                "name": "A", "bookmarks": ["https://s0.dev/"],
                "subfolders": [{
                    "name": "B", "bookmarks": ["https://s1.dev/"],
                    "subfolders": [{
                        "name": "C", "bookmarks": ["https://s2.dev/"],
                        "subfolders": [{ "name": "D", "bookmarks": ["https://s3.dev/"] }]
                    }]
                }]
            }]})),
            2,
        );

        let t = b.build(&input, &CancellationToken::new()).await.unwrap();

        assert!(t.root.depth() <= 2);
        assert_eq!(t.flattened, 2);
        let b_folder = &t.root.subfolders[0].subfolders[0];
        assert_eq!(b_folder.name, "B");
        let b_urls: Vec<_> = b_folder.bookmarks.iter().map(|m| m.url.as_str()).collect();
        assert_eq!(b_urls, vec!["https://s1.dev/", "https://s2.dev/", "https://s3.dev/"]);
        assert!(t.missing.is_empty());
    }

    #[tokio::test]
    async fn duplicates_and_unknown_urls_are_dropped() {
        let input = items(3);
        let (_, b) = builder(
            respond(json!({ "folders": [
                { "name": "One", "bookmarks": ["https://s0.dev/", "https://s1.dev/", "https://nope.dev/"] },
                { "name": "Two", "bookmarks": ["https://s1.dev/", "https://s2.dev"] }
            ]})),
            3,
        );

        let t = b.build(&input, &CancellationToken::new()).await.unwrap();

        assert_eq!(t.duplicates, vec!["https://s1.dev/"]);
        assert_eq!(t.unknown, vec!["https://nope.dev/"]);
        assert!(t.missing.is_empty());
        assert_eq!(sorted_urls(&t.root), input_urls(&input));
    }

    #[tokio::test]
    async fn same_named_siblings_merge_and_empty_folders_are_pruned() {
        let input = items(3);
        let (_, b) = builder(
            respond(json!({ "folders": [
                { "name": "Rust", "bookmarks": ["https://s0.dev/"] },
                { "name": "Empty", "subfolders": [{ "name": "Also empty" }] },
                { "name": "rust", "bookmarks": ["https://s1.dev/"] },
                { "name": "uncategorized", "bookmarks": [] }
            ]})),
            3,
        );

        let t = b.build(&input, &CancellationToken::new()).await.unwrap();

        let names: Vec<_> = t.root.subfolders.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["Rust", "Uncategorized"]);
        assert_eq!(t.root.subfolders[0].bookmarks.len(), 2);
        assert_eq!(t.root.subfolders[1].bookmarks[0].url, "https://s2.dev/");
    }

    #[tokio::test]
    async fn invalid_reply_after_repair_falls_back() {
        let input = items(3);
        let (llm, b) = builder(
            ScriptedLlm::sequence(vec![
                Ok(reply(r#"{"groups": []}"#, 5)),
                Ok(reply(r#"{"folders": [{"name": "  "}]}"#, 5)),
            ]),
            3,
        );

        let t = b.build(&input, &CancellationToken::new()).await.unwrap();

        assert!(t.fallback);
        assert_eq!(llm.calls(), 2);
        assert_eq!(t.tokens_used, 10);
        assert_eq!(t.root.subfolders.len(), 1);
        assert_eq!(t.root.subfolders[0].name, "Uncategorized");
        assert_eq!(sorted_urls(&t.root), input_urls(&input));
    }

    #[tokio::test]
    async fn empty_input_makes_no_call() {
        let (llm, b) = builder(ScriptedLlm::metadata(), 3);
        let t = b.build(&[], &CancellationToken::new()).await.unwrap();

        assert!(t.root.is_empty());
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn provider_failure_is_an_error() {
        let (_, b) = builder(
            ScriptedLlm::sequence(vec![Err(MarkwiseError::Llm("invalid api key".into()))]),
            3,
        );
        let err = b.build(&items(2), &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind(), "llm");

        let (_, b) = builder(ScriptedLlm::metadata(), 3);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(b.build(&items(2), &cancel).await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn input_is_deduplicated_last_wins() {
        let input = vec![
            item("https://a.dev/", "old"),
            item("https://b.dev/", "b"),
            item("https://a.dev/", "new"),
        ];
        let (llm, b) = builder(
            respond(json!({ "folders": [{ "name": "All", "bookmarks": ["https://a.dev/", "https://b.dev/"] }] })),
            3,
        );

        let t = b.build(&input, &CancellationToken::new()).await.unwrap();

        assert_eq!(t.root.bookmark_count(), 2);
        assert_eq!(t.root.subfolders[0].bookmarks[0].name, "new");
        let prompt = &llm.prompts()[0];
        assert!(prompt.contains("these 2 bookmarks"));
        assert!(!prompt.contains("| old |"));
    }

    #[tokio::test]
    async fn zero_depth_keeps_everything_at_root() {
        let input = items(2);
        let (_, b) = builder(
            respond(json!({ "folders": [{ "name": "X", "bookmarks": ["https://s0.dev/", "https://s1.dev/"] }] })),
            0,
        );

        let t = b.build(&input, &CancellationToken::new()).await.unwrap();
        assert_eq!(t.root.depth(), 0);
        assert_eq!(t.root.bookmarks.len(), 2);
        assert_eq!(t.flattened, 1);
    }

    #[tokio::test]
    async fn zero_depth_files_missing_items_at_root() {
        let input = items(3);
        let (_, b) = builder(
            respond(json!({ "folders": [{ "name": "X", "bookmarks": ["https://s0.dev/"] }] })),
            0,
        );

        let t = b.build(&input, &CancellationToken::new()).await.unwrap();
        assert_eq!(t.root.depth(), 0);
        assert!(t.root.subfolders.is_empty());
        assert_eq!(t.root.bookmarks.len(), 3);
        assert_eq!(t.missing, vec!["https://s1.dev/", "https://s2.dev/"]);
        assert_eq!(sorted_urls(&t.root), input_urls(&input));
    }
}
