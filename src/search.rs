use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tantivy::{
    Searcher,
    TantivyDocument,
    collector::TopDocs,
    query::{
        Bm25StatisticsProvider, BooleanQuery, Occur, Query, QueryParser,
        RegexQuery,
    },
    schema::{Field, Value},
};
use tracing::{debug, warn};

use crate::{
    data_dir::DataDir,
    document::ObjectType,
    error::Result,
    handle_cache::IndexCache,
    tantivy_index::{self, SchemaFields},
};

/// One hit, read back from the stored fields of an indexed document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub score: f32,
    pub date: DateTime<Utc>,
    pub summary: Option<String>,
    pub author: String,
    pub committer: Option<String>,
    #[serde(rename = "type")]
    pub kind: ObjectType,
    pub repository: String,
    pub branch: Option<String>,
    pub id: String,
    pub labels: Vec<String>,
}

/// Run `text` against the named repositories and merge the hits.
///
/// Empty text or an empty repository list returns no results. A malformed
/// query also returns no results; the parse error is logged. Repositories
/// that have never been indexed are ignored. With several repositories,
/// BM25 statistics are summed across all of them so scores are comparable.
pub fn search(
    cache: &IndexCache,
    data_dir: &DataDir,
    text: &str,
    max_hits: usize,
    repositories: &[String],
) -> Result<Vec<SearchResult>> {
    if text.trim().is_empty() || repositories.is_empty() || max_hits == 0 {
        return Ok(Vec::new());
    }

    let mut searchers: Vec<Searcher> = Vec::new();
    for name in repositories {
        let location = data_dir.location(name);
        if !tantivy_index::index_exists(&location.index_dir())? {
            debug!(repository = %name, "not indexed, skipping");
            continue;
        }
        searchers.push(cache.get_searcher(&location)?);
    }
    let Some(first) = searchers.first() else {
        return Ok(Vec::new());
    };

    let fields = SchemaFields::resolve(first.schema())?;
    let query = match build_query(first, fields, text) {
        Ok(query) => query,
        Err(e) => {
            warn!(query = text, error = %e, "malformed query");
            return Ok(Vec::new());
        }
    };

    let collector = TopDocs::with_limit(max_hits);
    let mut hits: Vec<(f32, SearchResult)> = Vec::new();
    if let [searcher] = searchers.as_slice() {
        for (score, address) in searcher.search(&*query, &collector)? {
            let doc: TantivyDocument = searcher.doc(address)?;
            hits.extend(to_result(&fields, &doc, score).map(|r| (score, r)));
        }
    } else {
        let statistics = FederatedStatistics {
            searchers: &searchers,
        };
        for searcher in &searchers {
            let top = searcher.search_with_statistics_provider(
                &*query,
                &collector,
                &statistics,
            )?;
            for (score, address) in top {
                let doc: TantivyDocument = searcher.doc(address)?;
                hits.extend(to_result(&fields, &doc, score).map(|r| (score, r)));
            }
        }
        // Stable, so equal scores keep repository order.
        hits.sort_by(|a, b| b.0.total_cmp(&a.0));
    }

    let mut seen = HashSet::new();
    let mut results: Vec<SearchResult> = hits
        .into_iter()
        .filter(|(score, r)| {
            seen.insert((
                r.kind,
                r.repository.clone(),
                r.id.clone(),
                r.branch.clone(),
                score.to_bits(),
            ))
        })
        .map(|(_, r)| r)
        .collect();
    results.truncate(max_hits);

    if results.is_empty() {
        debug!(query = text, "no hits");
    }
    Ok(results)
}

/// Turn user text into a query over `summary` and `content`.
///
/// Bare terms containing `*` or `?` become regex queries so that leading
/// wildcards work; everything else goes through the strict query parser,
/// which also accepts `field:value` clauses for any indexed field.
fn build_query(
    searcher: &Searcher,
    fields: SchemaFields,
    text: &str,
) -> Result<Box<dyn Query>> {
    let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();
    let mut rest: Vec<&str> = Vec::new();

    for token in text.split_whitespace() {
        match wildcard_pattern(token) {
            Some(pattern) => {
                for field in [fields.summary, fields.content] {
                    clauses.push((
                        Occur::Should,
                        Box::new(RegexQuery::from_pattern(&pattern, field)?),
                    ));
                }
            }
            None => rest.push(token),
        }
    }

    if !rest.is_empty() {
        let parser = QueryParser::for_index(
            searcher.index(),
            vec![fields.summary, fields.content],
        );
        clauses.push((Occur::Should, parser.parse_query(&rest.join(" "))?));
    }

    if clauses.len() == 1 {
        return Ok(clauses.remove(0).1);
    }
    Ok(Box::new(BooleanQuery::new(clauses)))
}

/// Regex for a bare wildcard term, `None` for anything else.
fn wildcard_pattern(token: &str) -> Option<String> {
    let is_bare = !token.starts_with(['-', '+'])
        && !token.contains([':', '"', '(', ')', '^', '[', '{']);
    if !is_bare || !token.contains(['*', '?']) {
        return None;
    }
    let token = token.to_lowercase();
    let mut pattern = String::new();
    let mut literal = String::new();
    for c in token.chars() {
        match c {
            '*' | '?' => {
                pattern.push_str(&regex::escape(&literal));
                literal.clear();
                pattern.push_str(if c == '*' { ".*" } else { "." });
            }
            c => literal.push(c),
        }
    }
    pattern.push_str(&regex::escape(&literal));
    Some(pattern)
}

/// Corpus statistics summed over several indexes.
struct FederatedStatistics<'a> {
    searchers: &'a [Searcher],
}

impl Bm25StatisticsProvider for FederatedStatistics<'_> {
    fn total_num_tokens(&self, field: Field) -> tantivy::Result<u64> {
        self.searchers
            .iter()
            .map(|s| Bm25StatisticsProvider::total_num_tokens(s, field))
            .sum()
    }

    fn total_num_docs(&self) -> tantivy::Result<u64> {
        self.searchers
            .iter()
            .map(Bm25StatisticsProvider::total_num_docs)
            .sum()
    }

    fn doc_freq(&self, term: &tantivy::Term) -> tantivy::Result<u64> {
        self.searchers
            .iter()
            .map(|s| Bm25StatisticsProvider::doc_freq(s, term))
            .sum()
    }
}

fn text(doc: &TantivyDocument, field: Field) -> Option<String> {
    doc.get_first(field)
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

fn to_result(
    f: &SchemaFields,
    doc: &TantivyDocument,
    score: f32,
) -> Option<SearchResult> {
    let kind = text(doc, f.kind).and_then(|k| ObjectType::from_name(&k))?;
    let secs = doc.get_first(f.date).and_then(|v| v.as_i64()).unwrap_or(0);
    Some(SearchResult {
        score,
        date: DateTime::from_timestamp(secs, 0).unwrap_or_default(),
        summary: text(doc, f.summary),
        author: text(doc, f.author).unwrap_or_default(),
        committer: text(doc, f.committer),
        kind,
        repository: text(doc, f.repository)?,
        branch: text(doc, f.branch),
        id: text(doc, f.id)?,
        labels: doc
            .get_all(f.label)
            .filter_map(|v| v.as_str())
            .map(str::to_string)
            .collect(),
    })
}

/// Format results for human-readable terminal output.
pub fn format_human(results: &[SearchResult]) {
    if results.is_empty() {
        println!("No results found.");
        return;
    }

    for (rank, r) in results.iter().enumerate() {
        let id = match r.kind {
            ObjectType::Commit => &r.id[..r.id.len().min(10)],
            ObjectType::Blob | ObjectType::Issue => r.id.as_str(),
        };
        println!(
            "{:>3}. [{:.3}] {} {}:{} {}",
            rank + 1,
            r.score,
            r.kind,
            r.repository,
            id,
            r.date.format("%Y-%m-%d %H:%M"),
        );
        if let Some(branch) = &r.branch {
            println!("     {branch}");
        }
        if let Some(summary) = r.summary.as_deref().filter(|s| !s.is_empty())
        {
            println!("     {summary}");
        }
    }
    println!("\n{} result(s)", results.len());
}

#[derive(Serialize)]
struct JsonOutput<'a> {
    query: &'a str,
    result_count: usize,
    results: &'a [SearchResult],
}

/// Format results as JSON output.
pub fn format_json(results: &[SearchResult], query: &str) -> Result<()> {
    let output = JsonOutput {
        query,
        result_count: results.len(),
        results,
    };
    println!("{}", serde_json::to_string(&output)?);
    Ok(())
}
