use std::path::Path;

use tantivy::{
    Index,
    IndexWriter,
    Searcher,
    TantivyDocument,
    Term,
    collector::{DocSetCollector, TopDocs},
    directory::MmapDirectory,
    query::{BooleanQuery, Occur, Query, TermQuery},
    schema::*,
    tokenizer::{LowerCaser, RemoveLongFilter, SimpleTokenizer, TextAnalyzer},
};

use crate::{
    document::{DocumentKey, IndexDocument, ObjectType},
    error::Result,
};

/// Field names used in the schema.
pub mod fields {
    pub const KEY: &str = "key";
    pub const KIND: &str = "type";
    pub const REPOSITORY: &str = "repository";
    pub const BRANCH: &str = "branch";
    pub const ID: &str = "id";
    pub const DATE: &str = "date";
    pub const AUTHOR: &str = "author";
    pub const COMMITTER: &str = "committer";
    pub const SUMMARY: &str = "summary";
    pub const CONTENT: &str = "content";
    pub const LABEL: &str = "label";
    pub const ATTACHMENT: &str = "attachment";
}

const TOKENIZER: &str = "code";

/// Resolved field handles for the schema.
#[derive(Debug, Clone, Copy)]
pub struct SchemaFields {
    pub key: Field,
    pub kind: Field,
    pub repository: Field,
    pub branch: Field,
    pub id: Field,
    pub date: Field,
    pub author: Field,
    pub committer: Field,
    pub summary: Field,
    pub content: Field,
    pub label: Field,
    pub attachment: Field,
}

impl SchemaFields {
    /// Resolve the handles from an existing schema.
    pub fn resolve(schema: &Schema) -> Result<Self> {
        let f = |name: &str| schema.get_field(name);
        Ok(Self {
            key: f(fields::KEY)?,
            kind: f(fields::KIND)?,
            repository: f(fields::REPOSITORY)?,
            branch: f(fields::BRANCH)?,
            id: f(fields::ID)?,
            date: f(fields::DATE)?,
            author: f(fields::AUTHOR)?,
            committer: f(fields::COMMITTER)?,
            summary: f(fields::SUMMARY)?,
            content: f(fields::CONTENT)?,
            label: f(fields::LABEL)?,
            attachment: f(fields::ATTACHMENT)?,
        })
    }
}

pub fn build_schema() -> Schema {
    let mut builder = Schema::builder();

    builder.add_text_field(fields::KEY, STRING | STORED);
    builder.add_text_field(fields::KIND, STRING | STORED);
    builder.add_text_field(fields::REPOSITORY, STRING | STORED);
    builder.add_text_field(fields::BRANCH, STRING | STORED);
    builder.add_text_field(fields::ID, STRING | STORED);
    builder.add_i64_field(fields::DATE, STORED | FAST);
    builder.add_text_field(fields::AUTHOR, STRING | STORED);
    builder.add_text_field(fields::COMMITTER, STRING | STORED);

    let indexing = TextFieldIndexing::default()
        .set_tokenizer(TOKENIZER)
        .set_index_option(IndexRecordOption::WithFreqsAndPositions);

    let stored_text = TextOptions::default()
        .set_indexing_options(indexing.clone())
        .set_stored();
    builder.add_text_field(fields::SUMMARY, stored_text.clone());
    builder.add_text_field(fields::LABEL, stored_text.clone());
    builder.add_text_field(fields::ATTACHMENT, stored_text);

    let content_opts = TextOptions::default().set_indexing_options(indexing);
    builder.add_text_field(fields::CONTENT, content_opts);

    builder.build()
}

fn register_tokenizers(index: &Index) {
    let code = TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(40))
        .filter(LowerCaser)
        .build();
    index.tokenizers().register(TOKENIZER, code);
}

/// True when `dir` holds a tantivy index.
pub fn index_exists(dir: &Path) -> Result<bool> {
    if !dir.is_dir() {
        return Ok(false);
    }
    let mmap_dir = MmapDirectory::open(dir)?;
    Index::exists(&mmap_dir)
        .map_err(|e| tantivy::TantivyError::SystemError(e.to_string()).into())
}

/// Open the index at `dir`, creating an empty one if none exists.
pub fn open_index(dir: &Path) -> Result<Index> {
    if !index_exists(dir)? {
        return create_index(dir);
    }
    let index = Index::open_in_dir(dir)?;
    register_tokenizers(&index);
    Ok(index)
}

/// Discard anything at `dir` and create an empty index there.
pub fn create_index(dir: &Path) -> Result<Index> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)?;
    }
    std::fs::create_dir_all(dir)?;
    let index = Index::create_in_dir(dir, build_schema())?;
    register_tokenizers(&index);
    Ok(index)
}

#[cfg(test)]
pub fn open_in_ram() -> Index {
    let index = Index::create_in_ram(build_schema());
    register_tokenizers(&index);
    index
}

pub fn to_tantivy(f: &SchemaFields, doc: &IndexDocument) -> TantivyDocument {
    let mut out = TantivyDocument::default();
    out.add_text(f.key, doc.key().as_str());
    out.add_text(f.kind, doc.kind.as_str());
    out.add_text(f.repository, &doc.repository);
    out.add_text(f.id, &doc.id);
    out.add_i64(f.date, doc.date);
    out.add_text(f.author, &doc.author);
    if let Some(branch) = &doc.branch {
        out.add_text(f.branch, branch);
    }
    if let Some(committer) = &doc.committer {
        out.add_text(f.committer, committer);
    }
    if let Some(summary) = &doc.summary {
        out.add_text(f.summary, summary);
    }
    if let Some(content) = &doc.content {
        out.add_text(f.content, content);
    }
    for label in &doc.labels {
        out.add_text(f.label, label);
    }
    for attachment in &doc.attachments {
        out.add_text(f.attachment, attachment);
    }
    out
}

fn term_query(field: Field, text: &str) -> Box<dyn Query> {
    Box::new(TermQuery::new(
        Term::from_field_text(field, text),
        IndexRecordOption::Basic,
    ))
}

fn stored_text(doc: &TantivyDocument, field: Field) -> Option<String> {
    doc.get_first(field)
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/// Branch stored on the document with `key`, or `None` when no such document
/// is visible to `searcher`.
pub fn stored_branch(
    searcher: &Searcher,
    key: &DocumentKey,
) -> Result<Option<String>> {
    let f = SchemaFields::resolve(searcher.schema())?;
    let query = TermQuery::new(
        Term::from_field_text(f.key, key.as_str()),
        IndexRecordOption::Basic,
    );
    let Some((_, address)) = searcher
        .search(&query, &TopDocs::with_limit(1))?
        .into_iter()
        .next()
    else {
        return Ok(None);
    };
    let doc: TantivyDocument = searcher.doc(address)?;
    Ok(stored_text(&doc, f.branch))
}

/// Hashes of the commit documents labelled with `branch`.
pub fn commits_on_branch(
    searcher: &Searcher,
    branch: &str,
) -> Result<Vec<String>> {
    let f = SchemaFields::resolve(searcher.schema())?;
    let query = BooleanQuery::new(vec![
        (Occur::Must, term_query(f.branch, branch)),
        (Occur::Must, term_query(f.kind, ObjectType::Commit.as_str())),
    ]);
    let mut hashes = Vec::new();
    for address in searcher.search(&query, &DocSetCollector)? {
        let doc: TantivyDocument = searcher.doc(address)?;
        hashes.extend(stored_text(&doc, f.id));
    }
    hashes.sort();
    Ok(hashes)
}

/// Mutations against one repository's writer.
///
/// Nothing is visible to searchers until [`IndexSession::commit`].
pub struct IndexSession<'a> {
    writer: &'a mut IndexWriter,
    fields: SchemaFields,
}

impl<'a> IndexSession<'a> {
    pub fn new(writer: &'a mut IndexWriter, fields: SchemaFields) -> Self {
        Self { writer, fields }
    }

    pub fn add(&self, doc: &IndexDocument) -> Result<()> {
        self.writer.add_document(to_tantivy(&self.fields, doc))?;
        Ok(())
    }

    pub fn delete(&self, key: &DocumentKey) {
        let term = tantivy::Term::from_field_text(self.fields.key, key.as_str());
        self.writer.delete_term(term);
    }

    /// Delete any document sharing `doc`'s key, then add `doc`.
    pub fn replace(&self, doc: &IndexDocument) -> Result<()> {
        self.delete(&doc.key());
        self.add(doc)
    }

    /// Delete every file and issue document recorded against `branch`.
    /// Commit documents are keyed by hash alone and are left to the caller.
    pub fn delete_branch_files(&self, branch: &str) -> Result<()> {
        let query = BooleanQuery::new(vec![
            (Occur::Must, term_query(self.fields.branch, branch)),
            (
                Occur::MustNot,
                term_query(self.fields.kind, ObjectType::Commit.as_str()),
            ),
        ]);
        self.writer.delete_query(Box::new(query))?;
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        self.writer.commit()?;
        Ok(())
    }

    /// Drop every uncommitted change.
    pub fn rollback(&mut self) -> Result<()> {
        self.writer.rollback()?;
        Ok(())
    }
}
