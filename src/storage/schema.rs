//! Database schema definitions using sea-query.

use sea_query::Iden;

/// Documents table schema. One row per document, all collections together.
#[derive(Iden)]
pub enum Documents {
    Table,
    #[iden = "collection"]
    Collection,
    #[iden = "doc_key"]
    DocKey,
    #[iden = "body"]
    Body,
}

/// SQL for creating the documents table.
pub const CREATE_DOCUMENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    collection TEXT NOT NULL,
    doc_key TEXT NOT NULL,
    body TEXT NOT NULL,
    PRIMARY KEY (collection, doc_key)
)
"#;
