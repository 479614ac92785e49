//! Input corpus model.
//!
//! The corpus is a UTF-8 CSV with a header row. Required columns:
//! `comment-id`, `comment-body`. Optional: `source`, `url`. Every other
//! column is carried as a per-comment attribute; columns prefixed
//! `attribute_` flow unchanged into the aggregated output.

use crate::error::Result;
use crate::PipelineError;
use std::collections::BTreeMap;
use std::path::Path;

pub const COMMENT_ID_COLUMN: &str = "comment-id";
pub const COMMENT_BODY_COLUMN: &str = "comment-body";
pub const ATTRIBUTE_PREFIX: &str = "attribute_";

/// One input comment.
#[derive(Debug, Clone)]
pub struct Comment {
    pub id: String,
    pub body: String,
    pub source: Option<String>,
    pub url: Option<String>,
    /// Every non-reserved column, keyed by its header name.
    pub attributes: BTreeMap<String, String>,
}

/// The parsed input corpus, in file order.
#[derive(Debug, Clone, Default)]
pub struct Corpus {
    pub comments: Vec<Comment>,
    /// Header names in file order (used to validate property columns).
    pub columns: Vec<String>,
}

impl Corpus {
    /// Read a corpus CSV, validating that every configured property column
    /// exists in the header before the rows are consumed.
    pub fn read(path: &Path, property_columns: &[String]) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)?;
        let headers = reader.headers()?.clone();
        let columns: Vec<String> = headers.iter().map(str::to_string).collect();

        let find = |name: &str| columns.iter().position(|c| c == name);
        let id_idx = find(COMMENT_ID_COLUMN).ok_or_else(|| {
            PipelineError::ConfigInvalid(format!(
                "input CSV is missing the required '{}' column",
                COMMENT_ID_COLUMN
            ))
        })?;
        let body_idx = find(COMMENT_BODY_COLUMN).ok_or_else(|| {
            PipelineError::ConfigInvalid(format!(
                "input CSV is missing the required '{}' column",
                COMMENT_BODY_COLUMN
            ))
        })?;

        let missing: Vec<&String> = property_columns
            .iter()
            .filter(|p| !columns.contains(p))
            .collect();
        if !missing.is_empty() {
            return Err(PipelineError::ConfigInvalid(format!(
                "properties {:?} not found in the input columns {:?}",
                missing, columns
            )));
        }

        let source_idx = find("source");
        let url_idx = find("url");

        let mut comments = Vec::new();
        for record in reader.records() {
            let record = record?;
            let field = |idx: usize| record.get(idx).unwrap_or("").to_string();
            let optional = |idx: Option<usize>| {
                idx.map(|i| record.get(i).unwrap_or(""))
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
            };

            let mut attributes = BTreeMap::new();
            for (i, column) in columns.iter().enumerate() {
                if i == id_idx || i == body_idx || Some(i) == source_idx || Some(i) == url_idx {
                    continue;
                }
                if let Some(value) = record.get(i) {
                    if !value.is_empty() {
                        attributes.insert(column.clone(), value.to_string());
                    }
                }
            }

            comments.push(Comment {
                id: field(id_idx),
                body: field(body_idx),
                source: optional(source_idx),
                url: optional(url_idx),
                attributes,
            });
        }

        Ok(Self { comments, columns })
    }

    /// The `attribute_`-prefixed columns present in this corpus.
    pub fn attribute_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.starts_with(ATTRIBUTE_PREFIX))
            .cloned()
            .collect()
    }

    /// Look up a comment by id.
    pub fn comment(&self, id: &str) -> Option<&Comment> {
        self.comments.iter().find(|c| c.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_csv(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_read_basic_corpus() {
        let file = write_csv(
            "comment-id,comment-body\n\
             C1,Trains should run later.\n\
             C2,More bike lanes please.\n",
        );
        let corpus = Corpus::read(file.path(), &[]).unwrap();
        assert_eq!(corpus.comments.len(), 2);
        assert_eq!(corpus.comments[0].id, "C1");
        assert_eq!(corpus.comments[1].body, "More bike lanes please.");
        assert!(corpus.comments[0].attributes.is_empty());
    }

    #[test]
    fn test_read_with_attributes_and_url() {
        let file = write_csv(
            "comment-id,comment-body,url,attribute_age,region\n\
             C1,Needs more parks.,https://example.com/1,30s,north\n",
        );
        let corpus = Corpus::read(file.path(), &[]).unwrap();
        let comment = &corpus.comments[0];
        assert_eq!(comment.url.as_deref(), Some("https://example.com/1"));
        assert_eq!(comment.attributes["attribute_age"], "30s");
        assert_eq!(comment.attributes["region"], "north");
        assert_eq!(corpus.attribute_columns(), vec!["attribute_age"]);
    }

    #[test]
    fn test_missing_required_column() {
        let file = write_csv("comment-id,text\nC1,hello\n");
        let err = Corpus::read(file.path(), &[]).unwrap_err();
        assert!(matches!(err, PipelineError::ConfigInvalid(_)));
    }

    #[test]
    fn test_missing_property_column_rejected() {
        let file = write_csv("comment-id,comment-body\nC1,hello\n");
        let err = Corpus::read(file.path(), &["age".to_string()]).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("age"), "unexpected message: {message}");
    }

    #[test]
    fn test_empty_optional_fields_are_none() {
        let file = write_csv("comment-id,comment-body,source,url\nC1,hello,,\n");
        let corpus = Corpus::read(file.path(), &[]).unwrap();
        assert!(corpus.comments[0].source.is_none());
        assert!(corpus.comments[0].url.is_none());
    }
}
