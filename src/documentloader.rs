//! Document loaders: raw bytes → raw documents.
//!
//! A loader turns the bytes of one file into one or more unsplit
//! [`Document`]s. Most formats yield a single document; PDFs yield one per
//! page and presentations one per slide, with the position recorded in
//! metadata.
//!
//! # Built-in loaders
//!
//! | Name | Filetypes | Options |
//! |------|-----------|---------|
//! | `plaintext` | text, json, csv | none |
//! | `markdown` | markdown | none |
//! | `html` | html | `selector` (CSS, optional) |
//! | `pdf` | pdf | `splitPages` (default `true`) |
//! | `ooxml` | docx, pptx, xlsx | none |

use std::sync::Arc;

use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;

use knowledge_core::error::{decode_options, KnowledgeError};
use knowledge_core::filetype::{detect_filetype, FileType};
use knowledge_core::models::{Document, Metadata};

use crate::extract;

pub const PLAINTEXT: &str = "plaintext";
pub const MARKDOWN: &str = "markdown";
pub const HTML: &str = "html";
pub const PDF: &str = "pdf";
pub const OOXML: &str = "ooxml";

#[async_trait]
pub trait DocumentLoader: Send + Sync {
    fn name(&self) -> &str;
    async fn load(&self, content: &[u8]) -> Result<Vec<Document>, KnowledgeError>;
}

fn utf8<'a>(loader: &str, content: &'a [u8]) -> Result<&'a str, KnowledgeError> {
    let text = std::str::from_utf8(content).map_err(|e| KnowledgeError::loader(loader, e))?;
    Ok(text.strip_prefix('\u{feff}').unwrap_or(text))
}

/// Strict UTF-8 text, one document.
#[derive(Debug, Clone, Default)]
pub struct PlainTextLoader;

#[async_trait]
impl DocumentLoader for PlainTextLoader {
    fn name(&self) -> &str {
        PLAINTEXT
    }

    async fn load(&self, content: &[u8]) -> Result<Vec<Document>, KnowledgeError> {
        Ok(vec![Document::new(utf8(PLAINTEXT, content)?)])
    }
}

/// Markdown source kept verbatim; structure is handled by the markdown
/// splitter.
#[derive(Debug, Clone, Default)]
pub struct MarkdownLoader;

#[async_trait]
impl DocumentLoader for MarkdownLoader {
    fn name(&self) -> &str {
        MARKDOWN
    }

    async fn load(&self, content: &[u8]) -> Result<Vec<Document>, KnowledgeError> {
        Ok(vec![Document::new(utf8(MARKDOWN, content)?)])
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HtmlLoaderOpts {
    /// Only text inside elements matching this CSS selector is kept.
    pub selector: Option<String>,
}

/// Visible text of an HTML page. Script, style and template contents are
/// dropped; text nodes become lines.
#[derive(Debug, Clone, Default)]
pub struct HtmlLoader {
    selector: Option<String>,
}

impl HtmlLoader {
    pub fn new(opts: HtmlLoaderOpts) -> Result<Self, KnowledgeError> {
        if let Some(sel) = &opts.selector {
            parse_selector(sel)?;
        }
        Ok(Self {
            selector: opts.selector,
        })
    }
}

fn parse_selector(sel: &str) -> Result<Selector, KnowledgeError> {
    Selector::parse(sel)
        .map_err(|_| KnowledgeError::InvalidConfig(format!("invalid CSS selector {:?}", sel)))
}

fn visible_text(root: ElementRef<'_>) -> String {
    let mut lines: Vec<&str> = Vec::new();
    for node in root.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|a| {
            a.value()
                .as_element()
                .map(|e| matches!(e.name(), "script" | "style" | "noscript" | "template" | "head"))
                .unwrap_or(false)
        });
        let trimmed = text.trim();
        if !hidden && !trimmed.is_empty() {
            lines.push(trimmed);
        }
    }
    lines.join("\n")
}

#[async_trait]
impl DocumentLoader for HtmlLoader {
    fn name(&self) -> &str {
        HTML
    }

    async fn load(&self, content: &[u8]) -> Result<Vec<Document>, KnowledgeError> {
        let source = String::from_utf8_lossy(content);
        let document = Html::parse_document(&source);

        let mut metadata = Metadata::new();
        if let Ok(title_sel) = Selector::parse("title") {
            if let Some(title) = document.select(&title_sel).next() {
                let title = title.text().collect::<String>().trim().to_string();
                if !title.is_empty() {
                    metadata.insert("title".into(), title.into());
                }
            }
        }

        let text = match &self.selector {
            Some(sel) => {
                let selector = parse_selector(sel)?;
                document
                    .select(&selector)
                    .map(visible_text)
                    .filter(|t| !t.is_empty())
                    .collect::<Vec<_>>()
                    .join("\n\n")
            }
            None => visible_text(document.root_element()),
        };
        Ok(vec![Document::with_metadata(text, metadata)])
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PdfLoaderOpts {
    pub split_pages: bool,
}

impl Default for PdfLoaderOpts {
    fn default() -> Self {
        Self { split_pages: true }
    }
}

/// PDF text through pdf-extract. With `split_pages`, one document per
/// non-empty page carrying `page` (1-based) and `totalPages`.
#[derive(Debug, Clone, Default)]
pub struct PdfLoader {
    opts: PdfLoaderOpts,
}

impl PdfLoader {
    pub fn new(opts: PdfLoaderOpts) -> Self {
        Self { opts }
    }
}

#[async_trait]
impl DocumentLoader for PdfLoader {
    fn name(&self) -> &str {
        PDF
    }

    async fn load(&self, content: &[u8]) -> Result<Vec<Document>, KnowledgeError> {
        let bytes = content.to_vec();
        let pages = tokio::task::spawn_blocking(move || extract::extract_pdf_pages(&bytes))
            .await
            .map_err(|e| KnowledgeError::loader(PDF, e))?
            .map_err(|e| KnowledgeError::loader(PDF, e))?;

        if !self.opts.split_pages {
            return Ok(vec![Document::new(pages.join("\n\n"))]);
        }

        let total = pages.len();
        Ok(pages
            .into_iter()
            .enumerate()
            .filter(|(_, text)| !text.trim().is_empty())
            .map(|(i, text)| {
                let mut metadata = Metadata::new();
                metadata.insert("page".into(), (i + 1).into());
                metadata.insert("totalPages".into(), total.into());
                Document::with_metadata(text, metadata)
            })
            .collect())
    }
}

/// Office Open XML documents. The concrete format is sniffed from the
/// archive's part names; slides become one document each.
#[derive(Debug, Clone, Default)]
pub struct OoxmlLoader;

#[async_trait]
impl DocumentLoader for OoxmlLoader {
    fn name(&self) -> &str {
        OOXML
    }

    async fn load(&self, content: &[u8]) -> Result<Vec<Document>, KnowledgeError> {
        let filetype = detect_filetype("", content).map_err(|e| KnowledgeError::loader(OOXML, e))?;
        if !filetype.is_ooxml() {
            return Err(KnowledgeError::loader(
                OOXML,
                anyhow::anyhow!("not an OOXML document (detected {})", filetype),
            ));
        }

        let bytes = content.to_vec();
        let docs = tokio::task::spawn_blocking(move || -> Result<Vec<Document>, extract::ExtractError> {
            if filetype == FileType::Pptx {
                let slides = extract::extract_pptx_slides(&bytes)?;
                return Ok(slides
                    .into_iter()
                    .enumerate()
                    .filter(|(_, text)| !text.trim().is_empty())
                    .map(|(i, text)| {
                        let mut metadata = Metadata::new();
                        metadata.insert("slide".into(), (i + 1).into());
                        Document::with_metadata(text, metadata)
                    })
                    .collect());
            }
            Ok(vec![Document::new(extract::extract_text(&bytes, filetype)?)])
        })
        .await
        .map_err(|e| KnowledgeError::loader(OOXML, e))?
        .map_err(|e| KnowledgeError::loader(OOXML, e))?;
        Ok(docs)
    }
}

/// Build a loader by registry name from an options blob. Filetype names
/// are accepted as aliases for the loader that handles them.
pub fn get_document_loader(
    name: &str,
    options: Option<&serde_json::Value>,
) -> Result<Arc<dyn DocumentLoader>, KnowledgeError> {
    match name {
        PLAINTEXT | "text" | "json" | "csv" => Ok(Arc::new(PlainTextLoader)),
        MARKDOWN | "md" => Ok(Arc::new(MarkdownLoader)),
        HTML => {
            let opts: HtmlLoaderOpts = decode_options("document loader", name, options)?;
            Ok(Arc::new(HtmlLoader::new(opts)?))
        }
        PDF => {
            let opts: PdfLoaderOpts = decode_options("document loader", name, options)?;
            Ok(Arc::new(PdfLoader::new(opts)))
        }
        OOXML | "docx" | "pptx" | "xlsx" => Ok(Arc::new(OoxmlLoader)),
        other => Err(KnowledgeError::unknown("document loader", other)),
    }
}

/// The loader used when a flow does not name one. `None` for types that
/// have no loader (zip archives are expanded by the directory walker).
pub fn default_loader_for(filetype: FileType) -> Option<Arc<dyn DocumentLoader>> {
    match filetype {
        FileType::Text | FileType::Json | FileType::Csv => Some(Arc::new(PlainTextLoader)),
        FileType::Markdown => Some(Arc::new(MarkdownLoader)),
        FileType::Html => Some(Arc::new(HtmlLoader::default())),
        FileType::Pdf => Some(Arc::new(PdfLoader::default())),
        FileType::Docx | FileType::Pptx | FileType::Xlsx => Some(Arc::new(OoxmlLoader)),
        FileType::Zip => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_plaintext_is_strict_utf8() {
        let docs = PlainTextLoader.load("\u{feff}héllo".as_bytes()).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].content, "héllo");

        let err = PlainTextLoader.load(&[0xff, 0xfe, 0x00]).await.unwrap_err();
        assert!(matches!(err, KnowledgeError::Loader { .. }));
    }

    #[tokio::test]
    async fn test_html_visible_text() {
        let html = br#"<!DOCTYPE html><html><head><title>Doc</title><style>p{}</style></head>
            <body><h1>Heading</h1><script>var x = 1;</script><p>Body <b>text</b></p></body></html>"#;
        let docs = HtmlLoader::default().load(html).await.unwrap();
        assert_eq!(docs[0].content, "Heading\nBody\ntext");
        assert_eq!(docs[0].metadata_str("title").as_deref(), Some("Doc"));
    }

    #[tokio::test]
    async fn test_html_selector() {
        let loader = get_document_loader("html", Some(&json!({"selector": "article"}))).unwrap();
        let docs = loader
            .load(b"<html><body><nav>menu</nav><article>kept</article></body></html>")
            .await
            .unwrap();
        assert_eq!(docs[0].content, "kept");
    }

    #[test]
    fn test_invalid_selector_is_config_error() {
        let err = get_document_loader("html", Some(&json!({"selector": "[[["}))).err().unwrap();
        assert!(matches!(err, KnowledgeError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_pdf_garbage_is_loader_error() {
        let err = PdfLoader::default().load(b"not a pdf").await.unwrap_err();
        assert!(matches!(err, KnowledgeError::Loader { .. }));
    }

    #[test]
    fn test_registry() {
        assert_eq!(get_document_loader("text", None).unwrap().name(), PLAINTEXT);
        assert_eq!(get_document_loader("docx", None).unwrap().name(), OOXML);
        assert!(matches!(
            get_document_loader("nope", None).err().unwrap(),
            KnowledgeError::UnknownComponent { .. }
        ));
        assert!(default_loader_for(FileType::Zip).is_none());
        assert_eq!(default_loader_for(FileType::Csv).unwrap().name(), PLAINTEXT);
    }
}
