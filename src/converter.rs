//! Byte-format converters run before loading (e.g. docx → markdown).

use std::sync::Arc;

use async_trait::async_trait;

use knowledge_core::error::KnowledgeError;
use knowledge_core::filetype::FileType;

use crate::extract;

pub const OOXML: &str = "ooxml";

#[async_trait]
pub trait Converter: Send + Sync {
    fn name(&self) -> &str;
    async fn convert(
        &self,
        content: &[u8],
        from: FileType,
        to: FileType,
    ) -> Result<Vec<u8>, KnowledgeError>;
}

/// Converts docx/pptx/xlsx into plain text or markdown with blank lines
/// between paragraphs. Slides become `## Slide N` sections in markdown.
#[derive(Debug, Clone, Default)]
pub struct OoxmlConverter;

#[async_trait]
impl Converter for OoxmlConverter {
    fn name(&self) -> &str {
        OOXML
    }

    async fn convert(
        &self,
        content: &[u8],
        from: FileType,
        to: FileType,
    ) -> Result<Vec<u8>, KnowledgeError> {
        if !from.is_ooxml() {
            return Err(KnowledgeError::converter(
                OOXML,
                anyhow::anyhow!("cannot convert from {}", from),
            ));
        }
        if !matches!(to, FileType::Text | FileType::Markdown) {
            return Err(KnowledgeError::converter(
                OOXML,
                anyhow::anyhow!("cannot convert to {}", to),
            ));
        }

        let bytes = content.to_vec();
        let text = tokio::task::spawn_blocking(move || -> Result<String, extract::ExtractError> {
            if from == FileType::Pptx && to == FileType::Markdown {
                let slides = extract::extract_pptx_slides(&bytes)?;
                return Ok(slides
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| !s.trim().is_empty())
                    .map(|(i, s)| format!("## Slide {}\n\n{}", i + 1, paragraphs(s)))
                    .collect::<Vec<_>>()
                    .join("\n\n"));
            }
            let text = extract::extract_text(&bytes, from)?;
            Ok(if to == FileType::Markdown {
                paragraphs(&text)
            } else {
                text
            })
        })
        .await
        .map_err(|e| KnowledgeError::converter(OOXML, e))?
        .map_err(|e| KnowledgeError::converter(OOXML, e))?;

        Ok(text.into_bytes())
    }
}

/// One blank line between non-empty lines.
fn paragraphs(text: &str) -> String {
    text.lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn get_converter(
    name: &str,
    _options: Option<&serde_json::Value>,
) -> Result<Arc<dyn Converter>, KnowledgeError> {
    match name {
        OOXML => Ok(Arc::new(OoxmlConverter)),
        other => Err(KnowledgeError::unknown("converter", other)),
    }
}

/// A converter as configured on an ingestion flow.
#[derive(Clone)]
pub struct FlowConverter {
    pub converter: Arc<dyn Converter>,
    pub target_format: FileType,
    /// Fail the flow when conversion fails instead of loading the
    /// original bytes.
    pub must_try: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paragraphs() {
        assert_eq!(paragraphs("a\n\n\nb  \nc"), "a\n\nb\n\nc");
    }

    #[tokio::test]
    async fn test_rejects_non_ooxml_source() {
        let err = OoxmlConverter
            .convert(b"hello", FileType::Text, FileType::Markdown)
            .await
            .unwrap_err();
        assert!(matches!(err, KnowledgeError::Converter { .. }));
    }

    #[tokio::test]
    async fn test_corrupt_archive_fails() {
        let err = OoxmlConverter
            .convert(b"PK\x03\x04garbage", FileType::Docx, FileType::Text)
            .await
            .unwrap_err();
        assert!(matches!(err, KnowledgeError::Converter { .. }));
    }

    #[test]
    fn test_unknown_converter() {
        assert!(get_converter("pandoc", None).is_err());
    }
}
