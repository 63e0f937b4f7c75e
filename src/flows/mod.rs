//! Ingestion flows: converter → loader → splitter → transformers.
//!
//! A flow handles a set of filetypes. The orchestrator picks the first
//! flow that supports the detected type, fills in defaults for whatever
//! the flow leaves open and runs it over the file's bytes.

pub mod config;

use std::sync::Arc;

use knowledge_core::error::KnowledgeError;
use knowledge_core::filetype::FileType;
use knowledge_core::models::Document;
use knowledge_core::textsplitter::{
    get_text_splitter, merge_options, TextSplitter, TextSplitterOpts, MARKDOWN_SPLITTER,
    TOKEN_SPLITTER,
};
use knowledge_core::transformers::{
    run_transformers, FilterMarkdownDocsNoContent, Transformer, FILTER_MARKDOWN_DOCS_NO_CONTENT,
};

use crate::converter::FlowConverter;
use crate::documentloader::{default_loader_for, DocumentLoader};

#[derive(Clone, Default)]
pub struct IngestionFlowGlobals {
    /// Text splitter options applied under any per-flow splitter options.
    pub splitter_opts: Option<serde_json::Value>,
}

#[derive(Clone, Default)]
pub struct IngestionFlow {
    pub filetypes: Vec<FileType>,
    pub converter: Option<FlowConverter>,
    pub loader: Option<Arc<dyn DocumentLoader>>,
    pub splitter: Option<Arc<dyn TextSplitter>>,
    pub transformations: Vec<Arc<dyn Transformer>>,
    pub globals: IngestionFlowGlobals,
    /// Parts `fill_defaults` chose for the converter's output format.
    filled: FilledDefaults,
}

#[derive(Clone, Default)]
struct FilledDefaults {
    splitter_opts: Option<serde_json::Value>,
    splitter: bool,
    markdown_filter: bool,
}

fn default_splitter(
    filetype: FileType,
    opts: Option<&serde_json::Value>,
) -> Result<Arc<dyn TextSplitter>, KnowledgeError> {
    let name = if filetype == FileType::Markdown {
        MARKDOWN_SPLITTER
    } else {
        TOKEN_SPLITTER
    };
    get_text_splitter(name, opts)
}

impl IngestionFlow {
    pub fn supports_filetype(&self, filetype: FileType) -> bool {
        self.filetypes.contains(&filetype)
    }

    /// Resolve the default loader, splitter and markdown filter for
    /// `filetype` where the flow configures none.
    pub fn fill_defaults(
        &mut self,
        filetype: FileType,
        splitter_opts: &TextSplitterOpts,
    ) -> Result<(), KnowledgeError> {
        if self.loader.is_none() && self.converter.is_none() {
            self.loader = default_loader_for(filetype);
        }

        let effective = self
            .converter
            .as_ref()
            .map(|c| c.target_format)
            .unwrap_or(filetype);

        if self.splitter.is_none() {
            let base = splitter_opts.to_value();
            let opts = merge_options(Some(&base), self.globals.splitter_opts.as_ref());
            self.splitter = Some(default_splitter(effective, opts.as_ref())?);
            self.filled.splitter = true;
            self.filled.splitter_opts = opts;
        }

        if self.transformations.is_empty() && effective == FileType::Markdown {
            self.transformations.push(Arc::new(FilterMarkdownDocsNoContent));
            self.filled.markdown_filter = true;
        }
        Ok(())
    }

    /// Splitter and transformers for loading the unconverted bytes after
    /// an optional conversion failed. Defaults picked for the converter's
    /// output format are re-picked for `filetype`; configured parts stay.
    fn fallback_parts(
        &self,
        filetype: FileType,
    ) -> Result<(Option<Arc<dyn TextSplitter>>, Vec<Arc<dyn Transformer>>), KnowledgeError> {
        let splitter = if self.filled.splitter {
            Some(default_splitter(filetype, self.filled.splitter_opts.as_ref())?)
        } else {
            self.splitter.clone()
        };
        let mut transformations = self.transformations.clone();
        if self.filled.markdown_filter && filetype != FileType::Markdown {
            transformations.retain(|t| t.name() != FILTER_MARKDOWN_DOCS_NO_CONTENT);
        }
        Ok((splitter, transformations))
    }

    /// True when the flow can produce raw documents, either through its
    /// loader or through a converter whose output has a default loader.
    pub fn can_load(&self) -> bool {
        self.loader.is_some()
            || self
                .converter
                .as_ref()
                .is_some_and(|c| default_loader_for(c.target_format).is_some())
    }

    pub async fn run(
        &self,
        content: &[u8],
        filename: &str,
        filetype: FileType,
    ) -> Result<Vec<Document>, KnowledgeError> {
        let mut loader = self.loader.clone();
        let mut converted: Option<Vec<u8>> = None;
        let mut fallback = None;

        if let Some(conv) = &self.converter {
            match conv
                .converter
                .convert(content, filetype, conv.target_format)
                .await
            {
                Ok(bytes) => {
                    tracing::debug!(
                        filename,
                        from = %filetype,
                        to = %conv.target_format,
                        converter = conv.converter.name(),
                        "converted document"
                    );
                    if loader.is_none() {
                        loader = default_loader_for(conv.target_format);
                    }
                    converted = Some(bytes);
                }
                Err(e) if conv.must_try => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        filename,
                        converter = conv.converter.name(),
                        error = %e,
                        "conversion failed, loading original content"
                    );
                    if loader.is_none() {
                        loader = default_loader_for(filetype);
                    }
                    fallback = Some(self.fallback_parts(filetype)?);
                }
            }
        }

        let loader = loader.ok_or_else(|| KnowledgeError::UnsupportedFileType {
            filetype: filetype.name().to_string(),
        })?;
        let raw = loader
            .load(converted.as_deref().unwrap_or(content))
            .await?;

        let (splitter, transformations) = match &fallback {
            Some((splitter, transformations)) => (splitter.as_ref(), transformations),
            None => (self.splitter.as_ref(), &self.transformations),
        };
        let docs = match splitter {
            Some(splitter) => splitter.split_documents(raw)?,
            None => raw,
        };
        run_transformers(transformations, docs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::{Converter, OoxmlConverter};
    use async_trait::async_trait;

    struct FailingConverter;

    #[async_trait]
    impl Converter for FailingConverter {
        fn name(&self) -> &str {
            "failing"
        }
        async fn convert(
            &self,
            _: &[u8],
            _: FileType,
            _: FileType,
        ) -> Result<Vec<u8>, KnowledgeError> {
            Err(KnowledgeError::converter("failing", anyhow::anyhow!("boom")))
        }
    }

    fn flow_with_failing_converter(must_try: bool) -> IngestionFlow {
        IngestionFlow {
            filetypes: vec![FileType::Text],
            converter: Some(FlowConverter {
                converter: Arc::new(FailingConverter),
                target_format: FileType::Markdown,
                must_try,
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_default_text_flow() {
        let mut flow = IngestionFlow::default();
        flow.fill_defaults(FileType::Text, &TextSplitterOpts::default())
            .unwrap();
        assert!(flow.can_load());
        let docs = flow.run(b"hello world", "a.txt", FileType::Text).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].content, "hello world");
    }

    #[tokio::test]
    async fn test_markdown_defaults_filter_heading_only_chunks() {
        let mut flow = IngestionFlow::default();
        flow.fill_defaults(FileType::Markdown, &TextSplitterOpts::default())
            .unwrap();
        assert_eq!(flow.transformations.len(), 1);
        let docs = flow
            .run(b"# Title\n\n## Empty\n\n## Full\n\nbody", "a.md", FileType::Markdown)
            .await
            .unwrap();
        assert!(docs.iter().all(|d| d.content.contains("body")));
    }

    #[tokio::test]
    async fn test_optional_converter_failure_falls_back() {
        let mut flow = flow_with_failing_converter(false);
        flow.fill_defaults(FileType::Text, &TextSplitterOpts::default())
            .unwrap();
        let docs = flow.run(b"plain", "a.txt", FileType::Text).await.unwrap();
        assert_eq!(docs[0].content, "plain");
    }

    #[tokio::test]
    async fn test_fallback_splits_as_original_format() {
        let mut flow = flow_with_failing_converter(false);
        flow.fill_defaults(FileType::Text, &TextSplitterOpts::default())
            .unwrap();
        assert_eq!(flow.splitter.as_ref().unwrap().name(), MARKDOWN_SPLITTER);

        let content = b"# Setup\n\ninstall it\n\n# Usage\n\nrun it";
        let docs = flow.run(content, "notes.txt", FileType::Text).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert!(docs[0].content.contains("install it"));
        assert!(docs[0].content.contains("run it"));
    }

    #[tokio::test]
    async fn test_fallback_keeps_configured_splitter() {
        let mut flow = flow_with_failing_converter(false);
        flow.splitter = Some(get_text_splitter(MARKDOWN_SPLITTER, None).unwrap());
        flow.fill_defaults(FileType::Text, &TextSplitterOpts::default())
            .unwrap();

        let content = b"# Setup\n\ninstall it\n\n# Usage\n\nrun it";
        let docs = flow.run(content, "notes.txt", FileType::Text).await.unwrap();
        assert_eq!(docs.len(), 2);
    }

    #[tokio::test]
    async fn test_must_try_converter_failure_is_fatal() {
        let mut flow = flow_with_failing_converter(true);
        flow.fill_defaults(FileType::Text, &TextSplitterOpts::default())
            .unwrap();
        let err = flow.run(b"plain", "a.txt", FileType::Text).await.unwrap_err();
        assert!(matches!(err, KnowledgeError::Converter { .. }));
    }

    #[tokio::test]
    async fn test_no_loader_is_unsupported() {
        let mut flow = IngestionFlow::default();
        flow.fill_defaults(FileType::Zip, &TextSplitterOpts::default())
            .unwrap();
        assert!(!flow.can_load());
        let err = flow.run(b"PK", "a.zip", FileType::Zip).await.unwrap_err();
        assert!(err.is_unsupported());
    }

    #[test]
    fn test_global_splitter_options_apply() {
        let mut flow = IngestionFlow {
            globals: IngestionFlowGlobals {
                splitter_opts: Some(serde_json::json!({"chunkSize": 8, "chunkOverlap": 2})),
            },
            ..Default::default()
        };
        flow.fill_defaults(FileType::Text, &TextSplitterOpts::default())
            .unwrap();
        let chunks = flow
            .splitter
            .as_ref()
            .unwrap()
            .split_text(&"word ".repeat(40))
            .unwrap();
        assert!(chunks.len() > 1);
    }

    #[test]
    fn test_converter_target_drives_defaults() {
        let mut flow = IngestionFlow {
            filetypes: vec![FileType::Docx],
            converter: Some(FlowConverter {
                converter: Arc::new(OoxmlConverter),
                target_format: FileType::Markdown,
                must_try: true,
            }),
            ..Default::default()
        };
        flow.fill_defaults(FileType::Docx, &TextSplitterOpts::default())
            .unwrap();
        assert!(flow.loader.is_none());
        assert!(flow.can_load());
        assert_eq!(flow.splitter.as_ref().unwrap().name(), MARKDOWN_SPLITTER);
    }
}
