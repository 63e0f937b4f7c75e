//! Declarative flow configuration (JSON or TOML).
//!
//! ```toml
//! [flows.docs]
//! default = true
//!
//! [flows.docs.globals.ingestion.textsplitter]
//! chunkSize = 1024
//! chunkOverlap = 128
//!
//! [[flows.docs.ingestion]]
//! filetypes = ["docx", "pptx"]
//! converter = { name = "ooxml", targetFormat = "markdown", mustTry = true }
//!
//! [[flows.docs.ingestion]]
//! filetypes = ["html"]
//! documentLoader = { name = "html", options = { selector = "main" } }
//! transformers = [{ name = "filter_short_docs", options = { minLength = 20 } }]
//!
//! [flows.docs.retrieval]
//! queryModifiers = [{ name = "normalize" }]
//! postprocessors = [{ name = "similarity", options = { threshold = 0.6, keepMin = 3 } }]
//!
//! [datasets]
//! handbook = "docs"
//! ```
//!
//! `${VAR}` and `$VAR` references are expanded from the environment before
//! parsing. A reference of the form `blueprint:<name>` loads a built-in
//! configuration instead of a file.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use knowledge_core::error::KnowledgeError;
use knowledge_core::filetype::FileType;
use knowledge_core::retrieval::{
    get_postprocessor, get_query_modifier, get_retriever, RetrievalFlow,
};
use knowledge_core::textsplitter::{get_text_splitter, merge_options, TextSplitterOpts};
use knowledge_core::transformers::get_transformer;

use super::{IngestionFlow, IngestionFlowGlobals};
use crate::converter::{get_converter, FlowConverter};
use crate::documentloader::get_document_loader;

const BLUEPRINT_PREFIX: &str = "blueprint:";

const DEFAULT_BLUEPRINT: &str = r#"
[flows.default]
default = true

[[flows.default.ingestion]]
filetypes = ["docx", "pptx", "xlsx"]
converter = { name = "ooxml", targetFormat = "markdown", mustTry = false }

[[flows.default.ingestion]]
filetypes = ["markdown"]
textSplitter = { name = "markdown" }
transformers = [{ name = "filter_markdown_docs_no_content" }]

[flows.default.retrieval]
retriever = { name = "basic" }
postprocessors = [{ name = "similarity", options = { threshold = 0.5, keepMin = 3 } }]
"#;

/// A registry component reference: name plus options blob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenericBaseConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
}

impl GenericBaseConfig {
    fn normalized_name(&self) -> String {
        self.name.trim().to_lowercase()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowConfig {
    #[serde(default)]
    pub flows: BTreeMap<String, FlowConfigEntry>,
    /// Dataset id → flow name.
    #[serde(default)]
    pub datasets: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowConfigEntry {
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub globals: FlowConfigEntryGlobalOpts,
    #[serde(default)]
    pub ingestion: Vec<IngestionFlowConfig>,
    #[serde(default)]
    pub retrieval: Option<RetrievalFlowConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowConfigEntryGlobalOpts {
    #[serde(default)]
    pub ingestion: FlowConfigGlobalsIngestion,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowConfigGlobalsIngestion {
    #[serde(default)]
    pub textsplitter: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionFlowConfig {
    #[serde(default)]
    pub filetypes: Vec<String>,
    #[serde(default)]
    pub converter: Option<ConverterConfig>,
    #[serde(default)]
    pub document_loader: Option<GenericBaseConfig>,
    #[serde(default)]
    pub text_splitter: Option<GenericBaseConfig>,
    #[serde(default)]
    pub transformers: Vec<GenericBaseConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConverterConfig {
    pub name: String,
    #[serde(default)]
    pub options: Option<serde_json::Value>,
    #[serde(default)]
    pub target_format: String,
    #[serde(default)]
    pub must_try: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalFlowConfig {
    /// Rewrite the query before it reaches the retriever.
    #[serde(default)]
    pub query_modifiers: Vec<GenericBaseConfig>,
    #[serde(default)]
    pub retriever: Option<GenericBaseConfig>,
    /// Filter or rewrite retrieved documents before they are returned.
    #[serde(default)]
    pub postprocessors: Vec<GenericBaseConfig>,
}

/// Expand `${VAR}` and `$VAR` from the process environment. Unset
/// variables expand to the empty string.
pub fn expand_env_vars(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        if let Some(body) = after.strip_prefix('{') {
            match body.find('}') {
                Some(end) => {
                    out.push_str(&std::env::var(&body[..end]).unwrap_or_default());
                    rest = &body[end + 1..];
                }
                None => {
                    out.push_str(&rest[pos..]);
                    rest = "";
                }
            }
            continue;
        }
        let len = after
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '_'))
            .map(|(i, _)| i)
            .unwrap_or(after.len());
        if len == 0 {
            out.push('$');
        } else {
            out.push_str(&std::env::var(&after[..len]).unwrap_or_default());
        }
        rest = &after[len..];
    }
    out.push_str(rest);
    out
}

pub fn get_blueprint(name: &str) -> Result<&'static str, KnowledgeError> {
    match name {
        "default" => Ok(DEFAULT_BLUEPRINT),
        other => Err(KnowledgeError::unknown("blueprint", other)),
    }
}

impl FlowConfig {
    /// Load from a file path or a `blueprint:<name>` reference.
    pub fn load(reference: &str) -> Result<Self> {
        match reference.strip_prefix(BLUEPRINT_PREFIX) {
            Some(name) => Ok(Self::parse(get_blueprint(name)?)?),
            None => Self::from_file(Path::new(reference)),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read flow config: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Invalid flow config: {}", path.display()))
    }

    /// Parse JSON (content starting with `{`) or TOML, after environment
    /// expansion, and validate.
    pub fn parse(content: &str) -> Result<Self, KnowledgeError> {
        let expanded = expand_env_vars(content);
        let config: FlowConfig = if expanded.trim_start().starts_with('{') {
            serde_json::from_str(&expanded)
                .map_err(|e| KnowledgeError::InvalidConfig(format!("flow config: {}", e)))?
        } else {
            toml::from_str(&expanded)
                .map_err(|e| KnowledgeError::InvalidConfig(format!("flow config: {}", e)))?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), KnowledgeError> {
        let mut has_default = false;
        for (name, flow) in &self.flows {
            if flow.default {
                if has_default {
                    return Err(KnowledgeError::InvalidConfig(
                        "multiple flows are marked as default".to_string(),
                    ));
                }
                has_default = true;
            }

            if flow.ingestion.is_empty() && flow.retrieval.is_none() {
                return Err(KnowledgeError::InvalidConfig(format!(
                    "flow {:?} has neither ingestion nor retrieval specified",
                    name
                )));
            }

            for (idx, ingestion) in flow.ingestion.iter().enumerate() {
                if ingestion.filetypes.is_empty() {
                    return Err(KnowledgeError::InvalidConfig(format!(
                        "flow {:?}.ingestion.[{}] has no filetypes specified",
                        name, idx
                    )));
                }
                if let Some(conv) = &ingestion.converter {
                    if !conv.name.is_empty() && conv.target_format.is_empty() {
                        return Err(KnowledgeError::InvalidConfig(format!(
                            "flow {:?}.ingestion.[{}].converter.targetFormat is required",
                            name, idx
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn get_flow(&self, name: &str) -> Result<&FlowConfigEntry, KnowledgeError> {
        self.flows
            .get(name)
            .ok_or_else(|| KnowledgeError::unknown("flow", name))
    }

    pub fn default_flow(&self) -> Option<&FlowConfigEntry> {
        self.flows.values().find(|f| f.default)
    }

    /// The flow mapped to `dataset_id`, else the default flow.
    pub fn for_dataset(&self, dataset_id: &str) -> Result<Option<&FlowConfigEntry>, KnowledgeError> {
        match self.datasets.get(dataset_id) {
            Some(flow) => {
                tracing::debug!(dataset = dataset_id, flow = %flow, "flow assigned to dataset");
                self.get_flow(flow).map(Some)
            }
            None => {
                tracing::debug!(dataset = dataset_id, "no flow assigned to dataset, using default");
                Ok(self.default_flow())
            }
        }
    }
}

fn parse_filetype(value: &str) -> Result<FileType, KnowledgeError> {
    FileType::from_name(value)
        .ok_or_else(|| KnowledgeError::InvalidConfig(format!("unknown filetype {:?}", value)))
}

impl FlowConfigEntry {
    pub fn as_ingestion_flows(
        &self,
        base: &TextSplitterOpts,
    ) -> Result<Vec<IngestionFlow>, KnowledgeError> {
        self.ingestion
            .iter()
            .map(|i| i.as_ingestion_flow(&self.globals.ingestion, base))
            .collect()
    }

    pub fn as_retrieval_flow(&self) -> Result<RetrievalFlow, KnowledgeError> {
        match &self.retrieval {
            Some(r) => r.as_retrieval_flow(),
            None => Ok(RetrievalFlow::default()),
        }
    }
}

impl IngestionFlowConfig {
    /// Build the flow. Splitter options are layered: `base` (application
    /// config), then the flow's globals, then the entry's own options.
    pub fn as_ingestion_flow(
        &self,
        globals: &FlowConfigGlobalsIngestion,
        base: &TextSplitterOpts,
    ) -> Result<IngestionFlow, KnowledgeError> {
        let mut flow = IngestionFlow {
            filetypes: self
                .filetypes
                .iter()
                .map(|f| parse_filetype(f))
                .collect::<Result<_, _>>()?,
            globals: IngestionFlowGlobals {
                splitter_opts: globals.textsplitter.clone(),
            },
            ..Default::default()
        };

        if let Some(conv) = self.converter.as_ref().filter(|c| !c.name.is_empty()) {
            let name = conv.name.trim().to_lowercase();
            flow.converter = Some(FlowConverter {
                converter: get_converter(&name, conv.options.as_ref())?,
                target_format: parse_filetype(&conv.target_format)?,
                must_try: conv.must_try,
            });
        }

        if let Some(loader) = self.document_loader.as_ref().filter(|l| !l.name.is_empty()) {
            flow.loader = Some(get_document_loader(
                &loader.normalized_name(),
                loader.options.as_ref(),
            )?);
        }

        if let Some(splitter) = self.text_splitter.as_ref().filter(|s| !s.name.is_empty()) {
            let base_value = base.to_value();
            let layered = merge_options(Some(&base_value), globals.textsplitter.as_ref());
            let opts = merge_options(layered.as_ref(), splitter.options.as_ref());
            flow.splitter = Some(get_text_splitter(&splitter.normalized_name(), opts.as_ref())?);
        }

        for tf in &self.transformers {
            let transformer = get_transformer(&tf.normalized_name(), tf.options.as_ref())?;
            tracing::debug!(name = %tf.name, "configured transformer");
            flow.transformations.push(transformer);
        }

        Ok(flow)
    }
}

impl RetrievalFlowConfig {
    pub fn as_retrieval_flow(&self) -> Result<RetrievalFlow, KnowledgeError> {
        let mut flow = RetrievalFlow::default();

        for qm in &self.query_modifiers {
            flow.query_modifiers
                .push(get_query_modifier(&qm.normalized_name(), qm.options.as_ref())?);
        }

        if let Some(r) = &self.retriever {
            flow.retriever = Some(get_retriever(&r.normalized_name(), r.options.as_ref())?);
        }

        for pp in &self.postprocessors {
            flow.postprocessors
                .push(get_postprocessor(&pp.normalized_name(), pp.options.as_ref())?);
        }

        Ok(flow)
    }
}
