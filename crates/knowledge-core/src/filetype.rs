//! Filetype detection from filename and content.
//!
//! Detection is deterministic: the extension table wins, then magic-byte
//! sniffing, then a UTF-8 check. Anything left over is reported as
//! [`KnowledgeError::UnsupportedFileType`] with the best MIME guess.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::KnowledgeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Pdf,
    Text,
    Markdown,
    Html,
    Json,
    Csv,
    Docx,
    Pptx,
    Xlsx,
    Zip,
}

const ALL: &[FileType] = &[
    FileType::Pdf,
    FileType::Text,
    FileType::Markdown,
    FileType::Html,
    FileType::Json,
    FileType::Csv,
    FileType::Docx,
    FileType::Pptx,
    FileType::Xlsx,
    FileType::Zip,
];

/// Source and config extensions treated as plain text.
const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "text", "log", "rst", "adoc", "org", "tex", "rs", "go", "py", "js", "ts", "tsx",
    "jsx", "java", "kt", "c", "h", "cc", "cpp", "hpp", "cs", "rb", "php", "swift", "scala", "sh",
    "bash", "zsh", "sql", "toml", "yaml", "yml", "ini", "cfg", "conf", "xml", "css", "scss",
    "lua", "proto", "graphql", "tf", "dockerfile", "makefile",
];

impl FileType {
    pub fn name(&self) -> &'static str {
        match self {
            FileType::Pdf => "pdf",
            FileType::Text => "text",
            FileType::Markdown => "markdown",
            FileType::Html => "html",
            FileType::Json => "json",
            FileType::Csv => "csv",
            FileType::Docx => "docx",
            FileType::Pptx => "pptx",
            FileType::Xlsx => "xlsx",
            FileType::Zip => "zip",
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            FileType::Pdf => "application/pdf",
            FileType::Text => "text/plain",
            FileType::Markdown => "text/markdown",
            FileType::Html => "text/html",
            FileType::Json => "application/json",
            FileType::Csv => "text/csv",
            FileType::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
            FileType::Pptx => {
                "application/vnd.openxmlformats-officedocument.presentationml.presentation"
            }
            FileType::Xlsx => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            FileType::Zip => "application/zip",
        }
    }

    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            FileType::Pdf => &["pdf"],
            FileType::Text => &["txt"],
            FileType::Markdown => &["md", "markdown", "mdx"],
            FileType::Html => &["html", "htm", "xhtml"],
            FileType::Json => &["json", "jsonl", "ndjson"],
            FileType::Csv => &["csv", "tsv"],
            FileType::Docx => &["docx"],
            FileType::Pptx => &["pptx"],
            FileType::Xlsx => &["xlsx"],
            FileType::Zip => &["zip"],
        }
    }

    pub fn is_ooxml(&self) -> bool {
        matches!(self, FileType::Docx | FileType::Pptx | FileType::Xlsx)
    }

    /// Resolve a filetype from a canonical name, an extension (with or
    /// without the leading dot) or a MIME type. Case-insensitive.
    pub fn from_name(name: &str) -> Option<FileType> {
        let name = name.trim().to_ascii_lowercase();
        let name = name.strip_prefix('.').unwrap_or(&name);
        if name.is_empty() {
            return None;
        }
        match name {
            "md" | "markdown" => return Some(FileType::Markdown),
            "txt" | "text" | "plaintext" => return Some(FileType::Text),
            _ => {}
        }
        ALL.iter().copied().find(|ft| {
            ft.name() == name || ft.mime() == name || ft.extensions().contains(&name)
        })
    }

    pub fn from_extension(ext: &str) -> Option<FileType> {
        let ext = ext.to_ascii_lowercase();
        if let Some(ft) = ALL.iter().copied().find(|ft| ft.extensions().contains(&ext.as_str())) {
            return Some(ft);
        }
        if TEXT_EXTENSIONS.contains(&ext.as_str()) {
            return Some(FileType::Text);
        }
        match mime_guess::from_ext(&ext).first() {
            Some(mime) if mime.type_() == mime_guess::mime::TEXT => Some(FileType::Text),
            _ => None,
        }
    }
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Detect the filetype of `content`, using `filename` as the primary hint.
pub fn detect_filetype(filename: &str, content: &[u8]) -> Result<FileType, KnowledgeError> {
    let path = Path::new(filename);
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    if let Some(ft) = ext.as_deref().and_then(FileType::from_extension) {
        return Ok(ft);
    }

    // Extensionless well-known names (Makefile, Dockerfile, LICENSE...).
    if ext.is_none() {
        let stem = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        if TEXT_EXTENSIONS.contains(&stem.as_str()) {
            return Ok(FileType::Text);
        }
    }

    if let Some(ft) = sniff(content) {
        return Ok(ft);
    }

    let guessed = mime_guess::from_path(path)
        .first_raw()
        .unwrap_or("application/octet-stream");
    Err(KnowledgeError::UnsupportedFileType {
        filetype: guessed.to_string(),
    })
}

fn sniff(content: &[u8]) -> Option<FileType> {
    if content.starts_with(b"%PDF-") {
        return Some(FileType::Pdf);
    }
    if content.starts_with(b"PK\x03\x04") {
        return Some(sniff_zip(content));
    }
    if content.contains(&0) {
        return None;
    }
    let text = std::str::from_utf8(content).ok()?;
    let head: String = text
        .trim_start_matches('\u{feff}')
        .trim_start()
        .chars()
        .take(64)
        .collect::<String>()
        .to_ascii_lowercase();
    if head.starts_with("<!doctype html") || head.starts_with("<html") {
        return Some(FileType::Html);
    }
    Some(FileType::Text)
}

/// OOXML packages are ZIP archives; their part names appear uncompressed in
/// the local file headers.
fn sniff_zip(content: &[u8]) -> FileType {
    let contains = |needle: &[u8]| content.windows(needle.len()).any(|w| w == needle);
    if contains(b"word/") {
        FileType::Docx
    } else if contains(b"ppt/") {
        FileType::Pptx
    } else if contains(b"xl/") {
        FileType::Xlsx
    } else {
        FileType::Zip
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_wins() {
        assert_eq!(detect_filetype("a.md", b"plain").unwrap(), FileType::Markdown);
        assert_eq!(detect_filetype("A.PDF", b"junk").unwrap(), FileType::Pdf);
        assert_eq!(detect_filetype("main.rs", b"fn main() {}").unwrap(), FileType::Text);
        assert_eq!(detect_filetype("x.docx", b"").unwrap(), FileType::Docx);
    }

    #[test]
    fn test_sniff_pdf_and_html() {
        assert_eq!(detect_filetype("upload", b"%PDF-1.4\n...").unwrap(), FileType::Pdf);
        assert_eq!(
            detect_filetype("page", b"<!DOCTYPE html><html></html>").unwrap(),
            FileType::Html
        );
    }

    #[test]
    fn test_sniff_ooxml_part_names() {
        let mut bytes = b"PK\x03\x04".to_vec();
        bytes.extend_from_slice(b"\x00\x00word/document.xml");
        assert_eq!(detect_filetype("blob", &bytes).unwrap(), FileType::Docx);
        let plain_zip = b"PK\x03\x04\x00\x00notes/a.txt".to_vec();
        assert_eq!(detect_filetype("blob", &plain_zip).unwrap(), FileType::Zip);
    }

    #[test]
    fn test_utf8_fallback_is_text() {
        assert_eq!(detect_filetype("README", b"hello world").unwrap(), FileType::Text);
        assert_eq!(detect_filetype("empty", b"").unwrap(), FileType::Text);
    }

    #[test]
    fn test_binary_is_unsupported() {
        let png = b"\x89PNG\r\n\x1a\n\x00\x00\x00\rIHDR";
        let err = detect_filetype("image.png", png).unwrap_err();
        match err {
            KnowledgeError::UnsupportedFileType { filetype } => assert_eq!(filetype, "image/png"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_from_name_accepts_names_extensions_and_mimes() {
        assert_eq!(FileType::from_name("markdown"), Some(FileType::Markdown));
        assert_eq!(FileType::from_name(".md"), Some(FileType::Markdown));
        assert_eq!(FileType::from_name("application/pdf"), Some(FileType::Pdf));
        assert_eq!(FileType::from_name("TXT"), Some(FileType::Text));
        assert_eq!(FileType::from_name("nope"), None);
        assert_eq!(FileType::from_name(""), None);
    }

    #[test]
    fn test_detection_is_deterministic() {
        let content = b"# Title\n\nbody";
        let first = detect_filetype("notes.md", content).unwrap();
        for _ in 0..5 {
            assert_eq!(detect_filetype("notes.md", content).unwrap(), first);
        }
    }
}
