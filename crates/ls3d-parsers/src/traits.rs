// ls3d-parsers/src/traits.rs
//! Core traits defining the codec interface.
//!
//! This module establishes the shared reading/writing interface:
//! - Consistent error handling with byte offsets
//! - Streaming and memory-mapped file support
//! - Progress reporting for large files
//! - Hierarchy and human-readable views of a decoded model

use std::io::{Read, Seek, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during decoding or encoding
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid magic bytes: expected {expected:?}, found {found:?}")]
    InvalidMagic { expected: Vec<u8>, found: Vec<u8> },

    #[error("Unsupported version: {version}")]
    UnsupportedVersion { version: u32 },

    #[error("Unsupported record at offset {offset}: {kind}")]
    UnsupportedRecord { offset: u64, kind: String },

    #[error("String too long: {length} bytes encoded, at most 255 allowed")]
    StringTooLong { length: usize },

    #[error("Invalid face arity: expected 3 indices, got {arity}")]
    InvalidFaceArity { arity: usize },

    #[error("Corrupted data at offset {offset}: {message}")]
    CorruptedData { offset: u64, message: String },

    #[error("Invalid structure: {0}")]
    InvalidStructure(String),

    #[error("Nested error in {context}: {source}")]
    Nested {
        context: String,
        #[source]
        source: Box<ParseError>,
    },
}

impl ParseError {
    /// Wrap this error with additional context
    pub fn with_context(self, context: impl Into<String>) -> Self {
        ParseError::Nested {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Header-level rejection (wrong magic or version)
    pub fn is_format_error(&self) -> bool {
        match self {
            ParseError::InvalidMagic { .. } | ParseError::UnsupportedVersion { .. } => true,
            ParseError::Nested { source, .. } => source.is_format_error(),
            _ => false,
        }
    }

    /// Innermost error once all context layers are peeled off
    pub fn root_cause(&self) -> &ParseError {
        match self {
            ParseError::Nested { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

impl From<ParseError> for ls3d_core::Error {
    fn from(err: ParseError) -> Self {
        ls3d_core::Error::Codec(Box::new(err))
    }
}

/// Result type alias for parsing operations
pub type ParseResult<T> = Result<T, ParseError>;

/// Progress callback for long-running parse operations
pub type ProgressCallback = Box<dyn Fn(ParseProgress) + Send + Sync>;

/// Progress information during parsing
#[derive(Debug, Clone)]
pub struct ParseProgress {
    /// Current phase of parsing
    pub phase: ParsePhase,
    /// Bytes processed so far
    pub bytes_processed: u64,
    /// Total bytes to process (if known)
    pub total_bytes: Option<u64>,
    /// Current item being processed (e.g., frame name)
    pub current_item: Option<String>,
    /// Number of items processed
    pub items_processed: u64,
    /// Total items to process (if known)
    pub total_items: Option<u64>,
}

impl ParseProgress {
    pub(crate) fn new(phase: ParsePhase, bytes_processed: u64) -> Self {
        Self {
            phase,
            bytes_processed,
            total_bytes: None,
            current_item: None,
            items_processed: 0,
            total_items: None,
        }
    }

    /// Calculate percentage complete (0.0 - 1.0), by items when known
    pub fn percentage(&self) -> Option<f32> {
        if let Some(total) = self.total_items {
            return Some(if total == 0 {
                1.0
            } else {
                self.items_processed as f32 / total as f32
            });
        }
        self.total_bytes.map(|total| {
            if total == 0 {
                1.0
            } else {
                self.bytes_processed as f32 / total as f32
            }
        })
    }
}

/// Phases of the parsing process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsePhase {
    /// Reading file headers
    ReadingHeader,
    /// Reading the material table
    ReadingMaterials,
    /// Parsing individual records
    ParsingRecords,
    /// Reading trailing flags
    Finalizing,
    /// Parsing complete
    Complete,
}

/// Configuration options for decoding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParseOptions {
    /// Promote recoverable inconsistencies to errors
    pub strict_validation: bool,
    /// Decode geometry of LOD levels beyond the first. When false those
    /// levels are seek-skipped and only their counts are kept.
    pub import_lods: bool,
    /// Accept the HD2 (41) and Chameleon (42) variants on a best-effort basis
    pub allow_variant_versions: bool,
    /// Whether to use memory mapping for large files
    pub use_memory_mapping: bool,
    /// Minimum file size to enable memory mapping
    pub memory_mapping_threshold: u64,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            strict_validation: false,
            import_lods: true,
            allow_variant_versions: false,
            use_memory_mapping: true,
            memory_mapping_threshold: 10 * 1024 * 1024, // 10 MB
        }
    }
}

/// Core trait for format decoders
pub trait Parser: Send + Sync {
    /// The parsed output type
    type Output: Send + Sync;

    /// Returns the file extensions this parser handles (e.g., ["4ds"])
    fn extensions(&self) -> &[&str];

    /// Returns the magic bytes that identify this file type (if applicable)
    fn magic_bytes(&self) -> Option<&[u8]> {
        None
    }

    /// Returns a human-readable name for this parser
    fn name(&self) -> &str;

    /// Returns the format version(s) supported by this parser
    fn supported_versions(&self) -> &[u32] {
        &[]
    }

    /// Parse from a reader with default options
    fn parse<R: Read + Seek>(&self, reader: R) -> ParseResult<Self::Output> {
        self.parse_with_options(reader, &ParseOptions::default(), None)
    }

    /// Parse from a reader with custom options and optional progress callback
    fn parse_with_options<R: Read + Seek>(
        &self,
        reader: R,
        options: &ParseOptions,
        progress: Option<ProgressCallback>,
    ) -> ParseResult<Self::Output>;

    /// Parse from a file path
    fn parse_file(&self, path: &Path) -> ParseResult<Self::Output> {
        self.parse_file_with_options(path, &ParseOptions::default(), None)
    }

    /// Parse from a file path with options
    fn parse_file_with_options(
        &self,
        path: &Path,
        options: &ParseOptions,
        progress: Option<ProgressCallback>,
    ) -> ParseResult<Self::Output> {
        let file = std::fs::File::open(path)?;

        // Use memory mapping for large files if enabled
        if options.use_memory_mapping {
            let metadata = file.metadata()?;
            if metadata.len() >= options.memory_mapping_threshold {
                return self.parse_memory_mapped(path, options, progress);
            }
        }

        let reader = std::io::BufReader::new(file);
        self.parse_with_options(reader, options, progress)
    }

    /// Parse using memory-mapped I/O (for large files)
    fn parse_memory_mapped(
        &self,
        path: &Path,
        options: &ParseOptions,
        progress: Option<ProgressCallback>,
    ) -> ParseResult<Self::Output> {
        // Default implementation falls back to standard I/O
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        self.parse_with_options(reader, options, progress)
    }

    /// Check if this parser can handle the given file
    fn can_parse(&self, path: &Path) -> bool {
        if let Some(ext) = path.extension() {
            let ext_str = ext.to_string_lossy().to_lowercase();
            if self.extensions().iter().any(|e| e.to_lowercase() == ext_str) {
                return true;
            }
        }

        if let Some(magic) = self.magic_bytes() {
            if let Ok(file) = std::fs::File::open(path) {
                let mut reader = std::io::BufReader::new(file);
                let mut buffer = vec![0u8; magic.len()];
                if reader.read_exact(&mut buffer).is_ok() {
                    return buffer == magic;
                }
            }
        }

        false
    }
}

/// Counterpart of [`Parser`] for formats that can be written back
pub trait FormatWriter: Send + Sync {
    /// The value being serialized
    type Input;

    /// Serialize `input` into `writer`
    fn write<W: Write + Seek>(&self, input: &Self::Input, writer: W) -> ParseResult<()>;

    /// Serialize into a fresh byte buffer
    fn write_to_vec(&self, input: &Self::Input) -> ParseResult<Vec<u8>> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        self.write(input, &mut cursor)?;
        Ok(cursor.into_inner())
    }

    /// Serialize to a file path, replacing any existing file
    fn write_file(&self, input: &Self::Input, path: &Path) -> ParseResult<()> {
        let bytes = self.write_to_vec(input)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }
}

/// Trait for parsers that produce hierarchical/tree structures
pub trait HierarchicalParser: Parser {
    /// Node type in the hierarchy
    type Node: Send;

    /// Get the root node(s) of the parsed structure
    fn roots<'a>(&self, parsed: &'a Self::Output) -> Vec<&'a Self::Node>;

    /// Get children of a node
    fn children<'a>(&self, parsed: &'a Self::Output, node: &Self::Node) -> Vec<&'a Self::Node>;

    /// Check if a node is a leaf (no children)
    fn is_leaf(&self, parsed: &Self::Output, node: &Self::Node) -> bool {
        self.children(parsed, node).is_empty()
    }
}

/// Trait for converting parsed data to human-readable formats
pub trait HumanReadable {
    /// Convert to a human-readable string representation
    fn to_readable_string(&self) -> String;

    /// Convert to formatted JSON
    fn to_json(&self) -> serde_json::Value;

    /// Convert to formatted YAML (falls back to the text form)
    fn to_yaml(&self) -> String {
        serde_yaml::to_string(&self.to_json()).unwrap_or_else(|_| self.to_readable_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_progress_percentage() {
        let mut progress = ParseProgress::new(ParsePhase::ParsingRecords, 50);
        progress.total_bytes = Some(100);
        assert_eq!(progress.percentage(), Some(0.5));

        progress.items_processed = 1;
        progress.total_items = Some(4);
        assert_eq!(progress.percentage(), Some(0.25));
    }

    #[test]
    fn test_parse_error_context() {
        let error = ParseError::InvalidMagic {
            expected: b"4DS\0".to_vec(),
            found: vec![0x00, 0x00, 0x00, 0x00],
        };

        let contextualized = error.with_context("reading header");

        match &contextualized {
            ParseError::Nested { context, .. } => {
                assert_eq!(context, "reading header");
            }
            _ => panic!("Expected Nested error"),
        }
        assert!(contextualized.is_format_error());
        assert!(matches!(contextualized.root_cause(), ParseError::InvalidMagic { .. }));
    }

    #[test]
    fn test_options_from_partial_json() {
        let options: ParseOptions = serde_json::from_str(r#"{ "import_lods": false }"#).unwrap();
        assert!(!options.import_lods);
        assert!(!options.allow_variant_versions);
        assert_eq!(options.memory_mapping_threshold, 10 * 1024 * 1024);
    }

    #[test]
    fn test_codec_error_converts_to_core() {
        let err: ls3d_core::Error = ParseError::StringTooLong { length: 300 }.into();
        assert!(err.to_string().contains("300"));
    }
}
