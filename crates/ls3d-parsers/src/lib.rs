//! ls3d-parsers
//!
//! Binary codec for LS3D engine model files.
//!
//! # Supported Formats
//!
//! | Format | Extension | Description |
//! |--------|-----------|-------------|
//! | 4DS    | `.4ds`    | Model: materials, meshes, skins, morphs, sectors, joints |
//!
//! # Example
//!
//! ```rust,ignore
//! use ls3d_parsers::{FdsParser, Parser};
//!
//! let parser = FdsParser::new();
//! let model = parser.parse_file("models/box.4ds".as_ref())?;
//!
//! println!("Found {} frames", model.frames.len())
//! ```

pub mod fds;
pub mod logging;
pub mod traits;

// Re-export main types
pub use traits::{
    FormatWriter, HierarchicalParser, HumanReadable, ParseError, ParseOptions, ParsePhase, ParseProgress, ParseResult,
    Parser, ProgressCallback,
};

pub use fds::{
    FdsModel, FdsParser, FdsVersion, FdsWriter, Frame, FrameHeader, FramePayload, FrameType, Material, MaterialFlags,
    MaterialId, Truncation, VisualType,
};
