//! Sample collection from `powermetrics`.
//!
//! ```text
//! ChunkSource ──bytes──► Reassembler ──record text──► parse_record ──Record──► Deriver ──Snapshot──► Store
//! ```
//!
//! - [`source`]: live child process or recorded file
//! - [`reassembler`]: splits the byte stream into complete plist records
//! - [`parser`]: plist record → [`parser::Record`]
//! - [`derive`]: unit normalization, rate correction, top-N ranking, carbon
//! - [`cmdline`]: optional renaming of interpreter processes
//! - [`pipeline`]: the collection loop tying these together

pub mod cmdline;
pub mod derive;
pub mod parser;
pub mod pipeline;
pub mod reassembler;
pub mod source;

pub use derive::{DeriveError, Deriver, TOP_N};
pub use parser::{ParseError, Record, parse_record};
pub use pipeline::{CollectError, Pipeline, run_collection};
pub use reassembler::Reassembler;
pub use source::{ChunkSource, FileSource, Poll, ProcessSource, SourceError};
