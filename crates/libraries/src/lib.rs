pub mod descriptor;
pub mod directive;
pub mod fetch;
pub mod resolution;
pub mod resolver;

pub use descriptor::LibraryDescriptor;
pub use directive::{parse_cell, Directive, LibraryReference, LibrarySource, ParsedCell};
pub use fetch::{DescriptorFetcher, HttpFetcher};
pub use resolution::{
    DescriptorSource, GitHubRepository, ResolutionInfo, ResolutionInfoProvider, SourceKind,
};
pub use resolver::{CellSetup, LibraryResolver, ResolverConfig};

use std::{io, path::PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResolutionError {
    #[error("invalid directive `{directive}`: {reason}")]
    Syntax { directive: String, reason: String },
    #[error("unknown magic `%{0}`")]
    UnknownMagic(String),
    #[error("library `{name}` cannot be resolved by name through {fallback}")]
    UnsupportedFallback { name: String, fallback: String },
    #[error("library descriptor not found at {0}")]
    NotFound(String),
    #[error("failed to fetch {location}: {reason}")]
    Fetch { location: String, reason: String },
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed library descriptor at {location}: {source}")]
    MalformedDescriptor {
        location: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid arguments for library `{library}`: {reason}")]
    Arguments { library: String, reason: String },
}
