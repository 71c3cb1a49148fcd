use std::path::PathBuf;

use crate::cancel::is_cancelled;

/// error type for stemforge operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unexpected end of input in delta stream")]
    UnexpectedEof,

    #[error("not a delta stream: bad magic {0:#010x}")]
    BadMagic(u32),

    #[error("corrupt delta: {0}")]
    CorruptDelta(String),

    #[error("checksum requested but delta carries no target checksum")]
    MissingChecksum,

    #[error("target checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("too many entries in archive (limit is {0})")]
    TooManyEntries(usize),

    #[error("archive contains subdirectory: {0}")]
    UnsupportedSubdirectory(String),

    #[error("archive entry {name} has unsupported type: {kind}")]
    UnsupportedEntryType { name: String, kind: String },

    #[error("refusing to overwrite existing file: {0}")]
    EntryExists(PathBuf),

    #[error("invalid hardware package: {0}")]
    InvalidPackage(String),

    #[error("no block found with identifier: {0}")]
    ElementNotFound(String),

    #[error("{count} blocks found with identifier: {id}")]
    MultipleElementsFound { id: String, count: usize },

    #[error("malformed document: {0}")]
    MalformedDocument(String),

    #[error("workspace directory is missing: {0}")]
    WorkspaceMissing(PathBuf),

    #[error("could not locate conversion tool 'ovftool'")]
    ConverterNotFound,

    #[error(
        "converting {tool}: {status}\n-- BEGIN STDERR OUTPUT --\n{output}\n-- END STDERR OUTPUT --"
    )]
    ConversionFailed {
        tool: PathBuf,
        status: String,
        output: String,
    },

    #[error("invalid version ({0}) expected format [NUMBER].[NUMBER]")]
    InvalidVersion(String),

    #[error("invalid configuration:\n  {}", .0.join("\n  "))]
    InvalidConfig(Vec<String>),

    #[error("output file already exists: {0}")]
    OutputExists(PathBuf),

    #[error("publishing {package}: {source}")]
    Publish {
        package: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("interrupted")]
    Interrupted,

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("config serialization error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),
}

/// failure taxonomy used to decide how a failure is reported
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    InputValidation,
    Integrity,
    Resource,
    ExternalTool,
    Interrupted,
    Invariant,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::UnexpectedEof
            | Error::BadMagic(_)
            | Error::CorruptDelta(_)
            | Error::TooManyEntries(_)
            | Error::UnsupportedSubdirectory(_)
            | Error::UnsupportedEntryType { .. }
            | Error::InvalidPackage(_)
            | Error::ElementNotFound(_)
            | Error::MultipleElementsFound { .. }
            | Error::MalformedDocument(_)
            | Error::InvalidVersion(_)
            | Error::InvalidConfig(_)
            | Error::Config(_) => ErrorClass::InputValidation,
            Error::MissingChecksum | Error::ChecksumMismatch { .. } => ErrorClass::Integrity,
            Error::EntryExists(_)
            | Error::WorkspaceMissing(_)
            | Error::OutputExists(_)
            | Error::Publish { .. }
            | Error::Io { .. }
            | Error::ConfigSerialize(_) => ErrorClass::Resource,
            Error::ConverterNotFound | Error::ConversionFailed { .. } => ErrorClass::ExternalTool,
            Error::Interrupted => ErrorClass::Interrupted,
            Error::Invariant(_) => ErrorClass::Invariant,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.class() == ErrorClass::Interrupted
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// helper to wrap io errors with path context
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| io_error(path, source))
    }
}

/// attach a path to an io error, surfacing cancellation as `Interrupted`
pub(crate) fn io_error(path: impl Into<PathBuf>, source: std::io::Error) -> Error {
    if is_cancelled(&source) {
        return Error::Interrupted;
    }
    Error::Io {
        path: path.into(),
        source,
    }
}
