pub mod dlfcn;
pub mod dyld;
pub mod mmap;
pub mod symbols;

pub use dyld::{Image, LinkContext};
pub use mmap::MappedFile;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed mach-o image: {0}")]
    MalformedBinary(String),
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),
    #[error("memory mapping error: {0}")]
    MappingFailure(String),
    #[error("symbol not found: {0}")]
    SymbolNotFound(String),
}

impl From<scroll::Error> for Error {
    fn from(err: scroll::Error) -> Self {
        Error::MalformedBinary(err.to_string())
    }
}

pub type Result<T> = core::result::Result<T, Error>;
