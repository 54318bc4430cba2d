#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Not implemented")]
    Unimplemented,
    #[error("Cannot open image: {0}")]
    OpenFailed(std::io::Error),
    #[error("Cannot set device geometry")]
    GeometryFailed,
    #[error("Bad boot sector: {0}")]
    BadBootSector(&'static str),
    #[error("Short transfer at offset {offset}: {got} of {wanted} bytes")]
    ShortIo {
        offset: u64,
        wanted: usize,
        got: usize,
    },
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("No space left on filesystem")]
    NoSpace,
    #[error("Offset {offset} outside stream bounds")]
    BadOffset { offset: u64 },
    #[error("Loop detected in cluster chain at cluster {cluster}")]
    LoopDetected { cluster: u32 },
    #[error("Cannot derive filesystem parameters: {0}")]
    FormatInfeasible(#[from] FormatError),
    #[error("Non-zero data written to unmapped sectors")]
    ProtectedWrite,
    #[error("Bad data map: {0}")]
    BadMapping(String),
    #[error("Bad partition table: {0}")]
    BadPartition(&'static str),
    #[error("Internal error: {0}")]
    Internal(&'static str),
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatError {
    #[error("Too few sectors for any FAT filesystem")]
    TooFewSectors,
    #[error("Too few clusters for given number of FAT bits")]
    TooFewClusters,
    #[error("Too many clusters for given number of FAT bits")]
    TooManyClusters,
    #[error("Too many clusters for chosen FAT length")]
    TooManyClustersForFatLen,
}

pub type Result<T> = core::result::Result<T, Error>;
