use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid DOS signature (expected 0x5A4D)")]
    InvalidDosSignature,
    #[error("invalid PE signature (expected 0x00004550)")]
    InvalidPeSignature,
    #[error("input is truncated at offset {0:#x}")]
    Truncated(usize),
    #[error("unsupported machine type {0:#06x} (only AMD64 is handled)")]
    UnsupportedMachine(u16),
    #[error("unsupported optional header magic {0:#06x}")]
    UnsupportedMagic(u16),
    #[error("headerless input requires a section layout: {0}")]
    MissingLayout(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    ReadUnmapped,
    WriteUnmapped,
    FetchUnmapped,
    InvalidInstruction,
    Protection,
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FaultKind::ReadUnmapped => "read of unmapped memory",
            FaultKind::WriteUnmapped => "write to unmapped memory",
            FaultKind::FetchUnmapped => "fetch from unmapped memory",
            FaultKind::InvalidInstruction => "invalid instruction",
            FaultKind::Protection => "protection violation",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("error parsing input: {0}")]
    Parse(#[from] ParseError),
    #[error("rva {0:#x} is not covered by any mapped section")]
    OutOfRange(u64),
    #[error("disassembler rejected bytes at {0:#x}")]
    Decode(u64),
    #[error("emulation exceeded the step budget of {0}")]
    EmulationTimeout(usize),
    #[error("emulation fault at {addr:#x}: {kind}")]
    EmulationFault { addr: u64, kind: FaultKind },
    #[error("dispatcher at {0:#x} could not be resolved")]
    UnresolvedDispatcher(u64),
    #[error("block at {0:#x} was left unresolved")]
    UnresolvedBlock(u64),
    #[error("import stub at {site:#x} failed to decrypt: {reason}")]
    ImportDecrypt { site: u64, reason: String },
    #[error("output layout failed: {0}")]
    Layout(String),
    #[error("emulator backend error: {0}")]
    Emulator(String),
    #[error("instruction encoder error at {0:#x}: {1}")]
    Encode(u64, String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
