use crate::riff::FourCc;

#[derive(thiserror::Error, Debug)]
pub enum RiffError {
    #[error("Not a RIFF file")]
    NotRiff,

    #[error("Unexpected RIFF chunk with ID '{found}' (expected '{expected}')")]
    UnexpectedId { found: FourCc, expected: FourCc },

    #[error("Unexpected 'RIFF' chunk")]
    NestedRiff,

    #[error("Unexpected end of LIST while looking for chunk '{0}'")]
    UnexpectedChunkEnd(FourCc),

    #[error("Invalid RIFF chunk id {0:02X?}")]
    InvalidId([u8; 4]),

    #[error("Invalid RIFF list chunk size (odd number): chunk '{id}' size = {size}")]
    OddSize { id: FourCc, size: u32 },

    #[error(
        "Child chunk '{child}' (size = {child_size}, level = {child_level}) exceeds \
         parent chunk '{parent}' (size = {parent_size}, level = {parent_level})"
    )]
    SizeExceeded {
        child: FourCc,
        child_size: u32,
        child_level: usize,
        parent: FourCc,
        parent_size: u32,
        parent_level: usize,
    },

    #[error("RIFF engine in failed state: {0}")]
    EngineFailed(String),

    #[error("No open chunk at level {0}")]
    InvalidLevel(i32),

    #[error("No saved state to restore")]
    EmptyStateStack,
}

#[derive(thiserror::Error, Debug)]
pub enum SliError {
    #[error("Not a Spectralis file (chunk id = '{0}')")]
    NotSli(FourCc),

    #[error("Not an instrument group header (chunk id = '{id}', position = {position})")]
    BadGroupId { id: FourCc, position: u64 },

    #[error("Unexpected chunk size in instrument group header ({declared} > {remaining} remaining)")]
    GroupSizeMismatch { declared: u32, remaining: u64 },

    #[error("Sample index {index} out of range ({count} samples) in zone {zone} of instrument '{inst}'")]
    BadSampleIndex {
        index: u16,
        count: usize,
        zone: usize,
        inst: String,
    },

    #[error("Too many instruments, zones or samples. Header size {0} exceeds the 64 KiB budget")]
    HeaderSizeExceeded(u32),

    #[error("Unsupported channel count in sample '{0}'")]
    UnsupportedChannels(String),

    #[error("Could not determine instrument groups")]
    NoGroups,

    #[error("Zone {zone} of instrument '{inst}' references a missing sample")]
    MissingSample { zone: usize, inst: String },
}

#[derive(thiserror::Error, Debug)]
pub enum FormatError {
    #[error("Invalid sample format {0:#05X}")]
    Invalid(u16),

    #[error(
        "Channel map {map:#08X} routes destination channel {dest} from source channel {src}, \
         but the source has only {channels} channel(s)"
    )]
    BadChannelMap {
        map: u32,
        dest: usize,
        src: usize,
        channels: usize,
    },
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("Sample segment {offset}..{end} out of range ({size} frames)")]
    OutOfRange { offset: usize, end: usize, size: usize },

    #[error("Store backend is read only")]
    ReadOnly,
}

#[derive(thiserror::Error, Debug)]
pub enum FileError {
    #[error("Short read: wanted {wanted} bytes, got {got}")]
    ShortRead { wanted: usize, got: usize },

    #[error("Seek with uncommitted buffered writes")]
    DirtyBuffer,

    #[error("Buffered access outside loaded region (pos = {pos}, len = {len})")]
    BufRange { pos: usize, len: usize },
}
