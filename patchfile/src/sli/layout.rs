//! On-disk layout of Spectralis SLI/SLC files.
//!
//! All multi-byte fields are little endian; the four FOURCC tags are raw
//! bytes. The flat header structs derive [`WireWrite`] so the writer can
//! serialize them into its staged header region in one call.

pub use patchfile_macros::ToWire;

use crate::riff::FourCc;

pub const FOURCC_SIFI: FourCc = FourCc(*b"SiFi");
pub const FOURCC_SIIG: FourCc = FourCc(*b"SiIg");
pub const FOURCC_SIDP: FourCc = FourCc(*b"SiDp");

/// Version field carried by every Spectralis header.
pub const SPECHDR: u16 = 0x0100;

/// File info header size, not counting the 8-byte chunk header.
pub const SIFI_SIZE: u32 = 8;
/// Instrument group header size.
pub const SIIG_SIZE: u32 = 28;
/// Instrument header size.
pub const INST_SIZE: u32 = 40;
/// Zone header size.
pub const ZONE_SIZE: u32 = 76;
/// Sample header size.
pub const SMPL_SIZE: u32 = 48;
/// Instrument terminator size.
pub const SIDP_SIZE: u32 = 12;
/// Budget for a group's header region (everything before sample data).
pub const HEAD_SIZE: u32 = 64 * 1024;

/// Length of instrument and sample name fields.
pub const NAME_SIZE: usize = 24;

/// Wire serialization of the Spectralis headers. Integers go out little
/// endian per the format; FOURCC tags and name fields are `u8` arrays and
/// pass through as raw bytes. `#[derive(ToWire)]` composes a struct's
/// fields in declaration order, which is exactly the on-disk order for
/// every header here.
pub trait WireWrite {
    /// Append this value's wire bytes.
    fn put(&self, out: &mut Vec<u8>);

    /// Serialize into a fresh byte vector.
    fn wire_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.put(&mut out);
        out
    }
}

macro_rules! wire_int {
    ($($t:ty),+) => { $(
        impl WireWrite for $t {
            #[inline]
            fn put(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
        }
    )+ }
}

wire_int!(u8, i8, u16, i16, u32, i32);

impl<T: WireWrite, const N: usize> WireWrite for [T; N] {
    fn put(&self, out: &mut Vec<u8>) {
        for item in self {
            item.put(out);
        }
    }
}

/// File info header.
#[derive(Debug, Clone, ToWire)]
pub struct SiFi {
    pub ckid: [u8; 4],
    /// Total file length; patched after the last group is written.
    pub cklen: u32,
    pub spechdr: u16,
    pub unused: u16,
    /// Number of instrument groups.
    pub ignum: u16,
    /// File offset of the first instrument group.
    pub igstart_offs: u16,
}

/// Instrument group header. All offsets are relative to the start of the
/// group chunk.
#[derive(Debug, Clone, Default, ToWire)]
pub struct SiIg {
    pub ckid: [u8; 4],
    pub cklen: u32,
    pub spechdr: u16,
    pub unused1: u16,
    pub inst_offs: u16,
    pub instnum: u16,
    pub zones_offs: u16,
    pub allzones_num: u16,
    pub smphdr_offs: u16,
    /// Largest zone count of any instrument in the group.
    pub maxzones_num: u16,
    pub smpdata_offs: u16,
    pub unused2: u16,
}

/// Instrument header.
#[derive(Debug, Clone, ToWire)]
pub struct InstHeader {
    pub name: [u8; NAME_SIZE],
    pub sound_id: u32,
    pub unused1: u32,
    pub category: u16,
    pub unused2: u16,
    /// Index of this instrument's first zone header.
    pub zone_idx: u16,
    pub zones_num: u16,
}

/// Sample header. `start`/`end` are byte offsets into the group's sample
/// data region; loop points are byte offsets within the sample.
#[derive(Debug, Clone, ToWire)]
pub struct SampleHeader {
    pub name: [u8; NAME_SIZE],
    pub start: u32,
    pub end: u32,
    pub loop_start: u32,
    pub loop_end: u32,
    pub fine_tune: i8,
    pub root_note: u8,
    pub channels: u8,
    pub bits_per_sample: u8,
    pub sample_rate: u32,
}

/// Instrument terminator, one per instrument after a group's sample data.
#[derive(Debug, Clone, ToWire)]
pub struct SiDp {
    pub ckid: [u8; 4],
    pub cklen: u32,
    pub spechdr: u16,
    pub unused: u16,
}

impl SiDp {
    pub fn new() -> Self {
        Self {
            ckid: FOURCC_SIDP.0,
            cklen: SIDP_SIZE,
            spechdr: SPECHDR,
            unused: 0,
        }
    }
}

impl Default for SiDp {
    fn default() -> Self {
        Self::new()
    }
}

/// Truncate or NUL-pad a name into its fixed-size field.
pub fn name_bytes(name: &str) -> [u8; NAME_SIZE] {
    let mut out = [0u8; NAME_SIZE];
    let bytes = name.as_bytes();
    let len = bytes.len().min(NAME_SIZE);
    out[..len].copy_from_slice(&bytes[..len]);
    out
}

/// Recover a name from its fixed-size field.
pub fn name_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
