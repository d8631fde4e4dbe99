//! Sample format conversion pipeline.
//!
//! A [`Transform`] composes a minimal ordered list of per-block conversion
//! primitives between two sample formats and runs them over two scratch
//! buffers. Pipelines are built once per format pair and reused for many
//! frames; the primitives themselves never fail.
//!
//! Between primitives all multi-byte data is kept in host byte order; the
//! endian swap primitives sit at the pipeline edges. 24 bit data is
//! normalized to 4-byte integers before any other conversion and only
//! repacked to 3 bytes as the final step.

use anyhow::{Result, ensure};

use crate::sample::{ChannelMap, MAX_CHANNELS, SampleFormat, SampleWidth, transform_verify};

/// Per-step context: channel routing for the channel-changing primitives.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StepCtx {
    pub channel_map: [u8; MAX_CHANNELS],
    pub src_channels: usize,
    pub dest_channels: usize,
}

/// A conversion primitive. Operates on `samples` samples (not frames) from
/// `src` into `dst` and returns the downstream sample count, which changes
/// only for the channel-changing primitives.
pub(crate) type StepFn = fn(ctx: &StepCtx, src: &[u8], dst: &mut [u8], samples: usize) -> usize;

macro_rules! trans_fn {
    ($name:ident, $in:ty => $out:ty, |$v:ident| $e:expr) => {
        fn $name(_ctx: &StepCtx, src: &[u8], dst: &mut [u8], samples: usize) -> usize {
            const IN: usize = size_of::<$in>();
            const OUT: usize = size_of::<$out>();
            for i in 0..samples {
                let $v = <$in>::from_ne_bytes(src[i * IN..(i + 1) * IN].try_into().unwrap());
                let out: $out = $e;
                dst[i * OUT..(i + 1) * OUT].copy_from_slice(&out.to_ne_bytes());
            }
            samples
        }
    };
}

/* float width changes */

trans_fn!(float_to_double, f32 => f64, |v| v as f64);
trans_fn!(double_to_float, f64 => f32, |v| v as f32);

/* signed bit width changes */

trans_fn!(s8_to_16, i8 => i16, |v| (v as i16) << 8);
trans_fn!(s8_to_24, i8 => i32, |v| (v as i32) << 16);
trans_fn!(s8_to_32, i8 => i32, |v| (v as i32) << 24);
trans_fn!(s8_to_float, i8 => f32, |v| v as f32 / 128.0);
trans_fn!(s8_to_double, i8 => f64, |v| v as f64 / 128.0);

trans_fn!(s16_to_8, i16 => i8, |v| (v >> 8) as i8);
trans_fn!(s16_to_24, i16 => i32, |v| (v as i32) << 8);
trans_fn!(s16_to_32, i16 => i32, |v| (v as i32) << 16);
trans_fn!(s16_to_float, i16 => f32, |v| v as f32 / 32768.0);
trans_fn!(s16_to_double, i16 => f64, |v| v as f64 / 32768.0);

trans_fn!(s24_to_8, i32 => i8, |v| (v >> 16) as i8);
trans_fn!(s24_to_16, i32 => i16, |v| (v >> 8) as i16);
trans_fn!(s24_to_32, i32 => i32, |v| v << 8);
trans_fn!(s24_to_float, i32 => f32, |v| v as f32 / 8388608.0);
trans_fn!(s24_to_double, i32 => f64, |v| v as f64 / 8388608.0);

trans_fn!(s32_to_8, i32 => i8, |v| (v >> 24) as i8);
trans_fn!(s32_to_16, i32 => i16, |v| (v >> 16) as i16);
trans_fn!(s32_to_24, i32 => i32, |v| v >> 8);
trans_fn!(s32_to_float, i32 => f32, |v| v as f32 / 2147483648.0);
trans_fn!(s32_to_double, i32 => f64, |v| v as f64 / 2147483648.0);

trans_fn!(float_to_s8, f32 => i8, |v| (v as f64 * 127.0) as i8);
trans_fn!(float_to_s16, f32 => i16, |v| (v as f64 * 32767.0) as i16);
trans_fn!(float_to_s24, f32 => i32, |v| (v as f64 * 8388607.0) as i32);
trans_fn!(float_to_s32, f32 => i32, |v| (v as f64 * 2147483647.0) as i32);

trans_fn!(double_to_s8, f64 => i8, |v| (v * 127.0) as i8);
trans_fn!(double_to_s16, f64 => i16, |v| (v * 32767.0) as i16);
trans_fn!(double_to_s24, f64 => i32, |v| (v * 8388607.0) as i32);
trans_fn!(double_to_s32, f64 => i32, |v| (v * 2147483647.0) as i32);

/* unsigned bit width changes */

trans_fn!(u8_to_16, u8 => u16, |v| (v as u16) << 8);
trans_fn!(u8_to_24, u8 => u32, |v| (v as u32) << 16);
trans_fn!(u8_to_32, u8 => u32, |v| (v as u32) << 24);
trans_fn!(u8_to_float, u8 => f32, |v| ((v ^ 0x80) as i8) as f32 / 128.0);
trans_fn!(u8_to_double, u8 => f64, |v| ((v ^ 0x80) as i8) as f64 / 128.0);

trans_fn!(u16_to_8, u16 => u8, |v| (v >> 8) as u8);
trans_fn!(u16_to_24, u16 => u32, |v| (v as u32) << 8);
trans_fn!(u16_to_32, u16 => u32, |v| (v as u32) << 16);
trans_fn!(u16_to_float, u16 => f32, |v| ((v ^ 0x8000) as i16) as f32 / 32768.0);
trans_fn!(u16_to_double, u16 => f64, |v| ((v ^ 0x8000) as i16) as f64 / 32768.0);

trans_fn!(u24_to_8, u32 => u8, |v| (v >> 16) as u8);
trans_fn!(u24_to_16, u32 => u16, |v| (v >> 8) as u16);
trans_fn!(u24_to_32, u32 => u32, |v| v << 8);
trans_fn!(u24_to_float, u32 => f32, |v| (v as i32 - 0x800000) as f32 / 8388608.0);
trans_fn!(u24_to_double, u32 => f64, |v| (v as i32 - 0x800000) as f64 / 8388608.0);

trans_fn!(u32_to_8, u32 => u8, |v| (v >> 24) as u8);
trans_fn!(u32_to_16, u32 => u16, |v| (v >> 16) as u16);
trans_fn!(u32_to_24, u32 => u32, |v| v >> 8);
trans_fn!(u32_to_float, u32 => f32, |v| ((v ^ 0x8000_0000) as i32) as f32 / 2147483648.0);
trans_fn!(u32_to_double, u32 => f64, |v| ((v ^ 0x8000_0000) as i32) as f64 / 2147483648.0);

trans_fn!(float_to_u8, f32 => u8, |v| ((v as f64 + 1.0) * 127.5 + 0.5) as u8);
trans_fn!(float_to_u16, f32 => u16, |v| ((v as f64 + 1.0) * 32767.5 + 0.5) as u16);
trans_fn!(float_to_u24, f32 => u32, |v| ((v as f64 + 1.0) * 8388607.5 + 0.5) as u32);
trans_fn!(float_to_u32, f32 => u32, |v| ((v as f64 + 1.0) * 2147483647.5 + 0.5) as u32);

trans_fn!(double_to_u8, f64 => u8, |v| ((v + 1.0) * 127.5 + 0.5) as u8);
trans_fn!(double_to_u16, f64 => u16, |v| ((v + 1.0) * 32767.5 + 0.5) as u16);
trans_fn!(double_to_u24, f64 => u32, |v| ((v + 1.0) * 8388607.5 + 0.5) as u32);
trans_fn!(double_to_u32, f64 => u32, |v| ((v + 1.0) * 2147483647.5 + 0.5) as u32);

/* sign toggles (24 bit in 4-byte integers needs dedicated variants
 * because bit 23, not bit 31, is the sign bit) */

trans_fn!(toggle_sign_8, u8 => u8, |v| v ^ 0x80);
trans_fn!(toggle_sign_16, u16 => u16, |v| v ^ 0x8000);
trans_fn!(signed_to_u24, u32 => u32, |v| v.wrapping_add(0x800000));
trans_fn!(unsigned_to_s24, i32 => i32, |v| ((v ^ 0x800000) << 8) >> 8);
trans_fn!(toggle_sign_32, u32 => u32, |v| v ^ 0x8000_0000);

/* endian swaps */

trans_fn!(swap_16, u16 => u16, |v| v.swap_bytes());
trans_fn!(swap_32, u32 => u32, |v| v.swap_bytes());
trans_fn!(swap_64, u64 => u64, |v| v.swap_bytes());

/* real 3-byte 24 bit data to and from 4-byte integers */

macro_rules! unpack3_fn {
    ($name:ident, [$b0:expr, $b1:expr, $b2:expr], $extend:expr) => {
        fn $name(_ctx: &StepCtx, src: &[u8], dst: &mut [u8], samples: usize) -> usize {
            for i in 0..samples {
                let b = &src[i * 3..i * 3 + 3];
                let mut val =
                    (b[$b0] as u32) | ((b[$b1] as u32) << 8) | ((b[$b2] as u32) << 16);
                if $extend && b[$b2] & 0x80 != 0 {
                    val |= 0xFF00_0000;
                }
                dst[i * 4..(i + 1) * 4].copy_from_slice(&val.to_ne_bytes());
            }
            samples
        }
    };
}

unpack3_fn!(sle3b_to_4b, [0, 1, 2], true);
unpack3_fn!(sbe3b_to_4b, [2, 1, 0], true);
unpack3_fn!(ule3b_to_4b, [0, 1, 2], false);
unpack3_fn!(ube3b_to_4b, [2, 1, 0], false);

macro_rules! pack3_fn {
    ($name:ident, [$b0:expr, $b1:expr, $b2:expr]) => {
        fn $name(_ctx: &StepCtx, src: &[u8], dst: &mut [u8], samples: usize) -> usize {
            for i in 0..samples {
                let val = u32::from_ne_bytes(src[i * 4..(i + 1) * 4].try_into().unwrap());
                let b = &mut dst[i * 3..i * 3 + 3];
                b[$b0] = val as u8;
                b[$b1] = (val >> 8) as u8;
                b[$b2] = (val >> 16) as u8;
            }
            samples
        }
    };
}

pack3_fn!(pack_4b_to_le3b, [0, 1, 2]);
pack3_fn!(pack_4b_to_be3b, [2, 1, 0]);

/* channel count changes, at byte granularities of 1, 2, 4 and 8 */

macro_rules! mono_to_stereo_fn {
    ($name:ident, $size:expr) => {
        fn $name(_ctx: &StepCtx, src: &[u8], dst: &mut [u8], samples: usize) -> usize {
            for i in 0..samples {
                let s = &src[i * $size..(i + 1) * $size];
                dst[i * 2 * $size..(i * 2 + 1) * $size].copy_from_slice(s);
                dst[(i * 2 + 1) * $size..(i * 2 + 2) * $size].copy_from_slice(s);
            }
            samples * 2
        }
    };
}

mono_to_stereo_fn!(mono_to_stereo_8, 1);
mono_to_stereo_fn!(mono_to_stereo_16, 2);
mono_to_stereo_fn!(mono_to_stereo_32, 4);
mono_to_stereo_fn!(mono_to_stereo_64, 8);

macro_rules! stereo_pick_fn {
    ($name:ident, $size:expr, $side:expr) => {
        fn $name(_ctx: &StepCtx, src: &[u8], dst: &mut [u8], samples: usize) -> usize {
            let count = samples / 2;
            for i in 0..count {
                let s = &src[(i * 2 + $side) * $size..(i * 2 + $side + 1) * $size];
                dst[i * $size..(i + 1) * $size].copy_from_slice(s);
            }
            count
        }
    };
}

stereo_pick_fn!(stereo_to_left_8, 1, 0);
stereo_pick_fn!(stereo_to_left_16, 2, 0);
stereo_pick_fn!(stereo_to_left_32, 4, 0);
stereo_pick_fn!(stereo_to_left_64, 8, 0);
stereo_pick_fn!(stereo_to_right_8, 1, 1);
stereo_pick_fn!(stereo_to_right_16, 2, 1);
stereo_pick_fn!(stereo_to_right_32, 4, 1);
stereo_pick_fn!(stereo_to_right_64, 8, 1);

macro_rules! chan_map_fn {
    ($name:ident, $size:expr) => {
        fn $name(ctx: &StepCtx, src: &[u8], dst: &mut [u8], samples: usize) -> usize {
            let frames = samples / ctx.src_channels;
            for frame in 0..frames {
                let spos = frame * ctx.src_channels;
                let dpos = frame * ctx.dest_channels;
                for d in 0..ctx.dest_channels {
                    let s = spos + ctx.channel_map[d] as usize;
                    dst[(dpos + d) * $size..(dpos + d + 1) * $size]
                        .copy_from_slice(&src[s * $size..(s + 1) * $size]);
                }
            }
            frames * ctx.dest_channels
        }
    };
}

chan_map_fn!(chan_map_8, 1);
chan_map_fn!(chan_map_16, 2);
chan_map_fn!(chan_map_32, 4);
chan_map_fn!(chan_map_64, 8);

/* dispatch tables indexed by SampleWidth - 1 (Bit8..Double); the 3-byte
 * width never reaches these because it is normalized to Bit24 first */

#[rustfmt::skip]
const SIGNED_TFF: [[Option<StepFn>; 6]; 6] = [
    [None, Some(s8_to_16), Some(s8_to_24), Some(s8_to_32), Some(s8_to_float), Some(s8_to_double)],
    [Some(s16_to_8), None, Some(s16_to_24), Some(s16_to_32), Some(s16_to_float), Some(s16_to_double)],
    [Some(s24_to_8), Some(s24_to_16), None, Some(s24_to_32), Some(s24_to_float), Some(s24_to_double)],
    [Some(s32_to_8), Some(s32_to_16), Some(s32_to_24), None, Some(s32_to_float), Some(s32_to_double)],
    [Some(float_to_s8), Some(float_to_s16), Some(float_to_s24), Some(float_to_s32), None, Some(float_to_double)],
    [Some(double_to_s8), Some(double_to_s16), Some(double_to_s24), Some(double_to_s32), Some(double_to_float), None],
];

#[rustfmt::skip]
const UNSIGNED_TFF: [[Option<StepFn>; 6]; 6] = [
    [None, Some(u8_to_16), Some(u8_to_24), Some(u8_to_32), Some(u8_to_float), Some(u8_to_double)],
    [Some(u16_to_8), None, Some(u16_to_24), Some(u16_to_32), Some(u16_to_float), Some(u16_to_double)],
    [Some(u24_to_8), Some(u24_to_16), None, Some(u24_to_32), Some(u24_to_float), Some(u24_to_double)],
    [Some(u32_to_8), Some(u32_to_16), Some(u32_to_24), None, Some(u32_to_float), Some(u32_to_double)],
    [Some(float_to_u8), Some(float_to_u16), Some(float_to_u24), Some(float_to_u32), None, Some(float_to_double)],
    [Some(double_to_u8), Some(double_to_u16), Some(double_to_u24), Some(double_to_u32), Some(double_to_float), None],
];

const SIGN_TFF: [Option<StepFn>; 6] = [
    Some(toggle_sign_8),
    Some(toggle_sign_16),
    None,
    Some(toggle_sign_32),
    None,
    None,
];

const SWAP_TFF: [Option<StepFn>; 6] = [
    None,
    Some(swap_16),
    Some(swap_32),
    Some(swap_32),
    Some(swap_32),
    Some(swap_64),
];

const MONO_TO_STEREO_TFF: [StepFn; 6] = [
    mono_to_stereo_8,
    mono_to_stereo_16,
    mono_to_stereo_32,
    mono_to_stereo_32,
    mono_to_stereo_32,
    mono_to_stereo_64,
];

const STEREO_TO_LEFT_TFF: [StepFn; 6] = [
    stereo_to_left_8,
    stereo_to_left_16,
    stereo_to_left_32,
    stereo_to_left_32,
    stereo_to_left_32,
    stereo_to_left_64,
];

const STEREO_TO_RIGHT_TFF: [StepFn; 6] = [
    stereo_to_right_8,
    stereo_to_right_16,
    stereo_to_right_32,
    stereo_to_right_32,
    stereo_to_right_32,
    stereo_to_right_64,
];

const CHAN_MAP_TFF: [StepFn; 6] = [
    chan_map_8,
    chan_map_16,
    chan_map_32,
    chan_map_32,
    chan_map_32,
    chan_map_64,
];

const fn host_little_endian() -> bool {
    cfg!(target_endian = "little")
}

/// Build the ordered primitive list for a conversion, tracking the maximum
/// frame byte size seen at each buffer parity. Returns the steps plus the
/// max frame sizes for the two scratch buffers.
pub(crate) fn build_steps(
    src_format: SampleFormat,
    dest_format: SampleFormat,
    map: ChannelMap,
) -> (Vec<StepFn>, usize, usize) {
    let mut funcs: Vec<StepFn> = Vec::with_capacity(8);
    let mut max = [src_format.frame_size(), 0];
    let mut cur = src_format;

    let mut swidth = src_format.width();
    let mut dwidth = dest_format.width();
    let schan = src_format.channels();
    let dchan = dest_format.channels();

    let mut push = |funcs: &mut Vec<StepFn>, f: StepFn, cur: SampleFormat| {
        funcs.push(f);
        let size = cur.frame_size();
        if size > max[funcs.len() & 1] {
            max[funcs.len() & 1] = size;
        }
    };

    // 24 bit is handled as 4-byte integers until the final repack
    if dwidth == SampleWidth::Real24 {
        dwidth = SampleWidth::Bit24;
    }

    // unpack 3-byte 24 bit data to native endian 4-byte integers
    if swidth == SampleWidth::Real24 {
        let f: StepFn = match (src_format.is_little_endian(), src_format.is_signed()) {
            (true, true) => sle3b_to_4b,
            (true, false) => ule3b_to_4b,
            (false, true) => sbe3b_to_4b,
            (false, false) => ube3b_to_4b,
        };
        swidth = SampleWidth::Bit24;
        cur = cur.with_width(SampleWidth::Bit24);
        push(&mut funcs, f, cur);
    }

    // channel reduction before the expensive width conversions
    if dchan < schan {
        let f = if dchan == 1 && schan == 2 {
            if map.get(0) == 0 {
                STEREO_TO_LEFT_TFF[swidth as usize - 1]
            } else {
                STEREO_TO_RIGHT_TFF[swidth as usize - 1]
            }
        } else {
            CHAN_MAP_TFF[swidth as usize - 1]
        };
        cur = cur.with_channels(dchan);
        push(&mut funcs, f, cur);
    }

    // source byte order differs from host? (3-byte data was already
    // swapped by the unpack above)
    if src_format.is_little_endian() != host_little_endian()
        && src_format.width() != SampleWidth::Real24
    {
        if let Some(f) = SWAP_TFF[swidth as usize - 1] {
            cur = cur.flip_endian();
            push(&mut funcs, f, cur);
        }
    }

    // both integer formats and the sign differs? toggle
    if !swidth.is_floating()
        && !dwidth.is_floating()
        && src_format.is_signed() != dest_format.is_signed()
    {
        let f: StepFn = if swidth == SampleWidth::Bit24 {
            if src_format.is_signed() {
                signed_to_u24
            } else {
                unsigned_to_s24
            }
        } else {
            SIGN_TFF[swidth as usize - 1].expect("sign toggle exists for integer widths")
        };
        cur = cur.flip_sign();
        push(&mut funcs, f, cur);
    }

    // width conversion
    if swidth != dwidth {
        let signed = if cur.is_floating() {
            dest_format.is_signed()
        } else {
            cur.is_signed()
        };
        let table = if signed { &SIGNED_TFF } else { &UNSIGNED_TFF };
        let f = table[swidth as usize - 1][dwidth as usize - 1]
            .expect("width conversion exists for distinct widths");
        cur = cur.with_width(dwidth);
        push(&mut funcs, f, cur);
    }

    // destination byte order differs from host? (3-byte repack below
    // handles its own byte order)
    if dest_format.is_little_endian() != host_little_endian()
        && dest_format.width() != SampleWidth::Real24
    {
        if let Some(f) = SWAP_TFF[dwidth as usize - 1] {
            cur = cur.flip_endian();
            push(&mut funcs, f, cur);
        }
    }

    // channel expansion after the width conversions
    if dchan > schan {
        let f = if dchan == 2 && schan == 1 {
            MONO_TO_STEREO_TFF[dwidth as usize - 1]
        } else {
            CHAN_MAP_TFF[dwidth as usize - 1]
        };
        cur = cur.with_channels(dchan);
        push(&mut funcs, f, cur);
    }

    // repack to 3-byte 24 bit data
    if dest_format.width() == SampleWidth::Real24 {
        let f: StepFn = if dest_format.is_little_endian() {
            pack_4b_to_le3b
        } else {
            pack_4b_to_be3b
        };
        cur = cur.with_width(SampleWidth::Real24);
        push(&mut funcs, f, cur);
    }

    (funcs, max[0], max[1])
}

/// An initialized conversion between two sample formats.
pub struct Transform {
    src_format: SampleFormat,
    dest_format: SampleFormat,
    ctx: StepCtx,
    funcs: Vec<StepFn>,
    buf1_max_frame: usize,
    buf2_max_frame: usize,
    max_frames: usize,
    combined_size: usize,
    buf1: Vec<u8>,
    buf2: Vec<u8>,
}

impl Transform {
    pub fn new(src: SampleFormat, dest: SampleFormat, map: ChannelMap) -> Result<Self> {
        let mut transform = Self {
            src_format: SampleFormat::default(),
            dest_format: SampleFormat::default(),
            ctx: StepCtx {
                channel_map: std::array::from_fn(|i| i as u8),
                src_channels: 1,
                dest_channels: 1,
            },
            funcs: Vec::new(),
            buf1_max_frame: 0,
            buf2_max_frame: 0,
            max_frames: 0,
            combined_size: 0,
            buf1: Vec::new(),
            buf2: Vec::new(),
        };
        transform.set_formats(src, dest, map)?;
        Ok(transform)
    }

    /// Re-initialize for a new conversion, keeping any allocated buffers.
    pub fn set_formats(
        &mut self,
        src: SampleFormat,
        dest: SampleFormat,
        map: ChannelMap,
    ) -> Result<()> {
        transform_verify(src, dest, map)?;

        self.src_format = src;
        self.dest_format = dest;
        self.ctx = StepCtx {
            channel_map: map.to_array(),
            src_channels: src.channels(),
            dest_channels: dest.channels(),
        };
        self.funcs.clear();

        // identical formats with straight-through mapping need no steps
        let identity = src == dest && (0..src.channels()).all(|i| map.get(i) == i);

        if identity {
            self.buf1_max_frame = src.frame_size();
            self.buf2_max_frame = 0;
        } else {
            let (funcs, buf1_max, buf2_max) = build_steps(src, dest, map);
            self.funcs = funcs;
            self.buf1_max_frame = buf1_max;
            self.buf2_max_frame = buf2_max;
        }

        if self.combined_size > 0 {
            self.split_buffers();
        } else {
            self.max_frames = 0;
        }

        Ok(())
    }

    fn split_buffers(&mut self) {
        let per_frame = self.buf1_max_frame + self.buf2_max_frame;
        self.max_frames = if per_frame > 0 {
            self.combined_size / per_frame
        } else {
            0
        };
        self.buf1.clear();
        self.buf1.resize(self.buf1_max_frame * self.max_frames, 0);
        self.buf2.clear();
        self.buf2.resize(self.buf2_max_frame * self.max_frames, 0);
    }

    /// Allocate scratch buffers for converting up to `frames` frames per
    /// batch.
    pub fn alloc(&mut self, frames: usize) {
        self.combined_size = (self.buf1_max_frame + self.buf2_max_frame) * frames;
        self.max_frames = frames;
        self.buf1.clear();
        self.buf1.resize(self.buf1_max_frame * frames, 0);
        self.buf2.clear();
        self.buf2.resize(self.buf2_max_frame * frames, 0);
    }

    /// Allocate scratch buffers from a total byte budget. Returns the
    /// resulting batch size in frames.
    pub fn alloc_size(&mut self, size: usize) -> usize {
        self.combined_size = size;
        self.split_buffers();
        self.max_frames
    }

    /// Donate `buf` as scratch storage; its length is the combined byte
    /// budget and its allocation is reused for the first buffer. Returns
    /// the resulting batch size in frames.
    pub fn set_buffer(&mut self, buf: Vec<u8>) -> usize {
        self.combined_size = buf.len();
        self.buf1 = buf;
        self.split_buffers();
        self.max_frames
    }

    pub fn src_format(&self) -> SampleFormat {
        self.src_format
    }

    pub fn dest_format(&self) -> SampleFormat {
        self.dest_format
    }

    pub fn channel_map(&self) -> ChannelMap {
        let mut map = ChannelMap::from_bits(0);
        for (i, &src) in self.ctx.channel_map.iter().enumerate() {
            map = map.with(i, src as usize);
        }
        map
    }

    /// Max frames convertible per batch, 0 until buffers are allocated.
    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    pub fn frame_sizes(&self) -> (usize, usize) {
        (self.buf1_max_frame, self.buf2_max_frame)
    }

    pub fn step_count(&self) -> usize {
        self.funcs.len()
    }

    /// First scratch buffer; the input side of [`Transform::convert_single`].
    pub fn buf1_mut(&mut self) -> &mut [u8] {
        &mut self.buf1
    }

    /// Convert `frames` frames from `src` into `dst`, processing in
    /// `max_frames` sized batches. The first primitive reads straight from
    /// `src` and the last writes straight into `dst`; intermediate results
    /// bounce between the scratch buffers.
    pub fn convert(&mut self, src: &[u8], dst: &mut [u8], frames: usize) -> Result<()> {
        let src_frame = self.src_format.frame_size();
        let dest_frame = self.dest_format.frame_size();

        ensure!(
            src.len() >= frames * src_frame && dst.len() >= frames * dest_frame,
            "convert: buffer shorter than {frames} frames"
        );

        if self.funcs.is_empty() {
            dst[..frames * dest_frame].copy_from_slice(&src[..frames * src_frame]);
            return Ok(());
        }

        ensure!(self.max_frames > 0, "convert: scratch buffers not allocated");

        let mut buf1 = std::mem::take(&mut self.buf1);
        let mut buf2 = std::mem::take(&mut self.buf2);
        let nfuncs = self.funcs.len();
        let src_channels = self.ctx.src_channels;

        let mut done = 0;
        while done < frames {
            let block = self.max_frames.min(frames - done);
            let sview = &src[done * src_frame..(done + block) * src_frame];
            let dview = &mut dst[done * dest_frame..(done + block) * dest_frame];

            let mut samples = block * src_channels;
            for (i, func) in self.funcs.iter().enumerate() {
                let (input, output): (&[u8], &mut [u8]) = if i == 0 && i == nfuncs - 1 {
                    (sview, &mut *dview)
                } else if i == 0 {
                    (sview, &mut buf2)
                } else if i == nfuncs - 1 {
                    if i % 2 == 1 {
                        (&buf2, &mut *dview)
                    } else {
                        (&buf1, &mut *dview)
                    }
                } else if i % 2 == 1 {
                    (&buf2, &mut buf1)
                } else {
                    (&buf1, &mut buf2)
                };
                samples = func(&self.ctx, input, output, samples);
            }

            done += block;
        }

        self.buf1 = buf1;
        self.buf2 = buf2;
        Ok(())
    }

    /// Convert one batch in place: the caller fills [`Transform::buf1_mut`]
    /// with `frames` frames of source data and reads the result from the
    /// returned slice.
    pub fn convert_single(&mut self, frames: usize) -> Result<&[u8]> {
        ensure!(
            self.max_frames > 0 && frames <= self.max_frames,
            "convert_single: {frames} frames exceeds batch size {}",
            self.max_frames
        );

        let mut samples = frames * self.ctx.src_channels;

        for (i, func) in self.funcs.iter().enumerate() {
            samples = if i % 2 == 0 {
                func(&self.ctx, &self.buf1, &mut self.buf2, samples)
            } else {
                func(&self.ctx, &self.buf2, &mut self.buf1, samples)
            };
        }

        let out_len = if self.funcs.is_empty() {
            frames * self.src_format.frame_size()
        } else {
            samples * self.dest_format.sample_size()
        };

        if self.funcs.len() % 2 == 1 {
            Ok(&self.buf2[..out_len])
        } else {
            Ok(&self.buf1[..out_len])
        }
    }
}

impl std::fmt::Debug for Transform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transform")
            .field("src_format", &self.src_format)
            .field("dest_format", &self.dest_format)
            .field("steps", &self.funcs.len())
            .field("max_frames", &self.max_frames)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::Endian;
    use crate::sample::{HOST_ENDIAN, UNITY_CHANNEL_MAP};

    fn fmt(width: SampleWidth, channels: usize, signed: bool, endian: Endian) -> SampleFormat {
        SampleFormat::new(width, channels, signed, endian)
    }

    fn mono(width: SampleWidth) -> SampleFormat {
        fmt(width, 1, true, HOST_ENDIAN)
    }

    #[test]
    fn identity_pipeline_is_empty() -> Result<()> {
        let f = fmt(SampleWidth::Bit16, 2, true, Endian::Little);
        let transform = Transform::new(f, f, UNITY_CHANNEL_MAP)?;
        assert_eq!(transform.step_count(), 0);
        Ok(())
    }

    #[test]
    fn identity_convert_copies() -> Result<()> {
        let f = fmt(SampleWidth::Bit16, 1, true, Endian::Little);
        let mut transform = Transform::new(f, f, UNITY_CHANNEL_MAP)?;

        let src: Vec<u8> = (0..32).collect();
        let mut dst = vec![0u8; 32];
        transform.convert(&src, &mut dst, 16)?;
        assert_eq!(src, dst);
        Ok(())
    }

    #[test]
    fn sine_16bit_through_float_within_one_lsb() -> Result<()> {
        let s16 = fmt(SampleWidth::Bit16, 1, true, Endian::Little);
        let f32f = mono(SampleWidth::Float);

        let frames = 1024;
        let wave: Vec<i16> = (0..frames)
            .map(|i| ((i as f64 / 64.0).sin() * 30000.0) as i16)
            .collect();
        let src: Vec<u8> = wave.iter().flat_map(|v| v.to_le_bytes()).collect();

        let mut to_float = Transform::new(s16, f32f, UNITY_CHANNEL_MAP)?;
        to_float.alloc(256);
        let mut floats = vec![0u8; frames * 4];
        to_float.convert(&src, &mut floats, frames)?;

        let mut to_int = Transform::new(f32f, s16, UNITY_CHANNEL_MAP)?;
        to_int.alloc(256);
        let mut back = vec![0u8; frames * 2];
        to_int.convert(&floats, &mut back, frames)?;

        for (i, orig) in wave.iter().enumerate() {
            let got = i16::from_le_bytes(back[i * 2..i * 2 + 2].try_into().unwrap());
            assert!(
                (got as i32 - *orig as i32).abs() <= 1,
                "frame {i}: {orig} -> {got}"
            );
        }
        Ok(())
    }

    #[test]
    fn stereo_to_mono_left_halves_sample_count() -> Result<()> {
        let stereo = fmt(SampleWidth::Bit16, 2, true, HOST_ENDIAN);
        let mono = stereo.with_channels(1);

        // dst channel 0 draws from src channel 0 (left)
        let mut transform = Transform::new(stereo, mono, ChannelMap::from_bits(0))?;
        transform.alloc(16);

        let input: [i16; 6] = [100, -100, 200, -200, 300, -300];
        let src: Vec<u8> = input.iter().flat_map(|v| v.to_ne_bytes()).collect();
        let mut dst = vec![0u8; 6];
        transform.convert(&src, &mut dst, 3)?;

        let out: Vec<i16> = dst
            .chunks_exact(2)
            .map(|c| i16::from_ne_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(out, [100, 200, 300]);
        Ok(())
    }

    #[test]
    fn stereo_to_mono_right() -> Result<()> {
        let stereo = fmt(SampleWidth::Bit16, 2, true, HOST_ENDIAN);
        let mono = stereo.with_channels(1);

        let mut transform = Transform::new(stereo, mono, ChannelMap::from_bits(1))?;
        transform.alloc(16);

        let input: [i16; 4] = [100, -100, 200, -200];
        let src: Vec<u8> = input.iter().flat_map(|v| v.to_ne_bytes()).collect();
        let mut dst = vec![0u8; 4];
        transform.convert(&src, &mut dst, 2)?;

        let out: Vec<i16> = dst
            .chunks_exact(2)
            .map(|c| i16::from_ne_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(out, [-100, -200]);
        Ok(())
    }

    #[test]
    fn mono_to_stereo_duplicates() -> Result<()> {
        let mono = fmt(SampleWidth::Bit16, 1, true, HOST_ENDIAN);
        let stereo = mono.with_channels(2);

        let mut transform = Transform::new(mono, stereo, UNITY_CHANNEL_MAP)?;
        transform.alloc(16);

        let input: [i16; 3] = [7, -8, 9];
        let src: Vec<u8> = input.iter().flat_map(|v| v.to_ne_bytes()).collect();
        let mut dst = vec![0u8; 12];
        transform.convert(&src, &mut dst, 3)?;

        let out: Vec<i16> = dst
            .chunks_exact(2)
            .map(|c| i16::from_ne_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(out, [7, 7, -8, -8, 9, 9]);
        Ok(())
    }

    #[test]
    fn widening_roundtrips_are_exact() -> Result<()> {
        // integer widths of 16 bits or more round trip exactly
        for dest_width in [SampleWidth::Bit24, SampleWidth::Bit32] {
            let s16 = fmt(SampleWidth::Bit16, 1, true, HOST_ENDIAN);
            let wide = mono(dest_width);

            let mut up = Transform::new(s16, wide, UNITY_CHANNEL_MAP)?;
            up.alloc(64);
            let mut down = Transform::new(wide, s16, UNITY_CHANNEL_MAP)?;
            down.alloc(64);

            let wave: Vec<i16> = (0..256).map(|i| (i * 257 - 32768) as i16).collect();
            let src: Vec<u8> = wave.iter().flat_map(|v| v.to_ne_bytes()).collect();

            let mut mid = vec![0u8; 256 * 4];
            up.convert(&src, &mut mid, 256)?;
            let mut back = vec![0u8; 256 * 2];
            down.convert(&mid, &mut back, 256)?;

            assert_eq!(src, back, "{dest_width:?}");
        }
        Ok(())
    }

    #[test]
    fn sign_toggle_roundtrip() -> Result<()> {
        let s16 = fmt(SampleWidth::Bit16, 1, true, HOST_ENDIAN);
        let u16f = fmt(SampleWidth::Bit16, 1, false, HOST_ENDIAN);

        let mut transform = Transform::new(s16, u16f, UNITY_CHANNEL_MAP)?;
        assert_eq!(transform.step_count(), 1);
        transform.alloc(8);

        let input: [i16; 4] = [i16::MIN, -1, 0, i16::MAX];
        let src: Vec<u8> = input.iter().flat_map(|v| v.to_ne_bytes()).collect();
        let mut dst = vec![0u8; 8];
        transform.convert(&src, &mut dst, 4)?;

        let out: Vec<u16> = dst
            .chunks_exact(2)
            .map(|c| u16::from_ne_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(out, [0, 0x7FFF, 0x8000, 0xFFFF]);
        Ok(())
    }

    #[test]
    fn endian_swap_on_both_sides() -> Result<()> {
        let le = fmt(SampleWidth::Bit16, 1, true, Endian::Little);
        let be = fmt(SampleWidth::Bit16, 1, true, Endian::Big);

        let mut transform = Transform::new(le, be, UNITY_CHANNEL_MAP)?;
        assert_eq!(transform.step_count(), 1);
        transform.alloc(4);

        let src = [0x34, 0x12];
        let mut dst = [0u8; 2];
        transform.convert(&src, &mut dst, 1)?;
        assert_eq!(dst, [0x12, 0x34]);
        Ok(())
    }

    #[test]
    fn real24_unpack_and_repack() -> Result<()> {
        let r24le = fmt(SampleWidth::Real24, 1, true, Endian::Little);
        let s32 = mono(SampleWidth::Bit32);

        let mut up = Transform::new(r24le, s32, UNITY_CHANNEL_MAP)?;
        up.alloc(8);

        // -2 as 24 bit little endian, then 0x010203
        let src = [0xFE, 0xFF, 0xFF, 0x03, 0x02, 0x01];
        let mut dst = vec![0u8; 8];
        up.convert(&src, &mut dst, 2)?;

        let a = i32::from_ne_bytes(dst[0..4].try_into().unwrap());
        let b = i32::from_ne_bytes(dst[4..8].try_into().unwrap());
        assert_eq!(a, -2 << 8);
        assert_eq!(b, 0x010203 << 8);

        let mut down = Transform::new(s32, r24le, UNITY_CHANNEL_MAP)?;
        down.alloc(8);
        let mut back = vec![0u8; 6];
        down.convert(&dst, &mut back, 2)?;
        assert_eq!(back, src);
        Ok(())
    }

    #[test]
    fn real24_big_endian_sign_extension() -> Result<()> {
        let r24be = fmt(SampleWidth::Real24, 1, true, Endian::Big);
        let s24 = mono(SampleWidth::Bit24);

        let mut transform = Transform::new(r24be, s24, UNITY_CHANNEL_MAP)?;
        transform.alloc(4);

        let src = [0xFF, 0xFF, 0xFE, 0x01, 0x02, 0x03];
        let mut dst = vec![0u8; 8];
        transform.convert(&src, &mut dst, 2)?;

        let a = i32::from_ne_bytes(dst[0..4].try_into().unwrap());
        let b = i32::from_ne_bytes(dst[4..8].try_into().unwrap());
        assert_eq!(a, -2);
        assert_eq!(b, 0x010203);
        Ok(())
    }

    #[test]
    fn unsigned_8bit_to_float_and_back() -> Result<()> {
        let u8f = fmt(SampleWidth::Bit8, 1, false, Endian::Little);
        let f32f = mono(SampleWidth::Float);

        let mut to_float = Transform::new(u8f, f32f, UNITY_CHANNEL_MAP)?;
        to_float.alloc(256);
        let mut to_u8 = Transform::new(f32f, u8f, UNITY_CHANNEL_MAP)?;
        to_u8.alloc(256);

        let src: Vec<u8> = (0..=255).collect();
        let mut mid = vec![0u8; 256 * 4];
        to_float.convert(&src, &mut mid, 256)?;
        let mut back = vec![0u8; 256];
        to_u8.convert(&mid, &mut back, 256)?;

        for (i, (&a, &b)) in src.iter().zip(back.iter()).enumerate() {
            assert!((a as i32 - b as i32).abs() <= 1, "{i}: {a} -> {b}");
        }
        Ok(())
    }

    #[test]
    fn streaming_matches_single_batch() -> Result<()> {
        let s16 = fmt(SampleWidth::Bit16, 1, true, HOST_ENDIAN);
        let s32 = mono(SampleWidth::Bit32);

        let wave: Vec<i16> = (0..1000).map(|i| (i * 61 % 30000 - 15000) as i16).collect();
        let src: Vec<u8> = wave.iter().flat_map(|v| v.to_ne_bytes()).collect();

        // tiny batch size forces many blocks
        let mut small = Transform::new(s16, s32, UNITY_CHANNEL_MAP)?;
        small.alloc(7);
        let mut out_small = vec![0u8; 1000 * 4];
        small.convert(&src, &mut out_small, 1000)?;

        let mut big = Transform::new(s16, s32, UNITY_CHANNEL_MAP)?;
        big.alloc(1000);
        let mut out_big = vec![0u8; 1000 * 4];
        big.convert(&src, &mut out_big, 1000)?;

        assert_eq!(out_small, out_big);
        Ok(())
    }

    #[test]
    fn convert_single_uses_internal_buffers() -> Result<()> {
        let s8 = fmt(SampleWidth::Bit8, 1, true, Endian::Little);
        let s16 = fmt(SampleWidth::Bit16, 1, true, HOST_ENDIAN);

        let mut transform = Transform::new(s8, s16, UNITY_CHANNEL_MAP)?;
        transform.alloc(16);

        transform.buf1_mut()[..4].copy_from_slice(&[1u8, 2, 0xFF, 0x80]);
        let out = transform.convert_single(4)?;

        let vals: Vec<i16> = out
            .chunks_exact(2)
            .map(|c| i16::from_ne_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(vals, [256, 512, -256, -32768]);
        Ok(())
    }

    #[test]
    fn alloc_size_splits_budget() -> Result<()> {
        let s16 = fmt(SampleWidth::Bit16, 1, true, HOST_ENDIAN);
        let f64f = mono(SampleWidth::Double);

        let mut transform = Transform::new(s16, f64f, UNITY_CHANNEL_MAP)?;
        let frames = transform.alloc_size(1000);
        let (b1, b2) = transform.frame_sizes();
        assert_eq!(frames, 1000 / (b1 + b2));
        assert!(frames > 0);
        Ok(())
    }

    #[test]
    fn float_to_int_to_float_error_bounded() -> Result<()> {
        let f32f = mono(SampleWidth::Float);

        for width in [SampleWidth::Bit16, SampleWidth::Bit24, SampleWidth::Bit32] {
            let int_fmt = mono(width);
            let mut to_int = Transform::new(f32f, int_fmt, UNITY_CHANNEL_MAP)?;
            to_int.alloc(128);
            let mut to_float = Transform::new(int_fmt, f32f, UNITY_CHANNEL_MAP)?;
            to_float.alloc(128);

            let wave: Vec<f32> = (0..128).map(|i| ((i as f32 / 20.0).sin() * 0.95)).collect();
            let src: Vec<u8> = wave.iter().flat_map(|v| v.to_ne_bytes()).collect();

            let mut mid = vec![0u8; 128 * int_fmt.frame_size()];
            to_int.convert(&src, &mut mid, 128)?;
            let mut back = vec![0u8; 128 * 4];
            to_float.convert(&mid, &mut back, 128)?;

            for (i, orig) in wave.iter().enumerate() {
                let got = f32::from_ne_bytes(back[i * 4..i * 4 + 4].try_into().unwrap());
                assert!((orig - got).abs() <= 0.016, "{width:?} frame {i}");
            }
        }
        Ok(())
    }

    #[test]
    fn generic_channel_map_reorders() -> Result<()> {
        let four = fmt(SampleWidth::Bit16, 4, true, HOST_ENDIAN);
        let two = four.with_channels(2);

        // dst 0 <- src 3, dst 1 <- src 1
        let map = ChannelMap::from_bits(0).with(0, 3).with(1, 1);
        let mut transform = Transform::new(four, two, map)?;
        transform.alloc(4);

        let input: [i16; 8] = [10, 11, 12, 13, 20, 21, 22, 23];
        let src: Vec<u8> = input.iter().flat_map(|v| v.to_ne_bytes()).collect();
        let mut dst = vec![0u8; 8];
        transform.convert(&src, &mut dst, 2)?;

        let out: Vec<i16> = dst
            .chunks_exact(2)
            .map(|c| i16::from_ne_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(out, [13, 11, 23, 21]);
        Ok(())
    }
}
