//! In-memory object graph for Spectralis instrument files.
//!
//! Plain data structures: zones reference samples by index into the
//! owning [`Sli`]'s sample table, and sample stores are shared through
//! `Arc` so a writer's duplicated tree keeps pointing at the same audio
//! data.

use std::sync::Arc;

use crate::sample::store::SampleStore;
use crate::sli::r#gen::GenArray;

/// A loaded or to-be-saved Spectralis instrument collection.
#[derive(Debug, Clone, Default)]
pub struct Sli {
    pub instruments: Vec<Instrument>,
    pub samples: Vec<SliSample>,
}

impl Sli {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Instrument {
    pub name: String,
    /// Unique id; a hash of the name is substituted on write when zero.
    pub sound_id: u32,
    /// Main and sub category code.
    pub category: u16,
    pub zones: Vec<Zone>,
}

#[derive(Debug, Clone, Default)]
pub struct Zone {
    pub genarray: GenArray,
    /// Raw sample mode flags from the zone header.
    pub flags: u8,
    /// Index into [`Sli::samples`].
    pub sample: usize,
}

#[derive(Debug, Clone)]
pub struct SliSample {
    pub name: String,
    /// Loop points in frames.
    pub loop_start: u32,
    pub loop_end: u32,
    pub rate: u32,
    pub root_note: u8,
    pub fine_tune: i8,
    pub store: Arc<SampleStore>,
}

/// Hash used for default sound ids when an instrument has none.
pub fn name_hash(name: &str) -> u32 {
    name.bytes()
        .fold(5381u32, |h, b| h.wrapping_mul(33).wrapping_add(b as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_hash_is_stable_and_nonzero() {
        assert_eq!(name_hash("Piano"), name_hash("Piano"));
        assert_ne!(name_hash("Piano"), name_hash("piano"));
        assert_ne!(name_hash("Piano"), 0);
    }
}
