//! Process-wide pool of preallocated sample transforms.
//!
//! Short-lived conversions (a store duplicate, one save pass) grab a
//! transform from the pool instead of allocating scratch buffers each
//! time. Acquiring from an empty pool allocates with the standard buffer
//! budget.

use std::sync::Mutex;

use anyhow::Result;

use crate::sample::transform::Transform;
use crate::sample::{ChannelMap, SampleFormat};

/// Combined scratch buffer budget for pooled transforms.
pub const POOL_BUFFER_SIZE: usize = 32 * 1024;

static POOL: Mutex<Vec<Transform>> = Mutex::new(Vec::new());

/// Get a transform for the given conversion, reusing a pooled one when
/// available. Release it back with [`release`] when done.
pub fn acquire(src: SampleFormat, dest: SampleFormat, map: ChannelMap) -> Result<Transform> {
    let pooled = POOL.lock().unwrap().pop();

    match pooled {
        Some(mut transform) => {
            transform.set_formats(src, dest, map)?;
            Ok(transform)
        }
        None => {
            let mut transform = Transform::new(src, dest, map)?;
            transform.alloc_size(POOL_BUFFER_SIZE);
            Ok(transform)
        }
    }
}

/// Return a transform to the pool for reuse.
pub fn release(transform: Transform) {
    POOL.lock().unwrap().push(transform);
}
