//! Container engines and sample services for musical instrument patch
//! files.
//!
//! ## Overview
//!
//! Two binary container engines share a byte-oriented
//! [file handle](file::FileHandle) with endian negotiation and staged
//! writes:
//!
//! - [`riff`] — bidirectional parser/composer for nested FOURCC chunk
//!   containers (SoundFont, DLS and friends), with chunk-size
//!   back-patching, state save/restore and hierarchical bounds
//!   enforcement.
//! - [`sli`] — reader and writer for the Spectralis SLI/SLC format,
//!   which consolidates instruments into groups sharing a sample pool.
//!
//! Underneath them sits the sample subsystem:
//!
//! - [`sample`] — packed sample format descriptors and channel maps;
//! - [`sample::store`] — RAM, file-backed and virtual (edit list) sample
//!   stores behind one read/write surface;
//! - [`sample::transform`] — a declarative pipeline composing per-block
//!   conversion primitives between arbitrary sample formats.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use patchfile::file::FileHandle;
//! use patchfile::sli::reader::SliReader;
//!
//! let handle = FileHandle::open("bank.sli")?;
//! let mut reader = SliReader::new(handle);
//! let sli = reader.load()?;
//!
//! for inst in &sli.instruments {
//!     println!("{}: {} zones", inst.name, inst.zones.len());
//! }
//! # Ok::<(), anyhow::Error>(())
//! ```

/// Byte-oriented file handle with endian negotiation and staged writes.
pub mod file;
/// RIFF chunk container engine.
pub mod riff;
/// Sample formats, stores and the conversion pipeline.
pub mod sample;
/// Spectralis SLI/SLC engine.
pub mod sli;
/// Error types.
pub mod utils;
