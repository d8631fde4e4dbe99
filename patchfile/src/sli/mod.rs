//! Spectralis SLI/SLC instrument file engine.
//!
//! The format packs instruments into groups that share a sample pool.
//! [`reader::SliReader`] loads a file into the [`model::Sli`] object
//! tree; [`writer::SliWriter`] writes a tree back out, consolidating
//! instruments into groups by transitive sample sharing.

/// Zone generators and their sparse storage.
pub mod r#gen;
/// Wire structures and size constants.
pub mod layout;
/// In-memory object graph.
pub mod model;
/// File reader.
pub mod reader;
/// File writer.
pub mod writer;
