//! GUS `.pat` patch loading and the resident patch table.

mod pat_format;
mod sample;
mod store;

pub use pat_format::parse_pat;
pub use sample::{Sample, SampleModes};
pub use store::{Patch, PatchStore};
