#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::needless_pass_by_value,
    clippy::similar_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

pub mod doctor;
pub mod gateway;
pub mod lifecycle;
pub mod logs;
pub mod materialize;
pub mod monitor;
pub mod profile;
pub mod registry;
pub mod tunnel;
pub mod webhook;

pub use profile::{Profile, ProfileStore};
