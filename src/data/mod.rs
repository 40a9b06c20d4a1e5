//! Acquisition data and its reduction into bins.
//!
//! - [`sample`]: `Sample` and the append-only `SampleLog`, plus the raw
//!   whitespace table format
//! - [`bins`]: segmentation of a log into same-voltage runs
//! - [`storage`]: per-bin CSV files with first-wins collision handling

pub mod bins;
pub mod sample;
pub mod storage;

pub use bins::{segment, Bin, BinWarning, Direction, SegmentOptions, Segmentation};
pub use sample::{Sample, SampleLog};
pub use storage::{read_bin_file, BinCategory, BinStore, LoadOptions, StoreReport};
