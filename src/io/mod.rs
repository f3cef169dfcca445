//! Binary format primitives.
//!
//! The on-disk formats in this crate (the binary dataset file and the page
//! cache) share one vocabulary: a `u32` magic number, a major/minor version
//! record, fixed-width little-endian integers, and length-prefixed arrays.
//! This module provides those primitives; the concrete layouts live with the
//! types they persist ([`crate::data::MetaInfo`], [`crate::data::DMatrix`],
//! [`crate::data::PageCache`]).

mod binary;

pub use binary::{
    read_exact_or_truncated, read_f32, read_f32s, read_magic, read_u32, read_u64, read_u64s,
    read_version, write_f32s, write_u32, write_u64, write_u64s, write_version, DATASET_MAGIC,
    PAGE_CACHE_MAGIC, VERSION_MAJOR, VERSION_MINOR,
};
