//! Compact-target decoding and header proof-of-work arithmetic.

pub mod target;

pub use target::{
    compact_to_u256, hash_meets_target, header_work, u256_to_compact, CompactError,
};
