//! Reading support for zar archives: block-compressed, content-hashed,
//! read-optimised archives for mount-and-read workloads.
//!
//! A zar archive stores file data as a stream of 64 KiB blocks, each either
//! zstd-compressed or stored verbatim, indexed by a sparse offset table so
//! that small scattered reads only ever touch the blocks they need. The
//! directory hierarchy is a flat array of fixed-size entries with
//! deduplicated names, letting lookups run without any allocation.
//!
//! Use [`Archive`] to open an archive and service random-access reads through
//! its internal block cache. For writing archives, see the `zar-enc` crate.

#[cfg(feature = "log")]
#[macro_use(trace_time)]
extern crate measure_time;

#[cfg(feature = "log")]
#[macro_use(trace)]
extern crate log;

#[cfg(not(feature = "log"))]
#[macro_use]
mod macros {
    macro_rules! trace {
        ($($tt:tt)*) => {
            let _ = if false {
                let _ = ::std::format_args!($($tt)*);
            };
        };
    }

    macro_rules! trace_time {
        ($($tt:tt)*) => {
            trace!($($tt)*)
        };
    }
}

macro_rules! bail {
    ($err:expr $(,)?) => {
        return Err(Into::into($err))
    };
}

pub mod archive;
pub mod format;
pub mod path;

pub use positioned_io;

use std::{cmp::Ordering, ops::Range};

pub use archive::{Archive, Config, DirEntry, Error, FileReader, NodeHandle, Result};

/// There is currently no binary search functions in std over a generic range.
/// This is adapted from std: <https://github.com/rust-lang/rust/blob/1.86.0/library/core/src/slice/mod.rs#L2817>
/// License: MIT OR Apache-2.0
fn bisect_range_by<F>(range: Range<usize>, mut f: F) -> Option<usize>
where
    F: FnMut(usize) -> Ordering,
{
    let mut size = range.end - range.start;
    if size == 0 {
        return None;
    }
    let mut base = range.start;

    while size > 1 {
        let half = size / 2;
        let mid = base + half;
        let cmp = f(mid);
        base = if cmp == Ordering::Greater { base } else { mid };
        size -= half;
    }

    if f(base) == Ordering::Equal {
        debug_assert!(base < range.end);
        Some(base)
    } else {
        None
    }
}
