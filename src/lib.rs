//! The segheap allocator crate.
//!
//! For getting started:
//! - Check out the crate's README.
//! - Read the [`Space`] and [`Heap`] documentation.
//!
//! A [`Space`] is an independent allocator with its own segments and lock.
//! Create one with [`Space::create`] or [`Space::create_with_base`], or use
//! [`DefaultSpace`] as the `#[global_allocator]`. Locking a space yields its
//! [`Heap`], which holds the allocation routines.
//!
//! Spaces are generic over the lock, any [`lock_api::RawMutex`] such as
//! `spin::Mutex<()>`, [`PthreadMutex`] or [`NoLock`], and over the [`Source`]
//! of their memory, such as [`Mmap`], [`Sbrk`] or [`Manual`].

#![cfg_attr(not(test), no_std)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub(crate) mod ptr_utils;

pub mod base;
pub mod error;
pub mod params;
pub mod source;
pub mod sync;

pub use base::{usable_size, Heap, MemInfo, Stats, MALLOC_ALIGNMENT};
#[cfg(feature = "counters")]
pub use base::Counters;
pub use error::{CorruptionAction, ErrorPolicy, HeapError, UsageAction};
pub use params::{default_tuning, page_size, set_param, Param, Tuning};
pub use source::{Manual, Source};
#[cfg(all(feature = "system-backed", unix))]
pub use source::{Mmap, Sbrk};
pub use sync::{NoLock, Space};
#[cfg(all(feature = "system-backed", unix))]
pub use sync::{DefaultSpace, GlobalLock, PthreadMutex};
