//! Recursive extraction engine
//!
//! [`Unpacker`] performs a single extraction step; recursion, throttling and
//! forwarding live in [`crate::scheduler::unpacking`].

pub mod extractors;
pub mod locks;
pub mod unpacker;

pub use extractors::{ExtractedFile, ExtractionMethod};
pub use locks::{UnpackingGuard, UnpackingLockManager};
pub use unpacker::{DEPTH_LIMIT_INFO, UNPACKER_KEY, UnpackMeta, Unpacker};
