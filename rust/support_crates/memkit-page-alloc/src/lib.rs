//! Page-granular memory obtained directly from the operating system.
//!
//! On Linux pages come from anonymous `mmap`; elsewhere an aligned
//! `std::alloc` allocation emulates them. [`PageSpan`] owns one mapping and
//! unmaps it on drop.

pub mod page_span;

#[cfg_attr(target_os = "linux", path = "mmap_linux.rs")]
#[cfg_attr(not(target_os = "linux"), path = "mmap_fallback.rs")]
pub mod mmap;

pub use page_span::PageSpan;

#[cfg(test)]
mod tests;
