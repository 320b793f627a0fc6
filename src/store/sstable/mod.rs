//! On-disk node file format.
//!
//! A node file is a run of checksummed, optionally compressed pages followed
//! by a page directory (the index) and a fixed footer.
//!
//! ```text
//! +-------------------+
//! | Page 0            |  ← header + offset table + rows
//! +-------------------+
//! | ...               |
//! +-------------------+
//! | Page N-1          |
//! +-------------------+
//! | Index             |  ← header with node totals + one entry per page
//! +-------------------+
//! | Footer            |  ← index offset (u64) + magic (u32)
//! +-------------------+
//! ```
//!
//! - `page.rs` builds and decodes pages and searches within one
//! - `index.rs` routes a key to the page that may hold it
//! - `table.rs` writes node files and reads them back through mmap or
//!   positional reads
//!
//! Pages are cut only between keys, so all versions of one key always live
//! in a single page and a point lookup touches exactly one page.

pub mod index;
pub mod page;
pub mod table;

pub use index::{Index, IndexHeader, PageEntry};
pub use page::{Page, PageBuilder};
pub use table::{NodeFile, NodeFileIter, NodeWriter};
