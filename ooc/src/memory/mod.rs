pub mod node_alloc;
pub mod page_table;
pub mod vma;

pub use page_table::{empty, next};
pub use vma::{register_file_backed_region, register_region, Backing, RegisteredRegion, Vma, VmaFlags};
