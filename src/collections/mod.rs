/// Kernel containers
///
/// Queues, tables and ID spaces used by every subsystem above the
/// allocators. Nodes live on the kernel heap (`mm::allocator`), never in
/// the Rust `alloc` crate; each container frees its nodes on drop.
///
/// All containers here are unsynchronized; callers wrap them in the lock
/// that guards the owning structure (see `sync::lock_ordering`).
mod dict;
mod idmap;
mod list;
mod slist;

pub use dict::{Dict, DictError};
pub use idmap::IdAllocator;
pub use list::List;
pub use slist::SList;
