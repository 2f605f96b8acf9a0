mod base;
mod insert;
mod iterator;
mod remove;

pub use base::BPlusTree;
pub use iterator::TreeIterator;
