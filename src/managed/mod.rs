//! Container primitives with stable, misuse-detecting indices.
mod slab;

pub use self::slab::{Key, Slab};
