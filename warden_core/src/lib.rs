//! Core algorithms and data structures of the warden manager.

use ahash::{AHashMap, AHashSet};

pub mod cover;
pub mod persist;
pub mod prog;
pub mod syscall;

pub type HashMap<K, V> = AHashMap<K, V>;
pub type HashSet<V> = AHashSet<V>;
