//! Storage and network binding
//!
//! This module materializes named volumes and binds services to their
//! volumes, bind mounts and networks.

pub mod binder;
pub mod volume;

pub use binder::{Binder, Binding, BoundMount};
pub use volume::{Volume, VolumeStore};
