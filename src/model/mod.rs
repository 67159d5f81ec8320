//! Data model for the listings change feed
//!
//! - [`property`]: the cached entity and its version stamp
//! - [`event`]: wire-level change records and validated [`ChangeEvent`]s

pub mod event;
pub mod property;

pub use event::{ChangeEvent, ChangeKind, RawChange};
pub use property::{EntityId, Property, Version};
