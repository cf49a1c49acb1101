//! cushm - Nested trees of typed arrays published through shared memory
//!
//! A [`Registry`] copies a [`Tree`] of [`Array`]s into one named shared
//! memory segment per array and records the layout in a TOML file per
//! project. Any process on the host can then [`attach`](Registry::attach)
//! zero-copy [`ArrayView`]s, until the project is
//! [torn down](Registry::teardown).

mod agent;
pub mod array;
pub mod dtype;
pub mod error;
pub mod human;
pub mod meta;
pub mod progress;
pub mod registry;
pub mod shm;
pub mod store;
pub mod tree;
pub mod view;

pub use array::Array;
pub use dtype::{DType, Element};
pub use error::{Error, Result};
pub use human::format_bytes;
pub use meta::{AttrValue, MetadataTree, SegmentDescriptor};
pub use progress::ProgressObserver;
pub use registry::{
    Attached, LeafInfo, LeafOutcome, ProjectInfo, ProjectListing, Publication, Registry,
    TeardownReport,
};
pub use shm::{Ownership, SharedMemory};
pub use store::{ProjectStore, StoreConfig};
pub use tree::Tree;
pub use view::{AccessMode, ArrayView};
