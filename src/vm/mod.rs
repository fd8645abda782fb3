//! Virtual memory: regions, region trees, address spaces and the
//! file-page mapper records that tie shared file mappings together.

pub mod filecache;
pub mod region;
pub mod space;
pub mod tree;

pub use region::{RegionBacking, RegionFlags, SpaceId, VmRegion, VnodeId};
pub use space::{MemoryEnv, SpaceKind, VmSpace};
