pub mod cleanse;
pub mod dataset;
pub mod import;
pub mod lineage;

pub use cleanse::*;
pub use dataset::*;
pub use import::*;
pub use lineage::*;
