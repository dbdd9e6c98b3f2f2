pub mod pvcreclaim;

pub use pvcreclaim::*;
