//! Online virtual machine placement engine for a hierarchical data-center
//! fabric (domains, racks, physical machines, NUMA nodes).
//!
//! The [`core`] module holds the placement decision engine; [`protocol`]
//! speaks the line-oriented request/response format on arbitrary
//! reader/writer pairs.

pub mod core;
pub mod protocol;
