//! # diskforge
//!
//! Builds one bootable disk image for a 32-bit bare-metal target out of a
//! freestanding kernel, a layered runtime stack, standalone programs and a
//! static asset tree.
//!
//! ## Stages
//!
//! - `runtime` - core, alloc, alloc_system and collections, in dependency order
//! - `kernel` - LTO object linked flat against its layout script
//! - `programs` - every program wrapped by the harness, built in a worker pool
//! - `filesystem` - asset tree scan and id assignment
//! - `image` - loader, kernel, manifest and assets concatenated
//!
//! [`pipeline::Pipeline`] runs them all; each is usable on its own.

pub mod config;
pub mod context;
pub mod error;
pub mod freshness;
pub mod graph;
pub mod harness;
pub mod image;
pub mod kernel;
pub mod layout;
pub mod manifest;
pub mod pipeline;
pub mod programs;
pub mod report;
pub mod runtime;
pub mod target;
pub mod toolchain;

pub use config::ForgeConfig;
pub use context::BuildContext;
pub use error::{BuildError, Result, Stage};
pub use pipeline::{BuildOutput, Pipeline};
pub use target::TargetProfile;
pub use toolchain::{HostToolchain, Toolchain};

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
