//! pypistack - CloudFormation synthesizer for a pypiserver package index
//!
//! pypistack declares the cloud infrastructure hosting a private Python
//! package index: a VPC with public and private subnet tiers, an ECS cluster
//! on EC2 capacity, a shared EFS file system holding the packages, an
//! internet-facing application load balancer and a DNS alias. The output is
//! a plain CloudFormation template; provisioning, ordering and rollback are
//! the engine's job.
//!
//! # Modules
//!
//! - [`config`] - Input parameters, defaults and eager validation
//! - [`graph`] - Resource graph / template model with intrinsic helpers
//! - [`stack`] - Section-by-section stack assembly
//! - [`error`] - Error types for synthesis
//!
//! # Example
//!
//! ```
//! use pypistack::{StackBuilder, StackConfig};
//!
//! let config = StackConfig {
//!     domain: "example.com".to_string(),
//!     ..StackConfig::default()
//! };
//! let graph = StackBuilder::build(&config)?;
//! println!("{}", graph.to_yaml()?);
//! # Ok::<(), pypistack::Error>(())
//! ```

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod graph;
pub mod stack;

pub use config::{NatStrategy, StackConfig, StorageStrategy};
pub use error::Error;
pub use graph::ResourceGraph;
pub use stack::StackBuilder;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
