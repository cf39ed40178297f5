//! Pod port-forward client
//!
//! Resolves a kubeconfig into a [`ConnectionDescriptor`], finds the target pod
//! with a [`WorkloadLocator`], and runs one [`PortForward`] invocation per
//! port mapping. Each invocation forwards a single local connection and ends
//! with exactly one [`TunnelOutcome`].
//!
//! # Example
//!
//! ```ignore
//! use podtunnel_client::{load_kubeconfig, resolve_context, PortForward, StaticLocator, TunnelConfig};
//! use podtunnel_transport::UpgradeDialer;
//! use std::sync::Arc;
//!
//! let context = resolve_context(load_kubeconfig(None)?, None).await?;
//! let dialer = UpgradeDialer::new(
//!     Arc::new(context.descriptor.endpoint()),
//!     Default::default(),
//! )?;
//! let config = TunnelConfig::builder().ports(3000, 8080).build()?;
//!
//! let stats = PortForward::new(Arc::new(dialer), config)
//!     .locate_and_run(&StaticLocator::new("web-0"), &context.namespace)
//!     .await?;
//! ```

pub mod bridge;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod kubeconfig;
pub mod locator;
pub mod streams;
pub mod tunnel;

pub use config::{PortMapping, TunnelConfig, TunnelConfigBuilder};
pub use descriptor::{Auth, ConnectionDescriptor};
pub use error::{Direction, TunnelError, TunnelOutcome, TunnelStats};
pub use kubeconfig::{
    descriptor_from_config, load_kubeconfig, resolve_context, ConfigError, ResolvedContext,
};
pub use locator::{ApiWorkloadLocator, LocateError, StaticLocator, TargetIdentity, WorkloadLocator};
pub use streams::{next_request_id, open_stream_pair, StreamPair};
pub use tunnel::PortForward;
