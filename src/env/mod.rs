//! Scoring environments and concrete implementations.
//!
//! Every environment implements the [`Environment`] trait so that the
//! trainers can score molecule batches uniformly.
//!
//! Included environments:
//! - **Descriptors** ([`descriptor`]) -- weighted-sum desirability over cheap
//!   string-level descriptors, each mapped through a clipped ramp.
//! - **Remote** ([`remote`]) -- an external property-prediction server.

pub mod descriptor;
pub mod remote;
pub mod traits;

// Re-export the core trait and result type at the module level.
pub use descriptor::{ClippedScore, Descriptor, DescriptorEnvironment, Objective};
pub use remote::RemoteEnvironment;
pub use traits::{Environment, ScoredBatch};

// ---------------------------------------------------------------------------
// AnyEnv: enum dispatch wrapper for dynamic environment selection
// ---------------------------------------------------------------------------

/// An enum wrapper around all concrete environment types, enabling runtime
/// environment selection without `dyn` (which is incompatible with async trait
/// methods).
pub enum AnyEnv {
    Descriptors(DescriptorEnvironment),
    Remote(RemoteEnvironment),
}

impl Environment for AnyEnv {
    async fn score(&self, molecules: &[String]) -> anyhow::Result<ScoredBatch> {
        match self {
            Self::Descriptors(e) => e.score(molecules).await,
            Self::Remote(e) => e.score(molecules).await,
        }
    }

    fn name(&self) -> &str {
        match self {
            Self::Descriptors(e) => e.name(),
            Self::Remote(e) => e.name(),
        }
    }
}
