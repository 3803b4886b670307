//! Domain types shared across the kiln crates

mod digest;
mod identity;
mod implementation;
mod origin;
mod outcome;
mod policy;
mod property;

pub use digest::{CacheKey, ContentHash};
pub use identity::{InvocationId, WorkUnitId};
pub use implementation::Implementation;
pub use origin::OriginMetadata;
pub use outcome::{
    BuildStatus, ExecutionOutcome, FailureCause, FailureKind, OutcomeCounts, SkipReason,
};
pub use policy::DependencyInvalidation;
pub use property::{FileCollection, InputProperty, OutputLocation, PathNormalization, TreeType};
