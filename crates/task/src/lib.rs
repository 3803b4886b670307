//! Work graph, scheduler and executor for kiln.
//!
//! Declare [`WorkUnit`]s with a [`WorkUnitBuilder`], seal them into a
//! [`WorkGraph`] and hand the graph to an [`Executor`]. Each unit is either
//! skipped as up to date, restored from the build cache or executed, and the
//! invocation ends with a [`BuildReport`].
//!
//! ```no_run
//! use kiln_task::{BuildConfig, CommandAction, Executor, WorkGraph, WorkUnit};
//! use std::path::Path;
//!
//! # async fn build() -> kiln_core::Result<()> {
//! let graph = WorkGraph::builder()
//!     .with(
//!         WorkUnit::builder("generate", CommandAction::new("echo hi > out/gen.txt"))
//!             .output_file("generated", "out/gen.txt"),
//!     )
//!     .seal()?;
//! let executor = Executor::from_config(BuildConfig::default(), Path::new("."))?;
//! let report = executor.run(&graph).await?;
//! println!("{report}");
//! # Ok(())
//! # }
//! ```

pub mod action;
pub mod cancel;
pub mod config;
pub mod executor;
pub mod graph;
pub mod report;
pub mod unit;

pub use action::{ActionContext, ActionOutput, CommandAction, FnAction, WorkAction};
pub use cancel::CancellationHandle;
pub use config::{BuildConfig, ConfigSource, FailureMode, ResolvedConfig};
pub use executor::{ExecutionServices, Executor};
pub use graph::{WorkGraph, WorkGraphBuilder};
pub use report::{BuildReport, UnitReport};
pub use unit::{Precondition, WorkUnit, WorkUnitBuilder};
