//! stripescan — computational core of a structured-light 3-D scanning pipeline.
//!
//! Turns sequences of thresholded binary-pattern photographs into sub-pixel
//! dense correspondence ("code") maps, matches code maps between views into
//! disparity maps, and recovers a 3×4 projective mapping from disparity+code
//! samples via robust least squares. The pipeline stages are:
//!
//! 1. **Decode** – per-bit accumulation of threshold images, table lookup,
//!    isolated-pixel filtering, scanline hole filling.
//! 2. **Refine** – directional / angle-aligned / planar sub-pixel code
//!    refinement.
//! 3. **Match** – range-index–accelerated nearest-code search with 2-D
//!    sub-pixel correction.
//! 4. **Cross-check** – bidirectional consistency validation with
//!    half-occlusion handling.
//! 5. **Filter & merge** – median/consensus filtering, component pruning,
//!    plane-fit hole filling, robust multi-map merging with statistics.
//! 6. **Reproject** – iterative robust recovery of a projection matrix from
//!    disparity+code samples.
//!
//! Stages communicate through checkpoint files (PFM/FLO, see [`io`]) so any
//! stage can be restarted from disk; all in-memory state is stage-local.

pub mod components;
pub mod crosscheck;
pub mod decode;
pub mod filters;
pub mod io;
pub mod matching;
pub mod merge;
pub mod refine;
pub mod reproject;
pub mod stats;

mod codetable;
mod error;
mod grid;

pub use codetable::{CodeTable, MAX_CODES};
pub use components::{Component, ComponentMap, Connectivity};
pub use crosscheck::{cross_check, HalfOcclusion};
pub use error::{Error, Result};
pub use grid::{Axis, Grid, LineSpan, UNK};
pub use matching::{MatchConfig, RangeIndex, SearchWindow};
pub use refine::{RefineConfig, RefineMode};
pub use reproject::{Projection, ReprojectConfig};
