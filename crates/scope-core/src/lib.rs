//! Instrument session core: scan trajectory planning, acquisition session
//! state, and a deterministic PCA → k-means analysis pipeline.
//!
//! Samples are accumulated per session epoch and turned into a dense feature
//! matrix on demand. Clustering is seeded, so identical state and parameters
//! always reproduce identical labels.
//!
//! No I/O here: transport and the remote peer live in `scope-link`.

pub mod constants;
pub mod error;
pub mod geometry;
pub mod instrument;
pub mod kmeans;
pub mod pca;
pub mod pipeline;
pub mod report;
pub mod sample;
pub mod session;
pub mod trajectory;

pub use constants::{DEFAULT_SEED, EPSILON};
pub use error::{Error, ErrorKind, Result};
pub use geometry::{Extent, Geometry, Point, ScanDirection, Trace};
pub use instrument::{ConnectionState, InstrumentKind};
pub use kmeans::KMeansConfig;
pub use pca::Component;
pub use pipeline::{AnalysisPipeline, PipelineResult};
pub use report::{ExportDocument, SessionReport};
pub use sample::{Reading, Sample, Value};
pub use session::{ChannelFilter, FeatureMatrix, Session};
pub use trajectory::{PlanKind, PlanSummary, TrajectoryPlan, TrajectoryPlanner, path_length};
