/// Numerical epsilon for coordinate comparisons and pitch rounding.
pub const EPSILON: f64 = 1e-9;

/// Eigenvalues below `RANK_TOLERANCE * max_eigenvalue` do not count toward rank.
pub const RANK_TOLERANCE: f64 = 1e-10;

/// Largest native grid (`columns × rows`) a geometry may describe. Finer
/// pitches over the same extent are rejected as unusable.
pub const MAX_NATIVE_POINTS: usize = 1 << 24;

/// Default k-means seed.
pub const DEFAULT_SEED: u64 = 42;

/// Seeded k-means++ restarts; the lowest-inertia run wins.
pub const KMEANS_N_INIT: usize = 10;

/// Lloyd iteration cap per restart.
pub const KMEANS_MAX_ITER: usize = 300;

/// Convergence threshold on the summed squared centre shift.
pub const KMEANS_TOLERANCE: f64 = 1e-4;

/// Default channel for STEM acquisitions.
pub const STEM_DEFAULT_CHANNEL: &str = "Channel_001";

/// Default channel for AFM acquisitions.
pub const AFM_DEFAULT_CHANNEL: &str = "HeightRetrace";
