//! PCA → k-means over the session's feature matrix.
//!
//! Both steps read the session and build a complete new `PipelineResult`
//! before swapping it in. Samples are never touched, and a failed run leaves
//! the previous result in place.

use nalgebra::DMatrix;

use crate::error::Result;
use crate::geometry::Point;
use crate::kmeans::{self, KMeansConfig};
use crate::pca::{self, Component};
use crate::session::{ChannelColumns, ChannelFilter, FeatureMatrix, Session};

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineResult {
    /// Principal components, descending explained variance. Empty when the
    /// result came from clustering raw features.
    pub components: Vec<Component>,
    /// PCA scores, one row per feature row.
    pub projection: Option<DMatrix<f64>>,
    /// Cluster id per feature row. Empty before clustering.
    pub cluster_labels: Vec<usize>,
    pub n_clusters: usize,
    pub used_pca: bool,
    pub inertia: Option<f64>,
    /// Site ids of the feature rows, in row order.
    pub sites: Vec<usize>,
    pub positions: Vec<Point>,
    pub channels: Vec<ChannelColumns>,
}

impl PipelineResult {
    pub fn has_pca(&self) -> bool {
        !self.components.is_empty() && self.projection.is_some()
    }

    pub fn has_clusters(&self) -> bool {
        self.n_clusters > 0
    }

    pub fn cluster_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.n_clusters];
        for &l in &self.cluster_labels {
            if let Some(s) = sizes.get_mut(l) {
                *s += 1;
            }
        }
        sizes
    }

    pub fn explained_variance_ratios(&self) -> Vec<f64> {
        self.components
            .iter()
            .map(|c| c.explained_variance_ratio)
            .collect()
    }

    /// True if this result was computed from exactly these feature rows.
    fn matches(&self, matrix: &FeatureMatrix) -> bool {
        self.sites == matrix.sites && self.channels == matrix.channels
    }
}

pub struct AnalysisPipeline;

impl AnalysisPipeline {
    /// Reduce the current feature matrix to `n_components` principal axes.
    pub fn run_pca<'s>(
        session: &'s mut Session,
        filter: &ChannelFilter,
        n_components: usize,
    ) -> Result<&'s PipelineResult> {
        let matrix = session.current_feature_matrix(filter)?;
        let fit = pca::fit(&matrix.data, n_components)?;

        let result = PipelineResult {
            components: fit.components,
            projection: Some(fit.projection),
            cluster_labels: Vec::new(),
            n_clusters: 0,
            used_pca: false,
            inertia: None,
            sites: matrix.sites,
            positions: matrix.positions,
            channels: matrix.channels,
        };
        Ok(session.replace_pipeline(result))
    }

    /// k-means over the PCA scores (when `use_pca` and a PCA of the same
    /// rows exists) or over the raw feature matrix.
    pub fn run_clustering<'s>(
        session: &'s mut Session,
        filter: &ChannelFilter,
        n_clusters: usize,
        use_pca: bool,
        config: &KMeansConfig,
    ) -> Result<&'s PipelineResult> {
        let matrix = session.current_feature_matrix(filter)?;

        let prior_pca = session
            .pipeline_result()
            .filter(|p| use_pca && p.has_pca() && p.matches(&matrix));

        let (components, projection, fit) = match prior_pca {
            Some(prior) => {
                let scores = prior.projection.clone().unwrap_or_else(|| matrix.data.clone());
                let fit = kmeans::fit(&scores, n_clusters, config)?;
                (prior.components.clone(), Some(scores), fit)
            }
            None => (Vec::new(), None, kmeans::fit(&matrix.data, n_clusters, config)?),
        };

        let result = PipelineResult {
            used_pca: projection.is_some(),
            components,
            projection,
            n_clusters,
            cluster_labels: fit.labels,
            inertia: Some(fit.inertia),
            sites: matrix.sites,
            positions: matrix.positions,
            channels: matrix.channels,
        };
        Ok(session.replace_pipeline(result))
    }
}
