//! Session summaries and machine-readable export.
//!
//! Rendering is total: any session, including a fresh or just-reset one,
//! produces a report.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::geometry::Point;
use crate::instrument::{ConnectionState, InstrumentKind};
use crate::session::{ChannelColumns, Session};
use crate::trajectory::PlanSummary;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PcaReport {
    pub n_components: usize,
    pub explained_variance_ratio: Vec<f64>,
    pub total_explained: f64,
    pub rows: usize,
    pub columns: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClusterReport {
    pub n_clusters: usize,
    pub cluster_sizes: Vec<usize>,
    pub used_pca: bool,
    pub samples_clustered: usize,
    pub inertia: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionReport {
    pub epoch_id: u64,
    pub instrument_kind: Option<InstrumentKind>,
    pub dataset: Option<String>,
    pub connection_state: ConnectionState,
    pub sample_count: usize,
    pub site_count: usize,
    pub channels: BTreeMap<String, usize>,
    pub pca: Option<PcaReport>,
    pub clustering: Option<ClusterReport>,
    pub n_clusters: usize,
    pub last_scan: Option<PlanSummary>,
}

impl SessionReport {
    pub fn from_session(session: &Session) -> Self {
        let channels = session.channel_counts();
        let sample_count = channels.values().sum();
        let pipeline = session.pipeline_result();

        let pca = pipeline.filter(|p| p.has_pca()).map(|p| {
            let ratios = p.explained_variance_ratios();
            PcaReport {
                n_components: p.components.len(),
                total_explained: ratios.iter().sum(),
                explained_variance_ratio: ratios,
                rows: p.sites.len(),
                columns: p.channels.iter().map(|c| c.width).sum(),
            }
        });

        let clustering = pipeline.filter(|p| p.has_clusters()).map(|p| ClusterReport {
            n_clusters: p.n_clusters,
            cluster_sizes: p.cluster_sizes(),
            used_pca: p.used_pca,
            samples_clustered: p.cluster_labels.len(),
            inertia: p.inertia,
        });

        Self {
            epoch_id: session.epoch(),
            instrument_kind: session.instrument_kind(),
            dataset: session.dataset().map(str::to_string),
            connection_state: session.connection_state(),
            sample_count,
            site_count: session.site_count(),
            channels,
            n_clusters: clustering.as_ref().map_or(0, |c| c.n_clusters),
            pca,
            clustering,
            last_scan: session.last_plan().cloned(),
        }
    }
}

impl fmt::Display for SessionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = self.instrument_kind.map_or("Instrument", |k| k.as_str());
        writeln!(f, "=== {kind} Analysis Summary ===")?;
        writeln!(f)?;
        writeln!(f, "Epoch: {}", self.epoch_id)?;
        writeln!(f, "Connection: {}", self.connection_state)?;
        if let Some(dataset) = &self.dataset {
            writeln!(f, "Dataset: {dataset}")?;
        }
        writeln!(f)?;

        if self.sample_count == 0 {
            writeln!(f, "Samples: none collected")?;
        } else {
            writeln!(f, "Samples: {} at {} sites", self.sample_count, self.site_count)?;
            for (channel, count) in &self.channels {
                writeln!(f, "  - {channel}: {count}")?;
            }
        }
        writeln!(f)?;

        match &self.pca {
            Some(p) => {
                writeln!(f, "PCA Results:")?;
                writeln!(f, "  - Shape: {} x {} -> {} components", p.rows, p.columns, p.n_components)?;
                let ratios: Vec<String> = p
                    .explained_variance_ratio
                    .iter()
                    .map(|r| format!("{r:.4}"))
                    .collect();
                writeln!(f, "  - Explained variance ratio: [{}]", ratios.join(", "))?;
                writeln!(f, "  - Total variance explained: {:.2}%", p.total_explained * 100.0)?;
            }
            None => writeln!(f, "PCA Results: Not performed")?,
        }
        writeln!(f)?;

        match &self.clustering {
            Some(c) => {
                writeln!(f, "Clustering Results:")?;
                writeln!(f, "  - Number of clusters: {}", c.n_clusters)?;
                writeln!(f, "  - Samples clustered: {}", c.samples_clustered)?;
                writeln!(
                    f,
                    "  - Data used: {}",
                    if c.used_pca { "PCA-reduced data" } else { "original features" }
                )?;
                for (i, size) in c.cluster_sizes.iter().enumerate() {
                    writeln!(f, "    Cluster {i}: {size} samples")?;
                }
            }
            None => writeln!(f, "Clustering Results: Not performed")?,
        }

        if let Some(scan) = &self.last_scan {
            writeln!(f)?;
            writeln!(
                f,
                "Last scan: {:?}, {} points over {:.4} (pitch {})",
                scan.kind, scan.resolved_point_count, scan.total_length, scan.pitch
            )?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClusterAssignment {
    pub location: Point,
    pub site: usize,
    pub cluster: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PcaExport {
    pub channels: Vec<ChannelColumns>,
    pub explained_variance: Vec<f64>,
    pub explained_variance_ratio: Vec<f64>,
    pub loadings: Vec<Vec<f64>>,
}

/// Everything a downstream tool needs: the summary plus per-row cluster
/// assignments and PCA loadings.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExportDocument {
    pub report: SessionReport,
    pub cluster_map: Vec<ClusterAssignment>,
    pub pca: Option<PcaExport>,
}

impl ExportDocument {
    pub fn from_session(session: &Session) -> Self {
        let pipeline = session.pipeline_result();

        let cluster_map = pipeline
            .map(|p| {
                p.cluster_labels
                    .iter()
                    .zip(p.sites.iter().zip(&p.positions))
                    .map(|(&cluster, (&site, &location))| ClusterAssignment {
                        location,
                        site,
                        cluster,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let pca = pipeline.filter(|p| p.has_pca()).map(|p| PcaExport {
            channels: p.channels.clone(),
            explained_variance: p.components.iter().map(|c| c.explained_variance).collect(),
            explained_variance_ratio: p.explained_variance_ratios(),
            loadings: p.components.iter().map(|c| c.loadings.clone()).collect(),
        });

        Self {
            report: SessionReport::from_session(session),
            cluster_map,
            pca,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kmeans::KMeansConfig;
    use crate::pipeline::AnalysisPipeline;
    use crate::sample::{Reading, Value};
    use crate::session::ChannelFilter;

    fn populated() -> Session {
        let mut s = Session::new();
        s.attach(InstrumentKind::Afm, "Compound_Dataset_1");
        let readings = (0..8)
            .flat_map(|i| {
                let p = Point::new(i as f64, 0.0);
                [
                    Reading::new(p, "HeightRetrace", Value::Scalar((i as f64).sin())),
                    Reading::new(p, "Phase", Value::Scalar((i * i) as f64)),
                ]
            })
            .collect();
        s.record(readings).unwrap();
        s
    }

    #[test]
    fn test_empty_session_report_is_total() {
        let s = Session::new();
        let report = SessionReport::from_session(&s);
        assert_eq!(report.sample_count, 0);
        assert_eq!(report.n_clusters, 0);
        assert!(report.pca.is_none());
        let text = report.to_string();
        assert!(text.contains("Samples: none collected"));
        assert!(text.contains("Clustering Results: Not performed"));

        let export = ExportDocument::from_session(&s);
        assert!(export.cluster_map.is_empty());
        assert!(export.to_json().is_ok());
    }

    #[test]
    fn test_report_counts_channels() {
        let s = populated();
        let report = SessionReport::from_session(&s);
        assert_eq!(report.sample_count, 16);
        assert_eq!(report.site_count, 8);
        assert_eq!(report.channels["Phase"], 8);
        assert!(report.to_string().contains("=== AFM Analysis Summary ==="));
    }

    #[test]
    fn test_export_cluster_map() {
        let mut s = populated();
        AnalysisPipeline::run_pca(&mut s, &ChannelFilter::All, 2).unwrap();
        AnalysisPipeline::run_clustering(&mut s, &ChannelFilter::All, 2, true, &KMeansConfig::default())
            .unwrap();

        let export = ExportDocument::from_session(&s);
        assert_eq!(export.cluster_map.len(), 8);
        assert_eq!(export.cluster_map[0].cluster, 0);
        assert_eq!(export.pca.as_ref().unwrap().loadings.len(), 2);
        assert_eq!(export.report.n_clusters, 2);

        let json: serde_json::Value = serde_json::from_str(&export.to_json().unwrap()).unwrap();
        assert_eq!(json["cluster_map"][3]["location"]["x"], 3.0);
        assert_eq!(json["report"]["clustering"]["used_pca"], true);
    }
}
