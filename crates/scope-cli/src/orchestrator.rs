//! One acquisition session driven against one remote instrument.
//!
//! Every operation follows the same order: check the session is connected,
//! plan and validate locally, probe the peer, acquire, then record. A failure
//! before the acquisition leaves the session exactly as it was.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{debug, info, warn};

use scope_core::session::ChannelColumns;
use scope_core::{
    AnalysisPipeline, ChannelFilter, ConnectionState, Error, ErrorKind, ExportDocument, Extent,
    Geometry, InstrumentKind, Point, Reading, ScanDirection, Session, SessionReport, Trace,
    TrajectoryPlanner, Value,
};
use scope_link::{
    Connection, FrameRequest, InstrumentHandle, Modification, PeerError, ScopeConfig,
};

/// A failed operation, as reported to tool callers.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[error("{kind}: {detail}")]
pub struct OpError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl OpError {
    fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl From<Error> for OpError {
    fn from(e: Error) -> Self {
        Self::new(e.kind(), e.detail())
    }
}

impl From<PeerError> for OpError {
    fn from(e: PeerError) -> Self {
        match e {
            PeerError::Plan(inner) => inner.into(),
            other => Self::new(other.kind(), other.to_string()),
        }
    }
}

pub type OpResult<T> = std::result::Result<T, OpError>;

#[derive(Debug, Clone, Serialize)]
pub struct ConnectOutcome {
    pub connection_state: ConnectionState,
    pub instrument_kind: InstrumentKind,
    pub dataset: String,
    pub address: String,
    pub epoch_id: u64,
    pub pitch: f64,
    pub extent: Extent,
    pub columns: usize,
    pub rows: usize,
    pub channels: Vec<String>,
    pub info: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct PointOutcome {
    pub position: Point,
    pub channel: String,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct GridOutcome {
    pub sample_count: usize,
    pub grid: [usize; 2],
    pub channel: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelStats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    /// RMS deviation about the mean (surface roughness for height channels).
    pub rms: f64,
    pub peak_to_peak: f64,
}

impl ChannelStats {
    fn from_values<'a>(values: impl Iterator<Item = &'a f64>) -> Option<Self> {
        let values: Vec<f64> = values.copied().collect();
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let (min, max) = values
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Some(Self {
            count: values.len(),
            min,
            max,
            mean,
            rms: variance.sqrt(),
            peak_to_peak: max - min,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FrameSummary {
    pub columns: usize,
    pub rows: usize,
    pub sample_count: usize,
    pub direction: ScanDirection,
    pub trace: Trace,
    pub modification: Modification,
    pub channels: BTreeMap<String, ChannelStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LineOutcome {
    pub direction: ScanDirection,
    pub coord: f64,
    pub sample_count: usize,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub per_channel: BTreeMap<String, ChannelStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PathOutcome {
    pub waypoint_count: usize,
    pub resolved_point_count: usize,
    pub path_length: f64,
    pub sample_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PcaOutcome {
    pub n_components: usize,
    pub explained_variance_ratio: Vec<f64>,
    pub total_explained: f64,
    pub rows: usize,
    pub channels: Vec<ChannelColumns>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterOutcome {
    pub n_clusters: usize,
    pub used_pca: bool,
    pub samples_clustered: usize,
    pub cluster_sizes: Vec<usize>,
    pub inertia: Option<f64>,
    pub labels: Vec<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryOutcome {
    pub report: SessionReport,
    pub text: String,
}

struct Link {
    conn: Connection,
    instrument: InstrumentHandle,
}

pub struct Orchestrator {
    config: ScopeConfig,
    session: Session,
    link: Option<Link>,
}

impl Orchestrator {
    pub fn new(config: ScopeConfig) -> Self {
        Self {
            config,
            session: Session::new(),
            link: None,
        }
    }

    #[cfg(test)]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Connect to the peer for `instrument_kind` and open `dataset_reference`.
    /// On any failure the previous connection and session are kept.
    pub async fn connect_and_initialize(
        &mut self,
        address: Option<&str>,
        dataset_reference: &str,
        instrument_kind: &str,
    ) -> OpResult<ConnectOutcome> {
        let kind = InstrumentKind::parse(instrument_kind).ok_or_else(|| {
            OpError::new(
                ErrorKind::InitializationError,
                format!("unsupported instrument kind '{instrument_kind}', expected STEM or AFM"),
            )
        })?;
        let dataset = dataset_reference.trim();
        if dataset.is_empty() {
            return Err(OpError::new(
                ErrorKind::InitializationError,
                "dataset_reference is empty",
            ));
        }
        let address = address
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| self.config.address_for(kind))
            .to_string();

        let mut conn = Connection::connect(&address, self.config.timeout()).await?;
        let instrument = conn.initialize(kind, dataset).await?;

        if self.session.attach(kind, dataset) {
            info!(epoch = self.session.epoch(), "instrument changed, started new epoch");
        }
        let g = instrument.geometry;
        let outcome = ConnectOutcome {
            connection_state: self.session.connection_state(),
            instrument_kind: kind,
            dataset: dataset.to_string(),
            address,
            epoch_id: self.session.epoch(),
            pitch: g.pitch,
            extent: g.extent,
            columns: g.columns(),
            rows: g.rows(),
            channels: instrument.channels.clone(),
            info: instrument.info.clone(),
        };
        self.link = Some(Link { conn, instrument });
        Ok(outcome)
    }

    pub async fn acquire_point(
        &mut self,
        x: f64,
        y: f64,
        channel: Option<String>,
    ) -> OpResult<PointOutcome> {
        let geometry = self.geometry()?;
        let position = Point::new(x, y);
        let plan = TrajectoryPlanner::point(&geometry, position)?;
        let channel = self.channel_or_default(channel);

        let link = self.link_mut()?;
        let result = link.conn.acquire_point(&link.instrument, position, &channel).await;
        let value = self.settle(result)?;
        self.session
            .record(vec![Reading::new(position, channel.as_str(), value.clone())])?;
        self.session.note_plan(plan.summary());
        Ok(PointOutcome {
            position,
            channel,
            value,
        })
    }

    /// Sample an `nx × ny` grid one point at a time. Nothing is recorded
    /// unless every point succeeds.
    pub async fn acquire_grid(
        &mut self,
        nx: usize,
        ny: usize,
        channel: Option<String>,
    ) -> OpResult<GridOutcome> {
        let geometry = self.geometry()?;
        let plan = TrajectoryPlanner::grid(&geometry, nx, ny)?;
        let channel = self.channel_or_default(channel);

        let link = self.link_mut()?;
        let mut readings = Vec::with_capacity(plan.resolved_path.len());
        let mut result = Ok(());
        for &p in &plan.resolved_path {
            match link.conn.acquire_point(&link.instrument, p, &channel).await {
                Ok(v) => readings.push(Reading::new(p, channel.as_str(), v)),
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        self.settle(result)?;
        let sample_count = self.session.record(readings)?;
        self.session.note_plan(plan.summary());
        debug!(nx, ny, sample_count, "grid recorded");
        Ok(GridOutcome {
            sample_count,
            grid: [nx, ny],
            channel,
        })
    }

    pub async fn acquire_full_frame(
        &mut self,
        channels: Option<Vec<String>>,
        modification: Option<&str>,
        direction: Option<&str>,
        trace: Option<&str>,
    ) -> OpResult<FrameSummary> {
        let geometry = self.geometry()?;
        let modification = match modification {
            Some(m) => Modification::parse(m).ok_or_else(|| {
                Error::InvalidParameter(format!(
                    "modification must be none, tip_damage or feedback_degradation, got '{m}'"
                ))
            })?,
            None => Modification::None,
        };
        let direction = direction.map(ScanDirection::parse).transpose()?.unwrap_or_default();
        let trace = trace.map(Trace::parse).transpose()?.unwrap_or_default();
        let plan = TrajectoryPlanner::frame(&geometry, direction, trace);
        let request = FrameRequest {
            channels: self.channels_or_default(channels)?,
            modification,
            direction,
            trace,
        };

        let link = self.link_mut()?;
        let result = link.conn.acquire_frame(&link.instrument, &request).await;
        let readings = self.settle(result)?;
        let stats = channel_stats(&readings);
        let sample_count = self.session.record(readings)?;
        self.session.note_plan(plan.summary());
        Ok(FrameSummary {
            columns: geometry.columns(),
            rows: geometry.rows(),
            sample_count,
            direction,
            trace,
            modification,
            channels: stats,
        })
    }

    pub async fn acquire_line(
        &mut self,
        direction: &str,
        coord: f64,
        channels: Option<Vec<String>>,
    ) -> OpResult<LineOutcome> {
        let geometry = self.geometry()?;
        let direction = ScanDirection::parse(direction)?;
        let plan = TrajectoryPlanner::line(&geometry, direction, coord)?;
        let channels = self.channels_or_default(channels)?;

        let link = self.link_mut()?;
        let result = link
            .conn
            .acquire_line(&link.instrument, direction, coord, &channels)
            .await;
        let readings = self.settle(result)?;
        let per_channel = channel_stats(&readings);
        let sample_count = self.session.record(readings)?;
        self.session.note_plan(plan.summary());
        Ok(LineOutcome {
            direction,
            coord,
            sample_count,
            min: per_channel.values().map(|s| s.min).reduce(f64::min),
            max: per_channel.values().map(|s| s.max).reduce(f64::max),
            per_channel,
        })
    }

    pub async fn acquire_path(
        &mut self,
        waypoints: &[[f64; 2]],
        channels: Option<Vec<String>>,
    ) -> OpResult<PathOutcome> {
        let geometry = self.geometry()?;
        let points: Vec<Point> = waypoints.iter().copied().map(Point::from).collect();
        let plan = TrajectoryPlanner::path(&geometry, &points)?;
        let channels = self.channels_or_default(channels)?;

        let link = self.link_mut()?;
        let result = link.conn.acquire_path(&link.instrument, &plan, &channels).await;
        let readings = self.settle(result)?;
        let sample_count = self.session.record(readings)?;
        let summary = plan.summary();
        self.session.note_plan(summary.clone());
        Ok(PathOutcome {
            waypoint_count: summary.waypoint_count,
            resolved_point_count: summary.resolved_point_count,
            path_length: summary.total_length,
            sample_count,
        })
    }

    pub fn run_pca(&mut self, n_components: usize, channels: Option<Vec<String>>) -> OpResult<PcaOutcome> {
        let filter = ChannelFilter::from_option(channels);
        let result = AnalysisPipeline::run_pca(&mut self.session, &filter, n_components)?;
        let ratios = result.explained_variance_ratios();
        Ok(PcaOutcome {
            n_components: result.components.len(),
            total_explained: ratios.iter().sum(),
            explained_variance_ratio: ratios,
            rows: result.sites.len(),
            channels: result.channels.clone(),
        })
    }

    pub fn run_clustering(
        &mut self,
        n_clusters: usize,
        use_pca: bool,
        channels: Option<Vec<String>>,
    ) -> OpResult<ClusterOutcome> {
        let filter = ChannelFilter::from_option(channels);
        let config = self.config.kmeans();
        let result =
            AnalysisPipeline::run_clustering(&mut self.session, &filter, n_clusters, use_pca, &config)?;
        if use_pca && !result.used_pca {
            debug!("no PCA of the current samples, clustered raw features");
        }
        Ok(ClusterOutcome {
            n_clusters: result.n_clusters,
            used_pca: result.used_pca,
            samples_clustered: result.cluster_labels.len(),
            cluster_sizes: result.cluster_sizes(),
            inertia: result.inertia,
            labels: result.cluster_labels.clone(),
        })
    }

    pub fn get_summary(&self) -> SummaryOutcome {
        let report = SessionReport::from_session(&self.session);
        SummaryOutcome {
            text: report.to_string(),
            report,
        }
    }

    pub fn export_data(&self) -> ExportDocument {
        ExportDocument::from_session(&self.session)
    }

    /// Drop every sample and analysis result; the connection is kept.
    pub fn reset(&mut self) -> u64 {
        let epoch = self.session.reset();
        info!(epoch, "session reset");
        epoch
    }

    fn geometry(&self) -> OpResult<Geometry> {
        match (&self.link, self.session.connection_state()) {
            (Some(link), ConnectionState::Connected) => Ok(link.instrument.geometry),
            (_, state) => Err(Error::SessionNotReady(format!(
                "connection is {state}; call connect_and_initialize first"
            ))
            .into()),
        }
    }

    fn default_channel(&self) -> String {
        self.session
            .instrument_kind()
            .unwrap_or(InstrumentKind::Stem)
            .default_channel()
            .to_string()
    }

    fn channel_or_default(&self, channel: Option<String>) -> String {
        channel
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| self.default_channel())
    }

    /// Channels are read in request order, so each may appear only once.
    fn channels_or_default(&self, channels: Option<Vec<String>>) -> OpResult<Vec<String>> {
        let list = match channels {
            Some(list) if !list.is_empty() => list,
            _ => return Ok(vec![self.default_channel()]),
        };
        let duplicate = {
            let mut seen = BTreeSet::new();
            list.iter().find(|c| !seen.insert(c.as_str())).cloned()
        };
        match duplicate {
            Some(dup) => Err(Error::InvalidParameter(format!(
                "channel '{dup}' requested more than once"
            ))
            .into()),
            None => Ok(list),
        }
    }

    fn link_mut(&mut self) -> OpResult<&mut Link> {
        self.link
            .as_mut()
            .ok_or_else(|| Error::SessionNotReady("no instrument connected".into()).into())
    }

    /// Account for the outcome of one peer exchange. A transport fault drops
    /// the link and marks the session faulted; a rejection leaves it
    /// connected.
    fn settle<T>(&mut self, result: scope_link::Result<T>) -> OpResult<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) if e.is_transport_fault() => {
                warn!(error = %e, "peer link lost, session faulted");
                self.link = None;
                self.session.set_connection_state(ConnectionState::Faulted);
                Err(e.into())
            }
            Err(e) => {
                debug!(error = %e, "peer rejected acquisition");
                Err(e.into())
            }
        }
    }
}

fn channel_stats(readings: &[Reading]) -> BTreeMap<String, ChannelStats> {
    let mut grouped: BTreeMap<&str, Vec<&Value>> = BTreeMap::new();
    for r in readings {
        grouped.entry(r.channel.as_str()).or_default().push(&r.value);
    }
    grouped
        .into_iter()
        .filter_map(|(channel, values)| {
            ChannelStats::from_values(values.iter().flat_map(|v| v.as_slice()))
                .map(|s| (channel.to_string(), s))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use scope_link::{SimHandle, SimOptions, SimServer};

    async fn start(options: SimOptions) -> SimHandle {
        SimServer::bind("127.0.0.1:0", options)
            .await
            .unwrap()
            .spawn()
            .unwrap()
    }

    async fn connected(kind: &str, dataset: &str) -> (SimHandle, Orchestrator) {
        let sim = start(SimOptions::default()).await;
        let mut orch = Orchestrator::new(ScopeConfig::default());
        orch.connect_and_initialize(Some(&sim.address()), dataset, kind)
            .await
            .unwrap();
        (sim, orch)
    }

    fn names(list: &[&str]) -> Option<Vec<String>> {
        Some(list.iter().map(|s| s.to_string()).collect())
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let mut orch = Orchestrator::new(ScopeConfig::default());
        let err = orch.acquire_point(0.0, 0.0, None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::SessionNotReady);
        let err = orch.acquire_line("horizontal", 0.0, None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::SessionNotReady);
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_kind_and_empty_dataset() {
        let mut orch = Orchestrator::new(ScopeConfig::default());
        let err = orch
            .connect_and_initialize(Some("127.0.0.1:1"), "test_stem", "SEM")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InitializationError);
        let err = orch
            .connect_and_initialize(Some("127.0.0.1:1"), "  ", "STEM")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InitializationError);
        assert_eq!(orch.session().connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_reports_geometry() {
        let sim = start(SimOptions::default()).await;
        let mut orch = Orchestrator::new(ScopeConfig::default());
        let out = orch
            .connect_and_initialize(Some(&sim.address()), "test_stem", "stem")
            .await
            .unwrap();
        assert_eq!(out.connection_state, ConnectionState::Connected);
        assert_eq!(out.instrument_kind, InstrumentKind::Stem);
        assert_eq!(out.columns, 101);
        assert!(out.channels.contains(&"Channel_001".to_string()));
    }

    #[tokio::test]
    async fn test_failed_reconnect_keeps_prior_state() {
        let (_sim, mut orch) = connected("AFM", "Compound_Dataset_1").await;
        orch.acquire_point(0.0, 0.0, None).await.unwrap();

        let closed = {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().to_string()
        };
        let err = orch
            .connect_and_initialize(Some(&closed), "Compound_Dataset_1", "AFM")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectionError);
        assert_eq!(orch.session().connection_state(), ConnectionState::Connected);
        assert_eq!(orch.session().samples().len(), 1);
        orch.acquire_point(0.5, 0.5, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_dataset_creates_no_state() {
        let sim = start(SimOptions::default()).await;
        let mut orch = Orchestrator::new(ScopeConfig::default());
        let err = orch
            .connect_and_initialize(Some(&sim.address()), "missing", "AFM")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InitializationError);
        assert_eq!(orch.session().connection_state(), ConnectionState::Disconnected);
        assert!(orch.session().instrument_kind().is_none());
    }

    #[tokio::test]
    async fn test_point_uses_default_channel() {
        let (_sim, mut orch) = connected("AFM", "Compound_Dataset_1").await;
        let out = orch.acquire_point(1.0, -1.0, None).await.unwrap();
        assert_eq!(out.channel, "HeightRetrace");
        assert!(matches!(out.value, Value::Scalar(_)));
        assert_eq!(orch.session().samples().len(), 1);
    }

    #[tokio::test]
    async fn test_out_of_extent_point_is_rejected_locally() {
        let (_sim, mut orch) = connected("AFM", "Compound_Dataset_1").await;
        let err = orch.acquire_point(50.0, 0.0, None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidCoordinate);
        assert!(orch.session().samples().is_empty());
    }

    #[tokio::test]
    async fn test_vertical_line_far_outside_extent() {
        let (_sim, mut orch) = connected("AFM", "Compound_Dataset_1").await;
        let err = orch
            .acquire_line("vertical", 999_999.0, names(&["Phase"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidCoordinate);
        assert_eq!(orch.session().connection_state(), ConnectionState::Connected);
        assert!(orch.session().samples().is_empty());
    }

    #[tokio::test]
    async fn test_line_statistics() {
        let (_sim, mut orch) = connected("AFM", "Compound_Dataset_1").await;
        let out = orch
            .acquire_line("horizontal", 0.5, names(&["HeightTrace", "Phase"]))
            .await
            .unwrap();
        assert_eq!(out.sample_count, 101 * 2);
        let phase = &out.per_channel["Phase"];
        assert_eq!(phase.count, 101);
        assert!(phase.min <= phase.mean && phase.mean <= phase.max);
        assert!((phase.peak_to_peak - (phase.max - phase.min)).abs() < 1e-12);
        assert!(out.min.unwrap() <= out.max.unwrap());
    }

    #[tokio::test]
    async fn test_path_resolves_at_native_pitch() {
        let (_sim, mut orch) = connected("AFM", "Compound_Dataset_1").await;
        let out = orch
            .acquire_path(&[[-2.0, 2.0], [1.0, 1.8], [2.1, 2.0]], names(&["Phase"]))
            .await
            .unwrap();
        assert_eq!(out.resolved_point_count, 44);
        assert_eq!(out.sample_count, 44);
        let expected = (3.0f64).hypot(0.2) + (1.1f64).hypot(0.2);
        assert!((out.path_length - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_degenerate_path() {
        let (_sim, mut orch) = connected("AFM", "Compound_Dataset_1").await;
        let err = orch
            .acquire_path(&[[1.0, 1.0], [1.0, 1.0]], None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DegenerateWaypoints);
    }

    #[tokio::test]
    async fn test_frame_summary() {
        let sim = start(SimOptions {
            pitch: 0.5,
            half_extent: 2.0,
            ..SimOptions::default()
        }).await;
        let mut orch = Orchestrator::new(ScopeConfig::default());
        orch.connect_and_initialize(Some(&sim.address()), "Compound_Dataset_1", "AFM")
            .await
            .unwrap();
        let out = orch
            .acquire_full_frame(names(&["HeightTrace"]), Some("feedback_degradation"), Some("vertical"), Some("retrace"))
            .await
            .unwrap();
        assert_eq!((out.columns, out.rows), (9, 9));
        assert_eq!(out.sample_count, 81);
        assert_eq!(out.channels["HeightTrace"].count, 81);

        let err = orch
            .acquire_full_frame(None, Some("melted_tip"), None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParameter);
    }

    #[tokio::test]
    async fn test_grid_pca_and_clustering() {
        let (_sim, mut orch) = connected("STEM", "test_stem").await;
        let grid = orch.acquire_grid(5, 5, None).await.unwrap();
        assert_eq!(grid.sample_count, 25);

        let pca = orch.run_pca(3, None).unwrap();
        assert_eq!(pca.n_components, 3);
        assert!(pca.explained_variance_ratio.windows(2).all(|w| w[0] >= w[1]));
        assert!(pca.total_explained <= 1.0 + 1e-12);

        let clusters = orch.run_clustering(4, true, None).unwrap();
        assert!(clusters.used_pca);
        assert_eq!(clusters.labels.len(), 25);
        assert!(clusters.labels.iter().all(|&l| l < 4));

        let again = orch.run_clustering(4, true, None).unwrap();
        assert_eq!(clusters.labels, again.labels);
    }

    #[tokio::test]
    async fn test_pca_with_one_sample() {
        let (_sim, mut orch) = connected("STEM", "test_stem").await;
        orch.acquire_point(0.0, 0.0, None).await.unwrap();
        let err = orch.run_pca(1, None).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InsufficientSamples);
        assert!(orch.session().pipeline_result().is_none());
    }

    #[tokio::test]
    async fn test_reset_and_export() {
        let (_sim, mut orch) = connected("STEM", "test_stem").await;
        orch.acquire_grid(3, 3, None).await.unwrap();
        let before = orch.session().epoch();
        let epoch = orch.reset();
        assert!(epoch > before);

        let export = orch.export_data();
        assert_eq!(export.report.sample_count, 0);
        assert_eq!(export.report.n_clusters, 0);
        assert!(export.to_json().is_ok());
        assert_eq!(orch.session().connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_summary_text() {
        let (_sim, mut orch) = connected("AFM", "Compound_Dataset_1").await;
        orch.acquire_line("vertical", 0.0, None).await.unwrap();
        let summary = orch.get_summary();
        assert_eq!(summary.report.sample_count, 101);
        assert!(summary.text.contains("=== AFM Analysis Summary ==="));
    }

    #[tokio::test]
    async fn test_rejection_keeps_connection() {
        let (_sim, mut orch) = connected("AFM", "Compound_Dataset_1").await;
        let err = orch.acquire_point(0.0, 0.0, Some("Channel_001".into())).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AcquisitionError);
        assert_eq!(orch.session().connection_state(), ConnectionState::Connected);
        orch.acquire_point(0.0, 0.0, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_faults_session_until_reconnect() {
        let slow = start(SimOptions {
            latency: Some(Duration::from_millis(600)),
            ..SimOptions::default()
        }).await;
        let config = ScopeConfig::from_toml_str("[peer]\ntimeout_ms = 150").unwrap();
        let mut orch = Orchestrator::new(config);
        orch.connect_and_initialize(Some(&slow.address()), "Compound_Dataset_1", "AFM")
            .await
            .unwrap();

        let err = orch.acquire_point(0.0, 0.0, None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectionError);
        assert_eq!(orch.session().connection_state(), ConnectionState::Faulted);

        let err = orch.acquire_point(0.0, 0.0, None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::SessionNotReady);

        let fast = start(SimOptions::default()).await;
        orch.connect_and_initialize(Some(&fast.address()), "Compound_Dataset_1", "AFM")
            .await
            .unwrap();
        orch.acquire_point(0.0, 0.0, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_switching_instrument_starts_new_epoch() {
        let sim = start(SimOptions::default()).await;
        let mut orch = Orchestrator::new(ScopeConfig::default());
        orch.connect_and_initialize(Some(&sim.address()), "Compound_Dataset_1", "AFM")
            .await
            .unwrap();
        orch.acquire_point(0.0, 0.0, None).await.unwrap();
        let out = orch
            .connect_and_initialize(Some(&sim.address()), "test_stem", "STEM")
            .await
            .unwrap();
        assert_eq!(out.epoch_id, 1);
        assert!(orch.session().samples().is_empty());
    }

    #[test]
    fn test_channel_stats() {
        let p = Point::new(0.0, 0.0);
        let readings = vec![
            Reading::new(p, "a", Value::Scalar(-1.0)),
            Reading::new(p, "a", Value::Scalar(1.0)),
            Reading::new(p, "b", Value::Spectrum(vec![3.0, 4.0])),
        ];
        let stats = channel_stats(&readings);
        assert_eq!(stats["a"].mean, 0.0);
        assert_eq!(stats["a"].rms, 1.0);
        assert_eq!(stats["a"].peak_to_peak, 2.0);
        assert_eq!(stats["b"].count, 2);
    }

    #[test]
    fn test_roughness_is_measured_about_the_mean() {
        let p = Point::new(0.0, 0.0);
        let readings = vec![
            Reading::new(p, "h", Value::Scalar(1.0)),
            Reading::new(p, "h", Value::Scalar(3.0)),
            Reading::new(p, "flat", Value::Scalar(7.5)),
            Reading::new(p, "flat", Value::Scalar(7.5)),
        ];
        let stats = channel_stats(&readings);
        assert_eq!(stats["h"].mean, 2.0);
        assert_eq!(stats["h"].rms, 1.0);
        assert_eq!(stats["flat"].rms, 0.0);
    }

    #[tokio::test]
    async fn test_duplicate_channels_rejected_before_acquisition() {
        let (_sim, mut orch) = connected("AFM", "Compound_Dataset_1").await;
        let err = orch
            .acquire_line("horizontal", 0.0, names(&["Phase", "Phase"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParameter);
        assert!(err.detail.contains("Phase"));

        let err = orch
            .acquire_full_frame(names(&["HeightTrace", "Phase", "HeightTrace"]), None, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParameter);
        let err = orch
            .acquire_path(&[[0.0, 0.0], [1.0, 0.0]], names(&["Amplitude", "Amplitude"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParameter);

        assert_eq!(orch.session().connection_state(), ConnectionState::Connected);
        assert!(orch.session().samples().is_empty());
        assert!(orch.session().last_plan().is_none());
    }
}
