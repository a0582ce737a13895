use std::sync::Arc;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::*;
use rmcp::{ErrorData as McpError, ServerHandler, tool, tool_handler, tool_router};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use scope_link::ScopeConfig;

use crate::orchestrator::{OpError, Orchestrator};

#[derive(Clone)]
pub struct ScopeServer {
    state: Arc<Mutex<Orchestrator>>,
    tool_router: ToolRouter<Self>,
}

impl ScopeServer {
    pub fn new(config: ScopeConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(Orchestrator::new(config))),
            tool_router: Self::tool_router(),
        }
    }
}

fn json_result<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult::success(vec![Content::text(
        serde_json::to_string_pretty(value).unwrap_or_default(),
    )]))
}

/// Precondition violations are the caller's mistake; everything else is an
/// instrument-side failure. Both carry `{kind, detail}` as error data.
fn tool_error(e: OpError) -> McpError {
    let data = serde_json::to_value(&e).ok();
    if e.kind.is_precondition() {
        McpError::invalid_params(e.to_string(), data)
    } else {
        McpError::internal_error(e.to_string(), data)
    }
}

// --- Tool parameter types ---

#[derive(Debug, Deserialize, JsonSchema)]
struct ConnectRequest {
    /// Peer address as host:port. Defaults to the configured address for the
    /// instrument kind.
    address: Option<String>,
    /// Opaque dataset reference understood by the peer
    dataset_reference: String,
    /// "STEM" or "AFM"
    instrument_kind: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct PointRequest {
    x: f64,
    y: f64,
    /// Channel to read. Defaults to Channel_001 (STEM) or HeightRetrace (AFM)
    channel: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct GridRequest {
    /// Number of columns, spread evenly across the scan width
    grid_size_x: usize,
    /// Number of rows, spread evenly across the scan height
    grid_size_y: usize,
    channel: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct FullFrameRequest {
    /// Channels to acquire. Defaults to the instrument's default channel
    channels: Option<Vec<String>>,
    /// "none", "tip_damage" or "feedback_degradation"
    modification: Option<String>,
    /// Fast scan axis: "horizontal" (default) or "vertical"
    direction: Option<String>,
    /// "trace" (default) or "retrace"
    trace: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct LineRequest {
    /// "horizontal" fixes y at `coord`, "vertical" fixes x
    direction: String,
    coord: f64,
    channels: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct PathRequest {
    /// Ordered [x, y] waypoints; the path is resampled at the native pitch
    waypoints: Vec<[f64; 2]>,
    channels: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct PcaRequest {
    n_components: usize,
    /// Restrict the feature matrix to these channels
    channels: Option<Vec<String>>,
}

fn default_use_pca() -> bool {
    true
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ClusterRequest {
    n_clusters: usize,
    /// Cluster PCA scores when a PCA of the current samples exists
    #[serde(default = "default_use_pca")]
    use_pca: bool,
    channels: Option<Vec<String>>,
}

#[tool_router]
impl ScopeServer {
    #[tool(
        description = "Connect to the instrument peer and open a dataset. Must be called before any acquisition. Reports the native sampling pitch, scan extent and available channels. Switching instrument or dataset starts a new session epoch."
    )]
    async fn connect_and_initialize(
        &self,
        Parameters(req): Parameters<ConnectRequest>,
    ) -> Result<CallToolResult, McpError> {
        let mut orch = self.state.lock().await;
        let out = orch
            .connect_and_initialize(
                req.address.as_deref(),
                &req.dataset_reference,
                &req.instrument_kind,
            )
            .await
            .map_err(tool_error)?;
        json_result(&out)
    }

    #[tool(description = "Read one channel at a single (x, y) position and record it.")]
    async fn acquire_point(
        &self,
        Parameters(req): Parameters<PointRequest>,
    ) -> Result<CallToolResult, McpError> {
        let mut orch = self.state.lock().await;
        let out = orch
            .acquire_point(req.x, req.y, req.channel)
            .await
            .map_err(tool_error)?;
        json_result(&out)
    }

    #[tool(
        description = "Sample a grid_size_x by grid_size_y grid snapped to native positions. All points are recorded together or not at all."
    )]
    async fn acquire_grid(
        &self,
        Parameters(req): Parameters<GridRequest>,
    ) -> Result<CallToolResult, McpError> {
        let mut orch = self.state.lock().await;
        let out = orch
            .acquire_grid(req.grid_size_x, req.grid_size_y, req.channel)
            .await
            .map_err(tool_error)?;
        json_result(&out)
    }

    #[tool(
        description = "Scan the full native grid and return per-channel statistics (min, max, mean, rms, peak-to-peak). Optional peer-side modification simulates tip damage or degraded feedback."
    )]
    async fn acquire_full_frame(
        &self,
        Parameters(req): Parameters<FullFrameRequest>,
    ) -> Result<CallToolResult, McpError> {
        let mut orch = self.state.lock().await;
        let out = orch
            .acquire_full_frame(
                req.channels,
                req.modification.as_deref(),
                req.direction.as_deref(),
                req.trace.as_deref(),
            )
            .await
            .map_err(tool_error)?;
        json_result(&out)
    }

    #[tool(
        description = "Scan one line of native positions. Horizontal lines fix y at coord, vertical lines fix x."
    )]
    async fn acquire_line(
        &self,
        Parameters(req): Parameters<LineRequest>,
    ) -> Result<CallToolResult, McpError> {
        let mut orch = self.state.lock().await;
        let out = orch
            .acquire_line(&req.direction, req.coord, req.channels)
            .await
            .map_err(tool_error)?;
        json_result(&out)
    }

    #[tool(
        description = "Sample along a piecewise-linear path through the waypoints, resampled so consecutive points are at most one native pitch apart."
    )]
    async fn acquire_path(
        &self,
        Parameters(req): Parameters<PathRequest>,
    ) -> Result<CallToolResult, McpError> {
        let mut orch = self.state.lock().await;
        let out = orch
            .acquire_path(&req.waypoints, req.channels)
            .await
            .map_err(tool_error)?;
        json_result(&out)
    }

    #[tool(description = "Run PCA over the samples collected in the current epoch.")]
    async fn run_pca(
        &self,
        Parameters(req): Parameters<PcaRequest>,
    ) -> Result<CallToolResult, McpError> {
        let mut orch = self.state.lock().await;
        let out = orch
            .run_pca(req.n_components, req.channels)
            .map_err(tool_error)?;
        json_result(&out)
    }

    #[tool(
        description = "Run seeded k-means over the current samples, on PCA scores when use_pca is set and a matching PCA exists."
    )]
    async fn run_clustering(
        &self,
        Parameters(req): Parameters<ClusterRequest>,
    ) -> Result<CallToolResult, McpError> {
        let mut orch = self.state.lock().await;
        let out = orch
            .run_clustering(req.n_clusters, req.use_pca, req.channels)
            .map_err(tool_error)?;
        json_result(&out)
    }

    #[tool(description = "Summarize the session: sample counts, PCA and clustering results, last scan.")]
    async fn get_summary(&self) -> Result<CallToolResult, McpError> {
        let orch = self.state.lock().await;
        json_result(&orch.get_summary())
    }

    #[tool(
        description = "Export the session report with per-sample cluster assignments and PCA loadings as JSON."
    )]
    async fn export_data(&self) -> Result<CallToolResult, McpError> {
        let orch = self.state.lock().await;
        let json = orch
            .export_data()
            .to_json()
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        Ok(CallToolResult::success(vec![Content::text(json)]))
    }

    #[tool(
        description = "Discard all samples and analysis results and start a new epoch. The instrument connection is kept."
    )]
    async fn reset(&self) -> Result<CallToolResult, McpError> {
        let mut orch = self.state.lock().await;
        let epoch_id = orch.reset();
        json_result(&serde_json::json!({ "epoch_id": epoch_id }))
    }
}

#[tool_handler]
impl ServerHandler for ScopeServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Drives a STEM or AFM instrument through a remote peer and analyzes what it collects.\n\n\
                 WORKFLOW:\n\
                 1. Call connect_and_initialize with the instrument kind and dataset reference.\n\
                 2. Acquire with acquire_point, acquire_grid, acquire_line, acquire_path or acquire_full_frame. \
                    Coordinates are physical units inside the reported extent.\n\
                 3. Analyze with run_pca, then run_clustering (use_pca=true reuses the PCA scores).\n\
                 4. Inspect with get_summary or export_data. reset clears samples and results.\n\n\
                 Errors carry {kind, detail}. After a ConnectionError the session is faulted \
                 and must be reconnected."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}
