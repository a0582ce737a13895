//! Synthetic instrument peer speaking the same JSON-RPC protocol as a real
//! backend. Serves deterministic STEM spectra and AFM topography so the
//! orchestrator can be exercised end to end without hardware.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use scope_core::{Extent, Geometry, InstrumentKind, Point, TrajectoryPlanner, Value};

use crate::wire::{
    FrameParams, INVALID_PARAMS, InitializeParams, InitializeResult, LineParams, METHOD_NOT_FOUND,
    Modification, NOT_INITIALIZED, OUT_OF_RANGE, PARSE_ERROR, PathParams, PointParams,
    PointResult, Request, Response, ScanResult, UNKNOWN_DATASET,
};

const STEM_CHANNELS: &[&str] = &["Channel_001", "HAADF"];
const AFM_CHANNELS: &[&str] = &["HeightTrace", "HeightRetrace", "Phase", "Amplitude"];

/// Tip radius for the `tip_damage` modifier, in pitches.
const TIP_RADIUS_PITCHES: f64 = 3.0;
/// First-order lag gain for `feedback_degradation`.
const FEEDBACK_GAIN: f64 = 0.35;

#[derive(Debug, Clone)]
pub struct SimOptions {
    pub pitch: f64,
    pub half_extent: f64,
    pub datasets: Vec<String>,
    pub spectrum_bins: usize,
    /// Delay before answering any acquisition request.
    pub latency: Option<Duration>,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            pitch: 0.1,
            half_extent: 5.0,
            datasets: vec!["Compound_Dataset_1".to_string(), "test_stem".to_string()],
            spectrum_bins: 48,
            latency: None,
        }
    }
}

pub struct SimServer {
    listener: TcpListener,
    options: Arc<SimOptions>,
    geometry: Geometry,
}

impl SimServer {
    pub async fn bind(addr: &str, options: SimOptions) -> io::Result<Self> {
        let h = options.half_extent;
        let geometry = Geometry::new(
            options.pitch,
            Extent {
                x_min: -h,
                x_max: h,
                y_min: -h,
                y_max: h,
            },
        )
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        if options.spectrum_bins == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "spectrum_bins must be at least 1",
            ));
        }

        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            options: Arc::new(options),
            geometry,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` resolves, then close every open connection.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> io::Result<()> {
        let (stop, stopped) = watch::channel(false);
        let result = tokio::select! {
            r = self.accept_loop(stopped) => r,
            _ = shutdown => Ok(()),
        };
        let _ = stop.send(true);
        result
    }

    /// Run the accept loop as a background task.
    pub fn spawn(self) -> io::Result<SimHandle> {
        let addr = self.local_addr()?;
        let (stop, stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            if let Err(e) = self.accept_loop(stopped).await {
                warn!("simulator stopped: {e}");
            }
        });
        Ok(SimHandle { addr, stop, task })
    }

    /// One task per connection. Each task ends when its client hangs up or
    /// when `stopped` fires.
    async fn accept_loop(self, mut stopped: watch::Receiver<bool>) -> io::Result<()> {
        info!(addr = %self.local_addr()?, pitch = self.geometry.pitch, "simulator listening");
        loop {
            let (stream, remote) = tokio::select! {
                biased;
                _ = stopped.changed() => return Ok(()),
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        continue;
                    }
                },
            };
            let peer = PeerState::new(Arc::clone(&self.options), self.geometry);
            let stopped = stopped.clone();
            tokio::spawn(async move {
                if let Err(e) = peer.serve(stream, stopped).await {
                    debug!(%remote, "simulator connection ended: {e}");
                }
            });
        }
    }
}

/// Control handle for a simulator running in the background. Dropping it
/// stops the simulator.
pub struct SimHandle {
    addr: SocketAddr,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SimHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    /// Stop accepting and sever every open connection.
    pub fn shutdown(&mut self) {
        let _ = self.stop.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SimHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

type Reply = std::result::Result<serde_json::Value, (i64, String)>;

struct PeerState {
    options: Arc<SimOptions>,
    geometry: Geometry,
    opened: Option<InstrumentKind>,
}

impl PeerState {
    fn new(options: Arc<SimOptions>, geometry: Geometry) -> Self {
        Self {
            options,
            geometry,
            opened: None,
        }
    }

    async fn serve(mut self, stream: TcpStream, mut stopped: watch::Receiver<bool>) -> io::Result<()> {
        let mut stream = BufReader::new(stream);
        let mut line = String::new();
        loop {
            line.clear();
            let n = tokio::select! {
                biased;
                _ = stopped.changed() => return Ok(()),
                n = stream.read_line(&mut line) => n?,
            };
            if n == 0 {
                return Ok(());
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let response = match serde_json::from_str::<Request>(trimmed) {
                Ok(req) => self.handle(req).await,
                Err(e) => Response::err(None, PARSE_ERROR, format!("parse error: {e}")),
            };
            let mut out = serde_json::to_vec(&response)?;
            out.push(b'\n');
            let writer = stream.get_mut();
            writer.write_all(&out).await?;
            writer.flush().await?;
        }
    }

    async fn handle(&mut self, req: Request) -> Response {
        debug!(method = %req.method, id = req.id, "simulator request");
        if let Some(latency) = self.options.latency.filter(|_| req.method.starts_with("acquire_")) {
            tokio::time::sleep(latency).await;
        }

        let outcome = match req.method.as_str() {
            "ping" => Ok(serde_json::json!({ "pong": true })),
            "initialize" => params(req.params).and_then(|p| self.initialize(p)),
            "acquire_point" => params(req.params).and_then(|p| self.acquire_point(p)),
            "acquire_line" => params(req.params).and_then(|p| self.acquire_line(p)),
            "acquire_frame" => params(req.params).and_then(|p| self.acquire_frame(p)),
            "acquire_path" => params(req.params).and_then(|p| self.acquire_path(p)),
            other => Err((METHOD_NOT_FOUND, format!("unknown method {other}"))),
        };
        match outcome {
            Ok(result) => Response::ok(Some(req.id), result),
            Err((code, message)) => Response::err(Some(req.id), code, message),
        }
    }

    fn initialize(&mut self, p: InitializeParams) -> Reply {
        if !self.options.datasets.iter().any(|d| d == &p.dataset) {
            return Err((UNKNOWN_DATASET, format!("unknown dataset {}", p.dataset)));
        }
        self.opened = Some(p.instrument);
        info!(instrument = %p.instrument, dataset = %p.dataset, "simulator dataset opened");
        to_reply(&InitializeResult {
            pitch: self.geometry.pitch,
            extent: self.geometry.extent,
            channels: channels_for(p.instrument).iter().map(|c| c.to_string()).collect(),
            info: serde_json::json!({
                "simulated": true,
                "dataset": p.dataset,
                "spectrum_bins": self.options.spectrum_bins,
            }),
        })
    }

    fn acquire_point(&self, p: PointParams) -> Reply {
        let field = self.field()?;
        field.check_channels(std::slice::from_ref(&p.channel))?;
        let position = Point::new(p.x, p.y);
        self.check_in_extent(position)?;
        to_reply(&PointResult {
            value: field.sample(&p.channel, position),
        })
    }

    fn acquire_line(&self, p: LineParams) -> Reply {
        let field = self.field()?;
        field.check_channels(&p.channels)?;
        let plan = TrajectoryPlanner::line(&self.geometry, p.direction, p.coord)
            .map_err(|e| (OUT_OF_RANGE, e.to_string()))?;
        to_reply(&field.scan(&p.channels, &plan.resolved_path, Modification::None))
    }

    fn acquire_frame(&self, p: FrameParams) -> Reply {
        let field = self.field()?;
        field.check_channels(&p.channels)?;
        let plan = TrajectoryPlanner::frame(&self.geometry, p.direction, p.trace);
        to_reply(&field.scan(&p.channels, &plan.resolved_path, p.modification))
    }

    fn acquire_path(&self, p: PathParams) -> Reply {
        let field = self.field()?;
        field.check_channels(&p.channels)?;
        let points: Vec<Point> = p.points.into_iter().map(Point::from).collect();
        for &point in &points {
            self.check_in_extent(point)?;
        }
        to_reply(&field.scan(&p.channels, &points, Modification::None))
    }

    fn field(&self) -> std::result::Result<Field, (i64, String)> {
        let kind = self
            .opened
            .ok_or_else(|| (NOT_INITIALIZED, "no dataset opened".to_string()))?;
        Ok(Field {
            kind,
            bins: self.options.spectrum_bins,
            pitch: self.geometry.pitch,
        })
    }

    fn check_in_extent(&self, p: Point) -> std::result::Result<(), (i64, String)> {
        if p.is_finite() && self.geometry.extent.contains(p) {
            Ok(())
        } else {
            Err((OUT_OF_RANGE, format!("({}, {}) is outside the scan area", p.x, p.y)))
        }
    }
}

fn params<P: DeserializeOwned>(value: serde_json::Value) -> std::result::Result<P, (i64, String)> {
    serde_json::from_value(value).map_err(|e| (INVALID_PARAMS, format!("invalid params: {e}")))
}

fn to_reply<T: serde::Serialize>(value: &T) -> Reply {
    serde_json::to_value(value).map_err(|e| (INVALID_PARAMS, e.to_string()))
}

fn channels_for(kind: InstrumentKind) -> &'static [&'static str] {
    match kind {
        InstrumentKind::Stem => STEM_CHANNELS,
        InstrumentKind::Afm => AFM_CHANNELS,
    }
}

/// Deterministic synthetic sample for one instrument kind.
struct Field {
    kind: InstrumentKind,
    bins: usize,
    pitch: f64,
}

impl Field {
    fn check_channels(&self, channels: &[String]) -> std::result::Result<(), (i64, String)> {
        if channels.is_empty() {
            return Err((INVALID_PARAMS, "no channels requested".to_string()));
        }
        let known = channels_for(self.kind);
        match channels.iter().find(|c| !known.contains(&c.as_str())) {
            Some(c) => Err((INVALID_PARAMS, format!("unknown {} channel {c}", self.kind))),
            None => Ok(()),
        }
    }

    fn scan(&self, channels: &[String], path: &[Point], modification: Modification) -> ScanResult {
        let mut result = ScanResult::default();
        for channel in channels {
            let values = match modification {
                Modification::None => path.iter().map(|&p| self.sample(channel, p)).collect(),
                Modification::TipDamage => {
                    path.iter().map(|&p| self.blunt_tip(channel, p)).collect()
                }
                Modification::FeedbackDegradation => {
                    lagged(path.iter().map(|&p| self.sample(channel, p)))
                }
            };
            result.channels.insert(channel.clone(), values);
        }
        result
    }

    /// Channels are validated before sampling; anything else reads as zero.
    fn sample(&self, channel: &str, p: Point) -> Value {
        match channel {
            "Channel_001" => Value::Spectrum(spectrum(p, self.bins)),
            "HAADF" => Value::Scalar(haadf(p)),
            "HeightTrace" => Value::Scalar(height(p)),
            "HeightRetrace" => Value::Scalar(height(p) + 0.02),
            "Phase" => Value::Scalar(phase(p)),
            "Amplitude" => Value::Scalar(amplitude(p)),
            _ => Value::Scalar(0.0),
        }
    }

    /// A blunt tip reports the highest point under its footprint for scalar
    /// channels and a smeared average for spectra.
    fn blunt_tip(&self, channel: &str, p: Point) -> Value {
        let r = TIP_RADIUS_PITCHES * self.pitch;
        let footprint = [(0.0, 0.0), (r, 0.0), (-r, 0.0), (0.0, r), (0.0, -r)]
            .map(|(dx, dy)| self.sample(channel, Point::new(p.x + dx, p.y + dy)));
        match &footprint[0] {
            Value::Scalar(_) => Value::Scalar(
                footprint
                    .iter()
                    .flat_map(|v| v.as_slice().iter().copied())
                    .fold(f64::NEG_INFINITY, f64::max),
            ),
            Value::Spectrum(first) => {
                let mut mean = vec![0.0; first.len()];
                for v in &footprint {
                    for (m, x) in mean.iter_mut().zip(v.as_slice()) {
                        *m += x / footprint.len() as f64;
                    }
                }
                Value::Spectrum(mean)
            }
        }
    }
}

/// Sluggish feedback: each reading only moves part of the way toward the
/// true value, in scan order.
fn lagged(values: impl Iterator<Item = Value>) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    for target in values {
        let next = match (out.last(), &target) {
            (Some(Value::Scalar(prev)), Value::Scalar(t)) => {
                Value::Scalar(prev + FEEDBACK_GAIN * (t - prev))
            }
            (Some(Value::Spectrum(prev)), Value::Spectrum(t)) if prev.len() == t.len() => {
                Value::Spectrum(
                    prev.iter()
                        .zip(t)
                        .map(|(p, t)| p + FEEDBACK_GAIN * (t - p))
                        .collect(),
                )
            }
            _ => target.clone(),
        };
        out.push(next);
    }
    out
}

/// Repeatable pseudo-noise in [-0.5, 0.5).
fn texture(p: Point, salt: f64) -> f64 {
    let s = (p.x * 12.9898 + p.y * 78.233 + salt * 37.719).sin() * 43_758.545_3;
    s - s.floor() - 0.5
}

fn logistic(t: f64) -> f64 {
    1.0 / (1.0 + (-t).exp())
}

/// Mixture weights of three material phases across the sample.
fn phase_weights(p: Point) -> [f64; 3] {
    let a = logistic(1.5 * p.x);
    let b = logistic(1.5 * p.y) * (1.0 - 0.5 * a);
    let c = (-((p.x - 1.5).powi(2) + (p.y + 1.5).powi(2)) / 1.44).exp();
    [a, b, c]
}

fn spectrum(p: Point, bins: usize) -> Vec<f64> {
    let w = phase_weights(p);
    let n = bins as f64;
    let peaks = [(0.2 * n, n / 16.0), (0.5 * n, n / 20.0), (0.75 * n, n / 14.0)];
    (0..bins)
        .map(|i| {
            let e = i as f64;
            let background = 0.3 * (-e / (0.4 * n)).exp();
            let signal: f64 = w
                .iter()
                .zip(peaks)
                .map(|(w, (center, width))| w * (-(e - center).powi(2) / (2.0 * width * width)).exp())
                .sum();
            background + signal + 0.01 * texture(p, e)
        })
        .collect()
}

fn haadf(p: Point) -> f64 {
    let [a, b, c] = phase_weights(p);
    10.0 + 4.0 * a + 2.0 * b + 7.0 * c + 0.1 * texture(p, 101.0)
}

fn height(p: Point) -> f64 {
    let grain = 0.6 * (-((p.x - 1.0).powi(2) + (p.y - 2.0).powi(2)) / 0.8).exp();
    (1.3 * p.x).sin() * (0.9 * p.y).cos() + grain + 0.05 * texture(p, 7.0)
}

fn phase(p: Point) -> f64 {
    15.0 * (1.3 * p.x).cos() * (0.9 * p.y).cos() + 3.0 * texture(p, 13.0)
}

fn amplitude(p: Point) -> f64 {
    1.0 - 0.2 * height(p).abs() + 0.02 * texture(p, 29.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(kind: InstrumentKind) -> Field {
        Field {
            kind,
            bins: 16,
            pitch: 0.1,
        }
    }

    #[test]
    fn test_samples_are_deterministic() {
        let f = field(InstrumentKind::Afm);
        let p = Point::new(0.3, -1.2);
        assert_eq!(f.sample("Phase", p), f.sample("Phase", p));
        assert_ne!(f.sample("HeightTrace", p), f.sample("HeightRetrace", p));
    }

    #[test]
    fn test_spectrum_width_and_finiteness() {
        let f = field(InstrumentKind::Stem);
        let v = f.sample("Channel_001", Point::new(-4.0, 4.0));
        assert_eq!(v.width(), 16);
        assert!(v.is_finite());
    }

    #[test]
    fn test_unknown_channel_rejected() {
        let f = field(InstrumentKind::Stem);
        let err = f.check_channels(&["Phase".to_string()]).unwrap_err();
        assert_eq!(err.0, INVALID_PARAMS);
        assert_eq!(f.check_channels(&[]).unwrap_err().0, INVALID_PARAMS);
    }

    #[test]
    fn test_modifiers_keep_length() {
        let f = field(InstrumentKind::Afm);
        let path: Vec<Point> = (0..10).map(|i| Point::new(i as f64 * 0.1, 0.0)).collect();
        let channels = vec!["HeightTrace".to_string()];
        let clean = f.scan(&channels, &path, Modification::None);
        for m in [Modification::TipDamage, Modification::FeedbackDegradation] {
            let modified = f.scan(&channels, &path, m);
            assert_eq!(modified.channels["HeightTrace"].len(), 10);
            assert_ne!(modified.channels, clean.channels);
        }
    }

    #[test]
    fn test_lag_starts_at_first_value() {
        let out = lagged([Value::Scalar(1.0), Value::Scalar(2.0)].into_iter());
        assert_eq!(out[0], Value::Scalar(1.0));
        assert_eq!(out[1], Value::Scalar(1.0 + FEEDBACK_GAIN));
    }

    #[tokio::test]
    async fn test_bind_rejects_bad_pitch() {
        let options = SimOptions {
            pitch: 0.0,
            ..SimOptions::default()
        };
        assert!(SimServer::bind("127.0.0.1:0", options).await.is_err());
    }

    #[tokio::test]
    async fn test_handle_unknown_method() {
        let geometry = Geometry::new(
            0.1,
            Extent {
                x_min: 0.0,
                x_max: 1.0,
                y_min: 0.0,
                y_max: 1.0,
            },
        )
        .unwrap();
        let mut peer = PeerState::new(Arc::new(SimOptions::default()), geometry);
        let resp = peer
            .handle(Request::new(3, "calibrate", serde_json::Value::Null))
            .await;
        assert_eq!(resp.error.unwrap().code, METHOD_NOT_FOUND);

        let resp = peer
            .handle(Request::new(
                4,
                "acquire_point",
                serde_json::json!({"channel": "Phase", "x": 0.5, "y": 0.5}),
            ))
            .await;
        assert_eq!(resp.error.unwrap().code, NOT_INITIALIZED);
    }

    #[tokio::test]
    async fn test_closed_connections_are_released() {
        let server = SimServer::bind("127.0.0.1:0", SimOptions::default())
            .await
            .unwrap();
        // Every live connection task holds one more reference to the options.
        let options = Arc::clone(&server.options);
        let mut sim = server.spawn().unwrap();
        for _ in 0..20 {
            let stream = TcpStream::connect(sim.addr()).await.unwrap();
            drop(stream);
        }
        let settled = async {
            while Arc::strong_count(&options) > 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(2), settled)
            .await
            .expect("connection tasks outlived their clients");

        // A fresh client is still served after many short-lived ones.
        let mut stream = BufReader::new(TcpStream::connect(sim.addr()).await.unwrap());
        let ping = serde_json::to_string(&Request::new(1, "ping", serde_json::json!({}))).unwrap();
        stream.get_mut().write_all(format!("{ping}\n").as_bytes()).await.unwrap();
        let mut line = String::new();
        stream.read_line(&mut line).await.unwrap();
        let resp: Response = serde_json::from_str(&line).unwrap();
        assert_eq!(resp.id, Some(1));
        assert!(resp.error.is_none());

        sim.shutdown();
        line.clear();
        let n = tokio::time::timeout(Duration::from_secs(2), stream.read_line(&mut line))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0, "open connection must be closed on shutdown");
        for _ in 0..100 {
            if sim.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(sim.is_finished());
    }
}
