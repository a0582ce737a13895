//! JSON-RPC client for a remote instrument peer.
//!
//! Every call is awaited to completion before the next one is sent, so the
//! link carries at most one request in flight.

use std::io;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use scope_core::{
    Extent, Geometry, InstrumentKind, Point, Reading, ScanDirection, Trace, TrajectoryPlan,
    TrajectoryPlanner, Value,
};

use crate::error::{PeerError, Result};
use crate::wire::{
    FrameParams, InitializeParams, InitializeResult, LineParams, Modification, PathParams,
    PointParams, PointResult, Request, Response, ScanResult,
};

/// What the peer reported when a dataset was opened.
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentHandle {
    pub kind: InstrumentKind,
    pub dataset: String,
    pub geometry: Geometry,
    pub channels: Vec<String>,
    pub info: serde_json::Value,
}

/// Options for a full-frame acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRequest {
    pub channels: Vec<String>,
    pub modification: Modification,
    pub direction: ScanDirection,
    pub trace: Trace,
}

pub struct Connection {
    address: String,
    stream: BufReader<TcpStream>,
    timeout: Duration,
    next_id: u64,
}

impl Connection {
    /// Connect with a bounded timeout and confirm the peer answers `ping`.
    pub async fn connect(address: &str, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| {
                PeerError::Connection(format!("timed out connecting to {address} after {timeout:?}"))
            })?
            .map_err(|e| PeerError::Connection(format!("cannot connect to {address}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| PeerError::Connection(e.to_string()))?;

        let mut conn = Self {
            address: address.to_string(),
            stream: BufReader::new(stream),
            timeout,
            next_id: 1,
        };
        conn.ping().await?;
        info!(address, "connected to instrument peer");
        Ok(conn)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn ping(&mut self) -> Result<()> {
        self.call::<_, serde_json::Value>("ping", &serde_json::json!({}))
            .await
            .map(|_| ())
            .map_err(|e| match e {
                PeerError::Rejected { message, .. } => {
                    PeerError::Connection(format!("ping rejected: {message}"))
                }
                other => other,
            })
    }

    /// Open `dataset` on the peer and validate the geometry it reports.
    pub async fn initialize(&mut self, kind: InstrumentKind, dataset: &str) -> Result<InstrumentHandle> {
        let params = InitializeParams {
            instrument: kind,
            dataset: dataset.to_string(),
        };
        let reply: InitializeResult = self.call("initialize", &params).await.map_err(|e| match e {
            PeerError::Rejected { message, .. } | PeerError::Acquisition(message) => {
                PeerError::Initialization(message)
            }
            other => other,
        })?;

        let geometry = validate_geometry(reply.pitch, reply.extent)?;
        info!(
            %kind,
            dataset,
            pitch = geometry.pitch,
            columns = geometry.columns(),
            rows = geometry.rows(),
            "instrument initialized"
        );
        Ok(InstrumentHandle {
            kind,
            dataset: dataset.to_string(),
            geometry,
            channels: reply.channels,
            info: reply.info,
        })
    }

    pub async fn acquire_point(
        &mut self,
        instrument: &InstrumentHandle,
        position: Point,
        channel: &str,
    ) -> Result<Value> {
        TrajectoryPlanner::point(&instrument.geometry, position)?;
        self.ping().await?;
        let params = PointParams {
            channel: channel.to_string(),
            x: position.x,
            y: position.y,
        };
        let reply: PointResult = self.call("acquire_point", &params).await?;
        if !reply.value.is_finite() {
            return Err(PeerError::Acquisition(format!(
                "non-finite {channel} value at ({}, {})",
                position.x, position.y
            )));
        }
        Ok(reply.value)
    }

    pub async fn acquire_line(
        &mut self,
        instrument: &InstrumentHandle,
        direction: ScanDirection,
        coord: f64,
        channels: &[String],
    ) -> Result<Vec<Reading>> {
        let plan = TrajectoryPlanner::line(&instrument.geometry, direction, coord)?;
        self.ping().await?;
        let params = LineParams {
            direction,
            coord,
            channels: channels.to_vec(),
        };
        let reply: ScanResult = self.call("acquire_line", &params).await?;
        zip_readings(&plan.resolved_path, channels, reply)
    }

    /// The full native grid, flattened in scan order.
    pub async fn acquire_frame(
        &mut self,
        instrument: &InstrumentHandle,
        request: &FrameRequest,
    ) -> Result<Vec<Reading>> {
        let plan = TrajectoryPlanner::frame(&instrument.geometry, request.direction, request.trace);
        self.ping().await?;
        let params = FrameParams {
            channels: request.channels.clone(),
            modification: request.modification,
            direction: request.direction,
            trace: request.trace,
        };
        let reply: ScanResult = self.call("acquire_frame", &params).await?;
        zip_readings(&plan.resolved_path, &request.channels, reply)
    }

    /// Sample every point of an already-resolved path.
    pub async fn acquire_path(
        &mut self,
        instrument: &InstrumentHandle,
        plan: &TrajectoryPlan,
        channels: &[String],
    ) -> Result<Vec<Reading>> {
        if let Some(p) = plan
            .resolved_path
            .iter()
            .find(|p| !instrument.geometry.extent.contains(**p))
        {
            return Err(scope_core::Error::InvalidCoordinate(format!(
                "path point ({}, {}) is outside the instrument extent",
                p.x, p.y
            ))
            .into());
        }
        self.ping().await?;
        let params = PathParams {
            points: plan.resolved_path.iter().map(|&p| p.into()).collect(),
            channels: channels.to_vec(),
        };
        let reply: ScanResult = self.call("acquire_path", &params).await?;
        zip_readings(&plan.resolved_path, channels, reply)
    }

    async fn call<P: Serialize, R: DeserializeOwned>(&mut self, method: &str, params: &P) -> Result<R> {
        let id = self.next_id;
        self.next_id += 1;

        let params =
            serde_json::to_value(params).map_err(|e| PeerError::Acquisition(e.to_string()))?;
        let mut line = serde_json::to_string(&Request::new(id, method, params))
            .map_err(|e| PeerError::Acquisition(e.to_string()))?;
        line.push('\n');
        debug!(method, id, "peer request");

        let buf = match tokio::time::timeout(self.timeout, self.round_trip(&line)).await {
            Ok(Ok(buf)) => buf,
            Ok(Err(e)) => return Err(PeerError::Connection(format!("{}: {e}", self.address))),
            Err(_) => {
                warn!(address = %self.address, timeout = ?self.timeout, method, "peer timed out");
                return Err(PeerError::Timeout(self.timeout));
            }
        };
        if buf.is_empty() {
            warn!(address = %self.address, method, "peer closed the connection");
            return Err(PeerError::Connection(format!(
                "{} closed the connection during {method}",
                self.address
            )));
        }

        let response: Response = serde_json::from_str(buf.trim_end())
            .map_err(|e| PeerError::Connection(format!("unreadable reply to {method}: {e}")))?;
        if response.id != Some(id) {
            return Err(PeerError::Connection(format!(
                "reply id {:?} does not match request {id}",
                response.id
            )));
        }
        if let Some(err) = response.error {
            debug!(method, code = err.code, message = %err.message, "peer rejected request");
            return Err(PeerError::Rejected {
                code: err.code,
                message: err.message,
            });
        }
        let result = response.result.unwrap_or(serde_json::Value::Null);
        serde_json::from_value(result)
            .map_err(|e| PeerError::Acquisition(format!("malformed {method} reply: {e}")))
    }

    /// Write one request line and read one reply line. An empty reply means
    /// the peer closed the stream.
    async fn round_trip(&mut self, line: &str) -> io::Result<String> {
        let writer = self.stream.get_mut();
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;

        let mut buf = String::new();
        self.stream.read_line(&mut buf).await?;
        Ok(buf)
    }
}

fn validate_geometry(pitch: f64, extent: Extent) -> Result<Geometry> {
    Geometry::new(pitch, extent).map_err(|e| {
        PeerError::Initialization(format!("peer reported unusable geometry: {}", e.detail()))
    })
}

/// Pair per-channel value arrays with the positions they were sampled at,
/// position-major, channels in request order.
fn zip_readings(positions: &[Point], channels: &[String], mut reply: ScanResult) -> Result<Vec<Reading>> {
    let mut columns = Vec::with_capacity(channels.len());
    for channel in channels {
        let values = reply
            .channels
            .remove(channel)
            .ok_or_else(|| PeerError::Acquisition(format!("reply is missing channel {channel}")))?;
        if values.len() != positions.len() {
            return Err(PeerError::Acquisition(format!(
                "channel {channel}: expected {} values, got {}",
                positions.len(),
                values.len()
            )));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(PeerError::Acquisition(format!(
                "channel {channel} contains non-finite values"
            )));
        }
        columns.push(values.into_iter());
    }

    let mut readings = Vec::with_capacity(positions.len() * channels.len());
    for &position in positions {
        for (channel, values) in channels.iter().zip(columns.iter_mut()) {
            if let Some(value) = values.next() {
                readings.push(Reading::new(position, channel.as_str(), value));
            }
        }
    }
    Ok(readings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_zip_is_position_major() {
        let positions = [Point::new(0.0, 0.0), Point::new(1.0, 0.0)];
        let channels = vec!["a".to_string(), "b".to_string()];
        let reply = ScanResult {
            channels: BTreeMap::from([
                ("a".to_string(), vec![Value::Scalar(1.0), Value::Scalar(2.0)]),
                ("b".to_string(), vec![Value::Scalar(10.0), Value::Scalar(20.0)]),
            ]),
        };
        let readings = zip_readings(&positions, &channels, reply).unwrap();
        assert_eq!(readings.len(), 4);
        assert_eq!(readings[1].channel, "b");
        assert_eq!(readings[2].position, positions[1]);
        assert_eq!(readings[2].value, Value::Scalar(2.0));
    }

    #[test]
    fn test_zip_rejects_length_mismatch() {
        let positions = [Point::new(0.0, 0.0), Point::new(1.0, 0.0)];
        let reply = ScanResult {
            channels: BTreeMap::from([("a".to_string(), vec![Value::Scalar(1.0)])]),
        };
        let err = zip_readings(&positions, &["a".to_string()], reply).unwrap_err();
        assert!(matches!(err, PeerError::Acquisition(_)));
    }

    #[test]
    fn test_zip_rejects_missing_channel() {
        let err = zip_readings(&[Point::new(0.0, 0.0)], &["x".to_string()], ScanResult::default())
            .unwrap_err();
        assert!(matches!(err, PeerError::Acquisition(_)));
    }

    #[test]
    fn test_validate_geometry() {
        let good = Extent {
            x_min: 0.0,
            x_max: 1.0,
            y_min: 0.0,
            y_max: 1.0,
        };
        assert!(validate_geometry(0.1, good).is_ok());
        assert!(matches!(
            validate_geometry(0.0, good),
            Err(PeerError::Initialization(_))
        ));
        let inverted = Extent { x_min: 1.0, x_max: 0.0, ..good };
        assert!(matches!(
            validate_geometry(0.1, inverted),
            Err(PeerError::Initialization(_))
        ));
        // A pitch far below the extent would describe an unbounded grid.
        let err = validate_geometry(1e-300, good).unwrap_err();
        assert!(matches!(err, PeerError::Initialization(_)), "{err:?}");
        assert_eq!(err.kind(), scope_core::ErrorKind::InitializationError);
    }
}
