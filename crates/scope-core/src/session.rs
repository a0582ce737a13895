//! Volatile acquisition state for one orchestrator session.
//!
//! Samples are only ever appended (`record`) or cleared wholesale (`reset`).
//! Each reset bumps the epoch; samples stamped with an older epoch are stale
//! and never reach the feature matrix.

use std::collections::{BTreeMap, HashMap};

use nalgebra::DMatrix;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::geometry::Point;
use crate::instrument::{ConnectionState, InstrumentKind};
use crate::pipeline::PipelineResult;
use crate::sample::{Reading, Sample, Value};
use crate::trajectory::PlanSummary;

/// Which channels a feature matrix draws from.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum ChannelFilter {
    #[default]
    All,
    Only(Vec<String>),
}

impl ChannelFilter {
    /// `None` or an empty list means every channel.
    pub fn from_option(channels: Option<Vec<String>>) -> Self {
        match channels {
            Some(list) if !list.is_empty() => ChannelFilter::Only(list),
            _ => ChannelFilter::All,
        }
    }

    pub fn matches(&self, channel: &str) -> bool {
        match self {
            ChannelFilter::All => true,
            ChannelFilter::Only(list) => list.iter().any(|c| c == channel),
        }
    }
}

/// Column block contributed by one channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChannelColumns {
    pub channel: String,
    pub width: usize,
}

/// Dense table built from the current epoch's samples.
/// Rows are sites in insertion order; columns are channel blocks.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureMatrix {
    pub channels: Vec<ChannelColumns>,
    pub sites: Vec<usize>,
    pub positions: Vec<Point>,
    pub data: DMatrix<f64>,
}

impl FeatureMatrix {
    pub fn empty() -> Self {
        Self {
            channels: Vec::new(),
            sites: Vec::new(),
            positions: Vec::new(),
            data: DMatrix::zeros(0, 0),
        }
    }

    pub fn nrows(&self) -> usize {
        self.data.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.data.ncols()
    }

    pub fn is_empty(&self) -> bool {
        self.data.nrows() == 0
    }
}

#[derive(Debug, Default)]
pub struct Session {
    epoch: u64,
    instrument_kind: Option<InstrumentKind>,
    dataset: Option<String>,
    connection_state: ConnectionState,
    samples: Vec<Sample>,
    next_site: usize,
    pipeline: Option<PipelineResult>,
    last_plan: Option<PlanSummary>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn instrument_kind(&self) -> Option<InstrumentKind> {
        self.instrument_kind
    }

    pub fn dataset(&self) -> Option<&str> {
        self.dataset.as_deref()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn set_connection_state(&mut self, state: ConnectionState) {
        self.connection_state = state;
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Samples of the current epoch, in insertion order.
    pub fn current_samples(&self) -> impl Iterator<Item = &Sample> {
        let epoch = self.epoch;
        self.samples.iter().filter(move |s| s.epoch() == epoch)
    }

    pub fn pipeline_result(&self) -> Option<&PipelineResult> {
        self.pipeline.as_ref()
    }

    pub fn last_plan(&self) -> Option<&PlanSummary> {
        self.last_plan.as_ref()
    }

    /// Bind the session to an instrument and dataset after a successful
    /// initialize. Switching to a different instrument or dataset starts a
    /// new epoch, since old samples no longer share a feature space.
    /// Returns true if that reset happened.
    pub fn attach(&mut self, kind: InstrumentKind, dataset: &str) -> bool {
        let switched = self.instrument_kind.is_some_and(|k| k != kind)
            || self.dataset.as_deref().is_some_and(|d| d != dataset);
        if switched {
            self.reset();
        }
        self.instrument_kind = Some(kind);
        self.dataset = Some(dataset.to_string());
        self.connection_state = ConnectionState::Connected;
        switched
    }

    /// Append a batch of readings, stamped with the current epoch.
    ///
    /// Consecutive readings at one position form a site (one feature row);
    /// a repeated channel at the same position starts a new site.
    pub fn record(&mut self, readings: Vec<Reading>) -> Result<usize> {
        if !self.connection_state.is_ready() {
            return Err(Error::SessionNotReady(format!(
                "cannot record samples while {}",
                self.connection_state
            )));
        }
        let count = readings.len();
        let mut current: Option<(Point, Vec<String>)> = None;

        for reading in readings {
            let same_site = match &current {
                Some((pos, channels)) => {
                    *pos == reading.position && !channels.iter().any(|c| *c == reading.channel)
                }
                None => false,
            };
            if !same_site {
                if current.is_some() {
                    self.next_site += 1;
                }
                current = Some((reading.position, Vec::new()));
            }
            if let Some((_, channels)) = current.as_mut() {
                channels.push(reading.channel.clone());
            }
            self.samples
                .push(Sample::stamp(reading, self.next_site, self.epoch));
        }
        if current.is_some() {
            self.next_site += 1;
        }
        Ok(count)
    }

    /// Remember the plan of the latest scan for reporting.
    pub fn note_plan(&mut self, plan: PlanSummary) {
        self.last_plan = Some(plan);
    }

    /// Swap in a freshly computed pipeline result; the old one is dropped.
    pub fn replace_pipeline(&mut self, result: PipelineResult) -> &PipelineResult {
        self.pipeline.insert(result)
    }

    /// Clear samples and analysis, start a new epoch. Returns the new epoch.
    pub fn reset(&mut self) -> u64 {
        self.samples.clear();
        self.next_site = 0;
        self.pipeline = None;
        self.last_plan = None;
        self.epoch += 1;
        self.epoch
    }

    /// Per-channel sample counts for the current epoch.
    pub fn channel_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for s in self.current_samples() {
            *counts.entry(s.channel().to_string()).or_insert(0) += 1;
        }
        counts
    }

    /// Number of distinct sites in the current epoch.
    pub fn site_count(&self) -> usize {
        let mut last = None;
        let mut count = 0;
        for s in self.current_samples() {
            if last != Some(s.site()) {
                count += 1;
                last = Some(s.site());
            }
        }
        count
    }

    /// Build the dense feature table for `filter` from non-stale samples.
    pub fn current_feature_matrix(&self, filter: &ChannelFilter) -> Result<FeatureMatrix> {
        let mut channels: Vec<ChannelColumns> = Vec::new();
        let mut sites: Vec<usize> = Vec::new();
        let mut positions: Vec<Point> = Vec::new();
        let mut cells: Vec<HashMap<&str, &Value>> = Vec::new();
        let mut row_of_site: HashMap<usize, usize> = HashMap::new();

        for s in self.current_samples().filter(|s| filter.matches(s.channel())) {
            let width = s.value().width();
            match channels.iter().find(|c| c.channel == s.channel()) {
                Some(c) if c.width != width => {
                    return Err(Error::InconsistentDimensionality(format!(
                        "channel '{}' has values of length {} and {}",
                        c.channel, c.width, width
                    )));
                }
                Some(_) => {}
                None => channels.push(ChannelColumns {
                    channel: s.channel().to_string(),
                    width,
                }),
            }

            let row = *row_of_site.entry(s.site()).or_insert_with(|| {
                sites.push(s.site());
                positions.push(s.position());
                cells.push(HashMap::new());
                cells.len() - 1
            });
            cells[row].insert(s.channel(), s.value());
        }

        if sites.is_empty() {
            return Ok(FeatureMatrix::empty());
        }

        let ncols: usize = channels.iter().map(|c| c.width).sum();
        let mut data = DMatrix::<f64>::zeros(sites.len(), ncols);
        for (row, row_cells) in cells.iter().enumerate() {
            let mut col = 0;
            for c in &channels {
                let Some(value) = row_cells.get(c.channel.as_str()) else {
                    let p = positions[row];
                    return Err(Error::InconsistentDimensionality(format!(
                        "site {} at ({}, {}) has no '{}' value",
                        sites[row], p.x, p.y, c.channel
                    )));
                };
                for (offset, v) in value.as_slice().iter().enumerate() {
                    data[(row, col + offset)] = *v;
                }
                col += c.width;
            }
        }

        Ok(FeatureMatrix {
            channels,
            sites,
            positions,
            data,
        })
    }
}
