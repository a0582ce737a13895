//! Seeded k-means (k-means++ initialisation, Lloyd iterations).
//!
//! Every random draw comes from one `SmallRng` seeded from the config, so
//! identical input and parameters always reproduce identical labels.

use nalgebra::DMatrix;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::SmallRng;

use crate::constants::{DEFAULT_SEED, KMEANS_MAX_ITER, KMEANS_N_INIT, KMEANS_TOLERANCE};
use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct KMeansConfig {
    pub seed: u64,
    pub n_init: usize,
    pub max_iter: usize,
    pub tolerance: f64,
}

impl Default for KMeansConfig {
    fn default() -> Self {
        Self {
            seed: DEFAULT_SEED,
            n_init: KMEANS_N_INIT,
            max_iter: KMEANS_MAX_ITER,
            tolerance: KMEANS_TOLERANCE,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct KMeansFit {
    /// Cluster id per input row. Ids are numbered by first appearance.
    pub labels: Vec<usize>,
    pub centroids: Vec<Vec<f64>>,
    pub inertia: f64,
    pub iterations: usize,
}

impl KMeansFit {
    pub fn cluster_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.centroids.len()];
        for &l in &self.labels {
            sizes[l] += 1;
        }
        sizes
    }
}

/// Partition the rows of `data` into `k` clusters.
pub fn fit(data: &DMatrix<f64>, k: usize, config: &KMeansConfig) -> Result<KMeansFit> {
    if k == 0 {
        return Err(Error::InvalidParameter(
            "n_clusters must be at least 1".to_string(),
        ));
    }
    let rows = data.nrows();
    if rows < k {
        return Err(Error::InsufficientSamples(format!(
            "n_clusters={k} exceeds the {rows} available sample rows"
        )));
    }

    let points: Vec<Vec<f64>> = (0..rows)
        .map(|i| data.row(i).iter().copied().collect())
        .collect();

    let mut rng = SmallRng::seed_from_u64(config.seed);
    let initial = plus_plus_init(&points, k, &mut rng);
    let mut best = lloyd(&points, initial, config);
    for _ in 1..config.n_init {
        let initial = plus_plus_init(&points, k, &mut rng);
        let run = lloyd(&points, initial, config);
        if run.inertia < best.inertia {
            best = run;
        }
    }

    Ok(canonicalize(best))
}

fn sq_dist(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum()
}

/// Index and squared distance of the nearest centroid; ties go to the lower index.
fn nearest(point: &[f64], centroids: &[Vec<f64>]) -> (usize, f64) {
    let mut best = (0, f64::INFINITY);
    for (i, c) in centroids.iter().enumerate() {
        let d = sq_dist(point, c);
        if d < best.1 {
            best = (i, d);
        }
    }
    best
}

/// k-means++: first centre uniform, the rest weighted by squared distance
/// to the nearest chosen centre.
fn plus_plus_init(points: &[Vec<f64>], k: usize, rng: &mut SmallRng) -> Vec<Vec<f64>> {
    let n = points.len();
    let mut centroids = Vec::with_capacity(k);
    centroids.push(points[rng.random_range(0..n)].clone());

    let mut dist: Vec<f64> = points.iter().map(|p| sq_dist(p, &centroids[0])).collect();
    while centroids.len() < k {
        let total: f64 = dist.iter().sum();
        let chosen = if total <= 0.0 {
            // All remaining points coincide with a centre.
            rng.random_range(0..n)
        } else {
            let mut target = rng.random::<f64>() * total;
            let mut pick = n - 1;
            for (i, d) in dist.iter().enumerate() {
                if target < *d {
                    pick = i;
                    break;
                }
                target -= d;
            }
            pick
        };
        centroids.push(points[chosen].clone());
        let latest = &centroids[centroids.len() - 1];
        for (d, p) in dist.iter_mut().zip(points) {
            *d = d.min(sq_dist(p, latest));
        }
    }
    centroids
}

fn lloyd(points: &[Vec<f64>], mut centroids: Vec<Vec<f64>>, config: &KMeansConfig) -> KMeansFit {
    let k = centroids.len();
    let dim = points.first().map_or(0, |p| p.len());
    let mut labels = vec![0; points.len()];
    let mut iterations = 0;

    for _ in 0..config.max_iter.max(1) {
        iterations += 1;
        for (label, p) in labels.iter_mut().zip(points) {
            *label = nearest(p, &centroids).0;
        }

        let mut sums = vec![vec![0.0; dim]; k];
        let mut counts = vec![0usize; k];
        for (&label, p) in labels.iter().zip(points) {
            counts[label] += 1;
            for (s, v) in sums[label].iter_mut().zip(p) {
                *s += v;
            }
        }

        let mut updated: Vec<Vec<f64>> = sums
            .into_iter()
            .zip(&counts)
            .map(|(s, &c)| {
                if c == 0 {
                    s
                } else {
                    s.into_iter().map(|v| v / c as f64).collect()
                }
            })
            .collect();

        // Re-seed empty clusters with the point farthest from its centre.
        for cluster in 0..k {
            if counts[cluster] > 0 {
                continue;
            }
            let far = points
                .iter()
                .enumerate()
                .map(|(i, p)| (i, sq_dist(p, &centroids[labels[i]])))
                .fold((0, f64::NEG_INFINITY), |best, cur| {
                    if cur.1 > best.1 { cur } else { best }
                })
                .0;
            updated[cluster] = points[far].clone();
            counts[labels[far]] = counts[labels[far]].saturating_sub(1);
            labels[far] = cluster;
            counts[cluster] = 1;
        }

        let shift: f64 = centroids
            .iter()
            .zip(&updated)
            .map(|(a, b)| sq_dist(a, b))
            .sum();
        centroids = updated;
        if shift <= config.tolerance {
            break;
        }
    }

    let mut inertia = 0.0;
    for (label, p) in labels.iter_mut().zip(points) {
        let (l, d) = nearest(p, &centroids);
        *label = l;
        inertia += d;
    }

    KMeansFit {
        labels,
        centroids,
        inertia,
        iterations,
    }
}

/// Renumber clusters by first appearance in row order.
fn canonicalize(fit: KMeansFit) -> KMeansFit {
    let k = fit.centroids.len();
    let mut mapping: Vec<Option<usize>> = vec![None; k];
    let mut next = 0;
    for &l in &fit.labels {
        if mapping[l].is_none() {
            mapping[l] = Some(next);
            next += 1;
        }
    }
    // Clusters that ended up empty keep trailing ids.
    for slot in mapping.iter_mut() {
        if slot.is_none() {
            *slot = Some(next);
            next += 1;
        }
    }
    let mapping: Vec<usize> = mapping.into_iter().map(|m| m.unwrap_or_default()).collect();

    let mut centroids = vec![Vec::new(); k];
    for (old, c) in fit.centroids.into_iter().enumerate() {
        centroids[mapping[old]] = c;
    }
    KMeansFit {
        labels: fit.labels.iter().map(|&l| mapping[l]).collect(),
        centroids,
        inertia: fit.inertia,
        iterations: fit.iterations,
    }
}
