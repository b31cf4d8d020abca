//! Resolve a run file and compute every band of its target node.

use anyhow::{Context, Result};
use raster_common::{BandId, Tile};
use serde::Serialize;
use std::time::Instant;
use tile_engine::{resolve, EngineConfig, SchedulerStats, TileScheduler};
use tracing::info;

use crate::config::RunFile;
use crate::sources::build_sources;

/// Value statistics of one computed band.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BandSummary {
    pub band: BandId,
    pub width: usize,
    pub height: usize,
    /// Samples that are not no-data.
    pub valid: usize,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
}

impl BandSummary {
    pub fn of(tile: &Tile) -> Self {
        let mut valid = 0usize;
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;

        for offset in 0..tile.len() {
            let value = tile.sample_at(offset);
            if tile.is_no_data(value) {
                continue;
            }
            valid += 1;
            sum += value;
            min = min.min(value);
            max = max.max(value);
        }

        let has_values = valid > 0;
        Self {
            band: tile.band().clone(),
            width: tile.rect().width,
            height: tile.rect().height,
            valid,
            min: has_values.then_some(min),
            max: has_values.then_some(max),
            mean: has_values.then(|| sum / valid as f64),
        }
    }
}

/// Session counters reported at the end of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunStats {
    pub requests: u64,
    pub kernel_invocations: u64,
    pub external_reads: u64,
    pub coalesced_requests: u64,
    pub failures: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_entries: usize,
    pub cache_bytes: usize,
    pub cache_evictions: u64,
}

impl From<SchedulerStats> for RunStats {
    fn from(stats: SchedulerStats) -> Self {
        Self {
            requests: stats.requests,
            kernel_invocations: stats.kernel_invocations,
            external_reads: stats.external_reads,
            coalesced_requests: stats.coalesced_requests,
            failures: stats.failures,
            cache_hits: stats.cache.hits,
            cache_misses: stats.cache.misses,
            cache_entries: stats.cache.entries,
            cache_bytes: stats.cache.memory_bytes as usize,
            cache_evictions: stats.cache.evictions,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub session_id: String,
    pub target: String,
    pub order: Vec<String>,
    pub bands: Vec<BandSummary>,
    pub stats: RunStats,
    pub elapsed_ms: u128,
}

/// A resolved run, ready to compute.
pub struct Runner {
    scheduler: TileScheduler,
}

impl Runner {
    /// Validate the configuration, build the synthetic sources and resolve the
    /// graph up to `target` (the run file's target when `None`).
    pub fn new(run: &RunFile, target: Option<&str>, config: EngineConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid engine configuration: {e}"))?;

        let target = target.unwrap_or(&run.target);
        let externals = build_sources(&run.sources)?;
        let registry = raster_ops::registry()?;
        let graph = resolve(&run.graph, target, &registry, &externals)
            .with_context(|| format!("Failed to resolve graph for target '{target}'"))?;

        Ok(Self {
            scheduler: TileScheduler::new(graph, config),
        })
    }

    pub fn scheduler(&self) -> &TileScheduler {
        &self.scheduler
    }

    /// Compute every target band tile by tile.
    pub async fn run(&self) -> Result<RunSummary> {
        let started = Instant::now();
        let graph = self.scheduler.graph();

        let mut bands = Vec::new();
        for band in graph.target_bands() {
            let tile = self
                .scheduler
                .compute_band(&band)
                .await
                .with_context(|| format!("Failed to compute band {band}"))?;
            let summary = BandSummary::of(&tile);
            info!(
                band = %summary.band,
                width = summary.width,
                height = summary.height,
                valid = summary.valid,
                min = ?summary.min,
                max = ?summary.max,
                mean = ?summary.mean,
                "Band complete"
            );
            bands.push(summary);
        }

        self.scheduler.log_stats().await;

        Ok(RunSummary {
            session_id: self.scheduler.session_id().to_string(),
            target: graph.target().to_string(),
            order: graph.order().into_iter().map(String::from).collect(),
            bands,
            stats: self.scheduler.stats().await.into(),
            elapsed_ms: started.elapsed().as_millis(),
        })
    }
}
