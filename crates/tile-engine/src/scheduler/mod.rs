//! Tile scheduler: lazy, cached and coalesced tile computation over a
//! resolved graph.
//!
//! A request for `(band, rect)` is served from the cache when possible.
//! Otherwise the producer of the band is looked up: external bands are read
//! from their source, node bands recursively gather their source tiles over
//! the margin-expanded rectangle and run the operator kernel on the blocking
//! pool. Results are cached before the in-flight entry is released.

pub mod coalesce;

pub use coalesce::{CoalescerStats, Registration, RequestCoalescer};

use futures::future::{try_join_all, BoxFuture, FutureExt};
use futures::stream::{self, StreamExt, TryStreamExt};
use raster_common::{BandDescriptor, BandId, Rect, Tile};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CacheStats, TileCache, TileKey};
use crate::config::EngineConfig;
use crate::error::{OperatorError, TileError, TileResult};
use crate::operator::{ComputeContext, InvocationRecorder, SourceTiles};
use crate::resolver::{Producer, ResolvedGraph, ResolvedNode};
use crate::source::ExternalSource;

/// Result shared by every request coalesced onto one computation: all tiles
/// produced by it (several for stack operators).
type FlightResult = TileResult<Arc<Vec<Tile>>>;

/// Counters for one scheduler session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulerStats {
    pub cache: CacheStats,
    pub requests: u64,
    pub kernel_invocations: u64,
    pub external_reads: u64,
    pub coalesced_requests: u64,
    pub failures: u64,
}

/// Handle to a tile scheduling session. Cloning is cheap and shares the
/// session's cache, in-flight map and counters.
#[derive(Clone)]
pub struct TileScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    session_id: Uuid,
    graph: Arc<ResolvedGraph>,
    config: EngineConfig,
    cache: Mutex<TileCache>,
    coalescer: RequestCoalescer<TileKey, FlightResult>,
    cancel: CancellationToken,
    recorder: Option<Arc<dyn InvocationRecorder>>,
    requests: AtomicU64,
    kernel_invocations: AtomicU64,
    external_reads: AtomicU64,
    failures: AtomicU64,
}

/// Builder for [`TileScheduler`].
pub struct SchedulerBuilder {
    graph: ResolvedGraph,
    config: EngineConfig,
    cancel: Option<CancellationToken>,
    recorder: Option<Arc<dyn InvocationRecorder>>,
}

impl SchedulerBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Use an externally owned cancellation token for the session.
    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Inject a recorder that operators report their calls to.
    pub fn recorder(mut self, recorder: Arc<dyn InvocationRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn build(self) -> TileScheduler {
        let session_id = Uuid::new_v4();
        info!(
            session_id = %session_id,
            target_node = %self.graph.target(),
            cache_mb = self.config.tile_cache_size_mb,
            tile_width = self.config.tile_width,
            tile_height = self.config.tile_height,
            max_concurrent_tiles = self.config.max_concurrent_tiles,
            "Starting tile session"
        );

        TileScheduler {
            inner: Arc::new(Inner {
                session_id,
                cache: Mutex::new(TileCache::new(self.config.tile_cache_size_bytes())),
                graph: Arc::new(self.graph),
                config: self.config,
                coalescer: RequestCoalescer::new(),
                cancel: self.cancel.unwrap_or_else(CancellationToken::new),
                recorder: self.recorder,
                requests: AtomicU64::new(0),
                kernel_invocations: AtomicU64::new(0),
                external_reads: AtomicU64::new(0),
                failures: AtomicU64::new(0),
            }),
        }
    }
}

impl TileScheduler {
    pub fn new(graph: ResolvedGraph, config: EngineConfig) -> Self {
        Self::builder(graph).config(config).build()
    }

    pub fn builder(graph: ResolvedGraph) -> SchedulerBuilder {
        SchedulerBuilder {
            graph,
            config: EngineConfig::default(),
            cancel: None,
            recorder: None,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.inner.session_id
    }

    pub fn graph(&self) -> &ResolvedGraph {
        &self.inner.graph
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Cancel the session. Running and future computations fail with
    /// `Cancelled`; tiles already cached stay available.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Get the tile of `band` covering exactly `rect`.
    pub fn get_tile(&self, band: &BandId, rect: Rect) -> BoxFuture<'static, TileResult<Tile>> {
        let this = self.clone();
        let band = band.clone();
        async move { this.fetch(band, rect).await }.boxed()
    }

    /// Compute a whole band tile by tile and mosaic the result.
    pub async fn compute_band(&self, band: &BandId) -> TileResult<Tile> {
        let producer = self
            .inner
            .graph
            .producer(band)
            .cloned()
            .ok_or_else(|| TileError::invalid_request(band, Rect::default(), "unknown band"))?;
        let raster = producer.raster();
        let descriptor = producer.band_descriptor().clone();
        let config = &self.inner.config;

        let grid = Rect::tile_grid(raster.width(), raster.height(), config.tile_width, config.tile_height);
        let tile_count = grid.len();

        let tiles: Vec<Tile> = stream::iter(grid)
            .map(|rect| self.get_tile(band, rect))
            .buffer_unordered(config.max_concurrent_tiles.max(1))
            .try_collect()
            .await?;

        let mosaic = Tile::mosaic(
            band.clone(),
            raster.bounds(),
            descriptor.data_type(),
            descriptor.no_data_value(),
            &tiles,
        )
        .map_err(|e| TileError::internal(format!("mosaic of {band} failed: {e}")))?;

        info!(
            session_id = %self.inner.session_id,
            band = %band,
            tiles = tile_count,
            width = raster.width(),
            height = raster.height(),
            "Computed band"
        );

        Ok(mosaic)
    }

    /// Snapshot of session statistics.
    pub async fn stats(&self) -> SchedulerStats {
        let cache = self.inner.cache.lock().await.stats();
        let coalescer = self.inner.coalescer.stats().await;
        SchedulerStats {
            cache,
            requests: self.inner.requests.load(Ordering::Relaxed),
            kernel_invocations: self.inner.kernel_invocations.load(Ordering::Relaxed),
            external_reads: self.inner.external_reads.load(Ordering::Relaxed),
            coalesced_requests: coalescer.coalesced_requests,
            failures: self.inner.failures.load(Ordering::Relaxed),
        }
    }

    /// Logs current statistics.
    pub async fn log_stats(&self) {
        let stats = self.stats().await;
        info!(
            session_id = %self.inner.session_id,
            requests = stats.requests,
            cache_hits = stats.cache.hits,
            cache_misses = stats.cache.misses,
            cache_entries = stats.cache.entries,
            cache_bytes = stats.cache.memory_bytes,
            evictions = stats.cache.evictions,
            hit_rate = format!("{:.1}%", stats.cache.hit_rate() * 100.0),
            kernel_invocations = stats.kernel_invocations,
            external_reads = stats.external_reads,
            coalesced = stats.coalesced_requests,
            failures = stats.failures,
            "Tile session statistics"
        );
    }

    async fn fetch(&self, band: BandId, rect: Rect) -> TileResult<Tile> {
        self.inner.requests.fetch_add(1, Ordering::Relaxed);

        let producer = self
            .inner
            .graph
            .producer(&band)
            .cloned()
            .ok_or_else(|| TileError::invalid_request(&band, rect, "unknown band"))?;
        if rect.is_empty() {
            return Err(TileError::invalid_request(&band, rect, "zero-area rectangle"));
        }
        let bounds = producer.raster().bounds();
        if !bounds.contains_rect(&rect) {
            return Err(TileError::invalid_request(
                &band,
                rect,
                format!("outside raster bounds {bounds}"),
            ));
        }

        let key = TileKey::new(band.clone(), rect);
        if let Some(tile) = self.inner.cache.lock().await.get(&key) {
            metrics::counter!("tile_cache_hits_total").increment(1);
            return Ok(tile);
        }
        metrics::counter!("tile_cache_misses_total").increment(1);

        let flight_bands = flight_bands(&producer, &band);
        let flight_key = TileKey::new(flight_bands[0].clone(), rect);

        match self.inner.coalescer.register(&flight_key).await {
            Registration::Waiter(mut rx) => {
                metrics::counter!("tile_requests_coalesced_total").increment(1);
                let tiles = rx.recv().await.map_err(|e| {
                    TileError::internal(format!("in-flight computation of {band} {rect} was lost: {e}"))
                })??;
                pick(&tiles, &band)
            }
            Registration::Leader => {
                // Spawned before any further await: once registered, the flight
                // is completed by its task even if this caller is dropped.
                let this = self.clone();
                let task_key = flight_key.clone();
                let handle = tokio::spawn(async move {
                    let result = this.lead_flight(producer, &flight_bands, rect).await;
                    if let Err(err) = &result {
                        this.inner.failures.fetch_add(1, Ordering::Relaxed);
                        if !err.is_cancelled() {
                            warn!(band = %task_key.band, rect = %rect, error = %err, "Tile computation failed");
                        }
                    }
                    this.inner.coalescer.complete(&task_key, result.clone()).await;
                    result
                });

                let tiles = handle
                    .await
                    .map_err(|e| TileError::internal(format!("tile task for {band} {rect} failed: {e}")))??;
                pick(&tiles, &band)
            }
        }
    }

    async fn lead_flight(&self, producer: Producer, bands: &[BandId], rect: Rect) -> FlightResult {
        // A previous leader may have finished since the first lookup.
        if let Some(tiles) = self.cached_flight(bands, rect).await {
            return Ok(Arc::new(tiles));
        }

        debug!(
            session_id = %self.inner.session_id,
            band = %bands[0],
            rect = %rect,
            "Cache miss, scheduling computation"
        );
        self.run_flight(producer, rect).await
    }

    /// All tiles of a flight, if every one of them is cached.
    async fn cached_flight(&self, bands: &[BandId], rect: Rect) -> Option<Vec<Tile>> {
        let cache = self.inner.cache.lock().await;
        bands
            .iter()
            .map(|band| cache.peek(&TileKey::new(band.clone(), rect)).cloned())
            .collect()
    }

    async fn run_flight(&self, producer: Producer, rect: Rect) -> FlightResult {
        let tiles = match producer {
            Producer::External { source, descriptor } => {
                vec![self.read_external(source, descriptor, rect).await?]
            }
            Producer::Node { node, band } => self.compute_node(node, band, rect).await?,
        };

        let mut cache = self.inner.cache.lock().await;
        for tile in &tiles {
            cache.insert(TileKey::new(tile.band().clone(), tile.rect()), tile.clone());
        }
        drop(cache);

        Ok(Arc::new(tiles))
    }

    async fn read_external(
        &self,
        source: Arc<dyn ExternalSource>,
        descriptor: BandDescriptor,
        rect: Rect,
    ) -> TileResult<Tile> {
        let band = descriptor.id();
        if self.inner.cancel.is_cancelled() {
            return Err(TileError::Cancelled { band, rect });
        }

        let source_error = |message: String| TileError::Source {
            external: descriptor.product().to_string(),
            band: band.clone(),
            rect,
            message,
        };

        let tile = source
            .read_tile(descriptor.name(), rect)
            .await
            .map_err(|e| source_error(e.to_string()))?;
        self.inner.external_reads.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("tile_external_reads_total").increment(1);

        validate_output(&tile, &descriptor, rect).map_err(source_error)?;
        Ok(tile)
    }

    async fn compute_node(&self, node: Arc<ResolvedNode>, band: usize, rect: Rect) -> TileResult<Vec<Tile>> {
        let targets: Vec<BandDescriptor> = if node.stack {
            node.bands.iter().map(|b| b.descriptor.clone()).collect()
        } else {
            vec![node.bands[band].descriptor.clone()]
        };
        let primary = targets[0].id();
        let cancelled = || TileError::Cancelled {
            band: primary.clone(),
            rect,
        };

        if self.inner.cancel.is_cancelled() {
            return Err(cancelled());
        }

        let raster = &node.descriptor;
        let expanded = rect.expand_clipped(node.margin, raster.width(), raster.height());

        let mut source_bands: Vec<&BandId> = Vec::new();
        for target in &targets {
            let declared = node
                .band(target.name())
                .map(|b| b.sources.as_slice())
                .unwrap_or_default();
            for source in declared {
                if !source_bands.contains(&source) {
                    source_bands.push(source);
                }
            }
        }

        let mut requests = Vec::with_capacity(source_bands.len());
        for source in source_bands {
            let producer = self
                .inner
                .graph
                .producer(source)
                .ok_or_else(|| TileError::internal(format!("no producer for source band {source}")))?;
            let source_raster = producer.raster();
            // Sources smaller than the output may not cover the rectangle at all.
            if let Some(source_rect) = expanded.clip_to(source_raster.width(), source_raster.height()) {
                requests.push(self.get_tile(source, source_rect));
            }
        }

        debug!(
            node = %node.id,
            band = %primary,
            rect = %rect,
            expanded = %expanded,
            sources = requests.len(),
            "Gathering source tiles"
        );

        let gathered = try_join_all(requests).await?;

        if self.inner.cancel.is_cancelled() {
            return Err(cancelled());
        }

        let sources = SourceTiles::new(gathered);
        let ctx = ComputeContext::new(node.id.clone(), self.inner.cancel.clone())
            .with_recorder(self.inner.recorder.clone());
        let operator = Arc::clone(&node.operator);
        let stack = node.stack;
        let kernel_targets = targets.clone();

        self.inner.kernel_invocations.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("tile_kernel_invocations_total").increment(1);

        let computation_error = |message: String| TileError::Computation {
            operator: node.operator_type.clone(),
            band: primary.clone(),
            rect,
            message,
        };

        let outcome = tokio::task::spawn_blocking(move || {
            if stack {
                operator.compute_tile_stack(&kernel_targets, rect, &sources, &ctx)
            } else {
                operator
                    .compute_tile(&kernel_targets[0], rect, &sources, &ctx)
                    .map(|tile| vec![tile])
            }
        })
        .await
        .map_err(|e| computation_error(format!("kernel task failed: {e}")))?;

        let tiles = outcome.map_err(|err| match err {
            OperatorError::Cancelled => cancelled(),
            other => computation_error(other.to_string()),
        })?;

        if tiles.len() != targets.len() {
            return Err(computation_error(format!(
                "kernel returned {} tiles for {} bands",
                tiles.len(),
                targets.len()
            )));
        }
        for (tile, target) in tiles.iter().zip(&targets) {
            validate_output(tile, target, rect).map_err(computation_error)?;
        }

        Ok(tiles)
    }
}

/// Bands produced together with `band`; the first one keys the flight.
fn flight_bands(producer: &Producer, band: &BandId) -> Vec<BandId> {
    match producer {
        Producer::Node { node, .. } if node.stack => node.band_ids(),
        _ => vec![band.clone()],
    }
}

fn pick(tiles: &[Tile], band: &BandId) -> TileResult<Tile> {
    tiles
        .iter()
        .find(|tile| tile.band() == band)
        .cloned()
        .ok_or_else(|| TileError::internal(format!("computation did not produce {band}")))
}

fn validate_output(tile: &Tile, expected: &BandDescriptor, rect: Rect) -> Result<(), String> {
    let band = expected.id();
    if tile.band() != &band {
        return Err(format!("returned band {} instead of {band}", tile.band()));
    }
    if tile.rect() != rect {
        return Err(format!("returned rectangle {} instead of {rect}", tile.rect()));
    }
    if tile.data_type() != expected.data_type() {
        return Err(format!(
            "returned {} samples instead of {}",
            tile.data_type(),
            expected.data_type()
        ));
    }
    if tile.len() != rect.area() {
        return Err(format!("returned {} samples for {} pixels", tile.len(), rect.area()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphSpec, NodeSpec};
    use crate::operator::{InitContext, Operator, OutputDescriptor, SourceTileProvider};
    use crate::params::Parameters;
    use crate::registry::{OperatorDescriptor, OperatorRegistry};
    use crate::resolver::resolve;
    use crate::source::{ExternalSources, MemorySource};
    use crate::OperatorResult;
    use raster_common::{DataType, RasterDescriptor};
    use std::time::Duration;

    /// Copies its single source band.
    struct CopyOp;

    impl Operator for CopyOp {
        fn initialize(&mut self, ctx: &InitContext<'_>) -> OperatorResult<OutputDescriptor> {
            let source = ctx.require_source("source")?;
            let mut output = OutputDescriptor::like(source, "copy");
            for band in source.bands() {
                output = output.band(BandDescriptor::new(band.name(), band.data_type()), vec![band.id()]);
            }
            Ok(output)
        }

        fn compute_tile(
            &self,
            target: &BandDescriptor,
            rect: Rect,
            sources: &dyn SourceTileProvider,
            _ctx: &ComputeContext,
        ) -> OperatorResult<Tile> {
            let source = sources.source_tile(&BandId::new("input", target.name()), rect)?;
            Ok(Tile::from_f64(target.id(), rect, target.data_type(), 0.0, &source.to_f64_vec())?)
        }
    }

    fn copy_scheduler() -> TileScheduler {
        let descriptor = RasterDescriptor::builder("input", "GRD", 4, 4)
            .band(BandDescriptor::new("B1", DataType::Float32))
            .build()
            .unwrap();
        let samples: Vec<f64> = (0..16).map(f64::from).collect();
        let source = MemorySource::new(descriptor).with_band("B1", &samples).unwrap();
        let externals = ExternalSources::new().with(Arc::new(source));

        let mut registry = OperatorRegistry::new();
        registry
            .register(
                OperatorDescriptor::new("copy", |_: &Parameters| Ok(Box::new(CopyOp) as Box<dyn Operator>))
                    .with_source("source"),
            )
            .unwrap();

        let graph = GraphSpec::new().node(NodeSpec::new("c", "copy").with_external_source("source", "input"));
        TileScheduler::new(resolve(&graph, "c", &registry, &externals).unwrap(), EngineConfig::default())
    }

    fn tile(band: &BandId, rect: Rect, data_type: DataType) -> Tile {
        Tile::filled(band.clone(), rect, data_type, 0.0, 1.0).unwrap()
    }

    #[test]
    fn test_validate_output() {
        let expected = BandDescriptor::new("B1", DataType::Float32);
        let band = expected.id();
        let rect = Rect::new(0, 0, 2, 2);

        assert!(validate_output(&tile(&band, rect, DataType::Float32), &expected, rect).is_ok());
        assert!(validate_output(&tile(&band, rect, DataType::UInt8), &expected, rect).is_err());
        assert!(validate_output(&tile(&band, Rect::new(0, 0, 2, 1), DataType::Float32), &expected, rect).is_err());
        assert!(validate_output(&tile(&BandId::new("x", "B1"), rect, DataType::Float32), &expected, rect).is_err());
    }

    #[test]
    fn test_pick_finds_sibling() {
        let rect = Rect::new(0, 0, 1, 1);
        let a = BandId::new("n", "A");
        let b = BandId::new("n", "B");
        let tiles = vec![tile(&a, rect, DataType::UInt8), tile(&b, rect, DataType::UInt8)];

        assert_eq!(pick(&tiles, &b).unwrap().band(), &b);
        assert!(matches!(pick(&tiles, &BandId::new("n", "C")), Err(TileError::Internal(_))));
    }

    #[tokio::test]
    async fn test_dropped_leader_does_not_block_retry() {
        let scheduler = copy_scheduler();
        let band = BandId::new("c", "B1");
        let rect = Rect::new(0, 0, 2, 2);

        // Park the request at its first cache lookup.
        let guard = scheduler.inner.cache.lock().await;
        let mut leader = Box::pin(scheduler.get_tile(&band, rect));
        assert!(futures::poll!(leader.as_mut()).is_pending());

        // Queue another lock request so the lookup hands the cache over,
        // then let the request register as leader and drop it.
        drop(guard);
        let mut queued = Box::pin(scheduler.inner.cache.lock());
        assert!(futures::poll!(queued.as_mut()).is_pending());
        assert!(futures::poll!(leader.as_mut()).is_pending());
        drop(leader);
        drop(queued);

        let retry = tokio::time::timeout(Duration::from_secs(5), scheduler.get_tile(&band, rect))
            .await
            .expect("retry completes");
        assert_eq!(retry.unwrap().to_f64_vec(), vec![0.0, 1.0, 4.0, 5.0]);
        assert_eq!(scheduler.inner.coalescer.in_flight_count().await, 0);
    }
}
