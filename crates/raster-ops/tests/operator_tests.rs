//! Median and dual-pol operators running inside the tile scheduler.

use raster_common::{BandDescriptor, BandId, DataType, Rect, Unit};
use raster_ops::{registry, PolOperation};
use test_utils::{
    assert_approx_eq, create_speckle_grid, dual_pol_source, memory_source, punch_no_data,
    sar_slc_source,
};
use tile_engine::{
    resolve, EngineConfig, ExternalSources, GraphSpec, NodeSpec, ResolutionError, TileScheduler,
};

fn tiled(width: usize, height: usize) -> EngineConfig {
    EngineConfig {
        tile_width: width,
        tile_height: height,
        ..EngineConfig::default()
    }
}

fn median_node(id: &str, source: &str) -> NodeSpec {
    NodeSpec::new(id, "median").with_external_source("source", source)
}

// ============================================================================
// Median filter
// ============================================================================

#[tokio::test]
async fn test_median_at_clipped_corner() {
    let externals = ExternalSources::new().with(memory_source(
        "SRC",
        3,
        2,
        vec![(
            BandDescriptor::new("Amplitude_VV", DataType::Float32),
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
        )],
    ));
    let graph = GraphSpec::new().node(median_node("speckle", "SRC"));
    let resolved = resolve(&graph, "speckle", &registry().unwrap(), &externals).unwrap();
    let scheduler = TileScheduler::new(resolved, EngineConfig::default());

    let tile = scheduler
        .get_tile(&BandId::new("speckle", "Amplitude_VV"), Rect::new(1, 0, 1, 1))
        .await
        .unwrap();

    // The 3x3 window at (1, 0) clips to the whole raster: upper median of 1..=6.
    assert_eq!(tile.get(1, 0), Some(4.0));
}

#[tokio::test]
async fn test_median_complex_pair_becomes_intensity() {
    let externals = ExternalSources::new().with(sar_slc_source("SLC", 6, 4));
    let graph = GraphSpec::new().node(median_node("speckle", "SLC").with_param("filterSizeX", 1).with_param("filterSizeY", 1));
    let resolved = resolve(&graph, "speckle", &registry().unwrap(), &externals).unwrap();

    let node = resolved.target_node().unwrap();
    assert_eq!(node.bands.len(), 1);
    let band = &node.bands[0].descriptor;
    assert_eq!(band.name(), "Intensity_VV");
    assert_eq!(band.unit(), Some(Unit::Intensity));
    assert_eq!(band.data_type(), DataType::Float32);
    let band_id = band.id();

    // A 1x1 window leaves the intensity itself.
    let scheduler = TileScheduler::new(resolved, EngineConfig::default());
    let tile = scheduler.compute_band(&band_id).await.unwrap();
    for row in 0..4 {
        for col in 0..6 {
            let expected = ((col * 1000 + row) as f64).powi(2);
            let actual = tile.get(col, row).unwrap();
            assert_approx_eq!(actual, expected, expected * 1e-5 + 1e-3);
        }
    }
}

#[tokio::test]
async fn test_median_without_complex_combination_keeps_components() {
    let externals = ExternalSources::new().with(sar_slc_source("SLC", 4, 4));
    let graph = GraphSpec::new().node(median_node("speckle", "SLC").with_param("combineComplex", false));
    let resolved = resolve(&graph, "speckle", &registry().unwrap(), &externals).unwrap();

    assert_eq!(
        resolved.target_bands(),
        vec![BandId::new("speckle", "i_VV"), BandId::new("speckle", "q_VV")]
    );
}

#[tokio::test]
async fn test_median_is_independent_of_tiling() {
    let externals = ExternalSources::new().with(dual_pol_source("S1", 11, 9));
    let graph = GraphSpec::new().node(
        median_node("speckle", "S1")
            .with_param("filterSizeX", 5)
            .with_param("filterSizeY", 3),
    );
    let registry = registry().unwrap();
    let band = BandId::new("speckle", "Intensity_VH");

    let whole = TileScheduler::new(resolve(&graph, "speckle", &registry, &externals).unwrap(), tiled(64, 64));
    let pieces = TileScheduler::new(resolve(&graph, "speckle", &registry, &externals).unwrap(), tiled(4, 3));

    let reference = whole.compute_band(&band).await.unwrap();
    let mosaic = pieces.compute_band(&band).await.unwrap();

    assert!(mosaic.same_samples(&reference));
    assert_eq!(whole.stats().await.kernel_invocations, 1);
    assert_eq!(pieces.stats().await.kernel_invocations, 3 * 3);
}

#[test]
fn test_median_rejects_even_window() {
    let externals = ExternalSources::new().with(dual_pol_source("S1", 4, 4));
    let graph = GraphSpec::new().node(median_node("speckle", "S1").with_param("filterSizeX", 4));

    let err = resolve(&graph, "speckle", &registry().unwrap(), &externals).unwrap_err();
    assert!(matches!(err, ResolutionError::InvalidParameter { ref parameter, .. } if parameter == "filterSizeX"));
}

#[test]
fn test_median_rejects_unknown_source_band() {
    let externals = ExternalSources::new().with(dual_pol_source("S1", 4, 4));
    let graph = GraphSpec::new().node(median_node("speckle", "S1").with_param("sourceBands", vec!["Intensity_HH"]));

    let err = resolve(&graph, "speckle", &registry().unwrap(), &externals).unwrap_err();
    assert!(matches!(err, ResolutionError::InvalidParameter { ref parameter, .. } if parameter == "sourceBands"));
}

// ============================================================================
// Dual-pol
// ============================================================================

#[tokio::test]
async fn test_dual_pol_computes_all_bands_in_one_invocation() {
    let (width, height) = (5, 4);
    let externals = ExternalSources::new().with(dual_pol_source("S1", width, height));
    let graph = GraphSpec::new().node(
        NodeSpec::new("pol", "dual-pol")
            .with_param("copol", "Intensity_VV")
            .with_param("crosspol", "Intensity_VH")
            .with_external_source("source", "S1"),
    );
    let resolved = resolve(&graph, "pol", &registry().unwrap(), &externals).unwrap();
    assert_eq!(resolved.target_bands().len(), 5);
    let scheduler = TileScheduler::new(resolved, EngineConfig::default());

    let rect = Rect::of_size(width, height);
    let vv = create_speckle_grid(width, height, 11);
    let vh: Vec<f64> = create_speckle_grid(width, height, 12).into_iter().map(|v| v / 4.0).collect();

    for op in PolOperation::ALL {
        let tile = scheduler.get_tile(&BandId::new("pol", op.band_name()), rect).await.unwrap();
        let samples = tile.to_f64_vec();
        for offset in 0..rect.area() {
            let expected = op.apply(vv[offset], vh[offset]) as f32 as f64;
            assert_approx_eq!(samples[offset], expected, 1e-9);
        }
    }

    assert_eq!(scheduler.stats().await.kernel_invocations, 1);
}

#[tokio::test]
async fn test_dual_pol_propagates_no_data() {
    let vv = punch_no_data(vec![2.0; 4], 2, &[(1, 1)], 0.0);
    let externals = ExternalSources::new().with(memory_source(
        "S1",
        2,
        2,
        vec![
            (BandDescriptor::new("VV", DataType::Float32), vv),
            (BandDescriptor::new("VH", DataType::Float32), vec![1.0; 4]),
        ],
    ));
    let graph = GraphSpec::new().node(
        NodeSpec::new("pol", "dual-pol")
            .with_param("copol", "VV")
            .with_param("crosspol", "VH")
            .with_param("operations", vec!["ratio"])
            .with_external_source("source", "S1"),
    );
    let resolved = resolve(&graph, "pol", &registry().unwrap(), &externals).unwrap();
    let scheduler = TileScheduler::new(resolved, EngineConfig::default());

    let tile = scheduler.get_tile(&BandId::new("pol", "Ratio"), Rect::of_size(2, 2)).await.unwrap();
    assert_eq!(tile.to_f64_vec(), vec![2.0, 2.0, 2.0, 0.0]);
}

#[test]
fn test_dual_pol_rejects_missing_band() {
    let externals = ExternalSources::new().with(dual_pol_source("S1", 4, 4));
    let graph = GraphSpec::new().node(
        NodeSpec::new("pol", "dual-pol")
            .with_param("copol", "Intensity_VV")
            .with_param("crosspol", "Intensity_HV")
            .with_external_source("source", "S1"),
    );

    let err = resolve(&graph, "pol", &registry().unwrap(), &externals).unwrap_err();
    assert!(matches!(err, ResolutionError::InvalidParameter { ref parameter, .. } if parameter == "crosspol"));
}

// ============================================================================
// Chains
// ============================================================================

#[tokio::test]
async fn test_median_then_dual_pol_from_yaml() {
    let yaml = r#"
nodes:
  - id: ratio
    operator: dual-pol
    parameters:
      copol: Intensity_VV
      crosspol: Intensity_VH
      operations: [ratio, log_ratio]
    sources:
      - slot: source
        node: speckle
  - id: speckle
    operator: median
    parameters:
      filterSizeX: 3
      filterSizeY: 3
    sources:
      - slot: source
        external: S1
"#;
    let graph = GraphSpec::from_yaml(yaml).unwrap();
    let externals = ExternalSources::new().with(dual_pol_source("S1", 12, 10));
    let resolved = resolve(&graph, "ratio", &registry().unwrap(), &externals).unwrap();
    assert_eq!(resolved.order(), vec!["speckle", "ratio"]);

    let scheduler = TileScheduler::new(resolved, tiled(5, 5));
    let ratio = scheduler.compute_band(&BandId::new("ratio", "Ratio")).await.unwrap();
    let log_ratio = scheduler.compute_band(&BandId::new("ratio", "LogRatio")).await.unwrap();

    // Cross-pol is a quarter of a different speckle draw, so ratios are positive.
    for (r, lr) in ratio.to_f64_vec().into_iter().zip(log_ratio.to_f64_vec()) {
        assert!(r > 0.0);
        assert_approx_eq!(lr, 10.0 * r.log10(), 1e-3);
    }
}
