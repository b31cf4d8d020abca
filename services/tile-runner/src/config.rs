//! Run file: a graph, its synthetic inputs and the node to compute.
//!
//! ```yaml
//! target: speckle
//! sources:
//!   - name: S1
//!     width: 512
//!     height: 512
//!     bands:
//!       - name: Intensity_VV
//!         unit: intensity
//!         pattern: { type: speckle, seed: 1 }
//! nodes:
//!   - id: speckle
//!     operator: median
//!     parameters: { filterSizeX: 5, filterSizeY: 5 }
//!     sources:
//!       - slot: source
//!         external: S1
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tile_engine::GraphSpec;

use crate::sources::SyntheticSource;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFile {
    /// Node whose bands are computed.
    pub target: String,

    #[serde(default)]
    pub sources: Vec<SyntheticSource>,

    #[serde(flatten)]
    pub graph: GraphSpec,
}

impl RunFile {
    /// Load a run file; `.json` files are parsed as JSON, anything else as YAML.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read run file: {}", path.display()))?;

        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let run: RunFile = if is_json {
            serde_json::from_str(&text)
                .with_context(|| format!("Failed to parse run file: {}", path.display()))?
        } else {
            serde_yaml::from_str(&text)
                .with_context(|| format!("Failed to parse run file: {}", path.display()))?
        };

        run.graph.check_unique_ids()?;
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::Pattern;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use tile_engine::SourceRef;

    const RUN_YAML: &str = r#"
target: speckle
sources:
  - name: S1
    width: 16
    height: 8
    bands:
      - name: Intensity_VV
        unit: intensity
        pattern: { type: speckle, seed: 3 }
nodes:
  - id: speckle
    operator: median
    parameters:
      filterSizeX: 5
    sources:
      - slot: source
        external: S1
"#;

    #[test]
    fn test_parse_yaml_run_file() {
        let run: RunFile = serde_yaml::from_str(RUN_YAML).unwrap();

        assert_eq!(run.target, "speckle");
        assert_eq!(run.sources[0].bands[0].pattern, Pattern::Speckle { seed: 3, mean: 100.0 });
        assert_eq!(run.sources[0].product_type, "SYNTHETIC");

        let node = run.graph.find("speckle").unwrap();
        assert_eq!(node.operator, "median");
        assert_eq!(
            node.binding("source").map(|b| &b.source),
            Some(&SourceRef::External("S1".to_string()))
        );
    }

    #[test]
    fn test_load_json_run_file() {
        let run: RunFile = serde_yaml::from_str(RUN_YAML).unwrap();
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(serde_json::to_string(&run).unwrap().as_bytes()).unwrap();

        assert_eq!(RunFile::load(file.path()).unwrap(), run);
    }

    #[test]
    fn test_load_rejects_duplicate_nodes() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "target: a\nnodes:\n  - id: a\n    operator: median\n  - id: a\n    operator: median"
        )
        .unwrap();

        let err = RunFile::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = RunFile::load(Path::new("/nonexistent/run.yaml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read run file"));
    }
}
