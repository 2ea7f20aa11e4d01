//! Shape sources: input shape files and model-config-derived generation.
//!
//! Two ways to fill a [`ShapeRegistry`]: a CSV of collected GEMM shapes
//! (columns `M,N,K,dtype,bias,outdtype,scaleAB`, the last two optional), or
//! the projection dimensions of a transformer read from a model directory's
//! `config.json`. Bias-variant expansion (`all_bias`) happens here, at the
//! orchestration layer; the registry itself stays a pure deduplicating set.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::{info, warn};

use crate::dtype::DtypeKind;
use crate::error::TuneError;
use crate::shape::ShapeRegistry;
use crate::store::parse_bool;

/// Default N sweep, scaled by the batch size before use.
pub const DEFAULT_NSETS: [usize; 8] = [1, 512, 1024, 2048, 3072, 4096, 8192, 16384];

/// Vocabulary rows of the logits GEMM.
// TODO: read vocab_size from config.json and handle sizes not divisible by tp
pub const VOCAB_SIZE: usize = 32000;

/// Options shared by both shape sources.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShapeSourceOptions {
    /// Fallback input dtype for rows/configs that do not carry one.
    pub indtype: Option<DtypeKind>,
    /// Output dtype override; per-shape default is the input dtype.
    pub outdtype: Option<DtypeKind>,
    /// Expand every file-supplied shape into bias=true and bias=false.
    pub all_bias: bool,
    /// Unknown dtype strings warn and default to f16 instead of failing.
    pub lenient_dtype: bool,
}

impl ShapeSourceOptions {
    fn parse_dtype(&self, s: &str) -> Result<DtypeKind, TuneError> {
        if self.lenient_dtype {
            Ok(DtypeKind::parse_lenient(s))
        } else {
            DtypeKind::parse(s)
        }
    }
}

/// Load shapes from a CSV file into the registry. Returns the number of
/// registry entries added (after dedup and bias expansion).
pub fn load_shape_file(
    path: &Path,
    registry: &mut ShapeRegistry,
    opts: &ShapeSourceOptions,
) -> Result<usize, TuneError> {
    if !path.is_file() {
        return Err(TuneError::MissingInputFile(path.to_path_buf()));
    }
    let text = fs::read_to_string(path).map_err(|source| TuneError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut lines = text.lines().enumerate();
    let header = match lines.next() {
        Some((_, header)) => header,
        None => return Ok(0),
    };
    let columns = HeaderMap::parse(header)?;

    let before = registry.len();
    for (idx, line) in lines {
        if line.trim().is_empty() {
            continue;
        }
        let lineno = idx + 1;
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let row = columns.row(&fields, lineno)?;

        let indtype = match row.dtype {
            Some(s) if !s.is_empty() => opts.parse_dtype(s)?,
            _ => opts.indtype.ok_or_else(|| TuneError::MalformedRow {
                line: lineno,
                reason: "row has no dtype and no --indtype was given".to_string(),
            })?,
        };
        let outdtype = match row.outdtype {
            Some(s) if !s.is_empty() => Some(opts.parse_dtype(s)?),
            _ => opts.outdtype,
        };

        let bias_variants: &[bool] = if opts.all_bias {
            &[true, false]
        } else {
            &[row.bias]
        };
        for &bias in bias_variants {
            registry.add_shape(row.m, row.n, row.k, indtype, outdtype, bias, row.scale_ab)?;
        }
    }
    let added = registry.len() - before;
    info!(path = %path.display(), shapes = added, "loaded input shapes");
    Ok(added)
}

struct HeaderMap {
    m: usize,
    n: usize,
    k: usize,
    dtype: Option<usize>,
    bias: Option<usize>,
    outdtype: Option<usize>,
    scale_ab: Option<usize>,
}

struct Row<'a> {
    m: usize,
    n: usize,
    k: usize,
    dtype: Option<&'a str>,
    bias: bool,
    outdtype: Option<&'a str>,
    scale_ab: bool,
}

impl HeaderMap {
    fn parse(header: &str) -> Result<Self, TuneError> {
        let names: Vec<&str> = header.split(',').map(str::trim).collect();
        let find = |name: &str| names.iter().position(|&col| col == name);
        let require = |name: &str| {
            find(name).ok_or_else(|| TuneError::MalformedRow {
                line: 1,
                reason: format!("missing required column '{name}'"),
            })
        };
        Ok(Self {
            m: require("M")?,
            n: require("N")?,
            k: require("K")?,
            dtype: find("dtype"),
            bias: find("bias"),
            outdtype: find("outdtype"),
            scale_ab: find("scaleAB"),
        })
    }

    fn row<'a>(&self, fields: &[&'a str], lineno: usize) -> Result<Row<'a>, TuneError> {
        let malformed = |reason: String| TuneError::MalformedRow {
            line: lineno,
            reason,
        };
        let get = |idx: usize| fields.get(idx).copied().unwrap_or("");
        let dim = |idx: usize, name: &str| {
            let field = get(idx);
            field
                .parse::<usize>()
                .map_err(|_| malformed(format!("invalid {name} '{field}'")))
        };
        let flag = |idx: Option<usize>, name: &str| match idx {
            Some(idx) => parse_bool(get(idx))
                .ok_or_else(|| malformed(format!("invalid {name} '{}'", get(idx)))),
            None => Ok(false),
        };
        Ok(Row {
            m: dim(self.m, "M")?,
            n: dim(self.n, "N")?,
            k: dim(self.k, "K")?,
            dtype: self.dtype.map(get),
            bias: flag(self.bias, "bias")?,
            outdtype: self.outdtype.map(get),
            scale_ab: flag(self.scale_ab, "scaleAB")?,
        })
    }
}

/// The projection dimensions the generator needs from a HuggingFace-style
/// `config.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    #[serde(default)]
    pub torch_dtype: Option<String>,
}

impl ModelConfig {
    pub fn load(model_dir: &Path) -> Result<Self, TuneError> {
        let path = model_dir.join("config.json");
        let text = fs::read_to_string(&path).map_err(|e| TuneError::ModelConfig {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&text).map_err(|e| TuneError::ModelConfig {
            path,
            reason: e.to_string(),
        })
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// The four projection (M, K) pairs of one transformer layer under
    /// tensor parallelism `tp`: fused QKV, attention output, fused
    /// gate+up, and down projection.
    pub fn mk_sets(&self, tp: usize) -> Vec<(usize, usize)> {
        let h = self.hidden_size;
        let d = self.head_dim();
        vec![
            (
                (self.num_attention_heads + 2 * self.num_key_value_heads) * d / tp,
                h,
            ),
            (h, h / tp),
            (self.intermediate_size * 2 / tp, h),
            (h, self.intermediate_size / tp),
        ]
    }
}

/// Generate shapes for every layer projection of `config`, crossed with the
/// N sweep, plus the logits GEMM.
pub fn generate_model_shapes(
    config: &ModelConfig,
    registry: &mut ShapeRegistry,
    tp: usize,
    batch_size: usize,
    nsets: &[usize],
    opts: &ShapeSourceOptions,
) -> Result<(), TuneError> {
    let dtype = match &config.torch_dtype {
        Some(s) => opts.parse_dtype(s)?,
        None => opts.indtype.ok_or(TuneError::MissingDtype)?,
    };

    registry.add_shape(
        VOCAB_SIZE / tp,
        batch_size,
        config.hidden_size,
        dtype,
        opts.outdtype,
        false,
        false,
    )?;

    let mk_sets = config.mk_sets(tp);
    for n in sorted_nsets(nsets, batch_size) {
        for &(m, k) in &mk_sets {
            registry.add_shape(m, n, k, dtype, opts.outdtype, false, false)?;
        }
    }
    Ok(())
}

/// LLaMA-2 13B TP1 fallback used when neither a model directory nor an
/// input file is given.
pub fn generate_default_shapes(
    registry: &mut ShapeRegistry,
    batch_size: usize,
    nsets: &[usize],
    opts: &ShapeSourceOptions,
) -> Result<(), TuneError> {
    warn!("no model specified, tuning for LLaMA-2 13B TP1 shapes");
    let dtype = opts.indtype.unwrap_or(DtypeKind::F16);
    let mk_sets = [(15360, 5120), (5120, 5120), (27648, 5120), (5120, 13824)];

    // logits gemm
    registry.add_shape(VOCAB_SIZE, 1, 5120, dtype, opts.outdtype, false, false)?;
    for n in sorted_nsets(nsets, batch_size) {
        for (m, k) in mk_sets {
            registry.add_shape(m, n, k, dtype, opts.outdtype, false, false)?;
        }
    }
    Ok(())
}

fn sorted_nsets(nsets: &[usize], batch_size: usize) -> Vec<usize> {
    let mut scaled: Vec<usize> = nsets.iter().map(|n| n * batch_size).collect();
    scaled.sort_unstable();
    scaled
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_shape_file_full_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "shapes.csv",
            "M,N,K,dtype,bias,outdtype,scaleAB\n\
             4096,128,4096,f16,False,bf16,True\n\
             5120,1,5120,bf16,True,,False\n",
        );
        let mut registry = ShapeRegistry::new();
        let added =
            load_shape_file(&path, &mut registry, &ShapeSourceOptions::default()).unwrap();
        assert_eq!(added, 2);

        let shapes: Vec<_> = registry.iter().collect();
        assert_eq!(shapes[0].indtype, DtypeKind::F16);
        assert_eq!(shapes[0].outdtype, DtypeKind::Bf16);
        assert!(shapes[0].scale_ab);
        assert!(!shapes[0].bias);
        // empty outdtype defaults to the row's input dtype
        assert_eq!(shapes[1].outdtype, DtypeKind::Bf16);
        assert!(shapes[1].bias);
    }

    #[test]
    fn test_load_shape_file_missing_optional_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "shapes.csv", "M,N,K,dtype,bias\n1024,64,1024,f32,0\n");
        let mut registry = ShapeRegistry::new();
        load_shape_file(&path, &mut registry, &ShapeSourceOptions::default()).unwrap();
        let shape = registry.iter().next().unwrap();
        assert_eq!(shape.outdtype, DtypeKind::F32);
        assert!(!shape.scale_ab);
    }

    #[test]
    fn test_load_shape_file_all_bias_expansion() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "shapes.csv", "M,N,K,dtype,bias\n1024,64,1024,f16,True\n");
        let mut registry = ShapeRegistry::new();
        let opts = ShapeSourceOptions {
            all_bias: true,
            ..Default::default()
        };
        let added = load_shape_file(&path, &mut registry, &opts).unwrap();
        assert_eq!(added, 2);
        let biases: Vec<bool> = registry.iter().map(|s| s.bias).collect();
        assert_eq!(biases, vec![true, false]);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let mut registry = ShapeRegistry::new();
        let err = load_shape_file(
            Path::new("/nonexistent/shapes.csv"),
            &mut registry,
            &ShapeSourceOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, TuneError::MissingInputFile(_)));
    }

    #[test]
    fn test_unknown_dtype_fatal_by_default_lenient_with_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "shapes.csv", "M,N,K,dtype,bias\n64,64,64,int4,False\n");

        let mut registry = ShapeRegistry::new();
        let err = load_shape_file(&path, &mut registry, &ShapeSourceOptions::default())
            .unwrap_err();
        assert!(matches!(err, TuneError::UnknownDtype(_)));

        let opts = ShapeSourceOptions {
            lenient_dtype: true,
            ..Default::default()
        };
        let mut registry = ShapeRegistry::new();
        load_shape_file(&path, &mut registry, &opts).unwrap();
        assert_eq!(registry.iter().next().unwrap().indtype, DtypeKind::F16);
    }

    #[test]
    fn test_row_dtype_falls_back_to_cli_indtype() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "shapes.csv", "M,N,K,dtype,bias\n64,64,64,,False\n");
        let opts = ShapeSourceOptions {
            indtype: Some(DtypeKind::Bf16),
            ..Default::default()
        };
        let mut registry = ShapeRegistry::new();
        load_shape_file(&path, &mut registry, &opts).unwrap();
        assert_eq!(registry.iter().next().unwrap().indtype, DtypeKind::Bf16);
    }

    #[test]
    fn test_model_config_mk_sets() {
        // LLaMA-2 13B: h=5120, i=13824, a=40, kv=40
        let config = ModelConfig {
            hidden_size: 5120,
            intermediate_size: 13824,
            num_attention_heads: 40,
            num_key_value_heads: 40,
            torch_dtype: Some("float16".to_string()),
        };
        assert_eq!(
            config.mk_sets(1),
            vec![(15360, 5120), (5120, 5120), (27648, 5120), (5120, 13824)]
        );
        assert_eq!(
            config.mk_sets(2),
            vec![(7680, 5120), (5120, 2560), (13824, 5120), (5120, 6912)]
        );
    }

    #[test]
    fn test_generate_model_shapes() {
        let config = ModelConfig {
            hidden_size: 5120,
            intermediate_size: 13824,
            num_attention_heads: 40,
            num_key_value_heads: 40,
            torch_dtype: Some("torch.float16".to_string()),
        };
        let mut registry = ShapeRegistry::new();
        generate_model_shapes(
            &config,
            &mut registry,
            1,
            1,
            &[1, 512],
            &ShapeSourceOptions::default(),
        )
        .unwrap();
        // logits gemm + 4 mk sets x 2 n values
        assert_eq!(registry.len(), 9);
        let logits = registry.iter().next().unwrap();
        assert_eq!((logits.m, logits.n, logits.k), (32000, 1, 5120));
        assert_eq!(logits.indtype, DtypeKind::F16);
    }

    #[test]
    fn test_generate_default_shapes_scales_n_by_batch() {
        let mut registry = ShapeRegistry::new();
        generate_default_shapes(&mut registry, 4, &[1, 512], &ShapeSourceOptions::default())
            .unwrap();
        // logits n stays 1; sweep ns are scaled
        let ns: Vec<usize> = registry.iter().map(|s| s.n).collect();
        assert!(ns.contains(&1));
        assert!(ns.contains(&4));
        assert!(ns.contains(&2048));
        assert!(!ns.contains(&512));
    }

    #[test]
    fn test_model_config_load_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            &dir,
            "config.json",
            r#"{
                "hidden_size": 4096,
                "intermediate_size": 11008,
                "num_attention_heads": 32,
                "num_key_value_heads": 32,
                "torch_dtype": "bfloat16"
            }"#,
        );
        let config = ModelConfig::load(dir.path()).unwrap();
        assert_eq!(config.hidden_size, 4096);
        assert_eq!(config.head_dim(), 128);
        assert_eq!(config.torch_dtype.as_deref(), Some("bfloat16"));
    }

    #[test]
    fn test_model_config_missing_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ModelConfig::load(dir.path()).unwrap_err();
        assert!(matches!(err, TuneError::ModelConfig { .. }));
    }
}
