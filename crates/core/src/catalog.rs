//! Candidate catalog: which kernel configurations apply to which shapes.
//!
//! Applicability is data-driven: each [`FamilyRule`] declares the dtypes and
//! epilogue features its family supports plus a generator producing the
//! family's config variants for a shape. New families register a rule; the
//! search controller never changes.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::dtype::DtypeKind;
use crate::ops::gemm::{BatchedGemm, DenseGemm, GemmKernel, SplitKGemm};
use crate::shape::ProblemShape;

/// Known kernel implementation families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelFamily {
    /// Vendor-library dense GEMM (the device BLAS path).
    Dense,
    /// Vendor-library strided-batched GEMM.
    Batched,
    /// Custom tiled kernel with K-dimension splitting.
    SplitK,
}

impl KernelFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            KernelFamily::Dense => "dense",
            KernelFamily::Batched => "batched",
            KernelFamily::SplitK => "splitk",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dense" => Some(KernelFamily::Dense),
            "batched" => Some(KernelFamily::Batched),
            "splitk" => Some(KernelFamily::SplitK),
            _ => None,
        }
    }
}

impl fmt::Display for KernelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque configuration parameters of one candidate (tile sizes, split-K
/// factor, algorithm id). Ordered so that rendered candidate ids are stable.
pub type ConfigParams = BTreeMap<String, String>;

/// One concrete kernel implementation + configuration eligible for a shape.
///
/// Candidates are generated per search run and never persisted; only the
/// winning candidate's id survives into a
/// [`TuningResult`](crate::store::TuningResult).
#[derive(Clone)]
pub struct Candidate {
    pub id: String,
    pub family: KernelFamily,
    pub params: ConfigParams,
    kernel: Arc<dyn GemmKernel>,
}

impl Candidate {
    /// Candidate with an id rendered from its family and params, e.g.
    /// `splitk[split_k=4;tile_n=128]`.
    pub fn from_params(
        family: KernelFamily,
        params: ConfigParams,
        kernel: Arc<dyn GemmKernel>,
    ) -> Self {
        let id = if params.is_empty() {
            family.as_str().to_string()
        } else {
            let rendered = params
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect::<Vec<_>>()
                .join(";");
            format!("{family}[{rendered}]")
        };
        Self {
            id,
            family,
            params,
            kernel,
        }
    }

    /// Candidate with an explicit id (used by mock catalogs in tests).
    pub fn with_id(
        id: impl Into<String>,
        family: KernelFamily,
        kernel: Arc<dyn GemmKernel>,
    ) -> Self {
        Self {
            id: id.into(),
            family,
            params: ConfigParams::new(),
            kernel,
        }
    }

    pub fn kernel(&self) -> &dyn GemmKernel {
        self.kernel.as_ref()
    }
}

impl fmt::Debug for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Candidate")
            .field("id", &self.id)
            .field("family", &self.family)
            .field("params", &self.params)
            .finish()
    }
}

/// Applicability rule for one kernel family.
pub struct FamilyRule {
    pub family: KernelFamily,
    pub dtypes: &'static [DtypeKind],
    pub supports_bias: bool,
    pub supports_scale_ab: bool,
    /// Produces the family's config variants for an applicable shape, in
    /// declaration order (the order is the selection tie-break).
    pub generate: fn(&ProblemShape) -> Vec<Candidate>,
}

impl FamilyRule {
    fn applies_to(&self, shape: &ProblemShape) -> bool {
        self.dtypes.contains(&shape.indtype)
            && (!shape.bias || self.supports_bias)
            && (!shape.scale_ab || self.supports_scale_ab)
    }
}

/// Catalog of registered kernel families.
pub struct CandidateCatalog {
    rules: Vec<FamilyRule>,
}

impl CandidateCatalog {
    /// Catalog with the built-in family table.
    pub fn new() -> Self {
        Self {
            rules: vec![
                FamilyRule {
                    family: KernelFamily::Dense,
                    dtypes: &DtypeKind::ALL,
                    supports_bias: true,
                    supports_scale_ab: true,
                    generate: dense_candidates,
                },
                FamilyRule {
                    family: KernelFamily::Batched,
                    dtypes: &[DtypeKind::F32, DtypeKind::F16, DtypeKind::Bf16],
                    supports_bias: false,
                    supports_scale_ab: false,
                    generate: batched_candidates,
                },
                FamilyRule {
                    family: KernelFamily::SplitK,
                    dtypes: &DtypeKind::ALL,
                    supports_bias: true,
                    supports_scale_ab: true,
                    generate: splitk_candidates,
                },
            ],
        }
    }

    /// Empty catalog; families are added with [`CandidateCatalog::register`].
    pub fn with_rules(rules: Vec<FamilyRule>) -> Self {
        Self { rules }
    }

    pub fn register(&mut self, rule: FamilyRule) {
        self.rules.push(rule);
    }

    /// Whether any registered family declares support for this dtype.
    pub fn supports_dtype(&self, dtype: DtypeKind) -> bool {
        self.rules.iter().any(|rule| rule.dtypes.contains(&dtype))
    }

    /// All applicable candidates for a shape, in family declaration order.
    pub fn candidates_for(&self, shape: &ProblemShape) -> Vec<Candidate> {
        let mut out = Vec::new();
        for rule in &self.rules {
            if rule.applies_to(shape) {
                out.extend((rule.generate)(shape));
            }
        }
        out
    }
}

impl Default for CandidateCatalog {
    fn default() -> Self {
        Self::new()
    }
}

fn dense_candidates(_shape: &ProblemShape) -> Vec<Candidate> {
    vec![Candidate::from_params(
        KernelFamily::Dense,
        ConfigParams::new(),
        Arc::new(DenseGemm),
    )]
}

fn batched_candidates(_shape: &ProblemShape) -> Vec<Candidate> {
    vec![Candidate::from_params(
        KernelFamily::Batched,
        ConfigParams::new(),
        Arc::new(BatchedGemm),
    )]
}

fn splitk_candidates(shape: &ProblemShape) -> Vec<Candidate> {
    let tiles: &[usize] = if shape.n > 128 { &[128, 256] } else { &[128] };
    let mut out = Vec::new();
    for &split_k in &[2usize, 4, 8] {
        if split_k > shape.k {
            continue;
        }
        for &tile_n in tiles {
            let mut params = ConfigParams::new();
            params.insert("split_k".to_string(), split_k.to_string());
            params.insert("tile_n".to_string(), tile_n.to_string());
            out.push(Candidate::from_params(
                KernelFamily::SplitK,
                params,
                Arc::new(SplitKGemm::new(split_k, tile_n)),
            ));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::ProblemShape;

    fn shape(n: usize, dtype: DtypeKind) -> ProblemShape {
        ProblemShape::new(4096, n, 4096, dtype).unwrap()
    }

    #[test]
    fn test_all_families_for_plain_f16_shape() {
        let catalog = CandidateCatalog::new();
        let candidates = catalog.candidates_for(&shape(512, DtypeKind::F16));
        let families: Vec<KernelFamily> = candidates.iter().map(|c| c.family).collect();
        assert!(families.contains(&KernelFamily::Dense));
        assert!(families.contains(&KernelFamily::Batched));
        assert!(families.contains(&KernelFamily::SplitK));
    }

    #[test]
    fn test_bias_shape_excludes_batched() {
        let catalog = CandidateCatalog::new();
        let candidates = catalog.candidates_for(&shape(512, DtypeKind::F16).with_bias(true));
        assert!(candidates.iter().all(|c| c.family != KernelFamily::Batched));
        assert!(!candidates.is_empty());
    }

    #[test]
    fn test_fp8_excludes_batched() {
        let catalog = CandidateCatalog::new();
        let candidates = catalog.candidates_for(&shape(512, DtypeKind::Fp8));
        assert!(candidates.iter().all(|c| c.family != KernelFamily::Batched));
        assert!(!candidates.is_empty());
    }

    #[test]
    fn test_narrow_shape_gets_single_tile_variants() {
        let catalog = CandidateCatalog::new();
        let candidates = catalog.candidates_for(&shape(1, DtypeKind::F16));
        let splitk: Vec<&Candidate> = candidates
            .iter()
            .filter(|c| c.family == KernelFamily::SplitK)
            .collect();
        assert_eq!(splitk.len(), 3);
        assert!(splitk
            .iter()
            .all(|c| c.params.get("tile_n").map(String::as_str) == Some("128")));
    }

    #[test]
    fn test_candidate_ids_are_stable() {
        let catalog = CandidateCatalog::new();
        let first = catalog.candidates_for(&shape(512, DtypeKind::F16));
        let second = catalog.candidates_for(&shape(512, DtypeKind::F16));
        let first_ids: Vec<&str> = first.iter().map(|c| c.id.as_str()).collect();
        let second_ids: Vec<&str> = second.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(first_ids, second_ids);
        assert!(first_ids.contains(&"splitk[split_k=4;tile_n=128]"));
    }

    #[test]
    fn test_supports_dtype_covers_registered_families() {
        let catalog = CandidateCatalog::new();
        for dtype in DtypeKind::ALL {
            assert!(catalog.supports_dtype(dtype), "{dtype} should be supported");
        }
    }

    #[test]
    fn test_family_parse_round_trips() {
        for family in [
            KernelFamily::Dense,
            KernelFamily::Batched,
            KernelFamily::SplitK,
        ] {
            assert_eq!(KernelFamily::parse(family.as_str()), Some(family));
        }
        assert_eq!(KernelFamily::parse("rocblas"), None);
    }
}
