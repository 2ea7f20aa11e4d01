//! Mock measurer and catalog with scripted outcomes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::bench::{Measurement, Measurer};
use crate::catalog::{Candidate, CandidateCatalog, FamilyRule, KernelFamily};
use crate::dtype::DtypeKind;
use crate::ops::gemm::DenseGemm;
use crate::shape::ProblemShape;

/// Measurer that returns scripted measurements by candidate id and records
/// every call. Candidates without a scripted latency fail, so a test that
/// forgets to script one is loud about it.
#[derive(Default)]
pub struct FixedLatencyMeasurer {
    latencies: HashMap<String, f64>,
    failures: HashSet<String>,
    skips: HashSet<String>,
    /// Every `(shape, candidate_id)` measured, in call order.
    pub calls: Vec<(ProblemShape, String)>,
}

impl FixedLatencyMeasurer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, candidate_id: &str, latency_ns: f64) -> Self {
        self.latencies.insert(candidate_id.to_string(), latency_ns);
        self
    }

    pub fn with_failure(mut self, candidate_id: &str) -> Self {
        self.failures.insert(candidate_id.to_string());
        self
    }

    pub fn with_skip(mut self, candidate_id: &str) -> Self {
        self.skips.insert(candidate_id.to_string());
        self
    }
}

impl Measurer for FixedLatencyMeasurer {
    fn measure(&mut self, shape: &ProblemShape, candidate: &Candidate) -> Measurement {
        self.calls.push((*shape, candidate.id.clone()));
        if self.skips.contains(&candidate.id) {
            return Measurement::skipped(&candidate.id, "scripted shape mismatch");
        }
        if self.failures.contains(&candidate.id) {
            return Measurement::failed(&candidate.id, "scripted launch failure");
        }
        match self.latencies.get(&candidate.id) {
            Some(&latency_ns) => Measurement::ok(&candidate.id, latency_ns),
            None => Measurement::failed(&candidate.id, "no scripted latency"),
        }
    }
}

const MOCK_DTYPES: &[DtypeKind] = &[DtypeKind::F32, DtypeKind::F16, DtypeKind::Bf16];

fn mock_a(_shape: &ProblemShape) -> Vec<Candidate> {
    vec![Candidate::with_id("A", KernelFamily::Dense, Arc::new(DenseGemm))]
}

fn mock_b(_shape: &ProblemShape) -> Vec<Candidate> {
    vec![Candidate::with_id("B", KernelFamily::SplitK, Arc::new(DenseGemm))]
}

fn mock_c(_shape: &ProblemShape) -> Vec<Candidate> {
    vec![Candidate::with_id("C", KernelFamily::Batched, Arc::new(DenseGemm))]
}

/// Catalog returning exactly three candidates per f32/f16/bf16 shape:
/// `A` (dense), `B` (splitk), `C` (batched), in that declaration order.
pub fn mock_catalog() -> CandidateCatalog {
    CandidateCatalog::with_rules(vec![
        FamilyRule {
            family: KernelFamily::Dense,
            dtypes: MOCK_DTYPES,
            supports_bias: true,
            supports_scale_ab: true,
            generate: mock_a,
        },
        FamilyRule {
            family: KernelFamily::SplitK,
            dtypes: MOCK_DTYPES,
            supports_bias: true,
            supports_scale_ab: true,
            generate: mock_b,
        },
        FamilyRule {
            family: KernelFamily::Batched,
            dtypes: MOCK_DTYPES,
            supports_bias: true,
            supports_scale_ab: true,
            generate: mock_c,
        },
    ])
}
