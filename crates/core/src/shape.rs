//! Problem shapes and the deduplicating shape registry.

use std::collections::HashMap;
use std::fmt;

use crate::dtype::DtypeKind;
use crate::error::TuneError;

/// One matrix-multiply workload to tune: `A [m,k] @ B [k,n] -> D [m,n]`.
///
/// The full tuple is the uniqueness key; two shapes differing only in
/// `bias` or `scale_ab` are distinct tuning problems. Immutable once
/// created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProblemShape {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub indtype: DtypeKind,
    pub outdtype: DtypeKind,
    pub bias: bool,
    pub scale_ab: bool,
}

impl ProblemShape {
    /// Create a shape with output dtype equal to input dtype, no bias, no
    /// scaling. Rejects zero dimensions.
    pub fn new(m: usize, n: usize, k: usize, indtype: DtypeKind) -> Result<Self, TuneError> {
        if m == 0 || n == 0 || k == 0 {
            return Err(TuneError::InvalidShape {
                m: m as i64,
                n: n as i64,
                k: k as i64,
            });
        }
        Ok(Self {
            m,
            n,
            k,
            indtype,
            outdtype: indtype,
            bias: false,
            scale_ab: false,
        })
    }

    pub fn with_outdtype(mut self, outdtype: DtypeKind) -> Self {
        self.outdtype = outdtype;
        self
    }

    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    pub fn with_scale_ab(mut self, scale_ab: bool) -> Self {
        self.scale_ab = scale_ab;
        self
    }

    /// Decode shapes (N == 1, batch-size-one autoregressive generation)
    /// often favor a different kernel family than bulk shapes.
    pub fn is_decode(&self) -> bool {
        self.n == 1
    }
}

impl fmt::Display for ProblemShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}x{} {}->{} bias={} scaleAB={}",
            self.m, self.n, self.k, self.indtype, self.outdtype, self.bias, self.scale_ab
        )
    }
}

/// Deduplicated, insertion-ordered collection of shapes to tune.
///
/// Iteration order is first-insertion order so tuning logs and output files
/// are reproducible across runs. The registry is a pure set: bias-variant
/// expansion happens in the shape sources, never here.
#[derive(Debug, Default)]
pub struct ShapeRegistry {
    shapes: Vec<ProblemShape>,
    index: HashMap<ProblemShape, usize>,
}

impl ShapeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a validated shape. Idempotent: inserting an identical key
    /// returns the existing entry.
    pub fn insert(&mut self, shape: ProblemShape) -> &ProblemShape {
        let idx = match self.index.get(&shape) {
            Some(&idx) => idx,
            None => {
                let idx = self.shapes.len();
                self.shapes.push(shape);
                self.index.insert(shape, idx);
                idx
            }
        };
        &self.shapes[idx]
    }

    /// Build and insert a shape. `outdtype` defaults to `indtype`.
    #[allow(clippy::too_many_arguments)]
    pub fn add_shape(
        &mut self,
        m: usize,
        n: usize,
        k: usize,
        indtype: DtypeKind,
        outdtype: Option<DtypeKind>,
        bias: bool,
        scale_ab: bool,
    ) -> Result<&ProblemShape, TuneError> {
        let shape = ProblemShape::new(m, n, k, indtype)?
            .with_outdtype(outdtype.unwrap_or(indtype))
            .with_bias(bias)
            .with_scale_ab(scale_ab);
        Ok(self.insert(shape))
    }

    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    /// Shapes in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &ProblemShape> {
        self.shapes.iter()
    }
}
