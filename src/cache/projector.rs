//! Output shapes derived from one cached snapshot.
//!
//! Projections are pure: they never fetch, and fields shared by several
//! shapes are copied verbatim from the snapshot.

use freshcache_types::OutputFormat;
use serde::Serialize;

/// A canonical snapshot that can be rendered in every [`OutputFormat`].
pub trait Project {
    type Full: Serialize;
    type Lite: Serialize;

    fn full(&self) -> Self::Full;
    fn lite(&self) -> Self::Lite;
}

/// One projection of a snapshot. Serializes as the inner shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Projected<F, L> {
    Full(F),
    Lite(L),
}

impl<F, L> Projected<F, L> {
    pub fn format(&self) -> OutputFormat {
        match self {
            Projected::Full(_) => OutputFormat::Full,
            Projected::Lite(_) => OutputFormat::Lite,
        }
    }
}

/// Render `snapshot` in `format`.
pub fn project<S: Project>(snapshot: &S, format: OutputFormat) -> Projected<S::Full, S::Lite> {
    match format {
        OutputFormat::Full => Projected::Full(snapshot.full()),
        OutputFormat::Lite => Projected::Lite(snapshot.lite()),
    }
}
