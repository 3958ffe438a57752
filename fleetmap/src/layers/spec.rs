//! Layer declarations.

use std::fmt;

use crate::entities::EntityCollection;

/// Rendering primitive a layer uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    /// Point symbols (icons, circles).
    Symbol,
    /// Line strings (routes).
    Line,
    /// Faded line strings (path history).
    Trail,
    /// Density heatmap over point features.
    Heatmap,
}

/// Stacking group. Declaration order is mount order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LayerGroup {
    StaticContext,
    Paths,
    MovingEntities,
    Overlays,
}

/// How queued entries for a layer are combined before flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePolicy {
    /// High-frequency streams: entries with the same key collapse to the newest.
    KeepLastPerKey,
    /// Discrete events: strict FIFO, nothing collapses.
    Fifo,
}

/// How a payload is applied to the layer's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// One entry per feature, merged into the current data by id.
    Upsert,
    /// One entry per batch, replacing the current data wholesale.
    Replace,
}

/// Declaration of one layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerSpec {
    pub id: String,
    pub kind: LayerKind,
    pub group: LayerGroup,
    pub source: EntityCollection,
    pub policy: QueuePolicy,
    pub apply: ApplyMode,
    pub visible: bool,
}

impl LayerSpec {
    pub fn new(
        id: impl Into<String>,
        kind: LayerKind,
        group: LayerGroup,
        source: EntityCollection,
    ) -> Self {
        let (policy, apply) = match group {
            LayerGroup::StaticContext | LayerGroup::Paths => (QueuePolicy::Fifo, ApplyMode::Replace),
            LayerGroup::MovingEntities => (QueuePolicy::KeepLastPerKey, ApplyMode::Upsert),
            LayerGroup::Overlays => (QueuePolicy::Fifo, ApplyMode::Upsert),
        };
        Self {
            id: id.into(),
            kind,
            group,
            source,
            policy,
            apply,
            visible: true,
        }
    }

    pub fn with_policy(mut self, policy: QueuePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_apply(mut self, apply: ApplyMode) -> Self {
        self.apply = apply;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }
}

impl fmt::Display for LayerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}/{:?} <- {})", self.id, self.group, self.kind, self.source)
    }
}

/// The standard fleet layer set.
///
/// Listed in mount order; [`super::LayerRegistry`] also sorts by group so a
/// custom list in any order still stacks the same way.
pub fn default_layer_specs() -> Vec<LayerSpec> {
    use EntityCollection as C;
    use LayerGroup as G;
    use LayerKind as K;

    vec![
        LayerSpec::new("facilities", K::Symbol, G::StaticContext, C::Facilities),
        LayerSpec::new("warehouses", K::Symbol, G::StaticContext, C::Warehouses),
        LayerSpec::new("routes", K::Line, G::Paths, C::Routes),
        LayerSpec::new("trails", K::Trail, G::Paths, C::Trails),
        LayerSpec::new("batches", K::Symbol, G::MovingEntities, C::Batches),
        LayerSpec::new("drivers", K::Symbol, G::MovingEntities, C::Drivers),
        LayerSpec::new("vehicles", K::Symbol, G::MovingEntities, C::Vehicles),
        LayerSpec::new("vehicle-density", K::Heatmap, G::Overlays, C::Vehicles)
            .with_policy(QueuePolicy::KeepLastPerKey)
            .hidden(),
        LayerSpec::new("alerts", K::Symbol, G::Overlays, C::Alerts),
    ]
}
