//! Pipeline layout metadata consumed by the graphics recording context.
//!
//! A pipeline-state object itself is opaque configuration; the submission
//! core only needs the mapping from shader binding slots to root-parameter
//! indices so resource tables can be staged and bound.

use std::sync::Arc;

use crate::driver::PipelineId;

/// How often a binding is expected to change, which selects the register
/// space it lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UpdateFrequency {
    PerObject,
    PerMaterial,
    PerPass,
    PerFrame,
    Constant,
}

/// Shader register kinds addressable through the layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegisterKind {
    ConstantBuffer,
    Sampler,
    Texture,
    Unordered,
}

/// Where a (frequency, kind, register) binding lands in the root signature.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParameterInfo {
    pub root_parameter_index: u32,
    /// Total view slots in the parameter's table.
    pub count: u32,
    /// Position of the register inside the table.
    pub register_offset: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct RegisterRange {
    frequency: UpdateFrequency,
    kind: RegisterKind,
    register: u32,
    count: u32,
}

impl RegisterRange {
    fn contains(&self, frequency: UpdateFrequency, kind: RegisterKind, register: u32) -> bool {
        self.frequency == frequency
            && self.kind == kind
            && register >= self.register
            && register < self.register + self.count
    }
}

#[derive(Clone, Debug)]
enum RootParameter {
    Single(RegisterRange),
    Table(Vec<RegisterRange>),
}

/// The pipeline's declared mapping from shader binding slots to root
/// parameters. Root-parameter indices are assigned in declaration order.
#[derive(Clone, Debug, Default)]
pub struct RootParameterMap {
    parameters: Vec<RootParameter>,
}

/// Builder view of one descriptor table being declared.
#[derive(Debug)]
pub struct TableMappings<'a> {
    ranges: &'a mut Vec<RegisterRange>,
}

impl TableMappings<'_> {
    pub fn add_range(
        &mut self,
        frequency: UpdateFrequency,
        kind: RegisterKind,
        register: u32,
        count: u32,
    ) -> &mut Self {
        self.ranges.push(RegisterRange {
            frequency,
            kind,
            register,
            count,
        });
        self
    }
}

impl RootParameterMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a root parameter holding a single descriptor.
    pub fn add_parameter(&mut self, frequency: UpdateFrequency, kind: RegisterKind, register: u32) {
        self.parameters.push(RootParameter::Single(RegisterRange {
            frequency,
            kind,
            register,
            count: 1,
        }));
    }

    /// Declares a descriptor-table root parameter and returns a builder for
    /// its register ranges.
    pub fn add_table(&mut self) -> TableMappings<'_> {
        self.parameters.push(RootParameter::Table(Vec::new()));
        match self.parameters.last_mut() {
            Some(RootParameter::Table(ranges)) => TableMappings { ranges },
            _ => unreachable!(),
        }
    }

    /// Resolves a binding slot to its root parameter. `None` means the active
    /// layout has no entry for the slot, which callers treat as a fatal
    /// pipeline-description error.
    pub fn parameter_info(
        &self,
        frequency: UpdateFrequency,
        kind: RegisterKind,
        register: u32,
    ) -> Option<ParameterInfo> {
        for (index, parameter) in self.parameters.iter().enumerate() {
            match parameter {
                RootParameter::Single(range) => {
                    if range.contains(frequency, kind, register) {
                        return Some(ParameterInfo {
                            root_parameter_index: index as u32,
                            count: 1,
                            register_offset: 0,
                        });
                    }
                }
                RootParameter::Table(ranges) => {
                    let total: u32 = ranges.iter().map(|range| range.count).sum();
                    let mut offset = 0;
                    for range in ranges {
                        if range.contains(frequency, kind, register) {
                            return Some(ParameterInfo {
                                root_parameter_index: index as u32,
                                count: total,
                                register_offset: offset + (register - range.register),
                            });
                        }
                        offset += range.count;
                    }
                }
            }
        }
        None
    }
}

/// An opaque compiled pipeline plus the layout metadata needed to bind
/// resources against it.
#[derive(Debug)]
pub struct PipelineState {
    id: PipelineId,
    layout: RootParameterMap,
}

impl PipelineState {
    pub fn new(id: PipelineId, layout: RootParameterMap) -> Arc<PipelineState> {
        Arc::new(PipelineState { id, layout })
    }

    pub fn id(&self) -> PipelineId {
        self.id
    }

    pub fn layout(&self) -> &RootParameterMap {
        &self.layout
    }
}
