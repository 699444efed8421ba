//! Bind group layouts, bind groups, compute pipelines and query sets.

use std::collections::BTreeSet;

use log::debug;

use super::error::{CoreError, ResourceKind, Result};
use super::registry::{Buffer, BufferRegistry};
use super::session::Device;
use crate::backend::{DeviceBackend, ShaderSource};
use crate::schema::Capability;

/// Maximum number of slots in one query set.
pub const MAX_QUERY_SET_CAPACITY: u32 = 4096;

/// Resource kind declared at a binding slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    Uniform,
    ReadOnlyStorage,
    Storage,
    SampledTexture,
    Sampler,
}

impl BindingKind {
    /// Buffer usage a resource must carry to be bound at a slot of this kind.
    /// `None` for slots a buffer cannot fill.
    pub fn required_usage(self) -> Option<wgpu::BufferUsages> {
        match self {
            BindingKind::Uniform => Some(wgpu::BufferUsages::UNIFORM),
            BindingKind::ReadOnlyStorage | BindingKind::Storage => {
                Some(wgpu::BufferUsages::STORAGE)
            }
            BindingKind::SampledTexture | BindingKind::Sampler => None,
        }
    }
}

/// One numbered slot of a bind group layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutEntry {
    pub binding: u32,
    pub kind: BindingKind,
}

impl LayoutEntry {
    pub const fn new(binding: u32, kind: BindingKind) -> Self {
        Self { binding, kind }
    }
}

/// One buffer bound at a slot.
#[derive(Debug, Clone, Copy)]
pub struct BindGroupEntry {
    pub binding: u32,
    pub buffer: Buffer,
}

impl BindGroupEntry {
    pub fn new(binding: u32, buffer: Buffer) -> Self {
        Self { binding, buffer }
    }
}

#[derive(Debug)]
pub struct BindGroupLayout<D: DeviceBackend> {
    id: u64,
    generation: u64,
    entries: Vec<LayoutEntry>,
    raw: D::BindGroupLayout,
}

impl<D: DeviceBackend> BindGroupLayout<D> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Slots sorted by binding number.
    pub fn entries(&self) -> &[LayoutEntry] {
        &self.entries
    }
}

/// Compiled compute program plus the layout it was created against.
#[derive(Debug)]
pub struct ComputePipeline<D: DeviceBackend> {
    id: u64,
    generation: u64,
    layout: Vec<LayoutEntry>,
    entry_point: String,
    pub(crate) raw: D::Pipeline,
}

impl<D: DeviceBackend> ComputePipeline<D> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    /// Whether `group` can be bound to this pipeline.
    pub fn accepts(&self, group: &BindGroup<D>) -> bool {
        self.layout == group.layout
    }
}

/// Resolved buffer bindings for one layout. Reusable across batches.
#[derive(Debug)]
pub struct BindGroup<D: DeviceBackend> {
    id: u64,
    generation: u64,
    layout: Vec<LayoutEntry>,
    buffers: Vec<Buffer>,
    pub(crate) raw: D::BindGroup,
}

impl<D: DeviceBackend> BindGroup<D> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Buffers referenced by this bind group, in slot order.
    pub fn buffers(&self) -> &[Buffer] {
        &self.buffers
    }
}

/// Fixed-capacity set of timestamp slots.
#[derive(Debug)]
pub struct QuerySet<D: DeviceBackend> {
    id: u64,
    generation: u64,
    capacity: u32,
    pub(crate) raw: D::QuerySet,
}

impl<D: DeviceBackend> QuerySet<D> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub(crate) fn check_index(&self, index: u32) -> Result<()> {
        if index >= self.capacity {
            return Err(CoreError::QueryIndexOutOfRange {
                index,
                capacity: self.capacity,
            });
        }
        Ok(())
    }
}

impl<D: DeviceBackend> Device<D> {
    /// Create a bind group layout. Slot numbers must be unique.
    pub fn create_bind_group_layout(
        &mut self,
        label: Option<&str>,
        entries: &[LayoutEntry],
    ) -> Result<BindGroupLayout<D>> {
        self.ensure_current(self.generation(), ResourceKind::Device)?;

        let mut seen = BTreeSet::new();
        for entry in entries {
            if !seen.insert(entry.binding) {
                return Err(CoreError::LayoutMismatch(format!(
                    "binding {} declared more than once",
                    entry.binding
                )));
            }
        }
        let mut entries = entries.to_vec();
        entries.sort_by_key(|e| e.binding);

        let raw = self.raw().create_bind_group_layout(label, &entries)?;
        Ok(BindGroupLayout {
            id: self.next_id(),
            generation: self.generation(),
            entries,
            raw,
        })
    }

    /// Compile a compute pipeline.
    ///
    /// Suspends until the back-end has compiled the shader; its diagnostics
    /// surface as [`CoreError::ShaderCompilationFailed`].
    pub async fn create_compute_pipeline(
        &mut self,
        layout: &BindGroupLayout<D>,
        shader: &ShaderSource,
    ) -> Result<ComputePipeline<D>> {
        self.ensure_current(layout.generation, ResourceKind::BindGroupLayout(layout.id))?;

        let raw = self
            .raw()
            .create_compute_pipeline(&layout.raw, shader)
            .await?;
        let id = self.next_id();
        debug!(
            "Created pipeline #{} ({})",
            id,
            shader.label.as_deref().unwrap_or(&shader.entry_point)
        );
        Ok(ComputePipeline {
            id,
            generation: self.generation(),
            layout: layout.entries.clone(),
            entry_point: shader.entry_point.clone(),
            raw,
        })
    }

    /// Bind buffers to the slots of `layout`.
    ///
    /// Arity and slot numbers must match exactly, every slot must be one a
    /// buffer can fill, and each buffer must carry the usage its slot kind
    /// requires.
    pub fn create_bind_group(
        &mut self,
        registry: &BufferRegistry<D>,
        label: Option<&str>,
        layout: &BindGroupLayout<D>,
        entries: &[BindGroupEntry],
    ) -> Result<BindGroup<D>> {
        self.ensure_current(layout.generation, ResourceKind::BindGroupLayout(layout.id))?;

        if entries.len() != layout.entries.len() {
            return Err(CoreError::LayoutMismatch(format!(
                "layout declares {} binding(s), bind group supplies {}",
                layout.entries.len(),
                entries.len()
            )));
        }

        let mut sorted = entries.to_vec();
        sorted.sort_by_key(|e| e.binding);

        let mut raw_entries = Vec::with_capacity(sorted.len());
        for (slot, entry) in layout.entries.iter().zip(&sorted) {
            if slot.binding != entry.binding {
                return Err(CoreError::LayoutMismatch(format!(
                    "binding {} is not declared by the layout",
                    entry.binding
                )));
            }
            let Some(required) = slot.kind.required_usage() else {
                return Err(CoreError::LayoutMismatch(format!(
                    "binding {} expects {:?}, got a buffer",
                    slot.binding, slot.kind
                )));
            };

            let buffer = &entry.buffer;
            self.ensure_current(buffer.generation(), ResourceKind::Buffer(buffer.id()))?;
            if !buffer.usage().contains(required) {
                return Err(CoreError::MissingUsage {
                    buffer: buffer.id(),
                    required,
                });
            }
            if required == wgpu::BufferUsages::STORAGE {
                let limit = self.limits().max_storage_buffer_binding_size;
                if buffer.size() > limit {
                    return Err(CoreError::SizeExceedsLimit {
                        what: "storage buffer binding",
                        requested: buffer.size(),
                        limit,
                    });
                }
            }
            raw_entries.push((entry.binding, registry.raw(buffer)?.clone()));
        }

        let raw = self.raw().create_bind_group(label, &layout.raw, &raw_entries)?;
        Ok(BindGroup {
            id: self.next_id(),
            generation: self.generation(),
            layout: layout.entries.clone(),
            buffers: sorted.iter().map(|e| e.buffer).collect(),
            raw,
        })
    }

    /// Create a timestamp query set. Requires `timestamp-query`.
    pub fn create_query_set(&mut self, label: Option<&str>, capacity: u32) -> Result<QuerySet<D>> {
        self.ensure_current(self.generation(), ResourceKind::Device)?;
        self.require(Capability::TimestampQuery)?;
        if capacity == 0 {
            return Err(CoreError::QueryIndexOutOfRange {
                index: 0,
                capacity,
            });
        }
        if capacity > MAX_QUERY_SET_CAPACITY {
            return Err(CoreError::SizeExceedsLimit {
                what: "query set",
                requested: u64::from(capacity),
                limit: u64::from(MAX_QUERY_SET_CAPACITY),
            });
        }

        let raw = self.raw().create_query_set(label, capacity)?;
        Ok(QuerySet {
            id: self.next_id(),
            generation: self.generation(),
            capacity,
            raw,
        })
    }
}
