//! Command recording.
//!
//! A [`CommandBuilder`] accumulates copies, compute passes and timestamp
//! operations against one device. Every recording call validates its
//! arguments up front; a rejected call leaves the builder exactly as it was.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::mpsc;

use log::debug;

use super::binding::{BindGroup, ComputePipeline, QuerySet};
use super::error::{CoreError, ResourceKind, Result};
use super::registry::{BatchId, Buffer, BufferId, BufferRegistry, COPY_ALIGNMENT, DroppedBatch};
use super::session::Device;
use crate::backend::{Command, DeviceBackend, Dispatch, PassTimestamps};
use crate::schema::Capability;

/// Required alignment of a query resolve destination offset.
pub const QUERY_RESOLVE_ALIGNMENT: u64 = 256;

/// Size of one resolved timestamp in bytes.
pub const TIMESTAMP_SIZE: u64 = 8;

/// Timestamps written at the boundaries of a compute pass.
pub struct PassTimestampWrites<'a, D: DeviceBackend> {
    pub query_set: &'a QuerySet<D>,
    pub beginning_of_pass_write_index: Option<u32>,
    pub end_of_pass_write_index: Option<u32>,
}

struct OpenPass<D: DeviceBackend> {
    timestamps: Option<PassTimestamps<D>>,
    dispatches: Vec<Dispatch<D>>,
}

/// Finished, immutable batch of commands.
///
/// Every buffer it references is pinned until the batch retires or is
/// discarded. Submitting consumes the batch, so it can never be resubmitted.
/// A batch dropped unused hands its pins back to the registry, which clears
/// them on its next mutating call.
#[must_use = "a finished batch pins its buffers until it is submitted or discarded"]
pub struct CommandBatch<D: DeviceBackend> {
    pub(crate) id: BatchId,
    pub(crate) generation: u64,
    pub(crate) commands: Vec<Command<D>>,
    pub(crate) buffers: Vec<BufferId>,
    pub(crate) reclaim: mpsc::Sender<DroppedBatch>,
}

impl<D: DeviceBackend> CommandBatch<D> {
    /// Take the commands and pinned buffers out, leaving nothing to reclaim
    /// on drop.
    pub(crate) fn take(&mut self) -> (Vec<Command<D>>, Vec<BufferId>) {
        (
            std::mem::take(&mut self.commands),
            std::mem::take(&mut self.buffers),
        )
    }
}

impl<D: DeviceBackend> Drop for CommandBatch<D> {
    fn drop(&mut self) {
        if !self.buffers.is_empty() {
            // The registry may already be gone.
            let _ = self.reclaim.send((self.id, std::mem::take(&mut self.buffers)));
        }
    }
}

impl<D: DeviceBackend> CommandBatch<D> {
    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Buffers pinned by this batch.
    pub fn buffers(&self) -> &[BufferId] {
        &self.buffers
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl<D: DeviceBackend> fmt::Debug for CommandBatch<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBatch")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("commands", &self.commands)
            .field("buffers", &self.buffers)
            .finish()
    }
}

/// Records one batch against a live device.
pub struct CommandBuilder<'r, D: DeviceBackend> {
    device: &'r Device<D>,
    registry: &'r mut BufferRegistry<D>,
    commands: Vec<Command<D>>,
    pass: Option<OpenPass<D>>,
    referenced: BTreeSet<BufferId>,
    written_queries: HashSet<(u64, u32)>,
}

impl<'r, D: DeviceBackend> CommandBuilder<'r, D> {
    pub fn new(device: &'r Device<D>, registry: &'r mut BufferRegistry<D>) -> Result<Self> {
        device.ensure_current(device.generation(), ResourceKind::Device)?;
        Ok(Self {
            device,
            registry,
            commands: Vec::new(),
            pass: None,
            referenced: BTreeSet::new(),
            written_queries: HashSet::new(),
        })
    }

    /// Number of recorded commands, counting an open pass as one.
    pub fn len(&self) -> usize {
        self.commands.len() + usize::from(self.pass.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_pass_open(&self) -> bool {
        self.pass.is_some()
    }

    /// Copy `size` bytes between two distinct buffers.
    pub fn copy_buffer_to_buffer(
        &mut self,
        src: &Buffer,
        src_offset: u64,
        dst: &Buffer,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        if self.pass.is_some() {
            return Err(CoreError::NotAllowedInsidePass("copy_buffer_to_buffer"));
        }
        if src.id() == dst.id() {
            return Err(CoreError::CopyOverlap { buffer: src.id() });
        }
        aligned("copy source offset", src_offset, COPY_ALIGNMENT)?;
        aligned("copy destination offset", dst_offset, COPY_ALIGNMENT)?;
        aligned("copy size", size, COPY_ALIGNMENT)?;

        let raw_src = self
            .registry
            .gpu_usable(self.device, src, wgpu::BufferUsages::COPY_SRC)?
            .clone();
        let raw_dst = self
            .registry
            .gpu_usable(self.device, dst, wgpu::BufferUsages::COPY_DST)?
            .clone();
        in_bounds(src, src_offset, size)?;
        in_bounds(dst, dst_offset, size)?;

        self.commands.push(Command::CopyBufferToBuffer {
            src: raw_src,
            src_offset,
            dst: raw_dst,
            dst_offset,
            size,
        });
        self.referenced.insert(src.id());
        self.referenced.insert(dst.id());
        Ok(())
    }

    /// Open a compute pass scope, optionally writing timestamps at its
    /// boundaries (requires `timestamp-query`).
    pub fn begin_compute_pass(
        &mut self,
        timestamps: Option<PassTimestampWrites<'_, D>>,
    ) -> Result<()> {
        if self.pass.is_some() {
            return Err(CoreError::PassAlreadyOpen);
        }

        let mut marks = Vec::new();
        let timestamps = match timestamps {
            None => None,
            Some(writes) => {
                self.device.require(Capability::TimestampQuery)?;
                let set = writes.query_set;
                for index in [
                    writes.beginning_of_pass_write_index,
                    writes.end_of_pass_write_index,
                ]
                .into_iter()
                .flatten()
                {
                    self.check_query(set, index)?;
                    if marks.contains(&(set.id(), index)) {
                        return Err(CoreError::QueryAlreadyWritten { index });
                    }
                    marks.push((set.id(), index));
                }
                Some(PassTimestamps {
                    query_set: set.raw.clone(),
                    beginning: writes.beginning_of_pass_write_index,
                    end: writes.end_of_pass_write_index,
                })
            }
        };

        self.written_queries.extend(marks);
        self.pass = Some(OpenPass {
            timestamps,
            dispatches: Vec::new(),
        });
        Ok(())
    }

    /// Record a dispatch inside the open compute pass.
    pub fn dispatch_compute(
        &mut self,
        pipeline: &ComputePipeline<D>,
        bind_group: &BindGroup<D>,
        workgroups: [u32; 3],
    ) -> Result<()> {
        if self.pass.is_none() {
            return Err(CoreError::PassNotOpen("dispatch_compute"));
        }
        self.device
            .ensure_current(pipeline.generation(), ResourceKind::Pipeline(pipeline.id()))?;
        self.device.ensure_current(
            bind_group.generation(),
            ResourceKind::BindGroup(bind_group.id()),
        )?;
        if !pipeline.accepts(bind_group) {
            return Err(CoreError::LayoutMismatch(format!(
                "bind group #{} was not created against a layout compatible with pipeline #{}",
                bind_group.id(),
                pipeline.id()
            )));
        }
        let limit = self.device.limits().max_compute_workgroups_per_dimension;
        if let Some(&count) = workgroups.iter().find(|&&count| count > limit) {
            return Err(CoreError::SizeExceedsLimit {
                what: "workgroup count",
                requested: u64::from(count),
                limit: u64::from(limit),
            });
        }
        for buffer in bind_group.buffers() {
            self.registry
                .gpu_usable(self.device, buffer, wgpu::BufferUsages::empty())?;
        }

        if let Some(pass) = self.pass.as_mut() {
            pass.dispatches.push(Dispatch {
                pipeline: pipeline.raw.clone(),
                bind_group: bind_group.raw.clone(),
                workgroups,
            });
        }
        self.referenced
            .extend(bind_group.buffers().iter().map(|b| b.id()));
        Ok(())
    }

    /// Close the open compute pass.
    pub fn end_compute_pass(&mut self) -> Result<()> {
        let pass = self
            .pass
            .take()
            .ok_or(CoreError::PassNotOpen("end_compute_pass"))?;
        self.commands.push(Command::ComputePass {
            timestamps: pass.timestamps,
            dispatches: pass.dispatches,
        });
        Ok(())
    }

    /// Single dispatch in its own compute pass.
    pub fn dispatch(
        &mut self,
        pipeline: &ComputePipeline<D>,
        bind_group: &BindGroup<D>,
        workgroups: [u32; 3],
    ) -> Result<()> {
        self.begin_compute_pass(None)?;
        if let Err(e) = self.dispatch_compute(pipeline, bind_group, workgroups) {
            self.pass = None;
            return Err(e);
        }
        self.end_compute_pass()
    }

    /// Write a timestamp on the encoder, outside any compute pass.
    ///
    /// Requires `timestamp-query-inside-encoders`; devices with only
    /// `timestamp-query` write timestamps at pass boundaries instead.
    pub fn write_timestamp(&mut self, query_set: &QuerySet<D>, index: u32) -> Result<()> {
        if self.pass.is_some() {
            return Err(CoreError::NotAllowedInsidePass("write_timestamp"));
        }
        self.device
            .require(Capability::TimestampQueryInsideEncoders)?;
        self.check_query(query_set, index)?;

        self.commands.push(Command::WriteTimestamp {
            query_set: query_set.raw.clone(),
            index,
        });
        self.written_queries.insert((query_set.id(), index));
        Ok(())
    }

    /// Copy `count` raw 64-bit timestamps starting at `start` into
    /// `destination` at `destination_offset`.
    pub fn resolve_query_set(
        &mut self,
        query_set: &QuerySet<D>,
        start: u32,
        count: u32,
        destination: &Buffer,
        destination_offset: u64,
    ) -> Result<()> {
        if self.pass.is_some() {
            return Err(CoreError::NotAllowedInsidePass("resolve_query_set"));
        }
        self.device
            .ensure_current(query_set.generation(), ResourceKind::QuerySet(query_set.id()))?;
        let end = start
            .checked_add(count)
            .filter(|&end| count > 0 && end <= query_set.capacity())
            .ok_or(CoreError::QueryIndexOutOfRange {
                index: start.saturating_add(count.max(1) - 1),
                capacity: query_set.capacity(),
            })?;
        aligned(
            "query resolve destination offset",
            destination_offset,
            QUERY_RESOLVE_ALIGNMENT,
        )?;
        let raw = self
            .registry
            .gpu_usable(self.device, destination, wgpu::BufferUsages::QUERY_RESOLVE)?
            .clone();
        in_bounds(
            destination,
            destination_offset,
            u64::from(end - start) * TIMESTAMP_SIZE,
        )?;

        self.commands.push(Command::ResolveQuerySet {
            query_set: query_set.raw.clone(),
            start,
            count,
            destination: raw,
            destination_offset,
        });
        self.referenced.insert(destination.id());
        Ok(())
    }

    /// Finalise the batch and pin every buffer it references.
    ///
    /// The batch should be submitted, or handed to `discard` if it will not
    /// be; a dropped batch keeps its pins until the registry next reclaims.
    pub fn finish(self) -> Result<CommandBatch<D>> {
        if self.pass.is_some() {
            return Err(CoreError::PassStillOpen);
        }
        if self.commands.is_empty() {
            return Err(CoreError::EmptyBatch);
        }

        let id = self.registry.next_batch_id();
        let buffers: Vec<BufferId> = self.referenced.into_iter().collect();
        self.registry.pin(&buffers, id);
        debug!(
            "Finished {} ({} command(s), {} buffer(s))",
            id,
            self.commands.len(),
            buffers.len()
        );
        Ok(CommandBatch {
            id,
            generation: self.device.generation(),
            commands: self.commands,
            buffers,
            reclaim: self.registry.reclaimer(),
        })
    }

    fn check_query(&self, query_set: &QuerySet<D>, index: u32) -> Result<()> {
        self.device
            .ensure_current(query_set.generation(), ResourceKind::QuerySet(query_set.id()))?;
        query_set.check_index(index)?;
        if self.written_queries.contains(&(query_set.id(), index)) {
            return Err(CoreError::QueryAlreadyWritten { index });
        }
        Ok(())
    }
}

fn aligned(what: &'static str, value: u64, alignment: u64) -> Result<()> {
    if value % alignment != 0 {
        return Err(CoreError::Misaligned {
            what,
            value,
            alignment,
        });
    }
    Ok(())
}

fn in_bounds(buffer: &Buffer, offset: u64, size: u64) -> Result<()> {
    match offset.checked_add(size) {
        Some(end) if end <= buffer.size() => Ok(()),
        _ => Err(CoreError::RangeOutOfBounds {
            what: buffer.id().to_string(),
            offset,
            size,
            limit: buffer.size(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HostKernel, ShaderSource, SoftwareBackend, SoftwareDevice};
    use crate::core::{BindGroupEntry, BindingKind, DeviceRequest, DeviceSession, LayoutEntry, MapState};
    use proptest::prelude::*;
    use wgpu::BufferUsages as U;

    fn open(request: DeviceRequest) -> DeviceSession<SoftwareBackend> {
        pollster::block_on(DeviceSession::acquire(SoftwareBackend::new(), request)).unwrap()
    }

    fn timestamps() -> DeviceRequest {
        DeviceRequest::default()
            .with_capability(Capability::TimestampQuery)
            .with_capability(Capability::TimestampQueryInsideEncoders)
    }

    #[test]
    fn test_copy_rejects_mapped_endpoint() {
        let mut session = open(DeviceRequest::default());
        let device = session.device().unwrap();
        let mut registry = BufferRegistry::<SoftwareDevice>::new();
        let src = registry.allocate(device, None, 16, U::COPY_SRC, true).unwrap();
        let dst = registry.allocate(device, None, 16, U::COPY_DST, false).unwrap();

        let mut builder = CommandBuilder::new(device, &mut registry).unwrap();
        let err = builder.copy_buffer_to_buffer(&src, 0, &dst, 0, 16).unwrap_err();
        assert!(matches!(
            err,
            CoreError::BufferNotUnmapped {
                state: MapState::Mapped(_),
                ..
            }
        ));
        assert!(builder.is_empty());
        assert_eq!(builder.finish().unwrap_err(), CoreError::EmptyBatch);
    }

    #[test]
    fn test_copy_range_and_alignment() {
        let mut session = open(DeviceRequest::default());
        let device = session.device().unwrap();
        let mut registry = BufferRegistry::<SoftwareDevice>::new();
        let src = registry.allocate(device, None, 16, U::COPY_SRC, false).unwrap();
        let dst = registry.allocate(device, None, 8, U::COPY_DST, false).unwrap();

        let mut builder = CommandBuilder::new(device, &mut registry).unwrap();
        assert!(matches!(
            builder.copy_buffer_to_buffer(&src, 0, &dst, 0, 16),
            Err(CoreError::RangeOutOfBounds { limit: 8, .. })
        ));
        assert!(matches!(
            builder.copy_buffer_to_buffer(&src, 12, &dst, 0, 8),
            Err(CoreError::RangeOutOfBounds { limit: 16, .. })
        ));
        assert!(matches!(
            builder.copy_buffer_to_buffer(&src, 2, &dst, 0, 4),
            Err(CoreError::Misaligned { .. })
        ));
        assert!(matches!(
            builder.copy_buffer_to_buffer(&src, 0, &src, 8, 4),
            Err(CoreError::CopyOverlap { .. })
        ));
        assert!(matches!(
            builder.copy_buffer_to_buffer(&dst, 0, &src, 0, 4),
            Err(CoreError::MissingUsage { .. })
        ));
        builder.copy_buffer_to_buffer(&src, 8, &dst, 0, 8).unwrap();
        assert_eq!(builder.len(), 1);
    }

    #[test]
    fn test_finish_pins_referenced_buffers() {
        let mut session = open(DeviceRequest::default());
        let device = session.device().unwrap();
        let mut registry = BufferRegistry::<SoftwareDevice>::new();
        let src = registry.allocate(device, None, 8, U::COPY_SRC, false).unwrap();
        let dst = registry
            .allocate(device, None, 8, U::COPY_DST | U::MAP_READ, false)
            .unwrap();

        let mut builder = CommandBuilder::new(device, &mut registry).unwrap();
        builder.copy_buffer_to_buffer(&src, 0, &dst, 0, 8).unwrap();
        let batch = builder.finish().unwrap();
        assert_eq!(batch.buffers(), &[src.id(), dst.id()]);
        assert!(registry.is_pinned(&src).unwrap());
        assert!(matches!(
            registry.release(device, &dst),
            Err(CoreError::BufferInFlight { .. })
        ));

        registry.unpin(&batch.buffers, batch.id);
        assert!(!registry.is_pinned(&dst).unwrap());
    }

    #[test]
    fn test_pass_scoping() {
        let mut session = open(timestamps());
        let device = session.device().unwrap();
        let query_set = device.create_query_set(None, 4).unwrap();
        let mut registry = BufferRegistry::<SoftwareDevice>::new();
        let resolve = registry
            .allocate(device, None, 32, U::QUERY_RESOLVE | U::COPY_SRC, false)
            .unwrap();

        let mut builder = CommandBuilder::new(device, &mut registry).unwrap();
        assert_eq!(
            builder.end_compute_pass().unwrap_err(),
            CoreError::PassNotOpen("end_compute_pass")
        );

        builder.begin_compute_pass(None).unwrap();
        assert_eq!(
            builder.begin_compute_pass(None).unwrap_err(),
            CoreError::PassAlreadyOpen
        );
        assert_eq!(
            builder.write_timestamp(&query_set, 0).unwrap_err(),
            CoreError::NotAllowedInsidePass("write_timestamp")
        );
        assert_eq!(
            builder
                .resolve_query_set(&query_set, 0, 1, &resolve, 0)
                .unwrap_err(),
            CoreError::NotAllowedInsidePass("resolve_query_set")
        );
        assert!(builder.is_pass_open());

        builder.end_compute_pass().unwrap();
        builder.write_timestamp(&query_set, 0).unwrap();
        builder.resolve_query_set(&query_set, 0, 1, &resolve, 0).unwrap();
        assert_eq!(builder.len(), 3);
    }

    #[test]
    fn test_finish_with_open_pass_fails() {
        let mut session = open(DeviceRequest::default());
        let device = session.device().unwrap();
        let mut registry = BufferRegistry::<SoftwareDevice>::new();
        let mut builder = CommandBuilder::new(device, &mut registry).unwrap();
        builder.begin_compute_pass(None).unwrap();
        assert_eq!(builder.finish().unwrap_err(), CoreError::PassStillOpen);
    }

    #[test]
    fn test_query_written_once_per_batch() {
        let mut session = open(timestamps());
        let device = session.device().unwrap();
        let query_set = device.create_query_set(None, 2).unwrap();
        let mut registry = BufferRegistry::<SoftwareDevice>::new();

        let mut builder = CommandBuilder::new(device, &mut registry).unwrap();
        builder.write_timestamp(&query_set, 0).unwrap();
        assert_eq!(
            builder.write_timestamp(&query_set, 0).unwrap_err(),
            CoreError::QueryAlreadyWritten { index: 0 }
        );
        assert_eq!(
            builder.write_timestamp(&query_set, 2).unwrap_err(),
            CoreError::QueryIndexOutOfRange {
                index: 2,
                capacity: 2
            }
        );
        let writes = PassTimestampWrites {
            query_set: &query_set,
            beginning_of_pass_write_index: Some(0),
            end_of_pass_write_index: Some(1),
        };
        assert_eq!(
            builder.begin_compute_pass(Some(writes)).unwrap_err(),
            CoreError::QueryAlreadyWritten { index: 0 }
        );
        // The rejected pass did not claim index 1.
        builder.write_timestamp(&query_set, 1).unwrap();
    }

    #[test]
    fn test_encoder_timestamps_need_capability() {
        let mut session = open(DeviceRequest::default().with_capability(Capability::TimestampQuery));
        let device = session.device().unwrap();
        let query_set = device.create_query_set(None, 2).unwrap();
        let mut registry = BufferRegistry::<SoftwareDevice>::new();

        let mut builder = CommandBuilder::new(device, &mut registry).unwrap();
        assert_eq!(
            builder.write_timestamp(&query_set, 0).unwrap_err(),
            CoreError::capability(Capability::TimestampQueryInsideEncoders)
        );
        let writes = PassTimestampWrites {
            query_set: &query_set,
            beginning_of_pass_write_index: Some(0),
            end_of_pass_write_index: Some(1),
        };
        builder.begin_compute_pass(Some(writes)).unwrap();
        builder.end_compute_pass().unwrap();
        assert!(builder.finish().is_ok());
    }

    #[test]
    fn test_resolve_destination_checks() {
        let mut session = open(timestamps());
        let device = session.device().unwrap();
        let query_set = device.create_query_set(None, 4).unwrap();
        let mut registry = BufferRegistry::<SoftwareDevice>::new();
        let resolve = registry
            .allocate(device, None, 512, U::QUERY_RESOLVE | U::COPY_SRC, false)
            .unwrap();
        let plain = registry.allocate(device, None, 32, U::COPY_SRC, false).unwrap();

        let mut builder = CommandBuilder::new(device, &mut registry).unwrap();
        assert!(matches!(
            builder.resolve_query_set(&query_set, 0, 4, &resolve, 8),
            Err(CoreError::Misaligned { alignment: 256, .. })
        ));
        assert!(matches!(
            builder.resolve_query_set(&query_set, 0, 4, &plain, 0),
            Err(CoreError::MissingUsage { .. })
        ));
        assert!(matches!(
            builder.resolve_query_set(&query_set, 2, 3, &resolve, 0),
            Err(CoreError::QueryIndexOutOfRange { .. })
        ));
        assert!(matches!(
            builder.resolve_query_set(&query_set, 0, 4, &resolve, 512),
            Err(CoreError::RangeOutOfBounds { .. })
        ));
        builder.resolve_query_set(&query_set, 0, 4, &resolve, 256).unwrap();
    }

    #[test]
    fn test_dispatch_checks() {
        let mut session = open(DeviceRequest::default());
        let device = session.device().unwrap();
        let mut registry = BufferRegistry::<SoftwareDevice>::new();
        let data = registry.allocate(device, None, 16, U::STORAGE, false).unwrap();
        let layout = device
            .create_bind_group_layout(None, &[LayoutEntry::new(0, BindingKind::Storage)])
            .unwrap();
        let other = device
            .create_bind_group_layout(None, &[LayoutEntry::new(0, BindingKind::ReadOnlyStorage)])
            .unwrap();
        let shader = ShaderSource::wgsl("@compute @workgroup_size(1) fn main() {}")
            .with_host_kernel(HostKernel::new([1, 1, 1], |_| {}));
        let pipeline =
            pollster::block_on(device.create_compute_pipeline(&layout, &shader)).unwrap();
        let group = device
            .create_bind_group(&registry, None, &layout, &[BindGroupEntry::new(0, data)])
            .unwrap();
        let foreign = device
            .create_bind_group(&registry, None, &other, &[BindGroupEntry::new(0, data)])
            .unwrap();
        let limit = device.limits().max_compute_workgroups_per_dimension;

        let mut builder = CommandBuilder::new(device, &mut registry).unwrap();
        assert_eq!(
            builder.dispatch_compute(&pipeline, &group, [1, 1, 1]).unwrap_err(),
            CoreError::PassNotOpen("dispatch_compute")
        );
        assert!(matches!(
            builder.dispatch(&pipeline, &foreign, [1, 1, 1]),
            Err(CoreError::LayoutMismatch(_))
        ));
        assert!(!builder.is_pass_open());
        assert!(matches!(
            builder.dispatch(&pipeline, &group, [limit + 1, 1, 1]),
            Err(CoreError::SizeExceedsLimit { .. })
        ));
        builder.dispatch(&pipeline, &group, [limit, 1, 1]).unwrap();
        let batch = builder.finish().unwrap();
        assert_eq!(batch.buffers(), &[data.id()]);
    }

    #[test]
    fn test_dispatch_rejects_mapped_binding() {
        let mut session = open(DeviceRequest::default());
        let device = session.device().unwrap();
        let mut registry = BufferRegistry::<SoftwareDevice>::new();
        let data = registry.allocate(device, None, 16, U::STORAGE, true).unwrap();
        let layout = device
            .create_bind_group_layout(None, &[LayoutEntry::new(0, BindingKind::Storage)])
            .unwrap();
        let shader = ShaderSource::wgsl("@compute @workgroup_size(1) fn main() {}")
            .with_host_kernel(HostKernel::new([1, 1, 1], |_| {}));
        let pipeline =
            pollster::block_on(device.create_compute_pipeline(&layout, &shader)).unwrap();
        let group = device
            .create_bind_group(&registry, None, &layout, &[BindGroupEntry::new(0, data)])
            .unwrap();

        let mut builder = CommandBuilder::new(device, &mut registry).unwrap();
        assert!(matches!(
            builder.dispatch(&pipeline, &group, [1, 1, 1]),
            Err(CoreError::BufferNotUnmapped { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_rejected_copies_leave_builder_unchanged(
            offsets in prop::collection::vec((0u64..40, 0u64..40, 0u64..40), 1..12)
        ) {
            let mut session = open(DeviceRequest::default());
            let device = session.device().unwrap();
            let mut registry = BufferRegistry::<SoftwareDevice>::new();
            let src = registry.allocate(device, None, 32, U::COPY_SRC, false).unwrap();
            let dst = registry.allocate(device, None, 32, U::COPY_DST, false).unwrap();

            let mut builder = CommandBuilder::new(device, &mut registry).unwrap();
            let mut accepted = 0;
            for (src_offset, dst_offset, size) in offsets {
                let valid = src_offset % 4 == 0
                    && dst_offset % 4 == 0
                    && size % 4 == 0
                    && src_offset + size <= 32
                    && dst_offset + size <= 32;
                let result = builder.copy_buffer_to_buffer(&src, src_offset, &dst, dst_offset, size);
                prop_assert_eq!(result.is_ok(), valid);
                if valid {
                    accepted += 1;
                }
                prop_assert_eq!(builder.len(), accepted);
            }
        }
    }
}
