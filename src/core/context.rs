//! Compute context - one owner for session, registry and queue.

use std::sync::mpsc;

use log::info;

use super::binding::{BindGroup, BindGroupEntry, BindGroupLayout, ComputePipeline, LayoutEntry, QuerySet};
use super::command::{CommandBatch, CommandBuilder};
use super::error::{CoreError, Result};
use super::queue::{CompletionHandle, SubmissionQueue};
use super::readback;
use super::registry::{Buffer, BufferRegistry, MapState};
use super::session::{Device, DeviceInfo, DeviceRequest, DeviceSession, SessionEvent, SupervisorOutcome};
use crate::backend::{Backend, ShaderSource};

/// Everything a caller needs to run compute work on one device.
///
/// The context is passed by reference to consumers; nothing in the crate
/// holds device or buffer state globally.
pub struct ComputeContext<B: Backend> {
    session: DeviceSession<B>,
    registry: BufferRegistry<B::Device>,
    queue: SubmissionQueue<B::Device>,
}

impl<B: Backend> ComputeContext<B> {
    pub async fn acquire(backend: B, request: DeviceRequest) -> Result<Self> {
        let session = DeviceSession::acquire(backend, request).await?;
        Ok(Self {
            session,
            registry: BufferRegistry::new(),
            queue: SubmissionQueue::new(),
        })
    }

    pub fn session(&self) -> &DeviceSession<B> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut DeviceSession<B> {
        &mut self.session
    }

    pub fn registry(&self) -> &BufferRegistry<B::Device> {
        &self.registry
    }

    pub fn queue(&self) -> &SubmissionQueue<B::Device> {
        &self.queue
    }

    pub fn info(&self) -> &DeviceInfo {
        self.session.info()
    }

    pub fn device(&mut self) -> Result<&mut Device<B::Device>> {
        self.session.device()
    }

    pub fn subscribe(&mut self) -> mpsc::Receiver<SessionEvent> {
        self.session.subscribe()
    }

    pub fn create_buffer(
        &mut self,
        label: Option<&str>,
        size: u64,
        usage: wgpu::BufferUsages,
        host_initialized: bool,
    ) -> Result<Buffer> {
        let device = self.session.device()?;
        self.registry
            .allocate(device, label, size, usage, host_initialized)
    }

    /// Allocate a host-initialised buffer, copy `contents` in and unmap it.
    pub fn create_buffer_init(
        &mut self,
        label: Option<&str>,
        contents: &[u8],
        usage: wgpu::BufferUsages,
    ) -> Result<Buffer> {
        let device = self.session.device()?;
        let buffer = self
            .registry
            .allocate(device, label, contents.len() as u64, usage, true)?;
        self.registry
            .begin_host_write(device, &buffer)?
            .copy_from_slice(contents);
        self.registry.end_host_access(device, &buffer)?;
        Ok(buffer)
    }

    pub fn begin_host_write(&mut self, buffer: &Buffer) -> Result<&mut [u8]> {
        let device = self.session.device()?;
        self.registry.begin_host_write(device, buffer)
    }

    pub fn end_host_access(&mut self, buffer: &Buffer) -> Result<()> {
        let device = self.session.device()?;
        self.registry.end_host_access(device, buffer)
    }

    pub fn release(&mut self, buffer: &Buffer) -> Result<()> {
        let device = self.session.device()?;
        self.registry.release(device, buffer)
    }

    pub fn state(&self, buffer: &Buffer) -> Result<MapState> {
        self.registry.state(buffer)
    }

    pub fn create_bind_group_layout(
        &mut self,
        label: Option<&str>,
        entries: &[LayoutEntry],
    ) -> Result<BindGroupLayout<B::Device>> {
        self.session.device()?.create_bind_group_layout(label, entries)
    }

    pub async fn create_compute_pipeline(
        &mut self,
        layout: &BindGroupLayout<B::Device>,
        shader: &ShaderSource,
    ) -> Result<ComputePipeline<B::Device>> {
        self.session
            .device()?
            .create_compute_pipeline(layout, shader)
            .await
    }

    pub fn create_bind_group(
        &mut self,
        label: Option<&str>,
        layout: &BindGroupLayout<B::Device>,
        entries: &[BindGroupEntry],
    ) -> Result<BindGroup<B::Device>> {
        let device = self.session.device()?;
        device.create_bind_group(&self.registry, label, layout, entries)
    }

    pub fn create_query_set(&mut self, label: Option<&str>, capacity: u32) -> Result<QuerySet<B::Device>> {
        self.session.device()?.create_query_set(label, capacity)
    }

    /// Start recording a batch. Only one builder exists at a time; finished
    /// batches may be held and submitted later in any order.
    pub fn command_builder(&mut self) -> Result<CommandBuilder<'_, B::Device>> {
        let device = self.session.device()?;
        CommandBuilder::new(device, &mut self.registry)
    }

    pub fn submit(&mut self, batch: CommandBatch<B::Device>) -> Result<CompletionHandle> {
        let device = self.session.device()?;
        self.queue.submit(device, &mut self.registry, batch)
    }

    pub fn discard(&mut self, batch: CommandBatch<B::Device>) {
        self.queue.discard(&mut self.registry, batch);
    }

    pub fn write_buffer(&mut self, buffer: &Buffer, offset: u64, data: &[u8]) -> Result<()> {
        let device = self.session.device()?;
        self.queue
            .write_buffer(device, &self.registry, buffer, offset, data)
    }

    pub fn poll(&mut self) -> Result<usize> {
        let device = self.session.device()?;
        self.queue.poll(device, &mut self.registry)
    }

    pub fn is_complete(&self, handle: &CompletionHandle) -> bool {
        self.queue.is_complete(handle)
    }

    pub async fn await_completion(&mut self, handle: CompletionHandle) -> Result<()> {
        let device = self.session.device()?;
        self.queue
            .await_completion(device, &mut self.registry, handle)
            .await
    }

    /// Map, copy and unmap `buffer`. Fails with `BufferInFlight` while a
    /// batch referencing it has not retired.
    pub async fn read_back(&mut self, buffer: &Buffer) -> Result<Vec<u8>> {
        let device = self.session.device()?;
        readback::read_back(device, &mut self.registry, buffer).await
    }

    pub async fn read_back_with<T, E, F>(&mut self, buffer: &Buffer, decode: F) -> std::result::Result<T, E>
    where
        E: From<CoreError>,
        F: FnOnce(&[u8]) -> std::result::Result<T, E>,
    {
        let device = self.session.device()?;
        readback::read_back_with(device, &mut self.registry, buffer, decode).await
    }

    /// Supervisor step. After a successful re-acquisition every buffer and
    /// in-flight batch of the old device is forgotten; handles to them keep
    /// failing with `StaleResource`.
    pub async fn supervise(&mut self) -> Result<SupervisorOutcome> {
        let outcome = self.session.supervise().await?;
        if let SupervisorOutcome::Recovered { generation } = outcome {
            let buffers = self.registry.purge_stale(generation);
            let batches = self.queue.abandon_before(&mut self.registry, generation);
            info!(
                "Dropped {} buffer(s) and {} batch(es) of the lost device",
                buffers, batches
            );
        }
        Ok(outcome)
    }

    /// Release the device on purpose.
    pub fn destroy(&mut self) {
        self.session.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HostKernel, LossReason, SoftwareBackend};
    use crate::core::{BindingKind, ResourceKind};
    use crate::schema::Capability;
    use wgpu::BufferUsages as U;

    fn context() -> ComputeContext<SoftwareBackend> {
        pollster::block_on(ComputeContext::acquire(
            SoftwareBackend::new(),
            DeviceRequest::default(),
        ))
        .unwrap()
    }

    fn round_trip(ctx: &mut ComputeContext<SoftwareBackend>, n: usize) {
        let data: Vec<u8> = (0..n).map(|i| (i * 7 + 3) as u8).collect();
        let src = ctx
            .create_buffer(Some("src"), n as u64, U::COPY_SRC, true)
            .unwrap();
        ctx.begin_host_write(&src).unwrap().copy_from_slice(&data);
        ctx.end_host_access(&src).unwrap();
        let dst = ctx
            .create_buffer(Some("dst"), n as u64, U::COPY_DST | U::MAP_READ, false)
            .unwrap();

        let mut builder = ctx.command_builder().unwrap();
        builder
            .copy_buffer_to_buffer(&src, 0, &dst, 0, n as u64)
            .unwrap();
        let batch = builder.finish().unwrap();
        let handle = ctx.submit(batch).unwrap();

        // Pinned until the batch retires.
        assert!(matches!(
            pollster::block_on(ctx.read_back(&dst)),
            Err(CoreError::BufferInFlight { .. })
        ));
        pollster::block_on(ctx.await_completion(handle)).unwrap();

        let bytes = pollster::block_on(ctx.read_back(&dst)).unwrap();
        assert_eq!(bytes, data);
        assert_eq!(ctx.state(&dst).unwrap(), MapState::Unmapped);
        ctx.release(&src).unwrap();
        ctx.release(&dst).unwrap();
    }

    #[test]
    fn test_round_trip_preserves_bytes() {
        let mut ctx = context();
        for n in [4, 40, 4096] {
            round_trip(&mut ctx, n);
        }
        assert!(ctx.registry().is_empty());
    }

    #[test]
    fn test_batch_b_never_completes_before_a() {
        let mut ctx = context();
        let a = ctx.create_buffer_init(None, &[1, 2, 3, 4], U::COPY_SRC).unwrap();
        let b = ctx.create_buffer(None, 4, U::COPY_DST | U::COPY_SRC, false).unwrap();
        let c = ctx.create_buffer(None, 4, U::COPY_DST | U::MAP_READ, false).unwrap();

        let mut builder = ctx.command_builder().unwrap();
        builder.copy_buffer_to_buffer(&a, 0, &b, 0, 4).unwrap();
        let first = builder.finish().unwrap();
        let mut builder = ctx.command_builder().unwrap();
        builder.copy_buffer_to_buffer(&b, 0, &c, 0, 4).unwrap();
        let second = builder.finish().unwrap();

        let ha = ctx.submit(first).unwrap();
        let hb = ctx.submit(second).unwrap();
        pollster::block_on(ctx.await_completion(hb)).unwrap();
        assert!(ctx.is_complete(&ha));
        // B observed A's write.
        assert_eq!(pollster::block_on(ctx.read_back(&c)).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_write_buffer_orders_with_batches() {
        let mut ctx = context();
        let staging = ctx.create_buffer(None, 4, U::COPY_DST | U::COPY_SRC, false).unwrap();
        let first = ctx.create_buffer(None, 4, U::COPY_DST | U::MAP_READ, false).unwrap();
        let second = ctx.create_buffer(None, 4, U::COPY_DST | U::MAP_READ, false).unwrap();

        ctx.write_buffer(&staging, 0, &[1, 1, 1, 1]).unwrap();
        let mut builder = ctx.command_builder().unwrap();
        builder.copy_buffer_to_buffer(&staging, 0, &first, 0, 4).unwrap();
        let batch = builder.finish().unwrap();
        ctx.submit(batch).unwrap();

        ctx.write_buffer(&staging, 0, &[2, 2, 2, 2]).unwrap();
        let mut builder = ctx.command_builder().unwrap();
        builder.copy_buffer_to_buffer(&staging, 0, &second, 0, 4).unwrap();
        let batch = builder.finish().unwrap();
        let last = ctx.submit(batch).unwrap();
        pollster::block_on(ctx.await_completion(last)).unwrap();

        assert_eq!(pollster::block_on(ctx.read_back(&first)).unwrap(), vec![1; 4]);
        assert_eq!(pollster::block_on(ctx.read_back(&second)).unwrap(), vec![2; 4]);
    }

    #[test]
    fn test_loss_recovery_invalidates_old_handles() {
        let backend = SoftwareBackend::new();
        let remote = backend.clone();
        let mut ctx =
            pollster::block_on(ComputeContext::acquire(backend, DeviceRequest::default())).unwrap();
        let old = ctx.create_buffer(None, 16, U::STORAGE, false).unwrap();
        let layout = ctx
            .create_bind_group_layout(None, &[LayoutEntry::new(0, BindingKind::Storage)])
            .unwrap();

        remote.loss_trigger().lose(LossReason::Unknown, "driver reset");
        assert!(ctx.create_buffer(None, 16, U::STORAGE, false).unwrap_err().is_stale());

        let outcome = pollster::block_on(ctx.supervise()).unwrap();
        assert_eq!(outcome, SupervisorOutcome::Recovered { generation: 2 });
        assert_eq!(remote.device_requests(), 2);
        assert!(ctx.registry().is_empty());

        assert!(ctx.release(&old).unwrap_err().is_stale());
        assert!(
            ctx.create_bind_group(None, &layout, &[BindGroupEntry::new(0, old)])
                .unwrap_err()
                .is_stale()
        );
        let fresh = ctx.create_buffer(None, 16, U::STORAGE, false).unwrap();
        assert_eq!(fresh.generation(), 2);
    }

    #[test]
    fn test_handles_of_lost_device_fail_after_recovery() {
        let backend = SoftwareBackend::new();
        let remote = backend.clone();
        let mut ctx =
            pollster::block_on(ComputeContext::acquire(backend, DeviceRequest::default())).unwrap();
        let src = ctx.create_buffer(None, 8, U::COPY_SRC, false).unwrap();
        let dst = ctx.create_buffer(None, 8, U::COPY_DST, false).unwrap();
        let mut handles = Vec::new();
        for _ in 0..2 {
            let mut builder = ctx.command_builder().unwrap();
            builder.copy_buffer_to_buffer(&src, 0, &dst, 0, 8).unwrap();
            let batch = builder.finish().unwrap();
            handles.push(ctx.submit(batch).unwrap());
        }

        remote.loss_trigger().lose(LossReason::Unknown, "driver reset");
        assert_eq!(
            pollster::block_on(ctx.supervise()).unwrap(),
            SupervisorOutcome::Recovered { generation: 2 }
        );

        for handle in handles {
            assert!(!ctx.is_complete(&handle));
            let err = pollster::block_on(ctx.await_completion(handle)).unwrap_err();
            assert_eq!(
                err,
                CoreError::StaleResource {
                    resource: ResourceKind::Batch(handle.batch().0),
                    generation: 1,
                }
            );
        }
        assert_eq!(ctx.queue().in_flight(), 0);
    }

    #[test]
    fn test_destroy_makes_everything_stale() {
        let backend = SoftwareBackend::new();
        let remote = backend.clone();
        let mut ctx =
            pollster::block_on(ComputeContext::acquire(backend, DeviceRequest::default())).unwrap();
        let buffer = ctx.create_buffer(None, 16, U::STORAGE, false).unwrap();

        ctx.destroy();
        assert_eq!(
            pollster::block_on(ctx.supervise()).unwrap(),
            SupervisorOutcome::Destroyed
        );
        assert_eq!(remote.device_requests(), 1);
        assert!(ctx.release(&buffer).unwrap_err().is_stale());
        assert!(ctx.command_builder().err().unwrap().is_stale());
    }

    #[test]
    fn test_pass_timestamps_resolve_in_order() {
        let mut ctx = pollster::block_on(ComputeContext::acquire(
            SoftwareBackend::new(),
            DeviceRequest::default().with_capability(Capability::TimestampQuery),
        ))
        .unwrap();
        let data = ctx.create_buffer(None, 4, U::STORAGE, false).unwrap();
        let layout = ctx
            .create_bind_group_layout(None, &[LayoutEntry::new(0, BindingKind::Storage)])
            .unwrap();
        let shader = ShaderSource::wgsl("@compute @workgroup_size(1) fn main() {}")
            .with_host_kernel(HostKernel::new([1, 1, 1], |inv| {
                inv.store_u32(0, 0, 42);
            }));
        let pipeline = pollster::block_on(ctx.create_compute_pipeline(&layout, &shader)).unwrap();
        let group = ctx
            .create_bind_group(None, &layout, &[BindGroupEntry::new(0, data)])
            .unwrap();
        let query_set = ctx.create_query_set(None, 2).unwrap();
        let resolve = ctx
            .create_buffer(None, 16, U::QUERY_RESOLVE | U::COPY_SRC, false)
            .unwrap();
        let readable = ctx.create_buffer(None, 16, U::COPY_DST | U::MAP_READ, false).unwrap();

        let mut builder = ctx.command_builder().unwrap();
        builder
            .begin_compute_pass(Some(crate::core::PassTimestampWrites {
                query_set: &query_set,
                beginning_of_pass_write_index: Some(0),
                end_of_pass_write_index: Some(1),
            }))
            .unwrap();
        builder.dispatch_compute(&pipeline, &group, [1, 1, 1]).unwrap();
        builder.end_compute_pass().unwrap();
        builder.resolve_query_set(&query_set, 0, 2, &resolve, 0).unwrap();
        builder.copy_buffer_to_buffer(&resolve, 0, &readable, 0, 16).unwrap();
        let batch = builder.finish().unwrap();
        let handle = ctx.submit(batch).unwrap();
        pollster::block_on(ctx.await_completion(handle)).unwrap();

        let raw = pollster::block_on(ctx.read_back(&readable)).unwrap();
        let period = ctx.info().timestamp_period;
        assert!(crate::core::decode_timestamp_pair(&raw, 0, 1, period).is_ok());
    }
}
