//! Submission queue - FIFO submission and retirement of command batches.

use std::collections::VecDeque;

use log::{debug, warn};

use super::command::CommandBatch;
use super::error::{CoreError, ResourceKind, Result};
use super::registry::{BatchId, Buffer, BufferId, BufferRegistry, COPY_ALIGNMENT};
use super::session::Device;
use crate::backend::DeviceBackend;

/// Completion signal for one submitted batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompletionHandle {
    batch: BatchId,
    generation: u64,
}

impl CompletionHandle {
    pub fn batch(&self) -> BatchId {
        self.batch
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

struct InFlight<D: DeviceBackend> {
    batch: BatchId,
    generation: u64,
    submission: D::Submission,
    buffers: Vec<BufferId>,
}

/// Batches submitted to one device, oldest first.
///
/// Batches retire strictly in submission order: awaiting a handle retires
/// every batch submitted before it as well.
pub struct SubmissionQueue<D: DeviceBackend> {
    in_flight: VecDeque<InFlight<D>>,
    submitted: u64,
    retired: u64,
    // Generations below this were abandoned; their handles never complete.
    abandoned_below: u64,
}

impl<D: DeviceBackend> Default for SubmissionQueue<D> {
    fn default() -> Self {
        Self {
            in_flight: VecDeque::new(),
            submitted: 0,
            retired: 0,
            abandoned_below: 0,
        }
    }
}

impl<D: DeviceBackend> SubmissionQueue<D> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of submitted batches that have not retired.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Total batches submitted and retired over the queue's lifetime.
    pub fn counters(&self) -> (u64, u64) {
        (self.submitted, self.retired)
    }

    /// Hand a finished batch to the device.
    ///
    /// A batch recorded against a lost device generation is discarded
    /// without executing anything and its buffers are un-pinned.
    pub fn submit(
        &mut self,
        device: &Device<D>,
        registry: &mut BufferRegistry<D>,
        mut batch: CommandBatch<D>,
    ) -> Result<CompletionHandle> {
        let (id, generation) = (batch.id, batch.generation);
        let (commands, buffers) = batch.take();

        if let Err(e) = device.ensure_current(generation, ResourceKind::Batch(id.0)) {
            warn!("Discarding {} recorded on a lost device", id);
            registry.unpin(&buffers, id);
            return Err(e);
        }

        let submission = match device.raw().submit(commands) {
            Ok(submission) => submission,
            Err(e) => {
                registry.unpin(&buffers, id);
                return Err(e);
            }
        };
        debug!("Submitted {} as {:?}", id, submission);
        self.submitted += 1;
        self.in_flight.push_back(InFlight {
            batch: id,
            generation,
            submission,
            buffers,
        });
        Ok(CompletionHandle {
            batch: id,
            generation,
        })
    }

    /// Drop a finished batch without submitting it.
    pub fn discard(&mut self, registry: &mut BufferRegistry<D>, mut batch: CommandBatch<D>) {
        debug!("Discarded {} before submission", batch.id);
        let (_, buffers) = batch.take();
        registry.unpin(&buffers, batch.id);
    }

    /// Queue-ordered host upload: lands after every batch already
    /// submitted and before every batch submitted later.
    pub fn write_buffer(
        &mut self,
        device: &Device<D>,
        registry: &BufferRegistry<D>,
        buffer: &Buffer,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        let raw = registry.gpu_usable(device, buffer, wgpu::BufferUsages::COPY_DST)?;
        let size = data.len() as u64;
        for (what, value) in [("write offset", offset), ("write size", size)] {
            if value % COPY_ALIGNMENT != 0 {
                return Err(CoreError::Misaligned {
                    what,
                    value,
                    alignment: COPY_ALIGNMENT,
                });
            }
        }
        if offset.checked_add(size).is_none_or(|end| end > buffer.size()) {
            return Err(CoreError::RangeOutOfBounds {
                what: buffer.id().to_string(),
                offset,
                size,
                limit: buffer.size(),
            });
        }
        device.raw().write_buffer(raw, offset, data)
    }

    /// Whether the batch behind `handle` has retired. Batches abandoned
    /// with their lost device never complete.
    pub fn is_complete(&self, handle: &CompletionHandle) -> bool {
        handle.generation >= self.abandoned_below
            && !self.in_flight.iter().any(|f| f.batch == handle.batch)
    }

    /// Retire, without blocking, every leading batch the device has finished.
    /// Returns how many batches retired.
    pub fn poll(&mut self, device: &Device<D>, registry: &mut BufferRegistry<D>) -> Result<usize> {
        device.ensure_current(device.generation(), ResourceKind::Device)?;
        device.raw().poll()?;

        let mut retired = 0;
        while let Some(front) = self.in_flight.front() {
            if !device.raw().is_retired(&front.submission) {
                break;
            }
            self.retire_front(registry);
            retired += 1;
        }
        Ok(retired)
    }

    /// Suspend until the batch behind `handle` has retired.
    ///
    /// Every earlier batch retires first. If the device was lost, every
    /// outstanding batch of the lost generation fails with `StaleResource`,
    /// and so does any handle from an older generation, queued or not.
    pub async fn await_completion(
        &mut self,
        device: &Device<D>,
        registry: &mut BufferRegistry<D>,
        handle: CompletionHandle,
    ) -> Result<()> {
        if let Err(e) = device.ensure_current(handle.generation, ResourceKind::Batch(handle.batch.0)) {
            self.abandon_before(registry, device.generation().max(handle.generation + 1));
            return Err(e);
        }

        let Some(position) = self.in_flight.iter().position(|f| f.batch == handle.batch) else {
            return Ok(());
        };

        device.raw().wait(&self.in_flight[position].submission).await?;
        for _ in 0..=position {
            self.retire_front(registry);
        }
        Ok(())
    }

    /// Forget batches of generations older than `generation`; their device
    /// is gone and they will never retire. Returns how many were dropped.
    pub fn abandon_before(&mut self, registry: &mut BufferRegistry<D>, generation: u64) -> usize {
        self.abandoned_below = self.abandoned_below.max(generation);
        let before = self.in_flight.len();
        self.in_flight.retain(|f| {
            if f.generation < generation {
                registry.unpin(&f.buffers, f.batch);
                false
            } else {
                true
            }
        });
        let dropped = before - self.in_flight.len();
        if dropped > 0 {
            warn!("Abandoned {} batch(es) of a lost device", dropped);
        }
        dropped
    }

    fn retire_front(&mut self, registry: &mut BufferRegistry<D>) {
        if let Some(done) = self.in_flight.pop_front() {
            registry.unpin(&done.buffers, done.batch);
            self.retired += 1;
            debug!("Retired {}", done.batch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{LossReason, SoftwareBackend, SoftwareDevice};
    use crate::core::{CommandBuilder, DeviceRequest, DeviceSession};
    use wgpu::BufferUsages as U;

    struct Fixture {
        remote: SoftwareBackend,
        session: DeviceSession<SoftwareBackend>,
        registry: BufferRegistry<SoftwareDevice>,
        queue: SubmissionQueue<SoftwareDevice>,
    }

    fn fixture() -> Fixture {
        let remote = SoftwareBackend::new();
        let session = pollster::block_on(DeviceSession::acquire(
            remote.clone(),
            DeviceRequest::default(),
        ))
        .unwrap();
        Fixture {
            remote,
            session,
            registry: BufferRegistry::new(),
            queue: SubmissionQueue::new(),
        }
    }

    fn copy_batch(
        device: &Device<SoftwareDevice>,
        registry: &mut BufferRegistry<SoftwareDevice>,
        src: &Buffer,
        dst: &Buffer,
    ) -> CommandBatch<SoftwareDevice> {
        let mut builder = CommandBuilder::new(device, registry).unwrap();
        builder
            .copy_buffer_to_buffer(src, 0, dst, 0, src.size())
            .unwrap();
        builder.finish().unwrap()
    }

    #[test]
    fn test_batches_retire_in_submission_order() {
        let Fixture {
            mut session,
            mut registry,
            mut queue,
            ..
        } = fixture();
        let device = session.device().unwrap();
        let a = registry.allocate(device, None, 8, U::COPY_SRC, false).unwrap();
        let b = registry.allocate(device, None, 8, U::COPY_DST | U::COPY_SRC, false).unwrap();
        let c = registry.allocate(device, None, 8, U::COPY_DST, false).unwrap();

        let first = copy_batch(device, &mut registry, &a, &b);
        let second = copy_batch(device, &mut registry, &b, &c);
        let h1 = queue.submit(device, &mut registry, first).unwrap();
        let h2 = queue.submit(device, &mut registry, second).unwrap();
        assert_eq!(queue.in_flight(), 2);
        assert!(!queue.is_complete(&h1));

        pollster::block_on(queue.await_completion(device, &mut registry, h2)).unwrap();
        assert!(queue.is_complete(&h1));
        assert!(queue.is_complete(&h2));
        assert_eq!(queue.counters(), (2, 2));
        assert!(!registry.is_pinned(&b).unwrap());

        // Already retired.
        pollster::block_on(queue.await_completion(device, &mut registry, h1)).unwrap();
    }

    #[test]
    fn test_poll_retires_finished_batches() {
        let Fixture {
            mut session,
            mut registry,
            mut queue,
            ..
        } = fixture();
        let device = session.device().unwrap();
        let a = registry.allocate(device, None, 8, U::COPY_SRC, false).unwrap();
        let b = registry.allocate(device, None, 8, U::COPY_DST, false).unwrap();

        let batch = copy_batch(device, &mut registry, &a, &b);
        let handle = queue.submit(device, &mut registry, batch).unwrap();
        assert_eq!(queue.poll(device, &mut registry).unwrap(), 1);
        assert!(queue.is_complete(&handle));
        assert_eq!(queue.poll(device, &mut registry).unwrap(), 0);
    }

    #[test]
    fn test_discard_unpins() {
        let Fixture {
            mut session,
            mut registry,
            mut queue,
            ..
        } = fixture();
        let device = session.device().unwrap();
        let a = registry.allocate(device, None, 8, U::COPY_SRC, false).unwrap();
        let b = registry.allocate(device, None, 8, U::COPY_DST, false).unwrap();

        let batch = copy_batch(device, &mut registry, &a, &b);
        assert!(registry.is_pinned(&a).unwrap());
        queue.discard(&mut registry, batch);
        assert!(!registry.is_pinned(&a).unwrap());
        registry.release(device, &a).unwrap();
    }

    #[test]
    fn test_dropped_batch_pins_are_reclaimed() {
        let Fixture {
            mut session,
            mut registry,
            ..
        } = fixture();
        let device = session.device().unwrap();
        let a = registry.allocate(device, None, 8, U::COPY_SRC, false).unwrap();
        let b = registry.allocate(device, None, 8, U::COPY_DST, false).unwrap();

        let batch = copy_batch(device, &mut registry, &a, &b);
        assert!(registry.is_pinned(&a).unwrap());
        drop(batch);
        registry.release(device, &a).unwrap();
        registry.release(device, &b).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_write_buffer_checks() {
        let Fixture {
            mut session,
            mut registry,
            mut queue,
            ..
        } = fixture();
        let device = session.device().unwrap();
        let dst = registry.allocate(device, None, 8, U::COPY_DST, false).unwrap();
        let src = registry.allocate(device, None, 8, U::COPY_SRC, false).unwrap();

        queue.write_buffer(device, &registry, &dst, 4, &[1, 2, 3, 4]).unwrap();
        assert!(matches!(
            queue.write_buffer(device, &registry, &dst, 4, &[0; 8]),
            Err(CoreError::RangeOutOfBounds { .. })
        ));
        assert!(matches!(
            queue.write_buffer(device, &registry, &dst, 0, &[0; 3]),
            Err(CoreError::Misaligned { .. })
        ));
        assert!(matches!(
            queue.write_buffer(device, &registry, &src, 0, &[0; 4]),
            Err(CoreError::MissingUsage { .. })
        ));
    }

    #[test]
    fn test_stale_batch_is_discarded_on_submit() {
        let Fixture {
            remote,
            mut session,
            mut registry,
            mut queue,
        } = fixture();
        let device = session.device().unwrap();
        let a = registry.allocate(device, None, 8, U::COPY_SRC, false).unwrap();
        let b = registry.allocate(device, None, 8, U::COPY_DST, false).unwrap();
        let batch = copy_batch(device, &mut registry, &a, &b);

        remote.loss_trigger().lose(LossReason::Unknown, "reset");
        let device = session.device().unwrap();
        let err = queue.submit(device, &mut registry, batch).unwrap_err();
        assert!(err.is_stale());
        assert_eq!(queue.in_flight(), 0);
        assert!(!registry.is_pinned(&a).unwrap());
    }

    #[test]
    fn test_pending_handle_fails_after_loss() {
        let Fixture {
            remote,
            mut session,
            mut registry,
            mut queue,
        } = fixture();
        let device = session.device().unwrap();
        let a = registry.allocate(device, None, 8, U::COPY_SRC, false).unwrap();
        let b = registry.allocate(device, None, 8, U::COPY_DST, false).unwrap();
        let batch = copy_batch(device, &mut registry, &a, &b);
        let handle = queue.submit(device, &mut registry, batch).unwrap();

        remote.loss_trigger().lose(LossReason::Unknown, "reset");
        let device = session.device().unwrap();
        let err = pollster::block_on(queue.await_completion(device, &mut registry, handle))
            .unwrap_err();
        assert_eq!(
            err,
            CoreError::StaleResource {
                resource: ResourceKind::Batch(handle.batch().0),
                generation: 1,
            }
        );
        assert_eq!(queue.in_flight(), 0);
        assert!(!registry.is_pinned(&b).unwrap());
    }

    #[test]
    fn test_every_pending_handle_fails_after_loss() {
        let Fixture {
            remote,
            mut session,
            mut registry,
            mut queue,
        } = fixture();
        let device = session.device().unwrap();
        let a = registry.allocate(device, None, 8, U::COPY_SRC, false).unwrap();
        let b = registry.allocate(device, None, 8, U::COPY_DST, false).unwrap();
        let first = copy_batch(device, &mut registry, &a, &b);
        let second = copy_batch(device, &mut registry, &a, &b);
        let h1 = queue.submit(device, &mut registry, first).unwrap();
        let h2 = queue.submit(device, &mut registry, second).unwrap();

        remote.loss_trigger().lose(LossReason::Unknown, "reset");
        let device = session.device().unwrap();
        for handle in [h1, h2] {
            let err = pollster::block_on(queue.await_completion(device, &mut registry, handle))
                .unwrap_err();
            assert!(err.is_stale());
            assert!(!queue.is_complete(&handle));
        }
        assert_eq!(queue.counters(), (2, 0));
    }
}
