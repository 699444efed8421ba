//! Buffer registry - allocation, mapping state machine and pinning.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::mpsc;

use log::{debug, warn};

use super::error::{CoreError, ResourceKind, Result};
use super::session::Device;
use crate::backend::{BufferDescriptor, DeviceBackend};

/// Copy alignment for buffer sizes, offsets and host-initialised buffers.
pub const COPY_ALIGNMENT: u64 = 4;

/// Stable identifier of a registered buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(pub(crate) u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer #{}", self.0)
    }
}

/// Host access direction of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    Read,
    Write,
}

/// Mapping state of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapState {
    /// GPU-owned; the only state in which a batch may reference the buffer.
    Unmapped,
    /// An asynchronous read map is outstanding.
    MapPending,
    /// Host-owned through a host-visible view.
    Mapped(MapMode),
}

impl fmt::Display for MapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapState::Unmapped => f.write_str("unmapped"),
            MapState::MapPending => f.write_str("map-pending"),
            MapState::Mapped(MapMode::Read) => f.write_str("mapped for read"),
            MapState::Mapped(MapMode::Write) => f.write_str("mapped for write"),
        }
    }
}

/// Handle to a registered buffer. Size and usage are fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Buffer {
    id: BufferId,
    generation: u64,
    size: u64,
    usage: wgpu::BufferUsages,
}

impl Buffer {
    #[inline]
    pub fn id(&self) -> BufferId {
        self.id
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn usage(&self) -> wgpu::BufferUsages {
        self.usage
    }
}

/// Identifier of a finished command batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BatchId(pub(crate) u64);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch #{}", self.0)
    }
}

struct BufferEntry<B> {
    raw: B,
    handle: Buffer,
    state: MapState,
    host_view: Vec<u8>,
    pinned_by: BTreeSet<BatchId>,
}

/// Owner of every buffer allocated through the core.
///
/// Every mapping transition is checked here; an invalid transition is a typed
/// error and leaves the entry untouched.
pub struct BufferRegistry<D: DeviceBackend> {
    entries: HashMap<BufferId, BufferEntry<D::Buffer>>,
    next_buffer: u64,
    next_batch: u64,
    dropped_tx: mpsc::Sender<DroppedBatch>,
    dropped_rx: mpsc::Receiver<DroppedBatch>,
}

/// Pins handed back by a batch dropped without being submitted or discarded.
pub(crate) type DroppedBatch = (BatchId, Vec<BufferId>);

impl<D: DeviceBackend> Default for BufferRegistry<D> {
    fn default() -> Self {
        let (dropped_tx, dropped_rx) = mpsc::channel();
        Self {
            entries: HashMap::new(),
            next_buffer: 0,
            next_batch: 0,
            dropped_tx,
            dropped_rx,
        }
    }
}

impl<D: DeviceBackend> BufferRegistry<D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Allocate a buffer.
    ///
    /// With `host_initialized` the buffer starts `Mapped` for write with a
    /// zero-filled view; it must be unmapped with
    /// [`end_host_access`](Self::end_host_access) before any batch uses it.
    pub fn allocate(
        &mut self,
        device: &Device<D>,
        label: Option<&str>,
        size: u64,
        usage: wgpu::BufferUsages,
        host_initialized: bool,
    ) -> Result<Buffer> {
        device.ensure_current(device.generation(), ResourceKind::Device)?;
        validate_usage(usage)?;

        let limit = device.limits().max_buffer_size;
        if size > limit {
            return Err(CoreError::SizeExceedsLimit {
                what: "buffer",
                requested: size,
                limit,
            });
        }
        if host_initialized && size % COPY_ALIGNMENT != 0 {
            return Err(CoreError::Misaligned {
                what: "host-initialized buffer size",
                value: size,
                alignment: COPY_ALIGNMENT,
            });
        }

        let raw = device.raw().create_buffer(&BufferDescriptor {
            label,
            size,
            usage,
            mapped_at_creation: host_initialized,
        })?;

        self.next_buffer += 1;
        let handle = Buffer {
            id: BufferId(self.next_buffer),
            generation: device.generation(),
            size,
            usage,
        };
        let (state, host_view) = if host_initialized {
            (MapState::Mapped(MapMode::Write), vec![0u8; size as usize])
        } else {
            (MapState::Unmapped, Vec::new())
        };
        debug!(
            "Allocated {} ({} bytes, {:?}, {})",
            handle.id, size, usage, state
        );
        self.entries.insert(
            handle.id,
            BufferEntry {
                raw,
                handle,
                state,
                host_view,
                pinned_by: BTreeSet::new(),
            },
        );
        Ok(handle)
    }

    /// Current mapping state.
    pub fn state(&self, buffer: &Buffer) -> Result<MapState> {
        Ok(self.entry(buffer)?.state)
    }

    /// Whether an unretired batch references the buffer. Pins of dropped
    /// batches count until the next mutating registry call reclaims them.
    pub fn is_pinned(&self, buffer: &Buffer) -> Result<bool> {
        Ok(!self.entry(buffer)?.pinned_by.is_empty())
    }

    /// Writable host view of a buffer mapped for write.
    pub fn begin_host_write(&mut self, device: &Device<D>, buffer: &Buffer) -> Result<&mut [u8]> {
        device.ensure_current(buffer.generation, ResourceKind::Buffer(buffer.id))?;
        self.reclaim_dropped();
        let entry = self.entry_mut(buffer)?;
        match entry.state {
            MapState::Mapped(MapMode::Write) => Ok(&mut entry.host_view),
            state => Err(CoreError::NotMapped {
                buffer: buffer.id,
                wanted: "write",
                state,
            }),
        }
    }

    /// Read-only host view of a buffer mapped for read.
    pub fn host_view(&self, buffer: &Buffer) -> Result<&[u8]> {
        let entry = self.entry(buffer)?;
        match entry.state {
            MapState::Mapped(MapMode::Read) => Ok(&entry.host_view),
            state => Err(CoreError::NotMapped {
                buffer: buffer.id,
                wanted: "read",
                state,
            }),
        }
    }

    /// `Mapped -> Unmapped`, committing host writes to the device.
    pub fn end_host_access(&mut self, device: &Device<D>, buffer: &Buffer) -> Result<()> {
        device.ensure_current(buffer.generation, ResourceKind::Buffer(buffer.id))?;
        let entry = self.entry_mut(buffer)?;
        match entry.state {
            MapState::Mapped(MapMode::Write) => {
                device.raw().unmap(&entry.raw, Some(&entry.host_view))?;
            }
            MapState::Mapped(MapMode::Read) => {
                device.raw().unmap(&entry.raw, None)?;
            }
            state => {
                return Err(CoreError::NotMapped {
                    buffer: buffer.id,
                    wanted: "host access",
                    state,
                });
            }
        }
        entry.state = MapState::Unmapped;
        entry.host_view = Vec::new();
        Ok(())
    }

    /// Map a buffer for reading.
    ///
    /// `Unmapped -> MapPending`, suspends until the device resolves the map,
    /// then `MapPending -> Mapped(Read)`. Requires `MAP_READ` usage and no
    /// unretired batch referencing the buffer. A failed map returns the buffer
    /// to `Unmapped`.
    pub async fn request_read_map(&mut self, device: &Device<D>, buffer: &Buffer) -> Result<&[u8]> {
        device.ensure_current(buffer.generation, ResourceKind::Buffer(buffer.id))?;
        self.reclaim_dropped();
        let raw = {
            let entry = self.entry_mut(buffer)?;
            if !entry.handle.usage.contains(wgpu::BufferUsages::MAP_READ) {
                return Err(CoreError::MissingUsage {
                    buffer: buffer.id,
                    required: wgpu::BufferUsages::MAP_READ,
                });
            }
            if entry.state != MapState::Unmapped {
                return Err(CoreError::BufferNotUnmapped {
                    buffer: buffer.id,
                    state: entry.state,
                });
            }
            if !entry.pinned_by.is_empty() {
                return Err(CoreError::BufferInFlight {
                    buffer: buffer.id,
                    batches: entry.pinned_by.len(),
                });
            }
            entry.state = MapState::MapPending;
            entry.raw.clone()
        };

        let mapped = device.raw().map_read(&raw, buffer.size).await;
        let entry = self.entry_mut(buffer)?;
        match mapped {
            Ok(bytes) => {
                entry.host_view = bytes;
                entry.state = MapState::Mapped(MapMode::Read);
                Ok(&entry.host_view)
            }
            Err(e) => {
                entry.state = MapState::Unmapped;
                Err(e)
            }
        }
    }

    /// Destroy a buffer. Must be `Unmapped` and not referenced by any
    /// unretired batch.
    pub fn release(&mut self, device: &Device<D>, buffer: &Buffer) -> Result<()> {
        device.ensure_current(buffer.generation, ResourceKind::Buffer(buffer.id))?;
        self.reclaim_dropped();
        let entry = self.entry(buffer)?;
        if entry.state != MapState::Unmapped {
            return Err(CoreError::BufferStillMapped {
                buffer: buffer.id,
                state: entry.state,
            });
        }
        if !entry.pinned_by.is_empty() {
            return Err(CoreError::BufferInFlight {
                buffer: buffer.id,
                batches: entry.pinned_by.len(),
            });
        }
        if let Some(entry) = self.entries.remove(&buffer.id) {
            device.raw().destroy_buffer(&entry.raw);
            debug!("Released {}", buffer.id);
        }
        Ok(())
    }

    /// Drop every entry created before `generation` without touching the
    /// (lost) device. Returns how many entries were dropped.
    pub fn purge_stale(&mut self, generation: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.handle.generation >= generation);
        before - self.entries.len()
    }

    /// Raw handle of a buffer that a batch may reference right now.
    pub(crate) fn gpu_usable(
        &self,
        device: &Device<D>,
        buffer: &Buffer,
        required: wgpu::BufferUsages,
    ) -> Result<&D::Buffer> {
        device.ensure_current(buffer.generation, ResourceKind::Buffer(buffer.id))?;
        let entry = self.entry(buffer)?;
        if entry.state != MapState::Unmapped {
            return Err(CoreError::BufferNotUnmapped {
                buffer: buffer.id,
                state: entry.state,
            });
        }
        if !entry.handle.usage.contains(required) {
            return Err(CoreError::MissingUsage {
                buffer: buffer.id,
                required,
            });
        }
        Ok(&entry.raw)
    }

    pub(crate) fn raw(&self, buffer: &Buffer) -> Result<&D::Buffer> {
        Ok(&self.entry(buffer)?.raw)
    }

    pub(crate) fn next_batch_id(&mut self) -> BatchId {
        self.next_batch += 1;
        BatchId(self.next_batch)
    }

    pub(crate) fn pin(&mut self, buffers: &[BufferId], batch: BatchId) {
        self.reclaim_dropped();
        for id in buffers {
            if let Some(entry) = self.entries.get_mut(id) {
                entry.pinned_by.insert(batch);
            }
        }
    }

    pub(crate) fn unpin(&mut self, buffers: &[BufferId], batch: BatchId) {
        for id in buffers {
            if let Some(entry) = self.entries.get_mut(id) {
                entry.pinned_by.remove(&batch);
            }
        }
    }

    /// Sender a finished batch uses to return its pins if it is dropped.
    pub(crate) fn reclaimer(&self) -> mpsc::Sender<DroppedBatch> {
        self.dropped_tx.clone()
    }

    fn reclaim_dropped(&mut self) {
        while let Ok((batch, buffers)) = self.dropped_rx.try_recv() {
            warn!("{} was dropped without being submitted; unpinning", batch);
            self.unpin(&buffers, batch);
        }
    }

    fn entry(&self, buffer: &Buffer) -> Result<&BufferEntry<D::Buffer>> {
        self.entries
            .get(&buffer.id)
            .ok_or(CoreError::UnknownBuffer { buffer: buffer.id })
    }

    fn entry_mut(&mut self, buffer: &Buffer) -> Result<&mut BufferEntry<D::Buffer>> {
        self.entries
            .get_mut(&buffer.id)
            .ok_or(CoreError::UnknownBuffer { buffer: buffer.id })
    }
}

/// WebGPU usage rules: non-empty, `MAP_READ` only alongside `COPY_DST`,
/// `MAP_WRITE` only alongside `COPY_SRC`.
pub fn validate_usage(usage: wgpu::BufferUsages) -> Result<()> {
    use wgpu::BufferUsages as U;

    if usage.is_empty() {
        return Err(CoreError::InvalidUsageCombination {
            usage,
            reason: "usage must not be empty",
        });
    }
    if usage.contains(U::MAP_READ | U::MAP_WRITE) {
        return Err(CoreError::InvalidUsageCombination {
            usage,
            reason: "MAP_READ and MAP_WRITE are mutually exclusive",
        });
    }
    if usage.contains(U::MAP_READ) && !(usage - U::MAP_READ - U::COPY_DST).is_empty() {
        return Err(CoreError::InvalidUsageCombination {
            usage,
            reason: "MAP_READ may only be combined with COPY_DST",
        });
    }
    if usage.contains(U::MAP_WRITE) && !(usage - U::MAP_WRITE - U::COPY_SRC).is_empty() {
        return Err(CoreError::InvalidUsageCombination {
            usage,
            reason: "MAP_WRITE may only be combined with COPY_SRC",
        });
    }
    Ok(())
}
