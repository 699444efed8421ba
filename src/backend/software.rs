//! Software back-end - host emulation of a compute device.
//!
//! Buffers live in host memory and dispatches run [`HostKernel`]s, one call
//! per invocation. Submitted work is queued and only executed when the
//! device is polled, waited on or asked to map a buffer, so batches really
//! are in flight between submission and retirement.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, mpsc};
use std::time::Instant;

use half::f16;
use log::{debug, trace};

use super::{
    AdapterInfo, Backend, BufferDescriptor, Command, DeviceBackend, DeviceLost, Dispatch,
    LossEvents, LossReason, PassTimestamps, ShaderSource, compile_wgsl,
};
use crate::core::{CoreError, DeviceLimits, LayoutEntry, Result};
use crate::schema::{CapabilitySet, PowerPreference, SoftwareProfile};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type KernelFn = dyn Fn(&mut Invocation<'_>) + Send + Sync;

/// Host implementation of a compute entry point.
#[derive(Clone)]
pub struct HostKernel {
    workgroup_size: [u32; 3],
    body: Arc<KernelFn>,
}

impl HostKernel {
    pub fn new<F>(workgroup_size: [u32; 3], body: F) -> Self
    where
        F: Fn(&mut Invocation<'_>) + Send + Sync + 'static,
    {
        Self {
            workgroup_size,
            body: Arc::new(body),
        }
    }

    pub fn workgroup_size(&self) -> [u32; 3] {
        self.workgroup_size
    }
}

impl fmt::Debug for HostKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostKernel")
            .field("workgroup_size", &self.workgroup_size)
            .finish_non_exhaustive()
    }
}

/// Bound memory of one dispatch: binding number to a host copy of the buffer.
struct BoundMemory {
    slots: Vec<(u32, usize)>,
    data: Vec<Vec<u8>>,
}

impl BoundMemory {
    fn slot(&mut self, binding: u32) -> Option<&mut Vec<u8>> {
        let index = self
            .slots
            .iter()
            .find(|(b, _)| *b == binding)
            .map(|(_, i)| *i)?;
        self.data.get_mut(index)
    }
}

/// One kernel invocation.
///
/// Accesses follow WGSL robust buffer access: reads outside a binding return
/// zero and writes outside it are dropped.
pub struct Invocation<'a> {
    pub global_id: [u32; 3],
    pub num_workgroups: [u32; 3],
    memory: &'a mut BoundMemory,
}

impl Invocation<'_> {
    fn read<const N: usize>(&mut self, binding: u32, index: u32) -> [u8; N] {
        let mut out = [0u8; N];
        let start = index as usize * N;
        if let Some(bytes) = self
            .memory
            .slot(binding)
            .and_then(|data| data.get(start..start + N))
        {
            out.copy_from_slice(bytes);
        }
        out
    }

    fn write<const N: usize>(&mut self, binding: u32, index: u32, value: [u8; N]) {
        let start = index as usize * N;
        if let Some(bytes) = self
            .memory
            .slot(binding)
            .and_then(|data| data.get_mut(start..start + N))
        {
            bytes.copy_from_slice(&value);
        }
    }

    pub fn load_f32(&mut self, binding: u32, index: u32) -> f32 {
        f32::from_le_bytes(self.read(binding, index))
    }

    pub fn store_f32(&mut self, binding: u32, index: u32, value: f32) {
        self.write(binding, index, value.to_le_bytes());
    }

    pub fn load_u32(&mut self, binding: u32, index: u32) -> u32 {
        u32::from_le_bytes(self.read(binding, index))
    }

    pub fn store_u32(&mut self, binding: u32, index: u32, value: u32) {
        self.write(binding, index, value.to_le_bytes());
    }

    /// Load a half-precision element, widened to `f32`.
    pub fn load_f16(&mut self, binding: u32, index: u32) -> f32 {
        f16::from_le_bytes(self.read(binding, index)).to_f32()
    }

    /// Store an `f32` rounded to half precision.
    pub fn store_f16(&mut self, binding: u32, index: u32, value: f32) {
        self.write(binding, index, f16::from_f32(value).to_le_bytes());
    }

    /// `atomicAdd` on a `u32` element; returns the previous value.
    pub fn atomic_add_u32(&mut self, binding: u32, index: u32, value: u32) -> u32 {
        let old = self.load_u32(binding, index);
        self.store_u32(binding, index, old.wrapping_add(value));
        old
    }
}

#[derive(Clone)]
pub struct SoftwareBuffer {
    id: u64,
    size: u64,
    memory: Arc<Mutex<Vec<u8>>>,
}

impl fmt::Debug for SoftwareBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwareBuffer")
            .field("id", &self.id)
            .field("size", &self.size)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct SoftwareLayout {
    entries: Vec<LayoutEntry>,
}

#[derive(Debug, Clone)]
pub struct SoftwareBindGroup {
    entries: Vec<(u32, SoftwareBuffer)>,
}

#[derive(Debug, Clone)]
pub struct SoftwarePipeline {
    entry_point: String,
    kernel: HostKernel,
}

#[derive(Clone)]
pub struct SoftwareQuerySet {
    slots: Arc<Mutex<Vec<u64>>>,
}

impl fmt::Debug for SoftwareQuerySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwareQuerySet")
            .field("capacity", &lock(&self.slots).len())
            .finish()
    }
}

/// Sequence number of a submitted batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SoftwareSubmission(u64);

enum Pending {
    Write {
        buffer: SoftwareBuffer,
        offset: u64,
        data: Vec<u8>,
    },
    Batch {
        index: u64,
        commands: Vec<Command<SoftwareDevice>>,
    },
}

/// Liveness of one emulated device, shared with its [`LossTrigger`].
struct DeviceCore {
    lost: AtomicBool,
    loss_tx: Mutex<Option<mpsc::Sender<DeviceLost>>>,
}

impl DeviceCore {
    fn lose(&self, reason: LossReason, message: &str) -> bool {
        if self.lost.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(tx) = lock(&self.loss_tx).take() {
            let _ = tx.send(DeviceLost {
                reason,
                message: message.to_string(),
            });
        }
        true
    }

    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }
}

struct Shared {
    profile: SoftwareProfile,
    device_requests: AtomicU32,
    fail_next: AtomicU32,
    // Counts down to a failing submission; zero when disarmed.
    fail_submission_in: AtomicU32,
    current: Mutex<Option<Arc<DeviceCore>>>,
}

/// Emulated adapter. Clones share state, so a clone kept by a test can
/// inject failures into a session that owns the original.
#[derive(Clone)]
pub struct SoftwareBackend {
    shared: Arc<Shared>,
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareBackend {
    pub fn new() -> Self {
        Self::with_profile(SoftwareProfile::default())
    }

    pub fn with_profile(profile: SoftwareProfile) -> Self {
        Self {
            shared: Arc::new(Shared {
                profile,
                device_requests: AtomicU32::new(0),
                fail_next: AtomicU32::new(0),
                fail_submission_in: AtomicU32::new(0),
                current: Mutex::new(None),
            }),
        }
    }

    pub fn profile(&self) -> &SoftwareProfile {
        &self.shared.profile
    }

    /// Number of device requests made so far, failed ones included.
    pub fn device_requests(&self) -> u32 {
        self.shared.device_requests.load(Ordering::SeqCst)
    }

    /// Make the next `count` device requests fail.
    pub fn fail_next_device_requests(&self, count: u32) {
        self.shared.fail_next.store(count, Ordering::SeqCst);
    }

    /// Make the `n`th submission from now fail, on whichever device makes it.
    /// Zero disarms.
    pub fn fail_nth_submission(&self, n: u32) {
        self.shared.fail_submission_in.store(n, Ordering::SeqCst);
    }

    /// Handle for losing the most recently created device.
    pub fn loss_trigger(&self) -> LossTrigger {
        LossTrigger {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl fmt::Debug for SoftwareBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwareBackend")
            .field("profile", &self.shared.profile)
            .field("device_requests", &self.device_requests())
            .finish()
    }
}

/// Injects device loss into the current software device.
#[derive(Clone)]
pub struct LossTrigger {
    shared: Arc<Shared>,
}

impl LossTrigger {
    /// Lose the current device. Returns false if there is none or it is
    /// already lost.
    pub fn lose(&self, reason: LossReason, message: &str) -> bool {
        match lock(&self.shared.current).as_ref() {
            Some(core) => core.lose(reason, message),
            None => false,
        }
    }
}

impl Backend for SoftwareBackend {
    type Device = SoftwareDevice;

    const NAME: &'static str = "software";

    async fn request_adapter(&mut self, _power: PowerPreference) -> Result<AdapterInfo> {
        let profile = &self.shared.profile;
        if !profile.adapter_available {
            return Err(CoreError::AdapterUnavailable);
        }
        Ok(AdapterInfo {
            name: "Software compute emulator".to_string(),
            capabilities: profile.capabilities.iter().copied().collect(),
            limits: profile.limits,
        })
    }

    async fn request_device(
        &mut self,
        label: &str,
        capabilities: &CapabilitySet,
        limits: &DeviceLimits,
    ) -> Result<(Self::Device, LossEvents)> {
        let attempt = self.shared.device_requests.fetch_add(1, Ordering::SeqCst) + 1;
        let injected = self
            .shared
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(CoreError::DeviceRequest(format!(
                "injected failure on device request {attempt}"
            )));
        }
        debug!(
            "Software device '{}' ({:?}, {:?})",
            label, capabilities, limits
        );

        let (tx, rx) = mpsc::channel();
        let core = Arc::new(DeviceCore {
            lost: AtomicBool::new(false),
            loss_tx: Mutex::new(Some(tx)),
        });
        *lock(&self.shared.current) = Some(Arc::clone(&core));

        let device = SoftwareDevice {
            shared: Arc::clone(&self.shared),
            core,
            period_ns: self.shared.profile.timestamp_period_ns,
            epoch: Instant::now(),
            pending: Mutex::new(VecDeque::new()),
            submitted: AtomicU64::new(0),
            retired: AtomicU64::new(0),
            next_buffer: AtomicU64::new(0),
        };
        Ok((device, rx))
    }
}

/// One emulated logical device.
pub struct SoftwareDevice {
    shared: Arc<Shared>,
    core: Arc<DeviceCore>,
    period_ns: f32,
    epoch: Instant,
    pending: Mutex<VecDeque<Pending>>,
    submitted: AtomicU64,
    retired: AtomicU64,
    next_buffer: AtomicU64,
}

impl fmt::Debug for SoftwareDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwareDevice")
            .field("lost", &self.core.is_lost())
            .field("submitted", &self.submitted.load(Ordering::SeqCst))
            .field("retired", &self.retired.load(Ordering::SeqCst))
            .finish()
    }
}

impl SoftwareDevice {
    fn check_live(&self) -> Result<()> {
        if self.core.is_lost() {
            lock(&self.pending).clear();
            return Err(CoreError::Backend("software device is lost".to_string()));
        }
        Ok(())
    }

    fn now_ticks(&self) -> u64 {
        let nanos = self.epoch.elapsed().as_nanos() as f64;
        (nanos / f64::from(self.period_ns)) as u64
    }

    /// Execute queued work up to and including batch `until`.
    fn run_until(&self, until: u64) -> Result<()> {
        loop {
            self.check_live()?;
            let next = {
                let mut pending = lock(&self.pending);
                let ready = match pending.front() {
                    Some(Pending::Batch { index, .. }) => *index <= until,
                    Some(Pending::Write { .. }) => true,
                    None => false,
                };
                if ready { pending.pop_front() } else { None }
            };
            let Some(work) = next else {
                return Ok(());
            };
            match work {
                Pending::Write {
                    buffer,
                    offset,
                    data,
                } => {
                    let start = offset as usize;
                    lock(&buffer.memory)[start..start + data.len()].copy_from_slice(&data);
                }
                Pending::Batch { index, commands } => {
                    for command in commands {
                        self.execute(command);
                    }
                    self.retired.store(index, Ordering::SeqCst);
                    trace!("Software batch {} retired", index);
                }
            }
        }
    }

    fn run_all(&self) -> Result<()> {
        self.run_until(u64::MAX)
    }

    fn execute(&self, command: Command<SoftwareDevice>) {
        match command {
            Command::CopyBufferToBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                let (s, d, n) = (src_offset as usize, dst_offset as usize, size as usize);
                let bytes = lock(&src.memory)[s..s + n].to_vec();
                lock(&dst.memory)[d..d + n].copy_from_slice(&bytes);
            }
            Command::ComputePass {
                timestamps,
                dispatches,
            } => {
                if let Some(PassTimestamps {
                    query_set,
                    beginning: Some(index),
                    ..
                }) = &timestamps
                {
                    self.stamp(query_set, *index);
                }
                for dispatch in dispatches {
                    run_dispatch(dispatch);
                }
                if let Some(PassTimestamps {
                    query_set,
                    end: Some(index),
                    ..
                }) = &timestamps
                {
                    self.stamp(query_set, *index);
                }
            }
            Command::WriteTimestamp { query_set, index } => self.stamp(&query_set, index),
            Command::ResolveQuerySet {
                query_set,
                start,
                count,
                destination,
                destination_offset,
            } => {
                let slots = lock(&query_set.slots);
                let mut memory = lock(&destination.memory);
                let mut offset = destination_offset as usize;
                for &ticks in &slots[start as usize..(start + count) as usize] {
                    memory[offset..offset + 8].copy_from_slice(&ticks.to_le_bytes());
                    offset += 8;
                }
            }
        }
    }

    fn stamp(&self, query_set: &SoftwareQuerySet, index: u32) {
        let ticks = self.now_ticks();
        if let Some(slot) = lock(&query_set.slots).get_mut(index as usize) {
            *slot = ticks;
        }
    }
}

fn run_dispatch(dispatch: Dispatch<SoftwareDevice>) {
    let Dispatch {
        pipeline,
        bind_group,
        workgroups,
    } = dispatch;

    // Copy each distinct buffer once so aliased bindings see each other's
    // writes.
    let mut sources: Vec<&SoftwareBuffer> = Vec::new();
    let mut slots = Vec::with_capacity(bind_group.entries.len());
    for (binding, buffer) in &bind_group.entries {
        let index = match sources
            .iter()
            .position(|b| Arc::ptr_eq(&b.memory, &buffer.memory))
        {
            Some(index) => index,
            None => {
                sources.push(buffer);
                sources.len() - 1
            }
        };
        slots.push((*binding, index));
    }
    let mut memory = BoundMemory {
        slots,
        data: sources.iter().map(|b| lock(&b.memory).clone()).collect(),
    };

    trace!(
        "Dispatching `{}` over {:?} workgroup(s)",
        pipeline.entry_point, workgroups
    );
    let [wx, wy, wz] = pipeline.kernel.workgroup_size;
    let [nx, ny, nz] = workgroups;
    for gz in 0..nz * wz {
        for gy in 0..ny * wy {
            for gx in 0..nx * wx {
                let mut invocation = Invocation {
                    global_id: [gx, gy, gz],
                    num_workgroups: workgroups,
                    memory: &mut memory,
                };
                (pipeline.kernel.body)(&mut invocation);
            }
        }
    }

    for (buffer, data) in sources.iter().zip(memory.data) {
        *lock(&buffer.memory) = data;
    }
}

impl DeviceBackend for SoftwareDevice {
    type Buffer = SoftwareBuffer;
    type BindGroupLayout = SoftwareLayout;
    type BindGroup = SoftwareBindGroup;
    type Pipeline = SoftwarePipeline;
    type QuerySet = SoftwareQuerySet;
    type Submission = SoftwareSubmission;

    fn create_buffer(&self, desc: &BufferDescriptor<'_>) -> Result<Self::Buffer> {
        let size = usize::try_from(desc.size).map_err(|_| CoreError::SizeExceedsLimit {
            what: "host buffer",
            requested: desc.size,
            limit: usize::MAX as u64,
        })?;
        Ok(SoftwareBuffer {
            id: self.next_buffer.fetch_add(1, Ordering::SeqCst) + 1,
            size: desc.size,
            memory: Arc::new(Mutex::new(vec![0u8; size])),
        })
    }

    fn unmap(&self, buffer: &Self::Buffer, written: Option<&[u8]>) -> Result<()> {
        if let Some(data) = written {
            lock(&buffer.memory).copy_from_slice(data);
        }
        Ok(())
    }

    async fn map_read(&self, buffer: &Self::Buffer, size: u64) -> Result<Vec<u8>> {
        // A map resolves only after every earlier submission has retired.
        self.run_all()?;
        Ok(lock(&buffer.memory)[..size as usize].to_vec())
    }

    fn write_buffer(&self, buffer: &Self::Buffer, offset: u64, data: &[u8]) -> Result<()> {
        self.check_live()?;
        lock(&self.pending).push_back(Pending::Write {
            buffer: buffer.clone(),
            offset,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn destroy_buffer(&self, buffer: &Self::Buffer) {
        trace!("Software buffer {} destroyed", buffer.id);
    }

    fn create_bind_group_layout(
        &self,
        _label: Option<&str>,
        entries: &[LayoutEntry],
    ) -> Result<Self::BindGroupLayout> {
        Ok(SoftwareLayout {
            entries: entries.to_vec(),
        })
    }

    async fn create_compute_pipeline(
        &self,
        _layout: &Self::BindGroupLayout,
        shader: &ShaderSource,
    ) -> Result<Self::Pipeline> {
        self.check_live()?;
        compile_wgsl(shader, true)?;
        let Some(kernel) = shader.host.clone() else {
            return Err(CoreError::ShaderCompilationFailed {
                entry_point: shader.entry_point.clone(),
                diagnostics: "no host kernel attached for the software back-end".to_string(),
            });
        };
        Ok(SoftwarePipeline {
            entry_point: shader.entry_point.clone(),
            kernel,
        })
    }

    fn create_bind_group(
        &self,
        _label: Option<&str>,
        layout: &Self::BindGroupLayout,
        entries: &[(u32, Self::Buffer)],
    ) -> Result<Self::BindGroup> {
        if entries.len() != layout.entries.len() {
            return Err(CoreError::Backend(format!(
                "bind group has {} entries, layout has {}",
                entries.len(),
                layout.entries.len()
            )));
        }
        Ok(SoftwareBindGroup {
            entries: entries.to_vec(),
        })
    }

    fn create_query_set(&self, _label: Option<&str>, capacity: u32) -> Result<Self::QuerySet> {
        Ok(SoftwareQuerySet {
            slots: Arc::new(Mutex::new(vec![0; capacity as usize])),
        })
    }

    fn submit(&self, commands: Vec<Command<Self>>) -> Result<Self::Submission> {
        self.check_live()?;
        let countdown = self.shared.fail_submission_in.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |n| n.checked_sub(1),
        );
        if countdown == Ok(1) {
            return Err(CoreError::Backend("injected submission failure".to_string()));
        }
        let index = self.submitted.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.pending).push_back(Pending::Batch { index, commands });
        Ok(SoftwareSubmission(index))
    }

    fn poll(&self) -> Result<()> {
        self.run_all()
    }

    fn is_retired(&self, submission: &Self::Submission) -> bool {
        self.retired.load(Ordering::SeqCst) >= submission.0
    }

    async fn wait(&self, submission: &Self::Submission) -> Result<()> {
        self.run_until(submission.0)?;
        if self.is_retired(submission) {
            Ok(())
        } else {
            Err(CoreError::Backend(format!(
                "software submission {} never retired",
                submission.0
            )))
        }
    }

    fn timestamp_period(&self) -> f32 {
        self.period_ns
    }

    fn destroy(&self) {
        self.core.lose(LossReason::Destroyed, "software device destroyed");
    }
}
