//! Device session - acquisition, liveness and loss recovery.

use std::fmt;
use std::sync::mpsc;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use super::error::{CoreError, ResourceKind, Result};
use crate::backend::{Backend, DeviceBackend, DeviceLost, LossEvents, LossReason};
use crate::schema::{Capability, CapabilitySet, LimitRequest, PowerPreference};

/// Numeric resource limits of an adapter or device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLimits {
    pub max_buffer_size: u64,
    pub max_storage_buffer_binding_size: u64,
    pub max_compute_workgroups_per_dimension: u32,
}

impl DeviceLimits {
    /// Limits every WebGPU device provides without asking.
    pub const WEBGPU_DEFAULT: DeviceLimits = DeviceLimits {
        max_buffer_size: 256 * 1024 * 1024,
        max_storage_buffer_binding_size: 128 * 1024 * 1024,
        max_compute_workgroups_per_dimension: 65535,
    };

    /// Resolve requested limits against what this adapter offers.
    ///
    /// Requested values are granted exactly or the whole request fails.
    /// Unrequested values get the WebGPU default capped at the adapter.
    pub fn grant(&self, request: &LimitRequest) -> Result<DeviceLimits> {
        let defaults = DeviceLimits::WEBGPU_DEFAULT;
        Ok(DeviceLimits {
            max_buffer_size: pick(
                "max_buffer_size",
                request.max_buffer_size,
                defaults.max_buffer_size,
                self.max_buffer_size,
            )?,
            max_storage_buffer_binding_size: pick(
                "max_storage_buffer_binding_size",
                request.max_storage_buffer_binding_size,
                defaults.max_storage_buffer_binding_size,
                self.max_storage_buffer_binding_size,
            )?,
            max_compute_workgroups_per_dimension: pick(
                "max_compute_workgroups_per_dimension",
                request.max_compute_workgroups_per_dimension,
                defaults.max_compute_workgroups_per_dimension,
                self.max_compute_workgroups_per_dimension,
            )?,
        })
    }
}

fn pick<T: Ord + Copy + fmt::Display>(
    name: &str,
    requested: Option<T>,
    default: T,
    available: T,
) -> Result<T> {
    match requested {
        Some(value) if value > available => Err(CoreError::CapabilityUnsupported {
            name: name.to_string(),
            requested: value.to_string(),
            available: available.to_string(),
        }),
        Some(value) => Ok(value),
        None => Ok(default.min(available)),
    }
}

/// Capability/limit negotiation table for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRequest {
    pub label: String,
    pub power_preference: PowerPreference,
    pub capabilities: CapabilitySet,
    pub limits: LimitRequest,
}

impl Default for DeviceRequest {
    fn default() -> Self {
        Self {
            label: "gpu-compute".to_string(),
            power_preference: PowerPreference::HighPerformance,
            capabilities: CapabilitySet::new(),
            limits: LimitRequest::default(),
        }
    }
}

impl DeviceRequest {
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    pub fn with_limits(mut self, limits: LimitRequest) -> Self {
        self.limits = limits;
        self
    }
}

/// What was actually granted, echoed back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub adapter: String,
    pub generation: u64,
    pub capabilities: CapabilitySet,
    pub limits: DeviceLimits,
    pub timestamp_period: f32,
}

/// One logical connection to a GPU.
pub struct Device<D: DeviceBackend> {
    raw: D,
    info: DeviceInfo,
    lost: Option<DeviceLost>,
    next_resource_id: u64,
}

impl<D: DeviceBackend> Device<D> {
    fn new(raw: D, adapter: String, generation: u64, capabilities: CapabilitySet, limits: DeviceLimits) -> Self {
        let timestamp_period = raw.timestamp_period();
        Self {
            raw,
            info: DeviceInfo {
                adapter,
                generation,
                capabilities,
                limits,
                timestamp_period,
            },
            lost: None,
            next_resource_id: 0,
        }
    }

    #[inline]
    pub fn raw(&self) -> &D {
        &self.raw
    }

    #[inline]
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.info.generation
    }

    #[inline]
    pub fn limits(&self) -> &DeviceLimits {
        &self.info.limits
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        self.lost.is_none()
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.info.capabilities.contains(&capability)
    }

    pub(crate) fn require(&self, capability: Capability) -> Result<()> {
        if self.has_capability(capability) {
            Ok(())
        } else {
            Err(CoreError::capability(capability))
        }
    }

    /// Fail with `StaleResource` unless `generation` is this live device.
    pub(crate) fn ensure_current(&self, generation: u64, resource: ResourceKind) -> Result<()> {
        if self.lost.is_some() || generation != self.info.generation {
            return Err(CoreError::StaleResource {
                resource,
                generation,
            });
        }
        Ok(())
    }

    pub(crate) fn next_id(&mut self) -> u64 {
        self.next_resource_id += 1;
        self.next_resource_id
    }

    fn mark_lost(&mut self, lost: DeviceLost) {
        if self.lost.is_none() {
            self.lost = Some(lost);
        }
    }
}

impl<D: DeviceBackend> fmt::Debug for Device<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("info", &self.info)
            .field("lost", &self.lost)
            .finish()
    }
}

/// Notification fanned out to session subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The device was lost; resources created on it are stale.
    Lost(DeviceLost),
    /// A replacement device was acquired.
    Restored(DeviceInfo),
    /// Re-acquisition failed; the session is unusable.
    Failed(CoreError),
}

/// Result of one supervisor step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorOutcome {
    /// Device is live, nothing to do.
    Healthy,
    /// Device was lost and one re-acquisition succeeded.
    Recovered { generation: u64 },
    /// Device was released on purpose; no retry happens.
    Destroyed,
}

#[derive(Debug, Clone)]
enum SessionState {
    Live,
    Lost(DeviceLost),
    Destroyed,
    Failed(CoreError),
}

/// Owns the logical device and recovers it after transient loss.
pub struct DeviceSession<B: Backend> {
    backend: B,
    request: DeviceRequest,
    device: Device<B::Device>,
    loss_events: LossEvents,
    state: SessionState,
    subscribers: Vec<mpsc::Sender<SessionEvent>>,
}

impl<B: Backend> DeviceSession<B> {
    /// Negotiate a device with the adapter.
    ///
    /// Every requested capability and limit is checked against the adapter
    /// before the device is requested; anything unsupported fails the whole
    /// acquisition.
    pub async fn acquire(mut backend: B, request: DeviceRequest) -> Result<Self> {
        let (device, loss_events) = negotiate(&mut backend, &request, 1).await?;
        info!(
            "Acquired {} device on {} (capabilities: {:?})",
            B::NAME,
            device.info.adapter,
            device.info.capabilities
        );
        Ok(Self {
            backend,
            request,
            device,
            loss_events,
            state: SessionState::Live,
            subscribers: Vec::new(),
        })
    }

    /// Current device, after draining pending loss notifications.
    ///
    /// A lost device is still returned so that operations on it report
    /// `StaleResource`; only a failed re-acquisition is an error here.
    pub fn device(&mut self) -> Result<&mut Device<B::Device>> {
        self.drain_loss_events();
        if let SessionState::Failed(e) = &self.state {
            return Err(e.clone());
        }
        Ok(&mut self.device)
    }

    /// Granted capabilities and limits of the current device.
    pub fn info(&self) -> &DeviceInfo {
        &self.device.info
    }

    pub fn request(&self) -> &DeviceRequest {
        &self.request
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Whether the current device is usable.
    pub fn is_live(&mut self) -> bool {
        self.drain_loss_events();
        matches!(self.state, SessionState::Live)
    }

    /// Register for loss/restore notifications.
    pub fn subscribe(&mut self) -> mpsc::Receiver<SessionEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    /// Release the device on purpose. No re-acquisition follows.
    ///
    /// A device already lost but not yet re-acquired is released as well, so
    /// the next supervisor step reports `Destroyed` instead of retrying.
    pub fn destroy(&mut self) {
        let was_live = match self.state {
            SessionState::Live => true,
            SessionState::Lost(_) => false,
            SessionState::Destroyed | SessionState::Failed(_) => return,
        };
        self.device.raw.destroy();
        let lost = DeviceLost {
            reason: LossReason::Destroyed,
            message: "device destroyed by owner".to_string(),
        };
        self.device.mark_lost(lost.clone());
        self.state = SessionState::Destroyed;
        if was_live {
            self.notify(SessionEvent::Lost(lost));
        }
        // The backend's own notification for this device is now redundant.
        while self.loss_events.try_recv().is_ok() {}
    }

    /// One supervisor step: consume the loss event and, for a loss that was
    /// not intentional, attempt exactly one re-acquisition with the original
    /// request.
    pub async fn supervise(&mut self) -> Result<SupervisorOutcome> {
        self.drain_loss_events();
        let lost = match &self.state {
            SessionState::Live => return Ok(SupervisorOutcome::Healthy),
            SessionState::Destroyed => return Ok(SupervisorOutcome::Destroyed),
            SessionState::Failed(e) => return Err(e.clone()),
            SessionState::Lost(lost) => lost.clone(),
        };

        let generation = self.device.info.generation + 1;
        warn!(
            "Device lost ({}), re-acquiring as generation {}",
            lost.message, generation
        );
        match negotiate(&mut self.backend, &self.request, generation).await {
            Ok((device, loss_events)) => {
                self.device = device;
                self.loss_events = loss_events;
                self.state = SessionState::Live;
                info!("Device restored as generation {}", generation);
                self.notify(SessionEvent::Restored(self.device.info.clone()));
                Ok(SupervisorOutcome::Recovered { generation })
            }
            Err(e) => {
                error!("Device re-acquisition failed: {}", e);
                self.state = SessionState::Failed(e.clone());
                self.notify(SessionEvent::Failed(e.clone()));
                Err(e)
            }
        }
    }

    fn drain_loss_events(&mut self) {
        while let Ok(lost) = self.loss_events.try_recv() {
            if !matches!(self.state, SessionState::Live) {
                continue;
            }
            warn!("Device generation {} lost: {}", self.device.info.generation, lost.message);
            self.device.mark_lost(lost.clone());
            self.state = match lost.reason {
                LossReason::Destroyed => SessionState::Destroyed,
                LossReason::Unknown => SessionState::Lost(lost.clone()),
            };
            self.notify(SessionEvent::Lost(lost));
        }
    }

    fn notify(&mut self, event: SessionEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

async fn negotiate<B: Backend>(
    backend: &mut B,
    request: &DeviceRequest,
    generation: u64,
) -> Result<(Device<B::Device>, LossEvents)> {
    let adapter = backend.request_adapter(request.power_preference).await?;
    debug!("Adapter {}: {:?}", adapter.name, adapter.limits);

    for &capability in &request.capabilities {
        if !adapter.capabilities.contains(&capability) {
            return Err(CoreError::capability(capability));
        }
    }
    let limits = adapter.limits.grant(&request.limits)?;

    let (raw, loss_events) = backend
        .request_device(&request.label, &request.capabilities, &limits)
        .await?;
    let device = Device::new(
        raw,
        adapter.name,
        generation,
        request.capabilities.clone(),
        limits,
    );
    Ok((device, loss_events))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftwareBackend;
    use crate::schema::SoftwareProfile;

    fn acquire(backend: SoftwareBackend, request: DeviceRequest) -> Result<DeviceSession<SoftwareBackend>> {
        pollster::block_on(DeviceSession::acquire(backend, request))
    }

    #[test]
    fn test_grant_defaults_capped_by_adapter() {
        let adapter = DeviceLimits {
            max_buffer_size: 1024,
            ..DeviceLimits::WEBGPU_DEFAULT
        };
        let granted = adapter.grant(&LimitRequest::default()).unwrap();
        assert_eq!(granted.max_buffer_size, 1024);
        assert_eq!(
            granted.max_compute_workgroups_per_dimension,
            DeviceLimits::WEBGPU_DEFAULT.max_compute_workgroups_per_dimension
        );
    }

    #[test]
    fn test_grant_rejects_excessive_request() {
        let request = LimitRequest {
            max_buffer_size: Some(4_294_967_292),
            ..Default::default()
        };
        let err = DeviceLimits::WEBGPU_DEFAULT.grant(&request).unwrap_err();
        match err {
            CoreError::CapabilityUnsupported {
                name,
                requested,
                available,
            } => {
                assert_eq!(name, "max_buffer_size");
                assert_eq!(requested, "4294967292");
                assert_eq!(available, (256u64 * 1024 * 1024).to_string());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_acquire_echoes_granted_capabilities() {
        let request = DeviceRequest::default().with_capability(Capability::TimestampQuery);
        let mut session = acquire(SoftwareBackend::new(), request).unwrap();
        let device = session.device().unwrap();
        assert!(device.has_capability(Capability::TimestampQuery));
        assert!(!device.has_capability(Capability::ShaderF16));
        assert_eq!(device.generation(), 1);
    }

    #[test]
    fn test_acquire_fails_on_unsupported_capability() {
        let backend = SoftwareBackend::with_profile(SoftwareProfile {
            capabilities: vec![Capability::TimestampQuery],
            ..Default::default()
        });
        let remote = backend.clone();
        let request = DeviceRequest::default().with_capability(Capability::ShaderF16);
        let err = acquire(backend, request).err().unwrap();
        assert_eq!(err, CoreError::capability(Capability::ShaderF16));
        // Validation happens before the device request.
        assert_eq!(remote.device_requests(), 0);
    }

    #[test]
    fn test_acquire_fails_without_adapter() {
        let backend = SoftwareBackend::with_profile(SoftwareProfile {
            adapter_available: false,
            ..Default::default()
        });
        let err = acquire(backend, DeviceRequest::default()).err().unwrap();
        assert_eq!(err, CoreError::AdapterUnavailable);
    }

    #[test]
    fn test_transient_loss_reacquires_once() {
        let backend = SoftwareBackend::new();
        let remote = backend.clone();
        let mut session = acquire(backend, DeviceRequest::default()).unwrap();
        let events = session.subscribe();
        assert_eq!(remote.device_requests(), 1);

        assert!(remote.loss_trigger().lose(LossReason::Unknown, "driver reset"));
        assert!(!session.is_live());

        let outcome = pollster::block_on(session.supervise()).unwrap();
        assert_eq!(outcome, SupervisorOutcome::Recovered { generation: 2 });
        assert_eq!(remote.device_requests(), 2);
        assert!(session.is_live());

        // A second supervisor step has nothing to do.
        let outcome = pollster::block_on(session.supervise()).unwrap();
        assert_eq!(outcome, SupervisorOutcome::Healthy);
        assert_eq!(remote.device_requests(), 2);

        assert!(matches!(events.try_recv(), Ok(SessionEvent::Lost(_))));
        match events.try_recv() {
            Ok(SessionEvent::Restored(info)) => assert_eq!(info.generation, 2),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_intentional_destroy_never_retries() {
        let backend = SoftwareBackend::new();
        let remote = backend.clone();
        let mut session = acquire(backend, DeviceRequest::default()).unwrap();

        session.destroy();
        let outcome = pollster::block_on(session.supervise()).unwrap();
        assert_eq!(outcome, SupervisorOutcome::Destroyed);
        assert_eq!(remote.device_requests(), 1);

        let device = session.device().unwrap();
        assert!(!device.is_live());
        assert!(
            device
                .ensure_current(1, ResourceKind::Device)
                .unwrap_err()
                .is_stale()
        );
    }

    #[test]
    fn test_destroy_after_transient_loss_never_retries() {
        let backend = SoftwareBackend::new();
        let remote = backend.clone();
        let mut session = acquire(backend, DeviceRequest::default()).unwrap();
        let events = session.subscribe();

        remote.loss_trigger().lose(LossReason::Unknown, "driver reset");
        assert!(!session.is_live());
        session.destroy();

        let outcome = pollster::block_on(session.supervise()).unwrap();
        assert_eq!(outcome, SupervisorOutcome::Destroyed);
        assert_eq!(remote.device_requests(), 1);
        // Only the transient loss was announced.
        assert_eq!(events.try_iter().count(), 1);
    }

    #[test]
    fn test_external_destroy_reason_never_retries() {
        let backend = SoftwareBackend::new();
        let remote = backend.clone();
        let mut session = acquire(backend, DeviceRequest::default()).unwrap();

        remote.loss_trigger().lose(LossReason::Destroyed, "released");
        let outcome = pollster::block_on(session.supervise()).unwrap();
        assert_eq!(outcome, SupervisorOutcome::Destroyed);
        assert_eq!(remote.device_requests(), 1);
    }

    #[test]
    fn test_failed_retry_is_surfaced_to_later_calls() {
        let backend = SoftwareBackend::new();
        let remote = backend.clone();
        let mut session = acquire(backend, DeviceRequest::default()).unwrap();
        let events = session.subscribe();

        remote.fail_next_device_requests(5);
        remote.loss_trigger().lose(LossReason::Unknown, "gpu hang");

        let err = pollster::block_on(session.supervise()).unwrap_err();
        assert!(matches!(err, CoreError::DeviceRequest(_)));
        // Exactly one retry, even though more would fail too.
        assert_eq!(remote.device_requests(), 2);

        assert_eq!(session.device().unwrap_err(), err);
        assert_eq!(pollster::block_on(session.supervise()).unwrap_err(), err);
        assert_eq!(remote.device_requests(), 2);

        let received: Vec<_> = events.try_iter().collect();
        assert!(matches!(received.last(), Some(SessionEvent::Failed(_))));
    }
}
