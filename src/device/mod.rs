//! Device enumeration with cached device sets, default tracking and hotplug listeners.
//!
//! A [`DeviceManager`] sits on top of one [`DeviceBackend`]. Device sets are enumerated on
//! first access and then kept current from the backend's platform events, one record at a
//! time. Listeners are held weakly and pruned when they expire.

/// Platform backend contract and the virtual backend.
pub mod backend;
/// ALSA through cpal plus V4L2.
#[cfg(target_os = "linux")]
pub mod linux;
/// CoreAudio HAL.
#[cfg(target_os = "macos")]
pub mod macos;

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{BridgeError, Result};
use crate::mirror::{
    DEVICE_CHANGE_LISTENER, ManagedObject, ManagedObjectMirror, ManagedRuntime, ManagedValue,
    ON_DEVICE_CONNECTED, ON_DEVICE_DISCONNECTED,
};
use crate::video::FourCC;

pub use backend::{DeviceBackend, VirtualBackend, WatchHandle, platform_backend};

/// Direction and media type of a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceKind {
    /// Microphones and line inputs.
    AudioCapture,
    /// Speakers and headsets.
    AudioRender,
    /// Cameras.
    VideoCapture,
}

impl DeviceKind {
    /// Every kind, in display order.
    pub const ALL: [DeviceKind; 3] = [
        DeviceKind::AudioCapture,
        DeviceKind::AudioRender,
        DeviceKind::VideoCapture,
    ];

    /// Human readable name.
    pub fn label(self) -> &'static str {
        match self {
            DeviceKind::AudioCapture => "audio capture",
            DeviceKind::AudioRender => "audio render",
            DeviceKind::VideoCapture => "video capture",
        }
    }
}

/// A frame size and rate a capture device can deliver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VideoCaptureCapability {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Highest frame rate.
    pub max_fps: u32,
    /// Pixel layout delivered.
    pub fourcc: FourCC,
}

/// A capture or render device. Identity is the descriptor.
#[derive(Clone, Debug)]
pub struct DeviceRecord {
    /// Display name.
    pub name: String,
    /// Stable platform identifier.
    pub descriptor: String,
    /// Direction and media type.
    pub kind: DeviceKind,
    /// Formats a camera can deliver; empty for audio.
    pub capabilities: Vec<VideoCaptureCapability>,
}

impl DeviceRecord {
    /// Record without capabilities.
    pub fn new(kind: DeviceKind, name: impl Into<String>, descriptor: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            descriptor: descriptor.into(),
            kind,
            capabilities: Vec::new(),
        }
    }

    /// Attach capture capabilities.
    pub fn with_capabilities(mut self, capabilities: Vec<VideoCaptureCapability>) -> Self {
        self.capabilities = capabilities;
        self
    }
}

impl PartialEq for DeviceRecord {
    fn eq(&self, other: &Self) -> bool {
        self.descriptor == other.descriptor
    }
}

impl Eq for DeviceRecord {}

impl Hash for DeviceRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.descriptor.hash(state);
    }
}

impl PartialOrd for DeviceRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DeviceRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.descriptor.cmp(&other.descriptor)
    }
}

impl fmt::Display for DeviceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.name, self.descriptor)
    }
}

/// Notification emitted by a platform backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlatformEvent {
    /// A device appeared.
    Added(DeviceRecord),
    /// A device disappeared.
    Removed {
        /// Kind of the removed device.
        kind: DeviceKind,
        /// Descriptor of the removed device.
        descriptor: String,
    },
    /// The default of `kind` may have changed.
    DefaultChanged {
        /// Device kind whose default may have changed.
        kind: DeviceKind,
    },
    /// A device changed state without joining or leaving.
    StateChanged {
        /// Kind of the device that changed state.
        kind: DeviceKind,
        /// Descriptor of the device that changed state.
        descriptor: String,
    },
}

/// Connection event delivered to listeners.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The device appeared.
    Connected,
    /// The device disappeared.
    Disconnected,
}

/// Subscriber to device hotplug events. Held weakly by the manager.
pub trait HotplugListener: Send + Sync {
    /// `device` was connected.
    fn device_connected(&self, device: &DeviceRecord) -> Result<()>;
    /// `device` was disconnected.
    fn device_disconnected(&self, device: &DeviceRecord) -> Result<()>;
}

#[derive(Default)]
struct KindCache {
    populated: bool,
    devices: BTreeMap<String, DeviceRecord>,
    default: Option<DeviceRecord>,
}

/// Cached device sets for one backend.
pub struct DeviceManager {
    backend: Arc<dyn DeviceBackend>,
    caches: Mutex<HashMap<DeviceKind, KindCache>>,
    listeners: Mutex<Vec<Weak<dyn HotplugListener>>>,
    events: Receiver<PlatformEvent>,
    _watch: Option<WatchHandle>,
}

impl DeviceManager {
    /// Create a manager and subscribe to the backend's platform events. A backend that
    /// cannot watch is still usable for enumeration.
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Self {
        let (sender, events): (Sender<PlatformEvent>, _) = unbounded();
        let watch = match backend.watch(sender) {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!(backend = backend.name(), %err, "hotplug notifications unavailable");
                None
            }
        };
        Self {
            backend,
            caches: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            events,
            _watch: watch,
        }
    }

    /// Name of the backend.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Devices of `kind`, enumerating on first access.
    pub fn devices(&self, kind: DeviceKind) -> Result<Vec<DeviceRecord>> {
        let mut caches = self.caches.lock();
        let cache = self.populated(&mut caches, kind)?;
        Ok(cache.devices.values().cloned().collect())
    }

    /// Current default of `kind`, if the platform names one that is present.
    pub fn default_device(&self, kind: DeviceKind) -> Result<Option<DeviceRecord>> {
        let mut caches = self.caches.lock();
        let cache = self.populated(&mut caches, kind)?;
        Ok(cache.default.clone())
    }

    fn populated<'a>(
        &self,
        caches: &'a mut HashMap<DeviceKind, KindCache>,
        kind: DeviceKind,
    ) -> Result<&'a mut KindCache> {
        let cache = caches.entry(kind).or_default();
        if !cache.populated {
            let devices = self.backend.enumerate(kind)?;
            debug!(kind = kind.label(), count = devices.len(), "devices enumerated");
            cache.devices = devices
                .into_iter()
                .map(|device| (device.descriptor.clone(), device))
                .collect();
            cache.populated = true;
            self.refresh_default(kind, cache);
        }
        Ok(cache)
    }

    fn refresh_default(&self, kind: DeviceKind, cache: &mut KindCache) {
        let descriptor = match self.backend.default_descriptor(kind) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                warn!(kind = kind.label(), %err, "default device query failed");
                None
            }
        };
        let next = descriptor.and_then(|d| cache.devices.get(&d).cloned());
        if next.as_ref().map(|d| &d.descriptor) != cache.default.as_ref().map(|d| &d.descriptor) {
            info!(
                kind = kind.label(),
                default = next.as_ref().map(|d| d.descriptor.as_str()).unwrap_or("none"),
                "default device changed"
            );
        }
        cache.default = next;
    }

    /// Apply one platform event to the caches and notify listeners.
    pub fn handle_platform_event(&self, event: PlatformEvent) {
        let notification = {
            let mut caches = self.caches.lock();
            match event {
                PlatformEvent::Added(device) => {
                    let cache = caches.entry(device.kind).or_default();
                    if cache.populated {
                        cache.devices.insert(device.descriptor.clone(), device.clone());
                        self.refresh_default(device.kind, cache);
                    }
                    Some((device, DeviceEvent::Connected))
                }
                PlatformEvent::Removed { kind, descriptor } => {
                    let cache = caches.entry(kind).or_default();
                    let removed = cache.devices.remove(&descriptor);
                    if cache.populated {
                        self.refresh_default(kind, cache);
                    }
                    let device = removed.unwrap_or_else(|| {
                        DeviceRecord::new(kind, descriptor.clone(), descriptor)
                    });
                    Some((device, DeviceEvent::Disconnected))
                }
                PlatformEvent::DefaultChanged { kind }
                | PlatformEvent::StateChanged { kind, .. } => {
                    let cache = caches.entry(kind).or_default();
                    if cache.populated {
                        self.refresh_default(kind, cache);
                    }
                    None
                }
            }
        };

        if let Some((device, event)) = notification {
            self.notify_listeners(&device, event);
        }
    }

    /// Apply every queued platform event on the calling thread.
    pub fn dispatch_pending(&self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events.try_recv() {
            self.handle_platform_event(event);
            handled += 1;
        }
        handled
    }

    /// Apply platform events on a dedicated thread until the backend stops or the manager
    /// is dropped.
    pub fn spawn_dispatcher(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let events = self.events.clone();
        let manager = Arc::downgrade(self);
        thread::Builder::new()
            .name("device-hotplug".into())
            .spawn(move || {
                while let Ok(event) = events.recv() {
                    let Some(manager) = manager.upgrade() else {
                        break;
                    };
                    manager.handle_platform_event(event);
                }
                debug!("hotplug dispatcher stopped");
            })
            .map_err(|err| BridgeError::platform("thread spawn", err.to_string()))
    }

    /// Notify `listener` of hotplug events until it drops or is detached.
    pub fn attach_hotplug_listener(&self, listener: &Arc<dyn HotplugListener>) {
        self.listeners.lock().push(Arc::downgrade(listener));
    }

    /// Stop notifying `listener`.
    pub fn detach_hotplug_listener(&self, listener: &Arc<dyn HotplugListener>) {
        let target = Arc::as_ptr(listener) as *const ();
        self.listeners
            .lock()
            .retain(|weak| weak.as_ptr() as *const () != target);
    }

    /// Listeners still registered, expired ones included until the next notification.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    fn notify_listeners(&self, device: &DeviceRecord, event: DeviceEvent) {
        let live: Vec<Arc<dyn HotplugListener>> = {
            let mut listeners = self.listeners.lock();
            listeners.retain(|weak| weak.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };

        for listener in live {
            let outcome = catch_unwind(AssertUnwindSafe(|| match event {
                DeviceEvent::Connected => listener.device_connected(device),
                DeviceEvent::Disconnected => listener.device_disconnected(device),
            }));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(%err, device = %device, "hotplug listener failed"),
                Err(_) => error!(device = %device, "hotplug listener panicked"),
            }
        }
    }
}

/// Audio view of a [`DeviceManager`].
#[derive(Clone)]
pub struct AudioDeviceManager(Arc<DeviceManager>);

impl AudioDeviceManager {
    /// Audio view over `manager`.
    pub fn new(manager: Arc<DeviceManager>) -> Self {
        Self(manager)
    }

    /// Microphones and line inputs.
    pub fn list_capture_devices(&self) -> Result<Vec<DeviceRecord>> {
        self.0.devices(DeviceKind::AudioCapture)
    }

    /// Speakers and headsets.
    pub fn list_render_devices(&self) -> Result<Vec<DeviceRecord>> {
        self.0.devices(DeviceKind::AudioRender)
    }

    /// Default capture device.
    pub fn default_capture_device(&self) -> Result<Option<DeviceRecord>> {
        self.0.default_device(DeviceKind::AudioCapture)
    }

    /// Default render device.
    pub fn default_render_device(&self) -> Result<Option<DeviceRecord>> {
        self.0.default_device(DeviceKind::AudioRender)
    }

    /// See [`DeviceManager::attach_hotplug_listener`].
    pub fn attach_hotplug_listener(&self, listener: &Arc<dyn HotplugListener>) {
        self.0.attach_hotplug_listener(listener);
    }

    /// See [`DeviceManager::detach_hotplug_listener`].
    pub fn detach_hotplug_listener(&self, listener: &Arc<dyn HotplugListener>) {
        self.0.detach_hotplug_listener(listener);
    }
}

/// Video view of a [`DeviceManager`].
#[derive(Clone)]
pub struct VideoDeviceManager(Arc<DeviceManager>);

impl VideoDeviceManager {
    /// Video view over `manager`.
    pub fn new(manager: Arc<DeviceManager>) -> Self {
        Self(manager)
    }

    /// Cameras.
    pub fn list_capture_devices(&self) -> Result<Vec<DeviceRecord>> {
        self.0.devices(DeviceKind::VideoCapture)
    }

    /// Default camera.
    pub fn default_capture_device(&self) -> Result<Option<DeviceRecord>> {
        self.0.default_device(DeviceKind::VideoCapture)
    }

    /// See [`DeviceManager::attach_hotplug_listener`].
    pub fn attach_hotplug_listener(&self, listener: &Arc<dyn HotplugListener>) {
        self.0.attach_hotplug_listener(listener);
    }

    /// See [`DeviceManager::detach_hotplug_listener`].
    pub fn detach_hotplug_listener(&self, listener: &Arc<dyn HotplugListener>) {
        self.0.detach_hotplug_listener(listener);
    }
}

static MEDIA_DEVICES: Lazy<Arc<DeviceManager>> = Lazy::new(|| {
    let manager = Arc::new(DeviceManager::new(platform_backend()));
    if let Err(err) = manager.spawn_dispatcher() {
        error!(%err, "hotplug events will not be dispatched");
    }
    manager
});

/// Process-wide manager over the platform backend, dispatching hotplug events in the
/// background.
pub fn media_devices() -> &'static Arc<DeviceManager> {
    &MEDIA_DEVICES
}

/// Hotplug listener forwarding to a managed `DeviceChangeListener`.
pub struct ManagedHotplugListener {
    mirror: ManagedObjectMirror,
}

impl ManagedHotplugListener {
    /// Resolve the managed listener's entry points. Fails if any is missing.
    pub fn new(runtime: Arc<dyn ManagedRuntime>, listener: Arc<dyn ManagedObject>) -> Result<Self> {
        Ok(Self {
            mirror: ManagedObjectMirror::new(runtime, listener, &DEVICE_CHANGE_LISTENER)?,
        })
    }
}

impl HotplugListener for ManagedHotplugListener {
    fn device_connected(&self, device: &DeviceRecord) -> Result<()> {
        self.mirror
            .invoke(ON_DEVICE_CONNECTED, &[ManagedValue::Str(device.descriptor.clone())])
            .map(|_| ())
    }

    fn device_disconnected(&self, device: &DeviceRecord) -> Result<()> {
        self.mirror
            .invoke(ON_DEVICE_DISCONNECTED, &[ManagedValue::Str(device.descriptor.clone())])
            .map(|_| ())
    }
}
