//! Platform capability trait and the in-process virtual backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{DeviceKind, DeviceRecord, PlatformEvent};
use crate::error::{BridgeError, Result};

/// One operating-system device API.
pub trait DeviceBackend: Send + Sync {
    /// Backend name shown in diagnostics.
    fn name(&self) -> &'static str;

    /// Full enumeration of devices of `kind`.
    fn enumerate(&self, kind: DeviceKind) -> Result<Vec<DeviceRecord>>;

    /// Descriptor the platform currently designates as default for `kind`.
    fn default_descriptor(&self, kind: DeviceKind) -> Result<Option<String>>;

    /// Start forwarding platform notifications to `events` until the handle drops.
    fn watch(&self, events: Sender<PlatformEvent>) -> Result<WatchHandle>;
}

/// Keeps a platform subscription alive. Dropping it unsubscribes.
pub struct WatchHandle {
    stop: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl WatchHandle {
    /// Subscription torn down by running `stop`.
    pub fn new(stop: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            stop: Some(Box::new(stop)),
        }
    }

    /// A subscription with nothing to tear down.
    pub fn detached() -> Self {
        Self { stop: None }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

#[derive(Default)]
struct VirtualState {
    devices: BTreeMap<(DeviceKind, String), DeviceRecord>,
    defaults: HashMap<DeviceKind, String>,
    watchers: Vec<Sender<PlatformEvent>>,
}

impl VirtualState {
    fn emit(&mut self, event: PlatformEvent) {
        trace!(?event, "virtual device event");
        self.watchers.retain(|watcher| watcher.send(event.clone()).is_ok());
    }
}

/// Devices driven programmatically, for headless hosts and tests.
#[derive(Default)]
pub struct VirtualBackend {
    state: Mutex<VirtualState>,
    enumerations: AtomicUsize,
    fail_enumeration: AtomicBool,
}

impl VirtualBackend {
    /// Backend with no devices.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a device and announce it.
    pub fn plug(&self, device: DeviceRecord) {
        let mut state = self.state.lock();
        state
            .devices
            .insert((device.kind, device.descriptor.clone()), device.clone());
        state.emit(PlatformEvent::Added(device));
    }

    /// Disconnect a device. A disconnected default leaves the kind without a default.
    pub fn unplug(&self, kind: DeviceKind, descriptor: &str) {
        let mut state = self.state.lock();
        if state.devices.remove(&(kind, descriptor.to_string())).is_none() {
            return;
        }
        if state.defaults.get(&kind).map(String::as_str) == Some(descriptor) {
            state.defaults.remove(&kind);
        }
        state.emit(PlatformEvent::Removed {
            kind,
            descriptor: descriptor.to_string(),
        });
    }

    /// Designate the default of `kind` and announce it.
    pub fn set_default(&self, kind: DeviceKind, descriptor: Option<&str>) {
        let mut state = self.state.lock();
        match descriptor {
            Some(descriptor) => state.defaults.insert(kind, descriptor.to_string()),
            None => state.defaults.remove(&kind),
        };
        state.emit(PlatformEvent::DefaultChanged { kind });
    }

    /// Make subsequent enumerations fail with a platform error.
    pub fn fail_enumeration(&self, fail: bool) {
        self.fail_enumeration.store(fail, Ordering::Release);
    }

    /// Number of full enumerations served.
    pub fn enumerations(&self) -> usize {
        self.enumerations.load(Ordering::Acquire)
    }
}

impl DeviceBackend for VirtualBackend {
    fn name(&self) -> &'static str {
        "virtual"
    }

    fn enumerate(&self, kind: DeviceKind) -> Result<Vec<DeviceRecord>> {
        if self.fail_enumeration.load(Ordering::Acquire) {
            return Err(BridgeError::platform("virtual enumerate", "enumeration disabled"));
        }
        self.enumerations.fetch_add(1, Ordering::AcqRel);
        let state = self.state.lock();
        Ok(state
            .devices
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, device)| device.clone())
            .collect())
    }

    fn default_descriptor(&self, kind: DeviceKind) -> Result<Option<String>> {
        Ok(self.state.lock().defaults.get(&kind).cloned())
    }

    fn watch(&self, events: Sender<PlatformEvent>) -> Result<WatchHandle> {
        self.state.lock().watchers.push(events);
        debug!("virtual backend watcher registered");
        Ok(WatchHandle::detached())
    }
}

/// Added and Removed events turning `before` into `now`.
#[cfg_attr(not(any(target_os = "linux", target_os = "macos")), allow(dead_code))]
pub(crate) fn membership_changes(
    kind: DeviceKind,
    before: &[DeviceRecord],
    now: &[DeviceRecord],
) -> Vec<PlatformEvent> {
    let added = now
        .iter()
        .filter(|device| !before.contains(device))
        .map(|device| PlatformEvent::Added(device.clone()));
    let removed = before
        .iter()
        .filter(|device| !now.contains(device))
        .map(|device| PlatformEvent::Removed {
            kind,
            descriptor: device.descriptor.clone(),
        });
    added.chain(removed).collect()
}

/// Backend for the platform this crate was built for.
pub fn platform_backend() -> Arc<dyn DeviceBackend> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(super::linux::LinuxBackend::new())
    }
    #[cfg(target_os = "macos")]
    {
        Arc::new(super::macos::CoreAudioBackend::new())
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        Arc::new(VirtualBackend::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn virtual_backend_emits_events_per_change() {
        let backend = VirtualBackend::new();
        let (tx, rx) = unbounded();
        let _watch = backend.watch(tx).expect("watch");

        let cam = DeviceRecord::new(DeviceKind::VideoCapture, "Cam", "/dev/video0");
        backend.plug(cam.clone());
        backend.set_default(DeviceKind::VideoCapture, Some("/dev/video0"));
        backend.unplug(DeviceKind::VideoCapture, "/dev/video0");
        backend.unplug(DeviceKind::VideoCapture, "/dev/video0");

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![
                PlatformEvent::Added(cam),
                PlatformEvent::DefaultChanged {
                    kind: DeviceKind::VideoCapture
                },
                PlatformEvent::Removed {
                    kind: DeviceKind::VideoCapture,
                    descriptor: "/dev/video0".into()
                },
            ]
        );
        assert_eq!(
            backend.default_descriptor(DeviceKind::VideoCapture).expect("default"),
            None
        );
    }

    #[test]
    fn membership_changes_lists_additions_before_removals() {
        let a = DeviceRecord::new(DeviceKind::AudioRender, "A", "a");
        let b = DeviceRecord::new(DeviceKind::AudioRender, "B", "b");
        let c = DeviceRecord::new(DeviceKind::AudioRender, "C", "c");
        let events = membership_changes(
            DeviceKind::AudioRender,
            &[a.clone(), b],
            &[a, c.clone()],
        );
        assert_eq!(
            events,
            vec![
                PlatformEvent::Added(c),
                PlatformEvent::Removed {
                    kind: DeviceKind::AudioRender,
                    descriptor: "b".into()
                },
            ]
        );
    }

    #[test]
    fn watch_handle_runs_teardown_once() {
        let stopped = Arc::new(AtomicUsize::new(0));
        let counter = stopped.clone();
        drop(WatchHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }
}
