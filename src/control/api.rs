use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::clock::monotonic_timestamp_ns;
use crate::device::{DeviceEvent, DeviceKind, DeviceManager, DeviceRecord, HotplugListener};
use crate::error::Result;

/// Devices and default of one kind at the time of the snapshot.
#[derive(Clone, Debug)]
pub struct KindStatus {
    /// Kind described.
    pub kind: DeviceKind,
    /// Devices present.
    pub devices: Vec<DeviceRecord>,
    /// Current default, if any.
    pub default: Option<DeviceRecord>,
    /// Enumeration failure for this kind, if any.
    pub error: Option<String>,
}

/// Everything the console shows about a device manager.
#[derive(Clone, Debug)]
pub struct DeviceStatus {
    /// Name of the platform backend.
    pub backend: &'static str,
    /// One entry per device kind.
    pub kinds: Vec<KindStatus>,
    /// Registered hotplug listeners.
    pub listeners: usize,
}

/// Snapshot `manager`. A failing kind is reported in its entry rather than aborting.
pub fn get_status(manager: &DeviceManager) -> DeviceStatus {
    let kinds = DeviceKind::ALL
        .into_iter()
        .map(|kind| {
            let listed = manager
                .devices(kind)
                .and_then(|devices| manager.default_device(kind).map(|default| (devices, default)));
            match listed {
                Ok((devices, default)) => KindStatus {
                    kind,
                    devices,
                    default,
                    error: None,
                },
                Err(err) => KindStatus {
                    kind,
                    devices: Vec::new(),
                    default: None,
                    error: Some(err.to_string()),
                },
            }
        })
        .collect();
    DeviceStatus {
        backend: manager.backend_name(),
        kinds,
        listeners: manager.listener_count(),
    }
}

/// One hotplug notification as recorded by [`HotplugLog`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HotplugEntry {
    /// Monotonic time of the notification.
    pub timestamp_ns: u64,
    /// Connection or disconnection.
    pub event: DeviceEvent,
    /// Device concerned.
    pub device: DeviceRecord,
}

/// Listener keeping the most recent hotplug notifications.
pub struct HotplugLog {
    entries: Mutex<VecDeque<HotplugEntry>>,
    capacity: usize,
}

impl HotplugLog {
    /// Empty log keeping at most `capacity` entries.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        })
    }

    /// Subscribe a new log to `manager`. The manager only holds it weakly.
    pub fn attach(manager: &DeviceManager, capacity: usize) -> Arc<Self> {
        let log = Self::new(capacity);
        let listener: Arc<dyn HotplugListener> = log.clone();
        manager.attach_hotplug_listener(&listener);
        log
    }

    /// Entries oldest first.
    pub fn entries(&self) -> Vec<HotplugEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    fn record(&self, event: DeviceEvent, device: &DeviceRecord) {
        let mut entries = self.entries.lock();
        entries.push_back(HotplugEntry {
            timestamp_ns: monotonic_timestamp_ns(),
            event,
            device: device.clone(),
        });
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }
}

impl HotplugListener for HotplugLog {
    fn device_connected(&self, device: &DeviceRecord) -> Result<()> {
        self.record(DeviceEvent::Connected, device);
        Ok(())
    }

    fn device_disconnected(&self, device: &DeviceRecord) -> Result<()> {
        self.record(DeviceEvent::Disconnected, device);
        Ok(())
    }
}
