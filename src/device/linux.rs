//! Linux backend: audio endpoints through cpal's default host, V4L2 capture devices from
//! sysfs. Hotplug is detected by polling and diffing snapshots.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait};
use crossbeam_channel::{Sender, bounded, select, tick};
use tracing::{debug, warn};

use super::backend::{DeviceBackend, WatchHandle, membership_changes};
use super::{DeviceKind, DeviceRecord, PlatformEvent};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};

const SYS_V4L: &str = "/sys/class/video4linux";

/// Source of audio endpoint names and the host's default per direction.
pub trait AudioEndpoints: Send + Sync {
    /// Endpoints of `kind`.
    fn devices(&self, kind: DeviceKind) -> Result<Vec<DeviceRecord>>;

    /// Descriptor of the host's default endpoint of `kind`.
    fn default_descriptor(&self, kind: DeviceKind) -> Result<Option<String>>;
}

/// Audio endpoints of cpal's default host (ALSA).
#[derive(Clone, Copy, Debug, Default)]
pub struct CpalEndpoints;

impl AudioEndpoints for CpalEndpoints {
    fn devices(&self, kind: DeviceKind) -> Result<Vec<DeviceRecord>> {
        let host = cpal::default_host();
        let devices: Vec<cpal::Device> = match kind {
            DeviceKind::AudioCapture => host.input_devices().map(Iterator::collect),
            DeviceKind::AudioRender => host.output_devices().map(Iterator::collect),
            DeviceKind::VideoCapture => return Ok(Vec::new()),
        }
        .map_err(|err| BridgeError::platform("cpal enumerate", err.to_string()))?;

        let mut records = Vec::new();
        for device in devices {
            match device.name() {
                Ok(name) => records.push(DeviceRecord::new(kind, name.clone(), name)),
                Err(err) => debug!(kind = kind.label(), %err, "skipping unnamed device"),
            }
        }
        Ok(records)
    }

    fn default_descriptor(&self, kind: DeviceKind) -> Result<Option<String>> {
        let host = cpal::default_host();
        let device = match kind {
            DeviceKind::AudioCapture => host.default_input_device(),
            DeviceKind::AudioRender => host.default_output_device(),
            DeviceKind::VideoCapture => None,
        };
        device
            .map(|device| device.name())
            .transpose()
            .map_err(|err| BridgeError::platform("cpal default device", err.to_string()))
    }
}

/// Device backend for Linux hosts.
#[derive(Clone)]
pub struct LinuxBackend {
    audio: Arc<dyn AudioEndpoints>,
    v4l_dir: PathBuf,
    poll_interval: Duration,
}

impl LinuxBackend {
    /// Backend over cpal's default host and `/sys/class/video4linux`.
    pub fn new() -> Self {
        Self::with_sources(
            Arc::new(CpalEndpoints),
            SYS_V4L,
            BridgeConfig::from_env().hotplug_poll_interval,
        )
    }

    /// Backend over explicit sources.
    pub fn with_sources(
        audio: Arc<dyn AudioEndpoints>,
        v4l_dir: impl Into<PathBuf>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            audio,
            v4l_dir: v4l_dir.into(),
            poll_interval,
        }
    }

    fn video_devices(&self) -> Result<Vec<DeviceRecord>> {
        let entries = match fs::read_dir(&self.v4l_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(BridgeError::platform("read video4linux", err.to_string())),
        };
        let mut numbered = Vec::new();
        for entry in entries.flatten() {
            let node = entry.file_name().to_string_lossy().into_owned();
            let Some(index) = node.strip_prefix("video").and_then(|n| n.parse::<u32>().ok()) else {
                continue;
            };
            let name = read_trimmed(&entry.path().join("name")).unwrap_or_else(|| node.clone());
            numbered.push((
                index,
                DeviceRecord::new(DeviceKind::VideoCapture, name, format!("/dev/{node}")),
            ));
        }
        numbered.sort_by_key(|(index, _)| *index);
        Ok(numbered.into_iter().map(|(_, device)| device).collect())
    }

    fn snapshot_kind(&self, kind: DeviceKind) -> Result<KindSnapshot> {
        Ok(KindSnapshot {
            devices: self.enumerate(kind)?,
            default: self.default_descriptor(kind)?,
        })
    }

    /// Kinds that failed to enumerate are left out.
    fn snapshot(&self) -> Snapshot {
        DeviceKind::ALL
            .into_iter()
            .filter_map(|kind| match self.snapshot_kind(kind) {
                Ok(snapshot) => Some((kind, snapshot)),
                Err(err) => {
                    warn!(kind = kind.label(), %err, "hotplug poll failed");
                    None
                }
            })
            .collect()
    }
}

impl Default for LinuxBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl DeviceBackend for LinuxBackend {
    fn name(&self) -> &'static str {
        "linux"
    }

    fn enumerate(&self, kind: DeviceKind) -> Result<Vec<DeviceRecord>> {
        match kind {
            DeviceKind::AudioCapture | DeviceKind::AudioRender => self.audio.devices(kind),
            DeviceKind::VideoCapture => self.video_devices(),
        }
    }

    /// Audio defaults come from the sound server. V4L2 has no default, so the lowest
    /// numbered camera stands in for it.
    fn default_descriptor(&self, kind: DeviceKind) -> Result<Option<String>> {
        match kind {
            DeviceKind::AudioCapture | DeviceKind::AudioRender => {
                self.audio.default_descriptor(kind)
            }
            DeviceKind::VideoCapture => Ok(self
                .video_devices()?
                .into_iter()
                .next()
                .map(|device| device.descriptor)),
        }
    }

    fn watch(&self, events: Sender<PlatformEvent>) -> Result<WatchHandle> {
        let backend = self.clone();
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let ticker = tick(self.poll_interval);
        let mut tracker = SnapshotTracker::new(backend.snapshot());

        thread::Builder::new()
            .name("linux-hotplug".into())
            .spawn(move || {
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            let changes = tracker.observe(backend.snapshot());
                            if changes.into_iter().any(|event| events.send(event).is_err()) {
                                break;
                            }
                        }
                    }
                }
                debug!("linux hotplug watcher stopped");
            })
            .map_err(|err| BridgeError::platform("thread spawn", err.to_string()))?;

        Ok(WatchHandle::new(move || drop(stop_tx)))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct KindSnapshot {
    devices: Vec<DeviceRecord>,
    default: Option<String>,
}

type Snapshot = BTreeMap<DeviceKind, KindSnapshot>;

/// Last successful snapshot of every kind. A failed poll keeps the previous view, so the
/// next good poll reports everything that changed in between.
#[derive(Debug, Default)]
struct SnapshotTracker {
    last_good: Snapshot,
}

impl SnapshotTracker {
    fn new(initial: Snapshot) -> Self {
        Self { last_good: initial }
    }

    fn observe(&mut self, current: Snapshot) -> Vec<PlatformEvent> {
        let mut events = Vec::new();
        for (kind, now) in current {
            if let Some(before) = self.last_good.get(&kind) {
                events.extend(membership_changes(kind, &before.devices, &now.devices));
                if before.default != now.default {
                    events.push(PlatformEvent::DefaultChanged { kind });
                }
            }
            self.last_good.insert(kind, now);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static SCRATCH: AtomicUsize = AtomicUsize::new(0);

    /// Programmable sound server.
    #[derive(Default)]
    struct FakeEndpoints {
        capture: Mutex<Vec<&'static str>>,
        default_capture: Mutex<Option<&'static str>>,
        failing: Mutex<bool>,
    }

    impl AudioEndpoints for FakeEndpoints {
        fn devices(&self, kind: DeviceKind) -> Result<Vec<DeviceRecord>> {
            if *self.failing.lock() {
                return Err(BridgeError::platform("fake", "server gone"));
            }
            if kind != DeviceKind::AudioCapture {
                return Ok(Vec::new());
            }
            Ok(self
                .capture
                .lock()
                .iter()
                .map(|name| DeviceRecord::new(kind, *name, *name))
                .collect())
        }

        fn default_descriptor(&self, kind: DeviceKind) -> Result<Option<String>> {
            Ok(match kind {
                DeviceKind::AudioCapture => self.default_capture.lock().map(str::to_string),
                _ => None,
            })
        }
    }

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "media-bridge-linux-{}-{}",
            std::process::id(),
            SCRATCH.fetch_add(1, Ordering::SeqCst)
        ));
        fs::create_dir_all(dir.join("v4l")).expect("scratch dir");
        dir
    }

    fn add_camera(dir: &Path, index: u32, name: &str) {
        let node = dir.join("v4l").join(format!("video{index}"));
        fs::create_dir_all(&node).expect("node");
        fs::write(node.join("name"), format!("{name}\n")).expect("name");
    }

    #[test]
    fn audio_default_follows_the_sound_server() {
        let audio = Arc::new(FakeEndpoints::default());
        *audio.capture.lock() = vec!["hw:CARD=PCH,DEV=0", "hw:CARD=USB,DEV=0"];
        *audio.default_capture.lock() = Some("hw:CARD=USB,DEV=0");
        let backend = LinuxBackend::with_sources(audio, "/nonexistent/v4l", Duration::from_secs(1));

        let capture = backend.enumerate(DeviceKind::AudioCapture).expect("capture");
        assert_eq!(capture.len(), 2);
        assert_eq!(
            backend.default_descriptor(DeviceKind::AudioCapture).expect("default"),
            Some("hw:CARD=USB,DEV=0".into()),
            "the second card is the server default, not the first listed"
        );
    }

    #[test]
    fn missing_video_sysfs_enumerates_empty() {
        let backend = LinuxBackend::with_sources(
            Arc::new(FakeEndpoints::default()),
            "/nonexistent/media-bridge/v4l",
            Duration::from_secs(1),
        );
        assert!(backend.enumerate(DeviceKind::VideoCapture).expect("enumerate").is_empty());
        assert_eq!(backend.default_descriptor(DeviceKind::VideoCapture), Ok(None));
    }

    #[test]
    fn failed_poll_keeps_last_good_snapshot() {
        let audio = Arc::new(FakeEndpoints::default());
        *audio.capture.lock() = vec!["hw:CARD=PCH,DEV=0"];
        let backend =
            LinuxBackend::with_sources(audio.clone(), "/nonexistent/v4l", Duration::from_secs(1));
        let mut tracker = SnapshotTracker::new(backend.snapshot());

        *audio.failing.lock() = true;
        *audio.capture.lock() = vec!["hw:CARD=PCH,DEV=0", "hw:CARD=USB,DEV=0"];
        assert!(tracker.observe(backend.snapshot()).is_empty());

        *audio.failing.lock() = false;
        let events = tracker.observe(backend.snapshot());
        assert!(
            events
                .iter()
                .any(|e| matches!(e, PlatformEvent::Added(d) if d.descriptor == "hw:CARD=USB,DEV=0")),
            "device added during the failed poll is reported: {events:?}"
        );
    }

    #[test]
    fn poller_reports_camera_hotplug() {
        let dir = scratch_dir();
        add_camera(&dir, 2, "Side Cam");
        let backend = LinuxBackend::with_sources(
            Arc::new(FakeEndpoints::default()),
            dir.join("v4l"),
            Duration::from_millis(10),
        );
        let (tx, rx) = unbounded();
        let watch = backend.watch(tx).expect("watch");

        add_camera(&dir, 0, "Front Cam");
        let added = rx.recv_timeout(Duration::from_secs(5)).expect("added event");
        assert!(matches!(&added, PlatformEvent::Added(d) if d.descriptor == "/dev/video0" && d.name == "Front Cam"));
        let default = rx.recv_timeout(Duration::from_secs(5)).expect("default event");
        assert_eq!(default, PlatformEvent::DefaultChanged { kind: DeviceKind::VideoCapture });

        drop(watch);
        let _ = fs::remove_dir_all(dir);
    }
}
