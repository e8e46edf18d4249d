use std::sync::Arc;

use parking_lot::Mutex;

use crate::control::api::{HotplugLog, get_status};
use crate::device::{
    AudioDeviceManager, DeviceEvent, DeviceKind, DeviceManager, DeviceRecord, HotplugListener,
    ManagedHotplugListener, VideoDeviceManager, VirtualBackend,
};
use crate::mirror::{DEVICE_CHANGE_LISTENER, DynamicObject, LocalRuntime, ManagedValue};

#[test]
fn managed_listener_follows_virtual_hotplug() {
    let backend = Arc::new(VirtualBackend::new());
    backend.plug(DeviceRecord::new(DeviceKind::AudioCapture, "Built-in Mic", "mic0"));
    backend.set_default(DeviceKind::AudioCapture, Some("mic0"));

    let manager = Arc::new(DeviceManager::new(backend.clone()));
    let audio = AudioDeviceManager::new(manager.clone());
    let video = VideoDeviceManager::new(manager.clone());
    assert_eq!(audio.list_capture_devices().expect("list").len(), 1);
    assert!(video.list_capture_devices().expect("list").is_empty());
    manager.dispatch_pending();

    let calls: Arc<Mutex<Vec<String>>> = Arc::default();
    let seen = calls.clone();
    let object = DynamicObject::builder("test.DeviceListener")
        .implement(&DEVICE_CHANGE_LISTENER, move |name, args| {
            if let ManagedValue::Str(descriptor) = &args[0] {
                seen.lock().push(format!("{name}:{descriptor}"));
            }
            Ok(ManagedValue::Void)
        })
        .build();
    let listener: Arc<dyn HotplugListener> = Arc::new(
        ManagedHotplugListener::new(Arc::new(LocalRuntime::new()), object).expect("listener"),
    );
    video.attach_hotplug_listener(&listener);
    let log = HotplugLog::attach(&manager, 8);

    backend.plug(DeviceRecord::new(DeviceKind::VideoCapture, "USB Camera", "/dev/video2"));
    backend.unplug(DeviceKind::AudioCapture, "mic0");
    manager.dispatch_pending();

    assert_eq!(
        *calls.lock(),
        vec![
            "deviceConnected:/dev/video2".to_string(),
            "deviceDisconnected:mic0".to_string(),
        ]
    );
    let events: Vec<_> = log.entries().into_iter().map(|e| e.event).collect();
    assert_eq!(events, vec![DeviceEvent::Connected, DeviceEvent::Disconnected]);

    assert_eq!(audio.default_capture_device().expect("default"), None);
    let status = get_status(&manager);
    assert_eq!(status.listeners, 2);
    assert_eq!(status.kinds[2].devices[0].name, "USB Camera");

    drop(listener);
    video.detach_hotplug_listener(&(log.clone() as Arc<dyn HotplugListener>));
    backend.unplug(DeviceKind::VideoCapture, "/dev/video2");
    manager.dispatch_pending();
    assert_eq!(calls.lock().len(), 2);
    assert_eq!(log.entries().len(), 2);
    assert_eq!(manager.listener_count(), 0);
}
