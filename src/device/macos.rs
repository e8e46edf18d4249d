//! CoreAudio backend. Audio devices come from the HAL system object; property
//! listeners on that object drive hotplug and default-device events.

use std::collections::BTreeMap;
use std::ffi::{CStr, c_char, c_void};
use std::mem;
use std::ptr;

use coreaudio_sys::{
    AudioBuffer, AudioBufferList, AudioDeviceID, AudioObjectAddPropertyListener,
    AudioObjectGetPropertyData, AudioObjectGetPropertyDataSize, AudioObjectID,
    AudioObjectPropertyAddress, AudioObjectRemovePropertyListener, OSStatus,
    kAudioDevicePropertyDeviceNameCFString, kAudioDevicePropertyDeviceUID,
    kAudioDevicePropertyScopeInput, kAudioDevicePropertyScopeOutput,
    kAudioDevicePropertyStreamConfiguration, kAudioHardwarePropertyDefaultInputDevice,
    kAudioHardwarePropertyDefaultOutputDevice, kAudioHardwarePropertyDevices,
    kAudioObjectPropertyScopeGlobal, kAudioObjectSystemObject,
};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::backend::{DeviceBackend, WatchHandle, membership_changes};
use super::{DeviceKind, DeviceRecord, PlatformEvent};
use crate::error::{BridgeError, Result};

const ELEMENT_MAIN: u32 = 0;
const CF_STRING_ENCODING_UTF8: u32 = 0x0800_0100;

#[link(name = "CoreFoundation", kind = "framework")]
unsafe extern "C" {
    fn CFStringGetCString(
        string: *const c_void,
        buffer: *mut c_char,
        buffer_size: isize,
        encoding: u32,
    ) -> bool;
    fn CFRelease(cf: *const c_void);
}

fn address(selector: u32, scope: u32) -> AudioObjectPropertyAddress {
    AudioObjectPropertyAddress {
        mSelector: selector,
        mScope: scope,
        mElement: ELEMENT_MAIN,
    }
}

fn check(status: OSStatus, api: &'static str) -> Result<()> {
    if status == 0 {
        Ok(())
    } else {
        Err(BridgeError::platform(api, format!("OSStatus {status}")))
    }
}

fn property_size(object: AudioObjectID, addr: &AudioObjectPropertyAddress) -> Result<u32> {
    let mut size = 0u32;
    let status = unsafe { AudioObjectGetPropertyDataSize(object, addr, 0, ptr::null(), &mut size) };
    check(status, "AudioObjectGetPropertyDataSize")?;
    Ok(size)
}

fn property<T: Copy + Default>(object: AudioObjectID, addr: &AudioObjectPropertyAddress) -> Result<T> {
    let mut value = T::default();
    let mut size = mem::size_of::<T>() as u32;
    let status = unsafe {
        AudioObjectGetPropertyData(
            object,
            addr,
            0,
            ptr::null(),
            &mut size,
            &mut value as *mut T as *mut c_void,
        )
    };
    check(status, "AudioObjectGetPropertyData")?;
    Ok(value)
}

fn device_ids() -> Result<Vec<AudioDeviceID>> {
    let addr = address(kAudioHardwarePropertyDevices, kAudioObjectPropertyScopeGlobal);
    let size = property_size(kAudioObjectSystemObject, &addr)?;
    let mut ids = vec![0 as AudioDeviceID; size as usize / mem::size_of::<AudioDeviceID>()];
    let mut size = (ids.len() * mem::size_of::<AudioDeviceID>()) as u32;
    let status = unsafe {
        AudioObjectGetPropertyData(
            kAudioObjectSystemObject,
            &addr,
            0,
            ptr::null(),
            &mut size,
            ids.as_mut_ptr() as *mut c_void,
        )
    };
    check(status, "AudioObjectGetPropertyData")?;
    ids.truncate(size as usize / mem::size_of::<AudioDeviceID>());
    Ok(ids)
}

fn string_property(device: AudioDeviceID, selector: u32) -> Option<String> {
    let cf: usize = property(device, &address(selector, kAudioObjectPropertyScopeGlobal)).ok()?;
    let cf = cf as *const c_void;
    if cf.is_null() {
        return None;
    }
    let mut buffer = [0 as c_char; 256];
    let ok = unsafe { CFStringGetCString(cf, buffer.as_mut_ptr(), buffer.len() as isize, CF_STRING_ENCODING_UTF8) };
    unsafe { CFRelease(cf) };
    ok.then(|| unsafe { CStr::from_ptr(buffer.as_ptr()) }.to_string_lossy().into_owned())
}

fn channel_count(device: AudioDeviceID, scope: u32) -> u32 {
    let addr = address(kAudioDevicePropertyStreamConfiguration, scope);
    let Ok(size) = property_size(device, &addr) else {
        return 0;
    };
    if (size as usize) < mem::size_of::<u32>() {
        return 0;
    }
    // u64 backing keeps the AudioBufferList header aligned.
    let mut storage = vec![0u64; (size as usize).div_ceil(mem::size_of::<u64>())];
    let mut actual = size;
    let status = unsafe {
        AudioObjectGetPropertyData(
            device,
            &addr,
            0,
            ptr::null(),
            &mut actual,
            storage.as_mut_ptr() as *mut c_void,
        )
    };
    if status != 0 {
        return 0;
    }
    let list = storage.as_ptr() as *const AudioBufferList;
    unsafe {
        let count = (*list).mNumberBuffers as usize;
        let buffers = (*list).mBuffers.as_ptr() as *const AudioBuffer;
        (0..count).map(|i| (*buffers.add(i)).mNumberChannels).sum()
    }
}

fn describe(device: AudioDeviceID, kind: DeviceKind) -> Option<DeviceRecord> {
    let scope = match kind {
        DeviceKind::AudioCapture => kAudioDevicePropertyScopeInput,
        DeviceKind::AudioRender => kAudioDevicePropertyScopeOutput,
        DeviceKind::VideoCapture => return None,
    };
    if channel_count(device, scope) == 0 {
        return None;
    }
    let descriptor = string_property(device, kAudioDevicePropertyDeviceUID)
        .unwrap_or_else(|| format!("coreaudio:{device}"));
    let name = string_property(device, kAudioDevicePropertyDeviceNameCFString)
        .unwrap_or_else(|| format!("Device {device}"));
    Some(DeviceRecord::new(kind, name, descriptor))
}

fn audio_devices(kind: DeviceKind) -> Result<Vec<DeviceRecord>> {
    Ok(device_ids()?
        .into_iter()
        .filter_map(|id| describe(id, kind))
        .collect())
}

fn default_selector(kind: DeviceKind) -> Option<u32> {
    match kind {
        DeviceKind::AudioCapture => Some(kAudioHardwarePropertyDefaultInputDevice),
        DeviceKind::AudioRender => Some(kAudioHardwarePropertyDefaultOutputDevice),
        DeviceKind::VideoCapture => None,
    }
}

/// Device backend over the CoreAudio HAL. Cameras are not enumerated here.
#[derive(Debug, Default)]
pub struct CoreAudioBackend;

impl CoreAudioBackend {
    /// The CoreAudio backend.
    pub fn new() -> Self {
        Self
    }
}

const AUDIO_KINDS: [DeviceKind; 2] = [DeviceKind::AudioCapture, DeviceKind::AudioRender];

struct ListenerContext {
    events: Sender<PlatformEvent>,
    known: Mutex<BTreeMap<DeviceKind, Vec<DeviceRecord>>>,
}

impl ListenerContext {
    fn devices_changed(&self) {
        let mut known = self.known.lock();
        for kind in AUDIO_KINDS {
            let now = match audio_devices(kind) {
                Ok(devices) => devices,
                Err(err) => {
                    warn!(kind = kind.label(), %err, "device list refresh failed");
                    continue;
                }
            };
            let before = known.get(&kind).map(Vec::as_slice).unwrap_or_default();
            for event in membership_changes(kind, before, &now) {
                let _ = self.events.send(event);
            }
            known.insert(kind, now);
        }
    }
}

unsafe extern "C" fn on_system_property(
    _object: AudioObjectID,
    count: u32,
    addresses: *const AudioObjectPropertyAddress,
    client: *mut c_void,
) -> OSStatus {
    if client.is_null() || addresses.is_null() {
        return 0;
    }
    let context = unsafe { &*(client as *const ListenerContext) };
    let addresses = unsafe { std::slice::from_raw_parts(addresses, count as usize) };
    for addr in addresses {
        match addr.mSelector {
            s if s == kAudioHardwarePropertyDevices => context.devices_changed(),
            s if s == kAudioHardwarePropertyDefaultInputDevice => {
                let _ = context.events.send(PlatformEvent::DefaultChanged {
                    kind: DeviceKind::AudioCapture,
                });
            }
            s if s == kAudioHardwarePropertyDefaultOutputDevice => {
                let _ = context.events.send(PlatformEvent::DefaultChanged {
                    kind: DeviceKind::AudioRender,
                });
            }
            _ => {}
        }
    }
    0
}

const WATCHED: [u32; 3] = [
    kAudioHardwarePropertyDevices,
    kAudioHardwarePropertyDefaultInputDevice,
    kAudioHardwarePropertyDefaultOutputDevice,
];

fn remove_listeners(client: *mut c_void, selectors: &[u32]) {
    for selector in selectors {
        let addr = address(*selector, kAudioObjectPropertyScopeGlobal);
        let status = unsafe {
            AudioObjectRemovePropertyListener(kAudioObjectSystemObject, &addr, Some(on_system_property), client)
        };
        if status != 0 {
            warn!(selector, status, "AudioObjectRemovePropertyListener failed");
        }
    }
}

impl DeviceBackend for CoreAudioBackend {
    fn name(&self) -> &'static str {
        "coreaudio"
    }

    fn enumerate(&self, kind: DeviceKind) -> Result<Vec<DeviceRecord>> {
        match kind {
            DeviceKind::AudioCapture | DeviceKind::AudioRender => audio_devices(kind),
            DeviceKind::VideoCapture => Ok(Vec::new()),
        }
    }

    fn default_descriptor(&self, kind: DeviceKind) -> Result<Option<String>> {
        let Some(selector) = default_selector(kind) else {
            return Ok(None);
        };
        let id: AudioDeviceID = property(
            kAudioObjectSystemObject,
            &address(selector, kAudioObjectPropertyScopeGlobal),
        )?;
        if id == 0 {
            return Ok(None);
        }
        Ok(describe(id, kind).map(|device| device.descriptor))
    }

    fn watch(&self, events: Sender<PlatformEvent>) -> Result<WatchHandle> {
        let mut known = BTreeMap::new();
        for kind in AUDIO_KINDS {
            known.insert(kind, audio_devices(kind)?);
        }
        let client = Box::into_raw(Box::new(ListenerContext {
            events,
            known: Mutex::new(known),
        })) as *mut c_void;

        for (registered, selector) in WATCHED.iter().enumerate() {
            let addr = address(*selector, kAudioObjectPropertyScopeGlobal);
            let status = unsafe {
                AudioObjectAddPropertyListener(kAudioObjectSystemObject, &addr, Some(on_system_property), client)
            };
            if let Err(err) = check(status, "AudioObjectAddPropertyListener") {
                remove_listeners(client, &WATCHED[..registered]);
                drop(unsafe { Box::from_raw(client as *mut ListenerContext) });
                return Err(err);
            }
        }
        debug!("coreaudio property listeners installed");

        let raw = client as usize;
        Ok(WatchHandle::new(move || {
            let client = raw as *mut c_void;
            remove_listeners(client, &WATCHED);
            drop(unsafe { Box::from_raw(client as *mut ListenerContext) });
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cameras_are_not_listed_by_coreaudio() {
        let backend = CoreAudioBackend::new();
        assert!(backend.enumerate(DeviceKind::VideoCapture).expect("enumerate").is_empty());
        assert_eq!(backend.default_descriptor(DeviceKind::VideoCapture).expect("default"), None);
    }

    #[test]
    fn audio_enumeration_yields_unique_descriptors() {
        let backend = CoreAudioBackend::new();
        for kind in AUDIO_KINDS {
            let devices = backend.enumerate(kind).expect("enumerate");
            let mut descriptors: Vec<_> = devices.iter().map(|d| d.descriptor.clone()).collect();
            descriptors.sort();
            descriptors.dedup();
            assert_eq!(descriptors.len(), devices.len(), "{} descriptors repeat", kind.label());
        }
    }
}
