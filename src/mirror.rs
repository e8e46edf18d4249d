//! Managed object mirrors: a durable reference to a host-runtime callback object plus its
//! entry points, resolved once per class and cached for the life of the process.

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, trace};

use crate::error::{BridgeError, Result};
use crate::video::VideoFrame;

/// Byte array shared between native code and the managed runtime.
#[derive(Clone, Default)]
pub struct ManagedByteArray(Arc<Mutex<Vec<u8>>>);

impl ManagedByteArray {
    /// Zero-filled array of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self(Arc::new(Mutex::new(vec![0; len])))
    }

    /// Array holding a copy of `data`.
    pub fn from_slice(data: &[u8]) -> Self {
        Self(Arc::new(Mutex::new(data.to_vec())))
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// Whether the array is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resize to exactly `len` bytes, zeroing the contents.
    pub fn reset(&self, len: usize) {
        let mut bytes = self.0.lock();
        bytes.clear();
        bytes.resize(len, 0);
    }

    /// Overwrite the leading bytes with `data`.
    pub fn write(&self, data: &[u8]) {
        let mut bytes = self.0.lock();
        let n = data.len().min(bytes.len());
        bytes[..n].copy_from_slice(&data[..n]);
    }

    /// Copy the leading bytes into `out`, returning how many were copied.
    pub fn read_into(&self, out: &mut [u8]) -> usize {
        let bytes = self.0.lock();
        let n = out.len().min(bytes.len());
        out[..n].copy_from_slice(&bytes[..n]);
        n
    }

    /// Copy of the contents.
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.lock().clone()
    }

    /// Run `f` with mutable access to the contents.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.0.lock())
    }

    /// Whether both refer to the same managed array.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ManagedByteArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ManagedByteArray(len={})", self.len())
    }
}

/// Kind of a value crossing the managed boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// No value.
    Void,
    /// 32-bit integer.
    Int,
    /// 64-bit integer.
    Long,
    /// Boolean.
    Bool,
    /// Byte array.
    Bytes,
    /// String.
    Str,
    /// Video frame.
    VideoFrame,
}

/// A value passed to or returned from a managed method.
#[derive(Clone, Debug)]
pub enum ManagedValue {
    /// No value.
    Void,
    /// 32-bit integer.
    Int(i32),
    /// 64-bit integer.
    Long(i64),
    /// Boolean.
    Bool(bool),
    /// Shared byte array.
    Bytes(ManagedByteArray),
    /// String.
    Str(String),
    /// Video frame.
    VideoFrame(Arc<VideoFrame>),
}

impl ManagedValue {
    /// Kind of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            ManagedValue::Void => ValueKind::Void,
            ManagedValue::Int(_) => ValueKind::Int,
            ManagedValue::Long(_) => ValueKind::Long,
            ManagedValue::Bool(_) => ValueKind::Bool,
            ManagedValue::Bytes(_) => ValueKind::Bytes,
            ManagedValue::Str(_) => ValueKind::Str,
            ManagedValue::VideoFrame(_) => ValueKind::VideoFrame,
        }
    }

    /// The integer, if this is an `Int`.
    pub fn as_int(&self) -> Option<i32> {
        match self {
            ManagedValue::Int(value) => Some(*value),
            _ => None,
        }
    }
}

/// Parameter and return kinds of a method.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Signature {
    /// Parameter kinds in order.
    pub params: &'static [ValueKind],
    /// Return kind.
    pub ret: ValueKind,
}

/// A method a managed class declares.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    /// Method name.
    pub name: String,
    /// Parameter and return kinds.
    pub signature: Signature,
}

impl MethodDescriptor {
    /// Describe a method.
    pub fn new(name: impl Into<String>, signature: Signature) -> Self {
        Self {
            name: name.into(),
            signature,
        }
    }
}

/// Reflection data for a managed class. Two classes are the same when both their fully
/// qualified name and their method table match, so same-named classes from different
/// loaders resolve separately.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ManagedClass {
    /// Fully qualified name.
    pub name: String,
    /// Declared methods, indexed by [`MethodId`].
    pub methods: Vec<MethodDescriptor>,
}

impl ManagedClass {
    fn find(&self, name: &str, signature: &Signature) -> Option<MethodId> {
        self.methods
            .iter()
            .position(|m| m.name == name && m.signature == *signature)
            .map(MethodId)
    }
}

/// Index of a resolved method within its class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MethodId(pub usize);

/// Exception raised by managed code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagedException {
    /// Exception class name.
    pub class: String,
    /// Exception message.
    pub message: String,
}

impl ManagedException {
    /// Exception of `class`.
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ManagedException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

impl From<ManagedException> for BridgeError {
    fn from(exception: ManagedException) -> Self {
        BridgeError::Managed(exception.to_string())
    }
}

/// An object living in the managed runtime.
pub trait ManagedObject: Send + Sync {
    /// Reflection data of the object's class.
    fn class(&self) -> &ManagedClass;

    /// Call a method previously resolved against [`ManagedObject::class`].
    fn invoke(
        &self,
        method: MethodId,
        args: &[ManagedValue],
    ) -> std::result::Result<ManagedValue, ManagedException>;
}

/// Managed runtime that native threads must join before calling into it.
pub trait ManagedRuntime: Send + Sync {
    /// Attach the calling thread. Repeated calls on an attached thread succeed without effect.
    fn attach_current_thread(&self) -> Result<()>;

    /// Whether the calling thread is attached.
    fn is_current_thread_attached(&self) -> bool;
}

thread_local! {
    static ATTACHED: Cell<bool> = const { Cell::new(false) };
}

/// In-process runtime tracking attachment per thread.
#[derive(Debug, Default)]
pub struct LocalRuntime {
    attachments: AtomicUsize,
}

impl LocalRuntime {
    /// Runtime with no threads attached.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct thread attachments performed.
    pub fn attachments(&self) -> usize {
        self.attachments.load(Ordering::Acquire)
    }
}

impl ManagedRuntime for LocalRuntime {
    fn attach_current_thread(&self) -> Result<()> {
        ATTACHED.with(|attached| {
            if !attached.replace(true) {
                self.attachments.fetch_add(1, Ordering::AcqRel);
                trace!(thread = ?std::thread::current().id(), "thread attached to managed runtime");
            }
        });
        Ok(())
    }

    fn is_current_thread_attached(&self) -> bool {
        ATTACHED.with(Cell::get)
    }
}

/// Entry point required by a callback interface.
#[derive(Clone, Copy, Debug)]
pub struct EntryPointSpec {
    /// Method name.
    pub name: &'static str,
    /// Required signature.
    pub signature: Signature,
}

/// A callback interface implemented by managed classes.
#[derive(Debug)]
pub struct CallbackInterface {
    /// Interface name for diagnostics.
    pub name: &'static str,
    /// Methods an implementing class must declare.
    pub entry_points: &'static [EntryPointSpec],
}

use ValueKind as K;

/// Name of [`AUDIO_SINK`]'s entry point.
pub const ON_RECORDED_DATA: &str = "onRecordedData";
/// Name of [`AUDIO_SOURCE`]'s entry point.
pub const ON_PLAYBACK_DATA: &str = "onPlaybackData";
/// Name of [`AUDIO_TRACK_SINK`]'s entry point.
pub const ON_DATA: &str = "onData";
/// Name of [`VIDEO_TRACK_SINK`]'s entry point.
pub const ON_VIDEO_FRAME: &str = "onVideoFrame";
/// Connected entry point of [`DEVICE_CHANGE_LISTENER`].
pub const ON_DEVICE_CONNECTED: &str = "deviceConnected";
/// Disconnected entry point of [`DEVICE_CHANGE_LISTENER`].
pub const ON_DEVICE_DISCONNECTED: &str = "deviceDisconnected";

/// `onRecordedData(bytes, samples, bytesPerSample, channels, sampleRate, delayMs, driftPpm)`.
pub static AUDIO_SINK: CallbackInterface = CallbackInterface {
    name: "AudioSink",
    entry_points: &[EntryPointSpec {
        name: ON_RECORDED_DATA,
        signature: Signature {
            params: &[K::Bytes, K::Int, K::Int, K::Int, K::Int, K::Int, K::Int],
            ret: K::Void,
        },
    }],
};

/// `onPlaybackData(bytes, samples, bytesPerSample, channels, sampleRate) -> filled`.
pub static AUDIO_SOURCE: CallbackInterface = CallbackInterface {
    name: "AudioSource",
    entry_points: &[EntryPointSpec {
        name: ON_PLAYBACK_DATA,
        signature: Signature {
            params: &[K::Bytes, K::Int, K::Int, K::Int, K::Int],
            ret: K::Int,
        },
    }],
};

/// `onData(bytes, bitsPerSample, sampleRate, channels, frames)`.
pub static AUDIO_TRACK_SINK: CallbackInterface = CallbackInterface {
    name: "AudioTrackSink",
    entry_points: &[EntryPointSpec {
        name: ON_DATA,
        signature: Signature {
            params: &[K::Bytes, K::Int, K::Int, K::Int, K::Int],
            ret: K::Void,
        },
    }],
};

/// `onVideoFrame(frame)`.
pub static VIDEO_TRACK_SINK: CallbackInterface = CallbackInterface {
    name: "VideoTrackSink",
    entry_points: &[EntryPointSpec {
        name: ON_VIDEO_FRAME,
        signature: Signature {
            params: &[K::VideoFrame],
            ret: K::Void,
        },
    }],
};

/// `deviceConnected(descriptor)` and `deviceDisconnected(descriptor)`.
pub static DEVICE_CHANGE_LISTENER: CallbackInterface = CallbackInterface {
    name: "DeviceChangeListener",
    entry_points: &[
        EntryPointSpec {
            name: ON_DEVICE_CONNECTED,
            signature: Signature {
                params: &[K::Str],
                ret: K::Void,
            },
        },
        EntryPointSpec {
            name: ON_DEVICE_DISCONNECTED,
            signature: Signature {
                params: &[K::Str],
                ret: K::Void,
            },
        },
    ],
};

/// Entry points of one interface resolved against one class.
#[derive(Debug)]
pub struct ResolvedEntryPoints {
    /// Class the entry points belong to.
    pub class_name: String,
    /// Interface resolved.
    pub interface: &'static str,
    methods: Vec<(&'static str, MethodId, Signature)>,
}

impl ResolvedEntryPoints {
    fn lookup(&self, name: &str) -> Option<(MethodId, Signature)> {
        self.methods
            .iter()
            .find(|(entry, _, _)| *entry == name)
            .map(|(_, id, signature)| (*id, *signature))
    }
}

type CacheKey = (&'static str, ManagedClass);

static ENTRY_POINT_CACHE: Lazy<RwLock<HashMap<CacheKey, Arc<ResolvedEntryPoints>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));
static SETUP_LOCK: Mutex<()> = parking_lot::const_mutex(());
static RESOLUTIONS: AtomicUsize = AtomicUsize::new(0);

/// Number of class resolutions performed by this process.
pub fn entry_point_resolutions() -> usize {
    RESOLUTIONS.load(Ordering::Acquire)
}

fn resolve_entry_points(
    interface: &'static CallbackInterface,
    class: &ManagedClass,
) -> Result<Arc<ResolvedEntryPoints>> {
    let key = (interface.name, class.clone());
    if let Some(found) = ENTRY_POINT_CACHE.read().get(&key) {
        return Ok(found.clone());
    }

    let _setup = SETUP_LOCK.lock();
    if let Some(found) = ENTRY_POINT_CACHE.read().get(&key) {
        return Ok(found.clone());
    }

    let mut methods = Vec::with_capacity(interface.entry_points.len());
    for entry in interface.entry_points {
        let id = class.find(entry.name, &entry.signature).ok_or_else(|| {
            BridgeError::Setup(format!(
                "{} does not implement {}.{}",
                class.name, interface.name, entry.name
            ))
        })?;
        methods.push((entry.name, id, entry.signature));
    }

    let resolved = Arc::new(ResolvedEntryPoints {
        class_name: class.name.clone(),
        interface: interface.name,
        methods,
    });
    RESOLUTIONS.fetch_add(1, Ordering::AcqRel);
    debug!(interface = interface.name, class = %class.name, "entry points resolved");
    ENTRY_POINT_CACHE.write().insert(key, resolved.clone());
    Ok(resolved)
}

/// Durable reference to a managed callback object with its resolved entry points.
pub struct ManagedObjectMirror {
    runtime: Arc<dyn ManagedRuntime>,
    object: Arc<dyn ManagedObject>,
    entry_points: Arc<ResolvedEntryPoints>,
}

impl ManagedObjectMirror {
    /// Resolve `interface` against the object's class. Missing entry points fail here,
    /// never on first use.
    pub fn new(
        runtime: Arc<dyn ManagedRuntime>,
        object: Arc<dyn ManagedObject>,
        interface: &'static CallbackInterface,
    ) -> Result<Self> {
        let entry_points = resolve_entry_points(interface, object.class())?;
        Ok(Self {
            runtime,
            object,
            entry_points,
        })
    }

    /// Entry points resolved for this object's class.
    pub fn entry_points(&self) -> &Arc<ResolvedEntryPoints> {
        &self.entry_points
    }

    /// The managed object.
    pub fn object(&self) -> &Arc<dyn ManagedObject> {
        &self.object
    }

    /// Attach the calling thread and invoke `entry_point` synchronously.
    pub fn invoke(&self, entry_point: &str, args: &[ManagedValue]) -> Result<ManagedValue> {
        let (method, signature) = self.entry_points.lookup(entry_point).ok_or_else(|| {
            BridgeError::invalid_argument(format!(
                "{} has no entry point {entry_point}",
                self.entry_points.interface
            ))
        })?;
        check_arguments(entry_point, &signature, args)?;

        self.runtime.attach_current_thread()?;
        match self.object.invoke(method, args) {
            Ok(value) if value.kind() == signature.ret => Ok(value),
            Ok(value) => Err(BridgeError::Managed(format!(
                "{entry_point} returned {:?}, expected {:?}",
                value.kind(),
                signature.ret
            ))),
            Err(exception) => {
                error!(
                    class = %self.entry_points.class_name,
                    entry_point,
                    %exception,
                    "managed callback raised"
                );
                Err(exception.into())
            }
        }
    }
}

fn check_arguments(entry_point: &str, signature: &Signature, args: &[ManagedValue]) -> Result<()> {
    let matches = signature.params.len() == args.len()
        && signature
            .params
            .iter()
            .zip(args)
            .all(|(kind, arg)| *kind == arg.kind());
    if matches {
        Ok(())
    } else {
        Err(BridgeError::invalid_argument(format!(
            "arguments for {entry_point} do not match {:?}",
            signature.params
        )))
    }
}

type MethodBody =
    Box<dyn Fn(&[ManagedValue]) -> std::result::Result<ManagedValue, ManagedException> + Send + Sync>;

/// Managed object assembled from closures, used by embedders and tests.
pub struct DynamicObject {
    class: ManagedClass,
    bodies: Vec<MethodBody>,
}

impl DynamicObject {
    /// Start describing an object of class `class_name`.
    pub fn builder(class_name: impl Into<String>) -> DynamicObjectBuilder {
        DynamicObjectBuilder {
            class: ManagedClass {
                name: class_name.into(),
                methods: Vec::new(),
            },
            bodies: Vec::new(),
        }
    }
}

impl ManagedObject for DynamicObject {
    fn class(&self) -> &ManagedClass {
        &self.class
    }

    fn invoke(
        &self,
        method: MethodId,
        args: &[ManagedValue],
    ) -> std::result::Result<ManagedValue, ManagedException> {
        let body = self.bodies.get(method.0).ok_or_else(|| {
            ManagedException::new("NoSuchMethodError", format!("method index {}", method.0))
        })?;
        body(args)
    }
}

/// Builder for [`DynamicObject`].
pub struct DynamicObjectBuilder {
    class: ManagedClass,
    bodies: Vec<MethodBody>,
}

impl DynamicObjectBuilder {
    /// Declare a method implemented by `body`.
    pub fn method<F>(mut self, name: &str, signature: Signature, body: F) -> Self
    where
        F: Fn(&[ManagedValue]) -> std::result::Result<ManagedValue, ManagedException>
            + Send
            + Sync
            + 'static,
    {
        self.class.methods.push(MethodDescriptor::new(name, signature));
        self.bodies.push(Box::new(body));
        self
    }

    /// Implement every entry point of `interface` with the same body.
    pub fn implement<F>(mut self, interface: &CallbackInterface, body: F) -> Self
    where
        F: Fn(&str, &[ManagedValue]) -> std::result::Result<ManagedValue, ManagedException>
            + Send
            + Sync
            + Clone
            + 'static,
    {
        for entry in interface.entry_points {
            let name = entry.name;
            let body = body.clone();
            self = self.method(name, entry.signature, move |args| body(name, args));
        }
        self
    }

    /// Finish the object.
    pub fn build(self) -> Arc<DynamicObject> {
        Arc::new(DynamicObject {
            class: self.class,
            bodies: self.bodies,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listener(class_name: &str) -> Arc<DynamicObject> {
        DynamicObject::builder(class_name)
            .implement(&DEVICE_CHANGE_LISTENER, |_, _| Ok(ManagedValue::Void))
            .build()
    }

    #[test]
    fn entry_points_are_resolved_once_per_class() {
        let runtime: Arc<dyn ManagedRuntime> = Arc::new(LocalRuntime::new());
        let first = ManagedObjectMirror::new(
            runtime.clone(),
            listener("test.CachedListener"),
            &DEVICE_CHANGE_LISTENER,
        )
        .expect("resolve");
        let second = ManagedObjectMirror::new(
            runtime,
            listener("test.CachedListener"),
            &DEVICE_CHANGE_LISTENER,
        )
        .expect("resolve");
        assert!(Arc::ptr_eq(first.entry_points(), second.entry_points()));
    }

    #[test]
    fn missing_entry_point_fails_at_registration() {
        let object = DynamicObject::builder("test.HalfListener")
            .method(
                ON_DEVICE_CONNECTED,
                DEVICE_CHANGE_LISTENER.entry_points[0].signature,
                |_| Ok(ManagedValue::Void),
            )
            .build();
        let result = ManagedObjectMirror::new(
            Arc::new(LocalRuntime::new()),
            object,
            &DEVICE_CHANGE_LISTENER,
        );
        assert!(matches!(result, Err(BridgeError::Setup(msg)) if msg.contains(ON_DEVICE_DISCONNECTED)));
    }

    #[test]
    fn same_named_class_with_other_methods_is_resolved_separately() {
        let runtime: Arc<dyn ManagedRuntime> = Arc::new(LocalRuntime::new());
        let full = ManagedObjectMirror::new(
            runtime.clone(),
            listener("test.ReloadedListener"),
            &DEVICE_CHANGE_LISTENER,
        )
        .expect("resolve");

        let reloaded = DynamicObject::builder("test.ReloadedListener")
            .method(
                ON_DEVICE_CONNECTED,
                DEVICE_CHANGE_LISTENER.entry_points[0].signature,
                |_| Ok(ManagedValue::Void),
            )
            .build();
        let result = ManagedObjectMirror::new(runtime, reloaded, &DEVICE_CHANGE_LISTENER);
        assert!(
            matches!(&result, Err(BridgeError::Setup(msg)) if msg.contains(ON_DEVICE_DISCONNECTED)),
            "registration must fail for the incomplete class"
        );
        full.invoke(ON_DEVICE_DISCONNECTED, &[ManagedValue::Str("hw:0".into())])
            .expect("first class still dispatches");
    }

    #[test]
    fn invoke_attaches_thread_once() {
        let runtime = Arc::new(LocalRuntime::new());
        let mirror = ManagedObjectMirror::new(
            runtime.clone(),
            listener("test.AttachListener"),
            &DEVICE_CHANGE_LISTENER,
        )
        .expect("resolve");

        std::thread::spawn(move || {
            for _ in 0..3 {
                mirror
                    .invoke(ON_DEVICE_CONNECTED, &[ManagedValue::Str("hw:0".into())])
                    .expect("invoke");
            }
        })
        .join()
        .expect("join");
        assert_eq!(runtime.attachments(), 1);
    }

    #[test]
    fn exceptions_and_bad_arguments_are_reported() {
        let object = DynamicObject::builder("test.ThrowingListener")
            .implement(&DEVICE_CHANGE_LISTENER, |_, _| {
                Err(ManagedException::new("IllegalStateException", "boom"))
            })
            .build();
        let mirror =
            ManagedObjectMirror::new(Arc::new(LocalRuntime::new()), object, &DEVICE_CHANGE_LISTENER)
                .expect("resolve");

        let raised = mirror.invoke(ON_DEVICE_CONNECTED, &[ManagedValue::Str("x".into())]);
        assert!(
            matches!(&raised, Err(BridgeError::Managed(msg)) if msg == "IllegalStateException: boom"),
            "unexpected result: {raised:?}"
        );
        let mismatched = mirror.invoke(ON_DEVICE_CONNECTED, &[ManagedValue::Int(1)]);
        assert!(matches!(mismatched, Err(BridgeError::InvalidArgument(_))));
    }
}
