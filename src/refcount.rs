//! Reference counting on behalf of objects the media engine retains and releases.
//!
//! The engine's implicit hold is one of the counted references ([`EngineHold`]), so the
//! wrapped value is dropped exactly when the combined count of every holder goes 1 -> 0.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::error::{BridgeError, Result};

/// Interfaces an adapted object may expose to the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InterfaceKind {
    /// Base interface every adapted object answers to.
    RefCounted,
    /// Audio source.
    AudioSource,
    /// Audio track sink.
    AudioTrackSink,
    /// Video source.
    VideoSource,
    /// Video sink.
    VideoSink,
    /// Audio transport.
    AudioTransport,
}

impl InterfaceKind {
    /// Interface name for diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            InterfaceKind::RefCounted => "RefCounted",
            InterfaceKind::AudioSource => "AudioSource",
            InterfaceKind::AudioTrackSink => "AudioTrackSink",
            InterfaceKind::VideoSource => "VideoSource",
            InterfaceKind::VideoSink => "VideoSink",
            InterfaceKind::AudioTransport => "AudioTransport",
        }
    }
}

/// Lifecycle of an adapted object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefState {
    /// At least one reference is held.
    Live,
    /// The last reference was released.
    Released,
}

const LIVE: u8 = 0;
const RELEASED: u8 = 1;

/// Atomic reference count plus Live/Released state around a shared value.
pub struct RefCountedAdapter<T> {
    name: &'static str,
    count: AtomicU32,
    state: AtomicU8,
    externally_disposed: AtomicBool,
    interfaces: &'static [InterfaceKind],
    value: Mutex<Option<Arc<T>>>,
}

impl<T> RefCountedAdapter<T> {
    /// Adapt `value` with one reference owned by the caller.
    pub fn new(name: &'static str, value: T, interfaces: &'static [InterfaceKind]) -> Arc<Self> {
        Arc::new(Self {
            name,
            count: AtomicU32::new(1),
            state: AtomicU8::new(LIVE),
            externally_disposed: AtomicBool::new(false),
            interfaces,
            value: Mutex::new(Some(Arc::new(value))),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RefState {
        match self.state.load(Ordering::Acquire) {
            LIVE => RefState::Live,
            _ => RefState::Released,
        }
    }

    /// Current number of references from all holders.
    pub fn ref_count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Take another reference. Fails once the object has been released.
    pub fn add_ref(&self) -> Result<u32> {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                error!(object = self.name, "add_ref after final release");
                return Err(BridgeError::UseAfterRelease);
            }
            match self.count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current + 1),
                Err(actual) => current = actual,
            }
        }
    }

    /// Drop one reference. The release that reaches zero drops the value.
    pub fn release(&self) -> Result<u32> {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                error!(object = self.name, "release called on an already released object");
                return Err(BridgeError::AlreadyReleased);
            }
            match self.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        let remaining = current - 1;
        if remaining == 0 {
            self.state.store(RELEASED, Ordering::Release);
            let value = self.value.lock().take();
            drop(value);
            trace!(object = self.name, "dropped last reference");
        }
        Ok(remaining)
    }

    /// Return another reference to this object typed as `kind`, or `NotSupported`.
    pub fn query_interface(self: &Arc<Self>, kind: InterfaceKind) -> Result<Arc<Self>> {
        if kind != InterfaceKind::RefCounted && !self.interfaces.contains(&kind) {
            return Err(BridgeError::NotSupported(kind.name()));
        }
        self.add_ref()?;
        Ok(Arc::clone(self))
    }

    /// Borrow the wrapped value. Callers must own a reference for the duration of use.
    pub fn get(&self) -> Result<Arc<T>> {
        self.value.lock().clone().ok_or(BridgeError::UseAfterRelease)
    }

    /// Count the engine's implicit reference until the returned guard drops.
    pub fn engine_hold(self: &Arc<Self>) -> Result<EngineHold<T>> {
        self.add_ref()?;
        Ok(EngineHold {
            adapter: Arc::clone(self),
        })
    }

    /// Whether the managed side has given up its reference.
    pub fn is_externally_disposed(&self) -> bool {
        self.externally_disposed.load(Ordering::Acquire)
    }

    /// Release the reference owned by the managed side, once. Later calls return the
    /// current count without releasing. A non-zero remainder means another holder still
    /// retains the object and is logged.
    pub fn dispose_external(&self) -> Result<u32> {
        if self.externally_disposed.swap(true, Ordering::AcqRel) {
            debug!(object = self.name, "external reference already disposed");
            return Ok(self.ref_count());
        }
        let remaining = self.release()?;
        if remaining != 0 {
            warn!(
                object = self.name,
                remaining, "object still referenced after external dispose"
            );
        }
        Ok(remaining)
    }
}

impl<T> fmt::Debug for RefCountedAdapter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefCountedAdapter")
            .field("name", &self.name)
            .field("count", &self.ref_count())
            .field("state", &self.state())
            .finish()
    }
}

/// The engine's counted reference, released on the engine's teardown path.
pub struct EngineHold<T> {
    adapter: Arc<RefCountedAdapter<T>>,
}

impl<T> EngineHold<T> {
    /// The adapter this hold counts against.
    pub fn adapter(&self) -> &Arc<RefCountedAdapter<T>> {
        &self.adapter
    }
}

impl<T> Drop for EngineHold<T> {
    fn drop(&mut self) {
        if let Err(err) = self.adapter.release() {
            error!(object = self.adapter.name, %err, "engine hold release failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn release_to_zero_transitions_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let adapter = RefCountedAdapter::new("test", DropCounter(drops.clone()), &[]);
        assert_eq!(adapter.add_ref(), Ok(2));
        assert_eq!(adapter.release(), Ok(1));
        assert_eq!(adapter.state(), RefState::Live);
        assert_eq!(adapter.release(), Ok(0));
        assert_eq!(adapter.state(), RefState::Released);
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        assert_eq!(adapter.release(), Err(BridgeError::AlreadyReleased));
        assert_eq!(adapter.add_ref(), Err(BridgeError::UseAfterRelease));
        assert!(adapter.get().is_err());
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn engine_hold_keeps_object_alive_past_external_dispose() {
        let drops = Arc::new(AtomicUsize::new(0));
        let adapter = RefCountedAdapter::new(
            "source",
            DropCounter(drops.clone()),
            &[InterfaceKind::AudioSource],
        );
        let hold = adapter.engine_hold().expect("hold");

        assert_eq!(adapter.dispose_external(), Ok(1));
        assert_eq!(drops.load(Ordering::SeqCst), 0, "engine still holds the object");
        assert!(adapter.get().is_ok());

        drop(hold);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(adapter.state(), RefState::Released);
    }

    #[test]
    fn repeated_external_dispose_releases_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let adapter = RefCountedAdapter::new("source", DropCounter(drops.clone()), &[]);
        adapter.add_ref().expect("engine ref");

        assert_eq!(adapter.dispose_external(), Ok(1));
        assert!(adapter.is_externally_disposed());
        assert_eq!(adapter.dispose_external(), Ok(1), "the engine's reference is untouched");
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        assert_eq!(adapter.release(), Ok(0));
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn query_interface_checks_exposed_kinds() {
        let adapter = RefCountedAdapter::new("sink", 5u8, &[InterfaceKind::VideoSink]);
        let view = adapter
            .query_interface(InterfaceKind::VideoSink)
            .expect("supported");
        assert_eq!(view.ref_count(), 2);
        assert_eq!(
            adapter.query_interface(InterfaceKind::AudioSource).unwrap_err(),
            BridgeError::NotSupported("AudioSource")
        );
        assert_eq!(adapter.ref_count(), 2);
    }

    #[test]
    fn concurrent_add_ref_and_release_free_exactly_once() {
        const THREADS: usize = 64;
        let drops = Arc::new(AtomicUsize::new(0));
        let adapter = RefCountedAdapter::new("stress", DropCounter(drops.clone()), &[]);
        let barrier = Arc::new(Barrier::new(THREADS));

        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                let adapter = adapter.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    adapter.add_ref().expect("add_ref");
                    barrier.wait();
                    adapter.release().expect("release");
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("worker");
        }

        assert_eq!(adapter.ref_count(), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        assert_eq!(adapter.release(), Ok(0));
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
