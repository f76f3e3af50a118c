use std::collections::HashMap;
use std::sync::Arc;

use emuhost_protocol::Waveform;
use parking_lot::Mutex;
use tracing::{debug, warn};


/// Identifier of a physical input device as reported by the host.
pub type DeviceId = String;

/// A resolved vibration-capable device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    pub id: DeviceId,
    pub builtin: bool,
}

/// Where a logical controller's rumble is routed, as configured by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RumbleTarget {
    /// The host's own vibrator.
    Builtin,
    /// An external device, matched by its stable descriptor.
    Descriptor(String),
}

/// Host-side lookup of vibration devices.
pub trait DeviceDiscovery: Send + Sync {
    /// Rumble target configured for controller `index`, if any.
    fn rumble_target(&self, index: u8) -> Option<RumbleTarget>;

    /// The built-in vibrator, if the host has one.
    fn builtin(&self) -> Option<DeviceHandle>;

    /// Scan connected devices for one matching `descriptor`.
    fn find(&self, descriptor: &str) -> Option<DeviceHandle>;
}

/// Plays effects on a resolved device. Calls must not block beyond the
/// platform API's own latency.
pub trait Vibrator: Send + Sync {
    fn vibrate(&self, device: &DeviceHandle, waveform: &Waveform);
    fn cancel(&self, device: &DeviceHandle);
}

#[derive(Debug, Clone)]
enum Binding {
    Resolved(DeviceHandle),
    /// Discovery ran and found nothing; don't scan again until invalidated.
    Absent,
}

/// Lazily resolved, cached mapping from controller index to device.
pub struct VibrationRegistry {
    discovery: Arc<dyn DeviceDiscovery>,
    vibrator: Arc<dyn Vibrator>,
    bindings: Mutex<HashMap<u8, Binding>>,
}

impl VibrationRegistry {
    pub fn new(discovery: Arc<dyn DeviceDiscovery>, vibrator: Arc<dyn Vibrator>) -> Self {
        Self {
            discovery,
            vibrator,
            bindings: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached device for `index`, discovering it on first use.
    pub fn resolve(&self, index: u8) -> Option<DeviceHandle> {
        if let Some(binding) = self.bindings.lock().get(&index) {
            return match binding {
                Binding::Resolved(device) => Some(device.clone()),
                Binding::Absent => None,
            };
        }

        // Discovery runs unlocked; the first result inserted wins.
        let discovered = self.discover(index);
        let mut bindings = self.bindings.lock();
        let binding = bindings.entry(index).or_insert_with(|| match discovered {
            Some(device) => Binding::Resolved(device),
            None => Binding::Absent,
        });
        match binding {
            Binding::Resolved(device) => {
                debug!(index, device = %device.id, "vibration device bound");
                Some(device.clone())
            }
            Binding::Absent => {
                debug!(index, "no vibration device for controller");
                None
            }
        }
    }

    fn discover(&self, index: u8) -> Option<DeviceHandle> {
        match self.discovery.rumble_target(index)? {
            RumbleTarget::Builtin => self.discovery.builtin(),
            RumbleTarget::Descriptor(descriptor) => self.discovery.find(&descriptor),
        }
    }

    /// Forward `waveform` to the controller's device. Returns whether an
    /// effect was started.
    pub fn dispatch(&self, index: u8, waveform: &Waveform) -> bool {
        if !waveform.is_well_formed() {
            warn!(
                index,
                timings = waveform.timings_ms.len(),
                amplitudes = waveform.amplitudes.len(),
                "dropping malformed waveform"
            );
            return false;
        }
        let Some(device) = self.resolve(index) else {
            return false;
        };
        self.vibrator.vibrate(&device, waveform);
        true
    }

    /// Stop the running effect on `index` but keep the binding.
    pub fn clear(&self, index: u8) {
        let device = match self.bindings.lock().get(&index) {
            Some(Binding::Resolved(device)) => device.clone(),
            _ => return,
        };
        self.vibrator.cancel(&device);
    }

    /// Drop the binding for `index`, stopping its effect.
    pub fn invalidate(&self, index: u8) {
        let removed = self.bindings.lock().remove(&index);
        if let Some(Binding::Resolved(device)) = removed {
            self.vibrator.cancel(&device);
        }
    }

    /// Drop every binding, stopping all effects. Used on session teardown.
    pub fn invalidate_all(&self) {
        let drained: Vec<Binding> = self.bindings.lock().drain().map(|(_, b)| b).collect();
        for binding in drained {
            if let Binding::Resolved(device) = binding {
                self.vibrator.cancel(&device);
            }
        }
    }

    /// A physical device disappeared: drop every binding that points at it.
    ///
    /// Negative entries are dropped as well, since a reconnect may now
    /// satisfy them.
    pub fn device_removed(&self, device_id: &str) {
        let mut cancelled = None;
        self.bindings.lock().retain(|_, binding| match binding {
            Binding::Resolved(device) if device.id == device_id => {
                cancelled = Some(device.clone());
                false
            }
            Binding::Resolved(_) => true,
            Binding::Absent => false,
        });
        if let Some(device) = cancelled {
            self.vibrator.cancel(&device);
        }
    }

    pub fn bound_count(&self) -> usize {
        self.bindings.lock().len()
    }
}
