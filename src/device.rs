//! Compute device selection for local inference.
//!
//! Selection runs once per job attempt rather than once per process, so a
//! driver failure or an unplugged external GPU shows up on the next job
//! instead of poisoning the session.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Mutex, OnceLock};

use crate::error::{Error, Result};

/// Compute target for local model inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Cuda,
    Metal,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Device::Cpu => "cpu",
            Device::Cuda => "cuda",
            Device::Metal => "metal",
        };
        f.write_str(name)
    }
}

/// Capability check for a compute device.
///
/// This is an injected seam: the default [`BuildProbe`] answers from what this
/// binary was compiled with, and a frontend with access to real driver probes
/// can substitute its own implementation.
pub trait DeviceProbe {
    fn is_available(&self, device: Device) -> bool;
}

/// Default probe reporting the accelerators compiled into this build.
///
/// The `cuda`/`metal` cargo features pass through to whisper.cpp, so a build
/// without them cannot run on an accelerator regardless of the hardware.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildProbe;

impl DeviceProbe for BuildProbe {
    fn is_available(&self, device: Device) -> bool {
        match device {
            Device::Cpu => true,
            Device::Cuda => cfg!(feature = "cuda"),
            Device::Metal => cfg!(all(feature = "metal", target_os = "macos")),
        }
    }
}

/// Pick the device a local job should run on.
///
/// A pinned device that the probe reports unavailable fails with
/// [`Error::DeviceUnavailable`] — the caller decides whether to retry with the
/// fallback order, never this function. Without a pin, accelerators win over
/// the CPU: CUDA first, then Metal.
pub fn select(probe: &dyn DeviceProbe, preferred: Option<Device>) -> Result<Device> {
    if let Some(device) = preferred {
        if probe.is_available(device) {
            return Ok(device);
        }
        return Err(Error::DeviceUnavailable(device));
    }

    for candidate in [Device::Cuda, Device::Metal] {
        if probe.is_available(candidate) {
            return Ok(candidate);
        }
    }

    Ok(Device::Cpu)
}

fn held_devices() -> &'static Mutex<HashSet<Device>> {
    static HELD: OnceLock<Mutex<HashSet<Device>>> = OnceLock::new();
    HELD.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Exclusive process-wide ownership of a device for the duration of a job.
///
/// Local inference saturates its device; running two jobs on the same device
/// concurrently is rejected with [`Error::DeviceBusy`] rather than silently
/// time-sliced. The lease releases on drop.
#[derive(Debug)]
pub struct DeviceLease {
    device: Device,
}

impl DeviceLease {
    pub fn acquire(device: Device) -> Result<Self> {
        let mut held = held_devices()
            .lock()
            .map_err(|_| Error::msg("device lease registry poisoned"))?;
        if !held.insert(device) {
            return Err(Error::DeviceBusy(device));
        }
        Ok(Self { device })
    }

    pub fn device(&self) -> Device {
        self.device
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        if let Ok(mut held) = held_devices().lock() {
            held.remove(&self.device);
        }
    }
}
