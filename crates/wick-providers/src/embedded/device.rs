use crate::engine::{Availability, Device, DeviceKind, InferenceBackend};
use anyhow::Result;
use tracing::{debug, warn};

/// Map a configured device string to a device kind.
///
/// Matching is case-insensitive. Absent or unrecognized values select the CPU.
pub fn parse_device_kind(value: Option<&str>) -> DeviceKind {
    let Some(raw) = value else {
        return DeviceKind::Cpu;
    };
    match raw.trim().to_lowercase().as_str() {
        "cpu" => DeviceKind::Cpu,
        "metal" => DeviceKind::Metal,
        "cuda" => DeviceKind::Cuda,
        other => {
            warn!("Unknown device '{}', falling back to cpu", other);
            DeviceKind::Cpu
        }
    }
}

/// Construct the device for `kind`, after confirming the engine is present.
pub fn select_device(
    backend: &dyn InferenceBackend,
    availability: &Availability,
    kind: DeviceKind,
) -> Result<Device> {
    availability.ensure()?;
    debug!("Constructing {} device via {}", kind, backend.name());
    backend.device(kind)
}
