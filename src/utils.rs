use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use v4l::{capability::Flags, context, Device};

use crate::error::CaptureError;

// Detected capture device info
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundDevice {
    pub index: usize,
    pub path: String,
    pub name: String,
}

impl FoundDevice {
    pub fn new(index: usize, path: String, name: String) -> Self {
        Self { index, path, name }
    }
}

/// Enumerate every V4L2 node that supports video capture, lowest index first
pub fn enumerate_devices() -> Vec<FoundDevice> {
    let mut nodes = context::enum_devices();
    nodes.sort_by_key(|node| node.index());

    let mut found = Vec::new();
    for node in nodes {
        let path = node.path().to_string_lossy().into_owned();
        let Ok(dev) = Device::with_path(node.path()) else {
            debug!("Skipping {}: cannot open", path);
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            debug!("Skipping {}: cannot query capabilities", path);
            continue;
        };
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            continue;
        }
        let name = node.name().unwrap_or(caps.card);
        found.push(FoundDevice::new(node.index(), path, name));
    }
    found
}

/// Pick the device whose name equals `target`, else the system default.
///
/// The default is the first entry, i.e. the lowest-index capture node.
pub fn select_device(devices: &[FoundDevice], target: &str) -> Option<FoundDevice> {
    let by_name = (!target.is_empty())
        .then(|| devices.iter().find(|d| d.name == target))
        .flatten();
    by_name.or_else(|| devices.first()).cloned()
}

/// Enumerate, log, then select the capture device for this session
pub fn discover_device(target: &str) -> Result<FoundDevice, CaptureError> {
    info!("Enumerating capture devices...");

    let devices = enumerate_devices();
    for device in &devices {
        info!("  {} - {}", device.path, device.name);
    }

    let selected = select_device(&devices, target).ok_or(CaptureError::NoDevice)?;
    if !target.is_empty() && selected.name != target {
        info!("Target device {:?} not found, using system default", target);
    }
    info!("Using capture device: {} - {}", selected.path, selected.name);
    Ok(selected)
}
