//! Input device discovery and selection.

use serde::Serialize;

/// One microphone as reported by the host audio API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub name: String,
    pub is_default: bool,
    /// Name suggests it records system output ("Stereo Mix", "Monitor of ...").
    /// Such a device hears the assistant's own voice and would barge in on it.
    pub is_loopback: bool,
    /// The single device we would pick if the user expressed no preference.
    pub is_recommended: bool,
}

const LOOPBACK_HINTS: &[&str] = &[
    "stereo mix",
    "what u hear",
    "what you hear",
    "wave out",
    "loopback",
    "monitor of",
    "speakers (",
    "headphones (",
];

const MICROPHONE_HINTS: &[&str] = &["microphone", "mic", "headset", "array", "usb", "webcam"];

pub fn looks_like_loopback(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    LOOPBACK_HINTS.iter().any(|hint| name.contains(hint))
}

fn rank(name: &str, is_default: bool) -> i32 {
    let lowered = name.to_ascii_lowercase();
    let mut score = if looks_like_loopback(&lowered) { -10 } else { 10 };
    if MICROPHONE_HINTS.iter().any(|hint| lowered.contains(hint)) {
        score += 5;
    }
    if is_default {
        score += 3;
    }
    score
}

/// Build the listing from `(name, is_default)` pairs: mark the recommended
/// device and order recommended → non-loopback → default → by name.
pub fn describe_devices<I>(devices: I) -> Vec<DeviceInfo>
where
    I: IntoIterator<Item = (String, bool)>,
{
    let mut list: Vec<DeviceInfo> = devices
        .into_iter()
        .map(|(name, is_default)| DeviceInfo {
            is_loopback: looks_like_loopback(&name),
            name,
            is_default,
            is_recommended: false,
        })
        .collect();

    let best = list
        .iter()
        .enumerate()
        .max_by_key(|(_, d)| rank(&d.name, d.is_default))
        .map(|(idx, _)| idx);
    if let Some(best) = best.and_then(|idx| list.get_mut(idx)) {
        best.is_recommended = !best.is_loopback;
    }

    list.sort_by_key(|d| {
        (
            !d.is_recommended,
            d.is_loopback,
            !d.is_default,
            d.name.to_ascii_lowercase(),
        )
    });
    list
}

/// All input devices on the default host. Empty when enumeration fails.
#[cfg(feature = "audio-cpal")]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let devices = match host.input_devices() {
        Ok(devices) => devices,
        Err(e) => {
            tracing::warn!("failed to enumerate input devices: {e}");
            return Vec::new();
        }
    };

    describe_devices(devices.enumerate().map(|(idx, device)| {
        let name = device
            .name()
            .unwrap_or_else(|_| format!("Input Device {}", idx + 1));
        let is_default = default_name.as_deref() == Some(name.as_str());
        (name, is_default)
    }))
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    Vec::new()
}

/// Resolve the device to open: the preferred one by exact name, then the
/// host default, then the first enumerated input.
#[cfg(feature = "audio-cpal")]
pub(crate) fn resolve_input_device(preferred: Option<&str>) -> crate::error::Result<cpal::Device> {
    use crate::error::ParleyError;
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();

    if let Some(wanted) = preferred {
        match host.input_devices() {
            Ok(mut devices) => {
                if let Some(device) =
                    devices.find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
                {
                    return Ok(device);
                }
                tracing::warn!(device = wanted, "preferred input device not found, falling back");
            }
            Err(e) => tracing::warn!("failed to list input devices: {e}"),
        }
    }

    if let Some(device) = host.default_input_device() {
        return Ok(device);
    }

    let mut devices = host
        .input_devices()
        .map_err(|e| ParleyError::AudioDevice(e.to_string()))?;
    devices.next().ok_or(ParleyError::NoInputDevice)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_names_are_flagged() {
        assert!(looks_like_loopback("Stereo Mix (Realtek Audio)"));
        assert!(looks_like_loopback("Monitor of Built-in Audio Analog Stereo"));
        assert!(!looks_like_loopback("Microphone Array (Intel SST)"));
    }

    #[test]
    fn microphone_is_recommended_over_default_loopback() {
        let list = describe_devices(vec![
            ("Stereo Mix (Realtek Audio)".to_string(), true),
            ("USB Microphone".to_string(), false),
        ]);
        assert_eq!(list[0].name, "USB Microphone");
        assert!(list[0].is_recommended);
        assert!(!list[1].is_recommended);
        assert!(list[1].is_default);
    }

    #[test]
    fn only_loopback_devices_yield_no_recommendation() {
        let list = describe_devices(vec![("Stereo Mix".to_string(), true)]);
        assert_eq!(list.len(), 1);
        assert!(!list[0].is_recommended);
    }
}
