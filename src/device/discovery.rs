use serialport::{SerialPortInfo, SerialPortType};

use crate::error::BridgeError;

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

/// Manufacturer substrings reported by the controller's USB bridge chips.
pub const KNOWN_MANUFACTURERS: [&str; 2] = ["Arduino", "wch.cn"];

/// Arduino's own VID and the CH340 clone chip's VID.
pub const KNOWN_VENDOR_IDS: [u16; 2] = [0x2341, 0x1a86];

#[cfg(target_os = "macos")]
pub const FALLBACK_PATH_PATTERNS: &[&str] = &["usbmodem", "usbserial"];

#[cfg(target_os = "windows")]
pub const FALLBACK_PATH_PATTERNS: &[&str] = &["COM"];

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
pub const FALLBACK_PATH_PATTERNS: &[&str] = &["ttyACM", "ttyUSB"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortCandidate {
    pub path: String,
    pub manufacturer: Option<String>,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

impl PortCandidate {
    pub fn describe(&self) -> String {
        let manufacturer = self.manufacturer.as_deref().unwrap_or("Unknown");
        match (self.vendor_id, self.product_id) {
            (Some(vid), Some(pid)) => {
                format!("{} ({manufacturer}, {vid:04x}:{pid:04x})", self.path)
            }
            _ => format!("{} ({manufacturer})", self.path),
        }
    }
}

impl From<SerialPortInfo> for PortCandidate {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb) => Self {
                path: info.port_name,
                manufacturer: usb.manufacturer,
                vendor_id: Some(usb.vid),
                product_id: Some(usb.pid),
            },
            _ => Self {
                path: info.port_name,
                manufacturer: None,
                vendor_id: None,
                product_id: None,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchReason {
    Manufacturer,
    VendorId,
    PathPattern,
    Explicit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMatch {
    pub path: String,
    pub reason: MatchReason,
}

pub fn list_candidates() -> Result<Vec<PortCandidate>, BridgeError> {
    let ports = serialport::available_ports()?;
    Ok(ports.into_iter().map(PortCandidate::from).collect())
}

/// Picks the controller's port.
///
/// Known manufacturer or vendor id first; otherwise the first port whose path
/// looks like a USB serial adapter on this platform.
pub fn select_port(candidates: &[PortCandidate]) -> Result<PortMatch, BridgeError> {
    let known = candidates.iter().find_map(|candidate| {
        let by_manufacturer = candidate.manufacturer.as_deref().is_some_and(|m| {
            KNOWN_MANUFACTURERS
                .iter()
                .any(|known| m.contains(known))
        });
        if by_manufacturer {
            return Some((candidate, MatchReason::Manufacturer));
        }
        candidate
            .vendor_id
            .filter(|vid| KNOWN_VENDOR_IDS.contains(vid))
            .map(|_| (candidate, MatchReason::VendorId))
    });

    if let Some((candidate, reason)) = known {
        log_info!("Controller detected on {}", candidate.describe());
        return Ok(PortMatch {
            path: candidate.path.clone(),
            reason,
        });
    }

    log_warn!("Controller not auto-detected. Available ports:");
    for candidate in candidates {
        log_warn!("  - {}", candidate.describe());
    }

    let fallback = candidates.iter().find(|candidate| {
        FALLBACK_PATH_PATTERNS
            .iter()
            .any(|pattern| candidate.path.contains(pattern))
    });

    match fallback {
        Some(candidate) => {
            log_info!("Using fallback port {}", candidate.path);
            Ok(PortMatch {
                path: candidate.path.clone(),
                reason: MatchReason::PathPattern,
            })
        }
        None => Err(BridgeError::DeviceNotFound {
            candidates: candidates.iter().map(PortCandidate::describe).collect(),
        }),
    }
}

pub fn discover() -> Result<PortMatch, BridgeError> {
    let candidates = list_candidates()?;
    select_port(&candidates)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb(path: &str, manufacturer: Option<&str>, vid: u16) -> PortCandidate {
        PortCandidate {
            path: path.into(),
            manufacturer: manufacturer.map(Into::into),
            vendor_id: Some(vid),
            product_id: Some(0x0042),
        }
    }

    fn plain(path: &str) -> PortCandidate {
        PortCandidate {
            path: path.into(),
            manufacturer: None,
            vendor_id: None,
            product_id: None,
        }
    }

    fn fallback_path() -> String {
        format!("/dev/{}0", FALLBACK_PATH_PATTERNS[0])
    }

    #[test]
    fn manufacturer_match_wins() {
        let ports = vec![
            usb("/dev/a", Some("FTDI"), 0x0403),
            usb("/dev/b", Some("Arduino (www.arduino.cc)"), 0x0403),
        ];
        assert_eq!(
            select_port(&ports).unwrap(),
            PortMatch {
                path: "/dev/b".into(),
                reason: MatchReason::Manufacturer
            }
        );
    }

    #[test]
    fn vendor_id_match() {
        let ports = vec![plain("/dev/ttyS0"), usb("/dev/c", None, 0x1a86)];
        assert_eq!(
            select_port(&ports).unwrap(),
            PortMatch {
                path: "/dev/c".into(),
                reason: MatchReason::VendorId
            }
        );
    }

    #[test]
    fn first_known_candidate_in_enumeration_order() {
        let ports = vec![usb("/dev/x", None, 0x2341), usb("/dev/y", Some("wch.cn"), 0x1a86)];
        assert_eq!(select_port(&ports).unwrap().path, "/dev/x");
    }

    #[test]
    fn falls_back_to_platform_path_pattern() {
        let path = fallback_path();
        let ports = vec![plain("/dev/ttyS0"), usb(&path, Some("Generic"), 0x0403)];
        assert_eq!(
            select_port(&ports).unwrap(),
            PortMatch {
                path,
                reason: MatchReason::PathPattern
            }
        );
    }

    #[test]
    fn nothing_matches_lists_every_candidate() {
        let ports = vec![plain("/dev/ttyS0"), usb("/dev/ttyS1", Some("FTDI"), 0x0403)];
        match select_port(&ports) {
            Err(BridgeError::DeviceNotFound { candidates }) => {
                assert_eq!(candidates.len(), 2);
                assert_eq!(candidates[0], "/dev/ttyS0 (Unknown)");
                assert_eq!(candidates[1], "/dev/ttyS1 (FTDI, 0403:0042)");
            }
            other => panic!("expected DeviceNotFound, got {other:?}"),
        }
    }

    #[test]
    fn empty_enumeration_is_not_found() {
        assert!(matches!(
            select_port(&[]),
            Err(BridgeError::DeviceNotFound { .. })
        ));
    }
}
