//! Output discovery: choose connector, mode and CRTC once at startup

use crate::error::DisplayError;

/// One display mode as reported by the connector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeInfo {
    pub width: u16,
    pub height: u16,
    pub refresh: u32,
}

/// Connector facts gathered from the device, backend-neutral
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorInfo {
    pub id: u32,
    pub connected: bool,
    /// HDMI-A on the target board
    pub preferred_class: bool,
    pub modes: Vec<ModeInfo>,
    /// CRTC currently routed through the connector's encoder
    pub current_crtc: Option<u32>,
    /// CRTCs the connector's first encoder can drive, in resource order
    pub possible_crtcs: Vec<u32>,
}

/// Mode we try to find before falling back to the first listed one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModePreference {
    pub width: u16,
    pub height: u16,
    pub refresh: u32,
}

impl Default for ModePreference {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            refresh: 60,
        }
    }
}

/// Immutable result of output discovery (no hotplug handling)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputConfig {
    pub connector_id: u32,
    pub crtc_id: u32,
    pub mode: ModeInfo,
    /// Index of `mode` in the connector's mode list
    pub mode_index: usize,
}

/// Pick the output to drive.
///
/// A connected connector of the preferred class wins, otherwise the first
/// connected connector. Either way it must list at least one mode. Among its
/// modes the preferred one wins, otherwise the first.
pub fn select_output(connectors: &[ConnectorInfo], preference: ModePreference) -> Result<OutputConfig, DisplayError> {
    let usable = |c: &&ConnectorInfo| c.connected && !c.modes.is_empty();
    let connector = connectors
        .iter()
        .filter(usable)
        .find(|c| c.preferred_class)
        .or_else(|| connectors.iter().find(usable))
        .ok_or(DisplayError::NoConnectedOutput)?;

    let mode_index = connector
        .modes
        .iter()
        .position(|m| {
            m.width == preference.width && m.height == preference.height && m.refresh == preference.refresh
        })
        .unwrap_or(0);

    let crtc_id = connector
        .current_crtc
        .or_else(|| connector.possible_crtcs.first().copied())
        .ok_or(DisplayError::NoCrtc(connector.id))?;

    Ok(OutputConfig {
        connector_id: connector.id,
        crtc_id,
        mode: connector.modes[mode_index],
        mode_index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mode(width: u16, height: u16, refresh: u32) -> ModeInfo {
        ModeInfo { width, height, refresh }
    }

    fn connector(id: u32, connected: bool, preferred_class: bool, modes: Vec<ModeInfo>) -> ConnectorInfo {
        ConnectorInfo {
            id,
            connected,
            preferred_class,
            modes,
            current_crtc: None,
            possible_crtcs: vec![40, 41],
        }
    }

    #[test]
    fn test_prefers_connected_hdmi_and_native_mode() {
        let connectors = vec![
            connector(1, true, false, vec![mode(1280, 720, 60)]),
            connector(2, true, true, vec![mode(3840, 2160, 30), mode(1920, 1080, 50), mode(1920, 1080, 60)]),
        ];

        let output = select_output(&connectors, ModePreference::default()).unwrap();
        assert_eq!(output.connector_id, 2);
        assert_eq!(output.mode, mode(1920, 1080, 60));
        assert_eq!(output.mode_index, 2);
        assert_eq!(output.crtc_id, 40);
    }

    #[test]
    fn test_falls_back_to_first_connected_and_first_mode() {
        let connectors = vec![
            connector(1, false, true, vec![mode(1920, 1080, 60)]),
            connector(2, true, false, vec![]),
            connector(3, true, false, vec![mode(1024, 768, 75), mode(800, 600, 60)]),
        ];

        let output = select_output(&connectors, ModePreference::default()).unwrap();
        assert_eq!(output.connector_id, 3);
        assert_eq!(output.mode, mode(1024, 768, 75));
    }

    #[test]
    fn test_current_crtc_wins() {
        let mut hdmi = connector(7, true, true, vec![mode(1920, 1080, 60)]);
        hdmi.current_crtc = Some(99);
        assert_eq!(select_output(&[hdmi], ModePreference::default()).unwrap().crtc_id, 99);
    }

    #[test]
    fn test_failures() {
        let unplugged = vec![connector(1, false, true, vec![mode(1920, 1080, 60)])];
        assert!(matches!(
            select_output(&unplugged, ModePreference::default()),
            Err(DisplayError::NoConnectedOutput)
        ));

        let mut orphan = connector(5, true, true, vec![mode(1920, 1080, 60)]);
        orphan.possible_crtcs.clear();
        assert!(matches!(
            select_output(&[orphan], ModePreference::default()),
            Err(DisplayError::NoCrtc(5))
        ));
    }
}
