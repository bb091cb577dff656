//! Host-side serial port discovery.
//!
//! Discovery is a brute-force scan: every candidate name is opened and
//! closed again, and the names that open are reported.

use log::{debug, trace};

use crate::port::{Connector, PortInfo, SerialConfig};

/// Number of `COMn` names tried on Windows.
#[cfg(windows)]
const COM_PORT_COUNT: u32 = 255;

/// Candidate names: the platform enumeration, plus `COM0`..`COM254` on
/// Windows.
pub fn default_candidates(connector: &dyn Connector) -> Vec<String> {
    let mut names: Vec<String> = connector
        .list_ports()
        .unwrap_or_default()
        .into_iter()
        .map(|p| p.name)
        .collect();

    #[cfg(windows)]
    names.extend((0..COM_PORT_COUNT).map(|i| format!("COM{i}")));

    let mut seen = std::collections::HashSet::new();
    names.retain(|n| seen.insert(n.clone()));
    names
}

/// Keep the candidates that can be opened.
///
/// `open_port` is the port currently held by the session; it is reported
/// without being reopened.
pub fn scan_ports<I>(
    connector: &dyn Connector,
    config: &SerialConfig,
    candidates: I,
    open_port: Option<&str>,
) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut found = Vec::new();
    for name in candidates {
        if open_port == Some(name.as_str()) {
            found.push(name);
            continue;
        }
        match connector.connect(&config.for_port(name.as_str())) {
            Ok(mut port) => {
                let _ = port.close();
                debug!("Found serial port {name}");
                found.push(name);
            },
            Err(e) => trace!("{name}: {e}"),
        }
    }
    found
}

/// One-line description of a port for listings.
pub fn describe_port(info: &PortInfo) -> String {
    match (info.vid, info.pid) {
        (Some(vid), Some(pid)) => {
            let product = info.product.as_deref().unwrap_or("USB serial");
            format!("{} - {product} [{vid:04X}:{pid:04X}]", info.name)
        },
        _ => info.name.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::{MockConnector, MockPort};

    #[test]
    fn test_scan_keeps_openable_ports() {
        let port = MockPort::new(&[]);
        let connector = MockConnector::new(port.clone()).with_available(&["COM3", "COM7"]);
        let candidates = (0..10).map(|i| format!("COM{i}"));

        let found = scan_ports(&connector, &SerialConfig::default(), candidates, None);
        assert_eq!(found, vec!["COM3".to_string(), "COM7".to_string()]);
        assert_eq!(port.state().opens, 2);
        assert_eq!(port.state().closes, 2);
    }

    #[test]
    fn test_scan_reports_open_port_without_reopening() {
        let port = MockPort::new(&[]);
        let connector = MockConnector::new(port.clone()).with_available(&["COM3", "COM7"]);
        let candidates = ["COM3", "COM7"].map(String::from);

        let found = scan_ports(&connector, &SerialConfig::default(), candidates, Some("COM3"));
        assert_eq!(found.len(), 2);
        assert_eq!(port.state().opens, 1);
    }

    #[test]
    fn test_default_candidates_deduplicates() {
        let connector =
            MockConnector::new(MockPort::new(&[])).with_available(&["/dev/ttyUSB0", "/dev/ttyUSB0"]);
        let names = default_candidates(&connector);
        assert_eq!(names.iter().filter(|n| *n == "/dev/ttyUSB0").count(), 1);
    }

    #[test]
    fn test_describe_port() {
        let info = PortInfo {
            name: "/dev/ttyUSB0".into(),
            vid: Some(0x1A86),
            pid: Some(0x7523),
            product: None,
        };
        assert_eq!(describe_port(&info), "/dev/ttyUSB0 - USB serial [1A86:7523]");
        assert_eq!(describe_port(&PortInfo::named("COM1")), "COM1");
    }
}
