//! FTDI adapter detection
//!
//! The scale is reached through an FTDI USB-serial adapter. An endpoint
//! qualifies when its manufacturer string mentions FTDI or its USB vendor id
//! is FTDI's.

use crate::core::transport::{EndpointInfo, PortEnumerator, TransportError};
use tracing::{debug, warn};

/// FTDI USB vendor id
pub const FTDI_VENDOR_ID: u16 = 0x0403;

/// Whether `endpoint` looks like an FTDI adapter
pub fn is_ftdi(endpoint: &EndpointInfo) -> bool {
    let by_manufacturer = endpoint
        .manufacturer
        .as_deref()
        .is_some_and(|m| m.to_lowercase().contains("ftdi"));

    by_manufacturer || endpoint.vendor_id == Some(FTDI_VENDOR_ID)
}

/// First FTDI adapter in enumeration order
pub fn find_ftdi(endpoints: &[EndpointInfo]) -> Option<&EndpointInfo> {
    let mut matches = endpoints.iter().filter(|e| is_ftdi(e));
    let found = matches.next();
    let others = matches.count();
    if others > 0 {
        warn!(
            "{} FTDI devices found, using {}",
            others + 1,
            found.map_or("", |e| e.path.as_str())
        );
    }
    debug!(
        candidates = endpoints.len(),
        found = found.map(|e| e.path.as_str()),
        "FTDI detection"
    );
    found
}

/// Enumerate and pick the first FTDI adapter's path
pub fn detect(enumerator: &dyn PortEnumerator) -> Result<String, TransportError> {
    let endpoints = enumerator.list_ports()?;
    find_ftdi(&endpoints)
        .map(|e| e.path.clone())
        .ok_or(TransportError::NoDeviceFound)
}
