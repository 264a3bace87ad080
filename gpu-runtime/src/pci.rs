//! PCI address parsing

use std::fmt;
use std::str::FromStr;

/// `domain:bus:device.function` as printed by `lspci -D`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PciAddress {
    pub domain: u32,
    pub bus: u32,
    pub device: u32,
    pub function: u32,
}

/// Errors from parsing a PCI address string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid PCI address: {0:?}")]
pub struct ParsePciAddressError(String);

impl FromStr for PciAddress {
    type Err = ParsePciAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParsePciAddressError(s.to_string());
        let hex = |part: &str| u32::from_str_radix(part, 16).map_err(|_| invalid());

        let s = s.trim().trim_end_matches('\0');
        let (domain, rest) = s.split_once(':').ok_or_else(invalid)?;
        let (bus, rest) = rest.split_once(':').ok_or_else(invalid)?;
        // The function number is optional in some runtime versions
        let (device, function) = rest.split_once('.').unwrap_or((rest, "0"));

        Ok(Self {
            domain: hex(domain)?,
            bus: hex(bus)?,
            device: hex(device)?,
            function: hex(function)?,
        })
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}
