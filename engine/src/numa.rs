//! Host memory topology
//!
//! Resolves the NUMA node a PCI device is attached to and steers subsequent
//! host allocations of the calling thread to it. Resolution failures are
//! never errors: the caller simply allocates without a preference.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, warn};

/// Where the kernel publishes per-bus device attributes
pub const SYSFS_PCI_BUS_ROOT: &str = "/sys/class/pci_bus";

/// NUMA topology service
pub trait NumaTopology: Send + Sync {
    /// NUMA node of the PCI bus `domain:bus`, if the platform reports one
    fn node_of_pci_bus(&self, domain: u32, bus: u32) -> Option<u32>;

    /// Prefer `node` for allocations made by the calling thread
    fn set_preferred(&self, node: u32) -> io::Result<()>;

    /// Return the calling thread to the default allocation policy
    fn clear_preferred(&self) -> io::Result<()>;
}

/// Topology read from sysfs, with the Linux `set_mempolicy` syscall for placement
#[derive(Debug, Clone)]
pub struct SysfsTopology {
    root: PathBuf,
}

impl SysfsTopology {
    pub fn new() -> Self {
        Self::with_root(SYSFS_PCI_BUS_ROOT)
    }

    /// Read `<root>/<dddd>:<bb>/device/numa_node` instead of the system path
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn node_file(&self, domain: u32, bus: u32) -> PathBuf {
        self.root
            .join(format!("{:04x}:{:02x}", domain, bus))
            .join("device")
            .join("numa_node")
    }
}

impl Default for SysfsTopology {
    fn default() -> Self {
        Self::new()
    }
}

impl NumaTopology for SysfsTopology {
    fn node_of_pci_bus(&self, domain: u32, bus: u32) -> Option<u32> {
        let path = self.node_file(domain, bus);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) => {
                warn!("Cannot read {}: {}", path.display(), e);
                return None;
            }
        };

        match contents.trim().parse::<i32>() {
            // The kernel writes -1 when the bus has no NUMA affinity
            Ok(node) if node >= 0 => Some(node as u32),
            Ok(_) => {
                debug!("{} reports no NUMA affinity", path.display());
                None
            }
            Err(e) => {
                warn!("Unexpected contents in {}: {}", path.display(), e);
                None
            }
        }
    }

    fn set_preferred(&self, node: u32) -> io::Result<()> {
        mempolicy::set_preferred(node)
    }

    fn clear_preferred(&self) -> io::Result<()> {
        mempolicy::set_default()
    }
}

#[cfg(target_os = "linux")]
mod mempolicy {
    use std::io;

    const MPOL_DEFAULT: libc::c_int = 0;
    const MPOL_PREFERRED: libc::c_int = 1;

    pub fn set_preferred(node: u32) -> io::Result<()> {
        let bits = libc::c_ulong::BITS as usize;
        let node = node as usize;
        let mut mask: Vec<libc::c_ulong> = vec![0; node / bits + 1];
        mask[node / bits] |= 1 << (node % bits);
        let max_node = (mask.len() * bits + 1) as libc::c_ulong;

        set_mempolicy(MPOL_PREFERRED, mask.as_ptr(), max_node)
    }

    pub fn set_default() -> io::Result<()> {
        set_mempolicy(MPOL_DEFAULT, std::ptr::null(), 0)
    }

    fn set_mempolicy(
        mode: libc::c_int,
        mask: *const libc::c_ulong,
        max_node: libc::c_ulong,
    ) -> io::Result<()> {
        // SAFETY: `mask` is null or points to a live nodemask of
        // `max_node - 1` bits; the kernel only reads from it.
        let ret = unsafe { libc::syscall(libc::SYS_set_mempolicy, mode, mask, max_node) };
        if ret == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod mempolicy {
    use std::io;

    pub fn set_preferred(_node: u32) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "NUMA memory policy requires Linux",
        ))
    }

    pub fn set_default() -> io::Result<()> {
        Ok(())
    }
}

/// Topology with a fixed bus → node table that records placement requests.
///
/// Used by the simulated runtime and by tests.
#[derive(Debug, Default)]
pub struct StaticTopology {
    nodes: HashMap<(u32, u32), u32>,
    requests: Mutex<Vec<PlacementRequest>>,
}

/// A placement call observed by [`StaticTopology`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementRequest {
    Prefer(u32),
    Clear,
}

impl StaticTopology {
    /// A topology where no bus resolves to a node
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_node(mut self, domain: u32, bus: u32, node: u32) -> Self {
        self.nodes.insert((domain, bus), node);
        self
    }

    /// Placement calls made so far, in order
    pub fn requests(&self) -> Vec<PlacementRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn push(&self, request: PlacementRequest) {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
    }
}

impl NumaTopology for StaticTopology {
    fn node_of_pci_bus(&self, domain: u32, bus: u32) -> Option<u32> {
        self.nodes.get(&(domain, bus)).copied()
    }

    fn set_preferred(&self, node: u32) -> io::Result<()> {
        self.push(PlacementRequest::Prefer(node));
        Ok(())
    }

    fn clear_preferred(&self) -> io::Result<()> {
        self.push(PlacementRequest::Clear);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_node_file(root: &Path, bus: &str, contents: &str) {
        let dir = root.join(bus).join("device");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("numa_node"), contents).unwrap();
    }

    #[test]
    fn test_sysfs_resolves_node() {
        let temp_dir = tempfile::tempdir().unwrap();
        write_node_file(temp_dir.path(), "0000:3b", "1\n");

        let topology = SysfsTopology::with_root(temp_dir.path());
        assert_eq!(topology.node_of_pci_bus(0, 0x3b), Some(1));
    }

    #[test]
    fn test_sysfs_formats_domain_and_bus_as_hex() {
        let temp_dir = tempfile::tempdir().unwrap();
        write_node_file(temp_dir.path(), "0001:c1", "3");

        let topology = SysfsTopology::with_root(temp_dir.path());
        assert_eq!(topology.node_of_pci_bus(1, 0xc1), Some(3));
        assert_eq!(topology.node_of_pci_bus(0, 0xc1), None);
    }

    #[test]
    fn test_sysfs_missing_file_is_unresolved() {
        let temp_dir = tempfile::tempdir().unwrap();
        let topology = SysfsTopology::with_root(temp_dir.path());
        assert_eq!(topology.node_of_pci_bus(0, 0x3b), None);
    }

    #[test]
    fn test_sysfs_no_affinity_and_garbage() {
        let temp_dir = tempfile::tempdir().unwrap();
        write_node_file(temp_dir.path(), "0000:01", "-1\n");
        write_node_file(temp_dir.path(), "0000:02", "node0");

        let topology = SysfsTopology::with_root(temp_dir.path());
        assert_eq!(topology.node_of_pci_bus(0, 0x01), None);
        assert_eq!(topology.node_of_pci_bus(0, 0x02), None);
    }

    #[test]
    fn test_static_topology_records_requests() {
        let topology = StaticTopology::empty().with_node(0, 0x10, 0);
        assert_eq!(topology.node_of_pci_bus(0, 0x10), Some(0));
        assert_eq!(topology.node_of_pci_bus(0, 0x20), None);

        topology.set_preferred(0).unwrap();
        topology.clear_preferred().unwrap();
        assert_eq!(
            topology.requests(),
            vec![PlacementRequest::Prefer(0), PlacementRequest::Clear]
        );
    }
}
