//! Classification of flow endpoints against this host's addresses.

use std::collections::HashSet;
use std::net::IpAddr;

use thiserror::Error;

/// Errors classifying a (source, destination) address pair.
#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("invalid source IP {0:?}")]
    InvalidSrc(String),

    #[error("invalid destination IP {0:?}")]
    InvalidDst(String),

    #[error("neither endpoint is local: {src} -> {dst}")]
    NoneLocal { src: IpAddr, dst: IpAddr },

    #[error("both endpoints are local: {src} -> {dst}")]
    BothLocal { src: IpAddr, dst: IpAddr },
}

/// The host's IP addresses, enumerated once at startup.
#[derive(Debug, Clone)]
pub struct LocalAddrs {
    addrs: HashSet<IpAddr>,
}

impl LocalAddrs {
    /// Enumerate the addresses of every interface on this host.
    pub fn discover() -> anyhow::Result<Self> {
        let addrs: HashSet<IpAddr> = pnet::datalink::interfaces()
            .into_iter()
            .flat_map(|iface| iface.ips)
            .map(|network| network.ip())
            .collect();

        if addrs.is_empty() {
            anyhow::bail!("no local interface addresses found");
        }

        Ok(Self { addrs })
    }

    /// Build from a fixed address set. This is the enumeration seam the
    /// tests use in place of [`LocalAddrs::discover`].
    pub fn from_addrs(addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            addrs: addrs.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    /// Return the remote endpoint of a flow: the one address of the
    /// pair that is not local to this host. Pairs where neither or both
    /// sides are local are rejected.
    pub fn remote_ip(&self, src_ip: &str, dst_ip: &str) -> Result<IpAddr, ClassifyError> {
        let src: IpAddr = src_ip
            .parse()
            .map_err(|_| ClassifyError::InvalidSrc(src_ip.to_string()))?;
        let dst: IpAddr = dst_ip
            .parse()
            .map_err(|_| ClassifyError::InvalidDst(dst_ip.to_string()))?;

        match (self.addrs.contains(&src), self.addrs.contains(&dst)) {
            (true, false) => Ok(dst),
            (false, true) => Ok(src),
            (false, false) => Err(ClassifyError::NoneLocal { src, dst }),
            (true, true) => Err(ClassifyError::BothLocal { src, dst }),
        }
    }
}
