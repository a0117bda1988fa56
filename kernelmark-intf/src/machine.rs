// Copyright (c) The kernelmark Authors.
use anyhow::{anyhow, bail, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::OnceLock;

use km_util::*;

/// One entry of machines.json.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineEntry {
    pub isa: String,
    pub soc: String,
    pub kernel_defconfig: String,
    pub device_tree: String,
    pub mac: String,
    pub forward: String,
    pub logical_cpus: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    pub machines: BTreeMap<String, MachineEntry>,
}

impl JsonLoad for Manifest {}

impl Manifest {
    pub fn target(&self, name: &str) -> Result<TargetDescriptor> {
        match self.machines.get(name) {
            Some(ent) => TargetDescriptor::new(name, ent),
            None => bail!("machine {:?} not found in manifest", name),
        }
    }
}

/// Network identity and capabilities of a target machine. Read-only once
/// built. The address comes from the manifest's `ip` when present and is
/// otherwise resolved from the forwarding hostname on first successful use.
#[derive(Debug)]
pub struct TargetDescriptor {
    pub name: String,
    pub isa: String,
    pub soc: String,
    pub kernel_defconfig: String,
    pub device_tree: String,
    pub mac: String,
    pub forward: String,
    pub logical_cpus: u32,
    addr: OnceLock<IpAddr>,
}

impl TargetDescriptor {
    pub fn new(name: &str, ent: &MachineEntry) -> Result<Self> {
        if ent.logical_cpus == 0 {
            bail!("machine {:?} has zero logical_cpus", name);
        }

        let addr = OnceLock::new();
        if let Some(ip) = ent.ip.as_ref() {
            let parsed = ip
                .parse::<IpAddr>()
                .map_err(|e| anyhow!("machine {:?} has invalid ip {:?} ({})", name, ip, &e))?;
            let _ = addr.set(parsed);
        }

        Ok(Self {
            name: name.to_string(),
            isa: ent.isa.clone(),
            soc: ent.soc.clone(),
            kernel_defconfig: ent.kernel_defconfig.clone(),
            device_tree: ent.device_tree.clone(),
            mac: ent.mac.clone(),
            forward: ent.forward.clone(),
            logical_cpus: ent.logical_cpus,
            addr,
        })
    }

    fn resolve(host: &str) -> std::result::Result<IpAddr, String> {
        let addrs: Vec<IpAddr> = (host, 0)
            .to_socket_addrs()
            .map_err(|e| format!("failed to resolve {:?} ({})", host, &e))?
            .map(|sa| sa.ip())
            .collect();
        match addrs.iter().find(|a| a.is_ipv4()).or(addrs.first()) {
            Some(addr) => {
                debug!("target: resolved {:?} to {}", host, addr);
                Ok(*addr)
            }
            None => Err(format!("{:?} resolved to no address", host)),
        }
    }

    /// A failed lookup isn't cached and is retried on the next call.
    pub fn address(&self) -> Result<IpAddr> {
        if let Some(addr) = self.addr.get() {
            return Ok(*addr);
        }
        match Self::resolve(&self.forward) {
            Ok(addr) => Ok(*self.addr.get_or_init(|| addr)),
            Err(e) => bail!("{}: {}", &self.name, e),
        }
    }

    /// Placeholder values for command templates. `target` is omitted if the
    /// address can't be resolved.
    pub fn template_vars(&self) -> BTreeMap<&'static str, String> {
        let mut vars = BTreeMap::new();
        vars.insert("machine", self.name.clone());
        vars.insert("isa", self.isa.clone());
        vars.insert("soc", self.soc.clone());
        vars.insert("defconfig", self.kernel_defconfig.clone());
        vars.insert("device_tree", self.device_tree.clone());
        vars.insert("mac", self.mac.clone());
        vars.insert("forward", self.forward.clone());
        if let Ok(addr) = self.address() {
            vars.insert("target", addr.to_string());
        }
        vars
    }
}
