use crate::authorizer::HostResolver;
use crate::datagram::{ModuleCoordinate, UsageDatagram};
use chrono::DateTime;
use std::collections::HashMap;
use std::io;
use std::net::IpAddr;

/// Resolver backed by a fixed table; unknown addresses fail to resolve.
#[derive(Default)]
pub struct StaticResolver {
    names: HashMap<IpAddr, String>,
}

impl StaticResolver {
    pub fn with(mut self, addr: IpAddr, name: &str) -> Self {
        self.names.insert(addr, name.to_string());
        self
    }
}

impl HostResolver for StaticResolver {
    fn resolve(&self, addr: IpAddr) -> io::Result<String> {
        self.names
            .get(&addr)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no name for {addr}")))
    }
}

pub const SAMPLE_TIMESTAMP: i64 = 1_700_000_000;

pub fn sample_datagram() -> UsageDatagram {
    UsageDatagram {
        site: "site1".into(),
        module: ModuleCoordinate::new("gcc", "9.2", "x86_64", "release"),
        user: "alice".into(),
        hostname: "node1".into(),
        ncpus: 4,
        host_cpus: 8,
        ngpus: 0,
        host_gpus: 0,
        nodes: 1,
        flags: 0,
        timestamp: DateTime::from_timestamp(SAMPLE_TIMESTAMP, 0).unwrap(),
    }
}
