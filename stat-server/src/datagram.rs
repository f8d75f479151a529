use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

/// Module coordinates as written by clients: `name:version:arch:mode`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleCoordinate {
    pub name: String,
    pub version: String,
    pub arch: String,
    pub mode: String,
}

impl ModuleCoordinate {
    pub fn new<N, V, A, M>(name: N, version: V, arch: A, mode: M) -> Self
    where
        N: Into<String>,
        V: Into<String>,
        A: Into<String>,
        M: Into<String>,
    {
        ModuleCoordinate {
            name: name.into(),
            version: version.into(),
            arch: arch.into(),
            mode: mode.into(),
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ModuleCoordinateError {
    #[error("expected name:version:arch:mode, got {0:?}")]
    WrongArity(String),
    #[error("empty {0} in module coordinate")]
    EmptyPart(&'static str),
}

impl FromStr for ModuleCoordinate {
    type Err = ModuleCoordinateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let [name, version, arch, mode] = parts[..] else {
            return Err(ModuleCoordinateError::WrongArity(s.to_string()));
        };

        for (label, part) in [
            ("name", name),
            ("version", version),
            ("arch", arch),
            ("mode", mode),
        ] {
            if part.is_empty() {
                return Err(ModuleCoordinateError::EmptyPart(label));
            }
        }

        Ok(ModuleCoordinate::new(name, version, arch, mode))
    }
}

impl fmt::Display for ModuleCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.name, self.version, self.arch, self.mode
        )
    }
}

/// One usage report as carried by a single datagram.
///
/// The checksum is not part of the value: it is produced by
/// [`crate::codec::encode`] and verified by [`crate::codec::decode`]. The
/// timestamp travels as whole seconds, so sub-second precision is dropped on the
/// wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UsageDatagram {
    pub site: String,
    pub module: ModuleCoordinate,
    pub user: String,
    pub hostname: String,
    pub ncpus: u32,
    pub host_cpus: u32,
    pub ngpus: u32,
    pub host_gpus: u32,
    pub nodes: u32,
    pub flags: u32,
    pub timestamp: DateTime<Utc>,
}

impl UsageDatagram {
    /// The seven textual dimensions in storage column order.
    pub fn dimensions(&self) -> [&str; 7] {
        [
            &self.site,
            &self.module.name,
            &self.module.version,
            &self.module.arch,
            &self.module.mode,
            &self.user,
            &self.hostname,
        ]
    }
}
