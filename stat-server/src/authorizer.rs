//! Host based authorization of incoming reports.
//!
//! Two independent failure axes:
//! - an empty pattern list authorizes every host,
//! - a peer whose name cannot be resolved is never authorized.

use glob::{Pattern, PatternError};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// Maps a peer address to the host name the patterns are matched against.
pub trait HostResolver: Send + Sync {
    fn resolve(&self, addr: IpAddr) -> io::Result<String>;
}

/// Reverse lookup through the system resolver.
///
/// A peer without a PTR record resolves to its numeric address, so patterns may
/// also be written against addresses. Only real lookup failures are errors.
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn resolve(&self, addr: IpAddr) -> io::Result<String> {
        // No NI_NAMEREQD: fall back to the numeric host
        let (host, _service) =
            dns_lookup::getnameinfo(&SocketAddr::new(addr, 0), libc::NI_NUMERICSERV)?;
        Ok(host)
    }
}

#[derive(Debug)]
pub enum Authorization {
    Authorized { hostname: String },
    Denied { hostname: String },
    Unresolved(io::Error),
}

impl Authorization {
    pub fn is_authorized(&self) -> bool {
        matches!(self, Authorization::Authorized { .. })
    }
}

#[derive(Clone)]
pub struct Authorizer {
    patterns: Arc<Vec<Pattern>>,
    resolver: Arc<dyn HostResolver>,
}

impl Authorizer {
    pub fn new(patterns: Vec<Pattern>, resolver: Arc<dyn HostResolver>) -> Self {
        Authorizer {
            patterns: Arc::new(patterns),
            resolver,
        }
    }

    /// Compiles shell glob patterns such as `*.example.org` or `node[0-9].lab`.
    pub fn from_globs<S: AsRef<str>>(
        globs: &[S],
        resolver: Arc<dyn HostResolver>,
    ) -> Result<Self, PatternError> {
        let patterns = globs
            .iter()
            .map(|glob| Pattern::new(glob.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(patterns, resolver))
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    /// True if the host may submit data.
    pub fn is_authorized(&self, hostname: &str) -> bool {
        if self.patterns.is_empty() {
            return true;
        }
        self.patterns.iter().any(|pattern| pattern.matches(hostname))
    }

    /// Resolves the sender address and checks the resulting name.
    pub fn authorize(&self, addr: IpAddr) -> Authorization {
        match self.resolver.resolve(addr) {
            Ok(hostname) if self.is_authorized(&hostname) => {
                Authorization::Authorized { hostname }
            }
            Ok(hostname) => Authorization::Denied { hostname },
            Err(e) => Authorization::Unresolved(e),
        }
    }
}
