//! `softstat report`: encodes one usage report and sends it to a server.
//!
//! Fire-and-forget, like every client: no acknowledgement is expected.

use chrono::Utc;
use clap::Args;
use stat_server::codec::{self, EncodeError};
use stat_server::datagram::{ModuleCoordinate, UsageDatagram};
use std::io;
use std::net::UdpSocket;

#[derive(Args, Debug)]
pub struct ReportArgs {
    /// Statistics server, `host:port`
    #[arg(long, default_value = "127.0.0.1:32597")]
    pub server: String,

    #[arg(long)]
    pub site: String,

    /// Module coordinate, `name:version:arch:mode`
    #[arg(long)]
    pub module: ModuleCoordinate,

    #[arg(long)]
    pub user: String,

    /// Reporting host; defaults to the local host name
    #[arg(long)]
    pub hostname: Option<String>,

    #[arg(long, default_value_t = 1)]
    pub ncpus: u32,

    #[arg(long, default_value_t = 1)]
    pub host_cpus: u32,

    #[arg(long, default_value_t = 0)]
    pub ngpus: u32,

    #[arg(long, default_value_t = 0)]
    pub host_gpus: u32,

    #[arg(long, default_value_t = 1)]
    pub nodes: u32,

    #[arg(long, default_value_t = 0)]
    pub flags: u32,
}

#[derive(thiserror::Error, Debug)]
pub enum ReportError {
    #[error("could not encode report: {0}")]
    Encode(#[from] EncodeError),
    #[error("could not determine local host name: {0}")]
    Hostname(#[source] io::Error),
    #[error("could not send report: {0}")]
    Send(#[from] io::Error),
}

impl ReportArgs {
    fn datagram(&self) -> Result<UsageDatagram, ReportError> {
        let hostname = match &self.hostname {
            Some(hostname) => hostname.clone(),
            None => dns_lookup::get_hostname().map_err(ReportError::Hostname)?,
        };

        Ok(UsageDatagram {
            site: self.site.clone(),
            module: self.module.clone(),
            user: self.user.clone(),
            hostname,
            ncpus: self.ncpus,
            host_cpus: self.host_cpus,
            ngpus: self.ngpus,
            host_gpus: self.host_gpus,
            nodes: self.nodes,
            flags: self.flags,
            timestamp: Utc::now(),
        })
    }
}

pub fn send(args: &ReportArgs) -> Result<usize, ReportError> {
    let datagram = args.datagram()?;
    let bytes = codec::encode(&datagram)?;

    let socket = UdpSocket::bind("0.0.0.0:0")?;
    let sent = socket.send_to(&bytes, &args.server)?;
    tracing::debug!(server = %args.server, module = %datagram.module, bytes = sent, "sent usage report");

    Ok(sent)
}
