//! Local-network peer discovery.
//!
//! Host mode advertises the session's listening port as an mDNS
//! service record; client mode browses for that service type and
//! resolves the first candidate to a connectable address. Exactly one
//! discovery attempt runs per session lifetime — it is consumed once
//! a connection exists and is never restarted internally. Every
//! failure mode (registration rejected, search error, resolution
//! never arriving, the daemon dying) collapses into a single generic
//! "discovery failed" signal; retry means building a fresh session.
//!
//! mdns-sd delivers events on its own flume channels; each is bridged
//! to the session loop by a small forwarding task, the same shape as
//! the connection reader task.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use mdns_sd::{DaemonEvent, ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::LinkError;
use crate::frame::SERVICE_TYPE;

/// Capacity for the bridged discovery event channel.
const EVENT_QUEUE: usize = 16;

// ── Events ───────────────────────────────────────────────────────

/// What discovery reported to the session loop.
#[derive(Debug)]
pub enum DiscoveryEvent {
    /// Client: a service candidate resolved to a connectable address.
    /// May arrive more than once for the same logical match; the
    /// session consumes only the first.
    Resolved(SocketAddr),
    /// Advertisement, search, or the daemon itself failed.
    Failed(LinkError),
    /// The browse stopped while a result was still expected.
    SearchStopped,
}

// ── One-shot outcome flags ───────────────────────────────────────

/// Explicit "is this outcome still expected" flag, consumed on first
/// occurrence. Guards against the platform firing the same logical
/// discovery event more than once.
#[derive(Debug)]
pub struct OneShot {
    armed: bool,
}

impl OneShot {
    pub fn new() -> Self {
        Self { armed: true }
    }

    /// A flag whose outcome has already been delivered.
    pub fn spent() -> Self {
        Self { armed: false }
    }

    /// Returns `true` exactly once; every later call returns `false`.
    pub fn consume(&mut self) -> bool {
        std::mem::take(&mut self.armed)
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }
}

impl Default for OneShot {
    fn default() -> Self {
        Self::new()
    }
}

// ── Host advertisement ───────────────────────────────────────────

/// Advertises the host's ephemeral listening port on the local
/// network for as long as the session lives.
pub struct HostAdvertisement {
    daemon: ServiceDaemon,
    fullname: String,
}

// ServiceDaemon is not Debug; show the registration instead.
impl fmt::Debug for HostAdvertisement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostAdvertisement")
            .field("fullname", &self.fullname)
            .finish_non_exhaustive()
    }
}

impl HostAdvertisement {
    /// Register the service record. Daemon-level errors after
    /// registration are forwarded to `events` as failures.
    pub fn register(
        instance: &str,
        port: u16,
        events: mpsc::Sender<DiscoveryEvent>,
    ) -> Result<Self, LinkError> {
        let daemon = ServiceDaemon::new()?;
        let hostname = format!("{instance}.local.");
        let service = ServiceInfo::new(
            SERVICE_TYPE,
            instance,
            &hostname,
            "",
            port,
            None::<HashMap<String, String>>,
        )?
        .enable_addr_auto();
        let fullname = service.get_fullname().to_string();
        daemon.register(service)?;
        info!(%fullname, port, "advertising service");

        let monitor = daemon.monitor()?;
        tokio::spawn(async move {
            while let Ok(event) = monitor.recv_async().await {
                if let DaemonEvent::Error(e) = event {
                    warn!(error = %e, "mdns daemon error");
                    if events
                        .send(DiscoveryEvent::Failed(LinkError::Discovery(e.to_string())))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        });

        Ok(Self { daemon, fullname })
    }

    /// Withdraw the advertisement and stop the daemon.
    pub fn shutdown(&self) {
        let _ = self.daemon.unregister(&self.fullname);
        let _ = self.daemon.shutdown();
    }
}

// ── Client browse ────────────────────────────────────────────────

/// Searches for a host's service record and reports resolutions.
pub struct ClientBrowse {
    daemon: ServiceDaemon,
}

impl fmt::Debug for ClientBrowse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBrowse").finish_non_exhaustive()
    }
}

impl ClientBrowse {
    /// Start browsing for the shared service type. Resolutions and
    /// failures land on `events`; the session picks the first.
    pub fn start(events: mpsc::Sender<DiscoveryEvent>) -> Result<Self, LinkError> {
        let daemon = ServiceDaemon::new()?;
        let browse = daemon.browse(SERVICE_TYPE)?;
        info!(service_type = SERVICE_TYPE, "searching for service");

        tokio::spawn(async move {
            while let Ok(event) = browse.recv_async().await {
                let forwarded = match event {
                    ServiceEvent::ServiceResolved(service) => {
                        match resolved_addr(&service) {
                            Some(addr) => {
                                debug!(%addr, "service resolved");
                                Some(DiscoveryEvent::Resolved(addr))
                            }
                            None => Some(DiscoveryEvent::Failed(LinkError::Discovery(
                                "service resolved without addresses".into(),
                            ))),
                        }
                    }
                    ServiceEvent::ServiceRemoved(_, fullname) => {
                        debug!(%fullname, "service removed");
                        Some(DiscoveryEvent::Failed(LinkError::Discovery(
                            "service removed".into(),
                        )))
                    }
                    ServiceEvent::SearchStopped(_) => Some(DiscoveryEvent::SearchStopped),
                    ServiceEvent::SearchStarted(_) | ServiceEvent::ServiceFound(_, _) => {
                        debug!("search progress");
                        None
                    }
                };
                if let Some(ev) = forwarded {
                    let stopped = matches!(ev, DiscoveryEvent::SearchStopped);
                    if events.send(ev).await.is_err() || stopped {
                        break;
                    }
                }
            }
        });

        Ok(Self { daemon })
    }

    /// Stop the search and the daemon.
    pub fn shutdown(&self) {
        let _ = self.daemon.stop_browse(SERVICE_TYPE);
        let _ = self.daemon.shutdown();
    }
}

/// Pick a connectable address from a resolved record, preferring
/// IPv4.
fn resolved_addr(service: &ServiceInfo) -> Option<SocketAddr> {
    let addrs = service.get_addresses();
    let ip = addrs
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addrs.iter().next())?;
    Some(SocketAddr::new(*ip, service.get_port()))
}

/// Build the bridged discovery channel.
pub fn event_channel() -> (mpsc::Sender<DiscoveryEvent>, mpsc::Receiver<DiscoveryEvent>) {
    mpsc::channel(EVENT_QUEUE)
}
