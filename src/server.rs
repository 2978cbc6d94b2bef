//! Per-server slot records for the manager's table.

use std::sync::Arc;
use std::time::Instant;

use crate::link::Link;
use crate::types::SMask;

/// Availability flags for one server.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerFlags {
    /// Fully logged in (start line accepted).
    pub bound: bool,
    /// Link lost; awaiting drop or rebind.
    pub offline: bool,
    /// Server asked not to receive clients.
    pub suspend: bool,
    /// Server cannot stage files in.
    pub nostage: bool,
    /// Operator-disabled.
    pub disable: bool,
    /// Saw traffic since the last ping round.
    pub active: bool,
}

/// One slot of the server table.
///
/// The record lives under the table lock; fields needed across blocking
/// work (the link, the name) are copied out before the lock is released.
pub struct ServerSlot {
    /// Slot index, 0..=255.
    pub slot: usize,
    /// `SMask::bit(slot)`.
    pub mask: SMask,
    /// Monotonic per-slot generation; a drop job only fires if the
    /// instance it captured is still current.
    pub instance: u64,
    /// The server's message stream. `None` once dropped.
    pub link: Option<Arc<Link>>,
    /// `host:port` the server redirects clients to.
    pub name: String,
    /// Host part only.
    pub host: String,
    /// Data port.
    pub port: u16,
    /// Availability flags.
    pub flags: ServerFlags,

    /// Composite load 0..100 from the last usage report.
    pub load: u32,
    /// Largest free KiB in one filesystem.
    pub disk_free: u64,
    /// Total free KiB across filesystems.
    pub disk_tot: u64,
    /// Number of filesystems.
    pub disk_nums: u32,
    /// Next time a space query may be sent.
    pub disk_ask_after: Option<Instant>,

    /// Allocation/staging selections this window.
    pub ref_a: u64,
    /// Redirection selections this window.
    pub ref_r: u64,
    /// Lifetime allocation total (folded at reset).
    pub ref_tot_a: u64,
    /// Lifetime redirection total (folded at reset).
    pub ref_tot_r: u64,

    /// Ping bookkeeping: set by any received message, cleared when a ping
    /// goes out. Two consecutive unanswered pings drop the server.
    pub ping_miss: u32,
    /// Same accounting for usage requests.
    pub load_miss: u32,

    /// When the pending drop job fires.
    pub drop_at: Option<Instant>,
}

impl ServerSlot {
    /// Fresh record for `slot` bound to `link`.
    pub fn new(slot: usize, instance: u64, link: Arc<Link>, port: u16) -> ServerSlot {
        let host = link.host().to_owned();
        let name = if port == 0 {
            host.clone()
        } else {
            format!("{host}:{port}")
        };
        ServerSlot {
            slot,
            mask: SMask::bit(slot),
            instance,
            link: Some(link),
            name,
            host,
            port,
            flags: ServerFlags::default(),
            load: 0,
            disk_free: 0,
            disk_tot: 0,
            disk_nums: 0,
            disk_ask_after: None,
            ref_a: 0,
            ref_r: 0,
            ref_tot_a: 0,
            ref_tot_r: 0,
            ping_miss: 0,
            load_miss: 0,
            drop_at: None,
        }
    }

    /// True if this record answers for `host`.
    pub fn is_host(&self, host: &str) -> bool {
        self.host == host
    }

    /// True if the slot is in `mask`.
    pub fn in_mask(&self, mask: SMask) -> bool {
        mask.has(self.slot)
    }

    /// Status letters for the statistics document: `a` active, else any of
    /// `o`ffline, `s`uspended, `n`ostage, `d`isabled.
    pub fn status_letters(&self) -> String {
        let mut s = String::new();
        if self.flags.offline {
            s.push('o');
        }
        if self.flags.suspend {
            s.push('s');
        }
        if self.flags.nostage {
            s.push('n');
        }
        if self.flags.disable {
            s.push('d');
        }
        if s.is_empty() {
            s.push('a');
        }
        s
    }
}

impl std::fmt::Debug for ServerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ServerSlot({} id={}.{} load={} free={}k {})",
            self.name,
            self.slot,
            self.instance,
            self.load,
            self.disk_free,
            self.status_letters()
        )
    }
}
