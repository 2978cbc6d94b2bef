//! The manager: server table, login handshake, and placement.
//!
//! A manager accepts subscriptions from data servers, tracks their load,
//! space and availability in a slotted table, answers directors' `select`
//! requests by picking a server, and runs the monitoring loops that keep
//! the table honest (pings, reference resets, deferred drops).
//!
//! Lock discipline: the table mutex is never held across I/O. Links and
//! names are copied out under the lock; sends happen after it is released.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::Mutex;
use thiserror::Error;

use crate::cache::LocationCache;
use crate::config::Config;
use crate::link::{Link, Tokens};
use crate::paths::{PathInfo, PathList};
use crate::prepare::{PrepQ, PrepReq};
use crate::sched::{Job, Scheduler};
use crate::server::ServerSlot;
use crate::types::{SMask, STMAX};

/// Selection failures visible to the requesting client.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectError {
    /// Try again after the given number of seconds.
    #[error("retry in {secs}s: {reason}")]
    Wait {
        /// Seconds the client should wait.
        secs: u32,
        /// Operator-visible reason.
        reason: &'static str,
    },
    /// No server could ever satisfy the request.
    #[error("no servers are available")]
    NoServer,
}

/// Snapshot row from [`Manager::list_servers`].
#[derive(Debug, Clone)]
pub struct ServerInfo {
    /// `host:port`.
    pub name: String,
    /// Slot id.
    pub slot: usize,
    /// Composite load.
    pub load: u32,
    /// Total free KiB.
    pub disk_tot: u64,
    /// Lifetime allocations (folded plus current window).
    pub ref_tot_a: u64,
    /// Lifetime redirections (folded plus current window).
    pub ref_tot_r: u64,
    /// Status letters (`a`, or any of `o s n d`).
    pub status: String,
}

struct Table {
    slots: Vec<Option<ServerSlot>>,
    sthi: usize,
    count: usize,
    inst_num: u64,
    sel_acnt: u64,
    sel_rcnt: u64,
    do_reset: bool,
    reset_mask: SMask,
}

impl Table {
    fn slot_mut(&mut self, slot: usize, instance: u64) -> Option<&mut ServerSlot> {
        self.slots
            .get_mut(slot)?
            .as_mut()
            .filter(|s| s.instance == instance)
    }
}

enum Pick {
    Slot(usize),
    Delay {
        nump: u32,
        numd: u32,
        numf: u32,
        numo: u32,
        nums: u32,
        numns: u32,
    },
}

/// The cluster manager.
pub struct Manager {
    cfg: Arc<Config>,
    sched: Arc<Scheduler>,
    cache: Arc<LocationCache>,
    paths: Arc<PathList>,
    prepq: Arc<PrepQ>,
    table: Mutex<Table>,
    disabled: AtomicBool,
}

impl Manager {
    /// Assemble a manager over its collaborating tables.
    pub fn new(
        cfg: Arc<Config>,
        sched: Arc<Scheduler>,
        cache: Arc<LocationCache>,
        paths: Arc<PathList>,
        prepq: Arc<PrepQ>,
    ) -> Arc<Manager> {
        Arc::new(Manager {
            cfg,
            sched,
            cache,
            paths,
            prepq,
            table: Mutex::new(Table {
                slots: (0..STMAX).map(|_| None).collect(),
                sthi: 0,
                count: 0,
                inst_num: 1,
                sel_acnt: 0,
                sel_rcnt: 0,
                do_reset: false,
                reset_mask: SMask::EMPTY,
            }),
            disabled: AtomicBool::new(false),
        })
    }

    /// Pause or resume request service; while disabled every select gets a
    /// wait answer.
    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::Release);
    }

    /// Number of bound servers.
    pub fn server_count(&self) -> usize {
        self.table.lock().count
    }

    /// Path registry this manager consults.
    pub fn path_list(&self) -> &Arc<PathList> {
        &self.paths
    }

    /// Location cache this manager maintains.
    pub fn location_cache(&self) -> &Arc<LocationCache> {
        &self.cache
    }

    // ----------------------------------------------------------------- login

    /// Serve one accepted control connection to completion. The first line
    /// must be `login {director|server} ...`; directors then issue requests
    /// until they disconnect, servers complete the subscription handshake
    /// and stream responses.
    pub fn serve(self: &Arc<Self>, link: Arc<Link>) {
        let first = match link.get_line() {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                warn!("manager: {}: {e}", link.name());
                return;
            }
        };
        debug!("manager: from {}: {first}", link.name());
        let mut toks = Tokens::new(&first);
        if toks.next() != Some("login") {
            let _ = link.send_line("0 ?err first command not login");
            return;
        }
        match toks.next() {
            Some("director") => {
                info!("manager: director {} logged in", link.name());
                self.process_director(&link);
                info!("manager: director {} logged out", link.name());
            }
            Some("server") => self.serve_server(&link, &mut toks),
            _ => {
                let _ = link.send_line("0 ?err invalid login role");
            }
        }
    }

    fn serve_server(self: &Arc<Self>, link: &Arc<Link>, toks: &mut Tokens<'_>) {
        let mut port = 0u16;
        let mut nostage = false;
        let mut suspend = false;
        let mut tok = toks.next();
        if tok == Some("port") {
            match toks.next().and_then(|p| p.parse().ok()) {
                Some(p) => port = p,
                None => {
                    warn!("manager: {}: bad login port", link.name());
                    return;
                }
            }
            tok = toks.next();
        }
        if tok == Some("nostage") {
            nostage = true;
            tok = toks.next();
        }
        if tok == Some("suspend") {
            suspend = true;
        }

        let (slot, instance) = match self.add_server(link.clone(), port, nostage, suspend) {
            Ok(id) => id,
            Err(reason) => {
                warn!("manager: {} login failed; {reason}", link.name());
                return;
            }
        };

        // addpath declarations, terminated by the start line.
        let mut servset = SMask::EMPTY;
        let mut pend: Vec<String> = Vec::new();
        let mut added = false;
        let started = loop {
            let line = match link.get_line() {
                Ok(Some(line)) => line,
                _ => break false,
            };
            debug!("manager: from {}: {line}", link.name());
            let mut t = Tokens::new(&line);
            match t.next() {
                Some("start") => {
                    if !self.read_start(slot, instance, &mut t) {
                        break false;
                    }
                    break true;
                }
                Some("addpath") => match self.add_path(slot, &mut t, &mut pend) {
                    Some(mask) => {
                        servset |= mask;
                        added = true;
                    }
                    None => {
                        warn!("manager: {}: invalid addpath", link.name());
                        break false;
                    }
                },
                _ => {
                    warn!("manager: {}: invalid command sequence in login", link.name());
                    break false;
                }
            }
        };
        if !started {
            self.remove_server("login failed", slot, instance, true);
            return;
        }

        // No declared paths: default to read access on everything.
        if !added {
            let info = PathInfo::from_perms("r", SMask::bit(slot)).expect("r is a valid perm");
            servset = self.paths.insert("/", &info);
            info!("manager: server {} defaulted r /", link.name());
            pend = self.cache.extract("/");
        }

        // Seed the new server's state for every path we already know about.
        for path in pend {
            let _ = link.send_line(&format!("0 state {path}"));
        }

        // Equalize the round-robin counters across intersecting servers.
        self.reset_ref(servset);

        info!("manager: server {} logged in", link.name());
        self.process_responses(slot, instance, link);
        info!("manager: server {} logged out", link.name());
        self.remove_server("disconnected", slot, instance, false);
    }

    fn read_start(&self, slot: usize, instance: u64, t: &mut Tokens<'_>) -> bool {
        let max_kb = t.next().and_then(|v| v.parse::<u64>().ok());
        let num_fs = t.next().and_then(|v| v.parse::<u32>().ok());
        let tot_kb = t.next().and_then(|v| v.parse::<u64>().ok());
        let mut table = self.table.lock();
        let Some(sp) = table.slot_mut(slot, instance) else {
            return false;
        };
        sp.disk_free = max_kb.unwrap_or(0);
        sp.disk_nums = num_fs.unwrap_or(1);
        sp.disk_tot = tot_kb.unwrap_or(sp.disk_free);
        true
    }

    fn add_path(&self, slot: usize, t: &mut Tokens<'_>, pend: &mut Vec<String>) -> Option<SMask> {
        let perms = t.next()?;
        let prefix = t.next()?;
        let info = PathInfo::from_perms(perms, SMask::bit(slot))?;
        // Ask the new server about every cached key under this prefix.
        pend.extend(self.cache.extract(prefix.trim_end_matches('*')));
        Some(self.paths.insert(prefix, &info))
    }

    fn add_server(
        &self,
        link: Arc<Link>,
        port: u16,
        nostage: bool,
        suspend: bool,
    ) -> Result<(usize, u64), &'static str> {
        let host = link.host().to_owned();
        let mut table = self.table.lock();

        // A record for this host:port either rebinds or rejects.
        let existing = table
            .slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.is_host(&host) && s.port == port));
        if let Some(i) = existing {
            let inst = table.inst_num;
            {
                let sp = table.slots[i].as_mut().expect("position found above");
                if sp.flags.bound {
                    return Err("already logged in");
                }
                sp.instance = inst;
                sp.link = Some(link);
                sp.flags.bound = true;
                sp.flags.offline = false;
                sp.flags.active = true;
                sp.flags.nostage = nostage;
                sp.flags.suspend = suspend;
                sp.ping_miss = 0;
                sp.load_miss = 0;
                sp.drop_at = None;
                if port != 0 && port != sp.port {
                    sp.port = port;
                    sp.name = format!("{host}:{port}");
                }
            }
            table.inst_num += 1;
            table.count += 1;
            debug!("manager: reused slot {i}.{inst} for {host}");
            return Ok((i, inst));
        }

        // Else a free slot, else reuse a retired one.
        let free = table.slots.iter().position(Option::is_none).or_else(|| {
            table
                .slots
                .iter()
                .position(|s| s.as_ref().is_some_and(|s| !s.flags.bound))
        });
        let Some(i) = free else {
            return Err("too many servers");
        };
        let inst = table.inst_num;
        table.inst_num += 1;
        let mut sp = ServerSlot::new(i, inst, link, port);
        sp.flags.bound = true;
        sp.flags.active = true;
        sp.flags.nostage = nostage;
        sp.flags.suspend = suspend;
        table.slots[i] = Some(sp);
        table.count += 1;
        if i > table.sthi {
            table.sthi = i;
        }
        debug!("manager: added {host} at slot {i}.{inst}; num={}", table.count);
        Ok((i, inst))
    }

    // ------------------------------------------------------------- teardown

    /// Take a server out of service. The slot keeps its identity for a
    /// rebind until the deferred drop fires `drop_delay` later; an `immed`
    /// removal drops at once.
    pub fn remove_server(self: &Arc<Self>, reason: &str, slot: usize, instance: u64, immed: bool) {
        let mut table = self.table.lock();
        let Some(sp) = table.slot_mut(slot, instance) else {
            return;
        };
        if let Some(link) = &sp.link {
            link.close();
        }
        sp.flags.offline = true;
        if sp.flags.bound {
            sp.flags.bound = false;
            table.count -= 1;
        }
        let name = table.slots[slot]
            .as_ref()
            .map(|s| s.name.clone())
            .unwrap_or_default();
        if immed || self.cfg.drop_delay.is_zero() {
            drop(table);
            self.drop_server(slot, instance);
        } else {
            let when = Instant::now() + self.cfg.drop_delay;
            if let Some(sp) = table.slot_mut(slot, instance) {
                sp.drop_at = Some(when);
            }
            drop(table);
            // For the grace window the server's claims become bounce
            // entries: selects rebroadcast to it instead of answering
            // from stale vectors, and a rebind's fresh `have` restores
            // the claim. The deferred drop wipes whatever remains.
            self.cache.bounce(SMask::bit(slot), None);
            self.sched.schedule_at(
                Arc::new(DropJob {
                    mgr: self.clone(),
                    slot,
                    instance,
                }),
                when,
            );
        }
        if !reason.is_empty() {
            info!("manager: {name} scheduled for removal; {reason}");
        }
    }

    fn drop_server(self: &Arc<Self>, slot: usize, instance: u64) {
        let mut table = self.table.lock();
        let Some(sp) = table.slot_mut(slot, instance) else {
            debug!("manager: drop of {slot}.{instance} cancelled");
            return;
        };
        // A rebind-then-disconnect may have pushed the deadline out.
        if let Some(at) = sp.drop_at {
            if at > Instant::now() {
                drop(table);
                self.sched.schedule_at(
                    Arc::new(DropJob {
                        mgr: self.clone(),
                        slot,
                        instance,
                    }),
                    at,
                );
                return;
            }
        }
        if sp.flags.bound {
            // Rebound under the same instance; nothing to do.
            return;
        }
        let name = sp.name.clone();
        let link = sp.link.take();
        table.slots[slot] = None;
        while table.sthi > 0 && table.slots[table.sthi].is_none() {
            table.sthi -= 1;
        }
        drop(table);
        if let Some(link) = link {
            link.close();
        }
        self.paths.remove(SMask::bit(slot));
        self.cache.reset(slot);
        info!("manager: server {name} dropped");
    }

    // ------------------------------------------------------------ messaging

    /// Send `line` to every bound, online server in `mask`.
    pub fn broadcast(&self, mask: SMask, line: &str) {
        let links: Vec<Arc<Link>> = {
            let table = self.table.lock();
            table
                .slots
                .iter()
                .flatten()
                .filter(|s| s.flags.bound && !s.flags.offline && s.in_mask(mask))
                .filter_map(|s| s.link.clone())
                .collect()
        };
        for link in links {
            let _ = link.send_line(line);
        }
    }

    /// Ask the reference-reset loop to equalize counters for `mask`.
    pub fn reset_ref(&self, mask: SMask) {
        let mut table = self.table.lock();
        table.do_reset = true;
        table.reset_mask |= mask;
    }

    /// Fold current-window reference counters into the lifetime totals for
    /// every server in `mask`.
    pub fn fold_refs(&self, mask: SMask) {
        let mut table = self.table.lock();
        for sp in table.slots.iter_mut().flatten() {
            if sp.in_mask(mask) {
                sp.ref_tot_a += sp.ref_a;
                sp.ref_a = 0;
                sp.ref_tot_r += sp.ref_r;
                sp.ref_r = 0;
            }
        }
        table.sel_acnt = 0;
        table.sel_rcnt = 0;
    }

    /// Snapshot the table for stats and admin listings.
    pub fn list_servers(&self) -> Vec<ServerInfo> {
        let table = self.table.lock();
        table
            .slots
            .iter()
            .flatten()
            .map(|sp| ServerInfo {
                name: sp.name.clone(),
                slot: sp.slot,
                load: sp.load,
                disk_tot: sp.disk_tot,
                ref_tot_a: sp.ref_tot_a + sp.ref_a,
                ref_tot_r: sp.ref_tot_r + sp.ref_r,
                status: sp.status_letters(),
            })
            .collect()
    }

    /// The `<stats id="mngr">` fragment of the summary document.
    pub fn stats_xml(&self) -> String {
        let mut out = String::from("<stats id=\"mngr\">");
        for s in self.list_servers() {
            out.push_str(&format!(
                "<subscriber><name>{}</name><status>{}</status><load>{}</load>\
                 <diskfree>{}</diskfree><refa>{}</refa><refr>{}</refr></subscriber>",
                s.name, s.status, s.load, s.disk_tot, s.ref_tot_a, s.ref_tot_r
            ));
        }
        out.push_str("</stats>");
        out
    }

    // ------------------------------------------------------------ selection

    /// Choose a server for `path`. `pmask` is the servers known to hold the
    /// file, `amask` those that could stage it in; a staging choice records
    /// the placement in the cache, debits the space adjustment, and forwards
    /// `forward` (if any) to the chosen server.
    pub fn sel_server(
        &self,
        need_rw: bool,
        path: &str,
        pmask: SMask,
        amask: SMask,
        forward: Option<&str>,
    ) -> Result<String, SelectError> {
        if self.server_count() < self.cfg.sup_count {
            debug!("select deferred; not enough servers for {path}");
            return Err(SelectError::Wait {
                secs: self.cfg.sup_delay,
                reason: "not enough servers",
            });
        }

        let mut last_delay: Option<SelectError> = None;
        for (mask, isalt) in [(pmask, false), (amask, true)] {
            if mask.is_empty() {
                continue;
            }
            let mut table = self.table.lock();
            let pick = if self.cfg.by_load() {
                self.sel_by_load(&table, mask, isalt)
            } else {
                self.sel_by_ref(&table, mask, isalt)
            };
            match pick {
                Pick::Slot(slot) => {
                    if isalt {
                        table.sel_acnt += 1;
                    } else {
                        table.sel_rcnt += 1;
                    }
                    let cfg = &self.cfg;
                    let sp = table.slots[slot].as_mut().expect("picked slot is live");
                    sp.ref_r += 1;
                    let name = sp.name.clone();
                    let mask = sp.mask;
                    let mut to_send: Vec<String> = Vec::new();
                    if isalt {
                        sp.ref_a += 1;
                        sp.disk_tot = sp.disk_tot.saturating_sub(cfg.disk_adj);
                        sp.disk_free = sp.disk_free.saturating_sub(cfg.disk_adj);
                        let now = Instant::now();
                        if sp.disk_free < cfg.disk_min
                            && sp.disk_ask_after.is_none_or(|t| t <= now)
                        {
                            sp.disk_ask_after = Some(now + cfg.disk_ask);
                            to_send.push("0 space".to_owned());
                        }
                        if let Some(fwd) = forward {
                            to_send.push(fwd.to_owned());
                        }
                    }
                    let link = sp.link.clone();
                    drop(table);
                    if isalt {
                        debug!("select: {name} staging {path}");
                        self.cache.add_file(path, mask, need_rw, None);
                    }
                    if let Some(link) = link {
                        for line in to_send {
                            let _ = link.send_line(&line);
                        }
                    }
                    return Ok(name);
                }
                Pick::Delay { nump: 0, .. } => continue,
                Pick::Delay {
                    nump,
                    numd,
                    numf,
                    numo,
                    nums,
                    numns,
                } => {
                    drop(table);
                    // Every candidate excluded by no-stage can never serve;
                    // that is a permanent answer, not a wait.
                    if numns == nump {
                        last_delay = Some(SelectError::NoServer);
                        continue;
                    }
                    let (secs, reason) = if numf > 0 {
                        (self.cfg.disk_wt, "no eligible servers have space for")
                    } else if numo > 0 {
                        (self.cfg.max_delay, "eligible servers overloaded for")
                    } else if nums > 0 {
                        (self.cfg.sus_delay, "eligible servers suspended for")
                    } else if numd > 0 {
                        (self.cfg.sup_delay, "eligible servers offline for")
                    } else {
                        (self.cfg.sup_delay, "server selection error for")
                    };
                    debug!("select deferred; {reason} {path}");
                    return Err(SelectError::Wait { secs, reason });
                }
            }
        }
        last_delay.map_or(Err(SelectError::NoServer), Err)
    }

    fn eligible(
        &self,
        sp: &ServerSlot,
        needspace: bool,
        check_load: bool,
        nump: &mut u32,
        numd: &mut u32,
        numf: &mut u32,
        numo: &mut u32,
        nums: &mut u32,
        numns: &mut u32,
    ) -> bool {
        *nump += 1;
        if sp.flags.offline || !sp.flags.bound {
            *numd += 1;
            return false;
        }
        if sp.flags.suspend {
            *nums += 1;
            return false;
        }
        if check_load && sp.load > self.cfg.max_load {
            *numo += 1;
            return false;
        }
        if needspace {
            if sp.flags.nostage {
                *numns += 1;
                *numf += 1;
                return false;
            }
            if sp.disk_tot < self.cfg.disk_min || sp.disk_free < self.cfg.disk_min {
                *numf += 1;
                return false;
            }
        }
        true
    }

    fn sel_by_load(&self, table: &Table, mask: SMask, needspace: bool) -> Pick {
        let (mut nump, mut numd, mut numf, mut numo, mut nums, mut numns) = (0, 0, 0, 0, 0, 0);
        let mut best: Option<&ServerSlot> = None;
        for sp in table.slots[..=table.sthi].iter().flatten() {
            if !sp.in_mask(mask) {
                continue;
            }
            if !self.eligible(
                sp, needspace, true, &mut nump, &mut numd, &mut numf, &mut numo, &mut nums,
                &mut numns,
            ) {
                continue;
            }
            best = Some(match best {
                None => sp,
                Some(b) => {
                    if b.load.abs_diff(sp.load) <= self.cfg.fuzz {
                        // Scores tie within the fuzz band; take the less
                        // referenced server, then the lower slot.
                        if needspace {
                            if b.ref_a > sp.ref_a + self.cfg.disk_linger {
                                sp
                            } else {
                                b
                            }
                        } else if b.ref_r > sp.ref_r {
                            sp
                        } else {
                            b
                        }
                    } else if b.load > sp.load {
                        sp
                    } else {
                        b
                    }
                }
            });
        }
        match best {
            Some(sp) => Pick::Slot(sp.slot),
            None => Pick::Delay {
                nump,
                numd,
                numf,
                numo,
                nums,
                numns,
            },
        }
    }

    fn sel_by_ref(&self, table: &Table, mask: SMask, needspace: bool) -> Pick {
        let (mut nump, mut numd, mut numf, mut numo, mut nums, mut numns) = (0, 0, 0, 0, 0, 0);
        let mut best: Option<&ServerSlot> = None;
        for sp in table.slots[..=table.sthi].iter().flatten() {
            if !sp.in_mask(mask) {
                continue;
            }
            if !self.eligible(
                sp, needspace, true, &mut nump, &mut numd, &mut numf, &mut numo, &mut nums,
                &mut numns,
            ) {
                continue;
            }
            best = Some(match best {
                None => sp,
                Some(b) => {
                    if needspace {
                        if b.ref_a > sp.ref_a + self.cfg.disk_linger {
                            sp
                        } else {
                            b
                        }
                    } else if b.ref_r > sp.ref_r {
                        sp
                    } else {
                        b
                    }
                }
            });
        }
        match best {
            Some(sp) => Pick::Slot(sp.slot),
            None => Pick::Delay {
                nump,
                numd,
                numf,
                numo,
                nums,
                numns,
            },
        }
    }

    // ----------------------------------------------------- director service

    fn process_director(self: &Arc<Self>, link: &Arc<Link>) {
        loop {
            let line = match link.get_line() {
                Ok(Some(line)) => line,
                Ok(None) => return,
                Err(e) => {
                    warn!("manager: director {}: {e}", link.name());
                    return;
                }
            };
            debug!("manager: from director {}: {line}", link.name());
            let mut t = Tokens::new(&line);
            let (Some(rid), Some(verb)) = (t.next(), t.next()) else {
                continue;
            };
            if self.disabled.load(Ordering::Acquire) {
                let _ = link.send_line(&format!("{rid} !wait {}", self.cfg.service_delay));
                continue;
            }
            let ok = match verb {
                "select" => self.do_select(link, rid, &mut t, false),
                "selects" => self.do_select(link, rid, &mut t, true),
                "prepadd" => self.do_prepadd(rid, &mut t),
                "prepdel" => self.do_prepdel(&mut t),
                "stats" => link.send_line(&self.stats_xml()).is_ok(),
                "statsz" => link
                    .send_line(&format!("{}", self.stats_xml().len()))
                    .is_ok(),
                "chmod" | "mkdir" | "mv" | "rm" | "rmdir" => self.reissue(rid, verb, &mut t),
                _ => false,
            };
            if !ok {
                warn!("manager: invalid request from {}", link.name());
            }
        }
    }

    fn do_select(&self, link: &Arc<Link>, rid: &str, t: &mut Tokens<'_>, reset: bool) -> bool {
        let Some(mode) = t.next() else { return false };
        let (need_rw, newfile, resonly, amode) = match mode {
            "r" => (false, false, false, "read"),
            "w" => (true, false, false, "write"),
            "c" => (true, true, false, "write"),
            "x" => (false, false, true, "read"),
            _ => return false,
        };
        let Some(path) = t.next() else { return false };

        // Who serves this path at all?
        let pinfo = self.paths.find(path).unwrap_or_default();
        let amask = if need_rw { pinfo.rwvec } else { pinfo.rovec };
        if amask.is_empty() {
            let _ = link.send_line(&format!(
                "{rid} ?err No servers have {amode} access to the file"
            ));
            return true;
        }

        // Check the cache for primary selections.
        let cinfo = self.cache.get_file(path);
        let pmask = cinfo.map_or(SMask::EMPTY, |ci| if need_rw { ci.rwvec } else { ci.rovec });

        // A missing or provisional entry makes the client wait while we ask
        // the relevant servers; a bouncing set triggers a targeted refresh.
        let mut dowt =
            cinfo.is_none() || cinfo.is_some_and(|ci| ci.deadline.is_some()) || reset;
        let docr = cinfo.is_some_and(|ci| !ci.sbvec.is_empty());
        if dowt || docr {
            if dowt || pmask.is_empty() {
                let _ = link.send_line(&format!("{rid} !wait {}", self.cfg.lup_delay));
                debug!("select: lookup delay {} for {path}", self.cfg.lup_delay);
                dowt = true;
            }
            let lup = Duration::from_secs(self.cfg.lup_delay.into());
            match cinfo {
                Some(ci) if !reset => {
                    self.cache
                        .del_file(path, ci.sbvec, dowt.then_some(lup));
                }
                _ => self.cache.add_file(path, SMask::EMPTY, false, Some(lup)),
            }
            let ask = match cinfo {
                Some(ci) if !reset && !ci.sbvec.is_empty() => ci.sbvec,
                _ => pinfo.rovec,
            };
            self.broadcast(ask, &format!("0 state {path}"));
            if dowt {
                return true;
            }
        }

        // Alternates: servers that could produce the file.
        let smask = if resonly {
            SMask::EMPTY
        } else if newfile {
            pinfo.rwvec
        } else {
            amask & pinfo.ssvec
        };

        if pmask.is_empty() && smask.is_empty() {
            let _ = link.send_line(&format!(
                "{rid} ?err No servers are available to {amode} the file."
            ));
            return true;
        }
        match self.sel_server(need_rw, path, pmask, smask, None) {
            Ok(name) => {
                debug!("select: redirect -> {name} for {path}");
                let _ = link.send_line(&format!("{rid} !try {name}"));
            }
            Err(SelectError::Wait { secs, .. }) => {
                let _ = link.send_line(&format!("{rid} !wait {secs}"));
            }
            Err(SelectError::NoServer) => {
                let _ = link.send_line(&format!(
                    "{rid} ?err No servers are available to {amode} the file."
                ));
            }
        }
        true
    }

    fn do_prepadd(self: &Arc<Self>, _rid: &str, t: &mut Tokens<'_>) -> bool {
        let (Some(reqid), Some(user), Some(prty), Some(mode), Some(path)) =
            (t.next(), t.next(), t.next(), t.next(), t.next())
        else {
            return false;
        };
        let Ok(prty) = prty.parse() else { return false };
        let req = PrepReq {
            reqid: reqid.to_owned(),
            user: user.to_owned(),
            prty,
            mode: mode.to_owned(),
            path: path.to_owned(),
        };
        if let Err(e) = self.prepq.add(&req) {
            warn!("manager: prepare {reqid} not queued: {e}");
            return true;
        }
        self.sched.schedule(Arc::new(PrepStage {
            mgr: self.clone(),
            req,
        }));
        true
    }

    fn do_prepdel(&self, t: &mut Tokens<'_>) -> bool {
        let Some(reqid) = t.next() else { return false };
        if let Err(e) = self.prepq.del(reqid) {
            warn!("manager: unprepare {reqid} failed: {e}");
        }
        self.broadcast(!SMask::EMPTY, &format!("0 prepdel {reqid}"));
        true
    }

    /// Forward a meta-operation to every server handling its path. The
    /// hop count in the reissued id bounds multi-level forwarding.
    fn reissue(&self, rid: &str, verb: &str, t: &mut Tokens<'_>) -> bool {
        let args = t.rest();
        let path = match verb {
            // mv carries two paths; route on the first.
            "mv" => args.split_whitespace().next(),
            // chmod and mkdir carry a mode before the path.
            "chmod" | "mkdir" => args.split_whitespace().nth(1),
            _ => args.split_whitespace().next(),
        };
        let Some(path) = path else { return false };
        let hops = rid.split('@').next().and_then(|h| h.parse::<u32>().ok());
        let hops = hops.unwrap_or(0) + 1;
        if hops > self.cfg.msg_ttl {
            warn!("manager: msg TTL exceeded for {verb} {path}");
            return true;
        }
        let Some(pinfo) = self.paths.find(path) else {
            warn!("manager: {verb} aborted; no servers handling {path}");
            return true;
        };
        self.broadcast(pinfo.rovec, &format!("{hops}@0 {verb} {args}"));
        true
    }

    // ----------------------------------------------------- server responses

    /// Stream and apply one bound server's responses until it disconnects.
    fn process_responses(&self, slot: usize, instance: u64, link: &Arc<Link>) {
        loop {
            let line = match link.get_line() {
                Ok(Some(line)) => line,
                Ok(None) => return,
                Err(e) => {
                    warn!("manager: server {}: {e}", link.name());
                    return;
                }
            };
            debug!("manager: from server {}: {line}", link.name());
            let mut t = Tokens::new(&line);
            let (Some(_rid), Some(verb)) = (t.next(), t.next()) else {
                continue;
            };
            // Any traffic proves liveness.
            {
                let mut table = self.table.lock();
                match table.slot_mut(slot, instance) {
                    Some(sp) => {
                        sp.flags.active = true;
                        sp.ping_miss = 0;
                    }
                    None => return,
                }
            }
            let mask = SMask::bit(slot);
            let ok = match verb {
                "have" => self.do_have(mask, &mut t),
                "gone" => self.do_gone(mask, &mut t),
                "pong" => true,
                "load" => self.do_load(slot, instance, &mut t),
                "avkb" => self.do_avkb(slot, instance, &mut t),
                "suspend" => self.set_flag(slot, instance, |f| f.suspend = true),
                "resume" => self.set_flag(slot, instance, |f| f.suspend = false),
                "stage" => self.set_flag(slot, instance, |f| f.nostage = false),
                "nostage" => self.set_flag(slot, instance, |f| f.nostage = true),
                _ => false,
            };
            if !ok {
                warn!("manager: invalid response from {}", link.name());
            }
        }
    }

    fn do_have(&self, mask: SMask, t: &mut Tokens<'_>) -> bool {
        let Some(perms) = t.next() else { return false };
        let Some(path) = t.next() else { return false };
        let rw = match perms {
            p if p.contains('w') => true,
            "?" => self
                .paths
                .find(path)
                .is_some_and(|pi| pi.rwvec.overlaps(mask)),
            _ => false,
        };
        self.cache.add_file(path, mask, rw, None);
        true
    }

    fn do_gone(&self, mask: SMask, t: &mut Tokens<'_>) -> bool {
        let Some(path) = t.next() else { return false };
        self.cache.del_file(path, mask, None);
        self.prepq.gone(path);
        true
    }

    fn do_load(&self, slot: usize, instance: u64, t: &mut Tokens<'_>) -> bool {
        // <id> load <cpu> <io> <runq> <mem> <pag> <maxkb> [<totkb>]
        let mut vals = [0u32; 5];
        for v in vals.iter_mut() {
            match t.next().and_then(|x| x.parse().ok()) {
                Some(p) if p <= 100 => *v = p,
                _ => return false,
            }
        }
        let Some(free) = t.next().and_then(|x| x.parse::<u64>().ok()) else {
            return false;
        };
        let tot = t.next().and_then(|x| x.parse::<u64>().ok());
        let cfg = &self.cfg;
        let [cpu, io, runq, mem, pag] = vals;
        let load = (cfg.p_cpu * cpu
            + cfg.p_io * io
            + cfg.p_runq * runq
            + cfg.p_mem * mem
            + cfg.p_pag * pag)
            / 100;
        let mut table = self.table.lock();
        let Some(sp) = table.slot_mut(slot, instance) else {
            return false;
        };
        sp.load = load.min(100);
        sp.load_miss = 0;
        sp.disk_free = free;
        sp.disk_tot = tot.unwrap_or(free);
        true
    }

    fn do_avkb(&self, slot: usize, instance: u64, t: &mut Tokens<'_>) -> bool {
        let Some(free) = t.next().and_then(|x| x.parse::<u64>().ok()) else {
            return false;
        };
        let tot = t.next().and_then(|x| x.parse::<u64>().ok());
        let mut table = self.table.lock();
        let Some(sp) = table.slot_mut(slot, instance) else {
            return false;
        };
        sp.disk_free = free;
        sp.disk_tot = tot.unwrap_or(free);
        true
    }

    fn set_flag(
        &self,
        slot: usize,
        instance: u64,
        f: impl FnOnce(&mut crate::server::ServerFlags),
    ) -> bool {
        let mut table = self.table.lock();
        match table.slot_mut(slot, instance) {
            Some(sp) => {
                f(&mut sp.flags);
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------- monitors

    /// Ping loop: every `ask_ping` walk the table; every `ask_perf`-th round
    /// request a usage report instead. A server that stays silent across two
    /// rounds is declared dead and removed. Runs forever on its own thread.
    pub fn ping_loop(self: &Arc<Self>) {
        let mut round = 0u32;
        loop {
            std::thread::sleep(self.cfg.ask_ping);
            round += 1;
            let usage = self.cfg.ask_perf > 0 && round % self.cfg.ask_perf == 0;
            let mut dead: Vec<(usize, u64)> = Vec::new();
            let mut to_ping: Vec<Arc<Link>> = Vec::new();
            {
                let mut table = self.table.lock();
                for sp in table.slots.iter_mut().flatten() {
                    if !sp.flags.bound || sp.flags.offline {
                        continue;
                    }
                    if sp.flags.active {
                        sp.flags.active = false;
                        sp.ping_miss = 0;
                    } else {
                        sp.ping_miss += 1;
                        if sp.ping_miss >= 2 {
                            dead.push((sp.slot, sp.instance));
                            continue;
                        }
                    }
                    if let Some(link) = sp.link.clone() {
                        to_ping.push(link);
                    }
                }
            }
            for (slot, instance) in dead {
                self.remove_server("not responding", slot, instance, false);
            }
            let line = if usage { "0 usage" } else { "0 ping" };
            for link in to_ping {
                let _ = link.send_line(line);
            }
        }
    }

    /// Reference-reset loop: wake periodically; honor explicit equalize
    /// requests quickly and fold all counters every `ref_reset` window so
    /// round-robin bias cannot drift permanently. Runs forever on its own
    /// thread.
    pub fn ref_loop(self: &Arc<Self>) {
        let tick = Duration::from_secs(10).min(self.cfg.ref_reset);
        let mut elapsed = Duration::ZERO;
        loop {
            std::thread::sleep(tick);
            elapsed += tick;
            let pending = {
                let mut table = self.table.lock();
                if table.do_reset {
                    table.do_reset = false;
                    let m = table.reset_mask;
                    table.reset_mask = SMask::EMPTY;
                    Some(m)
                } else {
                    None
                }
            };
            if let Some(mask) = pending {
                self.fold_refs(mask);
            }
            if elapsed >= self.cfg.ref_reset {
                elapsed = Duration::ZERO;
                self.fold_refs(!SMask::EMPTY);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn test_bind(
        self: &Arc<Self>,
        link: Arc<Link>,
        port: u16,
        nostage: bool,
    ) -> (usize, u64) {
        self.add_server(link, port, nostage, false)
            .expect("test server binds")
    }

    #[cfg(test)]
    pub(crate) fn test_tune(&self, slot: usize, f: impl FnOnce(&mut ServerSlot)) {
        let mut table = self.table.lock();
        if let Some(sp) = table.slots[slot].as_mut() {
            f(sp);
        }
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Manager({} servers)", self.server_count())
    }
}

struct DropJob {
    mgr: Arc<Manager>,
    slot: usize,
    instance: u64,
}

impl Job for DropJob {
    fn comment(&self) -> &'static str {
        "drop server"
    }

    fn run(self: Arc<Self>, _sched: &Arc<Scheduler>) {
        self.mgr.drop_server(self.slot, self.instance);
    }
}

/// Deferred job that finds a staging server for a prepare request and
/// forwards it; reschedules itself while the cluster says wait.
struct PrepStage {
    mgr: Arc<Manager>,
    req: PrepReq,
}

impl Job for PrepStage {
    fn comment(&self) -> &'static str {
        "prepare staging"
    }

    fn run(self: Arc<Self>, sched: &Arc<Scheduler>) {
        let mgr = &self.mgr;
        // Already resident somewhere: nothing to stage.
        if mgr
            .cache
            .get_file(&self.req.path)
            .is_some_and(|ci| !ci.rovec.is_empty())
        {
            return;
        }
        let Some(pinfo) = mgr.paths.find(&self.req.path) else {
            warn!("prepare: no servers handle {}", self.req.path);
            return;
        };
        let need_rw = self.req.mode.contains('w');
        let fwd = format!(
            "0 prepadd {} {} {} {} {}",
            self.req.reqid, self.req.user, self.req.prty, self.req.mode, self.req.path
        );
        match mgr.sel_server(need_rw, &self.req.path, SMask::EMPTY, pinfo.ssvec, Some(&fwd)) {
            Ok(name) => debug!("prepare: {} staging on {name}", self.req.path),
            Err(SelectError::Wait { secs, .. }) => {
                sched.schedule_in(self.clone(), Duration::from_secs(secs.into()));
            }
            Err(SelectError::NoServer) => {
                warn!("prepare: no server can stage {}", self.req.path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::NativeFs;
    use crate::link::LinkPool;
    use std::net::{TcpListener, TcpStream};

    fn test_link() -> (Arc<Link>, TcpStream) {
        let pool = LinkPool::new(4);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, peer) = listener.accept().unwrap();
        (pool.alloc_stream(server, peer), client)
    }

    fn manager(cfg: Config) -> Arc<Manager> {
        let cfg = Arc::new(cfg);
        let sched = Scheduler::new(1, 2).unwrap();
        let cache = LocationCache::new(cfg.fx_hold);
        let paths = Arc::new(PathList::new());
        let prepq = PrepQ::new(
            None,
            3,
            Duration::from_secs(60),
            false,
            Arc::new(NativeFs::new(None)),
        );
        Manager::new(cfg, sched, cache, paths, prepq)
    }

    fn bind_two(mgr: &Arc<Manager>) -> (SMask, Vec<TcpStream>) {
        let mut keep = Vec::new();
        let mut mask = SMask::EMPTY;
        for port in [10001u16, 10002] {
            let (link, peer) = test_link();
            keep.push(peer);
            let (slot, _inst) = mgr.test_bind(link, port, false);
            mgr.test_tune(slot, |sp| {
                sp.disk_free = 100_000;
                sp.disk_tot = 100_000;
            });
            mask |= SMask::bit(slot);
        }
        (mask, keep)
    }

    #[test]
    fn load_tiebreak_within_fuzz_prefers_lower_refs() {
        let mut cfg = Config::default();
        cfg.p_cpu = 100;
        cfg.fuzz = 5;
        let mgr = manager(cfg);
        let (mask, _keep) = bind_two(&mgr);
        let slots: Vec<usize> = mask.slots().collect();
        mgr.test_tune(slots[0], |sp| {
            sp.load = 50;
            sp.ref_a = 3;
        });
        mgr.test_tune(slots[1], |sp| {
            sp.load = 52;
            sp.ref_a = 1;
        });
        let picked = mgr
            .sel_server(true, "/d/f", SMask::EMPTY, mask, None)
            .unwrap();
        assert_eq!(picked, "127.0.0.1:10002", "within fuzz, lower RefA wins");
    }

    #[test]
    fn load_outside_fuzz_prefers_lighter_server() {
        let mut cfg = Config::default();
        cfg.p_cpu = 100;
        cfg.fuzz = 5;
        let mgr = manager(cfg);
        let (mask, _keep) = bind_two(&mgr);
        let slots: Vec<usize> = mask.slots().collect();
        mgr.test_tune(slots[0], |sp| sp.load = 20);
        mgr.test_tune(slots[1], |sp| sp.load = 90);
        let picked = mgr.sel_server(false, "/d/f", mask, SMask::EMPTY, None).unwrap();
        assert_eq!(picked, "127.0.0.1:10001");
    }

    #[test]
    fn by_ref_round_robin_alternates() {
        let mgr = manager(Config::default());
        let (mask, _keep) = bind_two(&mgr);
        let first = mgr.sel_server(false, "/f", mask, SMask::EMPTY, None).unwrap();
        let second = mgr.sel_server(false, "/f", mask, SMask::EMPTY, None).unwrap();
        assert_ne!(first, second, "selection bumps RefR, so the pick moves on");
        let third = mgr.sel_server(false, "/f", mask, SMask::EMPTY, None).unwrap();
        assert_eq!(first, third);
    }

    #[test]
    fn nostage_everywhere_is_permanent_failure() {
        let mgr = manager(Config::default());
        let (mask, _keep) = bind_two(&mgr);
        for slot in mask.slots() {
            mgr.test_tune(slot, |sp| sp.flags.nostage = true);
        }
        let res = mgr.sel_server(true, "/d/new", SMask::EMPTY, mask, None);
        assert_eq!(res.unwrap_err(), SelectError::NoServer);
    }

    #[test]
    fn suspended_servers_mean_wait() {
        let cfg = Config::default();
        let sus = cfg.sus_delay;
        let mgr = manager(cfg);
        let (mask, _keep) = bind_two(&mgr);
        for slot in mask.slots() {
            mgr.test_tune(slot, |sp| sp.flags.suspend = true);
        }
        match mgr.sel_server(false, "/d/f", mask, SMask::EMPTY, None) {
            Err(SelectError::Wait { secs, .. }) => assert_eq!(secs, sus),
            other => panic!("expected suspend wait, got {other:?}"),
        }
    }

    #[test]
    fn overloaded_servers_mean_wait() {
        let mut cfg = Config::default();
        cfg.p_cpu = 100;
        let delay = cfg.max_delay;
        let mgr = manager(cfg);
        let (mask, _keep) = bind_two(&mgr);
        for slot in mask.slots() {
            mgr.test_tune(slot, |sp| sp.load = 99);
        }
        match mgr.sel_server(false, "/d/f", mask, SMask::EMPTY, None) {
            Err(SelectError::Wait { secs, .. }) => assert_eq!(secs, delay),
            other => panic!("expected overload wait, got {other:?}"),
        }
    }

    #[test]
    fn too_few_servers_defers() {
        let mut cfg = Config::default();
        cfg.sup_count = 3;
        let mgr = manager(cfg);
        let (mask, _keep) = bind_two(&mgr);
        assert!(matches!(
            mgr.sel_server(false, "/d/f", mask, SMask::EMPTY, None),
            Err(SelectError::Wait { .. })
        ));
    }

    #[test]
    fn fold_refs_accumulates_and_zeroes() {
        let mgr = manager(Config::default());
        let (mask, _keep) = bind_two(&mgr);
        for _ in 0..4 {
            mgr.sel_server(false, "/f", mask, SMask::EMPTY, None).unwrap();
        }
        mgr.fold_refs(!SMask::EMPTY);
        let infos = mgr.list_servers();
        let total: u64 = infos.iter().map(|i| i.ref_tot_r).sum();
        assert_eq!(total, 4);
        // Counters are zeroed, so lifetime totals do not double-count.
        mgr.fold_refs(!SMask::EMPTY);
        let infos = mgr.list_servers();
        assert_eq!(infos.iter().map(|i| i.ref_tot_r).sum::<u64>(), 4);
    }

    #[test]
    fn removed_server_claims_move_to_bounce_set() {
        let mgr = manager(Config::default());
        let (link, _keep) = test_link();
        let (slot, inst) = mgr.test_bind(link, 7100, false);
        let mask = SMask::bit(slot);
        mgr.cache.add_file("/d/f", mask, false, None);

        // A disconnect with the stock grace window bounces the claim
        // rather than dropping it.
        mgr.remove_server("test", slot, inst, false);
        let info = mgr.cache.get_file("/d/f").unwrap();
        assert!(info.sbvec.has(slot), "claim must move to the bounce set");
        assert!(!info.rovec.has(slot));

        // A fresh report during the window restores the claim.
        mgr.cache.add_file("/d/f", mask, false, None);
        let info = mgr.cache.get_file("/d/f").unwrap();
        assert!(info.rovec.has(slot));
        assert!(!info.sbvec.has(slot));
    }

    #[test]
    fn duplicate_host_login_rejected_and_instances_monotonic() {
        let mgr = manager(Config::default());
        let (link1, _k1) = test_link();
        let (slot, inst1) = mgr.test_bind(link1.clone(), 7000, false);
        let (link2, _k2) = test_link();
        assert!(mgr.add_server(link2.clone(), 7000, false, false).is_err());
        mgr.remove_server("test", slot, inst1, true);
        let (slot2, inst2) = mgr.test_bind(link2, 7000, false);
        assert!(inst2 > inst1, "instance counter is monotonic per slot");
        let _ = slot2;
    }
}
