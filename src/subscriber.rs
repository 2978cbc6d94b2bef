//! Subscription: the data-server side of the manager stream.
//!
//! A subscriber keeps a connection to each configured upstream manager:
//! it logs in with its exported paths and space figures, then answers the
//! manager's state queries, pings, usage and space requests, and executes
//! forwarded meta-operations against the backing store.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::config::Config;
use crate::fs::FileStore;
use crate::link::{Link, LinkPool, Tokens};
use crate::prepare::{PrepQ, PrepReq};

/// One data server's subscription state.
pub struct Subscriber {
    cfg: Arc<Config>,
    pool: Arc<LinkPool>,
    fs: Arc<dyn FileStore>,
    prepq: Option<Arc<PrepQ>>,
    /// Port clients should be redirected to.
    data_port: u16,
    suspended: AtomicBool,
    nostage: AtomicBool,
    /// Manager links currently bound, for unsolicited notices.
    bound: Mutex<Vec<Arc<Link>>>,
}

impl Subscriber {
    /// Build a subscriber advertising `data_port`.
    pub fn new(
        cfg: Arc<Config>,
        pool: Arc<LinkPool>,
        fs: Arc<dyn FileStore>,
        prepq: Option<Arc<PrepQ>>,
        data_port: u16,
        start_suspended: bool,
    ) -> Arc<Subscriber> {
        Arc::new(Subscriber {
            cfg,
            pool,
            fs,
            prepq,
            data_port,
            suspended: AtomicBool::new(start_suspended),
            nostage: AtomicBool::new(false),
            bound: Mutex::new(Vec::new()),
        })
    }

    /// Send a notice line to every bound manager.
    pub fn inform(&self, line: &str) {
        let links: Vec<Arc<Link>> = self.bound.lock().clone();
        for link in links {
            let _ = link.send_line(line);
        }
    }

    /// Flip the suspend state: future logins carry it and already-bound
    /// managers are told at once.
    pub fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::Release);
        self.inform(if suspended { "0 suspend" } else { "0 resume" });
    }

    /// Flip the staging state, with the same notice semantics.
    pub fn set_nostage(&self, nostage: bool) {
        self.nostage.store(nostage, Ordering::Release);
        self.inform(if nostage { "0 nostage" } else { "0 stage" });
    }

    /// Spawn the reconnect loop for one upstream manager.
    pub fn start(self: &Arc<Self>, host: String, port: u16) -> std::io::Result<()> {
        let me = self.clone();
        std::thread::Builder::new()
            .name(format!("subscribe-{host}"))
            .spawn(move || me.pander(&host, port))?;
        Ok(())
    }

    /// Keep connecting to the manager; on each successful login, stream
    /// its requests until the link drops, then retry.
    fn pander(self: Arc<Self>, host: &str, port: u16) {
        loop {
            let link = match self.pool.connect(host, port) {
                Ok(link) => link,
                Err(e) => {
                    debug!("subscribe: {host}:{port} unreachable: {e}");
                    std::thread::sleep(Duration::from_secs(10));
                    continue;
                }
            };
            if self.login(&link) {
                info!("subscribe: logged into {}", link.name());
                self.bound.lock().push(link.clone());
                self.process_requests(&link);
                self.bound.lock().retain(|l| !Arc::ptr_eq(l, &link));
                warn!("subscribe: lost {}", link.name());
            }
            self.pool.recycle(link);
            std::thread::sleep(Duration::from_secs(15));
        }
    }

    fn login(&self, link: &Arc<Link>) -> bool {
        let mut login = format!("login server port {}", self.data_port);
        if self.nostage.load(Ordering::Acquire) {
            login.push_str(" nostage");
        }
        if self.suspended.load(Ordering::Acquire) {
            login.push_str(" suspend");
        }
        if link.send_line(&login).is_err() {
            return false;
        }
        for (perms, prefix) in &self.cfg.paths {
            if link.send_line(&format!("addpath {perms} {prefix}")).is_err() {
                return false;
            }
        }
        let space = self.fs.free_space();
        link.send_line(&format!(
            "start {} {} {}",
            space.max_free_kb, space.num_fs, space.tot_free_kb
        ))
        .is_ok()
    }

    fn process_requests(&self, link: &Arc<Link>) {
        loop {
            let line = match link.get_line() {
                Ok(Some(line)) => line,
                _ => return,
            };
            debug!("subscribe: from {}: {line}", link.name());
            let mut t = Tokens::new(&line);
            let (Some(rid), Some(verb)) = (t.next(), t.next()) else {
                continue;
            };
            let ok = match verb {
                "state" => self.do_state(link, rid, &mut t, false),
                "statex" => self.do_state(link, rid, &mut t, true),
                "ping" => link.send_line(&format!("{rid} pong")).is_ok(),
                "usage" => self.do_usage(link, rid),
                "space" => self.do_space(link, rid),
                "prepadd" => self.do_prepadd(&mut t),
                "prepdel" => self.do_prepdel(&mut t),
                "chmod" => self.do_chmod(&mut t),
                "mkdir" => self.do_mkdir(&mut t),
                "mv" => self.do_mv(&mut t),
                "rm" => self.do_rm(&mut t),
                "rmdir" => self.do_rmdir(&mut t),
                _ => false,
            };
            if !ok {
                warn!("subscribe: invalid request from {}: {line}", link.name());
            }
        }
    }

    /// A file counts as online if it is resident or a stage-in for it is
    /// already pending.
    fn online(&self, path: &str) -> bool {
        if self.fs.stat(path).map(|i| !i.is_dir).unwrap_or(false) {
            return true;
        }
        self.prepq.as_ref().is_some_and(|q| q.exists(path))
    }

    fn perms_for(&self, path: &str) -> &str {
        let mut best: Option<&(String, String)> = None;
        for entry in &self.cfg.paths {
            let (_, prefix) = entry;
            let p = prefix.trim_end_matches('*');
            if path.starts_with(p)
                && best.is_none_or(|(_, b)| b.trim_end_matches('*').len() < p.len())
            {
                best = Some(entry);
            }
        }
        best.map_or("r", |(perms, _)| perms.as_str())
    }

    fn do_state(&self, link: &Arc<Link>, rid: &str, t: &mut Tokens<'_>, must_resp: bool) -> bool {
        let Some(path) = t.next() else { return false };
        if self.online(path) {
            let perms = self.perms_for(path);
            return link.send_line(&format!("{rid} have {perms} {path}")).is_ok();
        }
        if must_resp {
            return link.send_line(&format!("{rid} gone {path}")).is_ok();
        }
        true
    }

    fn do_usage(&self, link: &Arc<Link>, rid: &str) -> bool {
        let space = self.fs.free_space();
        link.send_line(&format!(
            "{rid} load 0 0 0 0 0 {} {}",
            space.max_free_kb, space.tot_free_kb
        ))
        .is_ok()
    }

    fn do_space(&self, link: &Arc<Link>, rid: &str) -> bool {
        let space = self.fs.free_space();
        link.send_line(&format!(
            "{rid} avkb {} {}",
            space.max_free_kb, space.tot_free_kb
        ))
        .is_ok()
    }

    fn do_prepadd(&self, t: &mut Tokens<'_>) -> bool {
        let (Some(reqid), Some(user), Some(prty), Some(mode), Some(path)) =
            (t.next(), t.next(), t.next(), t.next(), t.next())
        else {
            return false;
        };
        let Some(prepq) = &self.prepq else {
            return true;
        };
        let Ok(prty) = prty.parse() else { return false };
        let req = PrepReq {
            reqid: reqid.to_owned(),
            user: user.to_owned(),
            prty,
            mode: mode.to_owned(),
            path: path.to_owned(),
        };
        if let Err(e) = prepq.add(&req) {
            warn!("subscribe: prepare {reqid} failed: {e}");
        }
        true
    }

    fn do_prepdel(&self, t: &mut Tokens<'_>) -> bool {
        let Some(reqid) = t.next() else { return false };
        if let Some(prepq) = &self.prepq {
            if let Err(e) = prepq.del(reqid) {
                warn!("subscribe: unprepare {reqid} failed: {e}");
            }
        }
        true
    }

    fn do_chmod(&self, t: &mut Tokens<'_>) -> bool {
        let (Some(mode), Some(path)) = (t.next(), t.next()) else {
            return false;
        };
        let Ok(mode) = u32::from_str_radix(mode, 8) else {
            return false;
        };
        if let Err(e) = self.fs.chmod(path, mode) {
            if e.code() != libc::ENOENT {
                warn!("subscribe: chmod {path}: {}", e.message());
            }
        }
        true
    }

    fn do_mkdir(&self, t: &mut Tokens<'_>) -> bool {
        let (Some(mode), Some(path)) = (t.next(), t.next()) else {
            return false;
        };
        let Ok(mode) = u32::from_str_radix(mode, 8) else {
            return false;
        };
        if let Err(e) = self.fs.mkdir(path, mode) {
            warn!("subscribe: mkdir {path}: {}", e.message());
        }
        true
    }

    fn do_mv(&self, t: &mut Tokens<'_>) -> bool {
        let (Some(from), Some(to)) = (t.next(), t.next()) else {
            return false;
        };
        if let Err(e) = self.fs.rename(from, to) {
            if e.code() != libc::ENOENT {
                warn!("subscribe: mv {from}: {}", e.message());
            }
        }
        true
    }

    fn do_rm(&self, t: &mut Tokens<'_>) -> bool {
        let Some(path) = t.next() else { return false };
        if let Err(e) = self.fs.remove(path) {
            if e.code() != libc::ENOENT {
                warn!("subscribe: rm {path}: {}", e.message());
            }
        }
        true
    }

    fn do_rmdir(&self, t: &mut Tokens<'_>) -> bool {
        let Some(path) = t.next() else { return false };
        if let Err(e) = self.fs.rmdir(path) {
            if e.code() != libc::ENOENT {
                warn!("subscribe: rmdir {path}: {}", e.message());
            }
        }
        true
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Subscriber(port {})", self.data_port)
    }
}
