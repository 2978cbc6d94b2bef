//! Process assembly: every long-lived component wired together in one
//! place, no module-level mutable state.
//!
//! A process runs one of two roles. A manager holds the path registry,
//! location cache and server table and answers directors; a data server
//! runs the session engine against a backing store and subscribes to its
//! managers. The integration tests assemble both in-process.

use std::io;
use std::net::TcpListener;
use std::path::Path;
use std::sync::Arc;

use log::{info, warn};
use thiserror::Error;

use crate::admin::AdminChannel;
use crate::buffer::BuffPool;
use crate::cache::{CacheScrubber, LocationCache};
use crate::config::{AllowRule, Config};
use crate::finder::Finder;
use crate::fs::{FileStore, NativeFs};
use crate::link::LinkPool;
use crate::manager::Manager;
use crate::paths::PathList;
use crate::prepare::{PrepQ, PrepScrubber};
use crate::sched::{Scheduler, once_job};
use crate::stats::Stats;
use crate::subscriber::Subscriber;
use crate::xp::aio::AioQueue;
use crate::xp::session::{Session, SessionCtx, SessionSet};

/// Which half of the cluster this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Redirector: location cache, path registry, server table.
    Manager,
    /// Data server: session engine over a backing store.
    Server,
}

/// Startup failures, split so the driver can map them to exit codes.
#[derive(Debug, Error)]
pub enum ProcError {
    /// A service thread could not be started.
    #[error("cannot start service thread: {0}")]
    Threads(io::Error),
    /// Sockets or other initialization failed.
    #[error("initialization failed: {0}")]
    Init(#[from] io::Error),
}

/// One assembled process.
pub struct Process {
    /// Tunables.
    pub cfg: Arc<Config>,
    /// Role this process runs.
    pub role: Role,
    /// Link recycle pool and counters.
    pub links: Arc<LinkPool>,
    /// Worker pool.
    pub sched: Arc<Scheduler>,
    /// Payload buffers.
    pub bufs: Arc<BuffPool>,
    /// Live client sessions (empty in a manager).
    pub sessions: Arc<SessionSet>,
    /// The manager core; `None` in a data server.
    pub manager: Option<Arc<Manager>>,
    /// The data-server subscription; `None` in a manager.
    pub subscriber: Option<Arc<Subscriber>>,
    /// Statistics document source.
    pub stats: Arc<Stats>,
    ctx: Option<Arc<SessionCtx>>,
    listener: TcpListener,
    local_port: u16,
}

impl Process {
    /// Build every component for `role` and bind the listen socket. A
    /// config port of 0 binds an ephemeral port (tests use this).
    pub fn assemble(cfg: Config, role: Role) -> Result<Process, ProcError> {
        let cfg = Arc::new(cfg);
        let listener = TcpListener::bind(("0.0.0.0", cfg.port))?;
        let local_port = listener.local_addr()?.port();

        let links = LinkPool::new(cfg.max_links);
        let sizes = match role {
            Role::Manager => cfg.mgr_threads,
            Role::Server => cfg.srv_threads,
        };
        let sched = Scheduler::new(sizes.min, sizes.max).map_err(ProcError::Threads)?;
        let bufs = BuffPool::new(cfg.buffer_cap);
        let sessions = SessionSet::new();
        let fs: Arc<dyn FileStore> = Arc::new(NativeFs::new(cfg.local_root.clone()));

        for rule in &cfg.allow {
            if let AllowRule::NetGroup(name) = rule {
                warn!("allow netgroup {name}: netgroups are not resolvable here; rule ignored");
            }
        }

        let prepq = cfg.prep_ifpgm.as_ref().map(|_| {
            let q = PrepQ::new(
                cfg.prep_ifpgm.clone(),
                cfg.prep_reset,
                cfg.prep_scrub,
                cfg.prep_echo,
                fs.clone(),
            );
            sched.schedule_in(PrepScrubber::new(q.clone()), cfg.prep_scrub);
            q
        });

        let (manager, subscriber, ctx, stats) = match role {
            Role::Manager => {
                let paths = Arc::new(PathList::new());
                let cache = LocationCache::new(cfg.fx_hold);
                sched.schedule_in(CacheScrubber::new(cache.clone()), cfg.fx_hold);
                // The manager's prepare queue exists even without an
                // interface program so gone/exists tracking works.
                let prepq = prepq.clone().unwrap_or_else(|| {
                    PrepQ::new(None, cfg.prep_reset, cfg.prep_scrub, cfg.prep_echo, fs.clone())
                });
                let mgr = Manager::new(cfg.clone(), sched.clone(), cache, paths, prepq);
                let stats = Stats::new(
                    cfg.site.clone(),
                    format!("localhost:{local_port}"),
                    links.clone(),
                    sched.clone(),
                    bufs.clone(),
                    sessions.clone(),
                    Some(mgr.clone()),
                );
                (Some(mgr), None, None, stats)
            }
            Role::Server => {
                let finder = cfg.subscribe.first().map(|sub| {
                    let f = Finder::new(links.clone(), &sub.host, sub.port, cfg.rep_wait);
                    f.start();
                    f
                });
                let subscriber = Subscriber::new(
                    cfg.clone(),
                    links.clone(),
                    fs.clone(),
                    prepq.clone(),
                    local_port,
                    false,
                );
                let stats = Stats::new(
                    cfg.site.clone(),
                    format!("localhost:{local_port}"),
                    links.clone(),
                    sched.clone(),
                    bufs.clone(),
                    sessions.clone(),
                    None,
                );
                let stats_doc = stats.clone();
                let ctx = Arc::new(SessionCtx {
                    cfg: cfg.clone(),
                    fs: fs.clone(),
                    bufs: bufs.clone(),
                    sched: sched.clone(),
                    aio: AioQueue::new(cfg.aio_max),
                    sessions: sessions.clone(),
                    finder,
                    prepq,
                    auth: None,
                    stats: Some(Arc::new(move || stats_doc.render())),
                });
                (None, Some(subscriber), Some(ctx), stats)
            }
        };

        Ok(Process {
            cfg,
            role,
            links,
            sched,
            bufs,
            sessions,
            manager,
            subscriber,
            stats,
            ctx,
            listener,
            local_port,
        })
    }

    /// The bound listen port (useful when the config asked for 0).
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Start the accept loop, the monitor threads, and the subscriptions.
    pub fn start(&self) -> Result<(), ProcError> {
        if let Some(mgr) = &self.manager {
            let ping = mgr.clone();
            std::thread::Builder::new()
                .name("mgr-ping".into())
                .spawn(move || ping.ping_loop())
                .map_err(ProcError::Threads)?;
            let refs = mgr.clone();
            std::thread::Builder::new()
                .name("mgr-refs".into())
                .spawn(move || refs.ref_loop())
                .map_err(ProcError::Threads)?;
        }
        if let Some(sub) = &self.subscriber {
            for up in &self.cfg.subscribe {
                sub.start(up.host.clone(), up.port)
                    .map_err(ProcError::Threads)?;
            }
        }

        let listener = self.listener.try_clone()?;
        let links = self.links.clone();
        let sched = self.sched.clone();
        let manager = self.manager.clone();
        let ctx = self.ctx.clone();
        let allow = self.cfg.allow.clone();
        std::thread::Builder::new()
            .name("accept".into())
            .spawn(move || {
                loop {
                    let (stream, peer) = match listener.accept() {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("accept: {e}");
                            continue;
                        }
                    };
                    if !allowed(&allow, &peer.ip().to_string()) {
                        info!("accept: {peer} refused by allow rules");
                        continue;
                    }
                    let link = links.alloc_stream(stream, peer);
                    match (&manager, &ctx) {
                        (Some(mgr), _) => {
                            let mgr = mgr.clone();
                            sched.schedule(once_job("manager connection", move || {
                                mgr.serve(link);
                            }));
                        }
                        (None, Some(ctx)) => {
                            let ctx = ctx.clone();
                            sched.schedule(once_job("client session", move || {
                                Session::serve(ctx, link);
                            }));
                        }
                        (None, None) => unreachable!("a process is a manager or a server"),
                    }
                }
            })
            .map_err(ProcError::Threads)?;
        info!("listening on port {} as {:?}", self.local_port, self.role);
        Ok(())
    }

    /// Bind and start the admin socket under `dir`.
    pub fn start_admin(&self, dir: &Path) -> Result<(), ProcError> {
        let admin = AdminChannel::new(self.sessions.clone(), self.manager.clone());
        admin.start(dir)?;
        Ok(())
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Process({:?} port {})", self.role, self.local_port)
    }
}

fn allowed(rules: &[AllowRule], host: &str) -> bool {
    let host_rules: Vec<&String> = rules
        .iter()
        .filter_map(|r| match r {
            AllowRule::Host(h) => Some(h),
            AllowRule::NetGroup(_) => None,
        })
        .collect();
    if host_rules.is_empty() {
        return true;
    }
    host_rules.iter().any(|pat| {
        if let Some(prefix) = pat.strip_suffix('*') {
            host.starts_with(prefix)
        } else {
            *pat == host
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_rules() {
        let rules = vec![
            AllowRule::Host("10.1.*".to_owned()),
            AllowRule::Host("127.0.0.1".to_owned()),
        ];
        assert!(allowed(&rules, "10.1.2.3"));
        assert!(allowed(&rules, "127.0.0.1"));
        assert!(!allowed(&rules, "192.168.0.1"));
        assert!(allowed(&[], "anyone"));
    }

    #[test]
    fn assemble_both_roles() {
        let mut cfg = Config::default();
        cfg.port = 0;
        let mgr = Process::assemble(cfg.clone(), Role::Manager).unwrap();
        assert!(mgr.manager.is_some());
        assert!(mgr.subscriber.is_none());
        let srv = Process::assemble(cfg, Role::Server).unwrap();
        assert!(srv.manager.is_none());
        assert!(srv.subscriber.is_some());
        assert_ne!(srv.local_port(), 0);
    }
}
