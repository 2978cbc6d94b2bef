//! Configuration: typed tunables and the directive parser.
//!
//! Each directive is one line, `<key> <args...>`. `Config::load` reads a
//! file of directives; `Config::parse_line` consumes a single one, which is
//! also what the tests use. Unknown keys are errors; unknown sub-options of
//! a known key are errors too, so typos never silently change behavior.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::link::Tokens;

/// Errors from directive parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Unrecognized directive key.
    #[error("unknown directive '{0}'")]
    UnknownKey(String),
    /// A directive was missing a required argument.
    #[error("directive '{0}': missing {1}")]
    Missing(&'static str, &'static str),
    /// An argument failed to parse or was out of range.
    #[error("directive '{0}': bad value '{1}'")]
    BadValue(&'static str, String),
    /// The configuration file could not be read.
    #[error("cannot read config: {0}")]
    Io(#[from] io::Error),
}

/// Accept-filter rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowRule {
    /// Accept connections from a host (name or address, `*` suffix ok).
    Host(String),
    /// Accept members of a netgroup.
    NetGroup(String),
}

/// An upstream manager to subscribe to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Manager host.
    pub host: String,
    /// Manager port.
    pub port: u16,
    /// `host+` form: subscribe to every address the name resolves to.
    pub all: bool,
}

/// Worker-pool sizing for one role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSize {
    /// Threads kept in reserve.
    pub min: usize,
    /// Hiring ceiling.
    pub max: usize,
}

/// All recognized tunables, with the stock defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP listen port.
    pub port: u16,
    /// UDP port for manager-side datagrams.
    pub udp_manager: Option<u16>,
    /// UDP port for server-side datagrams.
    pub udp_server: Option<u16>,
    /// Admin socket directory.
    pub admin_path: PathBuf,
    /// Open the admin socket group-writable.
    pub admin_group: bool,
    /// Accept filters; empty means accept everyone.
    pub allow: Vec<AllowRule>,
    /// Registered backing data paths: (group, path, wildcard).
    pub caches: Vec<(String, String)>,
    /// Prefix stripped from logical paths before hitting the local fs.
    pub local_root: Option<PathBuf>,
    /// Prefix prepended when exporting local paths.
    pub remote_root: Option<PathBuf>,
    /// Exported prefixes: (permission letters, prefix).
    pub paths: Vec<(String, String)>,

    /// Wait handed to clients while a lookup broadcast is in flight.
    pub lup_delay: u32,
    /// Wait while the cluster is below the startup server floor.
    pub sup_delay: u32,
    /// Minimum bound servers before selection is attempted.
    pub sup_count: usize,
    /// Wait when every eligible server lacks space.
    pub disk_wt: u32,
    /// Wait when every eligible server is suspended.
    pub sus_delay: u32,
    /// Grace between a disconnect and the slot drop.
    pub drop_delay: Duration,
    /// Wait while the service is disabled.
    pub service_delay: u32,
    /// Wait when every eligible server is overloaded.
    pub max_delay: u32,
    /// Hop limit for reissued meta-ops before they are discarded.
    pub msg_ttl: u32,

    /// Cache entry lifetime without access.
    pub fx_hold: Duration,

    /// Selector weight: cpu.
    pub p_cpu: u32,
    /// Selector weight: io.
    pub p_io: u32,
    /// Selector weight: memory.
    pub p_mem: u32,
    /// Selector weight: paging.
    pub p_pag: u32,
    /// Selector weight: run queue.
    pub p_runq: u32,
    /// Percent band within which two load scores tie.
    pub fuzz: u32,
    /// Load ceiling for eligibility.
    pub max_load: u32,
    /// Window between reference-counter resets.
    pub ref_reset: Duration,

    /// Free-space floor (KiB) for staging eligibility.
    pub disk_min: u64,
    /// KiB debited from a server per staging selection.
    pub disk_adj: u64,
    /// Extra allocations tolerated on a server before round-robin moves on.
    pub disk_linger: u64,
    /// Minimum gap between space queries to one server.
    pub disk_ask: Duration,

    /// Ping cadence.
    pub ask_ping: Duration,
    /// Every n-th ping is a usage request instead.
    pub ask_perf: u32,
    /// Log a load line every n usage replies (0 = never).
    pub log_perf: u32,

    /// Local load-reporting program interval.
    pub perf_int: Duration,
    /// Local load-reporting program.
    pub perf_pgm: Option<String>,

    /// Scrubs between full prepare-queue resets.
    pub prep_reset: u32,
    /// Prepare scrub cadence.
    pub prep_scrub: Duration,
    /// Log prepare queue activity.
    pub prep_echo: bool,
    /// External prepare interface program.
    pub prep_ifpgm: Option<String>,

    /// Upstream managers to subscribe to.
    pub subscribe: Vec<Subscription>,
    /// Manager-role scheduler sizing.
    pub mgr_threads: PoolSize,
    /// Server-role scheduler sizing.
    pub srv_threads: PoolSize,
    /// Diagnostic categories.
    pub trace: Vec<String>,

    /// How long a locate caller waits for the manager's reply.
    pub rep_wait: Duration,
    /// Recycle-pool bound for links.
    pub max_links: usize,
    /// Async-op queue bound; zero disables async I/O.
    pub aio_max: usize,
    /// Largest single read honored.
    pub max_read: u32,
    /// Aggregate buffer-pool cap in bytes.
    pub buffer_cap: usize,
    /// Site tag reported in the statistics document.
    pub site: String,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            port: 1094,
            udp_manager: None,
            udp_server: None,
            admin_path: PathBuf::from("/tmp"),
            admin_group: false,
            allow: Vec::new(),
            caches: Vec::new(),
            local_root: None,
            remote_root: None,
            paths: Vec::new(),
            lup_delay: 5,
            sup_delay: 30,
            sup_count: 1,
            disk_wt: 300,
            sus_delay: 30,
            drop_delay: Duration::from_secs(600),
            service_delay: 15,
            max_delay: 300,
            msg_ttl: 2,
            fx_hold: Duration::from_secs(8 * 60 * 60),
            p_cpu: 0,
            p_io: 0,
            p_mem: 0,
            p_pag: 0,
            p_runq: 0,
            fuzz: 20,
            max_load: 80,
            ref_reset: Duration::from_secs(3600),
            disk_min: 10 * 1024,
            disk_adj: 1024,
            disk_linger: 0,
            disk_ask: Duration::from_secs(12),
            ask_ping: Duration::from_secs(60),
            ask_perf: 3,
            log_perf: 0,
            perf_int: Duration::from_secs(180),
            perf_pgm: None,
            prep_reset: 3,
            prep_scrub: Duration::from_secs(360),
            prep_echo: false,
            prep_ifpgm: None,
            subscribe: Vec::new(),
            mgr_threads: PoolSize { min: 8, max: 64 },
            srv_threads: PoolSize { min: 4, max: 32 },
            trace: Vec::new(),
            rep_wait: Duration::from_secs(3),
            max_links: 16,
            aio_max: 64,
            max_read: 1 << 20,
            buffer_cap: 64 << 20,
            site: String::new(),
        }
    }
}

fn need<'a>(key: &'static str, what: &'static str, t: &mut Tokens<'a>) -> Result<&'a str, ConfigError> {
    t.next().ok_or(ConfigError::Missing(key, what))
}

fn num<T: std::str::FromStr>(key: &'static str, tok: &str) -> Result<T, ConfigError> {
    tok.parse()
        .map_err(|_| ConfigError::BadValue(key, tok.to_owned()))
}

fn pct(key: &'static str, tok: &str) -> Result<u32, ConfigError> {
    let v: u32 = num(key, tok)?;
    if v > 100 {
        return Err(ConfigError::BadValue(key, tok.to_owned()));
    }
    Ok(v)
}

impl Config {
    /// Read a directive file: one directive per line, `#` comments and
    /// blank lines ignored.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let mut cfg = Config::default();
        for line in fs::read_to_string(path)?.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            cfg.parse_line(line)?;
        }
        Ok(cfg)
    }

    /// The selector uses load scoring when any capacity weight is nonzero,
    /// round-robin otherwise.
    pub fn by_load(&self) -> bool {
        self.p_cpu + self.p_io + self.p_mem + self.p_pag + self.p_runq > 0
    }

    /// Consume one directive.
    pub fn parse_line(&mut self, line: &str) -> Result<(), ConfigError> {
        let mut t = Tokens::new(line);
        let key = match t.next() {
            Some(k) => k,
            None => return Ok(()),
        };
        match key {
            "port" => {
                self.port = num("port", need("port", "tcp port", &mut t)?)?;
                if let Some(tok) = t.next() {
                    self.udp_manager = Some(num("port", tok)?);
                }
                if let Some(tok) = t.next() {
                    self.udp_server = Some(num("port", tok)?);
                }
            }
            "adminpath" => {
                self.admin_path = PathBuf::from(need("adminpath", "directory", &mut t)?);
                match t.next() {
                    Some("group") => self.admin_group = true,
                    Some(other) => {
                        return Err(ConfigError::BadValue("adminpath", other.to_owned()));
                    }
                    None => {}
                }
            }
            "allow" => {
                let kind = need("allow", "host|netgroup", &mut t)?;
                let name = need("allow", "name", &mut t)?.to_owned();
                self.allow.push(match kind {
                    "host" => AllowRule::Host(name),
                    "netgroup" => AllowRule::NetGroup(name),
                    other => return Err(ConfigError::BadValue("allow", other.to_owned())),
                });
            }
            "cache" => {
                let group = need("cache", "group", &mut t)?.to_owned();
                let path = need("cache", "path", &mut t)?.to_owned();
                self.caches.push((group, path));
            }
            "localroot" => {
                self.local_root = Some(PathBuf::from(need("localroot", "path", &mut t)?));
            }
            "remoteroot" => {
                self.remote_root = Some(PathBuf::from(need("remoteroot", "path", &mut t)?));
            }
            "path" => {
                let perms = need("path", "permissions", &mut t)?;
                if !perms.chars().all(|c| matches!(c, 'r' | 'w' | 's')) {
                    return Err(ConfigError::BadValue("path", perms.to_owned()));
                }
                let prefix = need("path", "prefix", &mut t)?;
                if !prefix.starts_with('/') {
                    return Err(ConfigError::BadValue("path", prefix.to_owned()));
                }
                self.paths.push((perms.to_owned(), prefix.to_owned()));
            }
            "delay" => {
                let which = need("delay", "kind", &mut t)?;
                let val = need("delay", "value", &mut t)?;
                match which {
                    "lookup" => self.lup_delay = num("delay", val)?,
                    "startup" => self.sup_delay = num("delay", val)?,
                    "servers" => self.sup_count = num("delay", val)?,
                    "full" => self.disk_wt = num("delay", val)?,
                    "suspend" => self.sus_delay = num("delay", val)?,
                    "drop" => self.drop_delay = Duration::from_secs(num("delay", val)?),
                    "service" => self.service_delay = num("delay", val)?,
                    "overload" => self.max_delay = num("delay", val)?,
                    "discard" => self.msg_ttl = num("delay", val)?,
                    other => return Err(ConfigError::BadValue("delay", other.to_owned())),
                }
            }
            "fxhold" => {
                self.fx_hold = Duration::from_secs(num("fxhold", need("fxhold", "seconds", &mut t)?)?);
            }
            "sched" => {
                while let Some(which) = t.next() {
                    let val = need("sched", "value", &mut t)?;
                    match which {
                        "cpu" => self.p_cpu = pct("sched", val)?,
                        "io" => self.p_io = pct("sched", val)?,
                        "mem" => self.p_mem = pct("sched", val)?,
                        "pag" => self.p_pag = pct("sched", val)?,
                        "runq" => self.p_runq = pct("sched", val)?,
                        "fuzz" => self.fuzz = pct("sched", val)?,
                        "maxload" => self.max_load = pct("sched", val)?,
                        "refreset" => self.ref_reset = Duration::from_secs(num("sched", val)?),
                        other => return Err(ConfigError::BadValue("sched", other.to_owned())),
                    }
                }
            }
            "space" => {
                while let Some(which) = t.next() {
                    match which {
                        "linger" => {
                            self.disk_linger = num("space", need("space", "count", &mut t)?)?;
                        }
                        "min" => {
                            self.disk_min = num("space", need("space", "bytes", &mut t)?)?;
                            if let Some(adj) = t.next() {
                                self.disk_adj = num("space", adj)?;
                            }
                        }
                        other => return Err(ConfigError::BadValue("space", other.to_owned())),
                    }
                }
            }
            "ping" => {
                self.ask_ping = Duration::from_secs(num("ping", need("ping", "seconds", &mut t)?)?);
                while let Some(which) = t.next() {
                    let val = need("ping", "value", &mut t)?;
                    match which {
                        "log" => self.log_perf = num("ping", val)?,
                        "usage" => self.ask_perf = num("ping", val)?,
                        other => return Err(ConfigError::BadValue("ping", other.to_owned())),
                    }
                }
            }
            "perf" => {
                while let Some(which) = t.next() {
                    match which {
                        "int" => {
                            self.perf_int =
                                Duration::from_secs(num("perf", need("perf", "seconds", &mut t)?)?);
                        }
                        "pgm" => {
                            let pgm = t.rest();
                            if pgm.is_empty() {
                                return Err(ConfigError::Missing("perf", "program"));
                            }
                            self.perf_pgm = Some(pgm.to_owned());
                        }
                        other => return Err(ConfigError::BadValue("perf", other.to_owned())),
                    }
                }
            }
            "prep" => {
                while let Some(which) = t.next() {
                    match which {
                        "reset" => {
                            self.prep_reset = num("prep", need("prep", "count", &mut t)?)?;
                        }
                        "scrub" => {
                            self.prep_scrub =
                                Duration::from_secs(num("prep", need("prep", "seconds", &mut t)?)?);
                        }
                        "echo" => self.prep_echo = true,
                        "ifpgm" => {
                            let pgm = t.rest();
                            if pgm.is_empty() {
                                return Err(ConfigError::Missing("prep", "program"));
                            }
                            self.prep_ifpgm = Some(pgm.to_owned());
                        }
                        other => return Err(ConfigError::BadValue("prep", other.to_owned())),
                    }
                }
            }
            "subscribe" => {
                let host = need("subscribe", "host", &mut t)?;
                let (host, all) = match host.strip_suffix('+') {
                    Some(h) => (h, true),
                    None => (host, false),
                };
                let port = match t.next() {
                    Some(p) => num("subscribe", p)?,
                    None => self.port,
                };
                self.subscribe.push(Subscription {
                    host: host.to_owned(),
                    port,
                    all,
                });
            }
            "threads" => {
                let first = need("threads", "count or role", &mut t)?;
                let (role, max_tok) = match first {
                    "manager" | "server" => (Some(first), need("threads", "max", &mut t)?),
                    _ => (None, first),
                };
                let max: usize = num("threads", max_tok)?;
                let min = match t.next() {
                    Some(tok) => num("threads", tok)?,
                    None => max.div_ceil(8).max(1),
                };
                let size = PoolSize { min, max };
                match role {
                    Some("manager") => self.mgr_threads = size,
                    Some("server") => self.srv_threads = size,
                    _ => {
                        self.mgr_threads = size;
                        self.srv_threads = size;
                    }
                }
            }
            "trace" => {
                while let Some(flag) = t.next() {
                    self.trace.push(flag.to_owned());
                }
            }
            other => return Err(ConfigError::UnknownKey(other.to_owned())),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_round_robin() {
        let cfg = Config::default();
        assert!(!cfg.by_load());
    }

    #[test]
    fn parses_core_directives() {
        let mut cfg = Config::default();
        for line in [
            "port 2094 2095 2096",
            "path rws /tmp/data",
            "delay lookup 7",
            "delay drop 120",
            "sched cpu 50 io 50 fuzz 10 maxload 90",
            "space min 2048 512",
            "ping 30 usage 2",
            "subscribe mgr.example.org+ 2094",
            "threads manager 32 8",
            "localroot /srv/data",
            "prep scrub 60 echo ifpgm /usr/bin/prep-if --queue main",
        ] {
            cfg.parse_line(line).unwrap();
        }
        assert_eq!(cfg.port, 2094);
        assert_eq!(cfg.udp_server, Some(2096));
        assert_eq!(cfg.paths, vec![("rws".to_owned(), "/tmp/data".to_owned())]);
        assert_eq!(cfg.lup_delay, 7);
        assert_eq!(cfg.drop_delay, Duration::from_secs(120));
        assert!(cfg.by_load());
        assert_eq!(cfg.fuzz, 10);
        assert_eq!(cfg.disk_min, 2048);
        assert_eq!(cfg.disk_adj, 512);
        assert_eq!(cfg.ask_perf, 2);
        assert_eq!(
            cfg.subscribe,
            vec![Subscription {
                host: "mgr.example.org".to_owned(),
                port: 2094,
                all: true
            }]
        );
        assert_eq!(cfg.mgr_threads, PoolSize { min: 8, max: 32 });
        assert_eq!(
            cfg.prep_ifpgm.as_deref(),
            Some("/usr/bin/prep-if --queue main")
        );
        assert!(cfg.prep_echo);
    }

    #[test]
    fn rejects_unknown_and_bad_values() {
        let mut cfg = Config::default();
        assert!(matches!(
            cfg.parse_line("bogus 1"),
            Err(ConfigError::UnknownKey(_))
        ));
        assert!(matches!(
            cfg.parse_line("sched cpu 150"),
            Err(ConfigError::BadValue(..))
        ));
        assert!(matches!(
            cfg.parse_line("path q /x"),
            Err(ConfigError::BadValue(..))
        ));
        assert!(matches!(
            cfg.parse_line("port"),
            Err(ConfigError::Missing(..))
        ));
    }
}
