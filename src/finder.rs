//! Finder: the client side of the manager conversation.
//!
//! A data server (or a redirector front end) resolves `locate` requests by
//! sending `<msgid> select[s] {r|w|c|x} <path>` over its manager link and
//! parking the calling thread on a message slot until `!try`, `!wait`, or
//! `?err` comes back, or the reply window closes.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::fs::Errno;
use crate::link::{Link, LinkPool, Tokens};
use crate::msg::MsgTable;

/// Outcome of a locate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Located {
    /// Reconnect to this data server.
    Target(String, u16),
    /// Retry after this many seconds.
    Wait(u32),
    /// Permanent failure with errno and message.
    Fail(Errno, String),
}

/// Manager connection and reply router.
pub struct Finder {
    pool: Arc<LinkPool>,
    msgs: Arc<MsgTable>,
    link: Mutex<Option<Arc<Link>>>,
    mgr_host: String,
    mgr_port: u16,
    rep_wait: Duration,
}

impl Finder {
    /// Build a finder for the manager at `host:port`.
    pub fn new(pool: Arc<LinkPool>, host: &str, port: u16, rep_wait: Duration) -> Arc<Finder> {
        Arc::new(Finder {
            pool,
            msgs: MsgTable::new(),
            link: Mutex::new(None),
            mgr_host: host.to_owned(),
            mgr_port: port,
            rep_wait,
        })
    }

    /// Start the responder thread: connect to the manager, log in as a
    /// director, and route reply lines to waiting slots; reconnect on loss.
    pub fn start(self: &Arc<Self>) {
        let me = self.clone();
        std::thread::Builder::new()
            .name("finder".into())
            .spawn(move || me.responder())
            .map(|_| ())
            .unwrap_or_else(|e| warn!("finder: cannot start responder: {e}"));
    }

    fn responder(self: Arc<Self>) {
        loop {
            let link = match self.pool.connect(&self.mgr_host, self.mgr_port) {
                Ok(link) => link,
                Err(e) => {
                    debug!("finder: {}:{} unreachable: {e}", self.mgr_host, self.mgr_port);
                    std::thread::sleep(Duration::from_secs(10));
                    continue;
                }
            };
            if link.send_line("login director").is_err() {
                std::thread::sleep(Duration::from_secs(10));
                continue;
            }
            info!("finder: connected to manager {}", link.name());
            *self.link.lock() = Some(link.clone());
            loop {
                match link.get_line() {
                    Ok(Some(line)) => {
                        let mut t = Tokens::new(&line);
                        let Some(id) = t.next().and_then(|s| s.parse::<u32>().ok()) else {
                            continue;
                        };
                        self.msgs.reply(id, t.rest());
                    }
                    _ => break,
                }
            }
            *self.link.lock() = None;
            warn!("finder: manager connection lost");
            std::thread::sleep(Duration::from_secs(5));
        }
    }

    /// Resolve `path`; `mode` is `r`, `w`, `c` (create), or `x` (resident
    /// only); `reset` forces the manager to refresh its cache entry.
    pub fn locate(&self, mode: char, path: &str, reset: bool) -> Located {
        let Some(link) = self.link.lock().clone() else {
            return Located::Wait(10);
        };
        let Some(handle) = self.msgs.alloc() else {
            return Located::Wait(1);
        };
        let verb = if reset { "selects" } else { "select" };
        if link
            .send_line(&format!("{} {verb} {mode} {path}", handle.id()))
            .is_err()
        {
            return Located::Wait(10);
        }
        match handle.wait(self.rep_wait) {
            Some(reply) => parse_reply(&reply),
            None => Located::Wait(5),
        }
    }
}

impl std::fmt::Debug for Finder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Finder({}:{})", self.mgr_host, self.mgr_port)
    }
}

fn parse_reply(reply: &str) -> Located {
    let mut t = Tokens::new(reply);
    match t.next() {
        Some("!try") => {
            let target = t.next().unwrap_or_default();
            match target.rsplit_once(':') {
                Some((host, port)) => match port.parse() {
                    Ok(port) => Located::Target(host.to_owned(), port),
                    Err(_) => Located::Fail(
                        Errno::from_raw(libc::EINVAL),
                        format!("malformed redirect target {target}"),
                    ),
                },
                None => Located::Target(target.to_owned(), 0),
            }
        }
        Some("!wait") => {
            let secs = t.next().and_then(|s| s.parse().ok()).unwrap_or(5);
            Located::Wait(secs)
        }
        Some("?err") => Located::Fail(Errno::from_raw(libc::EINVAL), t.rest().to_owned()),
        _ => Located::Fail(
            Errno::from_raw(libc::EPROTO),
            format!("unrecognized manager reply: {reply}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_redirect() {
        assert_eq!(
            parse_reply("!try srv1.example.org:1094"),
            Located::Target("srv1.example.org".to_owned(), 1094)
        );
    }

    #[test]
    fn parses_wait_and_err() {
        assert_eq!(parse_reply("!wait 7"), Located::Wait(7));
        match parse_reply("?err No servers have read access to the file") {
            Located::Fail(_, msg) => assert!(msg.starts_with("No servers")),
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
