//! Admin channel: operator commands over a local socket.
//!
//! Each admin line is `<reqid> <verb> <target-pattern> [args...]`. Targets
//! resolve against the live session set by host name; most verbs multicast
//! an unsolicited response frame to every matching client link, and the
//! admin gets back an XML-ish ack naming how many were hit.

use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::Arc;

use log::{info, warn};

use crate::manager::Manager;
use crate::xp::reply::send_async;
use crate::xp::session::{Session, SessionSet};
use crate::xp::wire::AsyncAction;

/// The admin service.
pub struct AdminChannel {
    sessions: Arc<SessionSet>,
    manager: Option<Arc<Manager>>,
}

fn host_match(pattern: &str, host: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return host.starts_with(prefix);
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        return host.ends_with(suffix);
    }
    pattern == host
}

impl AdminChannel {
    /// Build the admin service over the live session set; with a manager
    /// attached, `pause`/`cont` also toggle request service.
    pub fn new(sessions: Arc<SessionSet>, manager: Option<Arc<Manager>>) -> Arc<AdminChannel> {
        Arc::new(AdminChannel { sessions, manager })
    }

    /// Bind the admin socket in `dir` and serve connections on a dedicated
    /// accept thread.
    pub fn start(self: &Arc<Self>, dir: &Path) -> io::Result<()> {
        let path = dir.join("serverd.admin");
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        info!("admin: listening on {}", path.display());
        let me = self.clone();
        std::thread::Builder::new()
            .name("admin-accept".into())
            .spawn(move || {
                for stream in listener.incoming() {
                    match stream {
                        Ok(stream) => {
                            let me = me.clone();
                            let res = std::thread::Builder::new()
                                .name("admin".into())
                                .spawn(move || me.serve_stream(stream));
                            if let Err(e) = res {
                                warn!("admin: cannot start worker: {e}");
                            }
                        }
                        Err(e) => {
                            warn!("admin: accept: {e}");
                            break;
                        }
                    }
                }
            })?;
        Ok(())
    }

    /// Serve one admin connection to completion.
    pub fn serve_stream(&self, stream: UnixStream) {
        let mut writer = match stream.try_clone() {
            Ok(w) => w,
            Err(_) => return,
        };
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(_) => return,
            };
            if line.trim().is_empty() {
                continue;
            }
            let ack = self.handle_line(line.trim());
            if writer.write_all(ack.as_bytes()).is_err() || writer.write_all(b"\n").is_err() {
                return;
            }
        }
    }

    fn targets(&self, pattern: &str) -> Vec<Arc<Session>> {
        self.sessions
            .list()
            .into_iter()
            .filter(|s| host_match(pattern, s.peer_host()) || host_match(pattern, s.peer_name()))
            .collect()
    }

    /// Process one admin line and produce the ack document.
    pub fn handle_line(&self, line: &str) -> String {
        let mut it = line.split_whitespace();
        let (Some(rid), Some(verb)) = (it.next(), it.next()) else {
            return err_ack("?", 22, "request id and verb required");
        };
        let Some(pattern) = it.next() else {
            return err_ack(rid, 22, "target pattern required");
        };
        let args: Vec<&str> = it.collect();
        let targets = self.targets(pattern);

        let sent = match verb {
            "lsc" => {
                let names: Vec<String> =
                    targets.iter().map(|s| s.peer_name().to_owned()).collect();
                return format!(
                    "<resp id=\"{rid}\"><rc>0</rc><conns>{}</conns></resp>",
                    names.join(" ")
                );
            }
            "abort" => self.multicast(&targets, AsyncAction::Abort, b"", true),
            "cont" => {
                if let Some(mgr) = &self.manager {
                    mgr.set_disabled(false);
                }
                self.multicast(&targets, AsyncAction::Cont, b"", false)
            }
            "disc" => self.multicast(&targets, AsyncAction::Disc, b"", true),
            "msg" => {
                let text = args.join(" ");
                self.multicast(&targets, AsyncAction::Msg, text.as_bytes(), false)
            }
            "pause" => {
                let secs: u32 = match args.first().and_then(|a| a.parse().ok()) {
                    Some(secs) => secs,
                    None => return err_ack(rid, 22, "pause needs seconds"),
                };
                if let Some(mgr) = &self.manager {
                    mgr.set_disabled(true);
                }
                self.multicast(&targets, AsyncAction::Wait, &secs.to_be_bytes(), false)
            }
            "redirect" => {
                let Some(target) = args.first() else {
                    return err_ack(rid, 22, "redirect needs host:port");
                };
                let Some((host, port)) = target.rsplit_once(':') else {
                    return err_ack(rid, 22, "redirect needs host:port");
                };
                let Ok(port) = port.parse::<u16>() else {
                    return err_ack(rid, 22, "bad redirect port");
                };
                let mut payload = Vec::with_capacity(4 + host.len());
                payload.extend_from_slice(&u32::from(port).to_be_bytes());
                payload.extend_from_slice(host.as_bytes());
                self.multicast(&targets, AsyncAction::Redirect, &payload, false)
            }
            other => return err_ack(rid, 38, &format!("unknown verb {other}")),
        };
        info!("admin: {verb} {pattern} hit {sent} clients");
        format!("<resp id=\"{rid}\"><rc>0</rc><sent>{sent}</sent></resp>")
    }

    fn multicast(
        &self,
        targets: &[Arc<Session>],
        action: AsyncAction,
        payload: &[u8],
        then_close: bool,
    ) -> usize {
        let mut sent = 0;
        for sess in targets {
            if send_async(sess.link(), action, payload).is_ok() {
                sent += 1;
            }
            if then_close {
                sess.disconnect();
            }
        }
        sent
    }
}

impl std::fmt::Debug for AdminChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AdminChannel")
    }
}

fn err_ack(rid: &str, rc: i32, msg: &str) -> String {
    format!("<resp id=\"{rid}\"><rc>{rc}</rc><msg>{msg}</msg></resp>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_patterns() {
        assert!(host_match("*", "anything"));
        assert!(host_match("10.0.*", "10.0.1.5"));
        assert!(host_match("*.example.org", "a.example.org"));
        assert!(host_match("h1", "h1"));
        assert!(!host_match("h1", "h2"));
    }

    #[test]
    fn malformed_lines_get_error_acks() {
        let admin = AdminChannel::new(SessionSet::new(), None);
        assert!(admin.handle_line("7").contains("<rc>22</rc>"));
        assert!(admin.handle_line("7 bogus *").contains("<rc>38</rc>"));
        assert!(admin.handle_line("7 pause *").contains("<rc>22</rc>"));
    }

    #[test]
    fn lsc_with_no_sessions_is_empty() {
        let admin = AdminChannel::new(SessionSet::new(), None);
        let ack = admin.handle_line("9 lsc *");
        assert_eq!(ack, "<resp id=\"9\"><rc>0</rc><conns></conns></resp>");
    }

    #[test]
    fn msg_to_nobody_reports_zero_sent() {
        let admin = AdminChannel::new(SessionSet::new(), None);
        let ack = admin.handle_line("3 msg * maintenance at noon");
        assert_eq!(ack, "<resp id=\"3\"><rc>0</rc><sent>0</sent></resp>");
    }
}
