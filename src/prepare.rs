//! Prepare queue: outstanding stage-in requests.
//!
//! Requests are handed to an external prepare-interface program over its
//! stdin (`+ reqid user prty mode path` to add, `- reqid` to cancel, `?` to
//! list the outstanding set) and mirrored in a local table so the selector
//! can ask whether an offline file is already on the way. A periodic scrub
//! stats each pending path and drops the ones that have come online; every
//! `reset` scrubs the local table is rebuilt from the interface instead.

use std::collections::{HashMap, HashSet};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::Mutex;
use thiserror::Error;

use crate::fs::FileStore;
use crate::sched::{Job, Scheduler};

/// One stage-in request.
#[derive(Debug, Clone)]
pub struct PrepReq {
    /// Globally unique request id.
    pub reqid: String,
    /// Requesting user.
    pub user: String,
    /// Priority, `0..=2`.
    pub prty: u8,
    /// Mode flags (`w`, `r`, `n`, `q`); `q` suppresses the completion notice.
    pub mode: String,
    /// Path to stage.
    pub path: String,
}

/// Errors from queue operations.
#[derive(Debug, Error)]
pub enum PrepError {
    /// No interface program is configured.
    #[error("prepare program not specified; prepare disabled")]
    NotConfigured,
    /// The interface program is not running and could not be restarted.
    #[error("prepare interface is down")]
    IfDown,
}

struct IfProg {
    child: Child,
    stdin: std::process::ChildStdin,
    stdout: BufReader<std::process::ChildStdout>,
}

impl IfProg {
    fn alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

struct PrepInner {
    by_req: HashMap<String, String>,
    paths: HashSet<String>,
    ifprog: Option<IfProg>,
    scrub_to_reset: u32,
    last_emsg: Option<Instant>,
}

/// The prepare queue.
pub struct PrepQ {
    inner: Mutex<PrepInner>,
    ifpgm: Option<String>,
    reset_cnt: u32,
    scrub_every: Duration,
    echo: bool,
    fs: Arc<dyn FileStore>,
}

impl PrepQ {
    /// Build a queue over `fs` (used by the scrubber's stat checks).
    pub fn new(
        ifpgm: Option<String>,
        reset_cnt: u32,
        scrub_every: Duration,
        echo: bool,
        fs: Arc<dyn FileStore>,
    ) -> Arc<PrepQ> {
        Arc::new(PrepQ {
            inner: Mutex::new(PrepInner {
                by_req: HashMap::new(),
                paths: HashSet::new(),
                ifprog: None,
                scrub_to_reset: reset_cnt,
                last_emsg: None,
            }),
            ifpgm,
            reset_cnt,
            scrub_every,
            echo,
            fs,
        })
    }

    /// Scrub cadence for the periodic job.
    pub fn scrub_every(&self) -> Duration {
        self.scrub_every
    }

    /// Forward a stage-in request to the interface and record it locally.
    pub fn add(&self, req: &PrepReq) -> Result<(), PrepError> {
        let mut inner = self.inner.lock();
        self.ensure_if(&mut inner)?;
        let line = format!(
            "+ {} {} {} {} {}\n",
            req.reqid, req.user, req.prty, req.mode, req.path
        );
        if self.put(&mut inner, &line).is_err() {
            return Err(PrepError::IfDown);
        }
        inner.by_req.insert(req.reqid.clone(), req.path.clone());
        inner.paths.insert(req.path.clone());
        if self.echo {
            info!("prepare: queued {} for {}", req.reqid, req.path);
        }
        Ok(())
    }

    /// Cancel a request by id.
    pub fn del(&self, reqid: &str) -> Result<(), PrepError> {
        let mut inner = self.inner.lock();
        self.ensure_if(&mut inner)?;
        let line = format!("- {reqid}\n");
        if self.put(&mut inner, &line).is_err() {
            return Err(PrepError::IfDown);
        }
        if let Some(path) = inner.by_req.remove(reqid) {
            inner.paths.remove(&path);
        }
        if self.echo {
            info!("prepare: cancelled {reqid}");
        }
        Ok(())
    }

    /// Is a stage-in outstanding for `path`? The selector uses this to
    /// treat an offline file as "on the way".
    pub fn exists(&self, path: &str) -> bool {
        self.inner.lock().paths.contains(path)
    }

    /// A server reported the file gone; forget any pending entry for it.
    pub fn gone(&self, path: &str) {
        let mut inner = self.inner.lock();
        if inner.paths.remove(path) {
            inner.by_req.retain(|_, p| p != path);
        }
    }

    /// Number of pending requests.
    pub fn pending(&self) -> usize {
        self.inner.lock().paths.len()
    }

    /// Rebuild the local table from the interface's outstanding list.
    pub fn reset(&self) -> Result<(), PrepError> {
        let mut inner = self.inner.lock();
        self.reset_locked(&mut inner)
    }

    /// Stat each pending path and drop the ones already online; every
    /// `reset_cnt` scrubs do a full reset instead. Restarts a dead
    /// interface program.
    pub fn scrub(&self) {
        let mut inner = self.inner.lock();
        if inner.scrub_to_reset == 0 {
            let _ = self.reset_locked(&mut inner);
        } else {
            inner.scrub_to_reset -= 1;
            let online: Vec<String> = inner
                .paths
                .iter()
                .filter(|p| self.fs.exists(p))
                .cloned()
                .collect();
            for path in online {
                debug!("prepare scrub: {path} is online");
                inner.paths.remove(&path);
                inner.by_req.retain(|_, p| *p != path);
            }
        }
        if self.ifpgm.is_some() {
            let _ = self.ensure_if(&mut inner);
        }
    }

    fn reset_locked(&self, inner: &mut PrepInner) -> Result<(), PrepError> {
        self.ensure_if(inner)?;
        inner.scrub_to_reset = self.reset_cnt;
        if self.put(inner, "?\n").is_err() {
            return Err(PrepError::IfDown);
        }
        inner.by_req.clear();
        inner.paths.clear();
        let Some(ifprog) = inner.ifprog.as_mut() else {
            return Err(PrepError::IfDown);
        };
        let mut line = String::new();
        loop {
            line.clear();
            match ifprog.stdout.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {
                    let path = line.trim();
                    if path.is_empty() {
                        break;
                    }
                    if self.echo {
                        info!("prepare reset: pending {path}");
                    }
                    inner.paths.insert(path.to_owned());
                }
                Err(e) => {
                    warn!("prepare reset: reading interface: {e}");
                    break;
                }
            }
        }
        Ok(())
    }

    fn ensure_if(&self, inner: &mut PrepInner) -> Result<(), PrepError> {
        let Some(pgm) = self.ifpgm.as_deref() else {
            return Err(PrepError::NotConfigured);
        };
        if inner.ifprog.as_mut().is_some_and(IfProg::alive) {
            return Ok(());
        }
        let mut args = pgm.split_whitespace();
        let Some(bin) = args.next() else {
            return Err(PrepError::NotConfigured);
        };
        debug!("prepare: starting {pgm}");
        match Command::new(bin)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
        {
            Ok(mut child) => {
                let stdin = child.stdin.take();
                let stdout = child.stdout.take();
                match (stdin, stdout) {
                    (Some(stdin), Some(stdout)) => {
                        inner.ifprog = Some(IfProg {
                            child,
                            stdin,
                            stdout: BufReader::new(stdout),
                        });
                        Ok(())
                    }
                    _ => Err(PrepError::IfDown),
                }
            }
            Err(e) => {
                // Throttle the complaint to once a minute.
                let now = Instant::now();
                let quiet = inner
                    .last_emsg
                    .is_some_and(|t| now.duration_since(t) < Duration::from_secs(60));
                if !quiet {
                    inner.last_emsg = Some(now);
                    warn!("prepare: cannot start {pgm}: {e}");
                }
                Err(PrepError::IfDown)
            }
        }
    }

    fn put(&self, inner: &mut PrepInner, line: &str) -> std::io::Result<()> {
        let Some(ifprog) = inner.ifprog.as_mut() else {
            return Err(std::io::ErrorKind::BrokenPipe.into());
        };
        let res = ifprog
            .stdin
            .write_all(line.as_bytes())
            .and_then(|_| ifprog.stdin.flush());
        if res.is_err() {
            inner.ifprog = None;
        }
        res
    }
}

impl std::fmt::Debug for PrepQ {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PrepQ({} pending)", self.pending())
    }
}

/// Periodic job driving [`PrepQ::scrub`].
#[derive(Debug)]
pub struct PrepScrubber {
    prepq: Arc<PrepQ>,
}

impl PrepScrubber {
    /// Build a scrubber; schedule it once to start the cycle.
    pub fn new(prepq: Arc<PrepQ>) -> Arc<PrepScrubber> {
        Arc::new(PrepScrubber { prepq })
    }
}

impl Job for PrepScrubber {
    fn comment(&self) -> &'static str {
        "prepare queue scrubber"
    }

    fn run(self: Arc<Self>, sched: &Arc<Scheduler>) {
        self.prepq.scrub();
        let again = self.prepq.scrub_every();
        sched.schedule_in(self, again);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::NativeFs;

    fn queue_with_cat() -> Arc<PrepQ> {
        // `cat` is a fine stand-in interface: it echoes the `?` query line
        // back, which reads as an empty pending list terminated by parse.
        PrepQ::new(
            Some("cat".to_owned()),
            3,
            Duration::from_secs(60),
            false,
            Arc::new(NativeFs::new(None)),
        )
    }

    fn req(id: &str, path: &str) -> PrepReq {
        PrepReq {
            reqid: id.to_owned(),
            user: "u1".to_owned(),
            prty: 0,
            mode: "w".to_owned(),
            path: path.to_owned(),
        }
    }

    #[test]
    fn add_records_and_exists() {
        let q = queue_with_cat();
        q.add(&req("r1", "/d/f3")).unwrap();
        assert!(q.exists("/d/f3"));
        assert_eq!(q.pending(), 1);
        q.del("r1").unwrap();
        assert!(!q.exists("/d/f3"));
    }

    #[test]
    fn gone_removes_pending() {
        let q = queue_with_cat();
        q.add(&req("r1", "/d/a")).unwrap();
        q.add(&req("r2", "/d/b")).unwrap();
        q.gone("/d/a");
        assert!(!q.exists("/d/a"));
        assert!(q.exists("/d/b"));
    }

    #[test]
    fn unconfigured_queue_rejects_add() {
        let q = PrepQ::new(
            None,
            3,
            Duration::from_secs(60),
            false,
            Arc::new(NativeFs::new(None)),
        );
        assert!(matches!(
            q.add(&req("r1", "/d/f")),
            Err(PrepError::NotConfigured)
        ));
    }

    #[test]
    fn scrub_drops_online_paths() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("present");
        std::fs::write(&present, b"x").unwrap();
        let q = queue_with_cat();
        q.add(&req("r1", present.to_str().unwrap())).unwrap();
        q.add(&req("r2", "/no/such/file")).unwrap();
        q.scrub();
        assert!(!q.exists(present.to_str().unwrap()));
        assert!(q.exists("/no/such/file"));
    }
}
