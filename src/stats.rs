//! Summary statistics document.
//!
//! A small XML-like text with a `<statistics>` root and one `<stats>`
//! child per component, scalar integer elements only. The metrics exporter
//! scrapes it via the admin query; tests parse it directly.

use std::sync::Arc;
use std::time::Instant;

use crate::buffer::BuffPool;
use crate::link::LinkPool;
use crate::manager::Manager;
use crate::sched::Scheduler;
use crate::xp::session::SessionSet;

/// Live counter sources for the document.
pub struct Stats {
    started: Instant,
    site: String,
    src: String,
    links: Arc<LinkPool>,
    sched: Arc<Scheduler>,
    bufs: Arc<BuffPool>,
    sessions: Arc<SessionSet>,
    manager: Option<Arc<Manager>>,
}

impl Stats {
    /// Wire up the document sources. `src` names this instance
    /// (host:port), `site` is the configured site tag.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        site: String,
        src: String,
        links: Arc<LinkPool>,
        sched: Arc<Scheduler>,
        bufs: Arc<BuffPool>,
        sessions: Arc<SessionSet>,
        manager: Option<Arc<Manager>>,
    ) -> Arc<Stats> {
        Arc::new(Stats {
            started: Instant::now(),
            site,
            src,
            links,
            sched,
            bufs,
            sessions,
            manager,
        })
    }

    /// Render the document.
    pub fn render(&self) -> String {
        let mut out = format!(
            "<statistics ver=\"{}\" src=\"{}\" site=\"{}\" tos=\"{}\">",
            env!("CARGO_PKG_VERSION"),
            self.src,
            self.site,
            self.started.elapsed().as_secs()
        );

        let (ltot, lin, lrecv, lsent) = self.links.stats();
        out.push_str(&format!(
            "<stats id=\"link\"><tot>{ltot}</tot><now>{lin}</now><in>{lrecv}</in><out>{lsent}</out></stats>"
        ));

        let (jobs, workers, queued) = self.sched.stats();
        out.push_str(&format!(
            "<stats id=\"sched\"><jobs>{jobs}</jobs><threads>{workers}</threads><inq>{queued}</inq></stats>"
        ));

        let (breqs, ballocs, bfrees) = self.bufs.stats();
        out.push_str(&format!(
            "<stats id=\"buff\"><reqs>{breqs}</reqs><mem>{}</mem><buffs>{ballocs}</buffs><rel>{bfrees}</rel></stats>",
            self.bufs.live_bytes()
        ));

        let (served, live, reqs) = self.sessions.stats();
        out.push_str(&format!(
            "<stats id=\"proc\"><tot>{served}</tot><now>{live}</now></stats>"
        ));
        out.push_str(&format!("<stats id=\"prot\"><reqs>{reqs}</reqs></stats>"));

        if let Some(mgr) = &self.manager {
            out.push_str(&mgr.stats_xml());
        }
        out.push_str("</statistics>");
        out
    }
}

impl std::fmt::Debug for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Stats({})", self.src)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_all_sections() {
        let stats = Stats::new(
            "site1".into(),
            "host:1094".into(),
            LinkPool::new(4),
            Scheduler::new(1, 2).unwrap(),
            BuffPool::new(1 << 20),
            SessionSet::new(),
            None,
        );
        let doc = stats.render();
        assert!(doc.starts_with("<statistics "));
        assert!(doc.ends_with("</statistics>"));
        for id in ["link", "sched", "buff", "proc", "prot"] {
            assert!(doc.contains(&format!("<stats id=\"{id}\">")), "missing {id}");
        }
    }
}
