//! End-to-end tests: real sockets, both roles, the full protocol.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use zerocopy::byteorder::big_endian::{U16, U32};
use zerocopy::{FromBytes, IntoBytes};

use serverd::admin::AdminChannel;
use serverd::config::{Config, Subscription};
use serverd::fs::NativeFs;
use serverd::link::LinkPool;
use serverd::proc::{Process, Role};
use serverd::subscriber::Subscriber;
use serverd::xp::wire::{
    self, FhParams, Opcode, OpenFlags, OpenParams, ReadParams, ReqHeader, RespHeader, Status,
};

struct Client {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    next_sid: u16,
}

impl Client {
    fn connect(port: u16) -> Client {
        let stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        Client {
            reader: BufReader::new(stream.try_clone().expect("clone stream")),
            writer: stream,
            next_sid: 1,
        }
    }

    fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read line");
        line.trim_end().to_owned()
    }

    fn send_line(&mut self, text: &str) {
        self.writer.write_all(text.as_bytes()).expect("send line");
        self.writer.write_all(b"\n").expect("send line");
    }

    fn handshake(&mut self, login: &str) {
        let hello = self.read_line();
        assert!(hello.starts_with("hello serverd"), "unexpected: {hello}");
        self.send_line(login);
        let ok = self.read_line();
        assert_eq!(ok, "ok");
    }

    fn request(&mut self, opcode: Opcode, params: [u8; 16], payload: &[u8]) -> u16 {
        let sid = self.next_sid;
        self.next_sid += 1;
        let hdr = ReqHeader {
            streamid: U16::new(sid),
            opcode: U16::new(opcode as u16),
            params,
            dlen: U32::new(payload.len() as u32),
        };
        self.writer.write_all(hdr.as_bytes()).expect("send header");
        self.writer.write_all(payload).expect("send payload");
        sid
    }

    fn response(&mut self) -> (u16, u16, Vec<u8>) {
        let mut hdr = [0u8; 8];
        self.reader.read_exact(&mut hdr).expect("response header");
        let hdr = RespHeader::read_from_bytes(&hdr).unwrap();
        let mut payload = vec![0u8; hdr.dlen.get() as usize];
        self.reader.read_exact(&mut payload).expect("response body");
        (hdr.streamid.get(), hdr.status.get(), payload)
    }

    fn expect_ok(&mut self, sid: u16) -> Vec<u8> {
        let (rsid, status, payload) = self.response();
        assert_eq!(rsid, sid);
        assert_eq!(status, Status::Ok as u16, "payload: {payload:?}");
        payload
    }

    fn open(&mut self, path: &str, flags: OpenFlags, mode: u16) -> u32 {
        let p = OpenParams {
            mode: U16::new(mode),
            options: U16::new(flags.bits()),
            reserved: [0; 12],
        };
        let mut params = [0u8; 16];
        params.copy_from_slice(p.as_bytes());
        let sid = self.request(Opcode::Open, params, path.as_bytes());
        let payload = self.expect_ok(sid);
        u32::from_be_bytes(payload[..4].try_into().unwrap())
    }

    fn read_at(&mut self, fh: u32, offset: u64, len: u32) -> (u16, u16, Vec<u8>) {
        let (hi, lo) = wire::split_offset(offset);
        let p = ReadParams {
            fhandle: U32::new(fh),
            off_hi: U32::new(hi),
            off_lo: U32::new(lo),
            rlen: U32::new(len),
        };
        let mut params = [0u8; 16];
        params.copy_from_slice(p.as_bytes());
        let sid = self.request(Opcode::Read, params, &[]);
        let (rsid, status, payload) = self.response();
        assert_eq!(rsid, sid);
        (rsid, status, payload)
    }

    fn fh_request(&mut self, opcode: Opcode, fh: u32) -> u16 {
        let p = FhParams {
            fhandle: U32::new(fh),
            reserved: [0; 12],
        };
        let mut params = [0u8; 16];
        params.copy_from_slice(p.as_bytes());
        self.request(opcode, params, &[])
    }
}

fn server_process(localroot: &std::path::Path) -> Process {
    let mut cfg = Config::default();
    cfg.port = 0;
    cfg.local_root = Some(localroot.to_path_buf());
    let proc = Process::assemble(cfg, Role::Server).expect("assemble server");
    proc.start().expect("start server");
    proc
}

#[test]
fn single_server_open_read_close() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("data")).unwrap();
    let body: Vec<u8> = (0..=255u8).collect();
    std::fs::write(dir.path().join("data/hello"), &body).unwrap();

    let proc = server_process(dir.path());
    let mut client = Client::connect(proc.local_port());
    client.handshake("login tester user proto 400");

    let fh = client.open("/data/hello", OpenFlags::empty(), 0);
    let (_, status, payload) = client.read_at(fh, 0, 100);
    assert_eq!(status, Status::Ok as u16);
    assert_eq!(payload, &body[..100]);

    let (_, status, payload) = client.read_at(fh, 200, 100);
    assert_eq!(status, Status::Ok as u16);
    assert_eq!(payload, &body[200..256]);

    let sid = client.fh_request(Opcode::Close, fh);
    client.expect_ok(sid);

    // Reads against a closed handle fail cleanly.
    let (_, status, payload) = client.read_at(fh, 0, 10);
    assert_eq!(status, Status::Error as u16);
    let errno = u32::from_be_bytes(payload[..4].try_into().unwrap());
    assert_eq!(errno as i32, libc::EBADF);
}

#[test]
fn write_sync_and_read_back() {
    let dir = tempfile::tempdir().unwrap();
    let proc = server_process(dir.path());
    let mut client = Client::connect(proc.local_port());
    client.handshake("login writer user proto 400");

    let fh = client.open(
        "/out/new.dat",
        OpenFlags::NEW | OpenFlags::UPDATE | OpenFlags::MKPATH,
        0o644,
    );
    let p = wire::WriteParams {
        fhandle: U32::new(fh),
        off_hi: U32::new(0),
        off_lo: U32::new(5),
        reserved: U32::new(0),
    };
    let mut params = [0u8; 16];
    params.copy_from_slice(p.as_bytes());
    let sid = client.request(Opcode::Write, params, b"world");
    client.expect_ok(sid);

    let sid = client.fh_request(Opcode::Sync, fh);
    client.expect_ok(sid);

    let (_, status, payload) = client.read_at(fh, 5, 5);
    assert_eq!(status, Status::Ok as u16);
    assert_eq!(payload, b"world");

    let sid = client.fh_request(Opcode::Close, fh);
    client.expect_ok(sid);
    assert_eq!(
        std::fs::read(dir.path().join("out/new.dat")).unwrap()[5..],
        *b"world"
    );
}

#[test]
fn readv_returns_each_segment() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("f"), b"abcdefghij").unwrap();
    let proc = server_process(dir.path());
    let mut client = Client::connect(proc.local_port());
    client.handshake("login reader user proto 400");

    let fh = client.open("/f", OpenFlags::empty(), 0);
    let mut payload = Vec::new();
    for (off, len) in [(0u64, 3u32), (7, 3)] {
        let (hi, lo) = wire::split_offset(off);
        let seg = wire::ReadvSeg {
            fhandle: U32::new(fh),
            rlen: U32::new(len),
            off_hi: U32::new(hi),
            off_lo: U32::new(lo),
        };
        payload.extend_from_slice(seg.as_bytes());
    }
    let sid = client.request(Opcode::Readv, [0; 16], &payload);

    let (rsid, status, body) = client.response();
    assert_eq!(rsid, sid);
    assert_eq!(status, Status::OkSoFar as u16);
    assert_eq!(&body[16..], b"abc");
    let (_, status, body) = client.response();
    assert_eq!(status, Status::Ok as u16);
    assert_eq!(&body[16..], b"hij");
}

#[test]
fn legacy_client_gets_efbig_past_2g() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("f"), b"x").unwrap();
    let proc = server_process(dir.path());
    let mut client = Client::connect(proc.local_port());
    // No proto token: the client is treated as legacy 32-bit.
    client.handshake("login old user");

    let fh = client.open("/f", OpenFlags::empty(), 0);
    let (_, status, payload) = client.read_at(fh, 1 << 31, 10);
    assert_eq!(status, Status::Error as u16);
    let errno = u32::from_be_bytes(payload[..4].try_into().unwrap());
    assert_eq!(errno as i32, libc::EFBIG);

    // A modern login on the same server reads high offsets fine.
    let mut modern = Client::connect(proc.local_port());
    modern.handshake("login new user proto 400");
    let fh = modern.open("/f", OpenFlags::empty(), 0);
    let (_, status, payload) = modern.read_at(fh, 1 << 31, 10);
    assert_eq!(status, Status::Ok as u16);
    assert!(payload.is_empty(), "read past EOF is empty, not an error");
}

#[test]
fn unknown_opcode_terminates_session() {
    let dir = tempfile::tempdir().unwrap();
    let proc = server_process(dir.path());
    let mut client = Client::connect(proc.local_port());
    client.handshake("login x user proto 400");

    let hdr = ReqHeader {
        streamid: U16::new(9),
        opcode: U16::new(2999),
        params: [0; 16],
        dlen: U32::new(0),
    };
    client.writer.write_all(hdr.as_bytes()).unwrap();
    let (_, status, _) = client.response();
    assert_eq!(status, Status::Error as u16);
    // The session is gone afterwards.
    let mut byte = [0u8; 1];
    assert_eq!(client.reader.read(&mut byte).unwrap(), 0);
}

#[test]
fn stats_query_returns_summary_document() {
    let dir = tempfile::tempdir().unwrap();
    let proc = server_process(dir.path());
    let mut client = Client::connect(proc.local_port());
    client.handshake("login probe user proto 400");

    let p = wire::QueryParams {
        subcode: U16::new(wire::QUERY_STATS),
        reserved: [0; 14],
    };
    let mut params = [0u8; 16];
    params.copy_from_slice(p.as_bytes());
    let sid = client.request(Opcode::Query, params, &[]);
    let doc = String::from_utf8(client.expect_ok(sid)).unwrap();
    assert!(doc.starts_with("<statistics "));
    assert!(doc.contains("<stats id=\"link\">"));
    assert!(doc.contains("<stats id=\"sched\">"));
}

#[test]
fn auth_continuation_gates_the_session() {
    use serverd::xp::aio::AioQueue;
    use serverd::xp::session::{AuthProtocol, AuthStep, Session, SessionCtx, SessionSet};
    use serverd::{BuffPool, Config, NativeFs, Scheduler};

    struct Password;
    impl AuthProtocol for Password {
        fn name(&self) -> &str {
            "pwd"
        }
        fn first(&self) -> String {
            "password?".to_owned()
        }
        fn step(&self, cred: &str) -> AuthStep {
            if cred == "sesame" {
                AuthStep::Done("caller".to_owned())
            } else {
                AuthStep::Deny("wrong password".to_owned())
            }
        }
    }

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("f"), b"guarded").unwrap();
    let cfg = Arc::new(Config::default());
    let ctx = Arc::new(SessionCtx {
        cfg: cfg.clone(),
        fs: Arc::new(NativeFs::new(Some(dir.path().to_path_buf()))),
        bufs: BuffPool::new(cfg.buffer_cap),
        sched: Scheduler::new(1, 4).unwrap(),
        aio: AioQueue::new(0),
        sessions: SessionSet::new(),
        finder: None,
        prepq: None,
        auth: Some(Arc::new(Password)),
        stats: None,
    });

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let pool = LinkPool::new(2);
    std::thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let peer = stream.peer_addr().unwrap();
            let link = pool.alloc_stream(stream, peer);
            let ctx = ctx.clone();
            std::thread::spawn(move || Session::serve(ctx, link));
        }
    });

    // Wrong credentials are denied and the session ends.
    let mut denied = Client::connect(port);
    let hello = denied.read_line();
    assert!(hello.contains("auth pwd"), "hello advertises auth: {hello}");
    denied.send_line("login eve user proto 400");
    assert_eq!(denied.read_line(), "auth continue password?");
    denied.send_line("auth letmein");
    assert_eq!(denied.read_line(), "auth err wrong password");

    // Correct credentials reach the active state.
    let mut client = Client::connect(port);
    let _ = client.read_line();
    client.send_line("login ali user proto 400");
    assert_eq!(client.read_line(), "auth continue password?");
    client.send_line("auth sesame");
    assert_eq!(client.read_line(), "auth ok");
    assert_eq!(client.read_line(), "ok");

    let fh = client.open("/f", OpenFlags::empty(), 0);
    let (_, status, payload) = client.read_at(fh, 0, 16);
    assert_eq!(status, Status::Ok as u16);
    assert_eq!(payload, b"guarded");
}

// ---------------------------------------------------------------- cluster

struct Cluster {
    mgr: Process,
    _subs: Vec<Arc<Subscriber>>,
    _dirs: Vec<tempfile::TempDir>,
}

/// A manager plus two data-server subscriptions on "/d": one server
/// empty, the other holding `/d/f1`.
fn cluster() -> Cluster {
    let mut mcfg = Config::default();
    mcfg.port = 0;
    mcfg.lup_delay = 1;
    let mgr = Process::assemble(mcfg, Role::Manager).expect("assemble manager");
    mgr.start().expect("start manager");
    let mgr_port = mgr.local_port();

    let mut subs = Vec::new();
    let mut dirs = Vec::new();
    for (port, with_file) in [(9101u16, false), (9102, true)] {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("d")).unwrap();
        if with_file {
            std::fs::write(dir.path().join("d/f1"), b"clustered!").unwrap();
        }
        let scfg = Config {
            paths: vec![("r".to_owned(), "/d".to_owned())],
            ..Config::default()
        };
        let sub = Subscriber::new(
            Arc::new(scfg),
            LinkPool::new(4),
            Arc::new(NativeFs::new(Some(dir.path().to_path_buf()))),
            None,
            port,
            false,
        );
        sub.start("127.0.0.1".to_owned(), mgr_port).unwrap();
        subs.push(sub);
        dirs.push(dir);
    }

    // Both servers must be bound before tests drive selections.
    let mgr_core = mgr.manager.clone().unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while mgr_core.server_count() < 2 {
        assert!(Instant::now() < deadline, "servers never subscribed");
        std::thread::sleep(Duration::from_millis(20));
    }
    Cluster {
        mgr,
        _subs: subs,
        _dirs: dirs,
    }
}

#[test]
fn cold_lookup_waits_then_redirects() {
    let cl = cluster();
    let mut director = Client::connect(cl.mgr.local_port());
    director.send_line("login director");

    director.send_line("1 select r /d/f1");
    let reply = director.read_line();
    assert_eq!(reply, "1 !wait 1", "cold lookup must defer the client");

    // The state broadcast is answered by the holder while we wait out the
    // lookup window; the retry then redirects.
    std::thread::sleep(Duration::from_millis(1300));
    director.send_line("2 select r /d/f1");
    let reply = director.read_line();
    assert_eq!(reply, "2 !try 127.0.0.1:9102");

    // An immediate identical select sticks with the same server.
    director.send_line("3 select r /d/f1");
    assert_eq!(director.read_line(), "3 !try 127.0.0.1:9102");
}

#[test]
fn unknown_path_is_permanent_error() {
    let cl = cluster();
    let mut director = Client::connect(cl.mgr.local_port());
    director.send_line("login director");

    director.send_line("4 select w /elsewhere/f");
    let reply = director.read_line();
    assert!(
        reply.starts_with("4 ?err"),
        "no write capability anywhere: {reply}"
    );
}

#[test]
fn paused_manager_defers_directors() {
    let cl = cluster();
    let admin = AdminChannel::new(cl.mgr.sessions.clone(), cl.mgr.manager.clone());
    let ack = admin.handle_line("1 pause * 30");
    assert!(ack.contains("<rc>0</rc>"));

    let mut director = Client::connect(cl.mgr.local_port());
    director.send_line("login director");
    director.send_line("9 select r /d/f1");
    let reply = director.read_line();
    assert_eq!(reply, format!("9 !wait {}", cl.mgr.cfg.service_delay));

    let ack = admin.handle_line("2 cont *");
    assert!(ack.contains("<rc>0</rc>"));
    director.send_line("10 select r /d/f1");
    assert!(director.read_line().starts_with("10 !"));
}

#[test]
fn data_server_locate_redirects_through_manager() {
    let cl = cluster();
    let mgr_port = cl.mgr.local_port();

    // A diskless front server subscribed to the same manager.
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = Config::default();
    cfg.port = 0;
    cfg.local_root = Some(dir.path().to_path_buf());
    cfg.subscribe = vec![Subscription {
        host: "127.0.0.1".to_owned(),
        port: mgr_port,
        all: false,
    }];
    let front = Process::assemble(cfg, Role::Server).expect("assemble front");
    front.start().expect("start front");

    let mut client = Client::connect(front.local_port());
    client.handshake("login roamer user proto 400");

    let p = wire::LocateParams {
        mode: b'r',
        refresh: 0,
        reserved: [0; 14],
    };
    let mut params = [0u8; 16];
    params.copy_from_slice(p.as_bytes());

    // The finder may still be connecting and the manager cache is cold, so
    // poll until the redirect lands.
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        let sid = client.request(Opcode::Locate, params, b"/d/f1");
        let (rsid, status, payload) = client.response();
        assert_eq!(rsid, sid);
        if status == Status::Redirect as u16 {
            let port = u32::from_be_bytes(payload[..4].try_into().unwrap());
            assert_eq!(port, 9102);
            assert_eq!(&payload[4..], b"127.0.0.1");
            break;
        }
        assert_eq!(status, Status::Wait as u16, "unexpected status {status}");
        assert!(Instant::now() < deadline, "locate never redirected");
        std::thread::sleep(Duration::from_millis(300));
    }
}
