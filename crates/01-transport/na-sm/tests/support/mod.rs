//! Two endpoints in one process, isolated under a temporary directory.

#![allow(dead_code)]

use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver};
use na_sm::{
    AddrId, Completion, NaError, OpId, ProcessRegistry, ProgressMode, SmConfig, SmEndpoint,
};
use tempfile::TempDir;

const DEADLINE: Duration = Duration::from_secs(5);
const TICK: Duration = Duration::from_millis(5);

pub struct Harness {
    dir: TempDir,
    registry: ProcessRegistry,
}

pub struct Peer {
    pub ep: SmEndpoint,
    pub completions: Receiver<Completion>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
            registry: ProcessRegistry::new(),
        }
    }

    pub fn config(&self, listen: bool, progress_mode: ProgressMode) -> SmConfig {
        SmConfig {
            listen,
            progress_mode,
            username: Some("test".into()),
            tmp_dir: self.dir.path().to_owned(),
            shm_dir: self.dir.path().to_owned(),
            ..SmConfig::default()
        }
    }

    pub fn open(&self, listen: bool, progress_mode: ProgressMode) -> Peer {
        let (tx, completions) = unbounded();
        let ep = SmEndpoint::open(self.config(listen, progress_mode), &self.registry, tx)
            .expect("open endpoint");
        Peer { ep, completions }
    }

    pub fn path(&self) -> &std::path::Path {
        self.dir.path()
    }
}

impl Peer {
    pub fn name(&self) -> String {
        let me = self.ep.addr_self();
        let name = self.ep.addr_to_string(me).expect("self name");
        self.ep.addr_free(me).expect("free self");
        name
    }

    pub fn op(&self) -> OpId {
        self.ep.op_create()
    }

    /// One progress call that tolerates an idle timeout.
    pub fn tick(&self) {
        match self.ep.progress(TICK) {
            Ok(()) | Err(NaError::Timeout) => {}
            Err(err) => panic!("progress failed: {err}"),
        }
    }

    /// Progresses until a full tick passes without work.
    pub fn settle(&self) {
        let deadline = Instant::now() + DEADLINE;
        while self.ep.progress(TICK).is_ok() {
            assert!(Instant::now() < deadline, "endpoint never went idle");
        }
    }

    pub fn try_completion(&self) -> Option<Completion> {
        self.completions.try_recv().ok()
    }
}

/// Progresses every peer until `target` yields a completion.
pub fn wait_for(target: &Peer, others: &[&Peer]) -> Completion {
    let deadline = Instant::now() + DEADLINE;
    loop {
        if let Some(done) = target.try_completion() {
            return done;
        }
        assert!(Instant::now() < deadline, "timed out waiting for a completion");
        target.tick();
        for peer in others {
            peer.tick();
        }
    }
}

/// Connects `client` to `server` and delivers one unexpected message so the
/// server holds an address for the client. Returns `(client → server,
/// server → client)`.
pub fn connect(client: &Peer, server: &Peer) -> (AddrId, AddrId) {
    let to_server = client.ep.addr_lookup(&server.name()).expect("lookup server");

    let send = client.op();
    client
        .ep
        .msg_send_unexpected(to_server, b"hello".to_vec(), 0, 0, send)
        .expect("send hello");
    let sent = wait_for(client, &[]);
    assert_eq!(sent.result, Ok(()));

    let recv = server.op();
    server
        .ep
        .msg_recv_unexpected(vec![0; 64], 0, recv)
        .expect("post hello receive");
    let hello = wait_for(server, &[client]);
    assert_eq!(hello.result, Ok(()));
    assert_eq!(hello.received(), Some(&b"hello"[..]));
    let to_client = match hello.info {
        na_sm::CompletionInfo::RecvUnexpected { source, .. } => source.expect("source address"),
        other => panic!("unexpected completion info {other:?}"),
    };
    (to_server, to_client)
}
