//! End-to-end tests driving the client against the server over an
//! in-process duplex stream.

use {
    async_trait::async_trait,
    bytes::buf::{Buf, BufMut},
    futures::sink::SinkExt,
    ninep::{
        client::Client,
        dm, errstr,
        fcall::*,
        serialize,
        srv::{FId, Filesystem, serve_stream},
        srv_util::{FileId, Pending, read_buf, readdir, walk_chain},
        utils::Result,
    },
    std::sync::{Arc, Mutex},
    tokio::io::{AsyncRead, AsyncWrite, DuplexStream},
    tokio_stream::StreamExt,
    tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec, length_delimited},
};

/*
 * The fixture filesystem:
 *
 *   /            dir,  qid path 1
 *   /a           dir,  qid path 2
 *   /a/b         file, qid path 3, 10000 bytes, iounit 4096
 *   /hello       file, qid path 4, "hello, world\n"
 *   /event       file, qid path 5, pending-read multicast
 */

const QID_ROOT: u64 = 1;
const QID_A: u64 = 2;
const QID_B: u64 = 3;
const QID_HELLO: u64 = 4;
const QID_EVENT: u64 = 5;

const HELLO: &[u8] = b"hello, world\n";

fn b_content() -> Vec<u8> {
    (0..10000u32).map(|i| (i % 251) as u8).collect()
}

type Node = Arc<FileId<()>>;

fn lookup(dir: &Node, name: &str) -> Option<FileId<()>> {
    match (dir.path, name) {
        (QID_ROOT, "a") => Some(dir.child("a", QIdType::DIR, QID_A, dm::DIR | 0o755, ())),
        (QID_ROOT, "hello") => Some(dir.child("hello", QIdType::FILE, QID_HELLO, 0o644, ())),
        (QID_ROOT, "event") => Some(dir.child("event", QIdType::FILE, QID_EVENT, 0o600, ())),
        (QID_A, "b") => Some(dir.child("b", QIdType::FILE, QID_B, 0o644, ())),
        _ => None,
    }
}

fn stat_of(node: &Node) -> Stat {
    let (mode, length) = match node.path {
        QID_ROOT | QID_A => (dm::DIR | 0o755, 0),
        QID_B => (0o644, b_content().len() as u64),
        QID_HELLO => (0o644, HELLO.len() as u64),
        _ => (0o600, 0),
    };
    Stat {
        typ: 0,
        dev: 0,
        qid: node.qid(),
        mode,
        atime: 0,
        mtime: 0,
        length,
        name: node.name.clone(),
        uid: "kris".to_owned(),
        gid: "kris".to_owned(),
        muid: "kris".to_owned(),
    }
}

fn children(path: u64) -> Vec<Stat> {
    let root = FileId::root("/", QIdType::DIR, QID_ROOT, dm::DIR | 0o755, ());
    let names: &[&str] = match path {
        QID_ROOT => &["a", "hello", "event"],
        QID_A => &["b"],
        _ => &[],
    };
    let dir = if path == QID_A {
        Arc::new(lookup(&root, "a").unwrap())
    } else {
        root
    };
    names
        .iter()
        .map(|name| stat_of(&Arc::new(lookup(&dir, name).unwrap())))
        .collect()
}

#[derive(Clone, Default)]
struct TestFs {
    pending: Pending,
    reads: Arc<Mutex<Vec<(u64, u32)>>>,
    freed: Arc<Mutex<Vec<u32>>>,
}

type Aux = Mutex<Option<Node>>;

fn node_of(fid: &FId<Aux>) -> Result<Node> {
    fid.aux
        .lock()
        .unwrap()
        .clone()
        .ok_or_else(|| ninep::Error::Remote(errstr::ENOFID.to_owned()))
}

#[async_trait]
impl Filesystem for TestFs {
    type FId = Aux;

    async fn rattach(
        &self,
        fid: &FId<Self::FId>,
        _afid: Option<&FId<Self::FId>>,
        _uname: &str,
        _aname: &str,
    ) -> Result<FCall> {
        let root = FileId::root("/", QIdType::DIR, QID_ROOT, dm::DIR | 0o755, ());
        let qid = root.qid();
        *fid.aux.lock().unwrap() = Some(root);
        Ok(FCall::RAttach { qid })
    }

    async fn rwalk(
        &self,
        fid: &FId<Self::FId>,
        newfid: &FId<Self::FId>,
        wnames: &[String],
    ) -> Result<FCall> {
        let from = node_of(fid)?;
        let (wqids, leaf) = walk_chain(&from, wnames, lookup);
        if !wnames.is_empty() && wqids.is_empty() {
            return Err(ninep::Error::Remote(errstr::ENOFILE.to_owned()));
        }
        if let Some(leaf) = leaf {
            *newfid.aux.lock().unwrap() = Some(leaf);
        }
        Ok(FCall::RWalk { wqids })
    }

    async fn ropen(&self, fid: &FId<Self::FId>, _mode: u8) -> Result<FCall> {
        let node = node_of(fid)?;
        if node.path == QID_EVENT {
            self.pending.push_fid(fid.fid());
        }
        let iounit = if node.path == QID_B { 4096 } else { 0 };
        Ok(FCall::ROpen {
            qid: node.qid(),
            iounit,
        })
    }

    async fn rread(&self, fid: &FId<Self::FId>, offset: u64, count: u32) -> Result<FCall> {
        let node = node_of(fid)?;
        let data = match node.path {
            QID_ROOT | QID_A => readdir(offset, count, children(node.path))?,
            QID_B => {
                self.reads.lock().unwrap().push((offset, count));
                read_buf(offset, count, &b_content())
            }
            QID_HELLO => read_buf(offset, count, HELLO),
            QID_EVENT => Data(self.pending.read(fid.fid()).await?),
            _ => Data(Vec::new()),
        };
        Ok(FCall::RRead { data })
    }

    async fn rwrite(&self, fid: &FId<Self::FId>, _offset: u64, data: &Data) -> Result<FCall> {
        let node = node_of(fid)?;
        if node.path != QID_EVENT {
            return Err(ninep::Error::Remote("permission denied".to_owned()));
        }
        self.pending.write(&data.0);
        Ok(FCall::RWrite {
            count: data.0.len() as u32,
        })
    }

    async fn rstat(&self, fid: &FId<Self::FId>) -> Result<FCall> {
        let node = node_of(fid)?;
        if node.path == QID_HELLO {
            // Delay one reply so concurrent callers see out-of-order tags.
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        Ok(FCall::RStat {
            stat: stat_of(&node),
        })
    }

    async fn rwstat(&self, fid: &FId<Self::FId>, _stat: &Stat) -> Result<FCall> {
        node_of(fid)?;
        Ok(FCall::RWStat)
    }

    async fn rclunk(&self, fid: &FId<Self::FId>) -> Result<FCall> {
        if self.pending.has_fid(fid.fid()) {
            self.pending.clunk_fid(fid.fid());
        }
        Ok(FCall::RClunk)
    }

    async fn rremove(&self, fid: &FId<Self::FId>) -> Result<FCall> {
        node_of(fid)?;
        Err(ninep::Error::Remote("permission denied".to_owned()))
    }

    async fn freefid(&self, fid: &FId<Self::FId>) {
        self.freed.lock().unwrap().push(fid.fid());
    }
}

fn spawn_server(fs: TestFs) -> (DuplexStream, tokio::task::JoinHandle<()>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (client_side, server_side) = tokio::io::duplex(64 * 1024);
    let handle = tokio::spawn(async move {
        let _ = serve_stream(fs, server_side).await;
    });
    (client_side, handle)
}

async fn mounted(fs: TestFs) -> Client {
    let (stream, _) = spawn_server(fs);
    Client::mount_stream(stream, "").await.unwrap()
}

/*
 * Raw-frame plumbing for the tests that need to speak the protocol
 * without the client facade.
 */

type RawRead = FramedRead<tokio::io::ReadHalf<DuplexStream>, LengthDelimitedCodec>;
type RawWrite = FramedWrite<tokio::io::WriteHalf<DuplexStream>, LengthDelimitedCodec>;

fn raw_codec() -> length_delimited::Builder {
    let mut builder = LengthDelimitedCodec::builder();
    builder
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .little_endian();
    builder
}

fn raw_pair(stream: DuplexStream) -> (RawRead, RawWrite) {
    let (rhalf, whalf) = tokio::io::split(stream);
    (raw_codec().new_read(rhalf), raw_codec().new_write(whalf))
}

async fn raw_send<W: AsyncWrite + Unpin>(
    w: &mut FramedWrite<W, LengthDelimitedCodec>,
    msg: &Msg,
) {
    let mut buf = bytes::BytesMut::new().writer();
    serialize::write_msg(&mut buf, msg).unwrap();
    w.send(buf.into_inner().freeze()).await.unwrap();
}

async fn raw_recv<R: AsyncRead + Unpin>(r: &mut FramedRead<R, LengthDelimitedCodec>) -> Msg {
    let bytes = r.next().await.unwrap().unwrap();
    serialize::read_msg(&mut bytes.reader()).unwrap()
}

async fn raw_session(stream: DuplexStream) -> (RawRead, RawWrite) {
    let (mut rx, mut tx) = raw_pair(stream);
    raw_send(
        &mut tx,
        &Msg {
            tag: NOTAG,
            body: FCall::TVersion {
                msize: DEFAULT_MSIZE,
                version: P92000.to_owned(),
            },
        },
    )
    .await;
    let reply = raw_recv(&mut rx).await;
    assert_eq!(
        reply,
        Msg {
            tag: NOTAG,
            body: FCall::RVersion {
                msize: DEFAULT_MSIZE,
                version: P92000.to_owned(),
            },
        }
    );

    raw_send(
        &mut tx,
        &Msg {
            tag: 1,
            body: FCall::TAttach {
                fid: 0,
                afid: NOFID,
                uname: "kris".to_owned(),
                aname: String::new(),
            },
        },
    )
    .await;
    let reply = raw_recv(&mut rx).await;
    match reply.body {
        FCall::RAttach { qid } => {
            assert_eq!(reply.tag, 1);
            assert!(qid.typ.contains(QIdType::DIR));
            assert_eq!(qid.path, QID_ROOT);
        }
        other => panic!("expected Rattach, got {:?}", other),
    }
    (rx, tx)
}

#[tokio::test]
async fn version_handshake() {
    let client = mounted(TestFs::default()).await;
    assert_eq!(client.msize(), DEFAULT_MSIZE);
    assert!(client.root_qid().typ.contains(QIdType::DIR));
    client.unmount().await.unwrap();
}

#[tokio::test]
async fn version_must_come_first() {
    let (stream, _) = spawn_server(TestFs::default());
    let (mut rx, mut tx) = raw_pair(stream);

    raw_send(
        &mut tx,
        &Msg {
            tag: 1,
            body: FCall::TStat { fid: 0 },
        },
    )
    .await;
    let reply = raw_recv(&mut rx).await;
    assert_eq!(
        reply.body,
        FCall::RError {
            ename: errstr::EBOTCH.to_owned(),
        }
    );
}

#[tokio::test]
async fn unknown_version_rejected() {
    let (stream, _) = spawn_server(TestFs::default());
    let (mut rx, mut tx) = raw_pair(stream);

    raw_send(
        &mut tx,
        &Msg {
            tag: NOTAG,
            body: FCall::TVersion {
                msize: DEFAULT_MSIZE,
                version: "styx".to_owned(),
            },
        },
    )
    .await;
    match raw_recv(&mut rx).await.body {
        FCall::RVersion { version, .. } => assert_eq!(version, VERSION_UNKNOWN),
        other => panic!("expected Rversion, got {:?}", other),
    }

    // The session never became live, so requests are still a botch.
    raw_send(
        &mut tx,
        &Msg {
            tag: 1,
            body: FCall::TStat { fid: 0 },
        },
    )
    .await;
    assert_eq!(
        raw_recv(&mut rx).await.body,
        FCall::RError {
            ename: errstr::EBOTCH.to_owned(),
        }
    );
}

#[tokio::test]
async fn attach_and_walk() {
    let (stream, _) = spawn_server(TestFs::default());
    let (mut rx, mut tx) = raw_session(stream).await;

    raw_send(
        &mut tx,
        &Msg {
            tag: 2,
            body: FCall::TWalk {
                fid: 0,
                newfid: 1,
                wnames: vec!["a".to_owned(), "b".to_owned()],
            },
        },
    )
    .await;
    match raw_recv(&mut rx).await.body {
        FCall::RWalk { wqids } => {
            assert_eq!(wqids.len(), 2);
            assert_eq!(wqids[0].path, QID_A);
            assert_eq!(wqids[1].path, QID_B);
        }
        other => panic!("expected Rwalk, got {:?}", other),
    }
}

#[tokio::test]
async fn partial_walk_leaves_newfid_unbound() {
    let (stream, _) = spawn_server(TestFs::default());
    let (mut rx, mut tx) = raw_session(stream).await;

    raw_send(
        &mut tx,
        &Msg {
            tag: 2,
            body: FCall::TWalk {
                fid: 0,
                newfid: 1,
                wnames: vec!["a".to_owned(), "missing".to_owned()],
            },
        },
    )
    .await;
    match raw_recv(&mut rx).await.body {
        FCall::RWalk { wqids } => {
            assert_eq!(wqids.len(), 1);
            assert_eq!(wqids[0].path, QID_A);
        }
        other => panic!("expected Rwalk, got {:?}", other),
    }

    // fid 1 must not have been bound by the partial walk.
    raw_send(
        &mut tx,
        &Msg {
            tag: 3,
            body: FCall::TOpen {
                fid: 1,
                mode: om::READ,
            },
        },
    )
    .await;
    assert_eq!(
        raw_recv(&mut rx).await.body,
        FCall::RError {
            ename: errstr::ENOFID.to_owned(),
        }
    );

    // ...and is free for a full walk afterwards.
    raw_send(
        &mut tx,
        &Msg {
            tag: 4,
            body: FCall::TWalk {
                fid: 0,
                newfid: 1,
                wnames: vec!["a".to_owned()],
            },
        },
    )
    .await;
    match raw_recv(&mut rx).await.body {
        FCall::RWalk { wqids } => assert_eq!(wqids.len(), 1),
        other => panic!("expected Rwalk, got {:?}", other),
    }
}

#[tokio::test]
async fn walk_and_stat_via_facade() {
    let client = mounted(TestFs::default()).await;

    let stat = client.stat("a/b").await.unwrap();
    assert_eq!(stat.qid.path, QID_B);
    assert_eq!(stat.length, 10000);
    assert_eq!(stat.name, "b");

    let err = client.open("a/missing", om::READ).await.unwrap_err();
    assert_eq!(err.to_string(), errstr::ENOFILE);

    // The mount is still usable after the failed walk.
    let listing = client.read_dir("").await.unwrap();
    let names: Vec<&str> = listing.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["a", "hello", "event"]);

    client.unmount().await.unwrap();
}

#[tokio::test]
async fn read_chunks_by_iounit() {
    let fs = TestFs::default();
    let reads = fs.reads.clone();
    let client = mounted(fs).await;

    let mut f = client.open("a/b", om::READ).await.unwrap();
    assert_eq!(f.iounit(), 4096);
    assert_eq!(f.mode(), Some(om::READ));

    let length = client.stat("a/b").await.unwrap().length as usize;
    let mut buf = vec![0u8; length];
    let n = client.read(&mut f, &mut buf).await.unwrap();
    assert_eq!(n, 10000);
    assert_eq!(buf, b_content());

    assert_eq!(
        *reads.lock().unwrap(),
        vec![(0, 4096), (4096, 4096), (8192, 1808)]
    );

    client.clunk(f).await.unwrap();
    client.unmount().await.unwrap();
}

#[tokio::test]
async fn concurrent_callers_route_by_tag() {
    let client = Arc::new(mounted(TestFs::default()).await);

    // "hello" replies are delayed server-side, so its reply overtakes
    // nothing and is overtaken by "a/b"; both must still land correctly.
    let slow = {
        let client = client.clone();
        tokio::spawn(async move { client.stat("hello").await })
    };
    let fast = {
        let client = client.clone();
        tokio::spawn(async move { client.stat("a/b").await })
    };

    let slow = slow.await.unwrap().unwrap();
    let fast = fast.await.unwrap().unwrap();
    assert_eq!(slow.qid.path, QID_HELLO);
    assert_eq!(slow.length, HELLO.len() as u64);
    assert_eq!(fast.qid.path, QID_B);
    assert_eq!(fast.length, 10000);
}

#[tokio::test]
async fn flush_answers_pending_read() {
    let (stream, _) = spawn_server(TestFs::default());
    let (mut rx, mut tx) = raw_session(stream).await;

    raw_send(
        &mut tx,
        &Msg {
            tag: 2,
            body: FCall::TWalk {
                fid: 0,
                newfid: 1,
                wnames: vec!["event".to_owned()],
            },
        },
    )
    .await;
    raw_recv(&mut rx).await;
    raw_send(
        &mut tx,
        &Msg {
            tag: 3,
            body: FCall::TOpen {
                fid: 1,
                mode: om::READ,
            },
        },
    )
    .await;
    raw_recv(&mut rx).await;

    // Park a read on the empty event file, then flush it.
    raw_send(
        &mut tx,
        &Msg {
            tag: 42,
            body: FCall::TRead {
                fid: 1,
                offset: 0,
                count: 128,
            },
        },
    )
    .await;
    raw_send(
        &mut tx,
        &Msg {
            tag: 43,
            body: FCall::TFlush { oldtag: 42 },
        },
    )
    .await;

    // The flushed read is dropped silently; the next frame must be the
    // Rflush itself.
    let reply = raw_recv(&mut rx).await;
    assert_eq!(
        reply,
        Msg {
            tag: 43,
            body: FCall::RFlush,
        }
    );

    // The server stays healthy for further requests.
    raw_send(
        &mut tx,
        &Msg {
            tag: 44,
            body: FCall::TStat { fid: 0 },
        },
    )
    .await;
    match raw_recv(&mut rx).await.body {
        FCall::RStat { stat } => assert_eq!(stat.qid.path, QID_ROOT),
        other => panic!("expected Rstat, got {:?}", other),
    }
}

#[tokio::test]
async fn flush_of_completed_request_still_answered() {
    let (stream, _) = spawn_server(TestFs::default());
    let (mut rx, mut tx) = raw_session(stream).await;

    raw_send(
        &mut tx,
        &Msg {
            tag: 2,
            body: FCall::TStat { fid: 0 },
        },
    )
    .await;
    raw_recv(&mut rx).await;

    // Tag 2 already responded; the flush must answer promptly anyway.
    raw_send(
        &mut tx,
        &Msg {
            tag: 3,
            body: FCall::TFlush { oldtag: 2 },
        },
    )
    .await;
    assert_eq!(
        raw_recv(&mut rx).await,
        Msg {
            tag: 3,
            body: FCall::RFlush,
        }
    );
}

#[tokio::test]
async fn duplicate_tag_rejected() {
    let (stream, _) = spawn_server(TestFs::default());
    let (mut rx, mut tx) = raw_session(stream).await;

    raw_send(
        &mut tx,
        &Msg {
            tag: 2,
            body: FCall::TWalk {
                fid: 0,
                newfid: 1,
                wnames: vec!["event".to_owned()],
            },
        },
    )
    .await;
    raw_recv(&mut rx).await;
    raw_send(
        &mut tx,
        &Msg {
            tag: 3,
            body: FCall::TOpen {
                fid: 1,
                mode: om::READ,
            },
        },
    )
    .await;
    raw_recv(&mut rx).await;

    // Park a read on tag 7, then reuse tag 7 while it is outstanding.
    raw_send(
        &mut tx,
        &Msg {
            tag: 7,
            body: FCall::TRead {
                fid: 1,
                offset: 0,
                count: 128,
            },
        },
    )
    .await;
    raw_send(
        &mut tx,
        &Msg {
            tag: 7,
            body: FCall::TStat { fid: 0 },
        },
    )
    .await;
    assert_eq!(
        raw_recv(&mut rx).await,
        Msg {
            tag: 7,
            body: FCall::RError {
                ename: errstr::EDUPTAG.to_owned(),
            },
        }
    );
}

#[tokio::test]
async fn clunked_fid_is_gone() {
    let (stream, _) = spawn_server(TestFs::default());
    let (mut rx, mut tx) = raw_session(stream).await;

    raw_send(
        &mut tx,
        &Msg {
            tag: 2,
            body: FCall::TWalk {
                fid: 0,
                newfid: 1,
                wnames: vec!["hello".to_owned()],
            },
        },
    )
    .await;
    raw_recv(&mut rx).await;

    raw_send(
        &mut tx,
        &Msg {
            tag: 3,
            body: FCall::TClunk { fid: 1 },
        },
    )
    .await;
    assert_eq!(
        raw_recv(&mut rx).await,
        Msg {
            tag: 3,
            body: FCall::RClunk,
        }
    );

    raw_send(
        &mut tx,
        &Msg {
            tag: 4,
            body: FCall::TStat { fid: 1 },
        },
    )
    .await;
    assert_eq!(
        raw_recv(&mut rx).await.body,
        FCall::RError {
            ename: errstr::ENOFID.to_owned(),
        }
    );
}

#[tokio::test]
async fn event_write_fans_out_to_parked_reads() {
    let client = Arc::new(mounted(TestFs::default()).await);

    let reader_a = client.open("event", om::READ).await.unwrap();
    let reader_b = client.open("event", om::READ).await.unwrap();

    let park_a = {
        let client = client.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 128];
            let n = client.pread(&reader_a, &mut buf, 0).await?;
            buf.truncate(n);
            Ok::<_, ninep::Error>(buf)
        })
    };
    let park_b = {
        let client = client.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 128];
            let n = client.pread(&reader_b, &mut buf, 0).await?;
            buf.truncate(n);
            Ok::<_, ninep::Error>(buf)
        })
    };
    // Let both reads park server-side before publishing.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let mut writer = client.open("event", om::WRITE).await.unwrap();
    let n = client.write(&mut writer, b"ping").await.unwrap();
    assert_eq!(n, 4);

    assert_eq!(park_a.await.unwrap().unwrap(), b"ping");
    assert_eq!(park_b.await.unwrap().unwrap(), b"ping");
}

#[tokio::test]
async fn clunk_invokes_freefid_once() {
    let fs = TestFs::default();
    let freed = fs.freed.clone();
    let client = mounted(fs).await;

    let f = client.open("hello", om::READ).await.unwrap();
    client.clunk(f).await.unwrap();

    // freefid runs just after the Rclunk is written.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(freed.lock().unwrap().len(), 1);

    // Teardown releases the remaining fids, the attach root included.
    drop(client);
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(freed.lock().unwrap().len() >= 2);
}

#[tokio::test]
async fn wstat_roundtrip() {
    let client = mounted(TestFs::default()).await;
    client.wstat("hello", &Stat::null()).await.unwrap();
    client.unmount().await.unwrap();
}

#[tokio::test]
async fn remove_surfaces_server_error() {
    let client = mounted(TestFs::default()).await;
    let err = client.remove("hello").await.unwrap_err();
    assert_eq!(err.to_string(), "permission denied");
    client.unmount().await.unwrap();
}

#[tokio::test]
async fn teardown_completes_outstanding_calls() {
    let (stream, server) = spawn_server(TestFs::default());
    let client = Arc::new(Client::mount_stream(stream, "").await.unwrap());

    let f = client.open("event", om::READ).await.unwrap();
    let parked = {
        let client = client.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 128];
            client.pread(&f, &mut buf, 0).await
        })
    };
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    // Kill the server; the parked call must fail rather than hang.
    server.abort();
    let err = parked.await.unwrap().unwrap_err();
    assert!(matches!(err, ninep::Error::Io(_)));

    // And the client refuses further traffic.
    assert!(client.stat("hello").await.is_err());
}
