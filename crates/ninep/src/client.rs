//! Client side 9P library.
//!
//! A [`Client`] owns one connection to a 9P server and multiplexes any
//! number of concurrent callers over it. Each outgoing request is stamped
//! with a tag from a per-connection pool and parked on a reply channel;
//! a dedicated reader task pulls frames off the transport and routes each
//! reply to the waiter whose tag it carries. When the transport dies, every
//! outstanding call completes with an error and the client refuses further
//! traffic.
//!
//! # Protocol
//! 9P2000

use {
    crate::{
        error::{Error, string as errstr},
        fcall::*,
        io_err, res, serialize,
        utils::{self, Result, Transport},
    },
    bytes::buf::{Buf, BufMut},
    futures::sink::SinkExt,
    log::{debug, warn},
    std::collections::HashMap,
    std::sync::{Arc, Mutex},
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{TcpStream, UnixStream},
        sync::oneshot,
        task::JoinHandle,
    },
    tokio_stream::StreamExt,
    tokio_util::codec::{FramedRead, FramedWrite, length_delimited::LengthDelimitedCodec},
};

use crate::utils::frame_codec;

type Reader = FramedRead<Box<dyn AsyncRead + Send + Unpin>, LengthDelimitedCodec>;
type Writer = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, LengthDelimitedCodec>;

/// Allocator handing out u16 tags, reusing released ones first.
struct TagPool {
    next: u16,
    free: Vec<u16>,
}

impl TagPool {
    fn new() -> TagPool {
        TagPool {
            next: 1,
            free: Vec::new(),
        }
    }

    fn get(&mut self) -> Result<u16> {
        if let Some(tag) = self.free.pop() {
            return Ok(tag);
        }
        if self.next == NOTAG {
            return Err(Error::Protocol("tag space exhausted".to_owned()));
        }
        let tag = self.next;
        self.next += 1;
        Ok(tag)
    }

    fn put(&mut self, tag: u16) {
        self.free.push(tag);
    }
}

/// Same discipline for u32 fid numbers.
struct FidPool {
    next: u32,
    free: Vec<u32>,
}

impl FidPool {
    fn new() -> FidPool {
        FidPool {
            next: 0,
            free: Vec::new(),
        }
    }

    fn get(&mut self) -> Result<u32> {
        if let Some(fid) = self.free.pop() {
            return Ok(fid);
        }
        if self.next == NOFID {
            return Err(Error::Protocol("fid space exhausted".to_owned()));
        }
        let fid = self.next;
        self.next += 1;
        Ok(fid)
    }

    fn put(&mut self, fid: u32) {
        self.free.push(fid);
    }
}

/// Shared state the reader task routes replies into.
struct Mux {
    wait: HashMap<u16, oneshot::Sender<FCall>>,
    tags: TagPool,
    dead: bool,
}

struct ClientInner {
    msize: u32,
    writer: tokio::sync::Mutex<Writer>,
    mux: Mutex<Mux>,
    fids: Mutex<FidPool>,
}

/// Handle to an open or walked file on the remote server.
///
/// A `CFid` is exclusively owned by whoever holds it; release it with
/// [`Client::clunk`]. Sequential [`Client::read`]/[`Client::write`] calls
/// advance its offset.
#[derive(Debug)]
pub struct CFid {
    fid: u32,
    qid: QId,
    mode: Option<u8>,
    iounit: u32,
    offset: u64,
}

impl CFid {
    /// The server's qid for this file.
    pub fn qid(&self) -> QId {
        self.qid
    }

    /// Open mode, if the fid has been opened.
    pub fn mode(&self) -> Option<u8> {
        self.mode
    }

    /// Per-fid I/O unit advertised by the server (0 if unspecified).
    pub fn iounit(&self) -> u32 {
        self.iounit
    }

    /// Current sequential read/write position.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Move the sequential read/write position.
    pub fn seek(&mut self, offset: u64) {
        self.offset = offset;
    }

    fn chunk(&self, msize: u32) -> usize {
        let max = msize - IOHDRSZ;
        if self.iounit != 0 && self.iounit < max {
            self.iounit as usize
        } else {
            max as usize
        }
    }
}

/// A mounted 9P connection.
pub struct Client {
    inner: Arc<ClientInner>,
    reader: JoinHandle<()>,
    rootfid: u32,
    rootqid: QId,
}

impl Client {
    /// Dial `address` (`tcp!host!port` or `unix!path`), negotiate the
    /// protocol version, and attach to the tree named `aname`.
    pub async fn mount(address: &str, aname: &str) -> Result<Client> {
        let (proto, addr) = utils::parse_proto(address)
            .ok_or_else(|| io_err!(InvalidInput, "Invalid protocol or address"))?;

        match proto {
            "tcp" => Self::mount_stream(TcpStream::connect(&addr).await?, aname).await,
            "unix" => Self::mount_stream(UnixStream::connect(&addr).await?, aname).await,
            _ => res!(io_err!(InvalidInput, "Protocol not supported")),
        }
    }

    /// Mount the socket named `name` in the canonical namespace directory
    /// (`$NAMESPACE`, or `/tmp/ns.$USER.$DISPLAY`).
    pub async fn nsmount(name: &str, aname: &str) -> Result<Client> {
        let path = utils::namespace()?.join(name);
        Self::mount_stream(UnixStream::connect(&path).await?, aname).await
    }

    /// Run the mount handshake over an already-connected stream.
    pub async fn mount_stream<S>(stream: S, aname: &str) -> Result<Client>
    where
        S: Transport + 'static,
    {
        let (rhalf, whalf) = tokio::io::split(stream);
        let rhalf: Box<dyn AsyncRead + Send + Unpin> = Box::new(rhalf);
        let whalf: Box<dyn AsyncWrite + Send + Unpin> = Box::new(whalf);

        let mut framedread = frame_codec(DEFAULT_MSIZE).new_read(rhalf);
        let mut framedwrite = frame_codec(DEFAULT_MSIZE).new_write(whalf);

        // Version negotiation happens before the reader task exists, with
        // the conversation still strictly one-at-a-time.
        let tversion = Msg {
            tag: NOTAG,
            body: FCall::TVersion {
                msize: DEFAULT_MSIZE,
                version: P92000.to_owned(),
            },
        };
        send_frame(&mut framedwrite, &tversion).await?;

        let reply = match framedread.next().await {
            Some(bytes) => serialize::read_msg(&mut bytes?.reader())?,
            None => return res!(io_err!(UnexpectedEof, "connection closed during mount")),
        };

        let msize = match reply.body {
            FCall::RVersion { msize, ref version } if reply.tag == NOTAG => {
                if version != P92000 {
                    return Err(Error::Protocol(format!("bad 9P version: {}", version)));
                }
                if msize < IOHDRSZ || msize > DEFAULT_MSIZE {
                    return Err(Error::Protocol(format!("bad msize: {}", msize)));
                }
                msize
            }
            _ => return Err(Error::Protocol("bad version reply".to_owned())),
        };
        framedread.decoder_mut().set_max_frame_length(msize as usize);
        debug!("mounted, msize {}", msize);

        let inner = Arc::new(ClientInner {
            msize,
            writer: tokio::sync::Mutex::new(framedwrite),
            mux: Mutex::new(Mux {
                wait: HashMap::new(),
                tags: TagPool::new(),
                dead: false,
            }),
            fids: Mutex::new(FidPool::new()),
        });

        let reader = tokio::spawn(demux(framedread, inner.clone()));

        let mut client = Client {
            inner,
            reader,
            rootfid: 0,
            rootqid: QId::default(),
        };

        let rootfid = client.inner.fids.lock().unwrap().get()?;
        match client
            .rpc(FCall::TAttach {
                fid: rootfid,
                afid: NOFID,
                uname: utils::current_user(),
                aname: aname.to_owned(),
            })
            .await?
        {
            FCall::RAttach { qid } => {
                client.rootfid = rootfid;
                client.rootqid = qid;
                Ok(client)
            }
            _ => Err(Error::Protocol("bad attach reply".to_owned())),
        }
    }

    /// The message size negotiated at mount.
    pub fn msize(&self) -> u32 {
        self.inner.msize
    }

    /// Qid of the attached root.
    pub fn root_qid(&self) -> QId {
        self.rootqid
    }

    /// Issue one request and wait for its reply; an `Rerror` reply becomes
    /// `Error::Remote`.
    async fn rpc(&self, body: FCall) -> Result<FCall> {
        let (tag, rx) = {
            let mut mux = self.inner.mux.lock().unwrap();
            if mux.dead {
                return Err(Error::disconnected());
            }
            let tag = mux.tags.get()?;
            let (tx, rx) = oneshot::channel();
            mux.wait.insert(tag, tx);
            (tag, rx)
        };

        let msg = Msg { tag, body };
        let sent = {
            let mut writer = self.inner.writer.lock().await;
            send_frame(&mut writer, &msg).await
        };
        if let Err(e) = sent {
            let mut mux = self.inner.mux.lock().unwrap();
            mux.wait.remove(&tag);
            mux.tags.put(tag);
            return Err(e);
        }

        let reply = rx.await;
        self.inner.mux.lock().unwrap().tags.put(tag);
        match reply {
            Ok(FCall::RError { ename }) => Err(Error::Remote(ename)),
            Ok(body) => Ok(body),
            Err(_) => Err(Error::disconnected()),
        }
    }

    /// Walk from the root to `path`, returning an unopened fid.
    pub async fn walk(&self, path: &str) -> Result<CFid> {
        let names: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let newfid = self.inner.fids.lock().unwrap().get()?;

        let mut qid = self.rootqid;
        let mut bound = false;
        let chunks: Vec<&[&str]> = if names.is_empty() {
            vec![&[]]
        } else {
            names.chunks(MAXWELEM).collect()
        };

        for chunk in chunks {
            let fid = if bound { newfid } else { self.rootfid };
            let wnames = chunk.iter().map(|s| (*s).to_owned()).collect();

            match self
                .rpc(FCall::TWalk {
                    fid,
                    newfid,
                    wnames,
                })
                .await
            {
                Ok(FCall::RWalk { wqids }) => {
                    if wqids.len() < chunk.len() {
                        // Walk stopped early; newfid was never bound by a
                        // partial Rwalk, but a previous full chunk may
                        // have bound it.
                        self.unwind_walk(newfid, bound).await;
                        return Err(Error::Remote(errstr::ENOFILE.to_owned()));
                    }
                    qid = wqids.last().copied().unwrap_or(qid);
                    bound = true;
                }
                Ok(_) => {
                    self.unwind_walk(newfid, bound).await;
                    return Err(Error::Protocol("bad walk reply".to_owned()));
                }
                Err(e) => {
                    self.unwind_walk(newfid, bound).await;
                    return Err(e);
                }
            }
        }

        Ok(CFid {
            fid: newfid,
            qid,
            mode: None,
            iounit: 0,
            offset: 0,
        })
    }

    async fn unwind_walk(&self, newfid: u32, bound: bool) {
        if bound {
            // Best effort; on error the fid number stays leaked.
            let _ = self.clunk_fid(newfid).await;
        } else {
            self.inner.fids.lock().unwrap().put(newfid);
        }
    }

    /// Walk to `path` and open it with `mode`.
    pub async fn open(&self, path: &str, mode: u8) -> Result<CFid> {
        let mut f = self.walk(path).await?;

        match self.rpc(FCall::TOpen { fid: f.fid, mode }).await {
            Ok(FCall::ROpen { qid, iounit }) => {
                f.qid = qid;
                f.iounit = iounit;
                f.mode = Some(mode);
                Ok(f)
            }
            Ok(_) => {
                let _ = self.clunk_fid(f.fid).await;
                Err(Error::Protocol("bad open reply".to_owned()))
            }
            Err(e) => {
                let _ = self.clunk_fid(f.fid).await;
                Err(e)
            }
        }
    }

    /// Create (and open) `path` with permissions `perm` and open mode `mode`.
    pub async fn create(&self, path: &str, perm: u32, mode: u8) -> Result<CFid> {
        let (dir, name) = path.rsplit_once('/').unwrap_or(("", path));
        if name.is_empty() {
            return res!(io_err!(InvalidInput, "empty file name"));
        }
        let mut f = self.walk(dir).await?;

        match self
            .rpc(FCall::TCreate {
                fid: f.fid,
                name: name.to_owned(),
                perm,
                mode,
            })
            .await
        {
            Ok(FCall::RCreate { qid, iounit }) => {
                f.qid = qid;
                f.iounit = iounit;
                f.mode = Some(mode);
                Ok(f)
            }
            Ok(_) => {
                let _ = self.clunk_fid(f.fid).await;
                Err(Error::Protocol("bad create reply".to_owned()))
            }
            Err(e) => {
                let _ = self.clunk_fid(f.fid).await;
                Err(e)
            }
        }
    }

    /// Read at `offset` without touching the fid's sequential position.
    /// Issues a single request of at most one I/O unit.
    pub async fn pread(&self, f: &CFid, buf: &mut [u8], offset: u64) -> Result<usize> {
        let count = buf.len().min(f.chunk(self.inner.msize)) as u32;
        match self
            .rpc(FCall::TRead {
                fid: f.fid,
                offset,
                count,
            })
            .await?
        {
            FCall::RRead { data } => {
                if data.0.len() > count as usize {
                    return Err(Error::Protocol("oversized read reply".to_owned()));
                }
                buf[..data.0.len()].copy_from_slice(&data.0);
                Ok(data.0.len())
            }
            _ => Err(Error::Protocol("bad read reply".to_owned())),
        }
    }

    /// Write at `offset` without touching the fid's sequential position.
    /// Issues a single request of at most one I/O unit.
    pub async fn pwrite(&self, f: &CFid, buf: &[u8], offset: u64) -> Result<usize> {
        let count = buf.len().min(f.chunk(self.inner.msize));
        match self
            .rpc(FCall::TWrite {
                fid: f.fid,
                offset,
                data: Data(buf[..count].to_vec()),
            })
            .await?
        {
            FCall::RWrite { count } => Ok(count as usize),
            _ => Err(Error::Protocol("bad write reply".to_owned())),
        }
    }

    /// Read sequentially into `buf`, chunking by the I/O unit and advancing
    /// the fid's offset. Returns the number of bytes read; short counts
    /// mean end of file.
    pub async fn read(&self, f: &mut CFid, buf: &mut [u8]) -> Result<usize> {
        let mut pos = 0;
        while pos < buf.len() {
            let n = self.pread(f, &mut buf[pos..], f.offset).await?;
            if n == 0 {
                break;
            }
            f.offset += n as u64;
            pos += n;
        }
        Ok(pos)
    }

    /// Write all of `buf` sequentially, chunking by the I/O unit and
    /// advancing the fid's offset.
    pub async fn write(&self, f: &mut CFid, buf: &[u8]) -> Result<usize> {
        let mut pos = 0;
        while pos < buf.len() {
            let n = self.pwrite(f, &buf[pos..], f.offset).await?;
            if n == 0 {
                break;
            }
            f.offset += n as u64;
            pos += n;
        }
        Ok(pos)
    }

    /// Stat the file at `path`.
    pub async fn stat(&self, path: &str) -> Result<Stat> {
        let f = self.walk(path).await?;
        let res = match self.rpc(FCall::TStat { fid: f.fid }).await {
            Ok(FCall::RStat { stat }) => Ok(stat),
            Ok(_) => Err(Error::Protocol("bad stat reply".to_owned())),
            Err(e) => Err(e),
        };
        let _ = self.clunk_fid(f.fid).await;
        res
    }

    /// Update the metadata of the file at `path`. Fields carrying the
    /// "don't touch" values of [`Stat::null`] are left alone by the server.
    pub async fn wstat(&self, path: &str, stat: &Stat) -> Result<()> {
        let f = self.walk(path).await?;
        let res = match self
            .rpc(FCall::TWStat {
                fid: f.fid,
                stat: stat.clone(),
            })
            .await
        {
            Ok(FCall::RWStat) => Ok(()),
            Ok(_) => Err(Error::Protocol("bad wstat reply".to_owned())),
            Err(e) => Err(e),
        };
        let _ = self.clunk_fid(f.fid).await;
        res
    }

    /// Remove the file at `path`. The fid is consumed by the server whether
    /// or not the remove succeeds.
    pub async fn remove(&self, path: &str) -> Result<()> {
        let f = self.walk(path).await?;
        match self.rpc(FCall::TRemove { fid: f.fid }).await {
            Ok(FCall::RRemove) => {
                self.inner.fids.lock().unwrap().put(f.fid);
                Ok(())
            }
            Ok(_) => Err(Error::Protocol("bad remove reply".to_owned())),
            Err(e @ Error::Remote(_)) => {
                self.inner.fids.lock().unwrap().put(f.fid);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Read the directory at `path` as a list of stats.
    pub async fn read_dir(&self, path: &str) -> Result<Vec<Stat>> {
        let mut f = self.open(path, om::READ).await?;
        if !f.qid.typ.contains(QIdType::DIR) {
            let _ = self.clunk(f).await;
            return Err(Error::Remote("not a directory".to_owned()));
        }

        let mut packed = Vec::new();
        let mut chunk = vec![0u8; f.chunk(self.inner.msize)];
        loop {
            let n = self.pread(&f, &mut chunk, f.offset).await?;
            if n == 0 {
                break;
            }
            f.offset += n as u64;
            packed.extend_from_slice(&chunk[..n]);
        }
        let clunked = self.clunk(f).await;

        let mut stats = Vec::new();
        let mut cursor = std::io::Cursor::new(&packed[..]);
        while (cursor.position() as usize) < packed.len() {
            let stat: Stat = serialize::Decodable::decode(&mut cursor)
                .map_err(|_| Error::Protocol("malformed directory read".to_owned()))?;
            stats.push(stat);
        }
        clunked?;
        Ok(stats)
    }

    /// Release a fid. The fid number is reused only after the server
    /// acknowledges the clunk; on error it is leaked, since the server may
    /// still consider it live.
    pub async fn clunk(&self, f: CFid) -> Result<()> {
        self.clunk_fid(f.fid).await
    }

    async fn clunk_fid(&self, fid: u32) -> Result<()> {
        match self.rpc(FCall::TClunk { fid }).await {
            Ok(FCall::RClunk) => {
                self.inner.fids.lock().unwrap().put(fid);
                Ok(())
            }
            Ok(_) => Err(Error::Protocol("bad clunk reply".to_owned())),
            Err(e) => Err(e),
        }
    }

    /// Drop the connection, releasing the root fid first.
    pub async fn unmount(self) -> Result<()> {
        let res = self.clunk_fid(self.rootfid).await;
        self.reader.abort();
        res
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn send_frame(writer: &mut Writer, msg: &Msg) -> Result<()> {
    let mut buf = bytes::BytesMut::with_capacity(256).writer();
    serialize::write_msg(&mut buf, msg)?;
    writer.send(buf.into_inner().freeze()).await?;
    Ok(())
}

/// The reader task: routes each incoming reply to the waiter holding its
/// tag, and on transport failure completes every outstanding call with an
/// error by dropping their reply slots.
async fn demux(mut framedread: Reader, inner: Arc<ClientInner>) {
    loop {
        let msg = match framedread.next().await {
            Some(Ok(bytes)) => match serialize::read_msg(&mut bytes.reader()) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("malformed reply: {}", e);
                    break;
                }
            },
            Some(Err(e)) => {
                warn!("read failed: {}", e);
                break;
            }
            None => break,
        };

        let waiter = inner.mux.lock().unwrap().wait.remove(&msg.tag);
        match waiter {
            Some(tx) => {
                let _ = tx.send(msg.body);
            }
            None => warn!("reply for unknown tag {}", msg.tag),
        }
    }

    let mut mux = inner.mux.lock().unwrap();
    mux.dead = true;
    // Dropping the senders wakes every waiter with a recv error, which the
    // rpc path reports as a torn-down connection.
    mux.wait.clear();
}
