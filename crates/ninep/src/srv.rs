//! Asynchronous server side 9P library.
//!
//! # Protocol
//! 9P2000

use {
    crate::{
        error::{Error, string as errstr},
        fcall::*,
        io_err, serialize,
        utils::{self, Result, Transport, frame_codec},
    },
    async_trait::async_trait,
    bytes::buf::{Buf, BufMut},
    futures::{
        future::{AbortHandle, Abortable, Aborted},
        sink::SinkExt,
    },
    log::{error, info},
    std::{
        collections::HashMap,
        os::unix::fs::PermissionsExt,
        path::{Path, PathBuf},
        sync::{Arc, Mutex, atomic::Ordering},
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{TcpListener, UnixListener},
        sync::RwLock,
    },
    tokio_stream::StreamExt,
};

/// Represents a fid of clients holding associated `Filesystem::FId`.
#[derive(Debug, Default)]
pub struct FId<T> {
    /// Raw client side fid.
    fid: u32,

    /// `Filesystem::FId` associated with this fid.
    pub aux: T,
}

impl<T> FId<T> {
    /// Get the raw fid.
    pub fn fid(&self) -> u32 {
        self.fid
    }
}

/// Filesystem server trait for implementing 9P2000 servers.
///
/// The dispatch loop decodes each T-message, resolves the fids it names,
/// and forwards it to the method of the same name. Returning `Ok` sends
/// the reply; returning `Err` sends an `Rerror` carrying the error's text.
/// Either way every request is answered exactly once.
///
/// Most methods default to an error reply, so a filesystem only implements
/// what it supports. A read-only synthetic filesystem typically needs
/// [`rattach`](Self::rattach), [`rwalk`](Self::rwalk),
/// [`ropen`](Self::ropen), [`rread`](Self::rread) and
/// [`rstat`](Self::rstat).
///
/// # FId management
///
/// Each fid carries user state through the associated `FId` type, created
/// by `rattach`/`rwalk` and released when the fid dies. The dispatch loop
/// owns the fid table; [`freefid`](Self::freefid) is called exactly once
/// per dead fid, whether it died by clunk, remove, or connection teardown.
#[async_trait]
pub trait Filesystem: Send {
    /// User defined fid type to be associated with a client's fid.
    type FId: Send + Sync + Default;

    /// Begin an authentication exchange on `afid`.
    ///
    /// The default refuses, which tells clients to attach with
    /// `afid = NOFID`.
    async fn rauth(&self, _: &FId<Self::FId>, _uname: &str, _aname: &str) -> Result<FCall> {
        Err(Error::Remote(errstr::ENOAUTH.to_owned()))
    }

    /// Bind `fid` to the root of the tree named `aname`.
    ///
    /// Return `FCall::RAttach` with the root qid.
    async fn rattach(
        &self,
        _: &FId<Self::FId>,
        _afid: Option<&FId<Self::FId>>,
        _uname: &str,
        _aname: &str,
    ) -> Result<FCall> {
        Err(Error::Remote(errstr::ENOFUNC.to_owned()))
    }

    /// An in-flight request identified by `old` (its decoded T-message) is
    /// being flushed. The dispatch loop always answers the flush with
    /// `Rflush` and drops the flushed request's reply; this hook exists for
    /// filesystems that park requests and need to forget them.
    async fn rflush(&self, _old: Option<&FCall>) -> Result<FCall> {
        Ok(FCall::RFlush)
    }

    /// Walk from `fid` along `wnames`, associating the destination with
    /// `newfid`.
    ///
    /// Return `FCall::RWalk` with one qid per walked element. Returning
    /// fewer qids than names reports where the walk stopped; the dispatch
    /// loop then leaves `newfid` unbound. Walking zero names must succeed
    /// and clones `fid`.
    async fn rwalk(
        &self,
        _: &FId<Self::FId>,
        _new: &FId<Self::FId>,
        _wnames: &[String],
    ) -> Result<FCall> {
        Err(Error::Remote(errstr::ENOFUNC.to_owned()))
    }

    /// Open `fid` with `mode`. Return `FCall::ROpen`.
    async fn ropen(&self, _: &FId<Self::FId>, _mode: u8) -> Result<FCall> {
        Err(Error::Remote(errstr::ENOFUNC.to_owned()))
    }

    /// Create `name` in the directory `fid` points at, then open it.
    /// On success `fid` represents the new file. Return `FCall::RCreate`.
    async fn rcreate(
        &self,
        _: &FId<Self::FId>,
        _name: &str,
        _perm: u32,
        _mode: u8,
    ) -> Result<FCall> {
        Err(Error::Remote(errstr::ENOFUNC.to_owned()))
    }

    /// Read `count` bytes at `offset`. Return `FCall::RRead`.
    async fn rread(&self, _: &FId<Self::FId>, _offset: u64, _count: u32) -> Result<FCall> {
        Err(Error::Remote(errstr::ENOFUNC.to_owned()))
    }

    /// Write `data` at `offset`. Return `FCall::RWrite`.
    async fn rwrite(&self, _: &FId<Self::FId>, _offset: u64, _data: &Data) -> Result<FCall> {
        Err(Error::Remote(errstr::ENOFUNC.to_owned()))
    }

    /// The client is done with `fid`. The fid itself is released by the
    /// dispatch loop after the reply; use [`freefid`](Self::freefid) for
    /// cleanup tied to the fid's life.
    async fn rclunk(&self, _: &FId<Self::FId>) -> Result<FCall> {
        Ok(FCall::RClunk)
    }

    /// Remove the file `fid` points at. The fid is released whether or not
    /// the remove succeeds. Return `FCall::RRemove`.
    async fn rremove(&self, _: &FId<Self::FId>) -> Result<FCall> {
        Err(Error::Remote(errstr::ENOFUNC.to_owned()))
    }

    /// Return `FCall::RStat` with the file's metadata.
    async fn rstat(&self, _: &FId<Self::FId>) -> Result<FCall> {
        Err(Error::Remote(errstr::ENOFUNC.to_owned()))
    }

    /// Update the file's metadata; fields holding the "don't touch"
    /// values are to be left alone. Return `FCall::RWStat`.
    async fn rwstat(&self, _: &FId<Self::FId>, _stat: &Stat) -> Result<FCall> {
        Err(Error::Remote(errstr::ENOFUNC.to_owned()))
    }

    /// Negotiate protocol version and message size.
    ///
    /// The default accepts anything starting with "9P" as 9P2000 and
    /// caps msize at the library default.
    async fn rversion(&self, msize: u32, ver: &str) -> Result<FCall> {
        Ok(FCall::RVersion {
            msize: msize.min(DEFAULT_MSIZE),
            version: if ver.starts_with("9P") {
                P92000.to_owned()
            } else {
                VERSION_UNKNOWN.to_owned()
            },
        })
    }

    /// Called exactly once when a fid dies: after its Rclunk/Rremove is
    /// written, or at connection teardown.
    async fn freefid(&self, _: &FId<Self::FId>) {}
}

type FIdMap<T> = Arc<RwLock<HashMap<u32, Arc<FId<T>>>>>;
type Inflight = Arc<Mutex<HashMap<u16, (FCall, AbortHandle)>>>;

async fn lookup_fid<T>(fids: &FIdMap<T>, fid: u32) -> Result<Arc<FId<T>>> {
    fids.read()
        .await
        .get(&fid)
        .cloned()
        .ok_or_else(|| Error::Remote(errstr::ENOFID.to_owned()))
}

async fn ensure_unused<T>(fids: &FIdMap<T>, fid: u32) -> Result<()> {
    if fid == NOFID || fids.read().await.contains_key(&fid) {
        Err(Error::Remote(errstr::EDUPFID.to_owned()))
    } else {
        Ok(())
    }
}

#[rustfmt::skip]
async fn dispatch_once<Fs, FsFId>(
    msg: &Msg,
    fs: Arc<Fs>,
    fids: FIdMap<FsFId>,
) -> Result<FCall>
where
    Fs: Filesystem<FId = FsFId> + Send + Sync,
    FsFId: Send + Sync + Default,
{
    use crate::FCall::*;

    let response = match msg.body {
        TAuth { afid, ref uname, ref aname } => {
            ensure_unused(&fids, afid).await?;
            let newfid = Arc::new(FId { fid: afid, aux: Default::default() });
            let r = fs.rauth(&newfid, uname, aname).await?;
            fids.write().await.insert(afid, newfid);
            r
        }
        TAttach { fid, afid, ref uname, ref aname } => {
            ensure_unused(&fids, fid).await?;
            let auth = match afid {
                NOFID => None,
                afid => Some(lookup_fid(&fids, afid).await?),
            };
            let newfid = Arc::new(FId { fid, aux: Default::default() });
            let r = fs.rattach(&newfid, auth.as_deref(), uname, aname).await?;
            fids.write().await.insert(fid, newfid);
            r
        }
        TWalk { fid, newfid, ref wnames } => {
            let from = lookup_fid(&fids, fid).await?;
            if newfid != fid {
                ensure_unused(&fids, newfid).await?;
            }
            let to = Arc::new(FId { fid: newfid, aux: Default::default() });
            let r = fs.rwalk(&from, &to, wnames).await?;
            // A partial walk leaves newfid unbound.
            if let RWalk { ref wqids } = r {
                if wqids.len() == wnames.len() {
                    let old = fids.write().await.insert(newfid, to);
                    if let Some(old) = old {
                        fs.freefid(&old).await;
                    }
                }
            }
            r
        }
        TOpen { fid, mode }                  => fs.ropen(&*lookup_fid(&fids, fid).await?, mode).await?,
        TCreate { fid, ref name, perm, mode } => fs.rcreate(&*lookup_fid(&fids, fid).await?, name, perm, mode).await?,
        TRead { fid, offset, count }         => fs.rread(&*lookup_fid(&fids, fid).await?, offset, count).await?,
        TWrite { fid, offset, ref data }     => fs.rwrite(&*lookup_fid(&fids, fid).await?, offset, data).await?,
        TClunk { fid }                       => fs.rclunk(&*lookup_fid(&fids, fid).await?).await?,
        TRemove { fid }                      => fs.rremove(&*lookup_fid(&fids, fid).await?).await?,
        TStat { fid }                        => fs.rstat(&*lookup_fid(&fids, fid).await?).await?,
        TWStat { fid, ref stat }             => fs.rwstat(&*lookup_fid(&fids, fid).await?, stat).await?,
        _                                    => return Err(Error::Remote(errstr::EBADFCALL.to_owned())),
    };

    Ok(response)
}

type FramedWriter<W> = tokio_util::codec::FramedWrite<W, tokio_util::codec::LengthDelimitedCodec>;

async fn respond<W>(framedwrite: &tokio::sync::Mutex<FramedWriter<W>>, response: &Msg) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = bytes::BytesMut::with_capacity(256).writer();
    serialize::write_msg(&mut buf, response)?;

    let mut writer = framedwrite.lock().await;
    writer.send(buf.into_inner().freeze()).await?;
    info!("\t→ {:?}", response);
    Ok(())
}

async fn dispatch<Fs, Reader, Writer>(filesystem: Fs, reader: Reader, writer: Writer) -> Result<()>
where
    Fs: 'static + Filesystem + Send + Sync,
    Reader: 'static + AsyncRead + Send + std::marker::Unpin,
    Writer: 'static + AsyncWrite + Send + std::marker::Unpin,
{
    let fs = Arc::new(filesystem);
    let fids: FIdMap<Fs::FId> = Arc::new(RwLock::new(HashMap::new()));
    let inflight: Inflight = Arc::new(Mutex::new(HashMap::new()));

    let mut framedread = frame_codec(DEFAULT_MSIZE).new_read(reader);
    let framedwrite = Arc::new(tokio::sync::Mutex::new(
        frame_codec(DEFAULT_MSIZE).new_write(writer),
    ));

    // 0 until a Tversion has been accepted.
    let mut msize: u32 = 0;

    let result = loop {
        let bytes = match framedread.next().await {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => break Err(Error::Io(e)),
            None => break Ok(()),
        };
        let msg = match serialize::read_msg(&mut bytes.reader()) {
            Ok(msg) => msg,
            Err(e) => break Err(Error::Io(e)),
        };
        info!("\t← {:?}", msg);

        match msg.body {
            FCall::TVersion {
                msize: client_msize,
                ref version,
            } => {
                // Version negotiation, initial or renewed, resets the
                // session: outstanding requests die and every fid is
                // released.
                for (_, (_, handle)) in inflight.lock().unwrap().drain() {
                    handle.abort();
                }
                let stale: Vec<_> = fids.write().await.drain().map(|(_, f)| f).collect();
                for f in stale {
                    fs.freefid(&f).await;
                }

                let reply = fs
                    .rversion(client_msize, version)
                    .await
                    .unwrap_or_else(|e| FCall::RError { ename: e.ename() });
                if let FCall::RVersion {
                    msize: accepted,
                    ref version,
                } = reply
                {
                    if version != VERSION_UNKNOWN {
                        msize = accepted;
                        framedread.decoder_mut().set_max_frame_length(msize as usize);
                    }
                }
                if let Err(e) = respond(&framedwrite, &Msg { tag: msg.tag, body: reply }).await {
                    break Err(e);
                }
            }

            FCall::TFlush { oldtag } => {
                let old = inflight.lock().unwrap().remove(&oldtag);
                match old {
                    Some((ref ifcall, ref handle)) => {
                        let _ = fs.rflush(Some(ifcall)).await;
                        handle.abort();
                    }
                    // Already responded (or never seen): Rflush goes out
                    // regardless.
                    None => {
                        let _ = fs.rflush(None).await;
                    }
                }
                let rflush = Msg {
                    tag: msg.tag,
                    body: FCall::RFlush,
                };
                if let Err(e) = respond(&framedwrite, &rflush).await {
                    break Err(e);
                }
            }

            _ if msize == 0 => {
                // The first message on a connection must be Tversion.
                let botch = Msg {
                    tag: msg.tag,
                    body: FCall::RError {
                        ename: errstr::EBOTCH.to_owned(),
                    },
                };
                if let Err(e) = respond(&framedwrite, &botch).await {
                    break Err(e);
                }
            }

            _ => {
                if inflight.lock().unwrap().contains_key(&msg.tag) {
                    let duptag = Msg {
                        tag: msg.tag,
                        body: FCall::RError {
                            ename: errstr::EDUPTAG.to_owned(),
                        },
                    };
                    if let Err(e) = respond(&framedwrite, &duptag).await {
                        break Err(e);
                    }
                    continue;
                }

                let (abort, registration) = AbortHandle::new_pair();
                inflight
                    .lock()
                    .unwrap()
                    .insert(msg.tag, (msg.body.clone(), abort));

                let fs = fs.clone();
                let fids = fids.clone();
                let inflight = inflight.clone();
                let framedwrite = framedwrite.clone();

                tokio::spawn(async move {
                    let work = dispatch_once(&msg, fs.clone(), fids.clone());
                    let response_fcall = match Abortable::new(work, registration).await {
                        Ok(result) => result.unwrap_or_else(|e| {
                            error!("{:?}: \"{}\"", MsgType::from(&msg.body), e);
                            FCall::RError { ename: e.ename() }
                        }),
                        // Flushed; the Rflush already spoke for us.
                        Err(Aborted) => return,
                    };

                    if !MsgType::from(&response_fcall).is_r() {
                        error!("filesystem returned a T-message for tag {}", msg.tag);
                        inflight.lock().unwrap().remove(&msg.tag);
                        return;
                    }

                    // Clunk and remove take the fid out of the table
                    // before the reply becomes visible, so the client
                    // cannot race a new request against the removal.
                    // Remove consumes the fid even on error.
                    let dead = match msg.body {
                        FCall::TClunk { fid } | FCall::TRemove { fid } => {
                            fids.write().await.remove(&fid)
                        }
                        _ => None,
                    };

                    let response = Msg {
                        tag: msg.tag,
                        body: response_fcall,
                    };
                    if let Err(e) = respond(&framedwrite, &response).await {
                        error!("failed to send response for tag {}: {}", msg.tag, e);
                    }

                    // The filesystem sees the fid die only after the
                    // reply is written.
                    if let Some(f) = dead {
                        fs.freefid(&f).await;
                    }

                    inflight.lock().unwrap().remove(&msg.tag);
                });
            }
        }
    };

    // Teardown: cancel what is still running and let the filesystem see
    // every fid die.
    for (_, (_, handle)) in inflight.lock().unwrap().drain() {
        handle.abort();
    }
    let stale: Vec<_> = fids.write().await.drain().map(|(_, f)| f).collect();
    for f in stale {
        fs.freefid(&f).await;
    }

    result
}

/// Serve one established connection until it closes.
pub async fn serve_stream<Fs, S>(filesystem: Fs, stream: S) -> Result<()>
where
    Fs: 'static + Filesystem + Send + Sync,
    S: Transport + 'static,
{
    let (readhalf, writehalf) = tokio::io::split(stream);
    dispatch(filesystem, readhalf, writehalf).await
}

async fn serve_tcp<Fs>(filesystem: Fs, addr: &str) -> Result<()>
where
    Fs: 'static + Filesystem + Send + Sync + Clone,
{
    let listener = TcpListener::bind(addr).await?;

    loop {
        let (stream, peer) = listener.accept().await?;
        info!("accepted: {:?}", peer);

        let fs = filesystem.clone();
        tokio::spawn(async move {
            let (readhalf, writehalf) = stream.into_split();
            if let Err(e) = dispatch(fs, readhalf, writehalf).await {
                error!("connection error: {}", e);
            }
        });
    }
}

struct DeleteOnDrop {
    path: PathBuf,
    listener: UnixListener,
}

impl DeleteOnDrop {
    fn bind(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_owned();
        // A stale node from an earlier run would fail the bind.
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let listener = UnixListener::bind(&path)?;
        std::fs::set_permissions(&path, PermissionsExt::from_mode(0o700))?;
        Ok(DeleteOnDrop { path, listener })
    }
}

impl std::ops::Deref for DeleteOnDrop {
    type Target = UnixListener;

    fn deref(&self) -> &Self::Target {
        &self.listener
    }
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            error!("failed to remove socket file {:?}: {}", self.path, e);
        }
    }
}

async fn serve_unix<Fs>(filesystem: Fs, addr: impl AsRef<Path>) -> Result<()>
where
    Fs: 'static + Filesystem + Send + Sync + Clone,
{
    use tokio::signal::unix::{SignalKind, signal};

    let listener = DeleteOnDrop::bind(addr)?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let running = Arc::new(std::sync::atomic::AtomicBool::new(true));

    {
        let running = running.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down");
                }
                _ = sigint.recv() => {
                    info!("received SIGINT, shutting down");
                }
            }
            running.store(false, Ordering::SeqCst);
        });
    }

    while running.load(Ordering::SeqCst) {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        info!("accepted: {:?}", peer);

                        let fs = filesystem.clone();
                        tokio::spawn(async move {
                            let (readhalf, writehalf) = tokio::io::split(stream);
                            if let Err(e) = dispatch(fs, readhalf, writehalf).await {
                                error!("connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {
                // Lets the loop observe the running flag.
            }
        }
    }

    info!("server shutdown complete");
    Ok(())
}

/// Announce on `address` (`tcp!host!port` or `unix!path`) and serve
/// `filesystem` to every connection.
pub async fn serve<Fs>(filesystem: Fs, address: &str) -> Result<()>
where
    Fs: 'static + Filesystem + Send + Sync + Clone,
{
    let (proto, listen_addr) = utils::parse_proto(address)
        .ok_or_else(|| io_err!(InvalidInput, "Invalid protocol or address"))?;

    match proto {
        "tcp" => serve_tcp(filesystem, &listen_addr).await,
        "unix" => serve_unix(filesystem, &listen_addr).await,
        _ => Err(From::from(io_err!(InvalidInput, "Protocol not supported"))),
    }
}
