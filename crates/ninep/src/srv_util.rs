//! Helpers for writing synthetic filesystems on top of [`crate::srv`].
//!
//! [`FileId`] chains track the path a fid was walked along, one shared node
//! per component, linked strictly child to parent. [`readdir`] packs stat
//! records for directory reads. [`Pending`] multicasts written data to
//! subscribed fids, parking reads until something arrives; it is the
//! mechanism behind event files.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::error::{Error, string as errstr};
use crate::fcall::{Data, QId, Stat};
use crate::serialize::Encodable;
use crate::utils::Result;

/// One walked path component, holding whatever per-file state the
/// filesystem wants (`data`), linked to its parent directory's node.
#[derive(Clone, Debug)]
pub struct FileId<T> {
    /// Last path element.
    pub name: String,
    /// Qid type bits for this file.
    pub qtype: crate::fcall::QIdType,
    /// Qid path, unique per file.
    pub path: u64,
    /// Permission bits (including the dm flags).
    pub perm: u32,
    /// Files that may vanish behind the server's back.
    pub volatile: bool,
    /// Filesystem cookie.
    pub data: T,
    parent: Option<Arc<FileId<T>>>,
}

impl<T> FileId<T> {
    /// A chain head with no parent, for the attach root.
    pub fn root(name: impl Into<String>, qtype: crate::fcall::QIdType, path: u64, perm: u32, data: T) -> Arc<FileId<T>> {
        Arc::new(FileId {
            name: name.into(),
            qtype,
            path,
            perm,
            volatile: false,
            data,
            parent: None,
        })
    }

    /// A child node chained under `self`.
    pub fn child(
        self: &Arc<Self>,
        name: impl Into<String>,
        qtype: crate::fcall::QIdType,
        path: u64,
        perm: u32,
        data: T,
    ) -> FileId<T> {
        FileId {
            name: name.into(),
            qtype,
            path,
            perm,
            volatile: false,
            data,
            parent: Some(self.clone()),
        }
    }

    /// The directory this node was walked from, if any.
    pub fn parent(&self) -> Option<&Arc<FileId<T>>> {
        self.parent.as_ref()
    }

    /// The qid this node answers to.
    pub fn qid(&self) -> QId {
        QId {
            typ: self.qtype,
            version: 0,
            path: self.path,
        }
    }
}

/// Walk `wnames` from `from`, cloning the chain as it goes. `lookup` maps
/// a directory node and a child name to the child's node.
///
/// `..` steps to the parent (staying put at the root), `.` stays in place.
/// Returns the qids of the components actually walked, and the final node
/// only if every component resolved; a partial walk yields `None` so the
/// caller can leave the new fid unbound.
pub fn walk_chain<T, F>(
    from: &Arc<FileId<T>>,
    wnames: &[String],
    lookup: F,
) -> (Vec<QId>, Option<Arc<FileId<T>>>)
where
    F: Fn(&Arc<FileId<T>>, &str) -> Option<FileId<T>>,
{
    let mut cur = from.clone();
    let mut wqids = Vec::with_capacity(wnames.len());

    for name in wnames {
        match name.as_str() {
            ".." => {
                if let Some(parent) = cur.parent.clone() {
                    cur = parent;
                }
            }
            "." => {}
            _ => match lookup(&cur, name) {
                Some(child) => cur = Arc::new(child),
                None => break,
            },
        }
        wqids.push(cur.qid());
    }

    if wqids.len() == wnames.len() {
        (wqids, Some(cur))
    } else {
        (wqids, None)
    }
}

/// Check that `file` still exists, re-resolving every component of its
/// chain through `lookup`. Filesystems that invalidate files after
/// deletion mark their nodes `volatile`; a volatile node only verifies if
/// the re-resolved node carries the same cookie.
pub fn verify_file<T, F>(file: &FileId<T>, lookup: &F) -> bool
where
    T: PartialEq,
    F: Fn(&Arc<FileId<T>>, &str) -> Option<FileId<T>>,
{
    let parent = match file.parent() {
        Some(parent) => parent,
        None => return true,
    };

    if !verify_file(parent, lookup) {
        return false;
    }
    match lookup(parent, &file.name) {
        Some(found) => !found.volatile || found.data == file.data,
        None => false,
    }
}

/// Pack stat records for a directory read.
///
/// Entries are laid out at stable byte offsets; a read resumes at the
/// `offset` a previous read stopped at. Entries named `.` are skipped,
/// matching lookup functions that yield the directory itself first. Packing
/// stops at the first entry that does not fit in `count` bytes.
pub fn readdir<I>(offset: u64, count: u32, entries: I) -> Result<Data>
where
    I: IntoIterator<Item = Stat>,
{
    let mut out = Vec::new();
    let mut pos = 0u64;

    for stat in entries {
        if stat.name == "." {
            continue;
        }
        let n = (stat.size() + 2) as u64;
        if pos >= offset {
            if out.len() as u64 + n > count as u64 {
                break;
            }
            stat.encode(&mut out)?;
        }
        pos += n;
    }

    Ok(Data(out))
}

/// Serve a `Tread` against an in-memory buffer.
pub fn read_buf(offset: u64, count: u32, buf: &[u8]) -> Data {
    if offset >= buf.len() as u64 {
        return Data(Vec::new());
    }
    let start = offset as usize;
    let end = buf.len().min(start + count as usize);
    Data(buf[start..end].to_vec())
}

/// Serve a `Twrite` against an in-memory buffer, growing it as needed.
///
/// With `append` the offset is forced to the end of the buffer. A nonzero
/// `max` truncates writes at that point instead of growing. Returns the
/// number of bytes written.
pub fn write_buf(offset: u64, data: &[u8], buf: &mut Vec<u8>, append: bool, max: usize) -> u32 {
    let offset = if append { buf.len() } else { offset as usize };
    if offset > buf.len() || data.is_empty() {
        return 0;
    }

    let mut count = data.len();
    if max != 0 {
        if offset >= max {
            return 0;
        }
        count = count.min(max - offset);
    }

    let end = offset + count;
    if end > buf.len() {
        buf.resize(end, 0);
    }
    buf[offset..end].copy_from_slice(&data[..count]);
    count as u32
}

#[derive(Default)]
struct Subscriber {
    queue: VecDeque<Vec<u8>>,
    waiters: VecDeque<oneshot::Sender<Result<Vec<u8>>>>,
}

#[derive(Default)]
struct PendingState {
    subs: HashMap<u32, Subscriber>,
}

/// Multicast buffer for event-style files.
///
/// Fids subscribe with [`push_fid`](Pending::push_fid). Each
/// [`write`](Pending::write) either completes a parked read or queues a
/// per-subscriber copy; [`read`](Pending::read) pops queued data or parks
/// until data arrives, the fid is clunked ("interrupted"), or the read is
/// flushed (the parked future is simply dropped).
#[derive(Clone, Default)]
pub struct Pending {
    inner: Arc<Mutex<PendingState>>,
}

impl Pending {
    pub fn new() -> Pending {
        Pending::default()
    }

    /// Subscribe `fid` to subsequent writes.
    pub fn push_fid(&self, fid: u32) {
        let mut state = self.inner.lock().unwrap();
        state.subs.entry(fid).or_default();
    }

    /// Whether `fid` is subscribed.
    pub fn has_fid(&self, fid: u32) -> bool {
        self.inner.lock().unwrap().subs.contains_key(&fid)
    }

    /// Deliver `data` to every subscriber: to a parked read if one is
    /// waiting, otherwise onto that subscriber's queue.
    pub fn write(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        let mut state = self.inner.lock().unwrap();
        for sub in state.subs.values_mut() {
            let mut delivered = false;
            while let Some(tx) = sub.waiters.pop_front() {
                // A send failure means the parked read was flushed;
                // try the next waiter.
                if tx.send(Ok(data.to_vec())).is_ok() {
                    delivered = true;
                    break;
                }
            }
            if !delivered {
                sub.queue.push_back(data.to_vec());
            }
        }
    }

    /// Read the next chunk for `fid`, waiting until one is written if the
    /// queue is empty.
    pub async fn read(&self, fid: u32) -> Result<Vec<u8>> {
        let rx = {
            let mut state = self.inner.lock().unwrap();
            let sub = state
                .subs
                .get_mut(&fid)
                .ok_or_else(|| Error::Remote(errstr::ENOFID.to_owned()))?;
            if let Some(data) = sub.queue.pop_front() {
                return Ok(data);
            }
            let (tx, rx) = oneshot::channel();
            sub.waiters.push_back(tx);
            rx
        };

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Remote(errstr::EINTERRUPTED.to_owned())),
        }
    }

    /// Unsubscribe `fid`, answering its parked reads with "interrupted".
    /// Returns whether any subscribers remain.
    pub fn clunk_fid(&self, fid: u32) -> bool {
        let mut state = self.inner.lock().unwrap();
        if let Some(sub) = state.subs.remove(&fid) {
            for tx in sub.waiters {
                let _ = tx.send(Err(Error::Remote(errstr::EINTERRUPTED.to_owned())));
            }
        }
        !state.subs.is_empty()
    }
}
