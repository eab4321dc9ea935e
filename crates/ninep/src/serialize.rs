//! Serialize/deserialize 9P messages into/from binary.

use crate::{fcall::*, io_err};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;
use std::io::{Read, Result};
use std::mem;
use std::ops::{Shl, Shr};

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode(&mut *$decoder)?
    };
}

fn read_exact<R: Read + ?Sized>(r: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; size];
    r.read_exact(&mut buf[..]).and(Ok(buf))
}

/// A serializing specific result to overload operators on `Result`
///
/// # Overloaded operators
/// <<, >>, ?
pub struct SResult<T>(::std::io::Result<T>);

/// A wrapper class of WriteBytesExt to provide operator overloads
/// for serializing
///
/// Operator '<<' serializes the right hand side argument into
/// the left hand side encoder
#[derive(Clone, Debug)]
pub struct Encoder<W> {
    writer: W,
    bytes: usize,
}

impl<W: WriteBytesExt> Encoder<W> {
    pub fn new(writer: W) -> Encoder<W> {
        Encoder { writer, bytes: 0 }
    }

    /// Return total bytes written
    pub fn bytes_written(&self) -> usize {
        self.bytes
    }

    /// Encode data, equivalent to: encoder << data
    pub fn encode<T: Encodable>(&mut self, data: &T) -> Result<usize> {
        let bytes = data.encode(&mut self.writer)?;
        self.bytes += bytes;
        Ok(bytes)
    }

    /// Get inner writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for Encoder<W> {
    type Output = SResult<Encoder<W>>;
    fn shl(mut self, rhs: &'a T) -> Self::Output {
        match self.encode(rhs) {
            Ok(_) => SResult(Ok(self)),
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for SResult<Encoder<W>> {
    type Output = Self;
    fn shl(self, rhs: &'a T) -> Self::Output {
        match self.0 {
            Ok(mut encoder) => match encoder.encode(rhs) {
                Ok(_) => SResult(Ok(encoder)),
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// A wrapper class of ReadBytesExt to provide operator overloads
/// for deserializing
#[derive(Clone, Debug)]
pub struct Decoder<R> {
    reader: R,
}

impl<R: ReadBytesExt> Decoder<R> {
    pub fn new(reader: R) -> Decoder<R> {
        Decoder { reader }
    }
    pub fn decode<T: Decodable>(&mut self) -> Result<T> {
        Decodable::decode(&mut self.reader)
    }
    /// Get inner reader
    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for Decoder<R> {
    type Output = SResult<Decoder<R>>;
    fn shr(mut self, rhs: &'a mut T) -> Self::Output {
        match self.decode() {
            Ok(r) => {
                *rhs = r;
                SResult(Ok(self))
            }
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for SResult<Decoder<R>> {
    type Output = Self;
    fn shr(self, rhs: &'a mut T) -> Self::Output {
        match self.0 {
            Ok(mut decoder) => match decoder.decode() {
                Ok(r) => {
                    *rhs = r;
                    SResult(Ok(decoder))
                }
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// Trait representing a type which can be serialized into binary
pub trait Encodable {
    /// Encode self to w and returns the number of bytes encoded
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize>;
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u8(*self).and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u16 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u16::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u32::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u64 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u64::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let mut bytes = (self.len() as u16).encode(w)?;
        bytes += w.write_all(self.as_bytes()).and(Ok(self.len()))?;
        Ok(bytes)
    }
}

impl Encodable for QId {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w) << &self.typ.bits() << &self.version << &self.path {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Stat {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w)
            << &self.size()
            << &self.typ
            << &self.dev
            << &self.qid
            << &self.mode
            << &self.atime
            << &self.mtime
            << &self.length
            << &self.name
            << &self.uid
            << &self.gid
            << &self.muid
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Data {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let size = self.0.len();
        let bytes = (size as u32).encode(w)? + size;
        w.write_all(&self.0)?;
        Ok(bytes)
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match self
            .iter()
            .fold(Encoder::new(w) << &(self.len() as u16), |acc, s| acc << s)
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Msg {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        use crate::FCall::*;

        // A Twalk carries at most MAXWELEM names; likewise Rwalk qids.
        match self.body {
            TWalk { ref wnames, .. } if wnames.len() > MAXWELEM => {
                return Err(io_err!(InvalidInput, "too many walk elements"));
            }
            RWalk { ref wqids } if wqids.len() > MAXWELEM => {
                return Err(io_err!(InvalidInput, "too many walk elements"));
            }
            _ => {}
        }

        let typ = MsgType::from(&self.body);
        let buf = Encoder::new(w) << &(typ as u8) << &self.tag;

        let buf = match self.body {
            TVersion {
                ref msize,
                ref version,
            } => buf << msize << version,
            RVersion {
                ref msize,
                ref version,
            } => buf << msize << version,
            TAuth {
                ref afid,
                ref uname,
                ref aname,
            } => buf << afid << uname << aname,
            RAuth { ref aqid } => buf << aqid,
            TAttach {
                ref fid,
                ref afid,
                ref uname,
                ref aname,
            } => buf << fid << afid << uname << aname,
            RAttach { ref qid } => buf << qid,
            RError { ref ename } => buf << ename,
            TFlush { ref oldtag } => buf << oldtag,
            RFlush => buf,
            TWalk {
                ref fid,
                ref newfid,
                ref wnames,
            } => buf << fid << newfid << wnames,
            RWalk { ref wqids } => buf << wqids,
            TOpen { ref fid, ref mode } => buf << fid << mode,
            ROpen {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            TCreate {
                ref fid,
                ref name,
                ref perm,
                ref mode,
            } => buf << fid << name << perm << mode,
            RCreate {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            TRead {
                ref fid,
                ref offset,
                ref count,
            } => buf << fid << offset << count,
            RRead { ref data } => buf << data,
            TWrite {
                ref fid,
                ref offset,
                ref data,
            } => buf << fid << offset << data,
            RWrite { ref count } => buf << count,
            TClunk { ref fid } => buf << fid,
            RClunk => buf,
            TRemove { ref fid } => buf << fid,
            RRemove => buf,
            TStat { ref fid } => buf << fid,
            // Rstat and Twstat wrap the stat record in a redundant
            // byte count covering the record and its own size field.
            RStat { ref stat } => buf << &(stat.size() + 2) << stat,
            TWStat { ref fid, ref stat } => buf << fid << &(stat.size() + 2) << stat,
            RWStat => buf,
        };

        match buf {
            SResult(Ok(b)) => Ok(b.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

/// Trait representing a type which can be deserialized from binary
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self>;
}

impl Decodable for u8 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u8()
    }
}

impl Decodable for u16 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u16::<LittleEndian>()
    }
}

impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u32::<LittleEndian>()
    }
}

impl Decodable for u64 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u64::<LittleEndian>()
    }
}

impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        String::from_utf8(read_exact(r, len as usize)?)
            .map_err(|_| io_err!(Other, "Invalid UTF-8 sequence"))
    }
}

impl Decodable for QId {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(QId {
            typ: QIdType::from_bits_retain(decode!(r)),
            version: Decodable::decode(r)?,
            path: Decodable::decode(r)?,
        })
    }
}

impl Decodable for Stat {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let _size: u16 = Decodable::decode(r)?;
        Ok(Stat {
            typ: Decodable::decode(r)?,
            dev: Decodable::decode(r)?,
            qid: Decodable::decode(r)?,
            mode: Decodable::decode(r)?,
            atime: Decodable::decode(r)?,
            mtime: Decodable::decode(r)?,
            length: Decodable::decode(r)?,
            name: Decodable::decode(r)?,
            uid: Decodable::decode(r)?,
            gid: Decodable::decode(r)?,
            muid: Decodable::decode(r)?,
        })
    }
}

impl Decodable for Data {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u32 = Decodable::decode(r)?;
        Ok(Data(read_exact(r, len as usize)?))
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        let mut buf = Vec::new();
        for _ in 0..len {
            buf.push(Decodable::decode(r)?);
        }
        Ok(buf)
    }
}

impl Decodable for Msg {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        use crate::MsgType::*;

        let mut buf = r;

        let msg_type = MsgType::from_u8(decode!(buf));
        let tag = decode!(buf);
        let body = match msg_type {
            Some(TVersion) => FCall::TVersion {
                msize: decode!(buf),
                version: decode!(buf),
            },
            Some(RVersion) => FCall::RVersion {
                msize: decode!(buf),
                version: decode!(buf),
            },
            Some(TAuth) => FCall::TAuth {
                afid: decode!(buf),
                uname: decode!(buf),
                aname: decode!(buf),
            },
            Some(RAuth) => FCall::RAuth { aqid: decode!(buf) },
            Some(TAttach) => FCall::TAttach {
                fid: decode!(buf),
                afid: decode!(buf),
                uname: decode!(buf),
                aname: decode!(buf),
            },
            Some(RAttach) => FCall::RAttach { qid: decode!(buf) },
            Some(RError) => FCall::RError {
                ename: decode!(buf),
            },
            Some(TFlush) => FCall::TFlush {
                oldtag: decode!(buf),
            },
            Some(RFlush) => FCall::RFlush,
            Some(TWalk) => {
                let fid = decode!(buf);
                let newfid = decode!(buf);
                let wnames: Vec<String> = decode!(buf);
                if wnames.len() > MAXWELEM {
                    return Err(io_err!(InvalidData, "too many walk elements"));
                }
                FCall::TWalk { fid, newfid, wnames }
            }
            Some(RWalk) => {
                let wqids: Vec<QId> = decode!(buf);
                if wqids.len() > MAXWELEM {
                    return Err(io_err!(InvalidData, "too many walk elements"));
                }
                FCall::RWalk { wqids }
            }
            Some(TOpen) => FCall::TOpen {
                fid: decode!(buf),
                mode: decode!(buf),
            },
            Some(ROpen) => FCall::ROpen {
                qid: decode!(buf),
                iounit: decode!(buf),
            },
            Some(TCreate) => FCall::TCreate {
                fid: decode!(buf),
                name: decode!(buf),
                perm: decode!(buf),
                mode: decode!(buf),
            },
            Some(RCreate) => FCall::RCreate {
                qid: decode!(buf),
                iounit: decode!(buf),
            },
            Some(TRead) => FCall::TRead {
                fid: decode!(buf),
                offset: decode!(buf),
                count: decode!(buf),
            },
            Some(RRead) => FCall::RRead { data: decode!(buf) },
            Some(TWrite) => FCall::TWrite {
                fid: decode!(buf),
                offset: decode!(buf),
                data: decode!(buf),
            },
            Some(RWrite) => FCall::RWrite {
                count: decode!(buf),
            },
            Some(TClunk) => FCall::TClunk { fid: decode!(buf) },
            Some(RClunk) => FCall::RClunk,
            Some(TRemove) => FCall::TRemove { fid: decode!(buf) },
            Some(RRemove) => FCall::RRemove,
            Some(TStat) => FCall::TStat { fid: decode!(buf) },
            Some(RStat) => {
                let _nstat: u16 = decode!(buf);
                FCall::RStat {
                    stat: decode!(buf),
                }
            }
            Some(TWStat) => {
                let fid = decode!(buf);
                let _nstat: u16 = decode!(buf);
                FCall::TWStat {
                    fid,
                    stat: decode!(buf),
                }
            }
            Some(RWStat) => FCall::RWStat,
            None => return Err(io_err!(InvalidData, "Invalid message type")),
        };

        Ok(Msg { tag, body })
    }
}

/// Helper function to read a 9P message from a byte-oriented stream
pub fn read_msg<R: ReadBytesExt>(r: &mut R) -> Result<Msg> {
    Decodable::decode(r)
}

/// Helper function to write a 9P message into a byte-oriented stream
pub fn write_msg<W: WriteBytesExt>(w: &mut W, msg: &Msg) -> Result<usize> {
    msg.encode(w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(msg: Msg) {
        let mut buf = Vec::new();
        let bytes = msg.encode(&mut buf).unwrap();
        assert_eq!(bytes, buf.len());

        let mut readbuf = Cursor::new(buf);
        let actual: Msg = Decodable::decode(&mut readbuf).unwrap();
        assert_eq!(msg, actual);
    }

    fn sample_qid() -> QId {
        QId {
            typ: QIdType::DIR,
            version: 1,
            path: 0x00c0ffee,
        }
    }

    fn sample_stat() -> Stat {
        Stat {
            typ: 0,
            dev: 0,
            qid: sample_qid(),
            mode: dm::DIR | 0o755,
            atime: 1234,
            mtime: 5678,
            length: 0,
            name: "wmii".to_owned(),
            uid: "kris".to_owned(),
            gid: "kris".to_owned(),
            muid: "kris".to_owned(),
        }
    }

    #[test]
    fn encoder_test1() {
        let expected: Vec<u8> = (0..10).collect();
        let mut encoder = Vec::new();
        for i in 0..10 {
            (&(i as u8)).encode(&mut encoder).unwrap();
        }
        assert_eq!(expected, encoder);
    }

    #[test]
    fn decoder_test1() {
        let expected: Vec<u8> = (0..10).collect();
        let mut decoder = Cursor::new(expected.clone());
        let mut actual: Vec<u8> = Vec::new();
        while let Ok(i) = Decodable::decode(&mut decoder) {
            actual.push(i);
        }
        assert_eq!(expected, actual);
    }

    #[test]
    fn operator_overloads_chain() {
        let buf = match Encoder::new(Vec::new()) << &1u8 << &2u16 << &3u32 {
            SResult(Ok(enc)) => enc.into_inner(),
            SResult(Err(e)) => panic!("encode failed: {}", e),
        };
        assert_eq!(buf, [1, 2, 0, 3, 0, 0, 0]);

        let (mut a, mut b, mut c) = (0u8, 0u16, 0u32);
        match Decoder::new(Cursor::new(buf)) >> &mut a >> &mut b >> &mut c {
            SResult(Ok(_)) => {}
            SResult(Err(e)) => panic!("decode failed: {}", e),
        }
        assert_eq!((a, b, c), (1, 2, 3));
    }

    #[test]
    fn msg_encode_decode1() {
        roundtrip(Msg {
            tag: 0xdead,
            body: FCall::RVersion {
                msize: 40,
                version: P92000.to_owned(),
            },
        });
    }

    #[test]
    fn all_variants_roundtrip() {
        let msgs = vec![
            FCall::TVersion {
                msize: DEFAULT_MSIZE,
                version: P92000.to_owned(),
            },
            FCall::RVersion {
                msize: DEFAULT_MSIZE,
                version: P92000.to_owned(),
            },
            FCall::TAuth {
                afid: 1,
                uname: "kris".to_owned(),
                aname: String::new(),
            },
            FCall::RAuth { aqid: sample_qid() },
            FCall::TAttach {
                fid: 0,
                afid: NOFID,
                uname: "kris".to_owned(),
                aname: String::new(),
            },
            FCall::RAttach { qid: sample_qid() },
            FCall::RError {
                ename: "file does not exist".to_owned(),
            },
            FCall::TFlush { oldtag: 9 },
            FCall::RFlush,
            FCall::TWalk {
                fid: 0,
                newfid: 1,
                wnames: vec!["a".to_owned(), "b".to_owned()],
            },
            FCall::RWalk {
                wqids: vec![sample_qid(), sample_qid()],
            },
            FCall::TOpen {
                fid: 1,
                mode: om::READ,
            },
            FCall::ROpen {
                qid: sample_qid(),
                iounit: 4096,
            },
            FCall::TCreate {
                fid: 1,
                name: "event".to_owned(),
                perm: 0o644,
                mode: om::RDWR,
            },
            FCall::RCreate {
                qid: sample_qid(),
                iounit: 0,
            },
            FCall::TRead {
                fid: 1,
                offset: 4096,
                count: 4096,
            },
            FCall::RRead {
                data: Data(vec![1, 2, 3, 4, 5]),
            },
            FCall::TWrite {
                fid: 1,
                offset: 0,
                data: Data(b"hello".to_vec()),
            },
            FCall::RWrite { count: 5 },
            FCall::TClunk { fid: 1 },
            FCall::RClunk,
            FCall::TRemove { fid: 1 },
            FCall::RRemove,
            FCall::TStat { fid: 1 },
            FCall::RStat {
                stat: sample_stat(),
            },
            FCall::TWStat {
                fid: 1,
                stat: sample_stat(),
            },
            FCall::RWStat,
        ];

        for (i, body) in msgs.into_iter().enumerate() {
            roundtrip(Msg {
                tag: i as u16,
                body,
            });
        }
    }

    #[test]
    fn tversion_wire_bytes() {
        let msg = Msg {
            tag: NOTAG,
            body: FCall::TVersion {
                msize: DEFAULT_MSIZE,
                version: P92000.to_owned(),
            },
        };

        let mut body = Vec::new();
        msg.encode(&mut body).unwrap();

        // The frame is the body behind a u32 totalsize including itself.
        let mut frame = ((body.len() + 4) as u32).to_le_bytes().to_vec();
        frame.extend_from_slice(&body);
        assert_eq!(
            frame,
            [
                19, 0, 0, 0, // size
                100, // Tversion
                0xff, 0xff, // NOTAG
                0x00, 0x20, 0, 0, // msize 8192
                6, 0, b'9', b'P', b'2', b'0', b'0', b'0',
            ]
        );
    }

    #[test]
    fn stat_wire_form_is_double_sized() {
        let stat = sample_stat();
        let msg = Msg {
            tag: 1,
            body: FCall::RStat { stat: stat.clone() },
        };

        let mut buf = Vec::new();
        msg.encode(&mut buf).unwrap();

        // type[1] tag[2], then the outer count, then the record's own size
        let outer = u16::from_le_bytes([buf[3], buf[4]]);
        let inner = u16::from_le_bytes([buf[5], buf[6]]);
        assert_eq!(outer, stat.size() + 2);
        assert_eq!(inner, stat.size());
    }

    #[test]
    fn truncated_buffer_fails_cleanly() {
        let msg = Msg {
            tag: 3,
            body: FCall::TWalk {
                fid: 0,
                newfid: 1,
                wnames: vec!["some".to_owned(), "path".to_owned()],
            },
        };

        let mut buf = Vec::new();
        msg.encode(&mut buf).unwrap();

        for cut in 0..buf.len() {
            let mut short = Cursor::new(&buf[..cut]);
            assert!(read_msg(&mut short).is_err(), "cut at {} decoded", cut);
        }
    }

    #[test]
    fn seventeen_walk_names_refused() {
        let wnames: Vec<String> = (0..17).map(|i| format!("d{}", i)).collect();
        let msg = Msg {
            tag: 4,
            body: FCall::TWalk {
                fid: 0,
                newfid: 1,
                wnames,
            },
        };

        let mut buf = Vec::new();
        assert!(msg.encode(&mut buf).is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn seventeen_wire_walk_names_refused() {
        // Hand-build a Twalk frame claiming 17 names.
        let mut buf = Vec::new();
        buf.push(MsgType::TWalk as u8);
        buf.extend_from_slice(&5u16.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&17u16.to_le_bytes());
        for _ in 0..17 {
            buf.extend_from_slice(&1u16.to_le_bytes());
            buf.push(b'x');
        }

        let mut cursor = Cursor::new(buf);
        assert!(read_msg(&mut cursor).is_err());
    }

    #[test]
    fn empty_strings_roundtrip() {
        roundtrip(Msg {
            tag: 0,
            body: FCall::TAttach {
                fid: 0,
                afid: NOFID,
                uname: String::new(),
                aname: String::new(),
            },
        });
    }
}
