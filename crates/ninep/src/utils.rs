use std::env;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};
use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::length_delimited::{self, LengthDelimitedCodec};

use crate::error;

pub type Result<T> = ::std::result::Result<T, error::Error>;

#[macro_export]
macro_rules! io_err {
    ($kind:ident, $msg:expr) => {
        ::std::io::Error::new(::std::io::ErrorKind::$kind, $msg)
    };
}

#[macro_export]
macro_rules! res {
    ($err:expr) => {
        Err(From::from($err))
    };
}

/// Anything a 9P conversation can run over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// Codec builder for 9P frames: `u32 totalsize` including itself,
/// little-endian, frames capped at `max` bytes.
pub(crate) fn frame_codec(max: u32) -> length_delimited::Builder {
    let mut builder = LengthDelimitedCodec::builder();
    builder
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .little_endian()
        .max_frame_length(max as usize);
    builder
}

/// Split a Plan 9 dial string (`proto!address[!port]`) into the protocol
/// and the address the corresponding socket call expects.
///
/// `tcp!host!port` yields `("tcp", "host:port")`; `unix!path` yields
/// `("unix", path)`.
pub fn parse_proto(arg: &str) -> Option<(&str, String)> {
    let mut split = arg.split('!');
    let proto = split.next()?;

    match proto {
        "tcp" => {
            let (host, port) = (split.next()?, split.next()?);
            Some((proto, format!("{}:{}", host, port)))
        }
        "unix" => Some((proto, split.next()?.to_owned())),
        _ => None,
    }
}

/// Name of the user the process runs as, or "none".
pub fn current_user() -> String {
    nix::unistd::User::from_uid(nix::unistd::Uid::current())
        .ok()
        .flatten()
        .map(|u| u.name)
        .unwrap_or_else(|| "none".to_owned())
}

/// Return the path of the canonical 9P namespace directory.
///
/// Either the value of `$NAMESPACE`, if it's set, or
/// `/tmp/ns.$USER.$DISPLAY` with a trailing `.0` stripped from the
/// display. In the latter case the directory is created mode 0700 if
/// missing and must be owned by the current user with no group or other
/// permissions.
pub fn namespace() -> Result<PathBuf> {
    if let Ok(ns) = env::var("NAMESPACE") {
        if !ns.is_empty() {
            return Ok(PathBuf::from(ns));
        }
    }

    let display = match env::var("DISPLAY") {
        Ok(d) if !d.is_empty() => d,
        _ => return res!(io_err!(NotFound, "$DISPLAY is unset")),
    };
    let display = display.strip_suffix(".0").unwrap_or(&display);

    let path = PathBuf::from(format!("/tmp/ns.{}.{}", current_user(), display));
    if !path.exists() {
        std::fs::DirBuilder::new().mode(0o700).create(&path)?;
    }

    let meta = std::fs::metadata(&path)?;
    if meta.uid() != nix::unistd::Uid::current().as_raw() {
        return res!(format!(
            "namespace path '{}' exists but is not owned by you",
            path.display()
        ));
    }
    if meta.permissions().mode() & 0o77 != 0 {
        std::fs::set_permissions(
            &path,
            PermissionsExt::from_mode(meta.permissions().mode() & !0o77),
        )?;
    }

    Ok(path)
}
