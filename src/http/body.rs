//! POST body ingestion.
//!
//! Bodies already sitting in the read buffer are exposed zero-copy.
//! Larger bodies go to the heap, and, when the configuration allows it,
//! bodies of a megabyte and more spill into an unlinked temporary file
//! mapped shared into memory. The temp directory is resolved once, on
//! first use.

use crate::{
    coro::TaskHandle,
    errors::RequestError,
    http::{
        pump::{calculate_n_packets, read_body_bytes, Io},
        request::Request,
        types::{slice_to_usize, Span},
    },
    limits::ReqLimits,
};
use memmap2::MmapMut;
use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::OnceLock,
    time::Instant,
};

/// Storage for an ingested request body.
pub(crate) enum PostBody {
    None,
    /// The whole body was already buffered; a span into the read buffer.
    Inline(Span),
    /// Bodies under [`HEAP_LIMIT`].
    Heap(Vec<u8>),
    /// File-backed mapping, unmapped when the transaction ends.
    File(MmapMut),
}

/// Bodies at or above this size go to a temp file instead of the heap.
const HEAP_LIMIT: usize = 1 << 20;

impl PostBody {
    pub(crate) fn bytes<'a>(&'a self, main: &'a [u8]) -> Option<&'a [u8]> {
        match self {
            PostBody::None => None,
            PostBody::Inline(span) => Some(span.slice(main)),
            PostBody::Heap(heap) => Some(heap),
            PostBody::File(map) => Some(map),
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            PostBody::None | PostBody::Inline(_) => &mut [],
            PostBody::Heap(heap) => heap,
            PostBody::File(map) => map,
        }
    }
}

/// Ingests a POST body per the route's declaration.
///
/// Requires a valid `Content-Length` under the configured cap. Arms both
/// body deadlines before pumping: the keep-alive wall clock and the
/// packet budget for the bytes still missing.
pub(crate) async fn read_post_data(
    io: &dyn Io,
    task: &TaskHandle,
    limits: &ReqLimits,
    req: &mut Request,
) -> Result<(), RequestError> {
    let size = declared_body_size(limits, req)?;

    let have = match req.helper.next_request {
        None => 0,
        Some(next) => {
            let have = req.helper.len - next;
            if have >= size {
                req.helper.body = PostBody::Inline(Span::new(next, size));
                req.helper.next_request = Some(next + size);
                return Ok(());
            }
            have
        }
    };

    let mut storage = alloc_post_buffer(size, limits.allow_post_temp_file)
        .ok_or(RequestError::Internal)?;

    if have > 0 {
        let next = req.helper.next_request.unwrap_or(req.helper.len);
        storage.as_mut_slice()[..have].copy_from_slice(&req.helper.buf[next..next + have]);
    }
    req.helper.next_request = None;

    req.helper.error_when_time = Some(Instant::now() + limits.keep_alive_timeout);
    req.helper.error_when_n_packets = calculate_n_packets(size - have);

    let deadline = req.helper.error_when_time;
    let max_packets = req.helper.error_when_n_packets;
    read_body_bytes(io, task, &mut storage.as_mut_slice()[have..], deadline, max_packets).await?;

    req.helper.body = storage;
    Ok(())
}

/// Consumes the declared body of a POST sent to a route that does not
/// take one, so an already pipelined follow-up request is not corrupted
/// by leftover body bytes. An unusable declaration instead forces the
/// connection closed.
pub(crate) async fn drain_post_data(
    io: &dyn Io,
    task: &TaskHandle,
    limits: &ReqLimits,
    req: &mut Request,
) -> Result<(), RequestError> {
    use crate::http::types::ConnFlags;

    if req.helper.content_length.is_none() {
        return Ok(());
    }

    let size = match declared_body_size(limits, req) {
        Ok(size) => size,
        Err(_) => {
            req.conn.remove(ConnFlags::KEEP_ALIVE);
            return Ok(());
        }
    };

    let mut remaining = size;
    if let Some(next) = req.helper.next_request {
        let have = req.helper.len - next;
        if have >= size {
            req.helper.next_request = Some(next + size);
            return Ok(());
        }
        req.helper.next_request = None;
        remaining -= have;
    }

    let deadline = Instant::now() + limits.keep_alive_timeout;
    let max_packets = calculate_n_packets(remaining);
    let mut n_packets: u32 = 0;
    let mut scratch = [0u8; 1024];

    while remaining > 0 {
        let want = remaining.min(scratch.len());
        let n = match io.try_read(&mut scratch[..want]) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                task.pause(crate::coro::Yield::WantRead).await;
                continue;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                task.pause(crate::coro::Yield::Reschedule).await;
                continue;
            }
            Err(_) => match task.closed().await {},
        };

        if n == 0 {
            match task.closed().await {}
        }

        remaining -= n;
        n_packets += 1;

        if Instant::now() > deadline || n_packets > max_packets {
            return Err(RequestError::Timeout);
        }
    }

    Ok(())
}

fn declared_body_size(limits: &ReqLimits, req: &Request) -> Result<usize, RequestError> {
    let span = req.helper.content_length.ok_or(RequestError::BadRequest)?;
    let size =
        slice_to_usize(span.slice(&req.helper.buf)).ok_or(RequestError::BadRequest)?;

    if size >= limits.max_post_data_size {
        return Err(RequestError::TooLarge);
    }

    Ok(size)
}

fn alloc_post_buffer(size: usize, allow_file: bool) -> Option<PostBody> {
    if size < HEAP_LIMIT {
        return Some(PostBody::Heap(vec![0; size]));
    }

    if !allow_file {
        return None;
    }

    let dir = temp_dir()?;
    let file = match tempfile::tempfile_in(dir) {
        Ok(file) => file,
        Err(error) => {
            tracing::warn!(dir = %dir.display(), %error, "could not create body temp file");
            return None;
        }
    };
    file.set_len(size as u64).ok()?;

    // Prefer huge pages where the kernel offers them.
    #[cfg(target_os = "linux")]
    {
        // SAFETY: the mapping is backed by a private, unlinked file that
        // nothing else can open or truncate while the map is alive.
        if let Ok(map) = unsafe { memmap2::MmapOptions::new().huge(None).map_mut(&file) } {
            return Some(PostBody::File(map));
        }
    }

    // SAFETY: as above.
    match unsafe { MmapMut::map_mut(&file) } {
        Ok(map) => Some(PostBody::File(map)),
        Err(error) => {
            tracing::warn!(%error, "could not map body temp file");
            None
        }
    }
}

static TEMP_DIR: OnceLock<Option<PathBuf>> = OnceLock::new();

/// `$TMPDIR`, `$TMP`, `$TEMP`, `/var/tmp`, then the platform default;
/// resolved on first use and memoized.
fn temp_dir() -> Option<&'static Path> {
    TEMP_DIR
        .get_or_init(|| {
            for var in ["TMPDIR", "TMP", "TEMP"] {
                if let Some(dir) = env::var_os(var).map(PathBuf::from) {
                    if is_usable_dir(&dir) {
                        return Some(dir);
                    }
                }
            }

            let fixed = PathBuf::from("/var/tmp");
            if is_usable_dir(&fixed) {
                return Some(fixed);
            }

            let fallback = env::temp_dir();
            is_usable_dir(&fallback).then_some(fallback)
        })
        .as_deref()
}

fn is_usable_dir(path: &Path) -> bool {
    if !path.is_absolute() {
        return false;
    }

    let Ok(meta) = fs::metadata(path) else {
        return false;
    };
    if !meta.is_dir() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;

        if meta.mode() & 0o1000 == 0 {
            tracing::warn!(
                dir = %path.display(),
                "temporary directory does not have the sticky bit set",
            );
        }
    }

    true
}
