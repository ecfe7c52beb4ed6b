//! Raw traffic recording.
//!
//! When a recording directory is configured, every byte read from the
//! client socket is teed to a temporary file and hashed as it streams by.
//! A connection that ends with a clean zero-read persists its recording as
//! `<dir>/<hh>/<sha256>.bin` (`hh` being the first two hash characters);
//! any other ending discards the partial file.

use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;

use sha2::Digest;
use sha2::Sha256;
use tempfile::NamedTempFile;
use tokio::io::AsyncRead;
use tokio::io::ReadBuf;
use tracing::warn;

/// Accumulates one connection's incoming byte stream.
pub(crate) struct Recorder {
    file: NamedTempFile,
    hasher: Sha256,
    dir: PathBuf,
}

impl Recorder {
    /// Create the recording directory and a partial file inside it.
    ///
    /// The partial file lives in the target directory itself so the final
    /// rename never crosses filesystems.
    pub(crate) fn create(dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let file = tempfile::Builder::new()
            .prefix("_")
            .suffix(".partial")
            .tempfile_in(dir)?;

        Ok(Self {
            file,
            hasher: Sha256::new(),
            dir: dir.to_owned(),
        })
    }

    fn observe(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
        // Small synchronous writes to a local file; the recording facility
        // trades a little blocking for a byte-exact stream copy.
        if let Err(err) = self.file.write_all(bytes) {
            warn!(error = %err, "failed to write traffic recording");
        }
    }

    /// Persist the recording under its content hash.
    pub(crate) fn commit(mut self) -> std::io::Result<PathBuf> {
        self.file.flush()?;

        let name = hex::encode(self.hasher.finalize());
        let shard = self.dir.join(&name[..2]);
        std::fs::create_dir_all(&shard)?;

        let path = shard.join(format!("{name}.bin"));
        self.file
            .persist(&path)
            .map_err(|err| err.error)?;
        Ok(path)
    }

    /// Drop the partial file.
    pub(crate) fn discard(self) {
        // NamedTempFile removes itself on drop.
    }
}

/// `AsyncRead` adapter that tees everything it reads into a [`Recorder`].
pub(crate) struct RecordingReader<R> {
    inner: R,
    recorder: Option<Recorder>,
}

impl<R> RecordingReader<R> {
    pub(crate) fn new(inner: R, recorder: Option<Recorder>) -> Self {
        Self { inner, recorder }
    }

    /// Detach the recorder so the caller can commit or discard it.
    pub(crate) fn take_recorder(&mut self) -> Option<Recorder> {
        self.recorder.take()
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for RecordingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();

        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let (Poll::Ready(Ok(())), Some(recorder)) = (&poll, &mut this.recorder) {
            recorder.observe(&buf.filled()[before..]);
        }
        poll
    }
}
