// src/sink.rs

//! Destinations for the archive stream
//!
//! The assembler writes tar bytes into an [`ImageSink`]. The production sink
//! is a [`PipeSink`]: the write end of a pipe whose read end is the stdin of
//! a filesystem compressor (`sqfstar`). The compressor is started before the
//! first byte is written and runs concurrently with the walk, draining the
//! pipe as it fills; a full pipe blocks the writer, which is the only
//! backpressure in the system.
//!
//! Shutdown is two-phase and the order matters:
//!
//! 1. the tar writer is finished (trailing zero blocks), then
//! 2. [`ImageSink::finish`] closes the pipe and waits for the compressor,
//!    failing if it exited non-zero.
//!
//! Only after `finish` returns is the image file complete on disk.

use crate::error::{Error, Result};
use crate::sif::FsType;
use std::ffi::OsStr;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use tracing::{debug, info, warn};

/// Buffer between the tar writer and the pipe
const PIPE_BUFFER_SIZE: usize = 128 * 1024;

/// A byte sink with a scoped close
pub trait ImageSink: Write {
    /// What the sink yields once closed
    type Output;

    /// Flush, release the underlying resource and wait for any consumer
    fn finish(self) -> Result<Self::Output>;

    /// Release the sink after `err` interrupted the stream
    ///
    /// Returns the error that explains the failure best.
    fn abort(&mut self, err: Error) -> Error {
        err
    }
}

/// In-memory sink, yields the raw archive
impl ImageSink for Vec<u8> {
    type Output = Vec<u8>;

    fn finish(self) -> Result<Vec<u8>> {
        Ok(self)
    }
}

/// Pipe into a child process's stdin
///
/// The child's stdout and stderr are inherited so its diagnostics reach the
/// operator. Dropping an unfinished sink closes the pipe and reaps the
/// child without checking its status.
pub struct PipeSink {
    program: String,
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
}

impl PipeSink {
    /// Start `command` with a piped stdin
    pub fn spawn(mut command: Command) -> Result<Self> {
        let program = command.get_program().to_string_lossy().into_owned();

        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| Error::Spawn {
                program: program.clone(),
                source,
            })?;

        let Some(stdin) = child.stdin.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Spawn {
                program,
                source: io::Error::other("stdin was not captured"),
            });
        };

        debug!("Started {} (pid {})", program, child.id());

        Ok(Self {
            program,
            child,
            stdin: Some(BufWriter::with_capacity(PIPE_BUFFER_SIZE, stdin)),
        })
    }

    fn writer(&mut self) -> io::Result<&mut BufWriter<ChildStdin>> {
        self.stdin.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "compressor input already closed")
        })
    }
}

impl Write for PipeSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer()?.flush()
    }
}

impl ImageSink for PipeSink {
    type Output = ();

    fn finish(mut self) -> Result<()> {
        // Closing stdin is what lets the child see EOF
        let flushed = match self.stdin.take() {
            Some(writer) => writer.into_inner().map(drop).map_err(|e| e.into_error()),
            None => Ok(()),
        };

        let status = self.child.wait()?;
        debug!("{} exited with {}", self.program, status);

        if !status.success() {
            return Err(Error::Compressor {
                program: self.program.clone(),
                status,
            });
        }
        flushed?;

        Ok(())
    }

    /// A broken pipe means the compressor went away; report its exit status
    fn abort(&mut self, err: Error) -> Error {
        let broken_pipe = matches!(&err, Error::Io(e) if e.kind() == io::ErrorKind::BrokenPipe);
        if !broken_pipe {
            return err;
        }
        let Some(writer) = self.stdin.take() else {
            return err;
        };
        let (stdin, _) = writer.into_parts();
        drop(stdin);

        match self.child.wait() {
            Ok(status) if !status.success() => {
                debug!("{} exited with {}", self.program, status);
                Error::Compressor {
                    program: self.program.clone(),
                    status,
                }
            }
            _ => err,
        }
    }
}

impl Drop for PipeSink {
    fn drop(&mut self) {
        if let Some(writer) = self.stdin.take() {
            warn!("{} input closed before the archive was finished", self.program);
            let (stdin, _) = writer.into_parts();
            drop(stdin);
            let _ = self.child.wait();
        }
    }
}

/// Uncompressed archive written straight to a file
pub struct TarFileSink {
    file: BufWriter<File>,
}

impl TarFileSink {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            file: BufWriter::new(file),
        })
    }
}

impl Write for TarFileSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl ImageSink for TarFileSink {
    type Output = ();

    fn finish(self) -> Result<()> {
        let file = self.file.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(())
    }
}

/// Turns the archive stream into a filesystem image file
pub trait Compressor {
    type Sink: ImageSink<Output = ()>;

    /// Open a sink that produces the image at `image`
    fn open(&self, image: &Path) -> Result<Self::Sink>;

    /// Filesystem type of the produced image
    fn filesystem(&self) -> FsType;
}

/// `sqfstar`, squashfs from a tar stream
#[derive(Debug, Clone)]
pub struct Sqfstar {
    program: PathBuf,
}

impl Sqfstar {
    pub const DEFAULT_PROGRAM: &'static str = "sqfstar";

    /// Resolve `program` through `PATH`
    pub fn locate(program: impl AsRef<OsStr>) -> Result<Self> {
        let program = program.as_ref();
        let resolved = which::which(program)
            .map_err(|_| Error::ToolNotFound(program.to_string_lossy().into_owned()))?;
        debug!("Using compressor {}", resolved.display());
        Ok(Self { program: resolved })
    }

    /// Command line producing `image`; all files owned by root
    pub fn command(&self, image: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command.arg(image).arg("-all-root");
        command
    }
}

impl Compressor for Sqfstar {
    type Sink = PipeSink;

    fn open(&self, image: &Path) -> Result<PipeSink> {
        info!("Compressing into {}", image.display());
        PipeSink::spawn(self.command(image))
    }

    fn filesystem(&self) -> FsType {
        FsType::Squash
    }
}

/// No compression: the image is the tar stream itself
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTar;

impl Compressor for PlainTar {
    type Sink = TarFileSink;

    fn open(&self, image: &Path) -> Result<TarFileSink> {
        TarFileSink::create(image)
    }

    fn filesystem(&self) -> FsType {
        FsType::Raw
    }
}
