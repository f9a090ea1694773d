use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Destination for a child's output stream.
///
/// Chunks arrive in the order the child produced them. Implementations must
/// tolerate being shared between the stdout and stderr pumps.
pub trait OutputSink: Send + Sync {
    fn append(&self, chunk: &[u8]) -> io::Result<()>;
}

fn lock<T>(mutex: &Mutex<T>) -> io::Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| io::Error::other("output sink lock poisoned"))
}

/// In-memory accumulator. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct StringSink {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl StringSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that already holds `initial`; output is appended after it.
    pub fn with_contents(initial: impl Into<String>) -> Self {
        Self {
            buf: Arc::new(Mutex::new(initial.into().into_bytes())),
        }
    }

    /// Lossy UTF-8 snapshot of everything appended so far.
    pub fn contents(&self) -> String {
        match self.buf.lock() {
            Ok(buf) => String::from_utf8_lossy(&buf).into_owned(),
            Err(poisoned) => String::from_utf8_lossy(&poisoned.into_inner()).into_owned(),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.lock().map(|buf| buf.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl OutputSink for StringSink {
    fn append(&self, chunk: &[u8]) -> io::Result<()> {
        lock(&self.buf)?.extend_from_slice(chunk);
        Ok(())
    }
}

/// Forwards output to any writer (a file, the terminal), flushing per chunk.
#[derive(Debug)]
pub struct WriterSink<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        match self.writer.into_inner() {
            Ok(writer) => writer,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<W: Write + Send> OutputSink for WriterSink<W> {
    fn append(&self, chunk: &[u8]) -> io::Result<()> {
        let mut writer = lock(&self.writer)?;
        writer.write_all(chunk)?;
        writer.flush()
    }
}

/// Appends to a file. The file is opened, and created if missing, on the
/// first chunk, so building the sink touches nothing on disk.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl OutputSink for FileSink {
    fn append(&self, chunk: &[u8]) -> io::Result<()> {
        let mut slot = lock(&self.file)?;
        if slot.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            *slot = Some(file);
        }
        if let Some(file) = slot.as_mut() {
            file.write_all(chunk)?;
            file.flush()?;
        }
        Ok(())
    }
}
