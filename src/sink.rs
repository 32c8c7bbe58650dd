//! Where completed transfers go.
//!
//! The protocol core never touches the filesystem itself.  On transfer-end
//! the receiver hands the reassembled payload to a [`StorageSink`]: text is
//! delivered whole, files as their fragments in arrival order.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::receiver::Completed;

/// Destination for completed transfers.
pub trait StorageSink {
    fn deliver_text(&mut self, text: String) -> io::Result<()>;

    /// Write `fragments` in order to the destination identified by `name`.
    fn deliver_file(&mut self, name: &str, fragments: &[Vec<u8>]) -> io::Result<()>;

    /// Route a [`Completed`] transfer to the matching method.
    fn deliver(&mut self, completed: Completed) -> io::Result<()> {
        match completed {
            Completed::Text { text, .. } => self.deliver_text(text),
            Completed::File {
                name, fragments, ..
            } => self.deliver_file(&name, &fragments),
        }
    }
}

/// One recorded delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Text(String),
    File { name: String, content: Vec<u8> },
}

/// Keeps deliveries in memory.  Clones share the same record.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    deliveries: Arc<Mutex<Vec<Delivery>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything delivered so far.
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Delivery>> {
        // A poisoned lock only means another holder panicked mid-push.
        self.deliveries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StorageSink for MemorySink {
    fn deliver_text(&mut self, text: String) -> io::Result<()> {
        self.lock().push(Delivery::Text(text));
        Ok(())
    }

    fn deliver_file(&mut self, name: &str, fragments: &[Vec<u8>]) -> io::Result<()> {
        self.lock().push(Delivery::File {
            name: name.to_owned(),
            content: fragments.concat(),
        });
        Ok(())
    }
}

/// Writes files under a fixed directory and prints text messages to a
/// console (stdout unless another writer is given).
#[derive(Debug)]
pub struct DirectorySink<W = io::Stdout> {
    root: PathBuf,
    console: W,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_console(root, io::stdout())
    }
}

impl<W: Write> DirectorySink<W> {
    pub fn with_console(root: impl Into<PathBuf>, console: W) -> Self {
        Self {
            root: root.into(),
            console,
        }
    }

    pub fn into_console(self) -> W {
        self.console
    }

    /// Destination for a declared name.  Only the final path component is
    /// used, so a peer cannot write outside `root`.
    pub fn path_for(&self, name: &str) -> io::Result<PathBuf> {
        let file_name = Path::new(name).file_name().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("unusable file name {name:?}"))
        })?;
        Ok(self.root.join(file_name))
    }
}

impl<W: Write> StorageSink for DirectorySink<W> {
    fn deliver_text(&mut self, text: String) -> io::Result<()> {
        writeln!(self.console, "Message: {text}")?;
        writeln!(self.console, "Message size: {} B", text.len())?;
        self.console.flush()
    }

    fn deliver_file(&mut self, name: &str, fragments: &[Vec<u8>]) -> io::Result<()> {
        let path = self.path_for(name)?;
        let mut file = File::create(&path)?;
        for frag in fragments {
            file.write_all(frag)?;
        }
        file.flush()?;
        let size: usize = fragments.iter().map(Vec::len).sum();
        writeln!(self.console, "Saved {} ({size} B)", path.display())?;
        self.console.flush()
    }
}
