//! # pc-storage
//!
//! why: keep the last primary view across restarts so a node can rejoin with its history
//! relations: feeds pc-core ProtocolCore::new with a restored view, updated on every delivered view
//! what: ViewStore trait, FileViewStore implementation, InMemoryViewStore for testing

use pc_core::{Action, NodeId, PcView};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use tracing::debug;

/// what a node persists about its membership
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedState {
    /// identity the node had when the view was saved
    pub my_id: NodeId,
    /// last primary-component view the node delivered
    pub view: PcView,
}

impl SavedState {
    pub fn new(my_id: NodeId, view: PcView) -> Self {
        Self { my_id, view }
    }

    /// the view to seed a restarting node with, only if it was primary
    pub fn restored_view(&self) -> Option<PcView> {
        self.view.is_primary().then(|| self.view.clone())
    }
}

/// trait for durable storage of the last primary view
///
/// this abstraction allows the same code to work with:
/// - real filesystem (native)
/// - in-memory (testing)
pub trait ViewStore {
    /// persist the saved state, replacing any previous one
    fn save(&mut self, state: &SavedState) -> io::Result<()>;

    /// load the saved state, `None` for a node that never saved one
    fn load(&self) -> io::Result<Option<SavedState>>;

    /// forget the saved state
    fn clear(&mut self) -> io::Result<()>;
}

/// save every primary view delivered in `actions`
///
/// non-primary views are skipped so a restart still sees the last primary one.
/// returns how many views were written.
pub fn persist_views(
    store: &mut impl ViewStore,
    my_id: NodeId,
    actions: &[Action],
) -> io::Result<usize> {
    let mut saved = 0;
    for action in actions {
        if let Action::DeliverView(view) = action {
            if view.is_primary() {
                store.save(&SavedState::new(my_id, view.clone()))?;
                saved += 1;
            }
        }
    }
    Ok(saved)
}

/// the view a restarting node should be seeded with
///
/// a state saved under another identity is ignored.
pub fn restore(store: &impl ViewStore, my_id: NodeId) -> io::Result<Option<PcView>> {
    Ok(store
        .load()?
        .filter(|state| state.my_id == my_id)
        .and_then(|state| state.restored_view()))
}

// -- file storage implementation --

/// file-based view store using std::fs
///
/// stores the state in a directory as pcview.json
pub struct FileViewStore {
    /// directory path for storing the state file
    dir: PathBuf,
}

impl FileViewStore {
    /// create a new store at the given directory
    /// creates the directory if it doesn't exist
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// get the path to the state file
    pub fn path(&self) -> PathBuf {
        self.dir.join("pcview.json")
    }
}

impl ViewStore for FileViewStore {
    fn save(&mut self, state: &SavedState) -> io::Result<()> {
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        // atomic write: write to temp file then rename
        let temp_path = self.dir.join("pcview.tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, self.path())?;

        debug!(view = %state.view, path = %self.path().display(), "saved view");
        Ok(())
    }

    fn load(&self) -> io::Result<Option<SavedState>> {
        let path = self.path();
        if !path.exists() {
            return Ok(None);
        }

        let mut file = File::open(&path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        let state: SavedState = serde_json::from_str(&contents)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some(state))
    }

    fn clear(&mut self) -> io::Result<()> {
        match fs::remove_file(self.path()) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

// -- in-memory storage implementation --

/// in-memory view store for testing
///
/// keeps the state in memory, no persistence across restarts
#[derive(Debug, Default)]
pub struct InMemoryViewStore {
    state: Option<SavedState>,
}

impl InMemoryViewStore {
    /// create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }
}

impl ViewStore for InMemoryViewStore {
    fn save(&mut self, state: &SavedState) -> io::Result<()> {
        self.state = Some(state.clone());
        Ok(())
    }

    fn load(&self) -> io::Result<Option<SavedState>> {
        Ok(self.state.clone())
    }

    fn clear(&mut self) -> io::Result<()> {
        self.state = None;
        Ok(())
    }
}
