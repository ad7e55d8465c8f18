//! The input tree (spec §3.1, §6.1): an ordered rose tree of directories,
//! regular files and symlinks, walked once in pre-order during `commit()`
//! and streamed once in `start`-order during `compile()`.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::error::{CompileError, Result};

pub const ROOT: usize = 0;

/// Where a symlink's target bytes come from. Both forms are exposed through
/// the same `symlink_target`/reader pair described in spec §6.1.
pub enum SymlinkSource {
    /// The target is already known; no stream is needed.
    Cached(String),
    /// The target must be read from a stream (used for long targets).
    Reader(Box<dyn Read>, u64),
}

enum Kind {
    Directory { children: Vec<usize> },
    File {
        size: u64,
        reader: Option<Box<dyn Read>>,
    },
    Symlink {
        size: u64,
        cached_target: Option<String>,
        reader: Option<Box<dyn Read>>,
    },
}

struct Slot {
    name: String,
    modified: DateTime<Utc>,
    parent: usize,
    kind: Kind,
}

/// A lazily-read, single-consumption file tree. Handles are opened on first
/// read and closed as they're consumed; the tree owns them until then.
pub struct FileTree {
    nodes: Vec<Slot>,
    paths: HashMap<String, usize>,
}

impl Default for FileTree {
    fn default() -> Self {
        Self::new()
    }
}

impl FileTree {
    pub fn new() -> Self {
        let root = Slot {
            name: String::new(),
            modified: Utc::now(),
            parent: ROOT,
            kind: Kind::Directory { children: Vec::new() },
        };
        let mut paths = HashMap::new();
        paths.insert(String::new(), ROOT);
        Self { nodes: vec![root], paths }
    }

    fn normalize(path: &Path) -> String {
        path.to_string_lossy()
            .trim_matches('/')
            .to_string()
    }

    fn parent_key(key: &str) -> String {
        match key.rsplit_once('/') {
            Some((parent, _)) => parent.to_string(),
            None => String::new(),
        }
    }

    fn base_name(key: &str) -> &str {
        match key.rsplit_once('/') {
            Some((_, name)) => name,
            None => key,
        }
    }

    /// Creates every missing directory component of `path`, returning the
    /// index of the leaf directory.
    pub fn mkdir(&mut self, path: &Path) -> Result<usize> {
        let key = Self::normalize(path);
        if key.is_empty() {
            return Ok(ROOT);
        }
        let mut cursor = String::new();
        let mut parent_idx = ROOT;
        for component in key.split('/') {
            if !cursor.is_empty() {
                cursor.push('/');
            }
            cursor.push_str(component);
            if let Some(&idx) = self.paths.get(&cursor) {
                match &self.nodes[idx].kind {
                    Kind::Directory { .. } => {
                        parent_idx = idx;
                        continue;
                    }
                    _ => {
                        return Err(CompileError::CorruptInput(format!(
                            "{cursor} already exists and is not a directory"
                        )))
                    }
                }
            }
            let idx = self.nodes.len();
            self.nodes.push(Slot {
                name: component.to_string(),
                modified: Utc::now(),
                parent: parent_idx,
                kind: Kind::Directory { children: Vec::new() },
            });
            self.paths.insert(cursor.clone(), idx);
            self.push_child(parent_idx, idx);
            parent_idx = idx;
        }
        Ok(parent_idx)
    }

    fn push_child(&mut self, parent: usize, child: usize) {
        match &mut self.nodes[parent].kind {
            Kind::Directory { children } => children.push(child),
            _ => unreachable!("parent slot must be a directory"),
        }
    }

    fn insert_leaf(&mut self, path: &Path, kind: Kind, modified: DateTime<Utc>) -> Result<usize> {
        let key = Self::normalize(path);
        if key.is_empty() {
            return Err(CompileError::CorruptInput("empty path".into()));
        }
        if self.paths.contains_key(&key) {
            return Err(CompileError::CorruptInput(format!("{key} already exists")));
        }
        let parent_key = Self::parent_key(&key);
        let parent_idx = self.mkdir(Path::new(&parent_key))?;
        let idx = self.nodes.len();
        self.nodes.push(Slot {
            name: Self::base_name(&key).to_string(),
            modified,
            parent: parent_idx,
            kind,
        });
        self.paths.insert(key, idx);
        self.push_child(parent_idx, idx);
        Ok(idx)
    }

    pub fn add_file(
        &mut self,
        path: &Path,
        reader: Box<dyn Read>,
        size: u64,
        modified: DateTime<Utc>,
    ) -> Result<usize> {
        self.insert_leaf(
            path,
            Kind::File { size, reader: Some(reader) },
            modified,
        )
    }

    pub fn add_symlink(
        &mut self,
        path: &Path,
        source: SymlinkSource,
        modified: DateTime<Utc>,
    ) -> Result<usize> {
        let (size, cached_target, reader) = match source {
            SymlinkSource::Cached(target) => (target.len() as u64, Some(target), None),
            SymlinkSource::Reader(r, size) => (size, None, Some(r)),
        };
        self.insert_leaf(
            path,
            Kind::Symlink { size, cached_target, reader },
            modified,
        )
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn name(&self, idx: usize) -> &str {
        &self.nodes[idx].name
    }

    pub fn modified(&self, idx: usize) -> DateTime<Utc> {
        self.nodes[idx].modified
    }

    pub fn parent(&self, idx: usize) -> usize {
        self.nodes[idx].parent
    }

    pub fn children(&self, idx: usize) -> &[usize] {
        match &self.nodes[idx].kind {
            Kind::Directory { children } => children,
            _ => &[],
        }
    }

    pub fn is_dir(&self, idx: usize) -> bool {
        matches!(self.nodes[idx].kind, Kind::Directory { .. })
    }

    pub fn is_symlink(&self, idx: usize) -> bool {
        matches!(self.nodes[idx].kind, Kind::Symlink { .. })
    }

    pub fn size(&self, idx: usize) -> u64 {
        match &self.nodes[idx].kind {
            Kind::Directory { .. } => 0,
            Kind::File { size, .. } => *size,
            Kind::Symlink { size, .. } => *size,
        }
    }

    pub fn symlink_is_cached(&self, idx: usize) -> bool {
        matches!(
            &self.nodes[idx].kind,
            Kind::Symlink { cached_target: Some(_), .. }
        )
    }

    pub fn symlink_target_cached(&self, idx: usize) -> Option<&str> {
        match &self.nodes[idx].kind {
            Kind::Symlink { cached_target, .. } => cached_target.as_deref(),
            _ => None,
        }
    }

    /// Opens the node's byte stream, consuming it. Directories have no
    /// stream. A cached symlink without an explicit reader is served from
    /// its cached target bytes.
    pub fn open_reader(&mut self, idx: usize) -> Result<Box<dyn Read>> {
        match &mut self.nodes[idx].kind {
            Kind::Directory { .. } => Err(CompileError::CorruptInput(
                "directories have no byte stream".into(),
            )),
            Kind::File { reader, .. } => reader.take().ok_or_else(|| {
                CompileError::CorruptInput("file stream already consumed".into())
            }),
            Kind::Symlink { reader, cached_target, .. } => {
                if let Some(r) = reader.take() {
                    return Ok(r);
                }
                if let Some(target) = cached_target.clone() {
                    return Ok(Box::new(Cursor::new(target.into_bytes())));
                }
                Err(CompileError::CorruptInput(
                    "symlink stream already consumed".into(),
                ))
            }
        }
    }

    /// Drops any handle still held by this node.
    pub fn close(&mut self, idx: usize) {
        match &mut self.nodes[idx].kind {
            Kind::File { reader, .. } => *reader = None,
            Kind::Symlink { reader, .. } => *reader = None,
            Kind::Directory { .. } => {}
        }
    }

    /// Pre-order walk: every node index, parent before children, in
    /// insertion order among siblings (spec §4.3).
    pub fn walk_preorder(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![ROOT];
        while let Some(idx) = stack.pop() {
            out.push(idx);
            if let Kind::Directory { children } = &self.nodes[idx].kind {
                for &c in children.iter().rev() {
                    stack.push(c);
                }
            }
        }
        out
    }
}
