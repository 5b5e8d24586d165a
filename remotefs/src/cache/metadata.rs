use std::fmt;

use super::paths;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FileType {
    Directory,
    File,
    EmptyFolder,
    Invalid,
    #[default]
    Nil,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Directory => "dir",
            FileType::File => "file",
            FileType::EmptyFolder => "empty",
            FileType::Invalid => "invalid",
            FileType::Nil => "nil",
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata of one remote entry. Equality only looks at path and type.
#[derive(Debug, Clone, Default)]
pub struct FileMetaData {
    path: String,
    file_type: FileType,
    size: u64,
    modified: Option<i64>,
}

impl FileMetaData {
    pub fn new(path: &str, file_type: FileType) -> Self {
        Self {
            path: paths::normalize(path),
            file_type,
            size: 0,
            modified: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn with_modified(mut self, modified: Option<i64>) -> Self {
        self.modified = modified;
        self
    }

    /// The `"."` entry a listing of `folder` uses to identify itself.
    pub fn self_entry(folder: &str) -> Self {
        Self {
            path: format!(
                "{}/{}",
                paths::normalize(folder).trim_end_matches('/'),
                paths::SELF_ENTRY_NAME
            ),
            file_type: FileType::Directory,
            size: 0,
            modified: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn file_type(&self) -> FileType {
        self.file_type
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn modified(&self) -> Option<i64> {
        self.modified
    }

    pub fn name(&self) -> &str {
        paths::file_name(&self.path)
    }

    pub fn containing_path(&self) -> String {
        paths::containing_path(&self.path)
    }

    pub fn is_self_entry(&self) -> bool {
        self.name() == paths::SELF_ENTRY_NAME
    }

    pub fn is_folder(&self) -> bool {
        self.file_type == FileType::Directory
    }

    pub fn is_file(&self) -> bool {
        self.file_type == FileType::File
    }
}

impl PartialEq for FileMetaData {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path && self.file_type == other.file_type
    }
}

impl Eq for FileMetaData {}

/// Stable handle on a cached node. Only valid while path, type and creation stamp all match the
/// live tree; a node that is deleted and re-created gets a new stamp.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileNodeRef {
    metadata: FileMetaData,
    timestamp: u64,
}

impl FileNodeRef {
    pub(crate) fn new(metadata: FileMetaData, timestamp: u64) -> Self {
        Self {
            metadata,
            timestamp,
        }
    }

    /// A handle that never matches a live node.
    pub fn nil() -> Self {
        Self::default()
    }

    pub fn metadata(&self) -> &FileMetaData {
        &self.metadata
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn path(&self) -> &str {
        self.metadata.path()
    }

    pub fn name(&self) -> &str {
        self.metadata.name()
    }

    pub fn file_type(&self) -> FileType {
        self.metadata.file_type()
    }

    pub fn size(&self) -> u64 {
        self.metadata.size()
    }

    pub fn is_nil(&self) -> bool {
        self.metadata.file_type() == FileType::Nil
    }
}
