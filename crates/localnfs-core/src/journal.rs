//! Append-only journal backing durable handle mode.
//!
//! The journal lives at `<state_dir>/handles.jsonl`, one JSON record per
//! line. The first record is a header naming the volume tag and the inode
//! of the export root; the rest describe how file ids map onto
//! `(parent, name)` links. On open the journal is replayed and rewritten in
//! compacted form, so it only grows with changes made since the last start.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::attr::ObjectKind;
use crate::handle::FileId;

const JOURNAL_FILE: &str = "handles.jsonl";
const JOURNAL_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("journal {path} is corrupt at line {line}: {message}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("state directory belongs to a different export root (inode {found}, expected {expected})")]
    RootMismatch { expected: u64, found: u64 },
}

impl JournalError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// One line of the journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum JournalRecord {
    Header {
        version: u32,
        volume: u64,
        root_ino: u64,
    },
    /// `id` is reachable as `name` inside directory `parent`. A generation
    /// different from the recorded one replaces the whole record.
    Bind {
        id: FileId,
        generation: u64,
        #[serde(default)]
        incarnation: u64,
        kind: ObjectKind,
        dev: u64,
        ino: u64,
        parent: FileId,
        name: Vec<u8>,
    },
    Unlink {
        id: FileId,
        parent: FileId,
        name: Vec<u8>,
    },
    Drop {
        id: FileId,
    },
}

/// State rebuilt from the journal for a single file id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ReplayedRecord {
    pub generation: u64,
    pub incarnation: u64,
    pub kind: ObjectKind,
    pub dev: u64,
    pub ino: u64,
    pub links: Vec<(FileId, Vec<u8>)>,
}

#[derive(Debug, Default)]
pub(crate) struct Replay {
    pub volume: u64,
    pub records: BTreeMap<FileId, ReplayedRecord>,
}

impl Replay {
    fn apply(&mut self, record: JournalRecord) {
        match record {
            JournalRecord::Header { volume, .. } => self.volume = volume,
            JournalRecord::Bind {
                id,
                generation,
                incarnation,
                kind,
                dev,
                ino,
                parent,
                name,
            } => {
                let entry = self.records.entry(id).or_insert_with(|| ReplayedRecord {
                    generation,
                    incarnation,
                    kind,
                    dev,
                    ino,
                    links: Vec::new(),
                });
                if entry.generation != generation {
                    *entry = ReplayedRecord {
                        generation,
                        incarnation,
                        kind,
                        dev,
                        ino,
                        links: Vec::new(),
                    };
                }
                let link = (parent, name);
                if !entry.links.contains(&link) {
                    entry.links.push(link);
                }
            }
            JournalRecord::Unlink { id, parent, name } => {
                if let Some(entry) = self.records.get_mut(&id) {
                    entry.links.retain(|(p, n)| !(*p == parent && *n == name));
                }
            }
            JournalRecord::Drop { id } => {
                self.records.remove(&id);
            }
        }
    }
}

/// Open journal accepting appends.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    file: Mutex<File>,
}

impl Journal {
    /// Open (or create) the journal in `state_dir`, replay it, and compact
    /// it. `fresh_volume` becomes the volume tag when no journal exists yet.
    pub(crate) fn open(
        state_dir: &Path,
        root_ino: u64,
        fresh_volume: u64,
    ) -> Result<(Self, Replay), JournalError> {
        fs::create_dir_all(state_dir).map_err(|e| JournalError::io(state_dir, e))?;
        let path = state_dir.join(JOURNAL_FILE);

        let replay = match File::open(&path) {
            Ok(file) => read_journal(&path, file, root_ino, fresh_volume)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Replay {
                volume: fresh_volume,
                records: BTreeMap::new(),
            },
            Err(e) => return Err(JournalError::io(&path, e)),
        };

        compact(state_dir, &path, root_ino, &replay)?;

        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| JournalError::io(&path, e))?;
        debug!(
            path = %path.display(),
            records = replay.records.len(),
            volume = replay.volume,
            "handle journal opened"
        );
        Ok((
            Self {
                path,
                file: Mutex::new(file),
            },
            replay,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn append(&self, record: &JournalRecord) -> Result<(), JournalError> {
        let mut line =
            serde_json::to_vec(record).map_err(|e| JournalError::io(&self.path, e.into()))?;
        line.push(b'\n');
        let mut file = self.file.lock();
        file.write_all(&line)
            .map_err(|e| JournalError::io(&self.path, e))
    }

    /// Flush appended records to stable storage.
    pub fn sync(&self) -> Result<(), JournalError> {
        self.file
            .lock()
            .sync_data()
            .map_err(|e| JournalError::io(&self.path, e))
    }
}

fn read_journal(
    path: &Path,
    file: File,
    root_ino: u64,
    fresh_volume: u64,
) -> Result<Replay, JournalError> {
    let mut replay = Replay {
        volume: fresh_volume,
        records: BTreeMap::new(),
    };
    let lines: Vec<String> = BufReader::new(file)
        .lines()
        .collect::<Result<_, _>>()
        .map_err(|e| JournalError::io(path, e))?;
    let last = lines.len();

    for (index, line) in lines.into_iter().enumerate() {
        let line_no = index + 1;
        if line.trim().is_empty() {
            continue;
        }
        let record: JournalRecord = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(e) if line_no == last => {
                // Torn final write from a crash; everything before it is intact.
                warn!(path = %path.display(), line = line_no, error = %e, "dropping torn journal record");
                break;
            }
            Err(e) => {
                return Err(JournalError::Corrupt {
                    path: path.to_path_buf(),
                    line: line_no,
                    message: e.to_string(),
                });
            }
        };

        match (&record, line_no) {
            (JournalRecord::Header { version, root_ino: found, .. }, 1) => {
                if *version != JOURNAL_VERSION {
                    return Err(JournalError::Corrupt {
                        path: path.to_path_buf(),
                        line: line_no,
                        message: format!("unsupported journal version {version}"),
                    });
                }
                if *found != root_ino {
                    return Err(JournalError::RootMismatch {
                        expected: root_ino,
                        found: *found,
                    });
                }
            }
            (JournalRecord::Header { .. }, _) | (_, 1) => {
                return Err(JournalError::Corrupt {
                    path: path.to_path_buf(),
                    line: line_no,
                    message: "header must be the first record".to_string(),
                });
            }
            _ => {}
        }
        replay.apply(record);
    }
    Ok(replay)
}

fn compact(
    state_dir: &Path,
    path: &Path,
    root_ino: u64,
    replay: &Replay,
) -> Result<(), JournalError> {
    let mut tmp =
        tempfile::NamedTempFile::new_in(state_dir).map_err(|e| JournalError::io(state_dir, e))?;
    {
        let mut out = io::BufWriter::new(tmp.as_file_mut());
        let mut write = |record: &JournalRecord| -> io::Result<()> {
            serde_json::to_writer(&mut out, record)?;
            out.write_all(b"\n")
        };
        write(&JournalRecord::Header {
            version: JOURNAL_VERSION,
            volume: replay.volume,
            root_ino,
        })
        .map_err(|e| JournalError::io(path, e))?;
        for (id, record) in &replay.records {
            for (parent, name) in &record.links {
                write(&JournalRecord::Bind {
                    id: *id,
                    generation: record.generation,
                    incarnation: record.incarnation,
                    kind: record.kind,
                    dev: record.dev,
                    ino: record.ino,
                    parent: *parent,
                    name: name.clone(),
                })
                .map_err(|e| JournalError::io(path, e))?;
            }
        }
        out.flush().map_err(|e| JournalError::io(path, e))?;
    }
    tmp.as_file()
        .sync_all()
        .map_err(|e| JournalError::io(path, e))?;
    tmp.persist(path)
        .map_err(|e| JournalError::io(path, e.error))?;
    Ok(())
}
