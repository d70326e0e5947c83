//! The dependency database: an append-only, line-oriented file stored
//! next to an output target, holding the rule identity, tool and options
//! checksums, the primary source path, and the discovered prerequisite
//! paths.  A terminating blank line marks a successful close.
//!
//! Reading verifies the stored lines against what the rule expects; the
//! first mismatch truncates the file at that line and switches to write
//! mode, after which every expect appends.  If the whole file matches,
//! the cached prerequisite list is authoritative.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{bail, Context as _};

use crate::fs::FileTime;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Mode {
    Read,
    Write,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CloseState {
    Unchanged,
    Modified,
}

pub struct DepDb {
    path: PathBuf,
    file: File,
    mode: Mode,
    /// Stored lines, without the terminator.
    lines: Vec<String>,
    /// Byte offset of the start of each line; one extra entry for the
    /// position after the last line.
    offsets: Vec<u64>,
    /// Next line to read or verify.
    pos: usize,
    mtime: FileTime,
}

impl DepDb {
    /// Open the database, in read mode if the file exists with a valid
    /// terminator, otherwise in write mode.  An interrupted write leaves
    /// no terminator; its content is discarded.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<DepDb> {
        let path = path.into();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        let mtime = crate::fs::mtime(&path)?;

        let mut content = Vec::new();
        file.read_to_end(&mut content)
            .with_context(|| format!("read {}", path.display()))?;
        let content = match String::from_utf8(content) {
            Ok(s) => s,
            Err(_) => bail!("corrupt dependency database {}", path.display()),
        };

        let mut db = DepDb {
            path,
            file,
            mode: Mode::Write,
            lines: Vec::new(),
            offsets: vec![0],
            pos: 0,
            mtime,
        };

        if content.ends_with("\n\n") || content == "\n" {
            let body = &content[..content.len() - 1]; // drop the terminator
            let mut ofs = 0u64;
            for line in body.split_inclusive('\n') {
                let text = line.strip_suffix('\n').unwrap_or(line);
                db.lines.push(text.to_string());
                ofs += line.len() as u64;
                db.offsets.push(ofs);
            }
            db.mode = Mode::Read;
        } else if !content.is_empty() {
            db.file.set_len(0)?;
            db.file.seek(SeekFrom::Start(0))?;
        }
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn reading(&self) -> bool {
        self.mode == Mode::Read
    }

    pub fn writing(&self) -> bool {
        self.mode == Mode::Write
    }

    /// Modification time of the database file at open (or last touch).
    pub fn mtime(&self) -> FileTime {
        self.mtime
    }

    /// Whether another stored line is available, without consuming it.
    pub fn more(&self) -> bool {
        self.mode == Mode::Read && self.pos < self.lines.len()
    }

    /// The next stored line, or None to signal "no more".
    pub fn read(&mut self) -> Option<String> {
        if !self.more() {
            return None;
        }
        let l = self.lines[self.pos].clone();
        self.pos += 1;
        Some(l)
    }

    /// In read mode, compare `line` to the next stored line: on equality
    /// advance and return None; on mismatch truncate at this point,
    /// switch to write mode, append `line`, and return the offending old
    /// line (empty if the database simply ended).  In write mode, append.
    pub fn expect(&mut self, line: &str) -> anyhow::Result<Option<String>> {
        match self.mode {
            Mode::Read => {
                if self.pos < self.lines.len() && self.lines[self.pos] == line {
                    self.pos += 1;
                    Ok(None)
                } else {
                    let old = self.lines.get(self.pos).cloned().unwrap_or_default();
                    self.switch_to_write()?;
                    self.append(line)?;
                    Ok(Some(old))
                }
            }
            Mode::Write => {
                self.append(line)?;
                Ok(None)
            }
        }
    }

    /// Unconditional append (write mode only).
    pub fn write_line(&mut self, line: &str) -> anyhow::Result<()> {
        assert!(self.writing());
        self.append(line)
    }

    fn switch_to_write(&mut self) -> anyhow::Result<()> {
        let ofs = self.offsets[self.pos];
        self.file
            .set_len(ofs)
            .with_context(|| format!("truncate {}", self.path.display()))?;
        self.file.seek(SeekFrom::Start(ofs))?;
        self.lines.truncate(self.pos);
        self.offsets.truncate(self.pos + 1);
        self.mode = Mode::Write;
        Ok(())
    }

    fn append(&mut self, line: &str) -> anyhow::Result<()> {
        self.file
            .write_all(line.as_bytes())
            .and_then(|_| self.file.write_all(b"\n"))
            .with_context(|| format!("write {}", self.path.display()))?;
        self.lines.push(line.to_string());
        let last = *self.offsets.last().unwrap();
        self.offsets.push(last + line.len() as u64 + 1);
        self.pos = self.lines.len();
        Ok(())
    }

    /// Bump the file's mtime without rewriting, asserting that the cached
    /// data remains valid past a source change.
    pub fn touch(&mut self) -> anyhow::Result<()> {
        self.file
            .set_modified(SystemTime::now())
            .with_context(|| format!("touch {}", self.path.display()))?;
        self.mtime = FileTime::now();
        Ok(())
    }

    /// Finish the transaction.  A fully-matched read leaves the file
    /// untouched except for its mtime; anything else truncates unread
    /// lines, writes the terminator, and syncs.
    pub fn close(mut self) -> anyhow::Result<CloseState> {
        match self.mode {
            Mode::Read => {
                if self.pos < self.lines.len() {
                    // Cached lines beyond what this run produced are stale.
                    self.switch_to_write()?;
                    self.finish()?;
                    Ok(CloseState::Modified)
                } else {
                    self.touch()?;
                    Ok(CloseState::Unchanged)
                }
            }
            Mode::Write => {
                self.finish()?;
                Ok(CloseState::Modified)
            }
        }
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        self.file
            .write_all(b"\n")
            .and_then(|_| self.file.sync_all())
            .with_context(|| format!("write {}", self.path.display()))?;
        self.mtime = FileTime::now();
        Ok(())
    }
}
