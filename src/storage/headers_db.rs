//! Flat file of block headers
//!
//! The header at height `h` is stored at byte offset `80 * h`. The file may only grow at the
//! end or be truncated; it is never rewritten in place.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bitcoin::block::Header;
use bitcoin::consensus;
use tracing::{debug, info, warn};

use crate::errors::{WalletError, WalletResult};
use crate::storage::quarantine_file;

/// Size of one serialized header record.
pub const HEADER_SIZE: u64 = 80;

/// File backed header store.
#[derive(Debug)]
pub struct HeadersDb {
    file: File,
    path: PathBuf,
    tip: i32,
}

impl HeadersDb {
    /// Opens or creates the file. Fails with [`WalletError::Corruption`] if the file size is not a
    /// multiple of the record size. Trailing all-zero records left by an interrupted write are
    /// truncated.
    pub fn open(path: impl AsRef<Path>) -> WalletResult<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        if len % HEADER_SIZE != 0 {
            return Err(WalletError::Corruption(format!(
                "{}: size {len} is not a multiple of {HEADER_SIZE}",
                path.display()
            )));
        }
        let tip = i32::try_from(len / HEADER_SIZE)
            .map_err(|_| WalletError::Corruption(format!("{}: too large", path.display())))?
            - 1;
        let mut db = Self {
            file,
            path: path.to_path_buf(),
            tip,
        };
        db.prune_zero_tail()?;
        info!(path = %path.display(), tip = db.tip, "opened headers file");
        Ok(db)
    }

    fn prune_zero_tail(&mut self) -> WalletResult<()> {
        let original_tip = self.tip;
        while self.tip >= 0 {
            let record = self.read_record(self.tip)?;
            if record.iter().any(|b| *b != 0) {
                break;
            }
            self.tip -= 1;
        }
        if self.tip != original_tip {
            warn!(
                from = original_tip,
                to = self.tip,
                "pruned empty header records"
            );
            self.file.set_len(Self::offset(self.tip + 1))?;
        }
        Ok(())
    }

    fn offset(height: i32) -> u64 {
        u64::try_from(height).unwrap_or(0) * HEADER_SIZE
    }

    fn read_record(&self, height: i32) -> WalletResult<[u8; HEADER_SIZE as usize]> {
        let mut record = [0u8; HEADER_SIZE as usize];
        let mut file = &self.file;
        file.seek(SeekFrom::Start(Self::offset(height)))?;
        file.read_exact(&mut record)?;
        Ok(record)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Height of the last stored header, -1 if the file is empty.
    pub fn tip(&self) -> i32 {
        self.tip
    }

    /// The header at `height`, or `None` if it is not stored.
    pub fn header_by_height(&self, height: i32) -> WalletResult<Option<Header>> {
        if height < 0 || height > self.tip {
            return Ok(None);
        }
        let record = self.read_record(height)?;
        let header = consensus::deserialize(&record).map_err(|e| {
            WalletError::Corruption(format!("header at {height} is unreadable: {e}"))
        })?;
        Ok(Some(header))
    }

    /// Stores `header` at `height`, which must be at most one above the current tip.
    pub fn put_header(&mut self, height: i32, header: &Header) -> WalletResult<()> {
        if height < 0 || height > self.tip + 1 {
            return Err(WalletError::invalid_argument(
                "height",
                format!("cannot put header {height} on tip {}", self.tip),
            ));
        }
        let bytes = consensus::serialize(header);
        self.file.seek(SeekFrom::Start(Self::offset(height)))?;
        self.file.write_all(&bytes)?;
        if height > self.tip {
            self.tip = height;
        }
        Ok(())
    }

    /// Drops every header above `height`. `-1` empties the file.
    pub fn revert_to(&mut self, height: i32) -> WalletResult<()> {
        let height = height.max(-1);
        if height >= self.tip {
            return Ok(());
        }
        debug!(from = self.tip, to = height, "reverting headers");
        self.file.set_len(Self::offset(height + 1))?;
        self.tip = height;
        Ok(())
    }

    pub fn flush(&mut self) -> WalletResult<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}

/// Opens the headers file, moving a corrupt one aside and starting empty if needed.
pub fn open_or_quarantine(path: &Path) -> WalletResult<HeadersDb> {
    match HeadersDb::open(path) {
        Err(err) if err.is_corruption() => {
            warn!(path = %path.display(), error = %err, "headers file is corrupt");
            quarantine_file(path)?;
            HeadersDb::open(path)
        }
        other => other,
    }
}
