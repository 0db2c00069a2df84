use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use bytes::BytesMut;
use tracing::debug;

use super::Record;

/// An append-only binary journal sharded across `shards` files. The file
/// for job `id` is file `id mod shards`; each file has a single writer (the
/// engine, serialized by its own lock), so no locking is needed here.
pub struct WalWriter {
    dir: PathBuf,
    files: Vec<File>,
}

impl WalWriter {
    /// Opens (creating if necessary) `shards` append-only files under
    /// `dir`, for normal operation where existing content should be kept.
    pub fn open(dir: &Path, shards: usize) -> io::Result<Self> {
        fs::create_dir_all(dir)?;

        let files = (0..shards)
            .map(|i| {
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(shard_path(dir, i))
            })
            .collect::<io::Result<Vec<_>>>()?;

        Ok(Self {
            dir: dir.to_path_buf(),
            files,
        })
    }

    /// Truncates every shard file to empty and opens fresh handles onto
    /// them — used after recovery (§4.6 step 5) once the recovered jobs
    /// have been folded into memory and are about to be re-persisted as
    /// self-sufficient full records.
    pub fn rotate(dir: &Path, shards: usize) -> io::Result<Self> {
        fs::create_dir_all(dir)?;

        let files = (0..shards)
            .map(|i| {
                OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(shard_path(dir, i))
            })
            .collect::<io::Result<Vec<_>>>()?;

        debug!(shards, dir = %dir.display(), "rotated WAL files");

        Ok(Self {
            dir: dir.to_path_buf(),
            files,
        })
    }

    pub fn shards(&self) -> usize {
        self.files.len()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn append(&mut self, record: &Record) -> io::Result<()> {
        let shard = (record.id % self.files.len() as u64) as usize;

        let mut buf = BytesMut::new();
        record.encode(&mut buf);

        self.files[shard].write_all(&buf)
    }
}

pub fn shard_path(dir: &Path, shard: usize) -> PathBuf {
    dir.join(format!("wal-{shard}.bin"))
}
