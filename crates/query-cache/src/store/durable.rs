//! Durable tier backed by Arrow IPC files
//!
//! Each payload is one `<fingerprint>-<generation>.arrow` file in the tier's
//! directory. Files are written to a temporary name and renamed into place,
//! so a reader never observes a partially written payload. The index lives in
//! memory only; files left behind by a previous process are removed on open.

use super::tier::{Displaced, SlotKey, StorageTier, TierKind};
use crate::error::{CacheError, CacheResult};
use crate::materializer::MaterializedRows;
use arrow::datatypes::Schema;
use arrow::ipc::reader::FileReader;
use arrow::ipc::writer::FileWriter;
use arrow::record_batch::RecordBatch;
use lru::LruCache;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

const PAYLOAD_EXTENSION: &str = "arrow";
const PARTIAL_EXTENSION: &str = "tmp";

struct DurableSlot {
    path: PathBuf,
    file_bytes: usize,
    expires_at: Option<Instant>,
}

struct DurableIndex {
    slots: LruCache<SlotKey, DurableSlot, ahash::RandomState>,
    used_bytes: usize,
}

/// File-per-entry tier with its own byte budget
pub struct DurableTier {
    dir: PathBuf,
    max_bytes: usize,
    index: Mutex<DurableIndex>,
}

impl DurableTier {
    /// Open the tier in `dir`, creating it if needed and discarding stale files
    pub fn open(dir: impl Into<PathBuf>, max_bytes: usize) -> CacheResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut removed = 0usize;
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let ours = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == PAYLOAD_EXTENSION || ext == PARTIAL_EXTENSION);
            if ours && path.is_file() {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("Removed {} stale durable cache files from {}", removed, dir.display());
        }

        Ok(Self {
            dir,
            max_bytes,
            index: Mutex::new(DurableIndex {
                slots: LruCache::unbounded_with_hasher(ahash::RandomState::new()),
                used_bytes: 0,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    fn path_for(&self, slot: &SlotKey) -> PathBuf {
        self.dir.join(format!(
            "{}-{}.{}",
            slot.key.fingerprint(),
            slot.generation,
            PAYLOAD_EXTENSION
        ))
    }

    fn write_payload(path: &Path, rows: &MaterializedRows) -> CacheResult<usize> {
        let schema = rows
            .schema()
            .unwrap_or_else(|| Arc::new(Schema::empty()));
        let partial = path.with_extension(PARTIAL_EXTENSION);

        let result = (|| -> CacheResult<()> {
            let file = File::create(&partial)?;
            let mut writer = FileWriter::try_new(BufWriter::new(file), &schema)?;
            for batch in rows.batches() {
                writer.write(batch)?;
            }
            writer.finish()?;
            let mut inner = writer.into_inner()?;
            inner.flush()?;
            Ok(())
        })();

        if let Err(err) = result {
            let _ = fs::remove_file(&partial);
            return Err(err);
        }

        fs::rename(&partial, path)?;
        Ok(fs::metadata(path)?.len() as usize)
    }

    fn read_payload(path: &Path) -> CacheResult<MaterializedRows> {
        let file = File::open(path)?;
        let reader = FileReader::try_new(BufReader::new(file), None)?;
        let batches = reader.collect::<Result<Vec<RecordBatch>, _>>()?;
        Ok(MaterializedRows::new(batches))
    }

    fn remove_file(path: &Path) {
        if let Err(err) = fs::remove_file(path) {
            warn!("Failed to remove durable cache file {}: {}", path.display(), err);
        }
    }
}

impl StorageTier for DurableTier {
    fn kind(&self) -> TierKind {
        TierKind::Durable
    }

    fn put(
        &self,
        slot: &SlotKey,
        rows: &MaterializedRows,
        expires_at: Option<Instant>,
    ) -> CacheResult<Vec<Displaced>> {
        let path = self.path_for(slot);
        let file_bytes = Self::write_payload(&path, rows)?;

        if file_bytes > self.max_bytes {
            Self::remove_file(&path);
            self.evict(slot)?;
            return Err(CacheError::CapacityExceeded {
                required: file_bytes,
                budget: self.max_bytes,
            });
        }

        let mut victims = Vec::new();
        {
            let mut index = self.index.lock();
            if let Some(previous) = index.slots.pop(slot) {
                index.used_bytes = index.used_bytes.saturating_sub(previous.file_bytes);
            }
            while index.used_bytes + file_bytes > self.max_bytes {
                let Some((victim, evicted)) = index.slots.pop_lru() else {
                    break;
                };
                index.used_bytes = index.used_bytes.saturating_sub(evicted.file_bytes);
                victims.push((victim, evicted));
            }
            index.used_bytes += file_bytes;
            index.slots.put(
                slot.clone(),
                DurableSlot {
                    path,
                    file_bytes,
                    expires_at,
                },
            );
        }

        let displaced = victims
            .into_iter()
            .map(|(victim, evicted)| {
                Self::remove_file(&evicted.path);
                Displaced {
                    slot: victim,
                    from: TierKind::Durable,
                    rows: None,
                    expires_at: evicted.expires_at,
                }
            })
            .collect();

        Ok(displaced)
    }

    fn get(&self, slot: &SlotKey) -> CacheResult<Option<MaterializedRows>> {
        let path = match self.index.lock().slots.get(slot) {
            Some(entry) => entry.path.clone(),
            None => return Ok(None),
        };
        Self::read_payload(&path).map(Some)
    }

    fn evict(&self, slot: &SlotKey) -> CacheResult<bool> {
        let evicted = {
            let mut index = self.index.lock();
            let evicted = index.slots.pop(slot);
            if let Some(entry) = &evicted {
                index.used_bytes = index.used_bytes.saturating_sub(entry.file_bytes);
            }
            evicted
        };

        match evicted {
            Some(entry) => {
                match fs::remove_file(&entry.path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn size_of(&self, slot: &SlotKey) -> Option<usize> {
        self.index.lock().slots.peek(slot).map(|entry| entry.file_bytes)
    }

    fn used_bytes(&self) -> usize {
        self.index.lock().used_bytes
    }

    fn budget_bytes(&self) -> usize {
        self.max_bytes
    }

    fn len(&self) -> usize {
        self.index.lock().slots.len()
    }
}
