use crate::consensus::blocks::{
    AdminBlock, DirectoryBlock, Entry, EntryBlock, EntryCreditBlock, FactoidBlock,
};
use crate::consensus::error::StorageError;
use crate::consensus::types::Hash;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Every record written for one height.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredHeight {
    pub directory_block: DirectoryBlock,
    pub admin_block: AdminBlock,
    pub factoid_block: FactoidBlock,
    pub entry_credit_block: EntryCreditBlock,
    pub entry_blocks: Vec<EntryBlock>,
    pub entries: Vec<Entry>,
}

/// Transactional block store. All multi-batch calls between
/// `start_multi_batch` and `execute_multi_batch` become visible together.
pub trait Storage: Send {
    fn start_multi_batch(&mut self);
    fn process_dblock_multi_batch(&mut self, block: &DirectoryBlock) -> Result<(), StorageError>;
    fn process_ablock_multi_batch(&mut self, block: &AdminBlock) -> Result<(), StorageError>;
    fn process_fblock_multi_batch(&mut self, block: &FactoidBlock) -> Result<(), StorageError>;
    fn process_ecblock_multi_batch(&mut self, block: &EntryCreditBlock) -> Result<(), StorageError>;
    fn process_eblock_multi_batch(&mut self, block: &EntryBlock) -> Result<(), StorageError>;
    fn insert_entry(&mut self, entry: &Entry) -> Result<(), StorageError>;
    fn execute_multi_batch(&mut self) -> Result<(), StorageError>;

    fn fetch_dblock_by_key_mr(&self, key_mr: &Hash) -> Result<Option<DirectoryBlock>, StorageError>;
    fn fetch_dbkeymr_by_height(&self, height: u32) -> Result<Option<Hash>, StorageError>;
    fn fetch_height(&self, height: u32) -> Result<Option<StoredHeight>, StorageError>;
    fn fetch_eblock_head(&self, chain_id: &Hash) -> Result<Option<EntryBlock>, StorageError>;
    fn fetch_entry(&self, hash: &Hash) -> Result<Option<Entry>, StorageError>;
    fn highest_saved_height(&self) -> Result<Option<u32>, StorageError>;

    /// Compacts storage; never removes committed heights.
    fn trim(&mut self) -> Result<(), StorageError>;
}

pub type SharedStore = Arc<Mutex<dyn Storage>>;

#[derive(Default)]
struct Batch {
    dblock: Option<DirectoryBlock>,
    ablock: Option<AdminBlock>,
    fblock: Option<FactoidBlock>,
    ecblock: Option<EntryCreditBlock>,
    eblocks: Vec<EntryBlock>,
    entries: Vec<Entry>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct ChainData {
    heights: BTreeMap<u32, StoredHeight>,
    key_mr_index: HashMap<String, u32>,
    eblock_heads: HashMap<String, EntryBlock>,
    entry_index: HashMap<String, (u32, usize)>,
}

impl ChainData {
    fn commit(&mut self, batch: Batch) -> Result<u32, StorageError> {
        let missing = |what: &str| StorageError::Database(format!("batch without {}", what));
        let dblock = batch.dblock.ok_or_else(|| missing("directory block"))?;
        let height = dblock.db_height();
        let stored = StoredHeight {
            admin_block: batch.ablock.ok_or_else(|| missing("admin block"))?,
            factoid_block: batch.fblock.ok_or_else(|| missing("factoid block"))?,
            entry_credit_block: batch.ecblock.ok_or_else(|| missing("entry credit block"))?,
            entry_blocks: batch.eblocks,
            entries: batch.entries,
            directory_block: dblock,
        };
        self.key_mr_index
            .insert(hex::encode(stored.directory_block.key_mr()), height);
        for eb in &stored.entry_blocks {
            self.eblock_heads.insert(hex::encode(eb.chain_id()), eb.clone());
        }
        for (i, e) in stored.entries.iter().enumerate() {
            self.entry_index.insert(hex::encode(e.hash()), (height, i));
        }
        self.heights.insert(height, stored);
        Ok(height)
    }

    fn dblock_by_key_mr(&self, key_mr: &Hash) -> Option<DirectoryBlock> {
        let h = self.key_mr_index.get(&hex::encode(key_mr))?;
        self.heights.get(h).map(|s| s.directory_block.clone())
    }

    fn entry(&self, hash: &Hash) -> Option<Entry> {
        let (h, i) = self.entry_index.get(&hex::encode(hash))?;
        self.heights.get(h)?.entries.get(*i).cloned()
    }
}

fn stage(batch: &mut Option<Batch>) -> Result<&mut Batch, StorageError> {
    batch.as_mut().ok_or(StorageError::NoBatch)
}

/// In-memory store; counts committed batches.
#[derive(Default)]
pub struct MemoryStore {
    data: ChainData,
    batch: Option<Batch>,
    batches_committed: u64,
    trims: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Mutex<MemoryStore>> {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn batches_committed(&self) -> u64 {
        self.batches_committed
    }

    pub fn trims(&self) -> u64 {
        self.trims
    }
}

macro_rules! batch_writers {
    () => {
        fn start_multi_batch(&mut self) {
            self.batch = Some(Batch::default());
        }

        fn process_dblock_multi_batch(&mut self, block: &DirectoryBlock) -> Result<(), StorageError> {
            stage(&mut self.batch)?.dblock = Some(block.clone());
            Ok(())
        }

        fn process_ablock_multi_batch(&mut self, block: &AdminBlock) -> Result<(), StorageError> {
            stage(&mut self.batch)?.ablock = Some(block.clone());
            Ok(())
        }

        fn process_fblock_multi_batch(&mut self, block: &FactoidBlock) -> Result<(), StorageError> {
            stage(&mut self.batch)?.fblock = Some(block.clone());
            Ok(())
        }

        fn process_ecblock_multi_batch(&mut self, block: &EntryCreditBlock) -> Result<(), StorageError> {
            stage(&mut self.batch)?.ecblock = Some(block.clone());
            Ok(())
        }

        fn process_eblock_multi_batch(&mut self, block: &EntryBlock) -> Result<(), StorageError> {
            stage(&mut self.batch)?.eblocks.push(block.clone());
            Ok(())
        }

        fn insert_entry(&mut self, entry: &Entry) -> Result<(), StorageError> {
            stage(&mut self.batch)?.entries.push(entry.clone());
            Ok(())
        }

        fn fetch_dblock_by_key_mr(&self, key_mr: &Hash) -> Result<Option<DirectoryBlock>, StorageError> {
            Ok(self.data.dblock_by_key_mr(key_mr))
        }

        fn fetch_dbkeymr_by_height(&self, height: u32) -> Result<Option<Hash>, StorageError> {
            Ok(self
                .data
                .heights
                .get(&height)
                .map(|s| s.directory_block.key_mr()))
        }

        fn fetch_height(&self, height: u32) -> Result<Option<StoredHeight>, StorageError> {
            Ok(self.data.heights.get(&height).cloned())
        }

        fn fetch_eblock_head(&self, chain_id: &Hash) -> Result<Option<EntryBlock>, StorageError> {
            Ok(self.data.eblock_heads.get(&hex::encode(chain_id)).cloned())
        }

        fn fetch_entry(&self, hash: &Hash) -> Result<Option<Entry>, StorageError> {
            Ok(self.data.entry(hash))
        }

        fn highest_saved_height(&self) -> Result<Option<u32>, StorageError> {
            Ok(self.data.heights.keys().next_back().copied())
        }
    };
}

impl Storage for MemoryStore {
    batch_writers!();

    fn execute_multi_batch(&mut self) -> Result<(), StorageError> {
        let batch = self.batch.take().ok_or(StorageError::NoBatch)?;
        self.data.commit(batch)?;
        self.batches_committed += 1;
        Ok(())
    }

    fn trim(&mut self) -> Result<(), StorageError> {
        self.trims += 1;
        Ok(())
    }
}

/// JSON file store; every committed batch rewrites the file atomically.
pub struct FileStore {
    path: PathBuf,
    data: ChainData,
    batch: Option<Batch>,
}

impl FileStore {
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, StorageError> {
        fs::create_dir_all(&data_dir)?;
        let path = data_dir.as_ref().join("chain.json");
        let data = if path.exists() {
            let bytes = fs::read(&path)?;
            serde_json::from_slice::<ChainData>(&bytes)?
        } else {
            ChainData::default()
        };
        Ok(Self {
            path,
            data,
            batch: None,
        })
    }

    fn persist(&self, pretty: bool) -> Result<(), StorageError> {
        let bytes = if pretty {
            serde_json::to_vec_pretty(&self.data)?
        } else {
            serde_json::to_vec(&self.data)?
        };
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, bytes)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

impl Storage for FileStore {
    batch_writers!();

    fn execute_multi_batch(&mut self) -> Result<(), StorageError> {
        let batch = self.batch.take().ok_or(StorageError::NoBatch)?;
        let mut next = self.data.clone();
        next.commit(batch)?;
        let prev = std::mem::replace(&mut self.data, next);
        if let Err(e) = self.persist(true) {
            self.data = prev;
            return Err(e);
        }
        Ok(())
    }

    /// Rewrites the file without pretty-printing.
    fn trim(&mut self) -> Result<(), StorageError> {
        self.persist(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn write_height(store: &mut dyn Storage, height: u32) -> Hash {
        let mut d = DirectoryBlock::new(height);
        d.build_body_mr().expect("mr");
        let entry = Entry::new_chain(vec![vec![height as u8]], b"content".to_vec());
        let mut eb = EntryBlock::new(entry.chain_id, height);
        eb.add_entry(&entry);
        store.start_multi_batch();
        store.process_ablock_multi_batch(&AdminBlock::new(height)).expect("a");
        store.process_fblock_multi_batch(&FactoidBlock::new(height, 1000)).expect("f");
        store.process_ecblock_multi_batch(&EntryCreditBlock::new(height)).expect("ec");
        store.process_eblock_multi_batch(&eb).expect("eb");
        store.insert_entry(&entry).expect("entry");
        store.process_dblock_multi_batch(&d).expect("d");
        store.execute_multi_batch().expect("commit");
        d.key_mr()
    }

    #[test]
    fn batch_is_required() {
        let mut store = MemoryStore::new();
        assert!(matches!(
            store.process_dblock_multi_batch(&DirectoryBlock::new(1)),
            Err(StorageError::NoBatch)
        ));
        assert!(matches!(store.execute_multi_batch(), Err(StorageError::NoBatch)));
    }

    #[test]
    fn incomplete_batch_is_rejected() {
        let mut store = MemoryStore::new();
        store.start_multi_batch();
        store
            .process_dblock_multi_batch(&DirectoryBlock::new(1))
            .expect("stage");
        assert!(store.execute_multi_batch().is_err());
        assert_eq!(store.highest_saved_height().expect("read"), None);
    }

    #[test]
    fn committed_height_is_fetchable() {
        let mut store = MemoryStore::new();
        let key_mr = write_height(&mut store, 3);
        assert_eq!(store.batches_committed(), 1);
        assert_eq!(store.fetch_dbkeymr_by_height(3).expect("read"), Some(key_mr));
        assert!(store.fetch_dblock_by_key_mr(&key_mr).expect("read").is_some());
        let stored = store.fetch_height(3).expect("read").expect("present");
        let entry_hash = stored.entries[0].hash();
        assert!(store.fetch_entry(&entry_hash).expect("read").is_some());
        assert!(store
            .fetch_eblock_head(&stored.entries[0].chain_id)
            .expect("read")
            .is_some());
    }

    #[test]
    fn file_store_reloads() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let dir = std::env::temp_dir().join(format!("fedchain-store-{}", nanos));
        let key_mr = {
            let mut store = FileStore::open(&dir).expect("open");
            let k = write_height(&mut store, 0);
            store.trim().expect("trim");
            k
        };
        let store = FileStore::open(&dir).expect("reopen");
        assert_eq!(store.highest_saved_height().expect("read"), Some(0));
        assert!(store.fetch_dblock_by_key_mr(&key_mr).expect("read").is_some());
        let _ = fs::remove_dir_all(&dir);
    }
}
