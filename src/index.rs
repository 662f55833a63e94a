//! Blocklist membership index.
//!
//! A `MembershipIndex` is built once from the blocklist sources (or read
//! back from a snapshot) and is immutable afterwards, so any number of
//! query handlers can read it at the same time. Reloading builds a new
//! index and swaps it into the shared `ActiveIndex`.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::{ArcSwap, Guard};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::bloom::{BloomFilter, BloomParams};
use crate::config::ServerConfig;
use crate::errors::DnsError;
use crate::normalize::{extract_domain, is_placeholder, normalize, NormalizedName};

/// First bytes of every snapshot file.
const SNAPSHOT_MAGIC: &[u8; 8] = b"SNKIDX\0\x01";

/// Bumped whenever the body layout or hashing scheme changes.
const SNAPSHOT_VERSION: u16 = 1;

const DIGEST_LEN: usize = 32;

/// How often a build reports progress.
const PROGRESS_EVERY: usize = 50_000;

/// Probabilistic set of blocked domain names.
#[derive(Debug, Clone)]
pub struct MembershipIndex {
    filter: BloomFilter,
    capacity: usize,
    target_fpr: f64,
}

#[derive(Serialize, Deserialize)]
struct SnapshotBody {
    version: u16,
    capacity: u64,
    target_fpr: f64,
    hash_count: u32,
    size_bits: u64,
    inserted: u64,
    bits: Vec<u8>,
}

impl MembershipIndex {
    /// Build an index holding every entry.
    ///
    /// # Arguments
    /// * `entries` - Normalized names to insert.
    /// * `capacity` - Expected number of entries, used to size the filter.
    /// * `false_positive_rate` - Target rate at `capacity` entries.
    ///
    /// # Returns
    /// The built index, or `IndexBuild` when the parameters are unusable.
    pub fn build<I>(entries: I, capacity: usize, false_positive_rate: f64) -> Result<Self, DnsError>
    where
        I: IntoIterator<Item = NormalizedName>,
    {
        let params = BloomParams::optimal(capacity, false_positive_rate)?;
        let mut filter = BloomFilter::new(params);

        for (count, entry) in entries.into_iter().enumerate() {
            filter.insert(entry.as_str().as_bytes());
            if (count + 1) % PROGRESS_EVERY == 0 {
                info!("Processed {} entries...", count + 1);
            }
        }

        Ok(Self {
            filter,
            capacity,
            target_fpr: false_positive_rate,
        })
    }

    /// An index that blocks nothing.
    pub fn empty() -> Self {
        Self {
            filter: BloomFilter::new(BloomParams {
                size_bits: 8,
                hash_count: 1,
            }),
            capacity: 0,
            target_fpr: 0.0,
        }
    }

    /// Exact-name membership test. May yield false positives, never false negatives.
    pub fn contains(&self, name: &str) -> bool {
        self.filter.contains(name.as_bytes())
    }

    /// Walk the name and its parent suffixes, returning the first one in the index.
    ///
    /// `a.b.blocked.com` tests `a.b.blocked.com`, `b.blocked.com`,
    /// `blocked.com` and `com`, in that order.
    pub fn matching_suffix<'a>(&self, name: &'a str) -> Option<&'a str> {
        let mut current = name;
        while !current.is_empty() {
            if self.contains(current) {
                return Some(current);
            }
            match current.find('.') {
                Some(dot) => current = &current[dot + 1..],
                None => break,
            }
        }
        None
    }

    /// Ladder test for a query name.
    pub fn is_blocked(&self, name: &NormalizedName) -> bool {
        self.matching_suffix(name.as_str()).is_some()
    }

    /// Number of entries inserted when the index was built.
    pub fn len(&self) -> usize {
        self.filter.elements_inserted() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Target false-positive rate the index was sized for.
    pub fn false_positive_rate(&self) -> f64 {
        self.target_fpr
    }

    /// Estimated false-positive rate at the current load.
    pub fn estimated_false_positive_rate(&self) -> f64 {
        self.filter.false_positive_rate()
    }

    /// Size of the bit array in bytes.
    pub fn memory_bytes(&self) -> usize {
        self.filter.as_raw_bytes().len()
    }

    /// Serialize the index into the snapshot format.
    pub fn to_snapshot(&self) -> Result<Vec<u8>, DnsError> {
        let body = SnapshotBody {
            version: SNAPSHOT_VERSION,
            capacity: self.capacity as u64,
            target_fpr: self.target_fpr,
            hash_count: self.filter.hash_count(),
            size_bits: self.filter.size_bits(),
            inserted: self.filter.elements_inserted(),
            bits: self.filter.as_raw_bytes().to_vec(),
        };
        let encoded = bincode::serialize(&body)
            .map_err(|e| DnsError::IndexBuild(format!("snapshot encoding failed: {e}")))?;

        let mut out = Vec::with_capacity(SNAPSHOT_MAGIC.len() + encoded.len() + DIGEST_LEN);
        out.extend_from_slice(SNAPSHOT_MAGIC);
        out.extend_from_slice(&encoded);
        out.extend_from_slice(&Sha256::digest(&encoded));
        Ok(out)
    }

    /// Restore an index from snapshot bytes.
    ///
    /// Anything that does not describe exactly one valid index fails with
    /// `SnapshotCorrupt`; there is no partial or empty fallback here.
    pub fn from_snapshot(bytes: &[u8]) -> Result<Self, DnsError> {
        let corrupt = |why: &str| DnsError::SnapshotCorrupt(why.to_string());

        if bytes.len() < SNAPSHOT_MAGIC.len() + DIGEST_LEN {
            return Err(corrupt("file too short"));
        }
        let (magic, rest) = bytes.split_at(SNAPSHOT_MAGIC.len());
        if magic != SNAPSHOT_MAGIC {
            return Err(corrupt("bad magic"));
        }
        let (encoded, digest) = rest.split_at(rest.len() - DIGEST_LEN);
        if Sha256::digest(encoded).as_slice() != digest {
            return Err(corrupt("checksum mismatch"));
        }

        let body: SnapshotBody = bincode::deserialize(encoded)
            .map_err(|e| DnsError::SnapshotCorrupt(format!("undecodable body: {e}")))?;
        if body.version != SNAPSHOT_VERSION {
            return Err(DnsError::SnapshotCorrupt(format!(
                "unsupported version {} (expected {SNAPSHOT_VERSION})",
                body.version
            )));
        }
        if !(body.target_fpr >= 0.0 && body.target_fpr < 1.0) {
            return Err(corrupt("false positive rate out of range"));
        }

        let filter =
            BloomFilter::from_raw_parts(body.bits, body.size_bits, body.hash_count, body.inserted)
                .ok_or_else(|| corrupt("bit array does not match its parameters"))?;

        Ok(Self {
            filter,
            capacity: body.capacity as usize,
            target_fpr: body.target_fpr,
        })
    }

    /// Persist the snapshot, replacing any previous file atomically.
    pub fn save_snapshot_file(&self, path: &Path) -> Result<(), DnsError> {
        let bytes = self.to_snapshot()?;
        let tmp = temp_path(path);
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        info!("Saved index snapshot to {}", path.display());
        Ok(())
    }

    /// Read a snapshot file.
    ///
    /// # Returns
    /// `Ok(None)` when no snapshot exists, `Err(SnapshotCorrupt)` when one
    /// exists but is unusable.
    pub fn load_snapshot_file(path: &Path) -> Result<Option<Self>, DnsError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Self::from_snapshot(&bytes).map(Some)
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Read and normalize every entry of one blocklist file.
fn read_source(path: &Path, entries: &mut Vec<NormalizedName>) -> io::Result<usize> {
    let reader = BufReader::new(File::open(path)?);
    let before = entries.len();
    for line in reader.split(b'\n') {
        let line = line?;
        let line = String::from_utf8_lossy(&line);
        if let Some(token) = extract_domain(&line) {
            let name = normalize(token);
            if !name.is_empty() && !is_placeholder(&name) {
                entries.push(name);
            }
        }
    }
    Ok(entries.len() - before)
}

/// Build an index from local blocklist files.
///
/// Unreadable sources are logged and skipped. The build fails only if no
/// source could be read at all. When the sources hold more entries than
/// `capacity`, the index is sized for the actual count instead.
pub fn build_from_sources(
    sources: &[PathBuf],
    capacity: usize,
    false_positive_rate: f64,
) -> Result<MembershipIndex, DnsError> {
    if sources.is_empty() {
        return Err(DnsError::IndexBuild("no blocklist sources configured".into()));
    }

    let started = Instant::now();
    let mut entries = Vec::new();
    let mut readable = 0;
    for source in sources {
        match read_source(source, &mut entries) {
            Ok(count) => {
                readable += 1;
                info!("Read {} entries from {}", count, source.display());
            }
            Err(e) => error!("Failed to read blocklist {}: {}", source.display(), e),
        }
    }
    if readable == 0 {
        return Err(DnsError::IndexBuild("no blocklist source could be read".into()));
    }

    let sized_for = if entries.len() > capacity {
        warn!(
            "Blocklists hold {} entries, more than the configured capacity {}; sizing for the actual count",
            entries.len(),
            capacity
        );
        entries.len()
    } else {
        capacity
    };

    let count = entries.len();
    let index = MembershipIndex::build(entries, sized_for, false_positive_rate)?;
    info!(
        "Loaded {} entries in {:.2} seconds ({:.2} MB index)",
        count,
        started.elapsed().as_secs_f64(),
        index.memory_bytes() as f64 / (1024.0 * 1024.0)
    );
    Ok(index)
}

/// Produce the index the server starts with.
///
/// Snapshot first, then a fresh build (saved as the new snapshot). If
/// neither works the server starts with an empty index, unless
/// `fail_closed` is set.
pub fn load_or_build(config: &ServerConfig) -> Result<MembershipIndex, DnsError> {
    match MembershipIndex::load_snapshot_file(&config.snapshot_path) {
        Ok(Some(index)) => {
            info!(
                "Loaded index snapshot from {} (~{} entries)",
                config.snapshot_path.display(),
                index.len()
            );
            return Ok(index);
        }
        Ok(None) => warn!("No saved index snapshot found at {}", config.snapshot_path.display()),
        Err(e) => error!("Ignoring index snapshot {}: {}", config.snapshot_path.display(), e),
    }

    match rebuild(config) {
        Ok(index) => Ok(index),
        Err(e) if config.fail_closed => Err(e),
        Err(e) => {
            error!("{}; serving with an empty blocklist", e);
            Ok(MembershipIndex::empty())
        }
    }
}

/// Build from the configured sources and persist the result.
///
/// A failed snapshot write is logged; the built index is still returned.
pub fn rebuild(config: &ServerConfig) -> Result<MembershipIndex, DnsError> {
    let index = build_from_sources(&config.blocklist_files, config.index_capacity, config.index_fpr)?;
    if let Err(e) = index.save_snapshot_file(&config.snapshot_path) {
        error!("Failed to save index snapshot: {}", e);
    }
    Ok(index)
}

/// The index currently used for serving.
///
/// Readers get a consistent snapshot; `replace` swaps in a fully built
/// index without readers ever seeing a partial one.
pub struct ActiveIndex {
    current: ArcSwap<MembershipIndex>,
}

impl ActiveIndex {
    pub fn new(index: MembershipIndex) -> Self {
        Self {
            current: ArcSwap::from_pointee(index),
        }
    }

    pub fn load(&self) -> Guard<Arc<MembershipIndex>> {
        self.current.load()
    }

    /// Swap in a new index, returning the previous one.
    pub fn replace(&self, index: MembershipIndex) -> Arc<MembershipIndex> {
        self.current.swap(Arc::new(index))
    }
}
