use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};
use xxhash_rust::xxh3::xxh3_64_with_seed;

use vigilare_core::config::{BLOOM_BITS, BLOOM_HASHES};

const SNAPSHOT_MAGIC: &[u8; 4] = b"VGBF";
const SNAPSHOT_VERSION: u32 = 1;
/// Fill ratio of the active generation that triggers rotation.
const ROTATE_FILL_RATIO: f64 = 0.5;

/// Double-buffered Bloom filter over every URL ever enqueued.
///
/// Inserts go to the active generation; lookups consult both. When the
/// active generation's fill ratio crosses `ROTATE_FILL_RATIO` it becomes the
/// previous generation and a fresh bitset takes over, so membership answers
/// degrade gradually instead of the filter saturating. Callers serialise
/// access with a single process-wide mutex.
pub struct RotationalBloom {
    bits: u64,
    hashes: u32,
    active: Generation,
    previous: Option<Generation>,
    path: PathBuf,
}

struct Generation {
    words: Vec<u64>,
    ones: u64,
}

impl Generation {
    fn new(bits: u64) -> Self {
        let words = vec![0u64; ((bits + 63) / 64) as usize];
        Self { words, ones: 0 }
    }

    fn set(&mut self, idx: u64) {
        let word = (idx / 64) as usize;
        let mask = 1u64 << (idx % 64);
        if self.words[word] & mask == 0 {
            self.words[word] |= mask;
            self.ones += 1;
        }
    }

    fn get(&self, idx: u64) -> bool {
        let word = (idx / 64) as usize;
        self.words[word] & (1u64 << (idx % 64)) != 0
    }
}

impl RotationalBloom {
    pub fn new(path: &Path) -> Self {
        Self::with_params(BLOOM_BITS, BLOOM_HASHES, path)
    }

    fn with_params(bits: u64, hashes: u32, path: &Path) -> Self {
        Self {
            bits,
            hashes,
            active: Generation::new(bits),
            previous: None,
            path: path.to_path_buf(),
        }
    }

    fn indices(&self, key: &str) -> impl Iterator<Item = u64> + '_ {
        let h1 = xxh3_64_with_seed(key.as_bytes(), 0);
        // Force h2 odd so the probe sequence covers the whole bit space.
        let h2 = xxh3_64_with_seed(key.as_bytes(), 0x9e37_79b9_7f4a_7c15) | 1;
        let bits = self.bits;
        (0..self.hashes as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % bits)
    }

    pub fn contains(&self, key: &str) -> bool {
        let in_active = self.indices(key).all(|idx| self.active.get(idx));
        if in_active {
            return true;
        }
        match &self.previous {
            Some(prev) => self.indices(key).all(|idx| prev.get(idx)),
            None => false,
        }
    }

    pub fn insert(&mut self, key: &str) {
        let indices: Vec<u64> = self.indices(key).collect();
        for idx in indices {
            self.active.set(idx);
        }
        if self.fill_ratio() > ROTATE_FILL_RATIO {
            info!(fill = self.fill_ratio(), "rotating bloom generation");
            let old = std::mem::replace(&mut self.active, Generation::new(self.bits));
            self.previous = Some(old);
        }
    }

    pub fn fill_ratio(&self) -> f64 {
        self.active.ones as f64 / self.bits as f64
    }

    /// Write both generations to the snapshot file. The write goes to a
    /// temporary sibling first and is renamed into place.
    pub fn save(&self) -> io::Result<()> {
        let tmp = self.path.with_extension("tmp");
        {
            let mut w = BufWriter::new(File::create(&tmp)?);
            w.write_all(SNAPSHOT_MAGIC)?;
            w.write_all(&SNAPSHOT_VERSION.to_le_bytes())?;
            w.write_all(&self.bits.to_le_bytes())?;
            w.write_all(&self.hashes.to_le_bytes())?;
            w.write_all(&[self.previous.is_some() as u8])?;
            write_generation(&mut w, &self.active)?;
            if let Some(prev) = &self.previous {
                write_generation(&mut w, prev)?;
            }
            w.flush()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Restore from the snapshot file if one exists; a missing or
    /// incompatible snapshot leaves the filter empty.
    pub fn load(&mut self) {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(_) => return,
        };
        match self.read_snapshot(BufReader::new(file)) {
            Ok(()) => info!(path = %self.path.display(), fill = self.fill_ratio(), "bloom snapshot loaded"),
            Err(e) => warn!(path = %self.path.display(), "bloom snapshot unreadable, starting empty: {e}"),
        }
    }

    fn read_snapshot<R: Read>(&mut self, mut r: R) -> io::Result<()> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != SNAPSHOT_MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad magic"));
        }
        let version = read_u32(&mut r)?;
        if version != SNAPSHOT_VERSION {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad version"));
        }
        let bits = read_u64(&mut r)?;
        let hashes = read_u32(&mut r)?;
        if bits != self.bits || hashes != self.hashes {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "parameter mismatch"));
        }
        let mut has_prev = [0u8; 1];
        r.read_exact(&mut has_prev)?;

        self.active = read_generation(&mut r, bits)?;
        self.previous = if has_prev[0] != 0 {
            Some(read_generation(&mut r, bits)?)
        } else {
            None
        };
        Ok(())
    }
}

fn write_generation<W: Write>(w: &mut W, generation: &Generation) -> io::Result<()> {
    w.write_all(&generation.ones.to_le_bytes())?;
    for word in &generation.words {
        w.write_all(&word.to_le_bytes())?;
    }
    Ok(())
}

fn read_generation<R: Read>(r: &mut R, bits: u64) -> io::Result<Generation> {
    let ones = read_u64(r)?;
    let word_count = ((bits + 63) / 64) as usize;
    let mut words = vec![0u64; word_count];
    let mut buf = [0u8; 8];
    for word in words.iter_mut() {
        r.read_exact(&mut buf)?;
        *word = u64::from_le_bytes(buf);
    }
    Ok(Generation { words, ones })
}

fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(r: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_contains() {
        let dir = tempfile::tempdir().unwrap();
        let mut bloom = RotationalBloom::with_params(4096, 7, &dir.path().join("bloom.bin"));
        bloom.insert("https://example.com/a");
        assert!(bloom.contains("https://example.com/a"));
        assert!(!bloom.contains("https://example.com/b"));
    }

    #[test]
    fn survives_save_load_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bloom.bin");
        let urls: Vec<String> = (0..500).map(|i| format!("https://example.com/p{i}")).collect();

        let mut bloom = RotationalBloom::with_params(1 << 16, 7, &path);
        for u in &urls {
            bloom.insert(u);
        }
        bloom.save().unwrap();

        let mut restored = RotationalBloom::with_params(1 << 16, 7, &path);
        restored.load();
        for u in &urls {
            assert!(restored.contains(u), "lost {u} across save/load");
        }
    }

    #[test]
    fn rotation_keeps_old_generation_queryable() {
        let dir = tempfile::tempdir().unwrap();
        // Tiny filter so inserts cross the rotation threshold quickly.
        let mut bloom = RotationalBloom::with_params(4096, 7, &dir.path().join("bloom.bin"));

        // Fill until the first rotation happens; these keys all live in the
        // generation that just became `previous`.
        let mut inserted = Vec::new();
        let mut i = 0;
        while bloom.previous.is_none() {
            let key = format!("url-{i}");
            bloom.insert(&key);
            inserted.push(key);
            i += 1;
        }
        // A few more go to the fresh active generation.
        for j in 0..10 {
            let key = format!("new-url-{j}");
            bloom.insert(&key);
            inserted.push(key);
        }

        for key in &inserted {
            assert!(bloom.contains(key), "lost {key} across rotation");
        }
    }

    #[test]
    fn parameter_mismatch_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bloom.bin");
        let mut bloom = RotationalBloom::with_params(4096, 7, &path);
        bloom.insert("https://example.com");
        bloom.save().unwrap();

        let mut other = RotationalBloom::with_params(8192, 7, &path);
        other.load();
        assert!(!other.contains("https://example.com"));
    }
}
