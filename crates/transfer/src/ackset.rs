/// Bitmap of acknowledged chunk indices with an incrementally maintained
/// resumption cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckSet {
    words: Vec<u64>,
    total: u64,
    count: u64,
    cursor: u64,
}

impl AckSet {
    pub fn new(total: u64) -> Self {
        Self {
            words: vec![0; total.div_ceil(64) as usize],
            total,
            count: 0,
            cursor: 0,
        }
    }

    /// Creates a set in which every index below `cursor` is acknowledged.
    pub fn with_prefix(total: u64, cursor: u64) -> Self {
        let mut set = Self::new(total);
        for index in 0..cursor.min(total) {
            set.insert(index);
        }
        set
    }

    /// Marks `index` as acknowledged. Returns `false` if it already was or
    /// if it is out of range.
    pub fn insert(&mut self, index: u64) -> bool {
        if index >= self.total || self.contains(index) {
            return false;
        }
        self.words[(index / 64) as usize] |= 1 << (index % 64);
        self.count += 1;
        while self.cursor < self.total && self.contains(self.cursor) {
            self.cursor += 1;
        }
        true
    }

    pub fn contains(&self, index: u64) -> bool {
        index < self.total && self.words[(index / 64) as usize] & (1 << (index % 64)) != 0
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Count of contiguously acknowledged indices from 0.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn is_complete(&self) -> bool {
        self.count == self.total
    }

    /// First unacknowledged index at or after `from`.
    pub fn next_missing(&self, from: u64) -> Option<u64> {
        (from.max(self.cursor)..self.total).find(|&i| !self.contains(i))
    }

    /// Hex encoding of the bitmap (little-endian words).
    pub fn to_hex(&self) -> String {
        let bytes: Vec<u8> = self.words.iter().flat_map(|w| w.to_le_bytes()).collect();
        hex::encode(bytes)
    }

    /// Restores a bitmap produced by [`AckSet::to_hex`].
    ///
    /// Returns `None` if the encoding does not fit `total` indices.
    pub fn from_hex(total: u64, encoded: &str) -> Option<Self> {
        let bytes = hex::decode(encoded).ok()?;
        let mut set = Self::new(total);
        if bytes.len() != set.words.len() * 8 {
            return None;
        }
        for (word, raw) in set.words.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(raw);
            *word = u64::from_le_bytes(buf);
        }
        if total % 64 != 0 {
            let last = set.words.len() - 1;
            if set.words[last] >> (total % 64) != 0 {
                return None;
            }
        }
        set.count = set.words.iter().map(|w| u64::from(w.count_ones())).sum();
        while set.cursor < total && set.contains(set.cursor) {
            set.cursor += 1;
        }
        Some(set)
    }
}
