use xxhash_rust::xxh3::xxh3_64;

/// Token-level 64-bit SimHash of cleaned page text. Near-duplicate pages
/// produce hashes within a few bits of each other; identical text produces
/// an identical hash.
pub fn simhash(text: &str) -> u64 {
    let mut weights = [0i64; 64];

    for token in text.split_whitespace() {
        let h = xxh3_64(token.as_bytes());
        for (bit, weight) in weights.iter_mut().enumerate() {
            if h >> bit & 1 == 1 {
                *weight += 1;
            } else {
                *weight -= 1;
            }
        }
    }

    let mut hash = 0u64;
    for (bit, weight) in weights.iter().enumerate() {
        if *weight > 0 {
            hash |= 1 << bit;
        }
    }
    hash
}

/// Hex rendering stored in the database (the writer adds the `h:` prefix).
pub fn simhash_hex(text: &str) -> String {
    format!("{:016x}", simhash(text))
}
