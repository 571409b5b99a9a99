//! Text chunking for embedding: overlapping word windows sized against the
//! model's token budget, using a chars-per-token approximation.

const CHARS_PER_TOKEN: usize = 4;

pub fn chunk_text(text: &str, max_tokens: usize, overlap_tokens: usize) -> Vec<String> {
    let max_chars = max_tokens.saturating_mul(CHARS_PER_TOKEN).max(1);
    let overlap_chars = overlap_tokens
        .saturating_mul(CHARS_PER_TOKEN)
        .min(max_chars / 2);

    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < words.len() {
        let mut chars = 0usize;
        let mut end = start;
        while end < words.len() && (chars == 0 || chars + words[end].len() + 1 <= max_chars) {
            chars += words[end].len() + 1;
            end += 1;
        }
        chunks.push(words[start..end].join(" "));
        if end >= words.len() {
            break;
        }
        // Back up into the tail of this window for the overlap.
        let mut overlap = 0usize;
        let mut next = end;
        while next > start + 1 && overlap < overlap_chars {
            next -= 1;
            overlap += words[next].len() + 1;
        }
        start = next.max(start + 1);
    }
    chunks
}
