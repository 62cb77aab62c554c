//! Structure-aware chunking with a token budget and overlap.
//!
//! Token counting is approximate but deterministic and monotone with
//! character count: a token is a maximal alphanumeric run or a single other
//! non-whitespace character. Good enough for budget enforcement; the real
//! tokenizer lives with the embedding model.

#[derive(Debug, Clone)]
pub struct ChunkOptions {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
    pub preserve_structure: bool,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            max_tokens: 400,
            overlap_tokens: 50,
            preserve_structure: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub text: String,
    pub token_count: usize,
    pub index: usize,
    /// Section heading active at this chunk's start, when one was seen.
    pub heading: Option<String>,
}

pub fn count_tokens(text: &str) -> usize {
    let mut count = 0usize;
    let mut in_word = false;
    for c in text.chars() {
        if c.is_alphanumeric() {
            if !in_word {
                count += 1;
                in_word = true;
            }
        } else {
            in_word = false;
            if !c.is_whitespace() {
                count += 1;
            }
        }
    }
    count
}

/// One unit the chunk builder works with: a sentence, or a heading line that
/// prefers to sit at a chunk start.
#[derive(Debug)]
struct Unit<'a> {
    text: &'a str,
    tokens: usize,
    is_heading: bool,
}

pub fn chunk_text(text: &str, options: &ChunkOptions) -> Vec<Chunk> {
    let max_tokens = options.max_tokens.max(1);
    let overlap_tokens = options.overlap_tokens.min(max_tokens.saturating_sub(1));

    let units = split_units(text, options.preserve_structure);
    if units.is_empty() {
        return Vec::new();
    }

    let mut builder = ChunkBuilder::new(max_tokens, overlap_tokens);

    for unit in units {
        if unit.tokens > max_tokens {
            // A single oversized sentence: hard-split on word boundaries.
            for piece in split_by_words(unit.text, max_tokens) {
                builder.push_piece(&piece, count_tokens(&piece), false);
            }
            continue;
        }

        if unit.is_heading {
            builder.start_section(unit.text, unit.tokens);
        } else {
            builder.push_piece(unit.text, unit.tokens, true);
        }
    }

    builder.finish()
}

struct ChunkBuilder {
    max_tokens: usize,
    overlap_tokens: usize,
    chunks: Vec<Chunk>,
    /// Pieces of the chunk under construction, with per-piece token counts.
    current: Vec<(String, usize)>,
    current_tokens: usize,
    current_heading: Option<String>,
    active_heading: Option<String>,
}

impl ChunkBuilder {
    fn new(max_tokens: usize, overlap_tokens: usize) -> Self {
        Self {
            max_tokens,
            overlap_tokens,
            chunks: Vec::new(),
            current: Vec::new(),
            current_tokens: 0,
            current_heading: None,
            active_heading: None,
        }
    }

    /// A heading forces a flush when the running chunk already has substance,
    /// so the marker lands at a chunk start when possible.
    fn start_section(&mut self, heading: &str, tokens: usize) {
        if self.current_tokens > 0 {
            self.flush(false);
        }
        self.active_heading = Some(clean_heading(heading));
        self.push_raw(heading, tokens);
    }

    /// `allow_overlap` is false for hard word-splits, which already carry
    /// their own continuation context.
    fn push_piece(&mut self, piece: &str, tokens: usize, allow_overlap: bool) {
        if self.current_tokens + tokens > self.max_tokens && self.current_tokens > 0 {
            self.flush(allow_overlap);
            // The overlap seed plus a large unit can still overflow; trim
            // the seed from the front until the budget holds.
            while self.current_tokens + tokens > self.max_tokens && !self.current.is_empty() {
                let (_, t) = self.current.remove(0);
                self.current_tokens -= t;
            }
        }
        self.push_raw(piece, tokens);
        if self.current_tokens >= self.max_tokens {
            self.flush(allow_overlap);
        }
    }

    fn push_raw(&mut self, piece: &str, tokens: usize) {
        if self.current.is_empty() {
            self.current_heading = self.active_heading.clone();
        }
        self.current.push((piece.to_string(), tokens));
        self.current_tokens += tokens;
    }

    fn flush(&mut self, seed_overlap: bool) {
        let text = self
            .current
            .iter()
            .map(|(piece, _)| piece.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let trimmed = text.trim();

        if !trimmed.is_empty() {
            self.chunks.push(Chunk {
                text: trimmed.to_string(),
                token_count: count_tokens(trimmed),
                index: 0,
                heading: self.current_heading.take(),
            });
        }

        // Seed the next chunk with the tail of this one so consecutive
        // chunks share roughly `overlap_tokens` of context.
        let mut tail: Vec<(String, usize)> = Vec::new();
        if seed_overlap && self.overlap_tokens > 0 {
            let mut tail_tokens = 0;
            for (piece, tokens) in self.current.iter().rev() {
                if tail_tokens + tokens > self.overlap_tokens {
                    break;
                }
                tail_tokens += tokens;
                tail.push((piece.clone(), *tokens));
            }
            tail.reverse();
        }

        self.current_tokens = tail.iter().map(|(_, t)| t).sum();
        self.current = tail;
        self.current_heading = None;
    }

    fn finish(mut self) -> Vec<Chunk> {
        if !self.current.is_empty() {
            self.flush(false);
        }
        let mut chunks = self.chunks;

        // The last flush may hold only the overlap tail of the previous
        // chunk; drop it when it adds nothing new.
        if chunks.len() >= 2 {
            let last = chunks.last().expect("non-empty").text.clone();
            let prev = &chunks[chunks.len() - 2].text;
            if prev.ends_with(&last) {
                chunks.pop();
            }
        }

        for (i, chunk) in chunks.iter_mut().enumerate() {
            chunk.index = i;
        }
        chunks
    }
}

fn clean_heading(heading: &str) -> String {
    heading.trim_start_matches('#').trim().to_string()
}

fn split_units(text: &str, preserve_structure: bool) -> Vec<Unit<'_>> {
    let mut units = Vec::new();

    for paragraph in text.split("\n\n") {
        for line_group in split_heading_lines(paragraph) {
            let trimmed = line_group.trim();
            if trimmed.is_empty() {
                continue;
            }

            if preserve_structure && trimmed.starts_with('#') {
                units.push(Unit {
                    text: trimmed,
                    tokens: count_tokens(trimmed),
                    is_heading: true,
                });
                continue;
            }

            for sentence in split_sentences(trimmed) {
                let sentence = sentence.trim();
                if sentence.is_empty() {
                    continue;
                }
                units.push(Unit {
                    text: sentence,
                    tokens: count_tokens(sentence),
                    is_heading: false,
                });
            }
        }
    }

    units
}

/// Separate heading lines (`# …`) from the body lines around them so each
/// can become its own unit.
fn split_heading_lines(paragraph: &str) -> Vec<&str> {
    let mut groups = Vec::new();
    let mut rest = paragraph;

    while let Some(pos) = find_heading_start(rest) {
        let (before, from_heading) = rest.split_at(pos);
        if !before.trim().is_empty() {
            groups.push(before);
        }
        let heading_end = from_heading.find('\n').unwrap_or(from_heading.len());
        let (heading, tail) = from_heading.split_at(heading_end);
        groups.push(heading);
        rest = tail;
    }
    if !rest.trim().is_empty() {
        groups.push(rest);
    }
    groups
}

fn find_heading_start(text: &str) -> Option<usize> {
    if text.starts_with('#') {
        return Some(0);
    }
    text.find("\n#").map(|pos| pos + 1)
}

/// Sentence boundaries: terminator followed by whitespace. Never splits
/// inside a word.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let bytes = text.as_bytes();

    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if (b == b'.' || b == b'!' || b == b'?') && i + 1 < bytes.len() {
            let next = bytes[i + 1];
            if next == b' ' || next == b'\n' || next == b'\t' {
                sentences.push(&text[start..=i]);
                start = i + 1;
            }
        } else if b == b'\n' {
            // Single newlines inside a paragraph also bound units
            if i > start {
                sentences.push(&text[start..i]);
            }
            start = i + 1;
        }
        i += 1;
    }
    if start < text.len() {
        sentences.push(&text[start..]);
    }
    sentences
}

/// Hard split on word boundaries for sentences that alone exceed the budget.
fn split_by_words(text: &str, max_tokens: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut current_tokens = 0;

    for word in text.split_whitespace() {
        let word_tokens = count_tokens(word);
        if current_tokens + word_tokens > max_tokens && !current.is_empty() {
            pieces.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
        current_tokens += word_tokens;
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(max: usize, overlap: usize) -> ChunkOptions {
        ChunkOptions {
            max_tokens: max,
            overlap_tokens: overlap,
            preserve_structure: true,
        }
    }

    #[test]
    fn token_count_is_monotone_with_length() {
        let short = "Kommunaler Klimaschutz";
        let longer = "Kommunaler Klimaschutz in Freiburg und Umgebung";
        assert!(count_tokens(longer) > count_tokens(short));
        assert_eq!(count_tokens(""), 0);
        assert_eq!(count_tokens("ein Satz, mit Komma."), 6);
    }

    #[test]
    fn chunking_is_deterministic() {
        let text = "Erster Satz über Klimaschutz. Zweiter Satz über Radverkehr. ".repeat(40);
        let opts = options(50, 10);
        let a = chunk_text(&text, &opts);
        let b = chunk_text(&text, &opts);
        assert_eq!(a, b);
        assert!(a.len() > 1);
    }

    #[test]
    fn every_chunk_respects_the_token_budget() {
        let text = "Die Stadt plant neue Radwege entlang der Hauptstraße. ".repeat(100);
        let opts = options(40, 8);
        for chunk in chunk_text(&text, &opts) {
            assert!(
                chunk.token_count <= opts.max_tokens,
                "chunk {} has {} tokens",
                chunk.index,
                chunk.token_count
            );
        }
    }

    #[test]
    fn indexes_are_dense_from_zero() {
        let text = "Ein Satz hier. ".repeat(60);
        let chunks = chunk_text(&text, &options(30, 5));
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
        }
    }

    #[test]
    fn consecutive_chunks_overlap() {
        let text = "Eins zwei drei vier fünf sechs sieben acht. ".repeat(30);
        let chunks = chunk_text(&text, &options(40, 10));
        assert!(chunks.len() >= 2);
        for pair in chunks.windows(2) {
            let prev_tail: Vec<&str> = pair[0].text.split_whitespace().rev().take(3).collect();
            let next = &pair[1].text;
            assert!(
                prev_tail.iter().any(|w| next.contains(w)),
                "no shared context between consecutive chunks"
            );
        }
    }

    #[test]
    fn headings_land_at_chunk_starts() {
        let mut text = String::new();
        for page in 1..=4 {
            text.push_str(&format!("## Seite {}\n\n", page));
            text.push_str(&"Inhalt des Abschnitts mit mehreren Wörtern. ".repeat(12));
            text.push_str("\n\n");
        }
        let chunks = chunk_text(&text, &options(60, 10));
        let with_heading = chunks
            .iter()
            .filter(|c| c.text.starts_with("## Seite"))
            .count();
        assert!(with_heading >= 3, "headings should start chunks");
    }

    #[test]
    fn whitespace_only_input_yields_nothing() {
        assert!(chunk_text("   \n\n \t ", &options(40, 5)).is_empty());
        assert!(chunk_text("", &options(40, 5)).is_empty());
    }

    #[test]
    fn oversized_sentence_is_word_split() {
        let text = "wort ".repeat(200);
        let chunks = chunk_text(&text, &options(50, 10));
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.token_count <= 50);
        }
    }
}
