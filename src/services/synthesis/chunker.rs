//! Splits chapter text into request-sized pieces for engines that bound
//! the size of a single job.

/// Split `text` into chunks of at most `limit` characters.
///
/// Prefers paragraph boundaries, then sentence ends, then word boundaries.
/// A single word longer than `limit` is hard-split. Empty input yields no
/// chunks.
pub fn chunk_text(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();

    for paragraph in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        for piece in split_to_fit(paragraph, limit) {
            let sep = if current.is_empty() { 0 } else { 2 };
            if char_len(&current) + sep + char_len(&piece) <= limit {
                if sep > 0 {
                    current.push_str("\n\n");
                }
                current.push_str(&piece);
            } else {
                if !current.is_empty() {
                    chunks.push(std::mem::take(&mut current));
                }
                current = piece;
            }
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn split_to_fit(paragraph: &str, limit: usize) -> Vec<String> {
    if char_len(paragraph) <= limit {
        return vec![paragraph.to_string()];
    }
    let mut out = Vec::new();
    let mut current = String::new();
    for sentence in sentences(paragraph) {
        let pieces = if char_len(&sentence) > limit {
            split_words(&sentence, limit)
        } else {
            vec![sentence]
        };
        for piece in pieces {
            let sep = usize::from(!current.is_empty());
            if char_len(&current) + sep + char_len(&piece) <= limit {
                if sep > 0 {
                    current.push(' ');
                }
                current.push_str(&piece);
            } else {
                if !current.is_empty() {
                    out.push(std::mem::take(&mut current));
                }
                current = piece;
            }
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        current.push(c);
        if matches!(c, '.' | '!' | '?' | '…') && chars.peek().map_or(true, |n| n.is_whitespace()) {
            let s = current.trim();
            if !s.is_empty() {
                out.push(s.to_string());
            }
            current.clear();
        }
    }
    let s = current.trim();
    if !s.is_empty() {
        out.push(s.to_string());
    }
    out
}

fn split_words(sentence: &str, limit: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for word in sentence.split_whitespace() {
        if char_len(word) > limit {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
            let chars: Vec<char> = word.chars().collect();
            out.extend(chars.chunks(limit).map(|c| c.iter().collect::<String>()));
            continue;
        }
        let sep = usize::from(!current.is_empty());
        if char_len(&current) + sep + char_len(word) <= limit {
            if sep > 0 {
                current.push(' ');
            }
            current.push_str(word);
        } else {
            out.push(std::mem::take(&mut current));
            current.push_str(word);
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}
