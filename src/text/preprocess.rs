use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]{0,200}>").expect("valid regex"));

static ENTITY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&(#[0-9]{1,6}|#[xX][0-9a-fA-F]{1,6}|[a-zA-Z]{2,8});").expect("valid regex"));

static SCENE_BREAK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[*#~=_\-•·◇◆○●□■☆★♦─━═]\s*){3,}$|^(?i:o+O+o+)$").expect("valid regex")
});

static DECORATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[~=_*#•·◇◆○●□■☆★♦─━═]{2,}").expect("valid regex"));

// Bare two-letter tags (TN, AN) need a separator.
static TRANSLATOR_NOTE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)[\[(]\s*(?:(?:T\s*/\s*N|TL\s*Note|Translator'?s?\s*Note)\b\s*[:：\-]?|(?:TL\s*N|TN)\s*[:：\-])\s*([^\])]*?)\s*[\])]",
    )
    .expect("valid regex")
});

static AUTHOR_NOTE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)[\[(]\s*(?:(?:A\s*/\s*N|Author'?s?\s*Note)\b\s*[:：\-]?|AN\s*[:：\-])\s*([^\])]*?)\s*[\])]")
        .expect("valid regex")
});

static INLINE_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t\u{00A0}\u{3000}]+").expect("valid regex"));

/// Make raw chapter text speakable.
///
/// Output is one paragraph per block, blocks separated by a blank line.
/// Every non-empty input line is its own paragraph.
pub fn preprocess(raw: &str) -> String {
    let text = TAG.replace_all(raw, " ");
    let text = ENTITY.replace_all(&text, |caps: &Captures| decode_entity(&caps[1]));

    let paragraphs: Vec<String> = text
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            if SCENE_BREAK.is_match(line) {
                return Some("...".to_string());
            }
            let line = TRANSLATOR_NOTE.replace_all(line, |caps: &Captures| note("Translator's note", &caps[1]));
            let line = AUTHOR_NOTE.replace_all(&line, |caps: &Captures| note("Author's note", &caps[1]));
            let line = DECORATION.replace_all(&line, " ");
            let line = collapse_elongations(&line);
            let line = INLINE_SPACE.replace_all(&line, " ");
            let line = line.trim();
            if line.is_empty() {
                None
            } else {
                Some(line.to_string())
            }
        })
        .collect();

    let mut out: Vec<String> = Vec::with_capacity(paragraphs.len());
    for p in paragraphs {
        // Consecutive scene breaks collapse into one pause.
        if p == "..." && out.last().is_some_and(|l| l == "...") {
            continue;
        }
        out.push(p);
    }
    out.join("\n\n")
}

/// Paragraphs of already preprocessed text.
pub fn paragraphs(text: &str) -> Vec<&str> {
    text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()).collect()
}

/// Stable identity of a text, used to recognise "play the same thing again".
pub fn fingerprint(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

/// Runs of four or more of the same letter shrink to two:
/// "ahhhhh" reads as "ahh", "hmmmmm" as "hmm". Triples ("III", "www")
/// are left alone.
pub fn collapse_elongations(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut run: Vec<char> = Vec::new();

    let flush = |run: &mut Vec<char>, out: &mut String| {
        let keep = if run.len() >= 4 { 2 } else { run.len() };
        out.extend(run.iter().take(keep));
        run.clear();
    };

    for c in text.chars() {
        let same = run
            .last()
            .is_some_and(|l| c.is_alphabetic() && l.to_lowercase().eq(c.to_lowercase()));
        if !same {
            flush(&mut run, &mut out);
        }
        run.push(c);
    }
    flush(&mut run, &mut out);
    out
}

fn note(prefix: &str, body: &str) -> String {
    let body = body.trim().trim_end_matches(['.', '!', '?', ' ']);
    if body.is_empty() {
        String::new()
    } else {
        format!("{}: {}.", prefix, body)
    }
}

fn decode_entity(name: &str) -> String {
    let decoded = match name {
        "amp" => Some('&'),
        "quot" => Some('"'),
        "apos" | "#39" => Some('\''),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "nbsp" => Some(' '),
        "hellip" => return "...".to_string(),
        "mdash" | "ndash" => Some('-'),
        "lsquo" | "rsquo" => Some('\''),
        "ldquo" | "rdquo" => Some('"'),
        _ => numeric_entity(name),
    };
    decoded.map(String::from).unwrap_or_else(|| " ".to_string())
}

fn numeric_entity(name: &str) -> Option<char> {
    let digits = name.strip_prefix('#')?;
    let code = match digits.strip_prefix(['x', 'X']) {
        Some(hex) => u32::from_str_radix(hex, 16).ok()?,
        None => digits.parse().ok()?,
    };
    char::from_u32(code).filter(|c| !c.is_control() || c.is_whitespace())
}
