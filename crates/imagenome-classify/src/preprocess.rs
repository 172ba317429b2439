/// Normalise text before classification: trim, lowercase, turn newlines
/// and tabs into spaces, drop ASCII punctuation except `()[]{}-%`.
pub fn preprocess_text(text: &str) -> String {
    const KEEP: &[char] = &['(', ')', '[', ']', '{', '}', '-', '%'];

    text.trim()
        .to_lowercase()
        .chars()
        .filter_map(|c| match c {
            '\n' | '\t' => Some(' '),
            c if c.is_ascii_punctuation() && !KEEP.contains(&c) => None,
            c => Some(c),
        })
        .collect()
}
