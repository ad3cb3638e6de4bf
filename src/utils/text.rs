/// Removes a surrounding markdown code fence, as LLMs like to wrap JSON in one.
pub fn strip_code_blocks(s: &str) -> String {
    let s = s.trim();
    if s.starts_with("```json") {
        s.trim_start_matches("```json").trim_end_matches("```").trim().to_string()
    } else if s.starts_with("```") {
        s.trim_start_matches("```").trim_end_matches("```").trim().to_string()
    } else {
        s.to_string()
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn chars_eq_ignore_case(a: char, b: char) -> bool {
    a == b || a.to_lowercase().eq(b.to_lowercase())
}

/// Finds `needle` in `haystack[from..]` ignoring case. Returns the byte range.
fn find_ignore_case(haystack: &str, needle: &str, from: usize) -> Option<(usize, usize)> {
    let needle: Vec<char> = needle.chars().collect();
    if needle.is_empty() {
        return None;
    }
    let tail = &haystack[from..];
    for (start, _) in tail.char_indices() {
        let mut it = tail[start..].char_indices();
        let mut matched = 0;
        let mut end = start;
        for n in &needle {
            match it.next() {
                Some((off, c)) if chars_eq_ignore_case(c, *n) => {
                    matched += 1;
                    end = start + off + c.len_utf8();
                }
                _ => break,
            }
        }
        if matched == needle.len() {
            return Some((from + start, from + end));
        }
    }
    None
}

/// Replaces every whole-word, case-insensitive occurrence of `word`.
pub fn replace_word_ignore_case(text: &str, word: &str, replacement: &str) -> String {
    let word = word.trim();
    if word.is_empty() {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    let mut search = 0;
    while let Some((start, end)) = find_ignore_case(text, word, search) {
        let before_ok = text[..start].chars().next_back().map_or(true, |c| !is_word_char(c));
        let after_ok = text[end..].chars().next().map_or(true, |c| !is_word_char(c));
        if before_ok && after_ok {
            out.push_str(&text[cursor..start]);
            out.push_str(replacement);
            cursor = end;
        }
        search = match text[start..].chars().next() {
            Some(c) => start + c.len_utf8(),
            None => break,
        };
        if search < cursor {
            search = cursor;
        }
    }
    out.push_str(&text[cursor..]);
    out
}

/// True when `word` occurs as a whole word in `text`, ignoring case.
pub fn contains_word_ignore_case(text: &str, word: &str) -> bool {
    let word = word.trim();
    !word.is_empty() && replace_word_ignore_case(text, word, "\u{0}") != text
}

/// Lowercase ASCII slug suitable for storage keys.
pub fn slugify(s: &str) -> String {
    let mut slug = String::new();
    let mut dash = false;
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            dash = false;
        } else if !dash && !slug.is_empty() {
            slug.push('-');
            dash = true;
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "book".to_string()
    } else {
        slug
    }
}
