//! Script-class detection for free text.
//!
//! Every code point is bucketed by a closed Unicode range table; the bucket
//! holding a strict majority of the classified code points names the text.
//! Unclassified code points do not count towards the denominator.
//!
//! ```
//! use firewall_engine::charset::detect;
//!
//! assert_eq!(detect(""), "ASCII");
//! assert_eq!(detect("hello"), "ASCII");
//! assert_eq!(detect("привет"), "Cyrillic");
//! assert_eq!(detect("abПр"), "Mixed");
//! ```

/// Result when no bucket holds a strict majority.
pub const MIXED: &str = "Mixed";
/// Result for text made only of unclassified code points.
pub const OTHER: &str = "Other";

/// `(first, last, script)`, inclusive. Order matters: the Vietnamese
/// subrange must precede Latin Extended Additional.
const RANGES: &[(u32, u32, &str)] = &[
    (0x0000, 0x007F, "ASCII"),
    (0x1EA0, 0x1EFF, "Vietnamese"),
    (0x0080, 0x024F, "Latin"),
    (0x1E00, 0x1E9F, "Latin"),
    (0x0370, 0x03FF, "Greek"),
    (0x1F00, 0x1FFF, "Greek-Extended"),
    (0x0400, 0x052F, "Cyrillic"),
    (0x0530, 0x058F, "Armenian"),
    (0x0590, 0x05FF, "Hebrew"),
    (0x0600, 0x06FF, "Arabic"),
    (0x0750, 0x077F, "Arabic"),
    (0xFB50, 0xFDFF, "Arabic"),
    (0xFE70, 0xFEFF, "Arabic"),
    (0x0900, 0x097F, "Devanagari"),
    (0x0980, 0x09FF, "Bengali"),
    (0x0A00, 0x0A7F, "Gurmukhi"),
    (0x0A80, 0x0AFF, "Gujarati"),
    (0x0B00, 0x0B7F, "Oriya"),
    (0x0B80, 0x0BFF, "Tamil"),
    (0x0C00, 0x0C7F, "Telugu"),
    (0x0C80, 0x0CFF, "Kannada"),
    (0x0D00, 0x0D7F, "Malayalam"),
    (0x0D80, 0x0DFF, "Sinhala"),
    (0x0E00, 0x0E7F, "Thai"),
    (0x0E80, 0x0EFF, "Lao"),
    (0x0F00, 0x0FFF, "Tibetan"),
    (0x1000, 0x109F, "Myanmar"),
    (0x10A0, 0x10FF, "Georgian"),
    (0x1100, 0x11FF, "Korean"),
    (0x1200, 0x137F, "Ethiopic"),
    (0x1780, 0x17FF, "Khmer"),
    (0x1800, 0x18AF, "Mongolian"),
    (0x3040, 0x309F, "Japanese"),
    (0x30A0, 0x30FF, "Japanese"),
    (0x31F0, 0x31FF, "Japanese"),
    (0x3130, 0x318F, "Korean"),
    (0x3400, 0x9FFF, "Chinese"),
    (0xA960, 0xA97F, "Korean"),
    (0xAC00, 0xD7AF, "Korean"),
    (0xD7B0, 0xD7FF, "Korean"),
    (0x20000, 0x2A6DF, "Chinese"),
];

/// Script bucket of a single code point.
#[must_use]
pub fn classify(c: char) -> &'static str {
    let cp = c as u32;
    RANGES
        .iter()
        .find(|(lo, hi, _)| (*lo..=*hi).contains(&cp))
        .map_or(OTHER, |(_, _, name)| *name)
}

/// Name the dominant script of `text`.
///
/// Empty text is `ASCII`. Text with only unclassified code points is
/// `Other`. Without a strict majority (including an exact 50/50 split) the
/// result is `Mixed`.
#[must_use]
pub fn detect(text: &str) -> &'static str {
    if text.is_empty() {
        return "ASCII";
    }

    // Insertion-ordered counts keep the result deterministic
    let mut counts: Vec<(&'static str, usize)> = Vec::new();
    let mut total = 0usize;

    for c in text.chars() {
        let bucket = classify(c);
        if bucket == OTHER {
            continue;
        }
        total += 1;
        match counts.iter_mut().find(|(name, _)| *name == bucket) {
            Some((_, n)) => *n += 1,
            None => counts.push((bucket, 1)),
        }
    }

    if total == 0 {
        return OTHER;
    }

    match counts.iter().max_by_key(|(_, n)| *n) {
        Some((name, n)) if n * 2 > total => name,
        _ => MIXED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_ascii() {
        assert_eq!(detect(""), "ASCII");
    }

    #[test]
    fn test_single_scripts() {
        assert_eq!(detect("hello world"), "ASCII");
        assert_eq!(detect("Ελληνικά"), "Greek");
        assert_eq!(detect("שלום"), "Hebrew");
        assert_eq!(detect("مرحبا"), "Arabic");
        assert_eq!(detect("สวัสดี"), "Thai");
        assert_eq!(detect("नमस्ते"), "Devanagari");
        assert_eq!(detect("你好世界"), "Chinese");
        assert_eq!(detect("ひらがな"), "Japanese");
        assert_eq!(detect("안녕하세요"), "Korean");
        assert_eq!(detect("ქართული"), "Georgian");
        assert_eq!(detect("Հայերեն"), "Armenian");
    }

    #[test]
    fn test_vietnamese_before_latin() {
        assert_eq!(classify('\u{1EA0}'), "Vietnamese");
        assert_eq!(classify('\u{1EFF}'), "Vietnamese");
        assert_eq!(classify('\u{1E9F}'), "Latin");
        assert_eq!(classify('é'), "Latin");
    }

    #[test]
    fn test_exact_split_is_mixed() {
        assert_eq!(detect("abПр"), "Mixed");
    }

    #[test]
    fn test_plurality_without_majority_is_mixed() {
        // 2 ASCII, 1 Cyrillic, 1 Greek: 2 of 4 is not strict
        assert_eq!(detect("abПα"), "Mixed");
    }

    #[test]
    fn test_majority_wins() {
        assert_eq!(detect("abcП"), "ASCII");
        assert_eq!(detect("Привет, мир"), "Cyrillic");
    }

    #[test]
    fn test_other_ignored_in_denominator() {
        // Emoji are unclassified
        assert_eq!(detect("Привет😀😀😀😀"), "Cyrillic");
        assert_eq!(detect("😀😀"), OTHER);
    }

    #[test]
    fn test_supplementary_cjk() {
        assert_eq!(classify('\u{20000}'), "Chinese");
        assert_eq!(classify('\u{2A6DF}'), "Chinese");
        assert_eq!(classify('\u{2A6E0}'), OTHER);
    }
}
