/// A single replace operation turning one string into another.
///
/// Offsets are UTF-8 byte offsets to match `yrs::Text` indexing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSplice {
    pub index: u32,
    pub delete_len: u32,
    pub insert: String,
}

/// Common prefix/suffix diff. Returns `None` when the strings are equal.
pub fn splice(old_text: &str, new_text: &str) -> Option<TextSplice> {
    if old_text == new_text {
        return None;
    }

    let prefix: usize = old_text
        .chars()
        .zip(new_text.chars())
        .take_while(|(a, b)| a == b)
        .map(|(c, _)| c.len_utf8())
        .sum();
    let old_rest = &old_text[prefix..];
    let new_rest = &new_text[prefix..];

    let suffix: usize = old_rest
        .chars()
        .rev()
        .zip(new_rest.chars().rev())
        .take_while(|(a, b)| a == b)
        .map(|(c, _)| c.len_utf8())
        .sum();

    Some(TextSplice {
        index: byte_len(prefix),
        delete_len: byte_len(old_rest.len() - suffix),
        insert: new_rest[..new_rest.len() - suffix].to_owned(),
    })
}

fn byte_len(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(old: &str, splice: &TextSplice) -> String {
        let index = splice.index as usize;
        let end = index + splice.delete_len as usize;
        format!("{}{}{}", &old[..index], splice.insert, &old[end..])
    }

    #[test]
    fn equal_strings_need_no_splice() {
        assert_eq!(splice("same", "same"), None);
    }

    #[test]
    fn middle_replacement() {
        let op = splice("hello world", "hello brave world").expect("strings differ");
        assert_eq!(op, TextSplice { index: 6, delete_len: 0, insert: "brave ".into() });
    }

    #[test]
    fn deletion_at_end() {
        let op = splice("abcdef", "abc").expect("strings differ");
        assert_eq!(op, TextSplice { index: 3, delete_len: 3, insert: String::new() });
    }

    #[test]
    fn repeated_characters_do_not_overlap() {
        let old = "aaaa";
        let new = "aa";
        let op = splice(old, new).expect("strings differ");
        assert_eq!(apply(old, &op), new);
    }

    #[test]
    fn multibyte_offsets_are_bytes() {
        let old = "héllo";
        let new = "héllø";
        let op = splice(old, new).expect("strings differ");
        assert_eq!(op.index, 5);
        assert_eq!(op.delete_len, 1);
        assert_eq!(apply(old, &op), new);
    }
}
