//! Filesystem-safe encoding of user file names
//!
//! Reserved characters become fixed `_token_` substrings (`.` -> `_dot_`).
//! `_` itself is escaped as `_us_`, which makes [`decode_file_name`] the exact
//! inverse of [`encode_file_name`] for every input. Unknown `_..._` sequences
//! are left as they are, so folder names written without the underscore
//! escape still decode.

const TOKENS: &[(char, &str)] = &[
    ('_', "us"),
    ('.', "dot"),
    ('/', "slash"),
    ('\\', "backslash"),
    ('?', "question"),
    ('%', "percent"),
    ('*', "asterisk"),
    (':', "colon"),
    ('|', "pipe"),
    ('"', "quote"),
    ('<', "lt"),
    ('>', "gt"),
];

fn token_for(c: char) -> Option<&'static str> {
    TOKENS.iter().find(|(ch, _)| *ch == c).map(|(_, t)| *t)
}

fn char_for(token: &str) -> Option<char> {
    TOKENS.iter().find(|(_, t)| *t == token).map(|(c, _)| *c)
}

pub fn encode_file_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 8);
    for c in name.chars() {
        match token_for(c) {
            Some(token) => {
                out.push('_');
                out.push_str(token);
                out.push('_');
            }
            None => out.push(c),
        }
    }
    out
}

pub fn decode_file_name(encoded: &str) -> String {
    let mut out = String::with_capacity(encoded.len());
    let mut rest = encoded;

    while let Some(start) = rest.find('_') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let decoded = after
            .find('_')
            .and_then(|end| char_for(&after[..end]).map(|c| (c, end)));
        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &after[end + 1..];
            }
            None => {
                out.push('_');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_reserved() {
        assert_eq!(encode_file_name("report.pdf"), "report_dot_pdf");
        assert_eq!(encode_file_name("a/b\\c"), "a_slash_b_backslash_c");
        assert_eq!(encode_file_name("<x>"), "_lt_x_gt_");
        assert_eq!(encode_file_name("my_file"), "my_us_file");
    }

    #[test]
    fn test_roundtrip_all_reserved() {
        let names = [
            "plain",
            "a.b.c",
            r#"./\?%*:|"<>"#,
            "100% done?.txt",
            "C:\\dir\\file.tar.gz",
            "",
            "___",
            "_dot_",
            "file_dot_txt.real",
            "é/ü:ß",
        ];
        for name in names {
            let encoded = encode_file_name(name);
            for reserved in ['.', '/', '\\', '?', '%', '*', ':', '|', '"', '<', '>'] {
                assert!(!encoded.contains(reserved), "{encoded} still has {reserved}");
            }
            assert_eq!(decode_file_name(&encoded), name);
        }
    }

    #[test]
    fn test_legacy_names_decode() {
        // written without the underscore escape
        assert_eq!(decode_file_name("my_file_dot_txt"), "my_file.txt");
        assert_eq!(decode_file_name("trailing_"), "trailing_");
    }
}
