//! Case-insensitive file name matching with DOS wildcards.
//!
//! | Char | Meaning |
//! |------|---------|
//! | `*`  | zero or more characters |
//! | `?`  | exactly one character |
//! | `<`  | zero or more characters, not past the final `.` |
//! | `>`  | one character, or nothing at a `.` or end of name |
//! | `"`  | a `.`, or nothing at end of name |

/// Check whether a pattern contains any wildcard.
pub fn has_wildcards(pattern: &str) -> bool {
    pattern.chars().any(|c| matches!(c, '*' | '?' | '<' | '>' | '"'))
}

/// Match a file name against a search expression.
///
/// An empty expression matches everything.
///
/// # Arguments
/// * `name` - File name (single component)
/// * `pattern` - Search expression
pub fn name_matches(name: &str, pattern: &str) -> bool {
    if pattern.is_empty() || pattern == "*" {
        return true;
    }
    let name: Vec<char> = name.chars().flat_map(char::to_lowercase).collect();
    let pattern: Vec<char> = pattern.chars().flat_map(char::to_lowercase).collect();
    match_from(&pattern, &name)
}

fn match_from(pattern: &[char], name: &[char]) -> bool {
    let Some((&head, rest)) = pattern.split_first() else {
        return name.is_empty();
    };

    match head {
        '*' => (0..=name.len()).any(|skip| match_from(rest, &name[skip..])),
        '?' => !name.is_empty() && match_from(rest, &name[1..]),
        '<' => {
            let limit: usize = name.iter().rposition(|c| *c == '.').unwrap_or(name.len());
            (0..=limit).any(|skip| match_from(rest, &name[skip..]))
        }
        '>' => match name.first() {
            None | Some('.') => match_from(rest, name),
            Some(_) => match_from(rest, &name[1..]),
        },
        '"' => match name.first() {
            Some('.') => match_from(rest, &name[1..]),
            None => match_from(rest, name),
            Some(_) => false,
        },
        literal => name.first() == Some(&literal) && match_from(rest, &name[1..]),
    }
}
