// Copyright (c) The sortie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::HashMap;

/// Hands out unique full names for test nodes.
///
/// Names are `parent/child`, except that children of the root are not prefixed. Reusing a name
/// under the same parent appends `#01`, `#02` and so on, and an empty name becomes `#00`.
#[derive(Debug, Default)]
pub(crate) struct NameUniquifier {
    next_suffix: HashMap<String, usize>,
}

impl NameUniquifier {
    pub(crate) fn unique(&mut self, parent: Option<&str>, subname: &str) -> String {
        let subname = rewrite(subname);
        let mut name = match parent {
            Some(parent) => format!("{parent}/{subname}"),
            None => subname.clone(),
        };
        let mut empty = subname.is_empty();
        loop {
            let next = self.next_suffix.get(&name).copied();
            match next {
                None if !empty => {
                    self.next_suffix.insert(name.clone(), 1);
                    return name;
                }
                _ => {
                    let next = next.unwrap_or(0);
                    self.next_suffix.insert(name.clone(), next + 1);
                    name = format!("{name}#{next:02}");
                    empty = false;
                }
            }
        }
    }
}

/// Makes a subtest name safe to use in paths and reports.
pub(crate) fn rewrite(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_whitespace() {
            out.push('_');
        } else if c.is_control() {
            out.extend(c.escape_default());
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test]
    fn unique_names() {
        let mut names = NameUniquifier::default();
        assert_eq!(names.unique(None, "basic"), "basic");
        assert_eq!(names.unique(None, "basic"), "basic#01");
        assert_eq!(names.unique(None, "basic"), "basic#02");
        assert_eq!(names.unique(Some("basic"), "sub"), "basic/sub");
        assert_eq!(names.unique(Some("basic"), "sub"), "basic/sub#01");
        assert_eq!(names.unique(Some("basic"), ""), "basic/#00");
        assert_eq!(names.unique(Some("basic"), ""), "basic/#01");
        assert_eq!(names.unique(None, ""), "#00");
    }

    #[test]
    fn suffixed_name_collision() {
        let mut names = NameUniquifier::default();
        assert_eq!(names.unique(None, "a#01"), "a#01");
        assert_eq!(names.unique(None, "a"), "a");
        // "a#01" is taken, so the second "a" moves on to "a#01#01".
        assert_eq!(names.unique(None, "a"), "a#01#01");
    }

    #[test_case("plain", "plain"; "unchanged")]
    #[test_case("with space", "with_space"; "space")]
    #[test_case("tab\there", "tab_here"; "tab")]
    #[test_case("bell\u{7}", "bell\\u{7}"; "control")]
    fn rewrite_names(input: &str, expected: &str) {
        assert_eq!(rewrite(input), expected);
    }
}
