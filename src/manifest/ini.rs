// src/manifest/ini.rs

//! Grouped key/value text parser
//!
//! Accepts the subset of INI used by bundle manifests:
//!
//! - `[GROUP]` headers; group names are case-sensitive
//! - `key = value` or `key: value`; keys are lowercased, values trimmed
//! - `#` and `;` full-line comments, blank lines ignored
//! - indented lines continue the previous value

use super::ManifestError;
use std::collections::BTreeMap;

/// Keys of one group, in lowercase
pub type Group = BTreeMap<String, String>;

/// Parsed document: group name -> keys
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IniDocument {
    groups: BTreeMap<String, Group>,
}

impl IniDocument {
    pub fn parse(content: &str) -> Result<Self, ManifestError> {
        let mut groups: BTreeMap<String, Group> = BTreeMap::new();
        let mut current: Option<String> = None;
        let mut last_key: Option<String> = None;

        for (idx, raw) in content.lines().enumerate() {
            let line_no = idx + 1;
            let trimmed = raw.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
                continue;
            }

            // Continuation of the previous value
            if raw.starts_with([' ', '\t']) {
                if let (Some(group), Some(key)) = (&current, &last_key)
                    && let Some(value) = groups.get_mut(group).and_then(|g| g.get_mut(key))
                {
                    value.push('\n');
                    value.push_str(trimmed);
                    continue;
                }
            }

            if let Some(name) = trimmed.strip_prefix('[') {
                let name = name.strip_suffix(']').ok_or_else(|| ManifestError::Syntax {
                    line: line_no,
                    message: format!("unterminated group header: {}", trimmed),
                })?;
                let name = name.trim().to_string();
                if groups.contains_key(&name) {
                    return Err(ManifestError::Syntax {
                        line: line_no,
                        message: format!("duplicate group [{}]", name),
                    });
                }
                groups.insert(name.clone(), Group::new());
                current = Some(name);
                last_key = None;
                continue;
            }

            let Some(group) = &current else {
                return Err(ManifestError::Syntax {
                    line: line_no,
                    message: "key outside of any group".to_string(),
                });
            };

            let split = trimmed
                .find(['=', ':'])
                .map(|pos| (&trimmed[..pos], &trimmed[pos + 1..]));
            let Some((key, value)) = split else {
                return Err(ManifestError::Syntax {
                    line: line_no,
                    message: format!("expected key = value, found: {}", trimmed),
                });
            };

            let key = key.trim().to_lowercase();
            if key.is_empty() {
                return Err(ManifestError::Syntax {
                    line: line_no,
                    message: "empty key".to_string(),
                });
            }
            if let Some(keys) = groups.get_mut(group) {
                keys.insert(key.clone(), value.trim().to_string());
            }
            last_key = Some(key);
        }

        Ok(Self { groups })
    }

    pub fn has_group(&self, name: &str) -> bool {
        self.groups.contains_key(name)
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_groups_and_keys() {
        let doc = IniDocument::parse(
            "# comment\n[META]\nManifest_Version = 1.0.0\nnum_images: 2\n\n; other\n[BOOT]\nbytes=800\n",
        )
        .unwrap();
        assert!(doc.has_group("META"));
        assert!(doc.has_group("BOOT"));
        assert!(!doc.has_group("boot"));
        let meta = doc.group("META").unwrap();
        assert_eq!(meta.get("manifest_version").map(String::as_str), Some("1.0.0"));
        assert_eq!(meta.get("num_images").map(String::as_str), Some("2"));
        assert_eq!(doc.group_names().collect::<Vec<_>>(), vec!["BOOT", "META"]);
    }

    #[test]
    fn test_value_may_contain_separator() {
        let doc = IniDocument::parse("[META]\nurl = http://example.com/a=b\n").unwrap();
        assert_eq!(
            doc.group("META").unwrap().get("url").map(String::as_str),
            Some("http://example.com/a=b")
        );
    }

    #[test]
    fn test_continuation_line() {
        let doc = IniDocument::parse("[META]\nnotes = first\n  second\n").unwrap();
        assert_eq!(
            doc.group("META").unwrap().get("notes").map(String::as_str),
            Some("first\nsecond")
        );
    }

    #[test]
    fn test_syntax_errors() {
        assert!(matches!(
            IniDocument::parse("bytes = 1\n"),
            Err(ManifestError::Syntax { line: 1, .. })
        ));
        assert!(matches!(
            IniDocument::parse("[META\n"),
            Err(ManifestError::Syntax { line: 1, .. })
        ));
        assert!(matches!(
            IniDocument::parse("[META]\n[META]\n"),
            Err(ManifestError::Syntax { line: 2, .. })
        ));
        assert!(matches!(
            IniDocument::parse("[META]\njust words\n"),
            Err(ManifestError::Syntax { line: 2, .. })
        ));
    }
}
