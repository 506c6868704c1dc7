use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Complete record of one porting run.
///
/// Field names of the nested records follow the fixture format (PascalCase),
/// while the two top-level keys are lowercase. Optional fields are omitted
/// when absent and are never represented as empty strings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionList {
    #[serde(deserialize_with = "null_as_empty")]
    pub modules: Vec<ModuleAction>,
    #[serde(deserialize_with = "null_as_empty")]
    pub packages: Vec<PackageAction>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ModuleAction {
    pub path: String,
    pub version: String,
    pub fixed: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    pub imported: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct PackageAction {
    pub path: String,
    pub module: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    /// Engine-specific detail. Carried through verbatim but excluded from
    /// fixture comparison.
    #[serde(
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub actions: Vec<SubAction>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub files: Vec<FileAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Opaque key/value record emitted by an engine for a package.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubAction(pub Map<String, Value>);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct FileAction {
    pub name: String,
    pub build: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_file: Option<String>,
    #[serde(
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub lines: Vec<LineAction>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct LineAction {
    pub line: u32,
    pub original: String,
    pub fixed: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub changes: Vec<ChangeAction>,
}

/// Substitution of `original` at the 1-based byte `column` of a line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ChangeAction {
    pub column: u32,
    pub original: String,
    pub replacement: String,
}

/// Result written on stderr when a run fails before an `ActionList` exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ToolError {
    pub is_port_error: bool,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeError {
    ZeroColumn,
    Overlap { column: u32 },
    OutOfRange { column: u32 },
    OriginalMismatch {
        column: u32,
        expected: String,
        found: String,
    },
}

impl fmt::Display for ChangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeError::ZeroColumn => f.write_str("columns are 1-based; got column 0"),
            ChangeError::Overlap { column } => {
                write!(f, "change at column {column} overlaps or precedes the previous change")
            }
            ChangeError::OutOfRange { column } => {
                write!(f, "change at column {column} falls outside the original line")
            }
            ChangeError::OriginalMismatch {
                column,
                expected,
                found,
            } => write!(
                f,
                "change at column {column} expects {expected:?} but the line has {found:?}"
            ),
        }
    }
}

impl std::error::Error for ChangeError {}

impl LineAction {
    /// Rebuilds the fixed line by applying `changes` to `original`.
    pub fn apply_changes(&self) -> Result<String, ChangeError> {
        let src = self.original.as_str();
        let mut out = String::with_capacity(self.fixed.len());
        let mut cursor = 0usize;

        for change in &self.changes {
            let column = change.column;
            if column == 0 {
                return Err(ChangeError::ZeroColumn);
            }
            let start = (column - 1) as usize;
            if start < cursor {
                return Err(ChangeError::Overlap { column });
            }
            let end = start + change.original.len();
            if end > src.len() || !src.is_char_boundary(start) || !src.is_char_boundary(end) {
                return Err(ChangeError::OutOfRange { column });
            }
            if src[start..end] != change.original {
                return Err(ChangeError::OriginalMismatch {
                    column,
                    expected: change.original.clone(),
                    found: src[start..end].to_string(),
                });
            }
            out.push_str(&src[cursor..start]);
            out.push_str(&change.replacement);
            cursor = end;
        }

        out.push_str(&src[cursor..]);
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub location: String,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.location, self.message)
    }
}

impl ActionList {
    /// Checks the structural invariants of a captured document.
    pub fn validate(&self) -> Vec<Violation> {
        let mut out = Vec::new();
        let mut push = |location: String, message: String| {
            out.push(Violation { location, message })
        };

        let mut seen = HashSet::new();
        for (i, m) in self.modules.iter().enumerate() {
            let loc = format!("modules[{i}]");
            if m.path.is_empty() {
                push(loc.clone(), "Path is empty".to_string());
            } else if !seen.insert(m.path.as_str()) {
                push(loc.clone(), format!("duplicate module path {:?}", m.path));
            }
            if !m.fixed.is_empty() && !is_module_version(&m.fixed) {
                push(loc, format!("Fixed {:?} is not a module version", m.fixed));
            }
        }

        for (i, p) in self.packages.iter().enumerate() {
            if p.path.is_empty() {
                push(format!("packages[{i}]"), "Path is empty".to_string());
            }
            for (j, file) in p.files.iter().enumerate() {
                let file_loc = format!("packages[{i}].Files[{j}]");
                let mut prev: Option<u32> = None;
                for (k, line) in file.lines.iter().enumerate() {
                    let loc = format!("{file_loc}.Lines[{k}]");
                    if line.line == 0 {
                        push(loc.clone(), "line numbers are 1-based".to_string());
                    }
                    if let Some(prev) = prev {
                        if line.line <= prev {
                            push(
                                loc.clone(),
                                format!("line {} does not follow line {prev}", line.line),
                            );
                        }
                    }
                    prev = Some(line.line);

                    if line.fixed == line.original && !line.changes.is_empty() {
                        push(loc.clone(), "unchanged line carries changes".to_string());
                        continue;
                    }
                    match line.apply_changes() {
                        Ok(rebuilt) if rebuilt == line.fixed => {}
                        Ok(rebuilt) => push(
                            loc,
                            format!(
                                "changes produce {rebuilt:?}, but Fixed is {:?}",
                                line.fixed
                            ),
                        ),
                        Err(err) => push(loc, err.to_string()),
                    }
                }
            }
        }

        out
    }

    /// Copy of the document with the opaque per-package `Actions` removed.
    pub fn without_opaque_actions(&self) -> ActionList {
        let mut copy = self.clone();
        for p in &mut copy.packages {
            p.actions.clear();
        }
        copy
    }
}

/// `vMAJOR.MINOR.PATCH` with optional `-prerelease` and `+build` parts.
pub fn is_module_version(s: &str) -> bool {
    let Some(rest) = s.strip_prefix('v') else {
        return false;
    };
    let (core, build) = match rest.split_once('+') {
        Some((core, build)) => (core, Some(build)),
        None => (rest, None),
    };
    let (core, pre) = match core.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (core, None),
    };

    let numbers: Vec<&str> = core.split('.').collect();
    if numbers.len() != 3
        || numbers
            .iter()
            .any(|n| n.is_empty() || !n.chars().all(|c| c.is_ascii_digit()))
    {
        return false;
    }

    let ident_ok = |s: &str| {
        !s.is_empty()
            && s.split('.').all(|part| {
                !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            })
    };
    pre.is_none_or(ident_ok) && build.is_none_or(ident_ok)
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(original: &str, fixed: &str, changes: &[(u32, &str, &str)]) -> LineAction {
        LineAction {
            line: 1,
            original: original.to_string(),
            fixed: fixed.to_string(),
            changes: changes
                .iter()
                .map(|(column, o, r)| ChangeAction {
                    column: *column,
                    original: o.to_string(),
                    replacement: r.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn apply_changes_rebuilds_fixed_line() {
        let l = line(
            "\tb, err := ioutil.ReadAll(ioutil.NopCloser(r))",
            "\tb, err := io.ReadAll(io.NopCloser(r))",
            &[(12, "ioutil", "io"), (27, "ioutil", "io")],
        );
        assert_eq!(l.apply_changes().unwrap(), l.fixed);
    }

    #[test]
    fn apply_changes_without_changes_is_identity() {
        let l = line("foo()", "foo()", &[]);
        assert_eq!(l.apply_changes().unwrap(), "foo()");
    }

    #[test]
    fn apply_changes_rejects_overlap_and_mismatch() {
        let overlap = line("foobar", "xy", &[(1, "foo", "x"), (3, "obar", "y")]);
        assert_eq!(
            overlap.apply_changes(),
            Err(ChangeError::Overlap { column: 3 })
        );

        let mismatch = line("foo()", "bar()", &[(2, "foo", "bar")]);
        assert!(matches!(
            mismatch.apply_changes(),
            Err(ChangeError::OriginalMismatch { column: 2, .. })
        ));

        let out_of_range = line("foo", "foo!", &[(9, "", "!")]);
        assert_eq!(
            out_of_range.apply_changes(),
            Err(ChangeError::OutOfRange { column: 9 })
        );
    }

    #[test]
    fn validate_reports_line_order_and_round_trip() {
        let list = ActionList {
            modules: vec![],
            packages: vec![PackageAction {
                path: "example.com/a".to_string(),
                module: "example.com/a".to_string(),
                files: vec![FileAction {
                    name: "a.go".to_string(),
                    build: true,
                    base_file: None,
                    lines: vec![
                        LineAction {
                            line: 5,
                            ..line("foo()", "bar()", &[(1, "foo", "bar")])
                        },
                        LineAction {
                            line: 5,
                            ..line("foo()", "baz()", &[(1, "foo", "bar")])
                        },
                    ],
                }],
                ..Default::default()
            }],
        };

        let violations = list.validate();
        assert_eq!(violations.len(), 2, "{violations:?}");
        assert_eq!(violations[0].location, "packages[0].Files[0].Lines[1]");
        assert!(violations[0].message.contains("does not follow"));
        assert!(violations[1].message.contains("Fixed is"));
    }

    #[test]
    fn validate_rejects_changes_on_an_unchanged_line() {
        let list = ActionList {
            modules: vec![],
            packages: vec![PackageAction {
                path: "example.com/a".to_string(),
                module: "example.com/a".to_string(),
                files: vec![FileAction {
                    name: "a.go".to_string(),
                    build: true,
                    base_file: None,
                    lines: vec![line("foo()", "foo()", &[(1, "foo", "foo")])],
                }],
                ..Default::default()
            }],
        };

        let violations = list.validate();
        assert_eq!(violations.len(), 1, "{violations:?}");
        assert_eq!(violations[0].location, "packages[0].Files[0].Lines[0]");
        assert_eq!(violations[0].message, "unchanged line carries changes");
    }

    #[test]
    fn validate_reports_module_invariants() {
        let module = |path: &str, fixed: &str| ModuleAction {
            path: path.to_string(),
            fixed: fixed.to_string(),
            ..Default::default()
        };
        let list = ActionList {
            modules: vec![
                module("example.com/a", "v1.2.0"),
                module("example.com/a", ""),
                module("", "latest"),
            ],
            packages: vec![],
        };
        let messages: Vec<String> = list.validate().iter().map(ToString::to_string).collect();
        assert_eq!(
            messages,
            vec![
                "modules[1]: duplicate module path \"example.com/a\"".to_string(),
                "modules[2]: Path is empty".to_string(),
                "modules[2]: Fixed \"latest\" is not a module version".to_string(),
            ]
        );
    }

    #[test]
    fn module_versions() {
        assert!(is_module_version("v1.2.0"));
        assert!(is_module_version("v0.0.0-20230101120000-abcdef123456"));
        assert!(is_module_version("v2.0.0+incompatible"));
        assert!(!is_module_version("1.2.0"));
        assert!(!is_module_version("v1.2"));
        assert!(!is_module_version("v1.2.0-"));
    }

    #[test]
    fn optional_fields_are_omitted_and_nulls_read_as_empty() {
        let pkg: PackageAction = serde_json::from_str(
            r#"{"Path":"p","Module":"m","Actions":null,"Files":null}"#,
        )
        .unwrap();
        assert!(pkg.actions.is_empty());
        assert!(pkg.files.is_empty());
        assert_eq!(pkg.error, None);

        let v = serde_json::to_value(&pkg).unwrap();
        assert_eq!(
            v,
            serde_json::json!({"Path": "p", "Module": "m", "Files": []})
        );
    }

    #[test]
    fn empty_error_string_is_not_absent() {
        let pkg: PackageAction =
            serde_json::from_str(r#"{"Path":"p","Module":"m","Files":[],"Error":""}"#).unwrap();
        assert_eq!(pkg.error.as_deref(), Some(""));
    }

    #[test]
    fn keys_outside_the_schema_are_rejected() {
        let err = serde_json::from_str::<FileAction>(
            r#"{"Name":"x.go","Build":true,"BaseFileTypo":"orig.go"}"#,
        )
        .expect_err("unknown key");
        assert!(err.to_string().contains("BaseFileTypo"), "{err}");

        assert!(
            serde_json::from_str::<ActionList>(r#"{"modules":[],"packages":[],"extra":1}"#)
                .is_err()
        );
        assert!(
            serde_json::from_str::<ChangeAction>(
                r#"{"Column":1,"Original":"a","Replacement":"b","Kind":"x"}"#
            )
            .is_err()
        );
    }

    #[test]
    fn top_level_keys_are_required() {
        assert!(serde_json::from_str::<ActionList>(r#"{"modules":[]}"#).is_err());
        let list: ActionList =
            serde_json::from_str(r#"{"modules":null,"packages":[]}"#).unwrap();
        assert!(list.modules.is_empty());
    }
}
