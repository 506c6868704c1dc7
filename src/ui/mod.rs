use anyhow::Error;
use std::io::{self, Write};
use unicode_width::UnicodeWidthChar;

use crate::config::EffectiveConfig;
use crate::core::ActionList;
use crate::engine::{CaseReport, CaseStatus, RunReport};

#[derive(Debug, Clone)]
pub struct UiConfig {
    pub color: bool,
    pub stdout_is_tty: bool,
    pub stderr_is_tty: bool,
    pub quiet: bool,
    pub verbose: bool,
}

pub fn eprintln_error(err: &Error) {
    let mut stderr = io::stderr().lock();
    let _ = writeln!(stderr, "error:");
    let _ = writeln!(stderr, "  {err}");

    let mut causes = err.chain().skip(1).peekable();
    if causes.peek().is_some() {
        let _ = writeln!(stderr, "caused by:");
        for cause in causes {
            let _ = writeln!(stderr, "  - {cause}");
        }
    }

    let _ = writeln!(stderr, "next:");
    let _ = writeln!(stderr, "  - re-run with `--verbose` for details");
    let _ = writeln!(
        stderr,
        "  - see `portcheck --help` for available commands and options"
    );
}

/// One line per finished case; failures are followed by their diagnostics.
pub fn print_case(out: &mut dyn Write, case: &CaseReport, cfg: &UiConfig) {
    if cfg.quiet && !matches!(case.status, CaseStatus::Failed | CaseStatus::Error) {
        return;
    }
    let status = pad_end_ansi(&format_status(case.status, cfg.color), 7);
    let _ = write!(out, "{status} {}", case.label());
    if case.status != CaseStatus::Skipped {
        let _ = write!(out, " ({})", format_duration_ms(case.duration_ms));
    }
    let _ = writeln!(out);

    let show_message = match case.status {
        CaseStatus::Passed => false,
        CaseStatus::Skipped => cfg.verbose,
        CaseStatus::Blessed | CaseStatus::Failed | CaseStatus::Error => true,
    };
    if show_message {
        if let Some(message) = &case.message {
            write_indented(out, message, "    ");
        }
    }
    if let Some(dir) = &case.workspace {
        let _ = writeln!(out, "    workspace kept at {dir}");
    }
    if cfg.verbose {
        for note in &case.notes {
            let _ = writeln!(out, "    note: {note}");
        }
    }
    for section in &case.sections {
        let _ = writeln!(out, "    --- {} ---", section.label);
        if section.text.trim().is_empty() {
            let _ = writeln!(out, "      (empty)");
        } else {
            write_indented(out, section.text.trim_end(), "      ");
        }
    }
}

pub fn print_run_summary(out: &mut dyn Write, report: &RunReport, cfg: &UiConfig) {
    let s = &report.summary;
    let mut parts = vec![format!("{} passed", s.passed)];
    if s.blessed > 0 {
        parts.push(format!("{} blessed", s.blessed));
    }
    parts.push(format!("{} skipped", s.skipped));
    parts.push(format!("{} failed", s.failed));
    if s.errors > 0 {
        parts.push(format!("{} errors", s.errors));
    }
    let verdict = if report.has_failures() {
        format_status(CaseStatus::Failed, cfg.color)
    } else {
        format_status(CaseStatus::Passed, cfg.color)
    };
    let _ = writeln!(out);
    let _ = writeln!(out, "{verdict}: {}", parts.join(", "));
}

/// Normalized test matrix for `list`: one row per case.
pub fn print_matrix(out: &mut dyn Write, cfg: &EffectiveConfig) {
    let labels = ["MODULE", "TEST", "TARGETS", "FIXTURE", "GATES"];

    let mut rows: Vec<[String; 5]> = Vec::new();
    for (path, module) in &cfg.modules {
        let mut module_gates = vec![];
        if module.long {
            module_gates.push("long".to_string());
        }
        if module.skip_latest {
            module_gates.push("skip-latest".to_string());
        }
        if module.tests.is_empty() {
            module_gates.push("no tests".to_string());
            rows.push([
                path.clone(),
                "-".to_string(),
                "-".to_string(),
                "-".to_string(),
                module_gates.join(","),
            ]);
            continue;
        }
        for test in &module.tests {
            let mut gates = module_gates.clone();
            if test.long && !module.long {
                gates.push("long".to_string());
            }
            if let Some(v) = test.go_version {
                gates.push(format!("go>={v}"));
            }
            rows.push([
                path.clone(),
                test.name.clone(),
                truncate_middle(&test.paths.join(","), 48),
                test.expected.clone(),
                gates.join(","),
            ]);
        }
    }

    let mut widths = labels.map(visible_width_ansi);
    for row in &rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(visible_width_ansi(cell));
        }
    }

    let render = |cells: [&str; 5]| {
        let line = cells
            .iter()
            .zip(widths)
            .map(|(cell, w)| pad_end_display(cell, w))
            .collect::<Vec<_>>()
            .join("  ");
        line.trim_end().to_string()
    };
    let _ = writeln!(out, "{}", render(labels));
    let dashes = widths.map(|w| "-".repeat(w));
    let _ = writeln!(out, "{}", render(dashes.each_ref().map(String::as_str)));
    for row in &rows {
        let _ = writeln!(out, "{}", render(row.each_ref().map(String::as_str)));
    }
}

/// Human-readable rendition of a port run.
pub fn print_port_summary(out: &mut dyn Write, list: &ActionList, cfg: &UiConfig) {
    for module in &list.modules {
        let _ = writeln!(out, "module {}", module.path);
    }
    for pkg in &list.packages {
        let changed: usize = pkg
            .files
            .iter()
            .map(|f| f.lines.iter().filter(|l| l.original != l.fixed).count())
            .sum();
        let _ = writeln!(
            out,
            "package {} ({} files, {changed} lines changed)",
            pkg.path,
            pkg.files.len()
        );
        if let Some(err) = &pkg.error {
            let _ = writeln!(out, "  error: {err}");
        }
        if !cfg.verbose {
            continue;
        }
        for file in &pkg.files {
            for line in file.lines.iter().filter(|l| l.original != l.fixed) {
                let _ = writeln!(out, "  {}:{}", file.name, line.line);
                let _ = writeln!(out, "    - {}", line.original);
                let _ = writeln!(out, "    + {}", line.fixed);
            }
        }
    }
}

fn write_indented(out: &mut dyn Write, text: &str, indent: &str) {
    for line in text.lines() {
        let _ = writeln!(out, "{indent}{line}");
    }
}

fn status_label(status: CaseStatus) -> &'static str {
    match status {
        CaseStatus::Passed => "PASS",
        CaseStatus::Blessed => "BLESSED",
        CaseStatus::Skipped => "SKIP",
        CaseStatus::Failed => "FAIL",
        CaseStatus::Error => "ERROR",
    }
}

fn format_status(status: CaseStatus, color: bool) -> String {
    let s = status_label(status);
    if !color {
        return s.to_string();
    }

    let code = match status {
        CaseStatus::Passed => "32",
        CaseStatus::Blessed => "36",
        CaseStatus::Skipped => "90",
        CaseStatus::Failed => "31",
        CaseStatus::Error => "33",
    };
    format!("\x1b[{code}m{s}\x1b[0m")
}

fn format_duration_ms(ms: u64) -> String {
    if ms < 1000 {
        return format!("{ms}ms");
    }
    format!("{:.1}s", ms as f64 / 1000.0)
}

fn truncate_middle(s: &str, max_chars: usize) -> String {
    let len = s.chars().count();
    if len <= max_chars {
        return s.to_string();
    }

    let keep = max_chars.saturating_sub(3);
    let left = keep / 2;
    let right = keep.saturating_sub(left);

    let prefix: String = s.chars().take(left).collect();
    let suffix: String = s.chars().skip(len - right).collect();

    format!("{prefix}...{suffix}")
}

fn pad_end_ansi(s: &str, width: usize) -> String {
    let w = visible_width_ansi(s);
    if w >= width {
        return s.to_string();
    }
    format!("{s}{}", " ".repeat(width - w))
}

fn pad_end_display(s: &str, width: usize) -> String {
    pad_end_ansi(s, width)
}

fn visible_width_ansi(s: &str) -> usize {
    let mut width: usize = 0;
    let mut chars = s.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\x1b' && chars.peek() == Some(&'[') {
            let _ = chars.next();
            for ch2 in chars.by_ref() {
                if ch2 == 'm' {
                    break;
                }
            }
            continue;
        }
        width = width.saturating_add(UnicodeWidthChar::width(ch).unwrap_or(0));
    }
    width
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Section;

    fn ui(color: bool) -> UiConfig {
        UiConfig {
            color,
            stdout_is_tty: false,
            stderr_is_tty: false,
            quiet: false,
            verbose: false,
        }
    }

    fn case(status: CaseStatus) -> CaseReport {
        CaseReport {
            module: "example.com/acme/lib".to_string(),
            test: Some("v1.2.0".to_string()),
            status,
            message: Some("output differs from fixture at packages[0].Path".to_string()),
            sections: vec![
                Section {
                    label: "expected".to_string(),
                    text: "{\n  \"a\": 1\n}".to_string(),
                },
                Section {
                    label: "actual".to_string(),
                    text: String::new(),
                },
            ],
            workspace: None,
            notes: vec![],
            duration_ms: 1500,
        }
    }

    #[test]
    fn failed_case_shows_message_and_both_documents() {
        let mut out = Vec::new();
        print_case(&mut out, &case(CaseStatus::Failed), &ui(false));
        let s = String::from_utf8(out).unwrap();
        assert!(s.starts_with("FAIL    example.com/acme/lib@v1.2.0 (1.5s)\n"));
        assert!(s.contains("    output differs from fixture at packages[0].Path\n"));
        assert!(s.contains("    --- expected ---\n      {\n        \"a\": 1\n      }\n"));
        assert!(s.contains("    --- actual ---\n      (empty)\n"));
    }

    #[test]
    fn notes_are_printed_only_when_verbose() {
        let mut passed = case(CaseStatus::Passed);
        passed.sections.clear();
        passed.notes = vec!["no go.mod upstream; synthesized".to_string()];

        let mut out = Vec::new();
        print_case(&mut out, &passed, &ui(false));
        assert!(!String::from_utf8(out).unwrap().contains("note:"));

        let cfg = UiConfig {
            verbose: true,
            ..ui(false)
        };
        let mut out = Vec::new();
        print_case(&mut out, &passed, &cfg);
        assert!(
            String::from_utf8(out)
                .unwrap()
                .contains("    note: no go.mod upstream; synthesized\n")
        );
    }

    #[test]
    fn quiet_hides_passing_cases() {
        let mut passed = case(CaseStatus::Passed);
        passed.sections.clear();
        let cfg = UiConfig {
            quiet: true,
            ..ui(false)
        };
        let mut out = Vec::new();
        print_case(&mut out, &passed, &cfg);
        assert!(out.is_empty());
    }

    #[test]
    fn colored_status_keeps_column_alignment() {
        assert_eq!(visible_width_ansi(&format_status(CaseStatus::Skipped, true)), 4);
        assert_eq!(
            visible_width_ansi(&pad_end_ansi(&format_status(CaseStatus::Passed, true), 7)),
            7
        );
        assert_eq!(visible_width_ansi("モジュール"), 10);
    }

    #[test]
    fn matrix_lists_one_row_per_case_with_gates() {
        let cfg = crate::config::from_toml_str(
            r#"
[modules."example.com/acme/lib/v2"]
long = true
tests = [{ version = "v2.0.0", go_version = "1.18" }]

[modules."example.com/empty"]
"#,
        )
        .unwrap();
        let mut out = Vec::new();
        print_matrix(&mut out, &cfg);
        let s = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = s.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("MODULE  "));
        assert!(lines[2].starts_with("example.com/acme/lib/v2  v2.0.0"));
        assert!(lines[2].contains("lib_v2@v2.0.0.json"));
        assert!(lines[2].ends_with("long,go>=1.18"));
        assert!(lines[3].starts_with("example.com/empty"));
        assert!(lines[3].ends_with("no tests"));
    }
}
