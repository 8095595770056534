//! Built-in rule checks.

use std::path::Path;

use chrono::{Local, NaiveDate};

use crate::engine::{RuleCheck, RuleId};

pub const ENCODING_LINE: &str = "# -*- coding: utf-8 -*-";

/// How many leading lines may precede the encoding declaration.
const ENCODING_WINDOW: usize = 5;
/// How many leading lines are searched for a header.
const HEADER_WINDOW: usize = 10;

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

fn is_shebang(line: &str) -> bool {
    line.starts_with("#!")
}

fn is_encoding_line(line: &str) -> bool {
    let line = line.trim();
    line.starts_with('#') && (line.contains("coding:") || line.contains("coding="))
}

/// Insert `new_lines` before line index `at`, keeping the file's line ending.
fn insert_lines(content: &str, at: usize, new_lines: &[String]) -> String {
    let eol = if content.contains("\r\n") { "\r\n" } else { "\n" };
    let mut lines: Vec<String> = content.split_inclusive('\n').map(str::to_string).collect();
    let at = at.min(lines.len());
    if at > 0 && !lines[at - 1].ends_with('\n') {
        lines[at - 1].push_str(eol);
    }
    let block: Vec<String> = new_lines.iter().map(|l| format!("{l}{eol}")).collect();
    lines.splice(at..at, block);
    lines.concat()
}

// ── encoding_declaration ──────────────────────────────────────────────────────

/// Python sources declare UTF-8 near the top.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncodingDeclaration;

impl RuleCheck for EncodingDeclaration {
    fn id(&self) -> RuleId {
        RuleId::EncodingDeclaration
    }

    fn applies_to(&self, path: &Path) -> bool {
        extension(path).as_deref() == Some("py")
    }

    fn inspect(&self, _path: &Path, content: &str) -> Option<String> {
        if content.lines().take(ENCODING_WINDOW).any(is_encoding_line) {
            None
        } else {
            Some("missing UTF-8 encoding declaration".to_string())
        }
    }

    fn fix(&self, _path: &Path, content: &str) -> String {
        let at = usize::from(content.lines().next().is_some_and(is_shebang));
        insert_lines(content, at, &[ENCODING_LINE.to_string()])
    }
}

// ── header_comment ────────────────────────────────────────────────────────────

/// Scripts open with a header: a docstring for Python, a `#` comment block
/// for shell and PowerShell.
#[derive(Debug, Clone, Default)]
pub struct HeaderComment {
    /// Date stamped into inserted headers; today when unset.
    pub date: Option<NaiveDate>,
}

impl HeaderComment {
    fn stamp(&self) -> String {
        self.date
            .unwrap_or_else(|| Local::now().date_naive())
            .format("%Y-%m-%d")
            .to_string()
    }
}

impl RuleCheck for HeaderComment {
    fn id(&self) -> RuleId {
        RuleId::HeaderComment
    }

    fn applies_to(&self, path: &Path) -> bool {
        matches!(extension(path).as_deref(), Some("py" | "sh" | "ps1"))
    }

    fn inspect(&self, path: &Path, content: &str) -> Option<String> {
        let mut head = content.lines().take(HEADER_WINDOW);
        let present = if extension(path).as_deref() == Some("py") {
            head.any(|line| {
                let line = line.trim_start().trim_start_matches(['r', 'R', 'u', 'U']);
                line.starts_with("\"\"\"") || line.starts_with("'''")
            })
        } else {
            head.find(|line| !is_shebang(line) && !line.trim().is_empty())
                .is_some_and(|line| {
                    let line = line.trim_start();
                    line.starts_with('#') || line.starts_with("<#")
                })
        };
        if present {
            None
        } else {
            Some("missing header comment".to_string())
        }
    }

    fn fix(&self, path: &Path, content: &str) -> String {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let at = content
            .lines()
            .take_while(|line| is_shebang(line) || is_encoding_line(line))
            .count();
        let stamp = format!("Header added by warden on {}.", self.stamp());
        let header = if extension(path).as_deref() == Some("py") {
            vec![
                "\"\"\"".to_string(),
                name,
                String::new(),
                stamp,
                "\"\"\"".to_string(),
            ]
        } else {
            vec![format!("# {name}"), format!("# {stamp}")]
        };
        insert_lines(content, at, &header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> HeaderComment {
        HeaderComment {
            date: NaiveDate::from_ymd_opt(2024, 1, 1),
        }
    }

    #[test]
    fn encoding_found_within_window() {
        let check = EncodingDeclaration;
        let p = Path::new("m.py");
        assert!(check.inspect(p, "#!/usr/bin/env python3\n# -*- coding: utf-8 -*-\n").is_none());
        assert!(check.inspect(p, "# vim: set fileencoding=utf-8 :\n").is_none());
        assert!(check.inspect(p, "import os\n").is_some());
        assert!(check.inspect(p, "\n\n\n\n\n# -*- coding: utf-8 -*-\n").is_some());
    }

    #[test]
    fn encoding_goes_after_shebang() {
        let fixed = EncodingDeclaration.fix(Path::new("m.py"), "#!/usr/bin/env python3\nprint(1)\n");
        assert_eq!(fixed, "#!/usr/bin/env python3\n# -*- coding: utf-8 -*-\nprint(1)\n");

        let fixed = EncodingDeclaration.fix(Path::new("m.py"), "");
        assert_eq!(fixed, "# -*- coding: utf-8 -*-\n");
    }

    #[test]
    fn encoding_fix_handles_missing_trailing_newline_and_crlf() {
        let fixed = EncodingDeclaration.fix(Path::new("m.py"), "#!/usr/bin/python");
        assert_eq!(fixed, "#!/usr/bin/python\n# -*- coding: utf-8 -*-\n");

        let fixed = EncodingDeclaration.fix(Path::new("m.py"), "a = 1\r\nb = 2\r\n");
        assert_eq!(fixed, "# -*- coding: utf-8 -*-\r\na = 1\r\nb = 2\r\n");
    }

    #[test]
    fn encoding_only_applies_to_python() {
        assert!(EncodingDeclaration.applies_to(Path::new("x/a.PY")));
        assert!(!EncodingDeclaration.applies_to(Path::new("run.sh")));
        assert!(!EncodingDeclaration.applies_to(Path::new("README")));
    }

    #[test]
    fn python_header_is_a_docstring() {
        let check = header();
        let p = Path::new("pkg/a.py");
        assert!(check.inspect(p, "# -*- coding: utf-8 -*-\n\"\"\"Doc.\"\"\"\n").is_none());
        assert!(check.inspect(p, "r'''raw doc'''\n").is_none());
        assert!(check.inspect(p, "# just a comment\nimport os\n").is_some());

        let fixed = check.fix(p, "#!/usr/bin/env python3\n# -*- coding: utf-8 -*-\nimport os\n");
        assert_eq!(
            fixed,
            "#!/usr/bin/env python3\n# -*- coding: utf-8 -*-\n\"\"\"\na.py\n\nHeader added by warden on 2024-01-01.\n\"\"\"\nimport os\n"
        );
        assert!(check.inspect(p, &fixed).is_none());
    }

    #[test]
    fn shell_header_is_a_comment_after_shebang() {
        let check = header();
        let p = Path::new("deploy.sh");
        assert!(check.inspect(p, "#!/bin/sh\n# Deploys things.\nset -e\n").is_none());
        assert!(check.inspect(p, "#!/bin/sh\nset -e\n").is_some());
        assert!(check.inspect(p, "#!/bin/sh\n").is_some());

        let fixed = check.fix(p, "#!/bin/sh\nset -e\n");
        assert_eq!(
            fixed,
            "#!/bin/sh\n# deploy.sh\n# Header added by warden on 2024-01-01.\nset -e\n"
        );
        assert!(check.inspect(p, &fixed).is_none());
    }

    #[test]
    fn powershell_block_comment_counts_as_header() {
        let check = header();
        assert!(check.inspect(Path::new("a.ps1"), "<#\n.SYNOPSIS\n#>\n").is_none());
        assert!(check.inspect(Path::new("a.ps1"), "Write-Host hi\n").is_some());
        assert!(!check.applies_to(Path::new("notes.md")));
    }
}
