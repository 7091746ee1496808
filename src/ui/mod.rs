use anyhow::Error;
use std::io::{self, Write};
use unicode_width::UnicodeWidthChar;

use crate::core::Status;

#[derive(Debug, Clone)]
pub struct UiConfig {
    pub color: bool,
    pub stdin_is_tty: bool,
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
    let _ = writeln!(stderr, "  - re-run with `--verbose` for probe-level logs");
    let _ = writeln!(
        stderr,
        "  - see `ddct --help` for the available commands and options"
    );
}

pub fn format_status(status: Status, color: bool) -> String {
    let s = status.as_str();
    if !color {
        return s.to_string();
    }

    let code = match status {
        Status::Success => "32",
        Status::Warning => "33",
        Status::Failure => "31",
    };
    format!("\x1b[{code}m{s}\x1b[0m")
}

pub fn render_grid(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| visible_width_ansi(h)).collect();
    for row in rows {
        for (idx, cell) in row.iter().enumerate().take(widths.len()) {
            let w = cell.lines().map(visible_width_ansi).max().unwrap_or(0);
            widths[idx] = widths[idx].max(w);
        }
    }

    let border = |fill: char| -> String {
        let mut line = String::from("+");
        for w in &widths {
            line.push_str(&fill.to_string().repeat(w + 2));
            line.push('+');
        }
        line
    };

    let mut out = Vec::new();
    out.push(border('-'));
    let header_cells: Vec<String> = headers.iter().map(|h| (*h).to_string()).collect();
    out.extend(grid_row_lines(&header_cells, &widths));
    out.push(border('='));
    for row in rows {
        out.extend(grid_row_lines(row, &widths));
        out.push(border('-'));
    }
    out.join("\n")
}

fn grid_row_lines(cells: &[String], widths: &[usize]) -> Vec<String> {
    let split: Vec<Vec<&str>> = widths
        .iter()
        .enumerate()
        .map(|(idx, _)| {
            cells
                .get(idx)
                .map(|c| c.split('\n').collect())
                .unwrap_or_default()
        })
        .collect();
    let height = split.iter().map(Vec::len).max().unwrap_or(0).max(1);

    (0..height)
        .map(|line_no| {
            let mut line = String::from("|");
            for (idx, w) in widths.iter().enumerate() {
                let text = split[idx].get(line_no).copied().unwrap_or("");
                line.push(' ');
                line.push_str(&pad_end_ansi(text, *w));
                line.push_str(" |");
            }
            line
        })
        .collect()
}

pub fn wrap_text(text: &str, width: usize) -> String {
    let opts = textwrap::Options::new(width.max(1))
        .break_words(false)
        .word_separator(textwrap::WordSeparator::AsciiSpace)
        .word_splitter(textwrap::WordSplitter::NoHyphenation);
    textwrap::fill(text, opts)
}

pub fn print_table(title: &[&str], rows: &[Vec<String>]) {
    let mut out = io::stdout().lock();
    let _ = writeln!(out, "{}", render_grid(title, rows));
}

pub fn pad_end_ansi(s: &str, width: usize) -> String {
    let w = visible_width_ansi(s);
    if w >= width {
        return s.to_string();
    }
    format!("{s}{}", " ".repeat(width - w))
}

pub fn visible_width_ansi(s: &str) -> usize {
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

    #[test]
    fn render_grid_without_rows_is_header_only() {
        let grid = render_grid(&["Test", "Status"], &[]);
        assert_eq!(
            grid,
            "+------+--------+\n| Test | Status |\n+======+========+"
        );
    }

    #[test]
    fn render_grid_expands_multiline_cells() {
        let rows = vec![vec!["ARP".to_string(), "a\nbb".to_string()]];
        let grid = render_grid(&["Test", "Reasons"], &rows);
        let lines: Vec<&str> = grid.lines().collect();
        assert_eq!(lines[3], "| ARP  | a       |");
        assert_eq!(lines[4], "|      | bb      |");
        assert_eq!(lines[5], "+------+---------+");
    }

    #[test]
    fn colored_cells_are_padded_by_visible_width() {
        let rows = vec![vec![format_status(Status::Failure, true)]];
        let grid = render_grid(&["Status"], &rows);
        let row = grid.lines().nth(3).expect("row");
        assert_eq!(visible_width_ansi(row), "| Status |".len());
    }

    #[test]
    fn wrap_text_breaks_on_words() {
        assert_eq!(wrap_text("aa bb cc", 5), "aa bb\ncc");
        assert_eq!(wrap_text("averylongword x", 4), "averylongword\nx");
        assert_eq!(wrap_text("", 10), "");
        assert_eq!(
            wrap_text("systemctl restart multipath-tools", 20),
            "systemctl restart\nmultipath-tools"
        );
    }
}
