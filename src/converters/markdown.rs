//! Markdown writers shared by the structured-document converters.
//!
//! Pure string builders: pipe tables and inline emphasis. No I/O.

/// A run of inline text with its formatting.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TextRun {
    pub text: String,
    pub bold: bool,
    pub italic: bool,
}

impl TextRun {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    fn same_format(&self, other: &TextRun) -> bool {
        self.bold == other.bold && self.italic == other.italic
    }
}

const BOLD: &str = "**";
const ITALIC: &str = "*";

/// Render runs as inline Markdown.
///
/// Adjacent runs with the same formatting are merged first so a word split
/// across runs does not turn into `**Hel****lo**`. Emphasis then nests: a
/// marker stays open while the following runs keep it, so italic text that
/// turns bold renders as `*it**both***` instead of back-to-back markers.
/// Whitespace is kept outside the markers (`** x**` is not emphasis in
/// CommonMark).
pub fn render_runs(runs: &[TextRun]) -> String {
    let mut merged: Vec<TextRun> = Vec::with_capacity(runs.len());
    for run in runs.iter().filter(|r| !r.text.is_empty()) {
        match merged.last_mut() {
            Some(last) if last.same_format(run) => last.text.push_str(&run.text),
            _ => merged.push(run.clone()),
        }
    }

    let mut out = String::new();
    let mut open: Vec<&'static str> = Vec::new();
    let mut pending_space = String::new();
    for run in &merged {
        let core = run.text.trim();
        if core.is_empty() {
            pending_space.push_str(&run.text);
            continue;
        }
        let wanted = |marker: &str| match marker {
            BOLD => run.bold,
            _ => run.italic,
        };
        while open.iter().any(|m| !wanted(*m)) {
            if let Some(marker) = open.pop() {
                out.push_str(marker);
            }
        }
        out.push_str(&pending_space);
        pending_space.clear();
        out.push_str(&run.text[..run.text.len() - run.text.trim_start().len()]);
        for (marker, on) in [(BOLD, run.bold), (ITALIC, run.italic)] {
            if on && !open.contains(&marker) {
                out.push_str(marker);
                open.push(marker);
            }
        }
        out.push_str(core);
        pending_space.push_str(&run.text[run.text.trim_end().len()..]);
    }
    while let Some(marker) = open.pop() {
        out.push_str(marker);
    }
    out.push_str(&pending_space);
    out
}

/// Escape a cell for a pipe table: literal `|` becomes `\|`, line breaks
/// collapse to spaces.
pub fn escape_cell(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace('|', "\\|")
}

/// Render rows as a GitHub-flavoured pipe table.
///
/// The first row is the header. Short rows are padded with empty cells to
/// the widest row before the separator is emitted. Cells are escaped here.
pub fn pipe_table(rows: &[Vec<String>]) -> String {
    let col_count = rows.iter().map(Vec::len).max().unwrap_or(0);
    if col_count == 0 {
        return String::new();
    }

    let render_row = |row: &Vec<String>| -> String {
        let cells: Vec<String> = (0..col_count)
            .map(|i| row.get(i).map(|c| escape_cell(c)).unwrap_or_default())
            .collect();
        format!("| {} |", cells.join(" | "))
    };

    let mut lines = Vec::with_capacity(rows.len() + 1);
    lines.push(render_row(&rows[0]));
    lines.push(format!("| {} |", vec!["---"; col_count].join(" | ")));
    lines.extend(rows[1..].iter().map(render_row));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn table_escapes_pipes_and_pads_rows() {
        let rows = vec![row(&["Name", "Value", "Note"]), row(&["a|b", "1"]), row(&["c"])];
        let md = pipe_table(&rows);
        let lines: Vec<&str> = md.lines().collect();
        assert_eq!(lines[0], "| Name | Value | Note |");
        assert_eq!(lines[1], "| --- | --- | --- |");
        assert_eq!(lines[2], "| a\\|b | 1 |  |");
        assert_eq!(lines[3], "| c |  |  |");
    }

    #[test]
    fn separator_follows_header_even_when_header_is_short() {
        let rows = vec![row(&["H"]), row(&["1", "2"])];
        let md = pipe_table(&rows);
        assert_eq!(md, "| H |  |\n| --- | --- |\n| 1 | 2 |");
    }

    #[test]
    fn empty_table_renders_nothing() {
        assert_eq!(pipe_table(&[]), "");
        assert_eq!(pipe_table(&[vec![]]), "");
    }

    fn run(text: &str, bold: bool, italic: bool) -> TextRun {
        TextRun { text: text.into(), bold, italic }
    }

    #[test]
    fn emphasis_markers() {
        assert_eq!(render_runs(&[run("x", true, true)]), "***x***");
        assert_eq!(render_runs(&[run("x", true, false)]), "**x**");
        assert_eq!(render_runs(&[run("x", false, true)]), "*x*");
        assert_eq!(render_runs(&[run("x", false, false)]), "x");
        assert_eq!(render_runs(&[run(" bold ", true, false)]), " **bold** ");
        assert_eq!(render_runs(&[run("   ", true, false)]), "   ");
    }

    #[test]
    fn changing_emphasis_nests_instead_of_touching() {
        let runs = [run("it", false, true), run("both", true, true), run(" plain", false, false)];
        assert_eq!(render_runs(&runs), "*it**both*** plain");

        let runs = [run("both", true, true), run(" bold", true, false)];
        assert_eq!(render_runs(&runs), "***both* bold**");

        let runs = [run("it ", false, true), run("bold", true, false)];
        assert_eq!(render_runs(&runs), "*it* **bold**");
    }

    #[test]
    fn adjacent_runs_merge() {
        let runs = vec![
            TextRun { text: "Hel".into(), bold: true, italic: false },
            TextRun { text: "lo".into(), bold: true, italic: false },
            TextRun::plain(" world"),
            TextRun { text: "".into(), bold: false, italic: true },
        ];
        assert_eq!(render_runs(&runs), "**Hello** world");
    }
}
