//! Translating ANSI SGR escape sequences into inline HTML.
//!
//! The submission log and result tables use terminal colors; the UI renders
//! HTML. This is a pure string-to-string translation with no global state,
//! covering the SGR subset the worker emits: reset, bold, underline, reverse,
//! the 16 base colors and 256-color `38;5;N` / `48;5;N` selections.

use once_cell::sync::Lazy;
use regex::Regex;

static SGR: Lazy<Regex> = Lazy::new(|| Regex::new("\x1b\\[([0-9;]*)m").unwrap());

/// The 16 base colors, xterm defaults.
const BASE_PALETTE: [&str; 16] = [
    "#000000", "#cd0000", "#00cd00", "#cdcd00", "#0000ee", "#cd00cd", "#00cdcd", "#e5e5e5",
    "#7f7f7f", "#ff0000", "#00ff00", "#ffff00", "#5c5cff", "#ff00ff", "#00ffff", "#ffffff",
];

#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct Style {
    bold: bool,
    underline: bool,
    reverse: bool,
    fg: Option<String>,
    bg: Option<String>,
}

impl Style {
    fn css(&self) -> Option<String> {
        let (fg, bg) = if self.reverse {
            (self.bg.as_deref().or(Some("#000000")), self.fg.as_deref().or(Some("#e5e5e5")))
        } else {
            (self.fg.as_deref(), self.bg.as_deref())
        };
        let mut css = String::new();
        if let Some(fg) = fg {
            css.push_str("color:");
            css.push_str(fg);
            css.push(';');
        }
        if let Some(bg) = bg {
            css.push_str("background-color:");
            css.push_str(bg);
            css.push(';');
        }
        if self.bold {
            css.push_str("font-weight:bold;");
        }
        if self.underline {
            css.push_str("text-decoration:underline;");
        }
        if css.is_empty() {
            None
        } else {
            Some(css)
        }
    }

    fn apply(&mut self, params: &str) {
        let codes: Vec<u16> = if params.is_empty() {
            vec![0]
        } else {
            params.split(';').map(|p| p.parse().unwrap_or(0)).collect()
        };
        let mut i = 0;
        while i < codes.len() {
            match codes[i] {
                0 => *self = Style::default(),
                1 => self.bold = true,
                4 => self.underline = true,
                7 => self.reverse = true,
                22 => self.bold = false,
                24 => self.underline = false,
                27 => self.reverse = false,
                30..=37 => self.fg = Some(BASE_PALETTE[(codes[i] - 30) as usize].to_string()),
                90..=97 => self.fg = Some(BASE_PALETTE[(codes[i] - 90 + 8) as usize].to_string()),
                40..=47 => self.bg = Some(BASE_PALETTE[(codes[i] - 40) as usize].to_string()),
                100..=107 => self.bg = Some(BASE_PALETTE[(codes[i] - 100 + 8) as usize].to_string()),
                39 => self.fg = None,
                49 => self.bg = None,
                38 | 48 if codes.get(i + 1) == Some(&5) && i + 2 < codes.len() => {
                    let color = xterm256(codes[i + 2] as u8);
                    if codes[i] == 38 {
                        self.fg = Some(color);
                    } else {
                        self.bg = Some(color);
                    }
                    i += 2;
                }
                _ => {}
            }
            i += 1;
        }
    }
}

/// Maps an xterm 256-color index to its `#rrggbb` value.
fn xterm256(index: u8) -> String {
    match index {
        0..=15 => BASE_PALETTE[index as usize].to_string(),
        16..=231 => {
            const LEVELS: [u8; 6] = [0, 95, 135, 175, 215, 255];
            let n = index - 16;
            let r = LEVELS[(n / 36) as usize];
            let g = LEVELS[((n / 6) % 6) as usize];
            let b = LEVELS[(n % 6) as usize];
            format!("#{:02x}{:02x}{:02x}", r, g, b)
        }
        232..=255 => {
            let v = 8 + 10 * (index - 232);
            format!("#{:02x}{:02x}{:02x}", v, v, v)
        }
    }
}

/// Escapes the HTML metacharacters of `text`.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

/// Translates ANSI SGR sequences in `input` to HTML `<span>`s with inline
/// styles, escaping everything else. Unknown SGR codes are dropped; text
/// outside escape sequences is preserved verbatim.
pub fn ansi_to_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut style = Style::default();
    let mut open_css: Option<String> = None;
    let mut last = 0;

    for caps in SGR.captures_iter(input) {
        let whole = caps.get(0).unwrap();
        emit(&mut out, &input[last..whole.start()], &style, &mut open_css);
        style.apply(caps.get(1).unwrap().as_str());
        last = whole.end();
    }
    emit(&mut out, &input[last..], &style, &mut open_css);
    if open_css.is_some() {
        out.push_str("</span>");
    }
    out
}

fn emit(out: &mut String, text: &str, style: &Style, open_css: &mut Option<String>) {
    if text.is_empty() {
        return;
    }
    let wanted = style.css();
    if *open_css != wanted {
        if open_css.is_some() {
            out.push_str("</span>");
        }
        if let Some(css) = &wanted {
            out.push_str("<span style=\"");
            out.push_str(css);
            out.push_str("\">");
        }
        *open_css = wanted;
    }
    out.push_str(&escape_html(text));
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn plain_text_is_escaped_only() {
        assert_eq!(ansi_to_html("a < b && c"), "a &lt; b &amp;&amp; c");
    }

    #[test]
    fn base_color_becomes_span() {
        assert_eq!(
            ansi_to_html("\x1b[31mred\x1b[0m plain"),
            "<span style=\"color:#cd0000;\">red</span> plain"
        );
    }

    #[test]
    fn bold_name_like_the_worker_log() {
        assert_eq!(
            ansi_to_html("\x1b[1mworker-1\x1b[0m done"),
            "<span style=\"font-weight:bold;\">worker-1</span> done"
        );
    }

    #[test]
    fn table_row_with_256_colors() {
        let html = ansi_to_html("\x1b[48;5;65m\x1b[38;5;232m ok \x1b[0m");
        assert_eq!(
            html,
            "<span style=\"color:#080808;background-color:#5f875f;\"> ok </span>"
        );
    }

    #[test]
    fn consecutive_sequences_collapse_into_one_span() {
        let html = ansi_to_html("\x1b[1m\x1b[33mwarn\x1b[0m");
        assert_eq!(
            html,
            "<span style=\"color:#cdcd00;font-weight:bold;\">warn</span>"
        );
    }

    #[test]
    fn unknown_codes_are_dropped() {
        assert_eq!(ansi_to_html("\x1b[95;99mx\x1b[0m"), "<span style=\"color:#ff00ff;\">x</span>");
    }

    #[test]
    fn grayscale_ramp() {
        assert_eq!(xterm256(232), "#080808");
        assert_eq!(xterm256(255), "#eeeeee");
    }

    #[test]
    fn translation_is_pure() {
        let input = "\x1b[31ma\x1b[0mb";
        assert_eq!(ansi_to_html(input), ansi_to_html(input));
    }
}
