//! Display surfaces for the tunnel status block.
//!
//! The console hands every redraw a [`StatusView`]; surfaces decide how much
//! of it to print. The terminal surface repaints the whole block in place, the
//! line surface prints only the row that changed.

use std::io::{self, Write};

use crossterm::{
    cursor, queue,
    terminal::{self, ClearType},
    tty::IsTty,
};
use unicode_width::UnicodeWidthStr;

pub const HEADER: &str = "tunnel list:";

/// One snapshot of the status block, rows in tunnel-name order.
#[derive(Debug)]
pub struct StatusView<'a> {
    /// `(tunnel name, rendered status)`.
    pub rows: Vec<(&'a str, &'a str)>,
    /// Row that triggered this redraw.
    pub changed: Option<usize>,
}

impl StatusView<'_> {
    pub fn block(&self) -> String {
        let mut out = String::with_capacity(HEADER.len() + 1 + self.rows.len() * 48);
        out.push_str(HEADER);
        out.push('\n');
        for (_, status) in &self.rows {
            out.push_str(status);
            out.push('\n');
        }
        out
    }
}

pub trait StatusSurface: Send {
    /// Whether status text for this surface may carry ANSI colors.
    fn ansi(&self) -> bool {
        false
    }

    fn render(&mut self, view: &StatusView<'_>) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DisplayMode {
    /// Terminal when stdout is a TTY, plain lines otherwise.
    #[default]
    Auto,
    Terminal,
    Plain,
}

impl std::str::FromStr for DisplayMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(DisplayMode::Auto),
            "terminal" | "tty" => Ok(DisplayMode::Terminal),
            "plain" | "line" => Ok(DisplayMode::Plain),
            _ => anyhow::bail!("display: unknown mode {s:?} (expected auto|terminal|plain)"),
        }
    }
}

/// Whether `mode` redraws in place on stdout.
pub fn uses_terminal(mode: DisplayMode) -> bool {
    match mode {
        DisplayMode::Auto => io::stdout().is_tty(),
        DisplayMode::Terminal => true,
        DisplayMode::Plain => false,
    }
}

pub fn surface_for(mode: DisplayMode) -> Box<dyn StatusSurface> {
    if uses_terminal(mode) {
        Box::new(TerminalSurface::new(io::stdout(), None))
    } else {
        Box::new(LineSurface::new(io::stdout()))
    }
}

/// Repaints the block in place: moves the cursor back over the previous
/// block, clears to the end of the screen and prints the new one.
pub struct TerminalSurface<W> {
    out: W,
    /// Fixed width for wrapping; `None` asks the terminal each redraw.
    width: Option<u16>,
    drawn_rows: u16,
}

impl<W: Write + Send> TerminalSurface<W> {
    pub fn new(out: W, width: Option<u16>) -> Self {
        Self {
            out,
            width,
            drawn_rows: 0,
        }
    }

    fn width(&self) -> Option<u16> {
        self.width
            .or_else(|| terminal::size().ok().map(|(w, _)| w))
            .filter(|w| *w > 0)
    }
}

impl<W: Write + Send> StatusSurface for TerminalSurface<W> {
    fn ansi(&self) -> bool {
        true
    }

    fn render(&mut self, view: &StatusView<'_>) -> io::Result<()> {
        if self.drawn_rows > 0 {
            queue!(
                self.out,
                cursor::MoveToPreviousLine(self.drawn_rows),
                terminal::Clear(ClearType::FromCursorDown)
            )?;
        }

        let block = view.block();
        let width = self.width();
        let rows: usize = block.lines().map(|l| screen_rows(l, width)).sum();
        self.out.write_all(block.as_bytes())?;
        self.out.flush()?;

        self.drawn_rows = u16::try_from(rows).unwrap_or(u16::MAX);
        Ok(())
    }
}

/// Rows a line occupies once the terminal wraps it.
fn screen_rows(line: &str, width: Option<u16>) -> usize {
    let Some(width) = width else {
        return 1;
    };
    let cols = UnicodeWidthStr::width(strip_ansi(line).as_str());
    cols.div_ceil(usize::from(width)).max(1)
}

/// Prints one `[name] status` line per update.
pub struct LineSurface<W> {
    out: W,
}

impl<W: Write + Send> LineSurface<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write + Send> StatusSurface for LineSurface<W> {
    fn render(&mut self, view: &StatusView<'_>) -> io::Result<()> {
        let Some((name, status)) = view.changed.and_then(|i| view.rows.get(i)) else {
            return Ok(());
        };
        writeln!(self.out, "[{name}] {status}")?;
        self.out.flush()
    }
}

/// Drop CSI escape sequences (`ESC [ ... final`).
pub fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' && chars.peek() == Some(&'[') {
            chars.next();
            for c in chars.by_ref() {
                if ('@'..='~').contains(&c) {
                    break;
                }
            }
            continue;
        }
        out.push(c);
    }
    out
}
