//! On-screen preview and the dismissal key.
//!
//! A preview is polled once per acquisition step on the capture thread. Space
//! dismisses it, which ends the running capture.

use std::io::{self, Stdout, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossterm::cursor::{Hide, MoveTo, Show};
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::style::Print;
use crossterm::terminal::{
    self, disable_raw_mode, enable_raw_mode, Clear, ClearType, EnterAlternateScreen,
    LeaveAlternateScreen,
};
use crossterm::{execute, queue};
use tracing::debug;

use crate::traits::{Frame, Result};

/// Density ramp from dark to bright.
const CHARSET: &[char] = &[' ', '.', ':', '-', '=', '+', '*', '#', '%', '@'];

/// How long `show` waits for a key press; the live equivalent of `waitKey(1)`.
const LIVE_POLL: Duration = Duration::from_millis(1);

/// How long `hold` waits between key polls while a still is displayed.
const HOLD_POLL: Duration = Duration::from_millis(50);

/// Outcome of presenting one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewEvent {
    /// Keep going.
    Continue,
    /// The user pressed the dismissal key.
    Dismissed,
}

/// Somewhere to show frames while capturing.
pub trait Preview {
    /// Display `frame` and poll the dismissal key once.
    fn show(&mut self, frame: &Frame) -> Result<PreviewEvent>;

    /// Display `frame` until the user dismisses it.
    fn hold(&mut self, frame: &Frame) -> Result<()> {
        while self.show(frame)? == PreviewEvent::Continue {}
        Ok(())
    }
}

/// Preview for non-interactive runs.
///
/// Nothing is displayed, so a still is never held. Live capture runs until
/// its own limits unless the interrupt flag (set by a Ctrl-C handler) fires.
#[derive(Debug, Default, Clone)]
pub struct HeadlessPreview {
    interrupt: Option<Arc<AtomicBool>>,
}

impl HeadlessPreview {
    /// Preview that never dismisses.
    #[must_use]
    pub const fn new() -> Self {
        Self { interrupt: None }
    }

    /// Treat `flag` becoming `true` as a dismissal.
    #[must_use]
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }
}

impl Preview for HeadlessPreview {
    fn show(&mut self, _frame: &Frame) -> Result<PreviewEvent> {
        let interrupted = self
            .interrupt
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst));
        Ok(if interrupted {
            PreviewEvent::Dismissed
        } else {
            PreviewEvent::Continue
        })
    }

    fn hold(&mut self, _frame: &Frame) -> Result<()> {
        Ok(())
    }
}

/// Renders frames as ASCII art on the alternate screen.
///
/// The terminal stays in raw mode while the preview exists, so Ctrl-C arrives
/// as a key press and is treated like the dismissal key.
pub struct TerminalPreview {
    stdout: Stdout,
    title: String,
    last_sequence: Option<u64>,
}

impl TerminalPreview {
    /// Take over the terminal. It is restored when the preview is dropped.
    pub fn new<S: Into<String>>(title: S) -> Result<Self> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        if let Err(err) = execute!(stdout, EnterAlternateScreen, Hide) {
            let _ = disable_raw_mode();
            return Err(err.into());
        }
        Ok(Self {
            stdout,
            title: title.into(),
            last_sequence: None,
        })
    }

    fn render(&mut self, frame: &Frame) -> Result<()> {
        if self.last_sequence == Some(frame.metadata.sequence) {
            return Ok(());
        }
        self.last_sequence = Some(frame.metadata.sequence);

        let (cols, rows) = terminal::size()?;
        let lines = ascii_lines(frame, cols, rows.saturating_sub(1));

        queue!(self.stdout, Clear(ClearType::All))?;
        for (row, line) in (0u16..).zip(&lines) {
            queue!(self.stdout, MoveTo(0, row), Print(line))?;
        }
        let status = format!(
            "{} | frame {} | {}x{} | space to close",
            self.title, frame.metadata.sequence, frame.width, frame.height
        );
        queue!(self.stdout, MoveTo(0, rows.saturating_sub(1)), Print(status))?;
        self.stdout.flush()?;
        Ok(())
    }
}

impl Preview for TerminalPreview {
    fn show(&mut self, frame: &Frame) -> Result<PreviewEvent> {
        self.render(frame)?;
        poll_dismissal(LIVE_POLL)
    }

    fn hold(&mut self, frame: &Frame) -> Result<()> {
        self.render(frame)?;
        while poll_dismissal(HOLD_POLL)? == PreviewEvent::Continue {}
        debug!("preview dismissed");
        Ok(())
    }
}

impl Drop for TerminalPreview {
    fn drop(&mut self) {
        // Best-effort cleanup - ignore errors during drop
        let _ = execute!(self.stdout, Show, LeaveAlternateScreen);
        let _ = disable_raw_mode();
    }
}

/// Wait up to `timeout` for a key press; space or Ctrl-C dismisses.
fn poll_dismissal(timeout: Duration) -> Result<PreviewEvent> {
    if !event::poll(timeout)? {
        return Ok(PreviewEvent::Continue);
    }
    if let Event::Key(key) = event::read()? {
        let interrupt =
            key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL);
        if key.kind == KeyEventKind::Press && (key.code == KeyCode::Char(' ') || interrupt) {
            return Ok(PreviewEvent::Dismissed);
        }
    }
    Ok(PreviewEvent::Continue)
}

/// Downsample `frame` into at most `cols` x `rows` characters.
///
/// Terminal cells are about twice as tall as they are wide, so each cell
/// covers a `s` x `2s` block of pixels, keeping the aspect ratio.
fn ascii_lines(frame: &Frame, cols: u16, rows: u16) -> Vec<String> {
    if cols == 0 || rows == 0 || frame.width == 0 || frame.height == 0 {
        return Vec::new();
    }

    let scale = (f64::from(frame.width) / f64::from(cols))
        .max(f64::from(frame.height) / (2.0 * f64::from(rows)))
        .max(0.5);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let out_cols = ((f64::from(frame.width) / scale).ceil() as u32).min(u32::from(cols));
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let out_rows = ((f64::from(frame.height) / (2.0 * scale)).ceil() as u32).min(u32::from(rows));

    let levels = CHARSET.len() - 1;
    (0..out_rows)
        .map(|cy| {
            (0..out_cols)
                .map(|cx| {
                    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    let x = ((f64::from(cx) + 0.5) * scale) as u32;
                    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    let y = ((f64::from(cy) + 0.5) * 2.0 * scale) as u32;
                    let value = frame
                        .pixel(x.min(frame.width - 1), y.min(frame.height - 1))
                        .unwrap_or(0);
                    let index = usize::from(value) * levels / 255;
                    CHARSET.get(index).copied().unwrap_or(' ')
                })
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::FrameMetadata;

    fn solid(width: u32, height: u32, value: u8) -> Frame {
        Frame {
            width,
            height,
            data: vec![value; (width * height) as usize],
            metadata: FrameMetadata {
                sequence: 0,
                timestamp: Duration::ZERO,
            },
        }
    }

    #[test]
    fn test_ascii_fits_terminal() {
        let lines = ascii_lines(&solid(1282, 1026, 255), 80, 24);
        assert!(!lines.is_empty());
        assert!(lines.len() <= 24);
        assert!(lines.iter().all(|line| line.chars().count() <= 80));
        assert!(lines.iter().all(|line| line.chars().all(|c| c == '@')));
    }

    #[test]
    fn test_ascii_keeps_aspect() {
        // 4:1 frame in 1:2 cells: 80 columns need only 10 rows
        let lines = ascii_lines(&solid(200, 50, 0), 80, 24);
        let cols = lines.first().map_or(0, |line| line.chars().count());
        assert_eq!(cols, 80);
        assert_eq!(lines.len(), 10);
    }

    #[test]
    fn test_ascii_dark_is_blank() {
        let lines = ascii_lines(&solid(10, 10, 0), 10, 10);
        assert!(lines.iter().all(|line| line.trim().is_empty()));
    }

    #[test]
    fn test_ascii_empty_terminal() {
        assert!(ascii_lines(&solid(10, 10, 0), 0, 10).is_empty());
    }

    #[test]
    fn test_headless_never_holds() {
        let mut preview = HeadlessPreview::new();
        let frame = solid(4, 4, 1);
        preview.hold(&frame).expect("hold returns immediately");
        assert_eq!(
            preview.show(&frame).expect("show"),
            PreviewEvent::Continue
        );
    }

    #[test]
    fn test_headless_interrupt() {
        let flag = Arc::new(AtomicBool::new(false));
        let mut preview = HeadlessPreview::new().with_interrupt(Arc::clone(&flag));
        let frame = solid(4, 4, 1);
        assert_eq!(preview.show(&frame).expect("show"), PreviewEvent::Continue);
        flag.store(true, Ordering::SeqCst);
        assert_eq!(preview.show(&frame).expect("show"), PreviewEvent::Dismissed);
    }
}
