//! 📊 progress.rs: "Are we there yet?" asks every pipeline, every time, forever.
//!
//! One bar over the work items of a run. Every worker ticks it when it acknowledges
//! an item; the message underneath is a tiny comfy-table of how it's going.
//!
//! ⚠️  Warning: Watching this progress bar will not make it go faster.
//! Neither will refreshing it. We've tried. Science says no.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::NOTHING};
use indicatif::{ProgressBar, ProgressStyle};

/// 🔢 Formats a number with commas for the 3 people in the audience who like readability.
/// "1000000 docs" → "1,000,000 docs": you're welcome, eyes.
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    // -- 🧵 pre-allocate like we know what we're doing (we do, we read the book)
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result
}

/// ⏱️ Formats a Duration into MM:SS or HH:MM:SS.
/// If it shows HH:MM:SS, you should probably call your mom. It's been a while.
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}

#[derive(Debug, Default)]
struct Tally {
    ok: AtomicU64,
    failed: AtomicU64,
    documents: AtomicU64,
}

/// 📊 The shared bar. Cheap to clone, every worker gets one.
#[derive(Clone)]
pub(crate) struct RunProgress {
    bar: ProgressBar,
    tally: Arc<Tally>,
    start_time: Instant,
}

impl std::fmt::Debug for RunProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // -- 🎭 ProgressBar is a diva and doesn't derive Debug
        f.debug_struct("RunProgress")
            .field("position", &self.bar.position())
            .field("length", &self.bar.length())
            .finish()
    }
}

impl RunProgress {
    /// 🚀 A bar over `total` work items. indicatif hides it on its own when stderr
    /// isn't a terminal.
    pub(crate) fn new(total: u64) -> Self {
        let bar = ProgressBar::new(total);
        // -- 🎨 cyan because it's classy, blue because it's calm
        if let Ok(style) = ProgressStyle::default_bar().template("{msg}\n| [{bar:40.cyan/blue}] {pos}/{len}") {
            bar.set_style(style.progress_chars("=>-"));
        }
        Self::with_bar(bar)
    }

    /// For tests and anyone else who'd rather not see it.
    pub(crate) fn hidden(total: u64) -> Self {
        let bar = ProgressBar::hidden();
        bar.set_length(total);
        Self::with_bar(bar)
    }

    fn with_bar(bar: ProgressBar) -> Self {
        Self {
            bar,
            tally: Arc::new(Tally::default()),
            start_time: Instant::now(),
        }
    }

    /// ✅ One item acknowledged. `documents` is how many it wrote.
    pub(crate) fn item_done(&self, label: &str, ok: bool, documents: u64) {
        if ok {
            self.tally.ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.tally.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.tally.documents.fetch_add(documents, Ordering::Relaxed);
        self.bar.inc(1);
        self.render(label);
    }

    pub(crate) fn position(&self) -> u64 {
        self.bar.position()
    }

    pub(crate) fn finish(&self) {
        self.bar.finish();
    }

    /// 🎨 Two columns, right-aligned, no borders. The borders looked bad.
    fn render(&self, label: &str) {
        let mut table = Table::new();
        table.load_preset(NOTHING);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.add_row(vec![
            Cell::new(format!("{} ok", format_number(self.tally.ok.load(Ordering::Relaxed))))
                .set_alignment(CellAlignment::Right),
            Cell::new(format!(
                "{} failed",
                format_number(self.tally.failed.load(Ordering::Relaxed))
            ))
            .set_alignment(CellAlignment::Right),
        ]);
        table.add_row(vec![
            Cell::new(format!(
                "{} Docs",
                format_number(self.tally.documents.load(Ordering::Relaxed))
            ))
            .set_alignment(CellAlignment::Right),
            Cell::new(format!("{} elapsed", format_duration(self.start_time.elapsed())))
                .set_alignment(CellAlignment::Right),
        ]);
        self.bar.set_message(format!("last: {label}\n{table}"));
    }
}
