//! Best-effort parsing of the summary rsync prints with `--stats`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

// "Number of files: 1,234 (reg: 1,000, dir: 234)"
static TOTAL_FILES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Number of files:\s*([\d,]+)").expect("valid regex"));

// rsync >= 3.1 says "regular files"; older releases just "files".
static FILES_TRANSFERRED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Number of (?:regular )?files transferred:\s*([\d,]+)").expect("valid regex")
});

static TOTAL_SIZE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Total file size:\s*([\d,]+)").expect("valid regex"));

static BYTES_TRANSFERRED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Total transferred file size:\s*([\d,]+)").expect("valid regex")
});

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStats {
    pub total_files: Option<u64>,
    pub files_transferred: Option<u64>,
    pub total_size: Option<u64>,
    pub bytes_transferred: Option<u64>,
}

impl TransferStats {
    pub fn parse(output: &str) -> Self {
        let mut stats = Self::default();
        for line in output.lines() {
            stats.observe_line(line);
        }
        stats
    }

    /// Update from one line of output. Unrecognised lines are ignored.
    pub fn observe_line(&mut self, line: &str) {
        let line = line.trim();
        if !line.starts_with("Number of") && !line.starts_with("Total") {
            return;
        }

        let fields = [
            (&*TOTAL_FILES, &mut self.total_files),
            (&*FILES_TRANSFERRED, &mut self.files_transferred),
            (&*TOTAL_SIZE, &mut self.total_size),
            (&*BYTES_TRANSFERRED, &mut self.bytes_transferred),
        ];

        for (re, slot) in fields {
            if let Some(value) = re.captures(line).and_then(|c| parse_count(&c[1])) {
                *slot = Some(value);
                return;
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn parse_count(raw: &str) -> Option<u64> {
    raw.replace(',', "").parse().ok()
}
