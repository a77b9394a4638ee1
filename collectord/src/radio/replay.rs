use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};
use super::{Advertisement, ScanDriver, ScanEnd};

/// Replays a JSON-lines capture: each line is one scan window, an array of
/// advertisements.
pub struct ReplayDriver {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    line_no: usize,
    realtime: bool,
    loop_capture: bool,
}

impl ReplayDriver {
    pub fn open(path: impl AsRef<Path>, realtime: bool, loop_capture: bool) -> Result<Self> {
        let path = path.as_ref();
        Ok(Self {
            path: path.to_path_buf(),
            lines: open_lines(path)?,
            line_no: 0,
            realtime,
            loop_capture,
        })
    }

    fn next_window(&mut self) -> Result<Option<Vec<Advertisement>>> {
        let mut rewound = false;
        loop {
            match self.lines.next() {
                Some(line) => {
                    let line = line
                        .with_context(|| format!("Failed to read {}", self.path.display()))?;
                    self.line_no += 1;
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Vec<Advertisement>>(&line) {
                        Ok(window) => return Ok(Some(window)),
                        Err(e) => tracing::warn!(
                            "Skipping {}:{}: {}",
                            self.path.display(),
                            self.line_no,
                            e
                        ),
                    }
                }
                // rewinding an empty capture twice would spin forever
                None if self.loop_capture && !rewound => {
                    tracing::debug!("Rewinding capture {}", self.path.display());
                    self.lines = open_lines(&self.path)?;
                    self.line_no = 0;
                    rewound = true;
                }
                None => return Ok(None),
            }
        }
    }
}

impl ScanDriver for ReplayDriver {
    fn scan(&mut self, window: Duration, sink: &mut dyn FnMut(Advertisement)) -> Result<ScanEnd> {
        let Some(adverts) = self.next_window()? else {
            return Ok(ScanEnd::Exhausted);
        };
        tracing::debug!("Replaying {} advertisements", adverts.len());
        adverts.into_iter().for_each(sink);
        if self.realtime {
            std::thread::sleep(window);
        }
        Ok(ScanEnd::Completed)
    }
}

fn open_lines(path: &Path) -> Result<Lines<BufReader<File>>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open capture: {}", path.display()))?;
    Ok(BufReader::new(file).lines())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CAPTURE: &str = r#"[{"address": "b4:99:ba:00:00:01", "rssi": -60}, {"address": "b4:99:ba:00:00:02", "rssi": -70}]

not json
[{"address": "b4:99:ba:00:00:03", "rssi": -80, "name": "Tag"}]
"#;

    fn write_capture(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("capture.jsonl");
        std::fs::write(&path, CAPTURE).unwrap();
        path
    }

    fn collect(driver: &mut ReplayDriver) -> (ScanEnd, Vec<Advertisement>) {
        let mut seen = Vec::new();
        let end = driver
            .scan(Duration::from_millis(1), &mut |a: Advertisement| seen.push(a))
            .unwrap();
        (end, seen)
    }

    #[test]
    fn test_replays_windows_in_order() {
        let dir = TempDir::new().unwrap();
        let mut driver = ReplayDriver::open(write_capture(&dir), false, false).unwrap();

        let (end, first) = collect(&mut driver);
        assert_eq!(end, ScanEnd::Completed);
        assert_eq!(first.len(), 2);

        // blank and malformed lines are skipped
        let (_, second) = collect(&mut driver);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].name.as_deref(), Some("Tag"));

        let (end, rest) = collect(&mut driver);
        assert_eq!(end, ScanEnd::Exhausted);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_loop_capture_rewinds() {
        let dir = TempDir::new().unwrap();
        let mut driver = ReplayDriver::open(write_capture(&dir), false, true).unwrap();
        for _ in 0..5 {
            let (end, _) = collect(&mut driver);
            assert_eq!(end, ScanEnd::Completed);
        }
    }

    #[test]
    fn test_empty_capture_with_loop_is_exhausted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.jsonl");
        std::fs::write(&path, "").unwrap();
        let mut driver = ReplayDriver::open(&path, false, true).unwrap();
        assert_eq!(collect(&mut driver).0, ScanEnd::Exhausted);
    }

    #[test]
    fn test_missing_capture_fails_to_open() {
        let dir = TempDir::new().unwrap();
        assert!(ReplayDriver::open(dir.path().join("absent.jsonl"), false, false).is_err());
    }
}
