//! Input and output files of a task.
//!
//! Inputs are newline-delimited keyword phrases or classification codes.
//! They come from several hands, so the encoding is sniffed: a byte order
//! mark wins, otherwise UTF-8 is tried and Windows-1251 is the fallback.
//!
//! Outputs are appended to, then deduplicated line by line as a whole.

use anyhow::{Context, Result};
use encoding_rs::{Encoding, UTF_8, WINDOWS_1251};
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::debug;

use crate::models::CollectedRecord;

/// Decode raw input bytes.
pub fn decode_input(bytes: &[u8]) -> (String, &'static Encoding) {
    if let Some((encoding, bom_len)) = Encoding::for_bom(bytes) {
        let (text, _) = encoding.decode_without_bom_handling(&bytes[bom_len..]);
        return (text.into_owned(), encoding);
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => (text.to_string(), UTF_8),
        Err(_) => {
            let (text, _) = WINDOWS_1251.decode_without_bom_handling(bytes);
            (text.into_owned(), WINDOWS_1251)
        }
    }
}

/// Non-blank, trimmed lines of an input file.
pub fn read_inputs(path: &Path) -> Result<Vec<String>> {
    let bytes =
        fs::read(path).with_context(|| format!("Failed to read input file: {}", path.display()))?;
    let (text, encoding) = decode_input(&bytes);
    debug!(path = %path.display(), encoding = encoding.name(), "read input file");

    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Append one line per record to `path`, creating it if needed.
pub fn append_records(path: &Path, records: &[CollectedRecord]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open output file: {}", path.display()))?;
    for record in records {
        writeln!(file, "{}", record.to_line())?;
    }
    Ok(())
}

/// Rewrite `path` keeping the first occurrence of every line. Returns the
/// number of lines left.
pub fn dedup_lines(path: &Path) -> Result<usize> {
    if !path.exists() {
        return Ok(0);
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read output file: {}", path.display()))?;

    let mut seen = HashSet::new();
    let mut kept = String::with_capacity(content.len());
    let mut count = 0;
    for line in content.lines() {
        let line = line.trim_end();
        if line.is_empty() || !seen.insert(line) {
            continue;
        }
        kept.push_str(line);
        kept.push('\n');
        count += 1;
    }

    fs::write(path, kept)
        .with_context(|| format!("Failed to write output file: {}", path.display()))?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_reads_utf8_and_skips_blank_lines() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("kw.txt");
        fs::write(&path, "хлеб\n\n  молоко  \r\n\n").unwrap();
        assert_eq!(read_inputs(&path).unwrap(), vec!["хлеб", "молоко"]);
    }

    #[test]
    fn test_reads_windows_1251() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("kw.txt");
        let (bytes, _, _) = WINDOWS_1251.encode("поставка хлеба\n10.71.11\n");
        fs::write(&path, &bytes).unwrap();
        assert_eq!(
            read_inputs(&path).unwrap(),
            vec!["поставка хлеба", "10.71.11"]
        );
    }

    #[test]
    fn test_utf8_bom_is_stripped() {
        let (text, encoding) = decode_input(b"\xEF\xBB\xBF10.71\n");
        assert_eq!(encoding, UTF_8);
        assert_eq!(text, "10.71\n");
    }

    #[test]
    fn test_missing_input_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let err = read_inputs(&tmp.path().join("absent.txt")).unwrap_err();
        assert!(err.to_string().contains("absent.txt"));
    }

    #[test]
    fn test_append_then_dedup() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out").join("223.txt");
        let first = vec![CollectedRecord::Detailed {
            number: "30000000001".to_string(),
            notice_info_id: "15".to_string(),
            platform_file_id: String::new(),
        }];
        let second = vec![
            first[0].clone(),
            CollectedRecord::Detailed {
                number: "30000000002".to_string(),
                notice_info_id: "16".to_string(),
                platform_file_id: "9".to_string(),
            },
        ];

        append_records(&path, &first).unwrap();
        append_records(&path, &second).unwrap();
        assert_eq!(dedup_lines(&path).unwrap(), 2);
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "30000000001;15\n30000000002;16;9\n"
        );
    }

    #[test]
    fn test_dedup_missing_file() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(dedup_lines(&tmp.path().join("none.txt")).unwrap(), 0);
    }
}
